use crate::cache::{CacheStore, Singleflight};
use crate::config::Config;
use crate::downloader::Downloader;
use crate::transform::Transformer;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: CacheStore,
    pub downloader: Downloader,
    pub transformer: Arc<dyn Transformer>,
    pub singleflight: Singleflight,
}

impl AppState {
    pub fn new(
        config: Config,
        cache: CacheStore,
        downloader: Downloader,
        transformer: Arc<dyn Transformer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            cache,
            downloader,
            transformer,
            singleflight: Singleflight::new(),
        }
    }
}
