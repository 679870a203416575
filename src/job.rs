use crate::config::Config;
use crate::fingerprint::fingerprint;
use crate::params::Params;
use url::Url;

/// One inbound request, frozen at construction: where the source lives,
/// what to do to it, and the cache key derived from both. Carries no
/// identity beyond the request that created it.
#[derive(Debug, Clone)]
pub struct Job {
    pub source_path: String,
    pub source_url: Url,
    pub params: Params,
    fingerprint: String,
}

impl Job {
    pub fn new(config: &Config, request_path: &str, params: Params) -> Self {
        let source_path = join_source_path(config.source_base_url.path(), request_path);
        let mut source_url = config.source_base_url.clone();
        source_url.set_path(&source_path);
        let fingerprint = fingerprint(&source_path, &params);
        Self {
            source_path,
            source_url,
            params,
            fingerprint,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Join the upstream base path and the request path into a single clean
/// absolute path (duplicate separators collapsed).
fn join_source_path(base_path: &str, request_path: &str) -> String {
    let mut joined = String::new();
    for segment in base_path
        .split('/')
        .chain(request_path.split('/'))
        .filter(|segment| !segment.is_empty())
    {
        joined.push('/');
        joined.push_str(segment);
    }
    if joined.is_empty() {
        joined.push('/');
    }
    joined
}
