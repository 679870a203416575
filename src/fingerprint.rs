use crate::params::Params;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Canonical serialized form of a request. Field order is fixed by the
/// struct layout and zero-valued params are omitted, so two logically
/// equal requests always hash to the same key.
#[derive(Serialize)]
struct FingerprintRecord<'a> {
    source_path: &'a str,
    image_params: &'a Params,
}

/// Stable 64-char lowercase hex cache key for a (source path, params)
/// pair. This is the sole key for the result cache.
pub fn fingerprint(source_path: &str, params: &Params) -> String {
    let record = FingerprintRecord {
        source_path,
        image_params: params,
    };
    let serialized = serde_json::to_vec(&record).expect("params serialization is infallible");
    let mut hasher = Sha256::new();
    hasher.update(&serialized);
    hex::encode(hasher.finalize())
}
