//! Content fingerprints and name-based ids

use md5::{Digest, Md5};

/// Lowercase hex MD5 of `content`.
pub fn md5_hex(content: &str) -> String {
    let digest = Md5::digest(content.as_bytes());
    const_hex::encode(digest)
}

/// Stable version-3 UUID derived from `name`; the same name always yields the same id.
pub fn name_based_uuid(name: &str) -> String {
    let digest = Md5::digest(name.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest);
    uuid::Builder::from_md5_bytes(bytes).into_uuid().to_string()
}
