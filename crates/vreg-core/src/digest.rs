//! Checksums and storage keys

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use vreg_db::PackageFormat;
use vreg_proxy::FetchedObject;

use crate::validation::is_lower_hex;

/// Response headers upstreams use to advertise a SHA-1
pub const SHA1_HEADERS: &[&str] = &[
    "x-checksum-sha1",
    "x-goog-meta-checksum-sha1",
    "x-amz-meta-sha1",
    "checksum-sha1",
];

/// Response headers upstreams use to advertise an MD5
pub const MD5_HEADERS: &[&str] = &[
    "x-checksum-md5",
    "x-goog-meta-checksum-md5",
    "x-amz-meta-md5",
];

pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Checksums of a downloaded object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksums {
    pub sha1: String,
    pub md5: Option<String>,
}

fn advertised(object: &FetchedObject, headers: &[&str], len: usize) -> Option<String> {
    headers
        .iter()
        .filter_map(|name| object.header(name))
        .map(str::to_ascii_lowercase)
        .find(|value| is_lower_hex(value, len))
}

/// Checksums for a fetched object.
///
/// A well-formed checksum advertised by the upstream is used as is;
/// otherwise the digest is computed over the body. MD5 is never produced
/// in restricted mode.
pub fn checksums_for(object: &FetchedObject, restricted_cryptography: bool) -> Checksums {
    let sha1 = advertised(object, SHA1_HEADERS, 40).unwrap_or_else(|| sha1_hex(&object.body));
    let md5 = if restricted_cryptography {
        None
    } else {
        Some(advertised(object, MD5_HEADERS, 32).unwrap_or_else(|| md5_hex(&object.body)))
    };
    Checksums { sha1, md5 }
}

/// A fresh, fanned-out object storage key for a new cache entry
pub fn generate_object_storage_key(
    format: PackageFormat,
    group_id: i64,
    upstream_id: i64,
) -> String {
    let hash = sha256_hex(Uuid::new_v4().as_bytes());
    format!(
        "{}/{}/{}/{}/{}/{}",
        format.as_str(),
        group_id,
        upstream_id,
        &hash[0..2],
        &hash[2..4],
        hash
    )
}
