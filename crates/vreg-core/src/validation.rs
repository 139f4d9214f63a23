//! Field validation for writes
//!
//! Every check collects into a [`ValidationErrors`] so callers see all
//! failing fields at once. Nothing here touches the database.

use vreg_db::{CacheEntryFields, UpdateCleanupPolicy};

use crate::error::ValidationErrors;
use crate::settings::{ALLOWED_CLEANUP_CADENCES, KEEP_DAYS_RANGE};

pub const NAME_MAX_LENGTH: usize = 255;
pub const DESCRIPTION_MAX_LENGTH: usize = 1024;
pub const URL_MAX_LENGTH: usize = 255;
pub const CREDENTIAL_MAX_LENGTH: usize = 510;
pub const HEADER_VALUE_MAX_LENGTH: usize = 255;
pub const PATH_MAX_LENGTH: usize = 1024;

fn too_long(max: usize) -> String {
    format!("is too long (maximum is {} characters)", max)
}

fn check_length(errors: &mut ValidationErrors, field: &str, value: &str, max: usize) {
    if value.chars().count() > max {
        errors.add(field, too_long(max));
    }
}

fn check_name(errors: &mut ValidationErrors, name: &str) {
    if name.trim().is_empty() {
        errors.add("name", "can't be blank");
    }
    check_length(errors, "name", name, NAME_MAX_LENGTH);
}

fn check_description(errors: &mut ValidationErrors, description: Option<&str>) {
    if let Some(description) = description {
        check_length(errors, "description", description, DESCRIPTION_MAX_LENGTH);
    }
}

/// Whether `value` is exactly `len` lowercase hex characters
pub fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Hex digits of either case
pub fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// The effective attributes of an upstream about to be written
#[derive(Debug, Clone, Copy)]
pub struct UpstreamAttributes<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub url: &'a str,
    pub cache_validity_hours: i64,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
}

/// Validate upstream attributes, except for address reachability
pub fn validate_upstream(attrs: &UpstreamAttributes<'_>) -> ValidationErrors {
    let mut errors = ValidationErrors::new();

    check_name(&mut errors, attrs.name);
    check_description(&mut errors, attrs.description);

    if attrs.url.trim().is_empty() {
        errors.add("url", "can't be blank");
    }
    check_length(&mut errors, "url", attrs.url, URL_MAX_LENGTH);

    if attrs.cache_validity_hours < 0 {
        errors.add("cache_validity_hours", "must be greater than or equal to 0");
    }

    if let Some(username) = attrs.username {
        check_length(&mut errors, "username", username, CREDENTIAL_MAX_LENGTH);
    }
    if let Some(password) = attrs.password {
        check_length(&mut errors, "password", password, CREDENTIAL_MAX_LENGTH);
    }
    match (attrs.username, attrs.password) {
        (Some(_), None) => errors.add("password", "can't be blank when username is set"),
        (None, Some(_)) => errors.add("username", "can't be blank when password is set"),
        _ => {}
    }

    errors
}

/// Validate registry attributes
pub fn validate_registry(name: &str, description: Option<&str>) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    check_name(&mut errors, name);
    check_description(&mut errors, description);
    errors
}

/// Validate a cache entry payload before insert or update
pub fn validate_cache_entry(
    relative_path: &str,
    object_storage_key: &str,
    fields: &CacheEntryFields,
) -> ValidationErrors {
    let mut errors = ValidationErrors::new();

    if relative_path.is_empty() {
        errors.add("relative_path", "can't be blank");
    }
    check_length(&mut errors, "relative_path", relative_path, PATH_MAX_LENGTH);
    check_length(
        &mut errors,
        "object_storage_key",
        object_storage_key,
        PATH_MAX_LENGTH,
    );

    if fields.file_name.is_empty() {
        errors.add("file", "can't be blank");
    }
    if fields.size < 0 {
        errors.add("size", "must be greater than or equal to 0");
    }

    if fields.file_sha1.is_empty() {
        errors.add("file_sha1", "can't be blank");
    } else if !is_lower_hex(&fields.file_sha1, 40) {
        errors.add("file_sha1", "must be 40 lowercase hex characters");
    }
    if let Some(md5) = &fields.file_md5 {
        if !is_hex(md5, 32) {
            errors.add("file_md5", "must be 32 hex characters");
        }
    }

    if let Some(etag) = &fields.upstream_etag {
        check_length(&mut errors, "upstream_etag", etag, HEADER_VALUE_MAX_LENGTH);
    }
    check_length(
        &mut errors,
        "content_type",
        &fields.content_type,
        HEADER_VALUE_MAX_LENGTH,
    );

    errors
}

/// Validate a cleanup policy settings change
pub fn validate_cleanup_policy(update: &UpdateCleanupPolicy) -> ValidationErrors {
    let mut errors = ValidationErrors::new();

    if let Some(cadence) = update.cadence {
        if !ALLOWED_CLEANUP_CADENCES.contains(&cadence) {
            errors.add("cadence", "is not included in the list");
        }
    }
    if let Some(keep) = update.keep_n_days_after_download {
        let (min, max) = KEEP_DAYS_RANGE;
        if keep < min || keep > max {
            errors.add(
                "keep_n_days_after_download",
                format!("must be between {} and {}", min, max),
            );
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream_attrs() -> UpstreamAttributes<'static> {
        UpstreamAttributes {
            name: "central",
            description: None,
            url: "https://repo.maven.apache.org/maven2",
            cache_validity_hours: 24,
            username: None,
            password: None,
        }
    }

    fn fields() -> CacheEntryFields {
        CacheEntryFields {
            file_name: "lib-1.0.pom".to_string(),
            file_sha1: "a".repeat(40),
            file_md5: Some("b".repeat(32)),
            size: 10,
            upstream_etag: None,
            content_type: "application/xml".to_string(),
        }
    }

    #[test]
    fn test_upstream_valid() {
        assert!(validate_upstream(&upstream_attrs()).is_empty());
    }

    #[test]
    fn test_upstream_limits() {
        let long_name = "n".repeat(256);
        let long_description = "d".repeat(1025);
        let attrs = UpstreamAttributes {
            name: &long_name,
            description: Some(&long_description),
            cache_validity_hours: -1,
            ..upstream_attrs()
        };
        let errors = validate_upstream(&attrs);
        assert!(errors.has("name"));
        assert!(errors.has("description"));
        assert!(errors.has("cache_validity_hours"));
        assert!(!errors.has("url"));
    }

    #[test]
    fn test_upstream_credentials_come_in_pairs() {
        let attrs = UpstreamAttributes {
            username: Some("reader"),
            ..upstream_attrs()
        };
        assert!(validate_upstream(&attrs).has("password"));

        let attrs = UpstreamAttributes {
            password: Some("secret"),
            ..upstream_attrs()
        };
        assert!(validate_upstream(&attrs).has("username"));

        let attrs = UpstreamAttributes {
            username: Some("reader"),
            password: Some("secret"),
            ..upstream_attrs()
        };
        assert!(validate_upstream(&attrs).is_empty());
    }

    #[test]
    fn test_cache_entry_checksums() {
        assert!(validate_cache_entry("a/b.pom", "key", &fields()).is_empty());

        let mut upper = fields();
        upper.file_sha1 = "A".repeat(40);
        assert!(validate_cache_entry("a/b.pom", "key", &upper).has("file_sha1"));

        let mut short = fields();
        short.file_sha1 = "a".repeat(39);
        assert!(validate_cache_entry("a/b.pom", "key", &short).has("file_sha1"));

        let mut upper_md5 = fields();
        upper_md5.file_md5 = Some("B".repeat(32));
        assert!(validate_cache_entry("a/b.pom", "key", &upper_md5).is_empty());

        let mut bad_md5 = fields();
        bad_md5.file_md5 = Some("z".repeat(32));
        assert!(validate_cache_entry("a/b.pom", "key", &bad_md5).has("file_md5"));

        let mut no_md5 = fields();
        no_md5.file_md5 = None;
        assert!(validate_cache_entry("a/b.pom", "key", &no_md5).is_empty());
    }

    #[test]
    fn test_cache_entry_lengths() {
        let long_path = "p".repeat(1025);
        let mut long_etag = fields();
        long_etag.upstream_etag = Some("e".repeat(256));

        let errors = validate_cache_entry(&long_path, "key", &long_etag);
        assert!(errors.has("relative_path"));
        assert!(errors.has("upstream_etag"));
        assert!(validate_cache_entry("", "key", &fields()).has("relative_path"));
    }

    #[test]
    fn test_cleanup_policy_bounds() {
        let ok = UpdateCleanupPolicy {
            enabled: Some(true),
            keep_n_days_after_download: Some(30),
            cadence: Some(14),
        };
        assert!(validate_cleanup_policy(&ok).is_empty());

        let bad = UpdateCleanupPolicy {
            enabled: None,
            keep_n_days_after_download: Some(0),
            cadence: Some(3),
        };
        let errors = validate_cleanup_policy(&bad);
        assert!(errors.has("cadence"));
        assert!(errors.has("keep_n_days_after_download"));
    }
}
