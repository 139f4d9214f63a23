//! vreg upstream client
//!
//! Fetches package files from remote registries over HTTP, with basic
//! authentication, conditional requests and a resolver that refuses to
//! connect to non-public addresses.

pub mod address;
pub mod client;
pub mod error;

pub use address::{is_public_ip, validate_upstream_url};
pub use client::{FetchOutcome, FetchRequest, FetchedObject, UpstreamClient, UpstreamClientConfig};
pub use error::ProxyError;

/// Re-export header types carried by [`FetchedObject`]
pub use reqwest::header::{HeaderMap, HeaderValue};
