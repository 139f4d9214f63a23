//! Upstream registry client

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, ETAG, HeaderMap, IF_NONE_MATCH};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use tracing::{debug, info};
use url::Url;

use crate::address::{PublicOnlyResolver, check_url};
use crate::error::ProxyError;

const MAX_REDIRECTS: usize = 5;
const MAX_ERROR_BODY: usize = 512;

/// Upstream client configuration
#[derive(Clone, Debug)]
pub struct UpstreamClientConfig {
    /// Permit loopback, private and link-local upstream addresses
    pub allow_local_requests: bool,
    /// Whole-request timeout
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            allow_local_requests: false,
            request_timeout: Duration::from_secs(60),
            user_agent: concat!("vreg/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// One object request against an upstream
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    /// Upstream base URL
    pub base_url: &'a str,
    /// Path of the object below the base URL
    pub relative_path: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    /// ETag of the copy we already hold, sent as `If-None-Match`
    pub etag: Option<&'a str>,
}

/// A successfully downloaded object
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub body: Bytes,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub headers: HeaderMap,
}

impl FetchedObject {
    /// Look up a response header as a trimmed string
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// Result of a fetch
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(FetchedObject),
    /// The upstream confirmed our copy is current
    NotModified,
}

/// HTTP client for upstream registries
pub struct UpstreamClient {
    config: UpstreamClientConfig,
    client: Client,
}

impl UpstreamClient {
    /// Create a new upstream client
    pub fn new(config: UpstreamClientConfig) -> Result<Self, ProxyError> {
        let allow_local = config.allow_local_requests;

        // Redirect targets get the same checks as the original URL
        let redirect_policy = Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if check_url(attempt.url(), allow_local).is_err() {
                attempt.stop()
            } else {
                attempt.follow()
            }
        });

        let client = Client::builder()
            .dns_resolver(Arc::new(PublicOnlyResolver::new(allow_local)))
            .redirect(redirect_policy)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        info!(
            allow_local_requests = allow_local,
            "Created upstream client"
        );

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &UpstreamClientConfig {
        &self.config
    }

    /// Build the absolute URL of an object below an upstream base URL
    pub fn object_url(base_url: &str, relative_path: &str) -> Result<Url, ProxyError> {
        let joined = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            relative_path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| ProxyError::InvalidUrl(format!("{}: {}", joined, e)))
    }

    /// GET an object from an upstream
    pub async fn fetch(&self, request: FetchRequest<'_>) -> Result<FetchOutcome, ProxyError> {
        let url = Self::object_url(request.base_url, request.relative_path)?;
        check_url(&url, self.config.allow_local_requests)?;

        debug!("Fetching object: {}", url);

        let mut builder = self.client.get(url);
        if let (Some(username), Some(password)) = (request.username, request.password) {
            builder = builder.basic_auth(username, Some(password));
        }
        if let Some(etag) = request.etag {
            builder = builder.header(IF_NONE_MATCH, etag);
        }

        let response = builder.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }

        if status == StatusCode::NOT_FOUND {
            return Err(ProxyError::NotFound(request.relative_path.to_string()));
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProxyError::Unauthorized);
        }

        if !status.is_success() {
            let mut message = response.text().await.unwrap_or_default();
            if message.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| message.is_char_boundary(*i))
                    .unwrap_or(0);
                message.truncate(cut);
            }
            return Err(ProxyError::UpstreamError {
                status: status.as_u16(),
                message,
            });
        }

        let headers = response.headers().clone();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());
        let etag = headers
            .get(ETAG)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());

        let body = response.bytes().await?;

        Ok(FetchOutcome::Fetched(FetchedObject {
            body,
            content_type,
            etag,
            headers,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{basic_auth, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn local_client() -> UpstreamClient {
        UpstreamClient::new(UpstreamClientConfig {
            allow_local_requests: true,
            ..Default::default()
        })
        .unwrap()
    }

    fn request<'a>(base_url: &'a str, relative_path: &'a str) -> FetchRequest<'a> {
        FetchRequest {
            base_url,
            relative_path,
            username: None,
            password: None,
            etag: None,
        }
    }

    #[test]
    fn test_object_url_joins_slashes() {
        let url = UpstreamClient::object_url("https://93.184.216.34/maven2/", "/com/acme/a.pom").unwrap();
        assert_eq!(url.as_str(), "https://93.184.216.34/maven2/com/acme/a.pom");

        let url = UpstreamClient::object_url("https://93.184.216.34", "a.pom").unwrap();
        assert_eq!(url.as_str(), "https://93.184.216.34/a.pom");
    }

    #[tokio::test]
    async fn test_fetch_returns_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/maven2/com/acme/lib-1.0.pom"))
            .and(basic_auth("reader", "secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"<project/>".to_vec())
                    .insert_header("content-type", "text/xml")
                    .insert_header("etag", "\"v1\"")
                    .insert_header("x-checksum-sha1", "0123456789abcdef0123456789abcdef01234567"),
            )
            .mount(&server)
            .await;

        let base = format!("{}/maven2", server.uri());
        let outcome = local_client()
            .fetch(FetchRequest {
                username: Some("reader"),
                password: Some("secret"),
                ..request(&base, "com/acme/lib-1.0.pom")
            })
            .await
            .unwrap();

        let FetchOutcome::Fetched(object) = outcome else {
            panic!("expected a body");
        };
        assert_eq!(object.body, Bytes::from_static(b"<project/>"));
        assert_eq!(object.content_type.as_deref(), Some("text/xml"));
        assert_eq!(object.etag.as_deref(), Some("\"v1\""));
        assert_eq!(
            object.header("x-checksum-sha1"),
            Some("0123456789abcdef0123456789abcdef01234567")
        );
    }

    #[tokio::test]
    async fn test_fetch_not_modified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.tgz"))
            .and(header("if-none-match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let base = server.uri();
        let outcome = local_client()
            .fetch(FetchRequest {
                etag: Some("\"v1\""),
                ..request(&base, "a.tgz")
            })
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::NotModified));
    }

    #[tokio::test]
    async fn test_fetch_maps_error_statuses() {
        let server = MockServer::start().await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/private"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(path("/broken"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let base = server.uri();
        let client = local_client();

        assert!(matches!(
            client.fetch(request(&base, "missing")).await,
            Err(ProxyError::NotFound(_))
        ));
        assert!(matches!(
            client.fetch(request(&base, "private")).await,
            Err(ProxyError::Unauthorized)
        ));
        match client.fetch(request(&base, "broken")).await {
            Err(ProxyError::UpstreamError { status, message }) => {
                assert_eq!(status, 502);
                assert_eq!(message, "bad gateway");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_refuses_local_upstream_by_default() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = UpstreamClient::new(UpstreamClientConfig::default()).unwrap();
        let base = server.uri();
        let result = client.fetch(request(&base, "a.pom")).await;
        assert!(matches!(result, Err(ProxyError::BlockedAddress(_))));
    }
}
