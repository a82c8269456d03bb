//! Docker Registry HTTP API v2 client pieces.
//!
//! Everything network-facing goes through [`Transport`], so the auth,
//! manifest and blob logic can be driven by an in-memory registry in tests.

pub mod auth;
pub mod blob;
pub mod manifest;

use std::io;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, HeaderMap};

use crate::error::{PullError, Result};

pub use auth::{AccessToken, AuthChallenge, RegistrySession};

/// A response body delivered as a stream of chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Vec<u8>>> + Send>>;

/// Status, headers and a not-yet-consumed body.
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    body: BodyStream,
}

impl HttpResponse {
    pub fn new(status: u16, headers: HeaderMap, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Declared `Content-Length`, if the server sent a usable one.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Buffer the whole body. Only used for small documents.
    pub async fn bytes(self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    pub fn into_body(self) -> BodyStream {
        self.body
    }
}

/// Minimal HTTP GET capability the registry client needs.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET. Non-2xx statuses are returned as responses, not errors.
    async fn get(&self, url: &str, headers: HeaderMap) -> Result<HttpResponse>;
}

/// [`Transport`] backed by `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PullError::Network {
                url: String::new(),
                source: Box::new(e),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str, headers: HeaderMap) -> Result<HttpResponse> {
        tracing::debug!(url, "GET");
        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| PullError::Network {
                url: url.to_string(),
                source: Box::new(e),
            })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map_ok(|chunk| chunk.to_vec())
            .map_err(io::Error::other)
            .boxed();

        Ok(HttpResponse::new(status, headers, body))
    }
}

/// `https://<registry>/v2/`
pub fn base_url(registry: &str) -> String {
    format!("https://{registry}/v2/")
}

/// `https://<registry>/v2/<name>/manifests/<reference>`
pub fn manifest_url(registry: &str, name: &str, reference: &str) -> String {
    format!("https://{registry}/v2/{name}/manifests/{reference}")
}

/// `https://<registry>/v2/<name>/blobs/<digest>`
pub fn blob_url(registry: &str, name: &str, digest: &str) -> String {
    format!("https://{registry}/v2/{name}/blobs/{digest}")
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-memory registry for driving the client without a network.

    use std::sync::Mutex;

    use reqwest::header::{HeaderName, HeaderValue};

    use super::*;

    /// A canned response.
    #[derive(Clone)]
    pub struct Canned {
        pub status: u16,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
        /// Size of the chunks the body is streamed in
        pub chunk: usize,
    }

    impl Canned {
        pub fn status(status: u16) -> Self {
            Self {
                status,
                headers: Vec::new(),
                body: Vec::new(),
                chunk: 1024,
            }
        }

        pub fn ok(body: impl Into<Vec<u8>>) -> Self {
            let body = body.into();
            Self::status(200)
                .header("content-length", &body.len().to_string())
                .body(body)
        }

        pub fn json(value: serde_json::Value) -> Self {
            Self::ok(serde_json::to_vec(&value).unwrap())
        }

        pub fn header(mut self, name: &str, value: &str) -> Self {
            self.headers.push((name.to_string(), value.to_string()));
            self
        }

        pub fn body(mut self, body: Vec<u8>) -> Self {
            self.body = body;
            self
        }

        pub fn chunked(mut self, chunk: usize) -> Self {
            self.chunk = chunk;
            self
        }
    }

    struct Route {
        url: String,
        accept: Option<String>,
        response: Canned,
    }

    /// A request the fake has seen.
    #[derive(Debug, Clone)]
    pub struct Seen {
        pub url: String,
        pub authorization: Option<String>,
        pub accept: Option<String>,
    }

    /// Routes URLs (optionally narrowed by an `Accept` substring) to canned
    /// responses. Unknown URLs get a 404.
    #[derive(Default)]
    pub struct FakeTransport {
        routes: Vec<Route>,
        seen: Mutex<Vec<Seen>>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn route(mut self, url: &str, response: Canned) -> Self {
            self.routes.push(Route {
                url: url.to_string(),
                accept: None,
                response,
            });
            self
        }

        pub fn route_accept(mut self, url: &str, accept: &str, response: Canned) -> Self {
            self.routes.push(Route {
                url: url.to_string(),
                accept: Some(accept.to_string()),
                response,
            });
            self
        }

        pub fn seen(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }

        pub fn seen_urls(&self) -> Vec<String> {
            self.seen().into_iter().map(|s| s.url).collect()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn get(&self, url: &str, headers: HeaderMap) -> Result<HttpResponse> {
            let header = |name: &str| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            let accept = header("accept");
            self.seen.lock().unwrap().push(Seen {
                url: url.to_string(),
                authorization: header("authorization"),
                accept: accept.clone(),
            });

            let canned = self
                .routes
                .iter()
                .find(|r| {
                    r.url == url
                        && match (&r.accept, &accept) {
                            (None, _) => true,
                            (Some(want), Some(got)) => got.contains(want.as_str()),
                            (Some(_), None) => false,
                        }
                })
                .map(|r| r.response.clone())
                .unwrap_or_else(|| Canned::status(404));

            let mut map = HeaderMap::new();
            for (name, value) in &canned.headers {
                map.insert(
                    HeaderName::from_bytes(name.as_bytes()).unwrap(),
                    HeaderValue::from_str(value).unwrap(),
                );
            }
            let chunks: Vec<io::Result<Vec<u8>>> = canned
                .body
                .chunks(canned.chunk.max(1))
                .map(|c| Ok(c.to_vec()))
                .collect();
            Ok(HttpResponse::new(
                canned.status,
                map,
                futures::stream::iter(chunks).boxed(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Canned, FakeTransport};
    use super::*;

    #[test]
    fn test_urls() {
        assert_eq!(base_url("quay.io"), "https://quay.io/v2/");
        assert_eq!(
            manifest_url("quay.io", "a/b", "latest"),
            "https://quay.io/v2/a/b/manifests/latest"
        );
        assert_eq!(
            blob_url("quay.io", "a/b", "sha256:00"),
            "https://quay.io/v2/a/b/blobs/sha256:00"
        );
    }

    #[tokio::test]
    async fn test_response_helpers() {
        let fake = FakeTransport::new().route("https://x/", Canned::ok(b"hello world".to_vec()).chunked(3));
        let resp = fake.get("https://x/", HeaderMap::new()).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.content_length(), Some(11));
        assert_eq!(resp.bytes().await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_missing_content_length() {
        let fake = FakeTransport::new().route("https://x/", Canned::status(200).body(b"abc".to_vec()));
        let resp = fake.get("https://x/", HeaderMap::new()).await.unwrap();
        assert_eq!(resp.content_length(), None);
    }
}
