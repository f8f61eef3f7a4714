//! HTTP seam between the pipeline and the network.
//!
//! Interpreters only ever talk to `dyn HttpClient`, so the whole fetch path
//! can be driven by an in-memory client in tests.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::FetchError;

/// Status line and body of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// GET `url`, returning whatever status the server answered with.
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, FetchError>;

    /// Lightweight reachability request. Returns the status code only.
    async fn head(&self, url: &str, timeout: Duration) -> Result<u16, FetchError>;
}

pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("statuswatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client }
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, FetchError> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .header(reqwest::header::ACCEPT, "application/json, text/html;q=0.9, */*;q=0.8")
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(e, timeout))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(e, timeout))?;
        Ok(HttpResponse { status, body })
    }

    async fn head(&self, url: &str, timeout: Duration) -> Result<u16, FetchError> {
        let resp = self
            .client
            .head(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(e, timeout))?;
        Ok(resp.status().as_u16())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted client used across the crate's tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    pub enum Scripted {
        Respond(u16, String),
        Fail(FetchError),
        Hang,
    }

    /// Per-URL queue of replies; the last reply repeats once the queue
    /// drains. Unknown URLs fail with a network error.
    #[derive(Default)]
    pub struct MockHttp {
        scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
        calls: AtomicUsize,
    }

    impl MockHttp {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(&self, url: &str, replies: Vec<Scripted>) {
            self.scripts.lock().insert(url.to_string(), replies.into());
        }

        pub fn respond(&self, url: &str, status: u16, body: &str) {
            self.script(url, vec![Scripted::Respond(status, body.to_string())]);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next(&self, url: &str) -> Scripted {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut scripts = self.scripts.lock();
            match scripts.get_mut(url) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
                Some(queue) => queue.front().cloned().unwrap(),
                None => Scripted::Fail(FetchError::Network(format!("no route to {}", url))),
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttp {
        async fn get(&self, url: &str, _timeout: Duration) -> Result<HttpResponse, FetchError> {
            match self.next(url) {
                Scripted::Respond(status, body) => Ok(HttpResponse { status, body }),
                Scripted::Fail(e) => Err(e),
                Scripted::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn head(&self, url: &str, timeout: Duration) -> Result<u16, FetchError> {
            self.get(url, timeout).await.map(|r| r.status)
        }
    }
}
