use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, info};

use crate::errors::{Error, Result};
use crate::http_request::HttpRequest;

/// What came back from issuing a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body_text: String,
    pub elapsed: Duration,
}

/// Issues a built request. The library never looks past this seam.
pub trait Transport: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

impl HttpRequest {
    pub fn http_method(&self) -> Result<reqwest::Method> {
        reqwest::Method::from_bytes(self.method.to_uppercase().as_bytes())
            .map_err(|_| Error::InvalidRequest(format!("{} is an unknown http method", self.method)))
    }

    /// The url with the query parameters appended.
    pub fn uri(&self) -> Result<reqwest::Url> {
        let pairs = self.query_pairs();
        let url = if pairs.is_empty() {
            reqwest::Url::parse(&self.url)
        } else {
            reqwest::Url::parse_with_params(&self.url, pairs)
        };
        url.map_err(|e| Error::InvalidRequest(format!("{} @ '{}'", e, self.url)))
    }

    pub fn header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        for (key, value) in self.headers.iter().flatten() {
            let name = HeaderName::try_from(key.as_str())
                .map_err(|e| Error::InvalidRequest(format!("header name '{}': {}", key, e)))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| Error::InvalidRequest(format!("header '{}': {}", key, e)))?;
            map.append(name, value);
        }
        return Ok(map);
    }
}

pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<ReqwestTransport> {
        let client = reqwest::blocking::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        return Ok(ReqwestTransport { client });
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut req = self
            .client
            .request(request.http_method()?, request.uri()?)
            .headers(request.header_map()?);
        if let Some(json) = &request.json {
            req = req.json(json);
        }

        info!(method = %request.method, url = %request.url, "issuing request");
        let started = Instant::now();
        let res = req.send().map_err(|e| Error::Transport(e.to_string()))?;
        let status_code = res.status().as_u16();
        let headers = res
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body_text = res.text().map_err(|e| Error::Transport(e.to_string()))?;
        let elapsed = started.elapsed();
        debug!(status_code, elapsed_ms = elapsed.as_millis() as u64, "response received");

        Ok(HttpResponse {
            status_code,
            headers,
            body_text,
            elapsed,
        })
    }
}
