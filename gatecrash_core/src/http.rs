use crate::config::HttpSettings;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => f.write_str("GET"),
            HttpMethod::Post => f.write_str("POST"),
        }
    }
}

/// A fully resolved request, ready to be handed to an [`HttpClient`].
///
/// `body` is sent as query parameters for GET and as a form body for POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub body: BTreeMap<String, String>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            body: BTreeMap::new(),
        }
    }

    /// Renders the cookie map as a single `Cookie` header value.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let rendered: Vec<String> = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        Some(rendered.join("; "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid proxy '{proxy}': {reason}")]
    InvalidProxy { proxy: String, reason: String },
    #[error("{method} {url} failed: {reason}")]
    Request {
        method: HttpMethod,
        url: String,
        reason: String,
    },
    #[error("Failed to read response body from {url}: {reason}")]
    Body { url: String, reason: String },
}

/// Sends resolved requests. The core never talks to the network directly;
/// everything goes through an implementation of this trait.
pub trait HttpClient: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Blocking client backed by `ureq`. Redirects are never followed and
/// non-2xx statuses are returned as ordinary responses.
pub struct UreqClient {
    agent: ureq::Agent,
}

impl UreqClient {
    pub fn new(settings: &HttpSettings) -> Result<Self, TransportError> {
        let tls = ureq::tls::TlsConfig::builder()
            .disable_verification(!settings.verify)
            .build();

        let mut builder = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .max_redirects(0)
            .max_redirects_will_error(false)
            .tls_config(tls);

        if let Some(timeout_ms) = settings.timeout_ms {
            builder = builder.timeout_global(Some(Duration::from_millis(timeout_ms)));
        }
        if let Some(proxy) = &settings.proxy {
            let parsed = ureq::Proxy::new(proxy).map_err(|e| TransportError::InvalidProxy {
                proxy: proxy.clone(),
                reason: e.to_string(),
            })?;
            builder = builder.proxy(Some(parsed));
        }

        let agent: ureq::Agent = builder.build().into();
        Ok(Self { agent })
    }
}

impl HttpClient for UreqClient {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        debug!("Sending HTTP request: {} {}", request.method, request.url);
        debug!("Cookies: {:?}", request.cookies);
        debug!("Headers: {:?}", request.headers);
        debug!("Data: {:?}", request.body);

        let cookie_header = request.cookie_header();
        let pairs = request
            .body
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()));

        let result = match request.method {
            HttpMethod::Get => {
                let mut builder = self.agent.get(&request.url);
                for (name, value) in &request.headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                if let Some(cookies) = &cookie_header {
                    builder = builder.header("Cookie", cookies.as_str());
                }
                builder.query_pairs(pairs).call()
            }
            HttpMethod::Post => {
                let mut builder = self.agent.post(&request.url);
                for (name, value) in &request.headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                if let Some(cookies) = &cookie_header {
                    builder = builder.header("Cookie", cookies.as_str());
                }
                builder.send_form(pairs)
            }
        };

        let mut response = result.map_err(|e| TransportError::Request {
            method: request.method,
            url: request.url.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        let mut cookies = BTreeMap::new();
        for (name, value) in response.headers() {
            let Ok(value) = value.to_str() else {
                continue;
            };
            if name.as_str().eq_ignore_ascii_case("set-cookie") {
                if let Some((cookie, cookie_value)) = parse_set_cookie(value) {
                    cookies.insert(cookie, cookie_value);
                }
            }
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| TransportError::Body {
                url: request.url.clone(),
                reason: e.to_string(),
            })?;

        debug!("Received HTTP {} from {}", status, request.url);
        Ok(HttpResponse {
            status,
            headers,
            cookies,
            body,
        })
    }
}

/// Extracts the `name=value` pair from a `Set-Cookie` header value.
fn parse_set_cookie(raw: &str) -> Option<(String, String)> {
    let pair = raw.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_cookie_parsing_keeps_only_the_pair() {
        assert_eq!(
            parse_set_cookie("session=abc123; Path=/; HttpOnly"),
            Some(("session".to_string(), "abc123".to_string()))
        );
        assert_eq!(
            parse_set_cookie("token=a=b; Secure"),
            Some(("token".to_string(), "a=b".to_string()))
        );
        assert_eq!(parse_set_cookie("=orphan"), None);
        assert_eq!(parse_set_cookie("garbage"), None);
    }

    #[test]
    fn cookie_header_is_joined_in_key_order() {
        let mut request = HttpRequest::new(HttpMethod::Get, "http://localhost/");
        assert_eq!(request.cookie_header(), None);
        request.cookies.insert("b".into(), "2".into());
        request.cookies.insert("a".into(), "1".into());
        assert_eq!(request.cookie_header().as_deref(), Some("a=1; b=2"));
    }

    #[test]
    fn response_header_lookup_ignores_case() {
        let response = HttpResponse::new(200, "").with_header("Content-Type", "text/html");
        assert_eq!(response.header("content-type"), Some("text/html"));
        assert_eq!(response.header("x-missing"), None);
    }

    #[test]
    fn ureq_client_rejects_malformed_proxy() {
        let settings = HttpSettings {
            proxy: Some("::not a proxy::".to_string()),
            ..Default::default()
        };
        match UreqClient::new(&settings) {
            Err(TransportError::InvalidProxy { proxy, .. }) => assert_eq!(proxy, "::not a proxy::"),
            Err(e) => panic!("Expected InvalidProxy, got {e:?}"),
            Ok(_) => panic!("Expected InvalidProxy, got a client"),
        }
    }
}
