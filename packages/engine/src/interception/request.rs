// packages/engine/src/interception/request.rs
//! Request wrapper carried through the interception layer
//!
//! An `InterceptedRequest` is an owned HTTP request plus a `handled` marker.
//! The marker is part of the value, so every clone (including redirect
//! targets built from it) keeps it, and a re-issued request is recognised
//! by the registry as one that must not be intercepted again.

use crate::utils::errors::{EngineError, Result, TransportError};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Uri};
use http_body_util::Full;

/// Client-side cache policy requested for a load
///
/// Discriminants follow the host transport's raw values, which is what
/// the storage policy mapping is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CachePolicy {
    #[default]
    UseProtocolCachePolicy = 0,
    ReloadIgnoringLocalCacheData = 1,
    ReturnCacheDataElseLoad = 2,
    ReturnCacheDataDontLoad = 3,
    ReloadIgnoringLocalAndRemoteCacheData = 4,
    ReloadRevalidatingCacheData = 5,
}

impl CachePolicy {
    pub fn raw(self) -> u8 {
        self as u8
    }
}

/// Whether a response may be stored by the downstream cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheStoragePolicy {
    Allowed = 0,
    AllowedInMemoryOnly = 1,
    NotAllowed = 2,
}

impl CacheStoragePolicy {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(CacheStoragePolicy::Allowed),
            1 => Some(CacheStoragePolicy::AllowedInMemoryOnly),
            2 => Some(CacheStoragePolicy::NotAllowed),
            _ => None,
        }
    }

    /// Map the request's cache policy value 1:1, `NotAllowed` when unmapped
    pub fn for_request(policy: CachePolicy) -> Self {
        Self::from_raw(policy.raw()).unwrap_or(CacheStoragePolicy::NotAllowed)
    }
}

/// An outgoing request as seen by protocols and transports
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    cache_policy: CachePolicy,
    handled: bool,
}

impl InterceptedRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            cache_policy: CachePolicy::default(),
            handled: false,
        }
    }

    /// Build a GET request from a URL string
    pub fn get(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| EngineError::InvalidRequest(format!("Invalid URL '{}': {}", url, e)))?;
        Ok(Self::new(Method::GET, uri))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    /// Host component of the URL, if it has one
    pub fn host(&self) -> Option<&str> {
        self.uri.host().filter(|host| !host.is_empty())
    }

    pub fn is_handled(&self) -> bool {
        self.handled
    }

    /// Clone this request with the `handled` marker set
    pub fn stamped(&self) -> Self {
        let mut clone = self.clone();
        clone.handled = true;
        clone
    }

    /// Replace any existing value of `name`
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    /// Same request aimed at another URL, as produced by a redirect
    pub fn redirected(&self, uri: Uri, method: Method, keep_body: bool) -> Self {
        let mut next = self.clone();
        next.uri = uri;
        next.method = method;
        if !keep_body {
            next.body = Bytes::new();
            next.headers.remove(http::header::CONTENT_LENGTH);
            next.headers.remove(http::header::CONTENT_TYPE);
        }
        next
    }

    /// Convert into a hyper request
    pub fn to_http(&self) -> std::result::Result<Request<Full<Bytes>>, TransportError> {
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(self.headers.clone());
        }
        builder
            .body(Full::new(self.body.clone()))
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamped_clone_keeps_request() {
        let request = InterceptedRequest::get("https://demo-server.approovr.io/shapes")
            .unwrap()
            .with_cache_policy(CachePolicy::ReloadIgnoringLocalCacheData);
        let stamped = request.stamped();

        assert!(!request.is_handled());
        assert!(stamped.is_handled());
        assert_eq!(stamped.uri(), request.uri());
        assert_eq!(stamped.cache_policy(), CachePolicy::ReloadIgnoringLocalCacheData);
        assert!(stamped.clone().is_handled());
    }

    #[test]
    fn test_host() {
        let request = InterceptedRequest::get("https://demo-server.approovr.io/hello").unwrap();
        assert_eq!(request.host(), Some("demo-server.approovr.io"));

        let relative = InterceptedRequest::get("/hello").unwrap();
        assert_eq!(relative.host(), None);
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            InterceptedRequest::get("http://bad host/"),
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_storage_policy_mapping() {
        use CacheStoragePolicy::*;
        assert_eq!(CacheStoragePolicy::for_request(CachePolicy::UseProtocolCachePolicy), Allowed);
        assert_eq!(
            CacheStoragePolicy::for_request(CachePolicy::ReloadIgnoringLocalCacheData),
            AllowedInMemoryOnly
        );
        assert_eq!(CacheStoragePolicy::for_request(CachePolicy::ReturnCacheDataElseLoad), NotAllowed);
        assert_eq!(CacheStoragePolicy::for_request(CachePolicy::ReturnCacheDataDontLoad), NotAllowed);
        assert_eq!(
            CacheStoragePolicy::for_request(CachePolicy::ReloadRevalidatingCacheData),
            NotAllowed
        );
    }

    #[test]
    fn test_set_header_replaces() {
        let name = HeaderName::from_static("approov-token");
        let mut request = InterceptedRequest::get("https://example.com/")
            .unwrap()
            .with_header(name.clone(), HeaderValue::from_static("old"));
        request.set_header(name.clone(), HeaderValue::from_static("new"));

        let values: Vec<_> = request.headers().get_all(&name).iter().collect();
        assert_eq!(values, vec![&HeaderValue::from_static("new")]);
    }

    #[test]
    fn test_redirect_drops_body_and_keeps_marker() {
        let request = InterceptedRequest::new(Method::POST, "https://a.test/form".parse().unwrap())
            .with_body("payload")
            .stamped();
        let next = request.redirected("https://b.test/done".parse().unwrap(), Method::GET, false);

        assert_eq!(next.method(), Method::GET);
        assert!(next.body().is_empty());
        assert!(next.is_handled());
        assert_eq!(next.host(), Some("b.test"));
    }

    #[test]
    fn test_to_http() {
        let request = InterceptedRequest::get("http://127.0.0.1:8080/shapes")
            .unwrap()
            .with_header(HeaderName::from_static("approov-token"), HeaderValue::from_static("abc"));
        let http = request.to_http().unwrap();
        assert_eq!(http.method(), Method::GET);
        assert_eq!(http.uri().path(), "/shapes");
        assert_eq!(http.headers()["approov-token"], "abc");
    }
}
