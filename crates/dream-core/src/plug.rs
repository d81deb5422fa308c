//! Fluent request builder
//!
//! A [`Plug`] is an immutable value bound to a URI: every mutator hands
//! back a new instance, so a base plug can be shared and refined freely.
//! Invocation goes through an [`EndpointRegistry`] (the process-wide one by
//! default), memoizing the request body first so that interceptors can read
//! it more than once.

use crate::cookie::SharedCookieJar;
use crate::endpoint::{global_registry, EndpointRegistry};
use crate::message::Message;
use crate::uri::Uri;
use crate::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::header::{AUTHORIZATION, COOKIE, LOCATION};
use http::{HeaderName, HeaderValue, Method};
use std::sync::Arc;
use std::time::Duration;

/// Default request deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum redirects followed when redirect following is enabled
const MAX_REDIRECTS: usize = 10;

/// Immutable fluent builder over a URI
#[derive(Clone)]
pub struct Plug {
    uri: Uri,
    headers: Vec<(HeaderName, HeaderValue)>,
    cookie_jar: Option<SharedCookieJar>,
    timeout: Duration,
    credentials: Option<(String, String)>,
    follow_redirects: bool,
    registry: Option<Arc<EndpointRegistry>>,
}

impl Plug {
    /// Create a plug bound to a URI, using the process-wide registry
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            headers: Vec::new(),
            cookie_jar: None,
            timeout: DEFAULT_TIMEOUT,
            credentials: None,
            follow_redirects: false,
            registry: None,
        }
    }

    /// Parse an absolute URI string into a plug
    pub fn parse(uri: &str) -> Result<Self> {
        Ok(Self::new(Uri::parse(uri)?))
    }

    /// Bound URI
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Append path segments
    pub fn at(&self, segments: &[&str]) -> Self {
        let mut plug = self.clone();
        plug.uri = plug.uri.at(segments);
        plug
    }

    /// Append a query parameter
    pub fn with(&self, key: &str, value: &str) -> Self {
        let mut plug = self.clone();
        plug.uri = plug.uri.with(key, value);
        plug
    }

    /// Append a request header; invalid names or values are ignored
    pub fn with_header(&self, name: &str, value: &str) -> Self {
        let mut plug = self.clone();
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::from_str(value)) {
            plug.headers.push((name, value));
        }
        plug
    }

    /// Append several request headers at once
    pub fn with_headers(&self, headers: &[(&str, &str)]) -> Self {
        let mut plug = self.clone();
        for (name, value) in headers {
            if let (Ok(name), Ok(value)) =
                (HeaderName::try_from(*name), HeaderValue::from_str(value))
            {
                plug.headers.push((name, value));
            }
        }
        plug
    }

    /// Attach a cookie jar; response cookies fold back into it
    pub fn with_cookie_jar(&self, jar: SharedCookieJar) -> Self {
        let mut plug = self.clone();
        plug.cookie_jar = Some(jar);
        plug
    }

    /// Attach basic credentials
    pub fn with_credentials(&self, user: &str, password: &str) -> Self {
        let mut plug = self.clone();
        plug.credentials = Some((user.to_string(), password.to_string()));
        plug
    }

    /// Override the request deadline
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut plug = self.clone();
        plug.timeout = timeout;
        plug
    }

    /// Follow 3xx redirects, up to a bound of 10
    pub fn with_redirects(&self) -> Self {
        let mut plug = self.clone();
        plug.follow_redirects = true;
        plug
    }

    /// Bind to an explicit registry instead of the process-wide default
    pub fn with_registry(&self, registry: Arc<EndpointRegistry>) -> Self {
        let mut plug = self.clone();
        plug.registry = Some(registry);
        plug
    }

    /// GET the bound URI
    pub async fn get(&self) -> Result<Message> {
        self.invoke(Method::GET, Message::ok()).await
    }

    /// HEAD the bound URI
    pub async fn head(&self) -> Result<Message> {
        self.invoke(Method::HEAD, Message::ok()).await
    }

    /// POST a request message
    pub async fn post(&self, body: Message) -> Result<Message> {
        self.invoke(Method::POST, body).await
    }

    /// POST a JSON document
    pub async fn post_document(&self, document: serde_json::Value) -> Result<Message> {
        self.invoke(Method::POST, Message::from_document(document)).await
    }

    /// PUT a request message
    pub async fn put(&self, body: Message) -> Result<Message> {
        self.invoke(Method::PUT, body).await
    }

    /// DELETE the bound URI
    pub async fn delete(&self) -> Result<Message> {
        self.invoke(Method::DELETE, Message::ok()).await
    }

    /// OPTIONS on the bound URI
    pub async fn options(&self) -> Result<Message> {
        self.invoke(Method::OPTIONS, Message::ok()).await
    }

    /// Invoke with an explicit verb. The body is memoized before dispatch
    /// so multiple interceptors may safely read it.
    pub async fn invoke(&self, method: Method, mut request: Message) -> Result<Message> {
        request.memoize().await?;
        let registry = self.registry.clone().unwrap_or_else(global_registry);

        let mut uri = self.uri.clone();
        let mut method = method;
        let mut redirects = 0;
        loop {
            let outbound = self.prepare(&request, &uri)?;
            let response =
                registry.dispatch(method.clone(), &uri, outbound, Some(self.timeout)).wait().await?;

            if let Some(ref jar) = self.cookie_jar {
                jar.lock().apply_response_headers(response.headers(), &uri);
            }

            if self.follow_redirects
                && response.status().is_redirection()
                && redirects < MAX_REDIRECTS
            {
                if let Some(location) =
                    response.headers().get(LOCATION).and_then(|v| v.to_str().ok())
                {
                    if let Ok(target) = Uri::parse(location) {
                        tracing::debug!(from = %uri, to = %target, "following redirect");
                        redirects += 1;
                        uri = target;
                        // 307/308 preserve the verb and body; anything else
                        // degrades to GET
                        if response.status() != http::StatusCode::TEMPORARY_REDIRECT
                            && response.status() != http::StatusCode::PERMANENT_REDIRECT
                        {
                            method = Method::GET;
                        }
                        continue;
                    }
                }
            }
            return Ok(response);
        }
    }

    fn prepare(&self, request: &Message, uri: &Uri) -> Result<Message> {
        let mut outbound = request
            .try_clone()
            .ok_or_else(|| crate::Error::generic("request body has not been memoized"))?;
        for (name, value) in &self.headers {
            outbound.headers_mut().append(name.clone(), value.clone());
        }
        if let Some((ref user, ref password)) = self.credentials {
            let token = BASE64.encode(format!("{user}:{password}"));
            if let Ok(value) = HeaderValue::from_str(&format!("Basic {token}")) {
                outbound.headers_mut().insert(AUTHORIZATION, value);
            }
        }
        if let Some(ref jar) = self.cookie_jar {
            if let Some(header) = jar.lock().header_value(uri) {
                if let Ok(value) = HeaderValue::from_str(&header) {
                    outbound.headers_mut().insert(COOKIE, value);
                }
            }
        }
        Ok(outbound)
    }
}
