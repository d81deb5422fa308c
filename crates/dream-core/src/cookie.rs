//! Cookies and the cookie jar
//!
//! The jar maps `(domain, path, name)` to a cookie and keeps only the
//! most-recent entry by update timestamp. A [`Plug`](crate::plug::Plug)
//! with an attached jar folds `Set-Cookie` response headers back into it
//! and sends matching cookies on subsequent requests.

use crate::uri::Uri;
use chrono::{DateTime, Utc};
use http::header::SET_COOKIE;
use http::HeaderMap;
use std::collections::HashMap;
use std::sync::Arc;

/// A single cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    /// Cookie name
    pub name: String,
    /// Cookie value
    pub value: String,
    /// Domain the cookie applies to; `None` means the origin host only
    pub domain: Option<String>,
    /// Path prefix the cookie applies to
    pub path: String,
    /// Expiry; `None` for session cookies
    pub expires: Option<DateTime<Utc>>,
    /// Only sent over secure schemes
    pub secure: bool,
    updated: DateTime<Utc>,
}

impl Cookie {
    /// Create a session cookie for path `/`
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: "/".to_string(),
            expires: None,
            secure: false,
            updated: Utc::now(),
        }
    }

    /// Set the domain
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into().to_ascii_lowercase());
        self
    }

    /// Set the path prefix
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the expiry
    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Mark secure-only
    pub fn with_secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// When this cookie was last written
    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    /// True when the expiry has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// Parse a `Set-Cookie` header value. Unrecognized attributes are
    /// ignored; returns `None` when no `name=value` pair leads the string.
    pub fn parse_set_cookie(raw: &str) -> Option<Self> {
        let mut parts = raw.split(';').map(str::trim);
        let (name, value) = parts.next()?.split_once('=')?;
        if name.is_empty() {
            return None;
        }
        let mut cookie = Self::new(name.trim(), value.trim());
        for part in parts {
            match part.split_once('=') {
                Some((key, val)) if key.eq_ignore_ascii_case("domain") => {
                    cookie.domain = Some(val.trim().trim_start_matches('.').to_ascii_lowercase());
                }
                Some((key, val)) if key.eq_ignore_ascii_case("path") => {
                    cookie.path = val.trim().to_string();
                }
                Some((key, val)) if key.eq_ignore_ascii_case("expires") => {
                    if let Ok(when) = DateTime::parse_from_rfc2822(val.trim()) {
                        cookie.expires = Some(when.with_timezone(&Utc));
                    }
                }
                Some((key, val)) if key.eq_ignore_ascii_case("max-age") => {
                    if let Ok(seconds) = val.trim().parse::<i64>() {
                        cookie.expires = Some(Utc::now() + chrono::Duration::seconds(seconds));
                    }
                }
                None if part.eq_ignore_ascii_case("secure") => cookie.secure = true,
                _ => {}
            }
        }
        Some(cookie)
    }

    fn matches(&self, uri: &Uri, now: DateTime<Utc>) -> bool {
        if self.is_expired(now) {
            return false;
        }
        if self.secure && uri.scheme() != "https" {
            return false;
        }
        if let Some(ref domain) = self.domain {
            let host = uri.host();
            if host != domain && !host.ends_with(&format!(".{domain}")) {
                return false;
            }
        }
        let path = uri.path();
        path == self.path || path.starts_with(&self.path)
    }
}

/// Jar keyed on `(domain, path, name)`, most-recent entry wins
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: HashMap<(String, String, String), Cookie>,
}

impl CookieJar {
    /// Create an empty jar
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cookies held
    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    /// True when the jar is empty
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Insert or refresh a cookie. An existing entry is only replaced by a
    /// newer update timestamp.
    pub fn update(&mut self, mut cookie: Cookie, origin_host: &str) {
        if cookie.domain.is_none() {
            cookie.domain = Some(origin_host.to_ascii_lowercase());
        }
        let key = (
            cookie.domain.clone().unwrap_or_default(),
            cookie.path.clone(),
            cookie.name.clone(),
        );
        match self.cookies.get(&key) {
            Some(existing) if existing.updated > cookie.updated => {}
            _ => {
                self.cookies.insert(key, cookie);
            }
        }
    }

    /// Fold every `Set-Cookie` header of a response into the jar
    pub fn apply_response_headers(&mut self, headers: &HeaderMap, request_uri: &Uri) {
        for value in headers.get_all(SET_COOKIE) {
            if let Ok(raw) = value.to_str() {
                if let Some(cookie) = Cookie::parse_set_cookie(raw) {
                    self.update(cookie, request_uri.host());
                }
            }
        }
    }

    /// Cookies applicable to the given request URI
    pub fn matching(&self, uri: &Uri) -> Vec<Cookie> {
        let now = Utc::now();
        let mut matched: Vec<Cookie> =
            self.cookies.values().filter(|c| c.matches(uri, now)).cloned().collect();
        // longest path first, the way user agents order them
        matched.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then(a.name.cmp(&b.name)));
        matched
    }

    /// `Cookie` request-header value for the given URI, if any cookie applies
    pub fn header_value(&self, uri: &Uri) -> Option<String> {
        let matched = self.matching(uri);
        if matched.is_empty() {
            return None;
        }
        Some(
            matched
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Jar handle shared between a plug and its clones
pub type SharedCookieJar = Arc<parking_lot::Mutex<CookieJar>>;

/// Create a new shared jar
pub fn shared_jar() -> SharedCookieJar {
    Arc::new(parking_lot::Mutex::new(CookieJar::new()))
}
