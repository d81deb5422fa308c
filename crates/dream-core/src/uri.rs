//! Structured URI value used throughout the dispatch pipeline
//!
//! A [`Uri`] carries scheme, host, optional port, ordered path segments, an
//! ordered query list (duplicate keys allowed), an optional fragment, and a
//! trailing-slash flag. Canonicalization happens once at construction:
//! scheme and host are lowercased, default ports are stripped, and
//! percent-escapes in segments and query pairs are decoded. Equality and
//! hashing are defined on that canonical form, so a parsed URI compares
//! stable regardless of input spelling.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Structured URI with ordered path segments and query parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    scheme: String,
    host: String,
    port: Option<u16>,
    segments: Vec<String>,
    trailing_slash: bool,
    query: Vec<(String, Option<String>)>,
    fragment: Option<String>,
}

impl Uri {
    /// Parse an absolute URI string
    pub fn parse(input: &str) -> Result<Self> {
        let parsed = url::Url::parse(input)
            .map_err(|e| Error::malformed_uri(input, e.to_string()))?;

        let host = parsed
            .host_str()
            .ok_or_else(|| Error::malformed_uri(input, "missing host"))?
            .to_ascii_lowercase();

        let raw_path = parsed.path();
        let trailing_slash = raw_path.len() > 1 && raw_path.ends_with('/');
        let segments = raw_path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(decode_component)
            .collect();

        let query = match parsed.query() {
            Some(q) if !q.is_empty() => parse_query(q),
            _ => Vec::new(),
        };

        Ok(Self {
            scheme: parsed.scheme().to_ascii_lowercase(),
            host,
            // url already strips default ports for the special schemes
            port: parsed.port(),
            segments,
            trailing_slash,
            query,
            fragment: parsed.fragment().map(decode_component),
        })
    }

    /// Build a URI from parts, without a path
    pub fn from_parts<S: Into<String>, H: Into<String>>(scheme: S, host: H, port: Option<u16>) -> Self {
        Self {
            scheme: scheme.into().to_ascii_lowercase(),
            host: host.into().to_ascii_lowercase(),
            port,
            segments: Vec::new(),
            trailing_slash: false,
            query: Vec::new(),
            fragment: None,
        }
    }

    /// Build an in-process `local://` URI for the given host name
    pub fn local<H: Into<String>>(host: H) -> Self {
        Self::from_parts("local", host, None)
    }

    /// URI scheme, lowercase
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host name, lowercase
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit (non-default) port, if any
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Decoded path segments, in order
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True when the path carries a significant trailing slash
    pub fn trailing_slash(&self) -> bool {
        self.trailing_slash
    }

    /// Ordered query parameter list; duplicate keys allowed
    pub fn query_pairs(&self) -> &[(String, Option<String>)] {
        &self.query
    }

    /// First value for the given query key
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Fragment, if any
    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// True for the in-process `local://` scheme
    pub fn is_local(&self) -> bool {
        self.scheme == "local"
    }

    /// Append path segments, preserving the query
    pub fn at(&self, segments: &[&str]) -> Self {
        let mut uri = self.clone();
        uri.segments.extend(segments.iter().map(|s| (*s).to_string()));
        uri.trailing_slash = false;
        uri
    }

    /// Append a query parameter; order-preserving, duplicate keys allowed
    pub fn with<K: Into<String>, V: Into<String>>(&self, key: K, value: V) -> Self {
        let mut uri = self.clone();
        uri.query.push((key.into(), Some(value.into())));
        uri
    }

    /// Replace the whole query list
    pub fn with_query(&self, query: Vec<(String, Option<String>)>) -> Self {
        let mut uri = self.clone();
        uri.query = query;
        uri
    }

    /// Drop all query parameters
    pub fn without_query(&self) -> Self {
        let mut uri = self.clone();
        uri.query.clear();
        uri
    }

    /// Set the trailing-slash flag
    pub fn with_trailing_slash(&self) -> Self {
        let mut uri = self.clone();
        uri.trailing_slash = true;
        uri
    }

    /// Clear the trailing-slash flag
    pub fn without_trailing_slash(&self) -> Self {
        let mut uri = self.clone();
        uri.trailing_slash = false;
        uri
    }

    /// Set the fragment
    pub fn with_fragment<S: Into<String>>(&self, fragment: S) -> Self {
        let mut uri = self.clone();
        uri.fragment = Some(fragment.into());
        uri
    }

    /// Encoded path, always starting with `/`
    pub fn path(&self) -> String {
        if self.segments.is_empty() {
            return "/".to_string();
        }
        let mut path = String::new();
        for segment in &self.segments {
            path.push('/');
            path.push_str(&urlencoding::encode(segment));
        }
        if self.trailing_slash {
            path.push('/');
        }
        path
    }

    /// Stable `scheme://host[:port]` key
    pub fn scheme_host_port(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{}", self.scheme, self.host, port),
            None => format!("{}://{}", self.scheme, self.host),
        }
    }

    /// Stable `scheme://host[:port]/path` key; ignores query and fragment
    pub fn scheme_host_port_path(&self) -> String {
        format!("{}{}", self.scheme_host_port(), self.path())
    }

    /// Path equality under an explicit trailing-slash policy
    pub fn path_equals(&self, other: &Self, trailing_slash_sensitive: bool) -> bool {
        if self.segments != other.segments {
            return false;
        }
        !trailing_slash_sensitive || self.trailing_slash == other.trailing_slash
    }

    /// True when `self` is `other` or a descendant of it (same authority,
    /// `other`'s segments are a prefix of `self`'s)
    pub fn is_descendant_of(&self, other: &Self) -> bool {
        self.scheme == other.scheme
            && self.host == other.host
            && self.port == other.port
            && self.segments.len() >= other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }

    /// Strip a prefix URI's segments, keeping query and fragment.
    /// Returns `None` when `self` is not a descendant of `prefix`.
    pub fn strip_prefix(&self, prefix: &Self) -> Option<Self> {
        if !self.is_descendant_of(prefix) {
            return None;
        }
        let mut uri = self.clone();
        uri.segments = self.segments[prefix.segments.len()..].to_vec();
        Some(uri)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.scheme_host_port())?;
        if !self.segments.is_empty() || self.trailing_slash {
            write!(f, "{}", self.path())?;
        }
        if !self.query.is_empty() {
            f.write_str("?")?;
            for (i, (key, value)) in self.query.iter().enumerate() {
                if i > 0 {
                    f.write_str("&")?;
                }
                write!(f, "{}", urlencoding::encode(key))?;
                if let Some(value) = value {
                    write!(f, "={}", urlencoding::encode(value))?;
                }
            }
        }
        if let Some(ref fragment) = self.fragment {
            write!(f, "#{}", urlencoding::encode(fragment))?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Uri {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Uri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn decode_component(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn parse_query(raw: &str) -> Vec<(String, Option<String>)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (decode_component(key), Some(decode_component(value))),
            None => (decode_component(pair), None),
        })
        .collect()
}
