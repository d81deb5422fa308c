//! Request/response message model
//!
//! A [`Message`] is the value that flows through dispatch: an HTTP-like
//! status, case-insensitive multi-valued headers, and a body. Bodies are
//! either memoized (bytes or a JSON document) and freely cloneable, or a
//! one-shot stream that must be memoized before the message can be handed
//! to multiple readers (interceptors clone the request to evaluate it).

use crate::buffer::ChunkedBuffer;
use crate::{Error, Result};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use std::fmt;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Message body
pub enum Body {
    /// No body
    Empty,
    /// Memoized raw bytes
    Bytes(Bytes),
    /// Typed JSON document
    Document(serde_json::Value),
    /// One-shot streaming body; not cloneable until memoized
    Stream(Pin<Box<dyn AsyncRead + Send + Sync>>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Document(doc) => write!(f, "Document({doc})"),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Status, headers, and body of a request or response
#[derive(Debug)]
pub struct Message {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
}

impl Message {
    /// Empty 200 OK message
    pub fn ok() -> Self {
        Self::with_status(StatusCode::OK)
    }

    /// Empty message with the given status
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::Empty,
        }
    }

    /// 200 OK carrying a JSON document body
    pub fn from_document(document: serde_json::Value) -> Self {
        let mut message = Self::ok();
        message.headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        message.body = Body::Document(document);
        message
    }

    /// 200 OK carrying raw bytes with the given content type
    pub fn from_bytes(bytes: impl Into<Bytes>, content_type: &str) -> Self {
        let mut message = Self::ok();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            message.headers.insert(CONTENT_TYPE, value);
        }
        message.body = Body::Bytes(bytes.into());
        message
    }

    /// 200 OK carrying plain text
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::from_bytes(Bytes::from(text.into()), "text/plain; charset=utf-8")
    }

    /// 200 OK carrying a one-shot streaming body
    pub fn from_stream(reader: impl AsyncRead + Send + Sync + 'static, content_type: &str) -> Self {
        let mut message = Self::ok();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            message.headers.insert(CONTENT_TYPE, value);
        }
        message.body = Body::Stream(Box::pin(reader));
        message
    }

    /// Non-2xx response carrying a JSON diagnostic body
    pub fn error_response(status: StatusCode, message: &str) -> Self {
        let mut response = Self::from_document(serde_json::json!({
            "status": status.as_u16(),
            "error": message,
        }));
        response.status = status;
        response
    }

    /// 400 with a diagnostic body
    pub fn bad_request(message: &str) -> Self {
        Self::error_response(StatusCode::BAD_REQUEST, message)
    }

    /// 403 with a diagnostic body
    pub fn forbidden(message: &str) -> Self {
        Self::error_response(StatusCode::FORBIDDEN, message)
    }

    /// 404 with a diagnostic body
    pub fn not_found(message: &str) -> Self {
        Self::error_response(StatusCode::NOT_FOUND, message)
    }

    /// Response status
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// True for 2xx statuses
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Header map, case-insensitive keys, multi-value allowed
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable header map
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Append a header; invalid names or values are ignored
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) =
            (HeaderName::try_from(name), HeaderValue::from_str(value))
        {
            self.headers.append(name, value);
        }
        self
    }

    /// First value of a header, as a string
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Content type, from the header
    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE.as_str())
    }

    /// Content length: the header when present, else the memoized body size
    pub fn content_length(&self) -> Option<u64> {
        if let Some(value) = self.header(CONTENT_LENGTH.as_str()) {
            if let Ok(length) = value.parse() {
                return Some(length);
            }
        }
        match self.body {
            Body::Empty => Some(0),
            Body::Bytes(ref bytes) => Some(bytes.len() as u64),
            Body::Document(_) | Body::Stream(_) => None,
        }
    }

    /// Borrow the body
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Typed document body, when the body is one
    pub fn document(&self) -> Option<&serde_json::Value> {
        match self.body {
            Body::Document(ref doc) => Some(doc),
            _ => None,
        }
    }

    /// True when the body can be duplicated without consuming it
    pub fn is_cloneable(&self) -> bool {
        !matches!(self.body, Body::Stream(_))
    }

    /// Materialize a streaming body into memoized bytes. No-op for bodies
    /// that are already memoized. The whole stream is buffered in 16 KiB
    /// chunks; there is no stream-through delivery.
    pub async fn memoize(&mut self) -> Result<()> {
        if let Body::Stream(ref mut reader) = self.body {
            let mut buffer = ChunkedBuffer::new();
            let mut chunk = [0u8; crate::buffer::CHUNK_SIZE];
            loop {
                let n = reader.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                buffer.append(&chunk[..n]);
            }
            self.body = Body::Bytes(buffer.to_bytes());
        }
        Ok(())
    }

    /// Duplicate the message; `None` when the body is a non-memoized stream
    pub fn try_clone(&self) -> Option<Self> {
        let body = match self.body {
            Body::Empty => Body::Empty,
            Body::Bytes(ref bytes) => Body::Bytes(bytes.clone()),
            Body::Document(ref doc) => Body::Document(doc.clone()),
            Body::Stream(_) => return None,
        };
        Some(Self {
            status: self.status,
            headers: self.headers.clone(),
            body,
        })
    }

    /// Memoized body bytes. Documents are serialized; streams must be
    /// memoized first.
    pub fn bytes(&self) -> Result<Bytes> {
        match self.body {
            Body::Empty => Ok(Bytes::new()),
            Body::Bytes(ref bytes) => Ok(bytes.clone()),
            Body::Document(ref doc) => Ok(Bytes::from(serde_json::to_vec(doc)?)),
            Body::Stream(_) => Err(Error::generic("streaming body has not been memoized")),
        }
    }

    /// Body as UTF-8 text
    pub fn to_text(&self) -> Result<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::generic(e.to_string()))
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_content_type() {
        let doc = Message::from_document(serde_json::json!({"a": 1}));
        assert_eq!(doc.content_type(), Some("application/json"));
        assert!(doc.is_success());

        let text = Message::from_text("hi");
        assert_eq!(text.content_type(), Some("text/plain; charset=utf-8"));
        assert_eq!(text.to_text().unwrap(), "hi");
    }

    #[test]
    fn headers_are_case_insensitive_and_multi_valued() {
        let message = Message::ok().with_header("X-Tag", "1").with_header("x-tag", "2");
        let values: Vec<_> = message.headers().get_all("x-TAG").iter().collect();
        assert_eq!(values.len(), 2);
        assert_eq!(message.header("X-TAG"), Some("1"));
    }

    #[test]
    fn content_length_prefers_header() {
        let message = Message::from_text("abc").with_header("Content-Length", "99");
        assert_eq!(message.content_length(), Some(99));

        let message = Message::from_text("abc");
        assert_eq!(message.content_length(), Some(3));
        assert_eq!(Message::ok().content_length(), Some(0));
    }

    #[tokio::test]
    async fn stream_body_must_be_memoized() {
        let mut message = Message::from_stream(&b"payload"[..], "application/octet-stream");
        assert!(!message.is_cloneable());
        assert!(message.try_clone().is_none());
        assert!(message.bytes().is_err());

        message.memoize().await.unwrap();
        assert!(message.is_cloneable());
        assert_eq!(message.bytes().unwrap().as_ref(), b"payload");
        // memoize is idempotent
        message.memoize().await.unwrap();
        assert_eq!(message.bytes().unwrap().as_ref(), b"payload");
    }

    #[test]
    fn error_response_carries_diagnostics() {
        let response = Message::error_response(StatusCode::BAD_GATEWAY, "upstream gone");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(!response.is_success());
        let doc = response.document().unwrap();
        assert_eq!(doc["error"], "upstream gone");
        assert_eq!(doc["status"], 502);
    }
}
