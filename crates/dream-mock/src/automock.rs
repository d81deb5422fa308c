//! Ordered expectation mode
//!
//! An [`AutoMock`] holds an indexed list of expectations. Every incoming
//! call is matched against the expectation at the current index only: a
//! mismatch records a failure string and answers 400 without advancing,
//! a match answers the configured response and advances. Calls arriving
//! after the last expectation are captured as excess.
//! [`wait_and_verify`](AutoMock::wait_and_verify) succeeds only when every
//! expectation was hit in order and no excess call arrived, waiting out a
//! short grace period after success to catch stragglers.

use chrono::{DateTime, Utc};
use dream_core::{Message, Uri};
use http::{HeaderMap, Method};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// One ordered expectation
pub(crate) struct Expectation {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) document: Option<serde_json::Value>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) response: Message,
}

/// Full capture of a call that arrived beyond the last expectation
#[derive(Debug)]
pub struct ExcessCall {
    /// Request verb
    pub method: Method,
    /// Request URI
    pub uri: Uri,
    /// Request headers
    pub headers: HeaderMap,
    /// Memoized request body, when readable
    pub body: Option<bytes::Bytes>,
    /// Arrival time
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct AutoState {
    expectations: Vec<Expectation>,
    index: usize,
    failures: Vec<String>,
    excess: Vec<ExcessCall>,
}

/// Ordered list of expectations for one mocked base URI
pub struct AutoMock {
    state: Mutex<AutoState>,
    progressed: Notify,
}

impl AutoMock {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(AutoState::default()),
            progressed: Notify::new(),
        }
    }

    /// Append an expectation: verb, exact URI, and the response to give
    pub fn expect(&self, method: Method, uri: Uri, response: Message) -> &Self {
        self.state.lock().expectations.push(Expectation {
            method,
            uri,
            document: None,
            headers: Vec::new(),
            response,
        });
        self
    }

    /// Append an expectation that also requires an exact request document
    pub fn expect_document(
        &self,
        method: Method,
        uri: Uri,
        document: serde_json::Value,
        response: Message,
    ) -> &Self {
        self.state.lock().expectations.push(Expectation {
            method,
            uri,
            document: Some(document),
            headers: Vec::new(),
            response,
        });
        self
    }

    /// Require a header on the most recently added expectation
    pub fn with_header(&self, name: &str, value: &str) -> &Self {
        let mut state = self.state.lock();
        if let Some(expectation) = state.expectations.last_mut() {
            expectation.headers.push((name.to_string(), value.to_string()));
        }
        self
    }

    pub(crate) fn handle(&self, method: &Method, uri: &Uri, request: &Message) -> Message {
        let mut state = self.state.lock();
        let index = state.index;

        if index >= state.expectations.len() {
            tracing::warn!(%uri, "call beyond the last ordered expectation");
            state.excess.push(ExcessCall {
                method: method.clone(),
                uri: uri.clone(),
                headers: request.headers().clone(),
                body: request.bytes().ok(),
                at: Utc::now(),
            });
            self.progressed.notify_waiters();
            return Message::bad_request("no expectation left for this call");
        }

        if let Some(failure) = Self::mismatch(&state.expectations[index], index, method, uri, request)
        {
            tracing::warn!(failure, "ordered expectation mismatch");
            state.failures.push(failure.clone());
            self.progressed.notify_waiters();
            return Message::bad_request(&failure);
        }

        state.index += 1;
        let response = match state.expectations[index].response.try_clone() {
            Some(response) => response,
            None => Message::error_response(
                http::StatusCode::INTERNAL_SERVER_ERROR,
                "expectation response body is not cloneable",
            ),
        };
        drop(state);
        self.progressed.notify_waiters();
        response
    }

    fn mismatch(
        expectation: &Expectation,
        index: usize,
        method: &Method,
        uri: &Uri,
        request: &Message,
    ) -> Option<String> {
        let tag = index + 1;
        if &expectation.method != method {
            return Some(format!(
                "Expectation #{tag}: expected verb '{}', got '{method}'",
                expectation.method
            ));
        }
        if &expectation.uri != uri {
            return Some(format!(
                "Expectation #{tag}: expected '{}', got '{uri}'",
                expectation.uri
            ));
        }
        for (name, value) in &expectation.headers {
            if request.header(name) != Some(value.as_str()) {
                return Some(format!(
                    "Expectation #{tag}: expected header '{name}: {value}', got '{}'",
                    request.header(name).unwrap_or("<missing>")
                ));
            }
        }
        if let Some(ref document) = expectation.document {
            match request.document() {
                Some(actual) if actual == document => {}
                Some(actual) => {
                    return Some(format!(
                        "Expectation #{tag}: expected document '{document}', got '{actual}'"
                    ));
                }
                None => {
                    return Some(format!(
                        "Expectation #{tag}: expected document '{document}', got no document"
                    ));
                }
            }
        }
        None
    }

    /// Number of expectations already satisfied, in order
    pub fn satisfied_count(&self) -> usize {
        self.state.lock().index
    }

    /// Recorded mismatch descriptions
    pub fn failures(&self) -> Vec<String> {
        self.state.lock().failures.clone()
    }

    /// Number of excess calls captured beyond the last expectation
    pub fn excess_count(&self) -> usize {
        self.state.lock().excess.len()
    }

    /// Wait until every expectation was hit in order, then wait out a grace
    /// period of at least one second (or half the elapsed time, whichever
    /// is larger) to catch late excess calls. Returns false on any
    /// mismatch, any excess call, or when the timeout lapses first.
    pub async fn wait_and_verify(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            let notified = self.progressed.notified();
            tokio::pin!(notified);
            // register before inspecting the state so a racing call still
            // wakes the wait below
            notified.as_mut().enable();
            {
                let state = self.state.lock();
                if !state.failures.is_empty() || !state.excess.is_empty() {
                    return false;
                }
                if state.index == state.expectations.len() {
                    break;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, notified).await.is_err()
            {
                let state = self.state.lock();
                return state.failures.is_empty()
                    && state.excess.is_empty()
                    && state.index == state.expectations.len();
            }
        }

        let elapsed = started.elapsed();
        let grace = std::cmp::max(Duration::from_secs(1), elapsed / 2);
        tokio::time::sleep(grace).await;

        let state = self.state.lock();
        state.failures.is_empty() && state.excess.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        Uri::parse(s).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn in_order_calls_verify() {
        let mock = AutoMock::new();
        mock.expect_document(
            Method::POST,
            uri("http://svc/a"),
            serde_json::json!({"d": 1}),
            Message::from_document(serde_json::json!({"r": 1})),
        );
        mock.expect_document(
            Method::POST,
            uri("http://svc/b"),
            serde_json::json!({"d": 2}),
            Message::from_document(serde_json::json!({"r": 2})),
        );

        let first = mock.handle(
            &Method::POST,
            &uri("http://svc/a"),
            &Message::from_document(serde_json::json!({"d": 1})),
        );
        assert_eq!(first.document().unwrap()["r"], 1);

        let second = mock.handle(
            &Method::POST,
            &uri("http://svc/b"),
            &Message::from_document(serde_json::json!({"d": 2})),
        );
        assert_eq!(second.document().unwrap()["r"], 2);

        assert!(mock.wait_and_verify(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_call_records_failure() {
        let mock = AutoMock::new();
        mock.expect(Method::POST, uri("http://svc/a"), Message::ok());
        mock.expect(Method::POST, uri("http://svc/b"), Message::ok());

        let response = mock.handle(&Method::POST, &uri("http://svc/b"), &Message::ok());
        assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);

        assert!(!mock.wait_and_verify(Duration::from_secs(1)).await);
        let failures = mock.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].starts_with("Expectation #1"), "{}", failures[0]);
        assert!(failures[0].contains("got 'http://svc/b'"), "{}", failures[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn excess_calls_fail_verification() {
        let mock = AutoMock::new();
        mock.expect(Method::GET, uri("http://svc/a"), Message::ok());

        mock.handle(&Method::GET, &uri("http://svc/a"), &Message::ok());
        let excess = mock.handle(&Method::GET, &uri("http://svc/extra"), &Message::ok());
        assert_eq!(excess.status(), http::StatusCode::BAD_REQUEST);
        assert_eq!(mock.excess_count(), 1);

        assert!(!mock.wait_and_verify(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_header_is_a_mismatch() {
        let mock = AutoMock::new();
        mock.expect(Method::GET, uri("http://svc/a"), Message::ok()).with_header("X-Key", "k1");

        mock.handle(&Method::GET, &uri("http://svc/a"), &Message::ok());
        assert_eq!(mock.satisfied_count(), 0);
        let failures = mock.failures();
        assert!(failures[0].contains("X-Key"), "{}", failures[0]);

        mock.handle(
            &Method::GET,
            &uri("http://svc/a"),
            &Message::ok().with_header("X-Key", "k1"),
        );
        assert_eq!(mock.satisfied_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn verify_times_out_when_calls_never_arrive() {
        let mock = AutoMock::new();
        mock.expect(Method::GET, uri("http://svc/a"), Message::ok());
        assert!(!mock.wait_and_verify(Duration::from_millis(100)).await);
    }
}
