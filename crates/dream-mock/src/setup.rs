//! Unordered mock setups with additive match scoring
//!
//! Each setup under a mocked base URI is a candidate matcher plus a
//! configured response. On every invocation the plane scores all
//! candidates and the highest score answers; a candidate whose any single
//! matcher rejects scores zero. The score is additive: one point for the
//! verb (a wildcard verb matches anything), one for the path under the
//! setup's trailing-slash policy, one per query pair (ends-with
//! semantics on the value), one per query or header predicate, one per
//! literal header, and one for the body matcher.

use dream_core::{Message, Uri};
use http::Method;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Invocation-count rule for a verifiable setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Times {
    /// At least `n` calls
    AtLeast(usize),
    /// At most `n` calls
    AtMost(usize),
    /// Exactly `n` calls
    Exactly(usize),
    /// No calls at all
    Never,
    /// Exactly one call
    Once,
    /// One or more calls
    AtLeastOnce,
    /// Zero or one call
    AtMostOnce,
}

impl Times {
    fn bounds(self) -> (usize, Option<usize>) {
        match self {
            Self::AtLeast(n) => (n, None),
            Self::AtMost(n) => (0, Some(n)),
            Self::Exactly(n) => (n, Some(n)),
            Self::Never => (0, Some(0)),
            Self::Once => (1, Some(1)),
            Self::AtLeastOnce => (1, None),
            Self::AtMostOnce => (0, Some(1)),
        }
    }
}

/// Outcome of verifying a setup against its [`Times`] rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The invocation count satisfies the rule
    Ok,
    /// Too few calls arrived before the timeout
    TooFew,
    /// The count already exceeds the rule's upper bound
    TooMany,
}

type QueryPredicate = Box<dyn Fn(Option<&str>) -> bool + Send + Sync>;
type HeaderPredicate = Box<dyn Fn(Option<&str>) -> bool + Send + Sync>;
type BodyPredicate = Box<dyn Fn(&Message) -> bool + Send + Sync>;

/// One registered candidate matcher with its configured response
pub struct MockSetup {
    pub(crate) verb: Option<Method>,
    pub(crate) uri: Uri,
    pub(crate) trailing_slash_sensitive: bool,
    pub(crate) query_predicates: Vec<(String, QueryPredicate)>,
    pub(crate) header_predicates: Vec<(String, HeaderPredicate)>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) request_document: Option<serde_json::Value>,
    pub(crate) body_predicate: Option<BodyPredicate>,
    pub(crate) response: Message,
    pub(crate) times: Option<Times>,
    hits: AtomicUsize,
    called: Notify,
}

impl fmt::Debug for MockSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSetup")
            .field("verb", &self.verb)
            .field("uri", &self.uri.to_string())
            .field("times", &self.times)
            .field("hits", &self.hits.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MockSetup {
    pub(crate) fn new(
        verb: Option<Method>,
        uri: Uri,
        trailing_slash_sensitive: bool,
        query_predicates: Vec<(String, QueryPredicate)>,
        header_predicates: Vec<(String, HeaderPredicate)>,
        headers: Vec<(String, String)>,
        request_document: Option<serde_json::Value>,
        body_predicate: Option<BodyPredicate>,
        response: Message,
        times: Option<Times>,
    ) -> Self {
        Self {
            verb,
            uri,
            trailing_slash_sensitive,
            query_predicates,
            header_predicates,
            headers,
            request_document,
            body_predicate,
            response,
            times,
            hits: AtomicUsize::new(0),
            called: Notify::new(),
        }
    }

    /// Additive match score; zero as soon as any matcher rejects
    pub(crate) fn score(&self, method: &Method, uri: &Uri, request: &Message) -> u32 {
        let mut score = 0u32;

        match self.verb {
            Some(ref verb) if verb != method => return 0,
            _ => score += 1,
        }

        if !self.uri.path_equals(uri, self.trailing_slash_sensitive) {
            return 0;
        }
        score += 1;

        for (key, value) in self.uri.query_pairs() {
            let matched = uri.query_pairs().iter().any(|(rk, rv)| {
                rk == key
                    && match (rv.as_deref(), value.as_deref()) {
                        // ends-with semantics on the value
                        (Some(actual), Some(wanted)) => {
                            actual == wanted || actual.ends_with(wanted)
                        }
                        (None, None) => true,
                        _ => false,
                    }
            });
            if !matched {
                return 0;
            }
            score += 1;
        }

        for (key, predicate) in &self.query_predicates {
            if !predicate(uri.query_value(key)) {
                return 0;
            }
            score += 1;
        }

        for (name, predicate) in &self.header_predicates {
            if !predicate(request.header(name)) {
                return 0;
            }
            score += 1;
        }

        for (name, value) in &self.headers {
            if request.header(name) != Some(value.as_str()) {
                return 0;
            }
            score += 1;
        }

        if let Some(ref predicate) = self.body_predicate {
            if !predicate(request) {
                return 0;
            }
            score += 1;
        } else if let Some(ref document) = self.request_document {
            // a setup expecting a document rejects document-less requests
            match request.document() {
                Some(actual) if actual == document => score += 1,
                _ => return 0,
            }
        }

        score
    }

    pub(crate) fn record_invocation(&self) -> Message {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.called.notify_waiters();
        match self.response.try_clone() {
            Some(response) => response,
            None => Message::error_response(
                http::StatusCode::INTERNAL_SERVER_ERROR,
                "mock response body is not cloneable",
            ),
        }
    }

    /// How many invocations this setup has answered
    pub fn invocation_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Await the next invocation of this setup
    pub async fn called(&self) {
        self.called.notified().await;
    }

    /// Block until the invocation count satisfies the [`Times`] rule or
    /// the timeout lapses. A setup without a rule verifies as `Ok`.
    pub async fn verify(&self, timeout: Duration) -> VerifyOutcome {
        let Some(times) = self.times else {
            return VerifyOutcome::Ok;
        };
        let (lower, upper) = times.bounds();
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.called.notified();
            tokio::pin!(notified);
            // register before reading the count so a racing call still
            // wakes the wait below
            notified.as_mut().enable();
            let count = self.invocation_count();
            if upper.is_some_and(|upper| count > upper) {
                return VerifyOutcome::TooMany;
            }
            if count >= lower {
                return VerifyOutcome::Ok;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, notified).await.is_err()
            {
                // final check in case the last call raced the deadline
                let count = self.invocation_count();
                if upper.is_some_and(|upper| count > upper) {
                    return VerifyOutcome::TooMany;
                }
                return if count >= lower { VerifyOutcome::Ok } else { VerifyOutcome::TooFew };
            }
        }
    }

    /// [`verify`](Self::verify) with no grace: evaluate the rule against
    /// the current count and surface a failure as an error
    pub fn try_verify(&self) -> dream_core::Result<()> {
        let Some(times) = self.times else {
            return Ok(());
        };
        let (lower, upper) = times.bounds();
        let count = self.invocation_count();
        if upper.is_some_and(|upper| count > upper) {
            return Err(dream_core::Error::expectation(format!(
                "setup for '{}' expected {times:?} but saw {count} calls (too many)",
                self.uri
            )));
        }
        if count < lower {
            return Err(dream_core::Error::expectation(format!(
                "setup for '{}' expected {times:?} but saw {count} calls (too few)",
                self.uri
            )));
        }
        Ok(())
    }

    /// True when a [`Times`] rule was attached
    pub fn is_verifiable(&self) -> bool {
        self.times.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        Uri::parse(s).unwrap()
    }

    fn setup(verb: Option<Method>, target: &str) -> MockSetup {
        MockSetup::new(
            verb,
            uri(target),
            false,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            None,
            None,
            Message::ok(),
            None,
        )
    }

    #[test]
    fn wildcard_verb_matches_any() {
        let candidate = setup(None, "http://svc/a");
        let request = Message::ok();
        assert_eq!(candidate.score(&Method::GET, &uri("http://svc/a"), &request), 2);
        assert_eq!(candidate.score(&Method::DELETE, &uri("http://svc/a"), &request), 2);
    }

    #[test]
    fn explicit_verb_rejects_others() {
        let candidate = setup(Some(Method::GET), "http://svc/a");
        let request = Message::ok();
        assert_eq!(candidate.score(&Method::GET, &uri("http://svc/a"), &request), 2);
        assert_eq!(candidate.score(&Method::POST, &uri("http://svc/a"), &request), 0);
    }

    #[test]
    fn query_pairs_use_ends_with_semantics() {
        let candidate = setup(None, "http://svc/a?token=123");
        let request = Message::ok();
        assert_eq!(candidate.score(&Method::GET, &uri("http://svc/a?token=123"), &request), 3);
        assert_eq!(candidate.score(&Method::GET, &uri("http://svc/a?token=xx123"), &request), 3);
        assert_eq!(candidate.score(&Method::GET, &uri("http://svc/a?token=999"), &request), 0);
        assert_eq!(candidate.score(&Method::GET, &uri("http://svc/a"), &request), 0);
    }

    #[test]
    fn literal_headers_and_predicates_add_points() {
        let candidate = MockSetup::new(
            Some(Method::GET),
            uri("http://svc/a"),
            false,
            Vec::new(),
            vec![(
                "X-Auth".to_string(),
                Box::new(|value: Option<&str>| value.is_some()) as _,
            )],
            vec![("X-Tag".to_string(), "1".to_string())],
            None,
            None,
            Message::ok(),
            None,
        );
        let matching = Message::ok().with_header("X-Tag", "1").with_header("X-Auth", "k");
        assert_eq!(candidate.score(&Method::GET, &uri("http://svc/a"), &matching), 4);

        let missing_header = Message::ok().with_header("X-Auth", "k");
        assert_eq!(candidate.score(&Method::GET, &uri("http://svc/a"), &missing_header), 0);
    }

    #[test]
    fn document_setup_rejects_documentless_request() {
        let expected = serde_json::json!({"op": "sync"});
        let candidate = MockSetup::new(
            None,
            uri("http://svc/a"),
            false,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Some(expected.clone()),
            None,
            Message::ok(),
            None,
        );

        let with_doc = Message::from_document(expected);
        assert_eq!(candidate.score(&Method::POST, &uri("http://svc/a"), &with_doc), 3);

        let wrong_doc = Message::from_document(serde_json::json!({"op": "other"}));
        assert_eq!(candidate.score(&Method::POST, &uri("http://svc/a"), &wrong_doc), 0);

        let no_doc = Message::ok();
        assert_eq!(candidate.score(&Method::POST, &uri("http://svc/a"), &no_doc), 0);
    }

    #[test]
    fn trailing_slash_policy() {
        let mut candidate = setup(None, "http://svc/a/");
        candidate.trailing_slash_sensitive = true;
        let request = Message::ok();
        assert_eq!(candidate.score(&Method::GET, &uri("http://svc/a/"), &request), 2);
        assert_eq!(candidate.score(&Method::GET, &uri("http://svc/a"), &request), 0);
    }

    #[tokio::test]
    async fn verify_outcomes() {
        let mut candidate = setup(None, "http://svc/a");
        candidate.times = Some(Times::AtLeastOnce);

        // no calls: TooFew after the timeout
        let outcome = candidate.verify(Duration::from_millis(50)).await;
        assert_eq!(outcome, VerifyOutcome::TooFew);
        assert!(candidate.try_verify().is_err());

        candidate.record_invocation();
        assert_eq!(candidate.verify(Duration::from_millis(50)).await, VerifyOutcome::Ok);
        assert!(candidate.try_verify().is_ok());

        candidate.times = Some(Times::AtMostOnce);
        candidate.record_invocation();
        assert_eq!(candidate.verify(Duration::from_millis(50)).await, VerifyOutcome::TooMany);
    }

    #[tokio::test]
    async fn verify_stays_ok_without_further_calls() {
        let mut candidate = setup(None, "http://svc/a");
        candidate.times = Some(Times::Exactly(2));
        candidate.record_invocation();
        candidate.record_invocation();

        // once satisfied, repeated verification keeps succeeding
        for _ in 0..3 {
            assert_eq!(candidate.verify(Duration::from_millis(10)).await, VerifyOutcome::Ok);
        }
        // a call past the upper bound flips it to TooMany
        candidate.record_invocation();
        assert_eq!(candidate.verify(Duration::from_millis(10)).await, VerifyOutcome::TooMany);
    }

    #[tokio::test]
    async fn verify_unblocks_on_call() {
        let candidate = std::sync::Arc::new({
            let mut s = setup(None, "http://svc/a");
            s.times = Some(Times::Once);
            s
        });

        let verifier = std::sync::Arc::clone(&candidate);
        let task =
            tokio::spawn(async move { verifier.verify(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        candidate.record_invocation();
        assert_eq!(task.await.unwrap(), VerifyOutcome::Ok);
    }
}
