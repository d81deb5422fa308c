//! Mock interception plane
//!
//! The plane is an [`Endpoint`] that answers with the maximum score for
//! every registered base URI and its children, so an active mock always
//! outbids production endpoints. Each base runs in one of two modes:
//! unordered scored setups or an ordered expectation list. Deregistering a
//! base is exact; deeper descendants registered separately keep their own
//! entries.

use crate::automock::AutoMock;
use crate::setup::{MockSetup, Times, VerifyOutcome};
use async_trait::async_trait;
use dream_core::{Endpoint, Error, Message, Result, Uri};
use http::Method;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Score reported for mocked URIs; above anything production endpoints use
pub const MOCK_SCORE: u32 = u32::MAX;

enum BaseEntry {
    Setups(Vec<Arc<MockSetup>>),
    Ordered(Arc<AutoMock>),
}

/// Registry of per-base-URI interceptors
#[derive(Default)]
pub struct MockPlane {
    bases: Mutex<HashMap<String, (Uri, BaseEntry)>>,
    reset_hooks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl MockPlane {
    /// Create an empty plane
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building an unordered setup under `base`
    pub fn setup(&self, base: &Uri) -> SetupBuilder<'_> {
        SetupBuilder {
            plane: self,
            base: base.clone(),
            verb: None,
            uri: base.clone(),
            trailing_slash_sensitive: false,
            query_predicates: Vec::new(),
            header_predicates: Vec::new(),
            headers: Vec::new(),
            request_document: None,
            body_predicate: None,
            times: None,
        }
    }

    /// Register `base` in ordered expectation mode. Fails when the base
    /// already has interceptors of either mode.
    pub fn automock(&self, base: &Uri) -> Result<Arc<AutoMock>> {
        let key = base.scheme_host_port_path();
        let mut bases = self.bases.lock();
        if bases.contains_key(&key) {
            return Err(Error::duplicate(key));
        }
        let mock = Arc::new(AutoMock::new());
        bases.insert(key, (base.clone(), BaseEntry::Ordered(Arc::clone(&mock))));
        Ok(mock)
    }

    fn add_setup(&self, base: &Uri, setup: MockSetup) -> Result<Arc<MockSetup>> {
        let key = base.scheme_host_port_path();
        let mut bases = self.bases.lock();
        let entry = bases
            .entry(key.clone())
            .or_insert_with(|| (base.clone(), BaseEntry::Setups(Vec::new())));
        match entry.1 {
            BaseEntry::Setups(ref mut setups) => {
                let setup = Arc::new(setup);
                setups.push(Arc::clone(&setup));
                Ok(setup)
            }
            BaseEntry::Ordered(_) => Err(Error::duplicate(key)),
        }
    }

    /// Remove the interceptors at exactly `base`; descendants registered
    /// under their own base are untouched
    pub fn deregister(&self, base: &Uri) -> bool {
        self.bases.lock().remove(&base.scheme_host_port_path()).is_some()
    }

    /// Remove every interceptor and fire the reset hooks
    pub fn deregister_all(&self) {
        self.bases.lock().clear();
        for hook in self.reset_hooks.lock().iter() {
            hook();
        }
    }

    /// Register a hook fired by [`deregister_all`](Self::deregister_all)
    pub fn on_deregister_all(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.reset_hooks.lock().push(Box::new(hook));
    }

    /// Number of registered base URIs
    pub fn base_count(&self) -> usize {
        self.bases.lock().len()
    }

    /// Verify every verifiable setup, deducting elapsed time from the
    /// shared budget. The first rule that fails aborts with an
    /// expectation error.
    pub async fn verify_all(&self, timeout: Duration) -> Result<()> {
        let setups: Vec<Arc<MockSetup>> = {
            let bases = self.bases.lock();
            bases
                .values()
                .filter_map(|(_, entry)| match entry {
                    BaseEntry::Setups(setups) => Some(setups.clone()),
                    BaseEntry::Ordered(_) => None,
                })
                .flatten()
                .filter(|setup| setup.is_verifiable())
                .collect()
        };

        let deadline = Instant::now() + timeout;
        for setup in setups {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match setup.verify(remaining).await {
                VerifyOutcome::Ok => {}
                VerifyOutcome::TooFew => {
                    return Err(Error::expectation(format!(
                        "too few calls reached the setup for '{:?}'",
                        setup
                    )));
                }
                VerifyOutcome::TooMany => {
                    return Err(Error::expectation(format!(
                        "too many calls reached the setup for '{:?}'",
                        setup
                    )));
                }
            }
        }
        Ok(())
    }

    fn find_base(&self, uri: &Uri) -> Option<String> {
        let bases = self.bases.lock();
        bases
            .iter()
            .filter(|(_, (base, _))| uri.is_descendant_of(base))
            .max_by_key(|(_, (base, _))| base.segments().len())
            .map(|(key, _)| key.clone())
    }
}

#[async_trait]
impl Endpoint for MockPlane {
    fn score_and_normalize(&self, uri: &Uri) -> Option<(u32, Uri)> {
        self.find_base(uri).map(|_| (MOCK_SCORE, uri.clone()))
    }

    async fn invoke(&self, method: Method, uri: Uri, request: Message) -> Result<Message> {
        let Some(key) = self.find_base(&uri) else {
            return Err(Error::no_endpoint(uri.to_string()));
        };

        // resolve the winning interceptor without holding the lock across
        // the response
        enum Winner {
            Setup(Arc<MockSetup>),
            Ordered(Arc<AutoMock>),
            Fallthrough,
        }

        let winner = {
            let bases = self.bases.lock();
            match bases.get(&key) {
                Some((_, BaseEntry::Ordered(mock))) => Winner::Ordered(Arc::clone(mock)),
                Some((_, BaseEntry::Setups(setups))) => {
                    let mut best: Option<(u32, Arc<MockSetup>)> = None;
                    for setup in setups {
                        let score = setup.score(&method, &uri, &request);
                        if score > 0 && best.as_ref().is_none_or(|(top, _)| score > *top) {
                            best = Some((score, Arc::clone(setup)));
                        }
                    }
                    match best {
                        Some((_, setup)) => Winner::Setup(setup),
                        None => Winner::Fallthrough,
                    }
                }
                None => Winner::Fallthrough,
            }
        };

        Ok(match winner {
            Winner::Setup(setup) => setup.record_invocation(),
            Winner::Ordered(mock) => mock.handle(&method, &uri, &request),
            // a mocked prefix with no matching candidate still answers
            Winner::Fallthrough => Message::ok(),
        })
    }
}

static GLOBAL_PLANE: Lazy<Arc<MockPlane>> = Lazy::new(|| {
    let plane = Arc::new(MockPlane::new());
    dream_core::global_registry().add_endpoint(Arc::clone(&plane) as Arc<dyn Endpoint>);
    plane
});

/// Process-wide plane, registered into the process-wide endpoint registry
/// on first use
pub fn global_plane() -> Arc<MockPlane> {
    Arc::clone(&GLOBAL_PLANE)
}

/// Builder for one unordered setup; finalized by
/// [`returns`](SetupBuilder::returns)
pub struct SetupBuilder<'a> {
    plane: &'a MockPlane,
    base: Uri,
    verb: Option<Method>,
    uri: Uri,
    trailing_slash_sensitive: bool,
    query_predicates: Vec<(String, Box<dyn Fn(Option<&str>) -> bool + Send + Sync>)>,
    header_predicates: Vec<(String, Box<dyn Fn(Option<&str>) -> bool + Send + Sync>)>,
    headers: Vec<(String, String)>,
    request_document: Option<serde_json::Value>,
    body_predicate: Option<Box<dyn Fn(&Message) -> bool + Send + Sync>>,
    times: Option<Times>,
}

impl SetupBuilder<'_> {
    /// Require an exact verb; the default matches any verb
    pub fn verb(mut self, method: Method) -> Self {
        self.verb = Some(method);
        self
    }

    /// Append path segments below the base
    pub fn at(mut self, segments: &[&str]) -> Self {
        self.uri = self.uri.at(segments);
        self
    }

    /// Require a query pair; the request value may equal it or end with it
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.uri = self.uri.with(key, value);
        self
    }

    /// Make path matching distinguish a trailing slash
    pub fn trailing_slash_sensitive(mut self) -> Self {
        self.trailing_slash_sensitive = true;
        self.uri = self.uri.with_trailing_slash();
        self
    }

    /// Require a predicate over the first value of a query key
    pub fn with_query_predicate(
        mut self,
        key: &str,
        predicate: impl Fn(Option<&str>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.query_predicates.push((key.to_string(), Box::new(predicate)));
        self
    }

    /// Require a predicate over a header value
    pub fn with_header_predicate(
        mut self,
        name: &str,
        predicate: impl Fn(Option<&str>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.header_predicates.push((name.to_string(), Box::new(predicate)));
        self
    }

    /// Require a literal header
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Require an exact request document. Requests without a document
    /// never match such a setup.
    pub fn with_request_document(mut self, document: serde_json::Value) -> Self {
        self.request_document = Some(document);
        self
    }

    /// Require a predicate over the whole request message
    pub fn with_body_predicate(
        mut self,
        predicate: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.body_predicate = Some(Box::new(predicate));
        self
    }

    /// Attach an invocation-count rule, making the setup verifiable
    pub fn times(mut self, times: Times) -> Self {
        self.times = Some(times);
        self
    }

    /// Register the setup with its response. Fails when the base is
    /// already registered in ordered mode or the response body is not
    /// cloneable.
    pub fn returns(self, response: Message) -> Result<Arc<MockSetup>> {
        if !response.is_cloneable() {
            return Err(Error::generic("mock responses must carry a memoized body"));
        }
        let setup = MockSetup::new(
            self.verb,
            self.uri,
            self.trailing_slash_sensitive,
            self.query_predicates,
            self.header_predicates,
            self.headers,
            self.request_document,
            self.body_predicate,
            response,
            self.times,
        );
        self.plane.add_setup(&self.base, setup)
    }

    /// Shorthand for a bare status response
    pub fn returns_status(self, status: http::StatusCode) -> Result<Arc<MockSetup>> {
        self.returns(Message::with_status(status))
    }
}
