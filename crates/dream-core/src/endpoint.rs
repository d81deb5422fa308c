//! Endpoint registry and scored dispatch
//!
//! Endpoints are the pluggable providers behind the single address space:
//! each one reports a score for a URI (0 or `None` meaning "not handled")
//! together with a normalized URI, and the registry hands every invocation
//! to the highest scorer. Ties break to the earliest registration, so the
//! provider order is part of the dispatch contract. Registration hands back
//! a token; holders remove themselves with the token instead of keeping a
//! reference into the registry.

use crate::completion::Completion;
use crate::message::Message;
use crate::uri::Uri;
use crate::Error;
use crate::Result;
use async_trait::async_trait;
use http::Method;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// A registered request handler with scored URI matching
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Score the URI; `None` or a score of 0 means "does not handle".
    /// The endpoint may rewrite the URI, e.g. to strip a local prefix.
    fn score_and_normalize(&self, uri: &Uri) -> Option<(u32, Uri)>;

    /// Handle an invocation previously scored as a match
    async fn invoke(&self, method: Method, uri: Uri, request: Message) -> Result<Message>;
}

/// Opaque handle for removing a registered endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointToken(u64);

struct Registered {
    token: u64,
    endpoint: Arc<dyn Endpoint>,
}

#[derive(Default)]
struct Providers {
    list: Vec<Registered>,
    next_token: u64,
}

/// Ordered list of endpoint providers with scored dispatch
#[derive(Default)]
pub struct EndpointRegistry {
    providers: Mutex<Providers>,
    reset_hooks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl EndpointRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an endpoint; later registrations lose score ties to earlier
    /// ones
    pub fn add_endpoint(&self, endpoint: Arc<dyn Endpoint>) -> EndpointToken {
        let mut providers = self.providers.lock();
        providers.next_token += 1;
        let token = providers.next_token;
        providers.list.push(Registered { token, endpoint });
        EndpointToken(token)
    }

    /// Remove a single endpoint by its token
    pub fn remove_endpoint(&self, token: EndpointToken) -> bool {
        let mut providers = self.providers.lock();
        let before = providers.list.len();
        providers.list.retain(|r| r.token != token.0);
        providers.list.len() != before
    }

    /// Remove every endpoint and fire the reset hooks so upper layers can
    /// drop their caches
    pub fn deregister_all(&self) {
        self.providers.lock().list.clear();
        let hooks = self.reset_hooks.lock();
        for hook in hooks.iter() {
            hook();
        }
    }

    /// Register a hook to run whenever [`deregister_all`](Self::deregister_all)
    /// fires
    pub fn on_deregister_all(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.reset_hooks.lock().push(Box::new(hook));
    }

    /// Number of registered endpoints
    pub fn len(&self) -> usize {
        self.providers.lock().list.len()
    }

    /// True when no endpoints are registered
    pub fn is_empty(&self) -> bool {
        self.providers.lock().list.is_empty()
    }

    /// Dispatch a request to the best-scoring endpoint.
    ///
    /// Scores are computed in registration order under the registry lock;
    /// the maximum wins with ties to the earliest registration. A zero
    /// maximum fails the returned completion with
    /// [`Error::NoEndpoint`]. The winner runs on a pool worker; when
    /// `deadline` lapses first, the completion fails with `Timeout` and the
    /// in-flight handler is abandoned (its eventual transition is a no-op).
    pub fn dispatch(
        &self,
        method: Method,
        uri: &Uri,
        request: Message,
        deadline: Option<Duration>,
    ) -> Completion<Message> {
        let winner = {
            let providers = self.providers.lock();
            let mut best: Option<(u32, Uri, Arc<dyn Endpoint>)> = None;
            for registered in &providers.list {
                if let Some((score, normalized)) = registered.endpoint.score_and_normalize(uri) {
                    if score > 0 && best.as_ref().is_none_or(|(top, _, _)| score > *top) {
                        best = Some((score, normalized, Arc::clone(&registered.endpoint)));
                    }
                }
            }
            best
        };

        let completion = match deadline {
            Some(deadline) => Completion::with_deadline(deadline),
            None => Completion::new(),
        };
        match winner {
            None => {
                completion.fail(Error::no_endpoint(uri.to_string()));
            }
            Some((score, normalized, endpoint)) => {
                tracing::debug!(%uri, score, "dispatching {method} to endpoint");
                let handle = completion.clone();
                tokio::spawn(async move {
                    match endpoint.invoke(method, normalized, request).await {
                        Ok(response) => handle.complete(response),
                        Err(error) => handle.fail(error),
                    };
                });
            }
        }
        completion
    }
}

static GLOBAL_REGISTRY: Lazy<Arc<EndpointRegistry>> =
    Lazy::new(|| Arc::new(EndpointRegistry::new()));

/// Process-wide default registry, used by plugs that are not bound to an
/// explicit one
pub fn global_registry() -> Arc<EndpointRegistry> {
    Arc::clone(&GLOBAL_REGISTRY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FixedScore {
        score: u32,
        label: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Endpoint for FixedScore {
        fn score_and_normalize(&self, uri: &Uri) -> Option<(u32, Uri)> {
            Some((self.score, uri.clone()))
        }

        async fn invoke(&self, _method: Method, _uri: Uri, _request: Message) -> Result<Message> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Message::from_text(self.label))
        }
    }

    fn endpoint(score: u32, label: &'static str) -> (Arc<FixedScore>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(FixedScore {
                score,
                label,
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }

    #[tokio::test]
    async fn ties_break_to_earliest_registration() {
        let registry = EndpointRegistry::new();
        let (a, a_calls) = endpoint(5, "a");
        let (b, b_calls) = endpoint(5, "b");
        registry.add_endpoint(a);
        registry.add_endpoint(b);

        let uri = Uri::parse("http://x/y").unwrap();
        let response =
            registry.dispatch(Method::GET, &uri, Message::ok(), None).wait().await.unwrap();
        assert_eq!(response.to_text().unwrap(), "a");
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn highest_score_wins() {
        let registry = EndpointRegistry::new();
        let (low, _) = endpoint(1, "low");
        let (high, _) = endpoint(9, "high");
        registry.add_endpoint(low);
        registry.add_endpoint(high);

        let uri = Uri::parse("http://x/y").unwrap();
        let response =
            registry.dispatch(Method::GET, &uri, Message::ok(), None).wait().await.unwrap();
        assert_eq!(response.to_text().unwrap(), "high");
    }

    #[tokio::test]
    async fn zero_scores_fail_with_no_endpoint() {
        let registry = EndpointRegistry::new();
        let (zero, calls) = endpoint(0, "zero");
        registry.add_endpoint(zero);

        let uri = Uri::parse("http://x/y").unwrap();
        let err =
            registry.dispatch(Method::GET, &uri, Message::ok(), None).wait().await.unwrap_err();
        assert!(matches!(err, Error::NoEndpoint { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    struct Slow;

    #[async_trait]
    impl Endpoint for Slow {
        fn score_and_normalize(&self, uri: &Uri) -> Option<(u32, Uri)> {
            Some((1, uri.clone()))
        }

        async fn invoke(&self, _method: Method, _uri: Uri, _request: Message) -> Result<Message> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Message::ok())
        }
    }

    #[tokio::test]
    async fn deadline_abandons_slow_handler() {
        let registry = EndpointRegistry::new();
        registry.add_endpoint(Arc::new(Slow));

        let uri = Uri::parse("http://x/slow").unwrap();
        let started = std::time::Instant::now();
        let err = registry
            .dispatch(Method::GET, &uri, Message::ok(), Some(Duration::from_millis(50)))
            .wait()
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn remove_and_reset() {
        let registry = EndpointRegistry::new();
        let (a, _) = endpoint(5, "a");
        let token = registry.add_endpoint(a);
        assert_eq!(registry.len(), 1);

        assert!(registry.remove_endpoint(token));
        assert!(!registry.remove_endpoint(token));
        assert!(registry.is_empty());

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        registry.on_deregister_all(move || fired2.store(true, Ordering::SeqCst));
        let (b, _) = endpoint(5, "b");
        registry.add_endpoint(b);
        registry.deregister_all();
        assert!(registry.is_empty());
        assert!(fired.load(Ordering::SeqCst));
    }
}
