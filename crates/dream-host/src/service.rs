//! Services and their feature tables
//!
//! A service is a bundle of features mounted at a path: each feature binds
//! a verb plus a path pattern to an async handler. Registration is
//! value-level; a service is described by building a [`ServiceDescriptor`]
//! with its handler table directly, and the host never scans anything at
//! runtime. Patterns are literal segments with an optional terminal `*`
//! (absorbs the rest) or `{name}` (captures exactly one segment); among
//! matching features the one with the most literal segments wins.

use crate::config::ServiceConfig;
use dream_core::{Error, Message, Result, Uri};
use futures::future::BoxFuture;
use http::Method;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Service lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Constructed, not yet started
    Initialized,
    /// Startup coroutine running
    Starting,
    /// Serving traffic
    Running,
    /// Shutdown in progress
    Stopping,
    /// Cleanly stopped
    Stopped,
    /// Startup or shutdown failed
    Failed,
}

/// Everything a feature handler gets to see
pub struct FeatureContext {
    /// Request verb
    pub method: Method,
    /// Full request URI
    pub uri: Uri,
    /// Request message
    pub request: Message,
    /// Values bound by `{name}` captures
    pub params: HashMap<String, String>,
    /// Segments absorbed by a terminal `*`
    pub tail: Vec<String>,
}

/// Boxed async feature handler
pub type FeatureHandler =
    Arc<dyn Fn(FeatureContext) -> BoxFuture<'static, Result<Message>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Terminal {
    /// Pattern must consume the path exactly
    None,
    /// `*`: zero or more trailing segments
    Wildcard,
    /// `{name}`: exactly one more segment, bound by name
    Capture(String),
}

#[derive(Debug, Clone)]
struct FeaturePattern {
    literals: Vec<String>,
    terminal: Terminal,
}

impl FeaturePattern {
    fn parse(pattern: &str) -> Result<Self> {
        let segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        let mut literals = Vec::new();
        let mut terminal = Terminal::None;
        for (index, segment) in segments.iter().enumerate() {
            let is_last = index == segments.len() - 1;
            if *segment == "*" {
                if !is_last {
                    return Err(Error::service(format!(
                        "wildcard must be the terminal segment in '{pattern}'"
                    )));
                }
                terminal = Terminal::Wildcard;
            } else if let Some(name) =
                segment.strip_prefix('{').and_then(|s| s.strip_suffix('}'))
            {
                if !is_last {
                    return Err(Error::service(format!(
                        "capture must be the terminal segment in '{pattern}'"
                    )));
                }
                terminal = Terminal::Capture(name.to_string());
            } else {
                literals.push((*segment).to_string());
            }
        }
        Ok(Self { literals, terminal })
    }

    /// Match against path segments; the score is the number of literal
    /// segments matched
    fn matches(&self, segments: &[String]) -> Option<(u32, HashMap<String, String>, Vec<String>)> {
        if segments.len() < self.literals.len() {
            return None;
        }
        let (head, rest) = segments.split_at(self.literals.len());
        if head != self.literals.as_slice() {
            return None;
        }
        let score = self.literals.len() as u32;
        match self.terminal {
            Terminal::None => rest.is_empty().then(|| (score, HashMap::new(), Vec::new())),
            Terminal::Wildcard => Some((score, HashMap::new(), rest.to_vec())),
            Terminal::Capture(ref name) => {
                if rest.len() != 1 {
                    return None;
                }
                let mut params = HashMap::new();
                params.insert(name.clone(), rest[0].clone());
                Some((score, params, Vec::new()))
            }
        }
    }
}

struct Feature {
    method: Method,
    pattern: FeaturePattern,
    handler: FeatureHandler,
}

/// Verb + path-pattern handler table of one service
#[derive(Default)]
pub struct FeatureTable {
    features: Vec<Feature>,
}

impl fmt::Debug for FeatureTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> =
            self.features.iter().map(|x| format!("{} {:?}", x.method, x.pattern)).collect();
        f.debug_struct("FeatureTable").field("features", &entries).finish()
    }
}

impl FeatureTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered features
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// True when no features are registered
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Register a handler for a verb and path pattern
    pub fn add<F, Fut>(&mut self, method: Method, pattern: &str, handler: F) -> Result<()>
    where
        F: Fn(FeatureContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Message>> + Send + 'static,
    {
        let pattern = FeaturePattern::parse(pattern)?;
        self.features.push(Feature {
            method,
            pattern,
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
        });
        Ok(())
    }

    /// Find the best-matching feature for a verb and relative path; most
    /// matched literal segments wins, ties to the earliest registration
    pub fn find(
        &self,
        method: &Method,
        segments: &[String],
    ) -> Option<(FeatureHandler, HashMap<String, String>, Vec<String>)> {
        let mut best: Option<(u32, &Feature, HashMap<String, String>, Vec<String>)> = None;
        for feature in &self.features {
            if &feature.method != method {
                continue;
            }
            if let Some((score, params, tail)) = feature.pattern.matches(segments) {
                if best.as_ref().is_none_or(|(top, ..)| score > *top) {
                    best = Some((score, feature, params, tail));
                }
            }
        }
        best.map(|(_, feature, params, tail)| (Arc::clone(&feature.handler), params, tail))
    }
}

/// Context handed to service start/stop handlers
#[derive(Debug, Clone)]
pub struct ServiceContext {
    /// The mount URI of the service
    pub mount: Uri,
    /// Private storage root created for this service
    pub private_storage: PathBuf,
    /// The configuration the service was mounted with
    pub config: ServiceConfig,
}

type LifecycleHandler =
    Box<dyn Fn(ServiceContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Value-level description of a service: name, SIDs, features, lifecycle
pub struct ServiceDescriptor {
    name: String,
    sids: Vec<String>,
    features: FeatureTable,
    on_start: Option<LifecycleHandler>,
    on_stop: Option<LifecycleHandler>,
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("sids", &self.sids)
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

impl ServiceDescriptor {
    /// Start describing a service
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sids: Vec::new(),
            features: FeatureTable::new(),
            on_start: None,
            on_stop: None,
        }
    }

    /// Service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered service identifiers
    pub fn sids(&self) -> &[String] {
        &self.sids
    }

    /// Borrow the feature table
    pub fn features(&self) -> &FeatureTable {
        &self.features
    }

    /// Add a service identifier
    pub fn with_sid(mut self, sid: &str) -> Self {
        self.sids.push(sid.to_string());
        self
    }

    /// Add a feature handler
    pub fn with_feature<F, Fut>(mut self, method: Method, pattern: &str, handler: F) -> Result<Self>
    where
        F: Fn(FeatureContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Message>> + Send + 'static,
    {
        self.features.add(method, pattern, handler)?;
        Ok(self)
    }

    /// Run on startup; the service only reaches `Running` when this
    /// completes successfully
    pub fn on_start<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ServiceContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.on_start = Some(Box::new(move |ctx| Box::pin(handler(ctx))));
        self
    }

    /// Run on shutdown
    pub fn on_stop<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ServiceContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.on_stop = Some(Box::new(move |ctx| Box::pin(handler(ctx))));
        self
    }

    pub(crate) fn start_handler(&self) -> Option<&LifecycleHandler> {
        self.on_start.as_ref()
    }

    pub(crate) fn stop_handler(&self) -> Option<&LifecycleHandler> {
        self.on_stop.as_ref()
    }
}
