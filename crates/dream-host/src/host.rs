//! The in-process host
//!
//! A host owns a `local://{name}` URI namespace, a mount table from paths
//! to service instances, and the per-service private storage roots. It is
//! itself an [`Endpoint`]: incoming URIs are routed through the mount
//! table (longest prefix wins) and then through the winning service's
//! feature table. Services are referenced by opaque tokens everywhere; no
//! service holds a reference back into the host.
//!
//! Administrative surfaces (`POST /services`, `DELETE /services/{path}`,
//! `POST /load`) are gated by the process API key, passed as an `apikey`
//! query parameter or an `X-ApiKey` header.

use crate::config::ServiceConfig;
use crate::service::{FeatureContext, ServiceContext, ServiceDescriptor, ServiceState};
use async_trait::async_trait;
use dream_core::{Completion, Endpoint, Error, Message, Result, Uri, UriTrie};
use http::{Method, StatusCode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Opaque reference to a mounted service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceToken(u64);

/// Factory producing a service descriptor from its configuration
pub type ServiceFactory = Box<dyn Fn(&ServiceConfig) -> Result<ServiceDescriptor> + Send + Sync>;

struct MountedService {
    descriptor: Arc<ServiceDescriptor>,
    state: ServiceState,
    mount: Uri,
    config: ServiceConfig,
    private_storage: PathBuf,
}

#[derive(Default)]
struct HostInner {
    mounts: UriTrie<u64>,
    services: HashMap<u64, MountedService>,
    order: Vec<u64>,
    next_token: u64,
}

/// Process container owning services and routing requests to them
pub struct Host {
    name: String,
    base: Uri,
    api_key: String,
    storage_root: PathBuf,
    classes: Mutex<HashMap<String, ServiceFactory>>,
    inner: Mutex<HostInner>,
}

impl Host {
    /// Create a host with a generated API key and a temp storage root
    pub fn new(name: &str) -> Self {
        let storage_root = std::env::temp_dir().join(format!("dream-{name}-{}", uuid::Uuid::new_v4()));
        Self::with_storage_root(name, storage_root)
    }

    /// Create a host with an explicit storage root
    pub fn with_storage_root(name: &str, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            base: Uri::local(name),
            api_key: uuid::Uuid::new_v4().simple().to_string(),
            storage_root: storage_root.into(),
            classes: Mutex::new(HashMap::new()),
            inner: Mutex::new(HostInner::default()),
        }
    }

    /// Host name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base URI of the host's namespace, `local://{name}`
    pub fn base(&self) -> &Uri {
        &self.base
    }

    /// Process API key gating the administrative surfaces
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Shared storage root; services get private roots below it
    pub fn storage_root(&self) -> &PathBuf {
        &self.storage_root
    }

    /// Register a service class for configuration-driven mounting through
    /// `POST /services`
    pub fn register_service_class(&self, class: &str, factory: ServiceFactory) {
        self.classes.lock().insert(class.to_string(), factory);
    }

    /// Mount a service built from its registered class
    pub async fn mount(&self, config: ServiceConfig) -> Result<ServiceToken> {
        let descriptor = {
            let classes = self.classes.lock();
            let factory = classes.get(&config.class).ok_or_else(|| {
                Error::service(format!("no service class '{}' is registered", config.class))
            })?;
            factory(&config)?
        };
        self.mount_with_descriptor(config, descriptor).await
    }

    /// Mount an explicitly described service at its configured path.
    /// Startup runs as a forked coroutine completing a [`Completion`]; the
    /// service reaches `Running` only on success and stays mounted as
    /// `Failed` otherwise.
    pub async fn mount_with_descriptor(
        &self,
        config: ServiceConfig,
        descriptor: ServiceDescriptor,
    ) -> Result<ServiceToken> {
        let segments: Vec<&str> = config.path.split('/').filter(|s| !s.is_empty()).collect();
        let mount = self.base.at(&segments);
        let private_storage = self.storage_root.join(segments.join("_"));
        std::fs::create_dir_all(&private_storage)?;

        let descriptor = Arc::new(descriptor);
        let token = {
            let mut inner = self.inner.lock();
            inner.next_token += 1;
            let token = inner.next_token;
            inner.mounts.add(&mount, token)?;
            inner.services.insert(
                token,
                MountedService {
                    descriptor: Arc::clone(&descriptor),
                    state: ServiceState::Initialized,
                    mount: mount.clone(),
                    config: config.clone(),
                    private_storage: private_storage.clone(),
                },
            );
            inner.order.push(token);
            token
        };

        tracing::info!(service = descriptor.name(), mount = %mount, "starting service");
        self.set_state(token, ServiceState::Starting);

        let started: Completion<()> = Completion::new();
        match descriptor.start_handler() {
            Some(start) => {
                let context = ServiceContext {
                    mount: mount.clone(),
                    private_storage,
                    config,
                };
                let future = start(context);
                let handle = started.clone();
                tokio::spawn(async move {
                    match future.await {
                        Ok(()) => handle.complete(()),
                        Err(error) => handle.fail(error),
                    };
                });
            }
            None => {
                started.complete(());
            }
        }

        match started.wait().await {
            Ok(()) => {
                self.set_state(token, ServiceState::Running);
                tracing::info!(service = descriptor.name(), "service running");
                Ok(ServiceToken(token))
            }
            Err(error) => {
                self.set_state(token, ServiceState::Failed);
                tracing::error!(service = descriptor.name(), %error, "service failed to start");
                Err(error)
            }
        }
    }

    /// Unmount the service at the given path
    pub async fn unmount(&self, path: &str) -> Result<()> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mount = self.base.at(&segments);
        let token = {
            let mut inner = self.inner.lock();
            let token = inner
                .mounts
                .remove(&mount)
                .ok_or_else(|| Error::not_found(format!("no service mounted at '{path}'")))?;
            inner.order.retain(|t| *t != token);
            token
        };
        self.stop_service(token).await
    }

    /// Stop every service in reverse mount order and drop the mounts
    pub async fn shutdown(&self) {
        let tokens = {
            let mut inner = self.inner.lock();
            inner.mounts.clear();
            let mut order = std::mem::take(&mut inner.order);
            order.reverse();
            order
        };
        for token in tokens {
            if let Err(error) = self.stop_service(token).await {
                tracing::warn!(%error, "service failed to stop cleanly");
            }
        }
    }

    /// Lifecycle state of a mounted service
    pub fn service_state(&self, token: ServiceToken) -> Option<ServiceState> {
        self.inner.lock().services.get(&token.0).map(|s| s.state)
    }

    /// Number of mounted services
    pub fn service_count(&self) -> usize {
        self.inner.lock().services.len()
    }

    async fn stop_service(&self, token: u64) -> Result<()> {
        self.set_state(token, ServiceState::Stopping);
        let (descriptor, context) = {
            let inner = self.inner.lock();
            let Some(service) = inner.services.get(&token) else {
                return Ok(());
            };
            (
                Arc::clone(&service.descriptor),
                ServiceContext {
                    mount: service.mount.clone(),
                    private_storage: service.private_storage.clone(),
                    config: service.config.clone(),
                },
            )
        };

        let result = match descriptor.stop_handler() {
            Some(stop) => stop(context).await,
            None => Ok(()),
        };
        match result {
            Ok(()) => {
                self.set_state(token, ServiceState::Stopped);
                self.inner.lock().services.remove(&token);
                tracing::info!(service = descriptor.name(), "service stopped");
                Ok(())
            }
            Err(error) => {
                self.set_state(token, ServiceState::Failed);
                self.inner.lock().services.remove(&token);
                Err(error)
            }
        }
    }

    fn set_state(&self, token: u64, state: ServiceState) {
        if let Some(service) = self.inner.lock().services.get_mut(&token) {
            service.state = state;
        }
    }

    fn key_matches(&self, uri: &Uri, request: &Message) -> bool {
        let presented = uri
            .query_value("apikey")
            .map(str::to_string)
            .or_else(|| request.header("X-ApiKey").map(str::to_string));
        presented.as_deref() == Some(self.api_key.as_str())
    }

    async fn handle_admin(
        &self,
        method: &Method,
        uri: &Uri,
        request: &Message,
    ) -> Option<Message> {
        let segments = uri.segments();
        let is_admin = matches!(segments.first().map(String::as_str), Some("services" | "load"));
        if !is_admin {
            return None;
        }
        if !self.key_matches(uri, request) {
            return Some(Message::forbidden("invalid or missing API key"));
        }

        if *method == Method::POST && segments.len() == 1 && segments[0] == "services" {
            let Some(document) = request.document() else {
                return Some(Message::bad_request("expected a configuration document"));
            };
            let config = match ServiceConfig::from_document(document) {
                Ok(config) => config,
                Err(error) => {
                    return Some(Message::bad_request(&error.to_string()));
                }
            };
            let path = config.path.clone();
            return match self.mount(config).await {
                Ok(_) => Some(Message::from_document(serde_json::json!({"path": path}))),
                Err(error) => Some(Message::bad_request(&error.to_string())),
            };
        }
        if *method == Method::DELETE && segments.len() >= 2 && segments[0] == "services" {
            let path = segments[1..].join("/");
            // a missing mount and a service that failed to stop are
            // different answers
            return match self.unmount(&path).await {
                Ok(()) => Some(Message::ok()),
                Err(error @ Error::NotFound { .. }) => {
                    Some(Message::not_found(&error.to_string()))
                }
                Err(error) => Some(Message::error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &error.to_string(),
                )),
            };
        }
        if *method == Method::POST && segments.len() == 1 && segments[0] == "load" {
            // extension sets have no in-process equivalent here
            return Some(Message::error_response(
                StatusCode::NOT_IMPLEMENTED,
                "extension loading is not available",
            ));
        }
        Some(Message::not_found("unknown administrative surface"))
    }
}

#[async_trait]
impl Endpoint for Host {
    fn score_and_normalize(&self, uri: &Uri) -> Option<(u32, Uri)> {
        if !uri.is_descendant_of(&self.base) {
            return None;
        }
        // mount depth dominates so more specific hosts can coexist
        let depth = self.inner.lock().mounts.get(uri).map_or(0, |(_, score)| score);
        Some((1 + depth, uri.clone()))
    }

    async fn invoke(&self, method: Method, uri: Uri, request: Message) -> Result<Message> {
        if let Some(response) = self.handle_admin(&method, &uri, &request).await {
            return Ok(response);
        }

        let routed = {
            let inner = self.inner.lock();
            inner.mounts.get(&uri).and_then(|(token, _)| {
                inner.services.get(token).map(|service| {
                    (service.state, service.mount.clone(), Arc::clone(&service.descriptor))
                })
            })
        };

        let Some((state, mount, descriptor)) = routed else {
            return Ok(Message::not_found("no service mounted at this path"));
        };
        if state != ServiceState::Running {
            return Ok(Message::error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "service is not running",
            ));
        }

        let relative = uri.strip_prefix(&mount).expect("mount is a prefix of the routed uri");
        let Some((handler, params, tail)) = descriptor.features().find(&method, relative.segments())
        else {
            return Ok(Message::not_found("no feature matches this path"));
        };

        handler(FeatureContext {
            method,
            uri,
            request,
            params,
            tail,
        })
        .await
    }
}
