//! # Dream Host
//!
//! In-process service host: services are value-level bundles of features
//! (verb + path pattern handlers) mounted at paths inside the host's
//! `local://{name}` namespace. The host routes dispatched requests through
//! its mount table and each service's feature table, drives the service
//! lifecycle, provisions per-service private storage, and exposes
//! API-key-gated administrative surfaces for mounting and unmounting.
//!
//! ```rust,no_run
//! use dream_core::{EndpointRegistry, Message, Method, Plug};
//! use dream_host::{Host, ServiceConfig, ServiceDescriptor};
//! use std::sync::Arc;
//!
//! # async fn example() -> dream_core::Result<()> {
//! let host = Arc::new(Host::new("main"));
//! let registry = Arc::new(EndpointRegistry::new());
//! registry.add_endpoint(Arc::clone(&host) as Arc<dyn dream_core::Endpoint>);
//!
//! let echo = ServiceDescriptor::new("echo").with_feature(
//!     Method::GET,
//!     "greet/{name}",
//!     |ctx| async move { Ok(Message::from_text(format!("hello {}", ctx.params["name"]))) },
//! )?;
//! host.mount_with_descriptor(ServiceConfig::new("echo", "sid://echo", "echo"), echo).await?;
//!
//! let response = Plug::parse("local://main/echo/greet/world")?
//!     .with_registry(registry)
//!     .get()
//!     .await?;
//! assert_eq!(response.to_text()?, "hello world");
//! # Ok(())
//! # }
//! ```

mod config;
mod host;
mod service;

pub use config::ServiceConfig;
pub use host::{Host, ServiceFactory, ServiceToken};
pub use service::{
    FeatureContext, FeatureHandler, FeatureTable, ServiceContext, ServiceDescriptor, ServiceState,
};
