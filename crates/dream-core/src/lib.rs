//! # Dream Core
//!
//! Core request-invocation pipeline for the Dream framework: structured
//! URIs with prefix-trie matching, a single-shot completion model with
//! cooperative forking, an ordered endpoint registry with scored dispatch,
//! and the immutable [`Plug`] request builder that ties them together.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use dream_core::{global_registry, Plug, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // endpoints register themselves into the process-wide registry;
//!     // a plug then addresses them like any other URI
//!     let response = Plug::parse("http://service/users")?
//!         .with("limit", "10")
//!         .with_header("X-Request-Id", "r-1")
//!         .get()
//!         .await?;
//!     assert!(response.is_success());
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod completion;
pub mod cookie;
pub mod endpoint;
mod error;
pub mod message;
pub mod plug;
pub mod ports;
pub mod uri;
pub mod uri_trie;
pub mod work;

pub use buffer::{ChunkedBuffer, CHUNK_SIZE};
pub use completion::{fork, fork_with_env, Completion, TaskEnv, TerminalKind};
pub use cookie::{shared_jar, Cookie, CookieJar, SharedCookieJar};
pub use endpoint::{global_registry, Endpoint, EndpointRegistry, EndpointToken};
pub use error::{Error, Result};
pub use message::{Body, Message};
pub use plug::Plug;
pub use uri::Uri;
pub use uri_trie::UriTrie;
pub use work::ProcessingQueue;

// the wire-level vocabulary is the http crate's
pub use http::{HeaderMap, Method, StatusCode};
