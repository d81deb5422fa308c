//! Typed service configuration
//!
//! Configuration arrives as a JSON document on the administrative surface
//! and is parsed exactly once, at the boundary, into this record. Anything
//! beyond the recognized options is rejected by `deny_unknown_fields` so a
//! typo fails loudly instead of being silently dropped.

use dream_core::Result;
use serde::{Deserialize, Serialize};

/// Recognized options of a service configuration document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Registered service class to instantiate
    pub class: String,
    /// Service identifier
    pub sid: String,
    /// Mount path below the host base, e.g. `billing/v1`
    pub path: String,
    /// Per-service key overriding the host key for this service's surfaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apikey: Option<String>,
    /// Public HTTP port, for services that announce one
    #[serde(default, rename = "http-port", skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    /// Externally visible URI, when it differs from the mount
    #[serde(default, rename = "uri.public", skip_serializing_if = "Option::is_none")]
    pub uri_public: Option<String>,
    /// Bound on concurrent connections
    #[serde(default, rename = "connect-limit", skip_serializing_if = "Option::is_none")]
    pub connect_limit: Option<u32>,
    /// Filesystem folder for storage-backed services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
}

impl ServiceConfig {
    /// Minimal config for a class mounted at a path
    pub fn new(class: &str, sid: &str, path: &str) -> Self {
        Self {
            class: class.to_string(),
            sid: sid.to_string(),
            path: path.to_string(),
            apikey: None,
            http_port: None,
            uri_public: None,
            connect_limit: None,
            folder: None,
        }
    }

    /// Parse a configuration document
    pub fn from_document(document: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(document.clone())?)
    }

    /// Mount path split into segments
    pub fn path_segments(&self) -> Vec<String> {
        self.path.split('/').filter(|s| !s.is_empty()).map(str::to_string).collect()
    }
}
