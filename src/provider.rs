//! Resource providers: where IUTs, execution spaces and log areas come from.
//!
//! A provider hands out resources of one kind and takes them back. How the
//! resources are produced is the provider's business; the checkout engine
//! only relies on the min/max checkout and check-in contract.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    ResourceProvider                          │
//! │                                                              │
//! │  wait_for_and_checkout(min, max) ──► Vec<Resource>           │
//! │  checkin(resource)                                           │
//! │  checkin_all()                                               │
//! └───────────────┬──────────────────┬──────────────────┬────────┘
//!                 │                  │                  │
//!            IutProvider   ExecutionSpaceProvider  LogAreaProvider
//!                 │                  │                  │
//!                 └──────────► RulesetProvider ◄────────┘
//!                        (templates evaluated per call)
//! ```
//!
//! # Built-in Providers
//!
//! | Provider | Module | Config key |
//! |----------|--------|------------|
//! | IUT | [`iut`] | `iut` |
//! | Execution space | [`execution_space`] | `execution_space` |
//! | Log area | [`log_area`] | `log` |
//!
//! Every provider created for a checkout is registered in a
//! [`ProviderSession`] so that a failure anywhere can check in everything
//! that was handed out.

pub mod execution_space;
pub mod iut;
pub mod log_area;
pub mod ruleset;
pub mod session;
#[cfg(test)]
pub(crate) mod stub;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::rules::{Dataset, RuleError};
use crate::wait::RetryPolicy;

pub use execution_space::ExecutionSpaceProvider;
pub use iut::IutProvider;
pub use log_area::LogAreaProvider;
pub use ruleset::{Ruleset, RulesetProvider};
pub use session::ProviderSession;

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur during provider operations.
///
/// - **Retryable**: `NotAvailable`, `CheckoutTimeout` - resources may show
///   up later
/// - **Fatal**: everything else
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider has no resources at all matching the request.
    #[error("No {kind} found in provider '{provider}'")]
    NoneFound { kind: ResourceKind, provider: String },

    /// Resources exist but not enough of them are free right now.
    #[error("{kind} not available in provider '{provider}': {reason}")]
    NotAvailable {
        kind: ResourceKind,
        provider: String,
        reason: String,
    },

    /// The provider refused a checkout outright.
    #[error("Checkout of {kind} failed: {reason}")]
    CheckoutFailed { kind: ResourceKind, reason: String },

    /// A resource could not be returned to its provider.
    #[error("Failed to check in {kind} '{id}'")]
    CheckinFailed { kind: ResourceKind, id: String },

    /// Fewer than `minimum` resources became available in time.
    #[error(
        "Timed out after {timeout_secs}s waiting for {minimum} {kind}(s) from provider '{provider}': {reason}"
    )]
    CheckoutTimeout {
        kind: ResourceKind,
        provider: String,
        minimum: usize,
        timeout_secs: u64,
        reason: String,
    },

    /// The request itself was inconsistent.
    #[error("Invalid checkout request: {0}")]
    InvalidRequest(String),

    /// The provider ruleset is malformed.
    #[error("Invalid {kind} ruleset: {reason}")]
    InvalidRuleset { kind: ResourceKind, reason: String },

    /// A template failed to evaluate.
    #[error("Rule evaluation failed: {0}")]
    Rule(#[from] RuleError),
}

impl ProviderError {
    /// Whether waiting longer could help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::NotAvailable { .. } | ProviderError::CheckoutTimeout { .. }
        )
    }
}

/// The three kinds of resources a sub-suite needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Iut,
    ExecutionSpace,
    LogArea,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Iut,
        ResourceKind::ExecutionSpace,
        ResourceKind::LogArea,
    ];

    /// Segment used in store paths (`/testrun/{id}/provider/{segment}`).
    pub fn path_segment(&self) -> &'static str {
        match self {
            ResourceKind::Iut => "iut",
            ResourceKind::ExecutionSpace => "execution-space",
            ResourceKind::LogArea => "log-area",
        }
    }

    /// Top-level key of a provider configuration document.
    pub fn config_key(&self) -> &'static str {
        match self {
            ResourceKind::Iut => "iut",
            ResourceKind::ExecutionSpace => "execution_space",
            ResourceKind::LogArea => "log",
        }
    }

    /// Dataset key a single resource is bound to while its rules run.
    pub fn binding(&self) -> &'static str {
        match self {
            ResourceKind::Iut => "iut",
            ResourceKind::ExecutionSpace => "execution_space",
            ResourceKind::LogArea => "log_area",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Iut => "IUT",
            ResourceKind::ExecutionSpace => "execution space",
            ResourceKind::LogArea => "log area",
        };
        f.write_str(name)
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "iut" => Ok(ResourceKind::Iut),
            "execution-space" | "execution_space" => Ok(ResourceKind::ExecutionSpace),
            "log-area" | "log_area" | "log" => Ok(ResourceKind::LogArea),
            other => Err(format!(
                "Unknown provider type: {other} (expected iut, execution-space or log-area)"
            )),
        }
    }
}

/// A checked-out resource.
///
/// Provider-specific attributes are kept verbatim and flattened next to the
/// identifying fields when serialized, so an IUT looks like
/// `{"id": "...", "provider_id": "lab", "kind": "iut", "name": "product", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub provider_id: String,
    pub kind: ResourceKind,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Resource {
    /// Builds a resource from a value produced by a provider template.
    ///
    /// The `id` member is used as identifier when it is a string; otherwise
    /// a fresh one is generated. Non-object values are kept under `value`.
    pub fn from_value(kind: ResourceKind, provider_id: &str, value: Value) -> Self {
        let mut attributes = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        attributes.remove("provider_id");
        attributes.remove("kind");
        let id = match attributes.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => uuid::Uuid::new_v4().to_string(),
        };
        Self {
            id,
            provider_id: provider_id.to_string(),
            kind,
            attributes,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// The resource as a JSON value, as seen by provider templates.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        map.insert(
            "provider_id".to_string(),
            Value::String(self.provider_id.clone()),
        );
        map.insert(
            "kind".to_string(),
            Value::String(self.kind.binding().to_string()),
        );
        for (key, value) in &self.attributes {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }
}

/// How many resources to check out, and how long to wait for them.
#[derive(Debug, Clone, Copy)]
pub struct CheckoutRequest {
    pub minimum: usize,
    pub maximum: usize,
    pub policy: RetryPolicy,
}

impl CheckoutRequest {
    pub fn new(minimum: usize, maximum: usize, policy: RetryPolicy) -> Self {
        Self {
            minimum,
            maximum,
            policy,
        }
    }

    /// Exactly one resource.
    pub fn single(policy: RetryPolicy) -> Self {
        Self::new(1, 1, policy)
    }

    pub fn validate(&self) -> ProviderResult<()> {
        if self.maximum < self.minimum {
            return Err(ProviderError::InvalidRequest(format!(
                "maximum ({}) is below minimum ({})",
                self.maximum, self.minimum
            )));
        }
        Ok(())
    }
}

/// A source of resources of a single kind.
///
/// # Contract
///
/// - [`wait_for_and_checkout`](Self::wait_for_and_checkout) returns at
///   least `minimum` and at most `maximum` resources, or fails once the
///   request's timeout elapses. Resources already held by this provider are
///   never handed out twice.
/// - [`checkin_all`](Self::checkin_all) returns everything this provider
///   still holds. It never fails; problems are logged.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Provider id from its configuration.
    fn id(&self) -> &str;

    fn kind(&self) -> ResourceKind;

    /// Waits until at least `request.minimum` resources can be checked out.
    async fn wait_for_and_checkout(
        &self,
        request: &CheckoutRequest,
        dataset: &Dataset,
    ) -> ProviderResult<Vec<Resource>>;

    /// Returns a single resource to the provider.
    async fn checkin(&self, resource: &Resource) -> ProviderResult<()>;

    /// Returns every resource this provider still holds.
    async fn checkin_all(&self);

    /// Resources currently held.
    async fn checked_out(&self) -> Vec<Resource>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_names() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.path_segment().parse::<ResourceKind>().unwrap(), kind);
            assert_eq!(kind.config_key().parse::<ResourceKind>().unwrap(), kind);
        }
        assert!("printer".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_resource_from_value_takes_id() {
        let resource = Resource::from_value(
            ResourceKind::Iut,
            "lab",
            json!({"id": "board-7", "kind": "spoofed", "name": "product"}),
        );
        assert_eq!(resource.id, "board-7");
        assert_eq!(resource.provider_id, "lab");
        assert_eq!(resource.kind, ResourceKind::Iut);
        assert_eq!(resource.attribute("name"), Some(&json!("product")));
        assert!(resource.attribute("kind").is_none());
    }

    #[test]
    fn test_resource_serializes_flat() {
        let resource = Resource::from_value(ResourceKind::LogArea, "s3", json!({"bucket": "logs"}));
        let value = serde_json::to_value(&resource).unwrap();
        assert_eq!(value["bucket"], "logs");
        assert_eq!(value["kind"], "log_area");
        assert_eq!(value, resource.to_value());

        let back: Resource = serde_json::from_value(value).unwrap();
        assert_eq!(back, resource);
    }

    #[test]
    fn test_non_object_values_are_wrapped() {
        let resource = Resource::from_value(ResourceKind::Iut, "lab", json!("serial-1"));
        assert_eq!(resource.attribute("value"), Some(&json!("serial-1")));
        assert!(!resource.id.is_empty());
    }

    #[test]
    fn test_request_validation() {
        let policy = RetryPolicy::new(Default::default(), Default::default());
        assert!(CheckoutRequest::new(1, 3, policy).validate().is_ok());
        assert!(CheckoutRequest::new(2, 1, policy).validate().is_err());
    }
}
