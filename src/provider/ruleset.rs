//! Template-driven provider core shared by the three resource kinds.
//!
//! A ruleset is the inner object of a provider configuration:
//!
//! ```json
//! {
//!   "iut": {
//!     "id": "default",
//!     "list": {
//!       "possible": {"$expand": {"value": {"type": "$identity.type"}, "to": "$amount"}},
//!       "available": "$this.possible"
//!     },
//!     "checkout": {"board": "${iut.id}"},
//!     "checkin": true,
//!     "prepare": true
//!   }
//! }
//! ```
//!
//! | Rule | Evaluated with | Meaning |
//! |------|----------------|---------|
//! | `list` | `amount` | `possible` resources, and the `available` subset |
//! | `checkout` | resource bound | Falsy rejects the resource, an object is merged into it |
//! | `prepare` | resource bound | Falsy returns the IUT and drops it |
//! | `checkin` | resource bound | Falsy means the check-in failed |
//!
//! `checkin` sees the dataset of the most recent checkout, so a check-in
//! rule can use the same context the resource was checked out with.

use std::sync::{Arc, PoisonError};

use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{CheckoutRequest, ProviderError, ProviderResult, Resource, ResourceKind};
use crate::rules::{Dataset, RuleEvaluator, is_truthy};

/// A parsed provider ruleset.
#[derive(Debug, Clone, PartialEq)]
pub struct Ruleset {
    pub id: String,
    pub list: Value,
    pub checkout: Option<Value>,
    pub checkin: Option<Value>,
    pub prepare: Option<Value>,
}

impl Ruleset {
    /// Parses a full provider configuration document for `kind`.
    pub fn from_config(kind: ResourceKind, config: &Value) -> ProviderResult<Self> {
        let invalid = |reason: &str| ProviderError::InvalidRuleset {
            kind,
            reason: reason.to_string(),
        };
        let inner = config
            .get(kind.config_key())
            .and_then(Value::as_object)
            .ok_or_else(|| invalid(&format!("missing '{}' object", kind.config_key())))?;
        let id = inner
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing 'id'"))?;
        let list = inner
            .get("list")
            .filter(|list| list.is_object())
            .ok_or_else(|| invalid("missing 'list' object"))?;

        Ok(Self {
            id: id.to_string(),
            list: list.clone(),
            checkout: inner.get("checkout").cloned(),
            checkin: inner.get("checkin").cloned(),
            prepare: match kind {
                ResourceKind::Iut => inner.get("prepare").cloned(),
                _ => None,
            },
        })
    }
}

/// Evaluates a [`Ruleset`] to list, check out and check in resources.
///
/// Checked-out resources are remembered until they are checked in, so a
/// resource is never handed out twice by the same provider.
pub struct RulesetProvider {
    kind: ResourceKind,
    ruleset: Ruleset,
    evaluator: Arc<dyn RuleEvaluator>,
    held: Mutex<Vec<Resource>>,
    context: std::sync::Mutex<Dataset>,
}

impl RulesetProvider {
    pub fn new(kind: ResourceKind, ruleset: Ruleset, evaluator: Arc<dyn RuleEvaluator>) -> Self {
        Self {
            kind,
            ruleset,
            evaluator,
            held: Mutex::new(Vec::new()),
            context: std::sync::Mutex::new(Dataset::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.ruleset.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }

    /// Waits for at least `request.minimum` resources, retrying while the
    /// provider reports that not enough are free.
    pub async fn wait_for_and_checkout(
        &self,
        request: &CheckoutRequest,
        dataset: &Dataset,
    ) -> ProviderResult<Vec<Resource>> {
        request.validate()?;
        if request.maximum == 0 {
            return Ok(Vec::new());
        }
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = dataset.clone();

        let last_reason = std::sync::Mutex::new(String::from("nothing listed"));
        let what = format!("{} from provider '{}'", self.kind, self.id());
        let outcome = {
            let last_reason = &last_reason;
            request
                .policy
                .wait_for(&what, move || async move {
                    match self.attempt(request, dataset).await {
                        Ok(resources) => Some(Ok(resources)),
                        Err(e) if e.is_retryable() => {
                            *last_reason.lock().unwrap_or_else(PoisonError::into_inner) =
                                e.to_string();
                            None
                        }
                        Err(e) => Some(Err(e)),
                    }
                })
                .await
        };

        match outcome {
            Some(result) => result,
            None => Err(ProviderError::CheckoutTimeout {
                kind: self.kind,
                provider: self.id().to_string(),
                minimum: request.minimum,
                timeout_secs: request.policy.timeout().as_secs(),
                reason: last_reason
                    .into_inner()
                    .unwrap_or_else(PoisonError::into_inner),
            }),
        }
    }

    /// Checks a single resource in and forgets it.
    pub async fn checkin(&self, resource: &Resource) -> ProviderResult<()> {
        self.evaluate_checkin(resource)?;
        self.held.lock().await.retain(|held| held.id != resource.id);
        debug!("Checked in {} '{}'", self.kind, resource.id);
        Ok(())
    }

    /// Checks in everything still held, newest first. Failures are logged.
    pub async fn checkin_all(&self) {
        let held = std::mem::take(&mut *self.held.lock().await);
        for resource in held.iter().rev() {
            match self.evaluate_checkin(resource) {
                Ok(()) => debug!("Checked in {} '{}'", self.kind, resource.id),
                Err(e) => warn!("Failed to check in {} '{}': {}", self.kind, resource.id, e),
            }
        }
    }

    pub async fn checked_out(&self) -> Vec<Resource> {
        self.held.lock().await.clone()
    }

    /// One checkout attempt. Anything taken is checked in again if the
    /// attempt ends up below the minimum.
    async fn attempt(
        &self,
        request: &CheckoutRequest,
        dataset: &Dataset,
    ) -> ProviderResult<Vec<Resource>> {
        let available = self.list(request.maximum, dataset).await?;
        if available.len() < request.minimum {
            return Err(self.not_available(format!(
                "{} of {} requested available",
                available.len(),
                request.minimum
            )));
        }

        let mut taken = Vec::new();
        for candidate in available {
            if taken.len() == request.maximum {
                break;
            }
            let rule = self.ruleset.checkout.as_ref();
            if let Some(resource) = self.apply_rule(rule, candidate, dataset)? {
                taken.push(resource);
            }
        }

        let mut prepared = Vec::with_capacity(taken.len());
        for resource in taken {
            match self.apply_rule(self.ruleset.prepare.as_ref(), resource.clone(), dataset)? {
                Some(resource) => prepared.push(resource),
                None => {
                    warn!("{} '{}' failed preparation, checking it in", self.kind, resource.id);
                    self.return_quietly(&resource);
                }
            }
        }

        if prepared.len() < request.minimum {
            for resource in &prepared {
                self.return_quietly(resource);
            }
            return Err(self.not_available(format!(
                "only {} of {} requested could be checked out",
                prepared.len(),
                request.minimum
            )));
        }

        self.held.lock().await.extend(prepared.iter().cloned());
        debug!(
            "Checked out {} {}(s) from provider '{}'",
            prepared.len(),
            self.kind,
            self.id()
        );
        Ok(prepared)
    }

    /// Evaluates the `list` rule and drops resources already held.
    async fn list(&self, amount: usize, dataset: &Dataset) -> ProviderResult<Vec<Resource>> {
        let dataset = dataset.with("amount", json!(amount));
        let listed = self.evaluator.evaluate(&self.ruleset.list, &dataset)?;

        let possible = listed.get("possible").map(items).unwrap_or_default();
        if possible.is_empty() {
            return Err(ProviderError::NoneFound {
                kind: self.kind,
                provider: self.id().to_string(),
            });
        }
        let available = match listed.get("available") {
            Some(available) => items(available),
            None => possible,
        };

        let held = self.held.lock().await;
        Ok(available
            .into_iter()
            .map(|value| Resource::from_value(self.kind, self.id(), value))
            .filter(|resource| !held.iter().any(|h| h.id == resource.id))
            .collect())
    }

    /// Runs a per-resource rule. A missing rule accepts the resource as is.
    fn apply_rule(
        &self,
        rule: Option<&Value>,
        mut resource: Resource,
        dataset: &Dataset,
    ) -> ProviderResult<Option<Resource>> {
        let Some(rule) = rule else {
            return Ok(Some(resource));
        };
        let bound = dataset.with(self.kind.binding(), resource.to_value());
        let result = self.evaluator.evaluate(rule, &bound)?;
        if !is_truthy(&result) {
            return Ok(None);
        }
        if let Value::Object(extra) = result {
            merge_attributes(&mut resource, extra);
        }
        Ok(Some(resource))
    }

    fn evaluate_checkin(&self, resource: &Resource) -> ProviderResult<()> {
        let Some(rule) = &self.ruleset.checkin else {
            return Ok(());
        };
        let bound = self
            .context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .with(self.kind.binding(), resource.to_value());
        if is_truthy(&self.evaluator.evaluate(rule, &bound)?) {
            Ok(())
        } else {
            Err(ProviderError::CheckinFailed {
                kind: self.kind,
                id: resource.id.clone(),
            })
        }
    }

    fn return_quietly(&self, resource: &Resource) {
        if let Err(e) = self.evaluate_checkin(resource) {
            warn!("Failed to check in {} '{}': {}", self.kind, resource.id, e);
        }
    }

    fn not_available(&self, reason: String) -> ProviderError {
        ProviderError::NotAvailable {
            kind: self.kind,
            provider: self.id().to_string(),
            reason,
        }
    }
}

fn items(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

fn merge_attributes(resource: &mut Resource, extra: Map<String, Value>) {
    for (key, value) in extra {
        if matches!(key.as_str(), "id" | "provider_id" | "kind") {
            continue;
        }
        resource.attributes.insert(key, value);
    }
}
