//! IUT provider.
//!
//! Items under test are listed from the `iut` ruleset. Before an IUT is
//! handed out its optional `prepare` rule runs with the IUT bound as `iut`;
//! IUTs that fail preparation are checked in again and never reach the
//! caller.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{
    CheckoutRequest, ProviderResult, Resource, ResourceKind, ResourceProvider, Ruleset,
    RulesetProvider,
};
use crate::rules::{Dataset, RuleEvaluator};

/// Provider of items under test.
pub struct IutProvider {
    inner: RulesetProvider,
}

impl IutProvider {
    pub fn new(ruleset: Ruleset, evaluator: Arc<dyn RuleEvaluator>) -> Self {
        Self {
            inner: RulesetProvider::new(ResourceKind::Iut, ruleset, evaluator),
        }
    }

    /// Builds the provider from an `{"iut": {...}}` document.
    pub fn from_config(config: &Value, evaluator: Arc<dyn RuleEvaluator>) -> ProviderResult<Self> {
        Ok(Self::new(
            Ruleset::from_config(ResourceKind::Iut, config)?,
            evaluator,
        ))
    }
}

#[async_trait]
impl ResourceProvider for IutProvider {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Iut
    }

    async fn wait_for_and_checkout(
        &self,
        request: &CheckoutRequest,
        dataset: &Dataset,
    ) -> ProviderResult<Vec<Resource>> {
        let iuts = self.inner.wait_for_and_checkout(request, dataset).await?;
        info!(
            "Checked out {} IUT(s) from provider '{}' (requested {}..={})",
            iuts.len(),
            self.id(),
            request.minimum,
            request.maximum
        );
        Ok(iuts)
    }

    async fn checkin(&self, resource: &Resource) -> ProviderResult<()> {
        self.inner.checkin(resource).await
    }

    async fn checkin_all(&self) {
        self.inner.checkin_all().await
    }

    async fn checked_out(&self) -> Vec<Resource> {
        self.inner.checked_out().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::rules::TemplateEvaluator;
    use crate::wait::RetryPolicy;

    #[tokio::test(start_paused = true)]
    async fn test_identity_drives_listing() {
        let config = json!({"iut": {
            "id": "default",
            "list": {
                "possible": {"$expand": {"value": {"identity": "$identity"}, "to": "$amount"}},
                "available": "$this.possible"
            }
        }});
        let provider = IutProvider::from_config(&config, Arc::new(TemplateEvaluator)).unwrap();
        let dataset = Dataset::new().with("identity", json!("pkg:testrun/product@1.0"));
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(5));

        let iuts = provider
            .wait_for_and_checkout(&CheckoutRequest::new(1, 2, policy), &dataset)
            .await
            .unwrap();

        assert_eq!(iuts.len(), 2);
        assert_ne!(iuts[0].id, iuts[1].id);
        assert_eq!(iuts[0].kind, ResourceKind::Iut);
        assert_eq!(
            iuts[0].attribute("identity"),
            Some(&json!("pkg:testrun/product@1.0"))
        );
    }
}
