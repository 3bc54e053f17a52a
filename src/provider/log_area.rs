//! Log area provider.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{
    CheckoutRequest, ProviderResult, Resource, ResourceKind, ResourceProvider, Ruleset,
    RulesetProvider,
};
use crate::rules::{Dataset, RuleEvaluator};

/// Provider of log areas, the upload locations for test artifacts.
pub struct LogAreaProvider {
    inner: RulesetProvider,
}

impl LogAreaProvider {
    pub fn new(ruleset: Ruleset, evaluator: Arc<dyn RuleEvaluator>) -> Self {
        Self {
            inner: RulesetProvider::new(ResourceKind::LogArea, ruleset, evaluator),
        }
    }

    /// Builds the provider from a `{"log": {...}}` document.
    pub fn from_config(config: &Value, evaluator: Arc<dyn RuleEvaluator>) -> ProviderResult<Self> {
        Ok(Self::new(
            Ruleset::from_config(ResourceKind::LogArea, config)?,
            evaluator,
        ))
    }
}

#[async_trait]
impl ResourceProvider for LogAreaProvider {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::LogArea
    }

    async fn wait_for_and_checkout(
        &self,
        request: &CheckoutRequest,
        dataset: &Dataset,
    ) -> ProviderResult<Vec<Resource>> {
        let areas = self.inner.wait_for_and_checkout(request, dataset).await?;
        info!(
            "Checked out {} log area(s) from provider '{}'",
            areas.len(),
            self.id()
        );
        Ok(areas)
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
    async fn test_upload_location_uses_bound_suite() {
        let config = json!({"log": {
            "id": "s3",
            "list": {"possible": [{"upload": {"url": "https://logs/${suite.name}"}}]}
        }});
        let provider = LogAreaProvider::from_config(&config, Arc::new(TemplateEvaluator)).unwrap();
        let dataset = Dataset::new().with("suite", json!({"name": "smoke"}));
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(5));

        let areas = provider
            .wait_for_and_checkout(&CheckoutRequest::single(policy), &dataset)
            .await
            .unwrap();

        assert_eq!(areas[0].attribute("upload").unwrap()["url"], "https://logs/smoke");
        provider.checkin_all().await;
        assert!(provider.checked_out().await.is_empty());
    }
}
