//! Execution space provider.
//!
//! Besides whatever its ruleset produces, every execution space carries the
//! instructions an executor needs to start the test runner:
//!
//! ```json
//! "instructions": {
//!   "identifier": "3c1f...",
//!   "image": "registry/runner:1",
//!   "environment": {"SUB_SUITE_URL": "http://provider/sub_suite?id=3c1f...", ...},
//!   "parameters": {}
//! }
//! ```
//!
//! The image is the test runner bound in the dataset as `test_runner`.
//! Environment variables come from the executor configuration, then from
//! any `instructions.environment` the ruleset's checkout rule produced, and
//! finally `SUB_SUITE_URL`, which points at the sub-suite definition.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::info;

use super::{
    CheckoutRequest, ProviderResult, Resource, ResourceKind, ResourceProvider, Ruleset,
    RulesetProvider,
};
use crate::config::ExecutorConfig;
use crate::rules::{Dataset, RuleEvaluator};

/// Location of a sub-suite definition served by the environment provider.
pub fn sub_suite_url(base: &str, identifier: &str) -> String {
    format!("{}/sub_suite?id={}", base.trim_end_matches('/'), identifier)
}

/// The executor identifier of an execution space, if it has instructions.
pub fn instructions_identifier(resource: &Resource) -> Option<&str> {
    resource
        .attribute("instructions")?
        .get("identifier")?
        .as_str()
}

/// Provider of execution spaces.
pub struct ExecutionSpaceProvider {
    inner: RulesetProvider,
    executor: ExecutorConfig,
}

impl ExecutionSpaceProvider {
    pub fn new(ruleset: Ruleset, evaluator: Arc<dyn RuleEvaluator>, executor: ExecutorConfig) -> Self {
        Self {
            inner: RulesetProvider::new(ResourceKind::ExecutionSpace, ruleset, evaluator),
            executor,
        }
    }

    /// Builds the provider from an `{"execution_space": {...}}` document.
    pub fn from_config(
        config: &Value,
        evaluator: Arc<dyn RuleEvaluator>,
        executor: ExecutorConfig,
    ) -> ProviderResult<Self> {
        Ok(Self::new(
            Ruleset::from_config(ResourceKind::ExecutionSpace, config)?,
            evaluator,
            executor,
        ))
    }

    fn attach_instructions(&self, resource: &mut Resource, dataset: &Dataset) {
        let identifier = uuid::Uuid::new_v4().to_string();
        let image = dataset
            .get("test_runner")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut given = match resource.attributes.remove("instructions") {
            Some(Value::Object(given)) => given,
            _ => Map::new(),
        };

        let mut environment: Map<String, Value> = self
            .executor
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        if let Some(Value::Object(overrides)) = given.remove("environment") {
            environment.extend(overrides);
        }
        environment.insert(
            "SUB_SUITE_URL".to_string(),
            Value::String(sub_suite_url(
                &self.executor.environment_provider_url,
                &identifier,
            )),
        );

        let parameters = match given.remove("parameters") {
            Some(Value::Object(parameters)) => Value::Object(parameters),
            _ => json!({}),
        };

        let mut instructions = given;
        instructions.insert("identifier".to_string(), Value::String(identifier));
        instructions
            .entry("image")
            .or_insert_with(|| Value::String(image.to_string()));
        instructions.insert("environment".to_string(), Value::Object(environment));
        instructions.insert("parameters".to_string(), parameters);

        resource
            .attributes
            .insert("instructions".to_string(), Value::Object(instructions));
    }
}

#[async_trait]
impl ResourceProvider for ExecutionSpaceProvider {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::ExecutionSpace
    }

    async fn wait_for_and_checkout(
        &self,
        request: &CheckoutRequest,
        dataset: &Dataset,
    ) -> ProviderResult<Vec<Resource>> {
        let mut spaces = self.inner.wait_for_and_checkout(request, dataset).await?;
        for space in &mut spaces {
            self.attach_instructions(space, dataset);
        }
        info!(
            "Checked out {} execution space(s) from provider '{}'",
            spaces.len(),
            self.id()
        );
        Ok(spaces)
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
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::rules::TemplateEvaluator;
    use crate::wait::RetryPolicy;

    fn executor() -> ExecutorConfig {
        ExecutorConfig {
            environment_provider_url: "http://provider:8080/".to_string(),
            environment: BTreeMap::from([
                ("LOG_LEVEL".to_string(), "info".to_string()),
                ("REGION".to_string(), "eu".to_string()),
            ]),
        }
    }

    #[test]
    fn test_sub_suite_url() {
        assert_eq!(
            sub_suite_url("http://provider:8080/", "abc"),
            "http://provider:8080/sub_suite?id=abc"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_instructions_are_attached() {
        let config = json!({"execution_space": {
            "id": "k8s",
            "list": {"possible": [{"id": "space-1"}]},
            "checkout": {"instructions": {"environment": {"REGION": "us"}, "parameters": {"cpu": "2"}}}
        }});
        let provider =
            ExecutionSpaceProvider::from_config(&config, Arc::new(TemplateEvaluator), executor())
                .unwrap();
        let dataset = Dataset::new().with("test_runner", json!("runner:2"));
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(5));

        let spaces = provider
            .wait_for_and_checkout(&CheckoutRequest::single(policy), &dataset)
            .await
            .unwrap();

        let space = &spaces[0];
        let identifier = instructions_identifier(space).unwrap().to_string();
        let instructions = space.attribute("instructions").unwrap();
        assert_eq!(instructions["image"], "runner:2");
        assert_eq!(instructions["environment"]["LOG_LEVEL"], "info");
        assert_eq!(instructions["environment"]["REGION"], "us");
        assert_eq!(
            instructions["environment"]["SUB_SUITE_URL"],
            json!(format!("http://provider:8080/sub_suite?id={identifier}"))
        );
        assert_eq!(instructions["parameters"]["cpu"], "2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_space_gets_its_own_identifier() {
        let config = json!({"execution_space": {
            "id": "k8s",
            "list": {"possible": {"$expand": {"value": {}, "to": "$amount"}}}
        }});
        let provider =
            ExecutionSpaceProvider::from_config(&config, Arc::new(TemplateEvaluator), executor())
                .unwrap();
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(5));

        let spaces = provider
            .wait_for_and_checkout(&CheckoutRequest::new(3, 3, policy), &Dataset::new())
            .await
            .unwrap();

        let mut ids: Vec<_> = spaces
            .iter()
            .map(|s| instructions_identifier(s).unwrap())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }
}
