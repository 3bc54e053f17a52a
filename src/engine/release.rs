//! Releasing a checked-out environment.
//!
//! Once a testrun is done, every resource recorded for it goes back to the
//! provider it came from. Providers are looked up by the resource's
//! `provider_id`, so a release works from a fresh process that never saw
//! the checkout.

use tracing::{info, warn};

use super::suite::{SubSuite, SuiteRecords};
use crate::provider::Resource;
use crate::registry::{ProviderRegistry, RegistryResult};

/// What a release achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Sub-suites whose resources were all checked in.
    pub released: usize,
    /// One message per resource that could not be checked in.
    pub failures: Vec<String>,
}

impl ReleaseOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// The failure reported to the caller when several occurred.
    pub fn last_failure(&self) -> Option<&str> {
        self.failures.last().map(String::as_str)
    }
}

/// Checks in the resources of every recorded test suite and forgets them.
///
/// A resource that cannot be checked in does not stop the release; it is
/// reported in the outcome. Records are deleted either way, since a second
/// release would fail the same way.
pub async fn release_environment(
    registry: &ProviderRegistry,
    records: &SuiteRecords,
) -> RegistryResult<ReleaseOutcome> {
    let suites = records.test_suites().await?;
    info!(
        "Releasing {} test suite(s) of testrun {}",
        suites.len(),
        records.testrun_id()
    );

    let mut outcome = ReleaseOutcome::default();
    for suite in &suites {
        for sub_suite in &suite.sub_suites {
            let failures = release_sub_suite(registry, sub_suite).await;
            if failures.is_empty() {
                outcome.released += 1;
            }
            outcome.failures.extend(failures);
        }
        records.forget(suite).await?;
    }
    Ok(outcome)
}

/// Checks in the IUT, log area and execution space of one sub-suite.
pub async fn release_sub_suite(registry: &ProviderRegistry, sub_suite: &SubSuite) -> Vec<String> {
    let mut failures = Vec::new();
    for resource in [&sub_suite.iut, &sub_suite.log_area, &sub_suite.executor] {
        if let Err(reason) = checkin(registry, resource).await {
            warn!("Releasing {}: {}", sub_suite.name, reason);
            failures.push(reason);
        }
    }
    failures
}

async fn checkin(registry: &ProviderRegistry, resource: &Resource) -> Result<(), String> {
    let provider = registry
        .provider_by_id(resource.kind, &resource.provider_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| {
            format!(
                "No {} provider '{}' to check '{}' in to",
                resource.kind, resource.provider_id, resource.id
            )
        })?;
    provider.checkin(resource).await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::engine::suite::TestSuite;
    use crate::engine::suite::fixtures::assignment;
    use crate::provider::{ProviderSession, ResourceKind};
    use crate::registry::fixtures::config;
    use crate::rules::TemplateEvaluator;
    use crate::store::MemoryStore;

    fn registry(store: Arc<MemoryStore>) -> ProviderRegistry {
        ProviderRegistry::new(
            store,
            Arc::new(TemplateEvaluator),
            Arc::new(ProviderSession::new()),
        )
    }

    async fn recorded(store: Arc<MemoryStore>, sub_suites: usize) -> SuiteRecords {
        let records = SuiteRecords::new(store, "run-1");
        let mut suite = TestSuite::new("smoke", "tss-1");
        for n in 0..sub_suites {
            let sub_suite = suite.add("runner:1", 1, assignment(n, 1)).unwrap().clone();
            records.record_sub_suite(&sub_suite).await.unwrap();
        }
        records.record_test_suite(&suite).await.unwrap();
        records
    }

    #[tokio::test]
    async fn test_release_checks_in_and_forgets() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        registry.register(ResourceKind::Iut, &config(ResourceKind::Iut, "lab", 1)).await.unwrap();
        registry
            .register(ResourceKind::ExecutionSpace, &config(ResourceKind::ExecutionSpace, "k8s", 1))
            .await
            .unwrap();
        registry
            .register(ResourceKind::LogArea, &config(ResourceKind::LogArea, "s3", 1))
            .await
            .unwrap();
        let records = recorded(store.clone(), 2).await;

        let outcome = release_environment(&registry, &records).await.unwrap();
        assert!(outcome.is_success(), "{:?}", outcome.failures);
        assert_eq!(outcome.released, 2);
        assert!(records.test_suites().await.unwrap().is_empty());
        assert!(records.load_sub_suite("sub-0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_reports_failures() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        registry.register(ResourceKind::Iut, &config(ResourceKind::Iut, "lab", 1)).await.unwrap();
        registry
            .register(
                ResourceKind::LogArea,
                &json!({"log": {"id": "s3", "list": {"possible": [], "available": []}, "checkin": false}}),
            )
            .await
            .unwrap();
        let records = recorded(store.clone(), 1).await;

        let outcome = release_environment(&registry, &records).await.unwrap();
        assert!(!outcome.is_success());
        assert_eq!(outcome.released, 0);
        assert_eq!(outcome.failures.len(), 2);
        assert!(outcome.failures[0].contains("logs-0"), "{:?}", outcome.failures);
        assert!(outcome.last_failure().unwrap().contains("'k8s'"));
        assert!(records.test_suites().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_without_records() {
        let store = Arc::new(MemoryStore::new());
        let records = SuiteRecords::new(store.clone(), "run-1");
        let outcome = release_environment(&registry(store), &records).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::default());
    }
}
