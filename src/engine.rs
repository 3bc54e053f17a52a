//! The checkout engine.
//!
//! For every suite of a testrun the engine checks out IUTs, execution
//! spaces and log areas, splits the suite's recipes onto them and announces
//! each resulting sub-suite.
//!
//! # Architecture
//!
//! ```text
//!   TestRun                ProviderRegistry              EventPublisher
//!      │                          │                             │
//!      │ run()                    │ wait_for_configuration()    │
//!      ▼                          ▼                             │
//!  per suite ──────────► iut / execution space / log area       │
//!      │                   providers                            │
//!      │ activity triggered/started ───────────────────────────►│
//!      │                                                        │
//!      │ main suite id (MainSuiteSource)                        │
//!      ▼                                                        │
//!  checkout loop:                                               │
//!    IUTs ──► splitter::assign_iuts ──► execution space         │
//!                                       + log area per IUT      │
//!                                            │                  │
//!                                 splitter::split               │
//!                                            │                  │
//!                               TestSuite::add ─ SuiteRecords   │
//!                                            │                  │
//!                                            └── environment ──►│
//!                                                defined        │
//!      │ activity finished ────────────────────────────────────►│
//!      ▼
//!  EnvironmentResult
//! ```
//!
//! # Failure Handling
//!
//! Suites are processed one at a time and the first failing suite aborts
//! the run. On failure every provider registered in the registry's
//! [`ProviderSession`](crate::provider::ProviderSession) checks in all it
//! holds, the message is written to the termination log, and the run
//! returns a failed [`EnvironmentResult`]. Each suite whose activity was
//! triggered gets exactly one "finished" signal.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use testbed::config::Config;
//! use testbed::engine::CheckoutEngine;
//! use testbed::events::{LogPublisher, StoreMainSuiteSource};
//! use testbed::provider::ProviderSession;
//! use testbed::registry::ProviderRegistry;
//! use testbed::rules::TemplateEvaluator;
//! use testbed::store::MemoryStore;
//! use testbed::testrun::TestRun;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let testrun = TestRun::load(std::path::Path::new("testrun.json"))?;
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let registry = ProviderRegistry::new(
//!         store.clone(),
//!         Arc::new(TemplateEvaluator),
//!         Arc::new(ProviderSession::new()),
//!     )
//!     .with_testrun(&testrun);
//!     let main_suites = StoreMainSuiteSource::new(store, testrun.id.clone().unwrap_or_default());
//!
//!     let engine = CheckoutEngine::new(
//!         config.engine,
//!         config.executor,
//!         registry,
//!         LogPublisher,
//!         main_suites,
//!     );
//!     let result = engine.run(&testrun, &["suite-runner-1".to_string()]).await;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod release;
pub mod splitter;
pub mod suite;

pub use release::{ReleaseOutcome, release_environment};
pub use splitter::{Assignment, TestRunnerGroup};
pub use suite::{SubSuite, SuiteRecords, TestSuite};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, ExecutorConfig};
use crate::events::{EventPublisher, MainSuiteSource, Outcome};
use crate::provider::execution_space::sub_suite_url;
use crate::provider::{CheckoutRequest, ProviderError, Resource, ResourceKind, ResourceProvider};
use crate::registry::{ProviderRegistry, RegistryError};
use crate::rules::Dataset;
use crate::store::StoreError;
use crate::testrun::{Suite, TestRun};
use crate::wait::{RetryPolicy, deadline_after};

/// Result type for checkout operations.
pub type CheckoutResult<T> = Result<T, CheckoutError>;

/// Errors that end a checkout.
#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    /// Provider configuration never became available and valid.
    #[error("Providers were not configured within {timeout_secs}s")]
    NotConfigured { timeout_secs: u64 },

    /// The registry has no configuration for a kind.
    #[error("No {0} provider is configured")]
    ProviderUnavailable(ResourceKind),

    #[error("Main suite of suite runner '{suite_runner_id}' not announced within {timeout_secs}s")]
    MainSuiteTimeout {
        suite_runner_id: String,
        timeout_secs: u64,
    },

    #[error("No suite runner id given for test suite '{suite}'")]
    MissingSuiteRunner { suite: String },

    /// The checkout loop ran out of time with recipes left.
    #[error("Timed out after {timeout_secs}s with {remaining} recipe(s) still without an environment")]
    CheckoutTimeout { remaining: usize, timeout_secs: u64 },

    /// A sub-suite was built without all of its resources.
    #[error("Incomplete sub-suite: {0}")]
    Incomplete(String),

    #[error("Sub-suite {name} cannot be serialized: {reason}")]
    Serialization { name: String, reason: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Broad classes of checkout failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Timeout,
    Serialization,
    Provider,
    Store,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Serialization => "serialization",
            ErrorCategory::Provider => "provider",
            ErrorCategory::Store => "store",
        };
        f.write_str(name)
    }
}

impl CheckoutError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CheckoutError::NotConfigured { .. }
            | CheckoutError::ProviderUnavailable(_)
            | CheckoutError::MissingSuiteRunner { .. } => ErrorCategory::Configuration,
            CheckoutError::MainSuiteTimeout { .. } | CheckoutError::CheckoutTimeout { .. } => {
                ErrorCategory::Timeout
            }
            CheckoutError::Incomplete(_) | CheckoutError::Serialization { .. } => {
                ErrorCategory::Serialization
            }
            CheckoutError::Provider(ProviderError::CheckoutTimeout { .. }) => ErrorCategory::Timeout,
            CheckoutError::Provider(ProviderError::InvalidRuleset { .. }) => {
                ErrorCategory::Configuration
            }
            CheckoutError::Provider(_) => ErrorCategory::Provider,
            CheckoutError::Registry(RegistryError::Store(_)) | CheckoutError::Store(_) => {
                ErrorCategory::Store
            }
            CheckoutError::Registry(_) => ErrorCategory::Configuration,
        }
    }
}

/// What a checkout produced.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentResult {
    pub suites: Vec<TestSuite>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl EnvironmentResult {
    pub fn success(suites: Vec<TestSuite>) -> Self {
        Self {
            suites,
            error: None,
            details: None,
        }
    }

    pub fn failure(error: &CheckoutError) -> Self {
        let mut details = format!("{error:?}");
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            details.push_str(&format!("\nCaused by: {cause}"));
            source = cause.source();
        }
        Self {
            suites: Vec::new(),
            error: Some(error.to_string()),
            details: Some(details),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }
}

/// The three providers a checkout draws from.
#[derive(Clone)]
pub struct ProviderSet {
    pub iut: Arc<dyn ResourceProvider>,
    pub execution_space: Arc<dyn ResourceProvider>,
    pub log_area: Arc<dyn ResourceProvider>,
}

impl ProviderSet {
    pub fn all(&self) -> [&Arc<dyn ResourceProvider>; 3] {
        [&self.iut, &self.execution_space, &self.log_area]
    }
}

/// Checks out environments for the suites of one testrun.
///
/// An engine is scoped to a single testrun: its registry, and with it the
/// cleanup session, must not be shared with another one.
pub struct CheckoutEngine<P, M> {
    config: EngineConfig,
    executor: ExecutorConfig,
    registry: ProviderRegistry,
    publisher: P,
    main_suites: M,
    providers: Option<ProviderSet>,
    testrun_id: Option<String>,
}

impl<P, M> CheckoutEngine<P, M>
where
    P: EventPublisher,
    M: MainSuiteSource,
{
    /// Creates an engine that resolves its providers through `registry`.
    ///
    /// # Arguments
    ///
    /// * `config` - Timeouts, poll intervals and the parallelism cap
    /// * `executor` - Where executors fetch their sub-suites from
    /// * `registry` - Provider registry scoped to the testrun
    /// * `publisher` - Receives lifecycle signals and announcements
    /// * `main_suites` - Where main suite ids are announced
    pub fn new(
        config: EngineConfig,
        executor: ExecutorConfig,
        registry: ProviderRegistry,
        publisher: P,
        main_suites: M,
    ) -> Self {
        Self {
            config,
            executor,
            registry,
            publisher,
            main_suites,
            providers: None,
            testrun_id: None,
        }
    }

    /// Keeps checkout records under `id` instead of the testrun's own id.
    ///
    /// Callers that generate an id for a testrun without one use this so the
    /// records end up next to the main suite ids they wait for.
    pub fn with_testrun_id(mut self, id: impl Into<String>) -> Self {
        self.testrun_id = Some(id.into());
        self
    }

    /// Uses `providers` instead of resolving them from the registry.
    ///
    /// They are registered in the registry's session, so a failed checkout
    /// still checks them in.
    pub async fn with_providers(mut self, providers: ProviderSet) -> Self {
        for provider in providers.all() {
            self.registry.session().register(provider.clone()).await;
        }
        self.providers = Some(providers);
        self
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Checks out environments for every suite of `testrun`.
    ///
    /// `suite_runner_ids` holds one id per suite, in suite order. Never
    /// fails; a failure is reported in the returned result after cleanup.
    pub async fn run(&self, testrun: &TestRun, suite_runner_ids: &[String]) -> EnvironmentResult {
        info!(
            "Checking out environments for {} suite(s) with {} recipe(s)",
            testrun.suites.len(),
            testrun.total_recipes()
        );

        match self.run_suites(testrun, suite_runner_ids).await {
            Ok(suites) => {
                let sub_suites: usize = suites.iter().map(|s| s.sub_suites.len()).sum();
                info!("Checkout complete: {} sub-suite(s)", sub_suites);
                EnvironmentResult::success(suites)
            }
            Err(e) => {
                error!("Checkout failed ({}): {}", e.category(), e);
                self.registry.session().checkin_all().await;
                self.write_termination_log(&e).await;
                EnvironmentResult::failure(&e)
            }
        }
    }

    async fn run_suites(
        &self,
        testrun: &TestRun,
        suite_runner_ids: &[String],
    ) -> CheckoutResult<Vec<TestSuite>> {
        if self.providers.is_none() {
            let policy = RetryPolicy::new(
                self.config.poll_interval(),
                Duration::from_secs(self.config.event_data_timeout_secs),
            );
            if !self.registry.wait_for_configuration(policy).await {
                return Err(CheckoutError::NotConfigured {
                    timeout_secs: self.config.event_data_timeout_secs,
                });
            }
        }

        let datasets = self.registry.datasets_for(testrun.suites.len()).await?;
        let testrun_id = self
            .testrun_id
            .clone()
            .or_else(|| testrun.id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let records = SuiteRecords::new(self.registry.store().clone(), testrun_id);

        let mut test_suites = Vec::with_capacity(testrun.suites.len());
        for (index, (suite, dataset)) in testrun.suites.iter().zip(datasets).enumerate() {
            let suite_runner_id = suite_runner_ids.get(index).map(String::as_str);
            let test_suite = self
                .checkout_test_suite(testrun, suite, dataset, suite_runner_id, &records)
                .await?;
            test_suites.push(test_suite);
        }
        Ok(test_suites)
    }

    /// Runs one suite inside its own activity.
    async fn checkout_test_suite(
        &self,
        testrun: &TestRun,
        suite: &Suite,
        dataset: Map<String, Value>,
        suite_runner_id: Option<&str>,
        records: &SuiteRecords,
    ) -> CheckoutResult<TestSuite> {
        let activity_id = uuid::Uuid::new_v4().to_string();
        self.publisher
            .activity_triggered(
                &activity_id,
                &format!("Checkout environment for {}", suite.name),
            )
            .await;
        self.publisher.activity_started(&activity_id).await;

        let result = self
            .build_test_suite(testrun, suite, dataset, suite_runner_id, records)
            .await;

        let outcome = match &result {
            Ok(_) => Outcome::Successful,
            Err(e) => Outcome::unsuccessful(e.to_string()),
        };
        self.publisher
            .activity_finished(&activity_id, &outcome)
            .await;
        result
    }

    async fn build_test_suite(
        &self,
        testrun: &TestRun,
        suite: &Suite,
        dataset: Map<String, Value>,
        suite_runner_id: Option<&str>,
        records: &SuiteRecords,
    ) -> CheckoutResult<TestSuite> {
        let test_suite_started_id = self.main_suite_id(suite, suite_runner_id).await?;
        let providers = self.providers().await?;

        let dataset = base_dataset(testrun, dataset)
            .with_serialized("suite", suite)
            .map_err(ProviderError::from)?;

        let mut test_suite = TestSuite::new(&suite.name, test_suite_started_id);
        let groups = splitter::groups_from_suite(suite);
        self.checkout_suite(&providers, groups, &dataset, &mut test_suite, records)
            .await?;

        records.record_test_suite(&test_suite).await?;
        Ok(test_suite)
    }

    /// The test-suite-started id the suite's sub-suites are reported under.
    async fn main_suite_id(
        &self,
        suite: &Suite,
        suite_runner_id: Option<&str>,
    ) -> CheckoutResult<String> {
        if self.config.controller {
            return Ok(suite_runner_id
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()));
        }

        let runner = suite_runner_id.ok_or_else(|| CheckoutError::MissingSuiteRunner {
            suite: suite.name.clone(),
        })?;
        let policy = RetryPolicy::new(
            Duration::from_secs(self.config.main_suite_poll_secs),
            Duration::from_secs(self.config.main_suite_timeout_secs),
        );
        let source = &self.main_suites;
        policy
            .wait_for("main suite", move || source.main_suite_id(runner))
            .await
            .ok_or_else(|| CheckoutError::MainSuiteTimeout {
                suite_runner_id: runner.to_string(),
                timeout_secs: self.config.main_suite_timeout_secs,
            })
    }

    async fn providers(&self) -> CheckoutResult<ProviderSet> {
        if let Some(providers) = &self.providers {
            return Ok(providers.clone());
        }
        let get = |kind: ResourceKind| async move {
            self.registry
                .provider(kind)
                .await?
                .ok_or(CheckoutError::ProviderUnavailable(kind))
        };
        Ok(ProviderSet {
            iut: get(ResourceKind::Iut).await?,
            execution_space: get(ResourceKind::ExecutionSpace).await?,
            log_area: get(ResourceKind::LogArea).await?,
        })
    }

    /// The checkout loop of one suite.
    ///
    /// Every iteration checks out as many IUTs as there are recipes left
    /// (capped by `max_parallel_iuts`), hands them to the groups, binds an
    /// execution space and a log area to each new IUT, and turns every
    /// group that got IUTs into sub-suites. Groups without IUTs wait for the
    /// next iteration; the loop gives up once the checkout deadline passes.
    async fn checkout_suite(
        &self,
        providers: &ProviderSet,
        mut groups: Vec<TestRunnerGroup>,
        dataset: &Dataset,
        test_suite: &mut TestSuite,
        records: &SuiteRecords,
    ) -> CheckoutResult<()> {
        let timeout = self.config.checkout_deadline();
        let deadline = deadline_after(timeout);
        let poll = self.config.poll_interval();
        let iut_policy = RetryPolicy::new(
            poll,
            Duration::from_secs(self.config.wait_for_iut_timeout_secs),
        );
        let execution_space_policy = RetryPolicy::new(
            poll,
            Duration::from_secs(self.config.wait_for_execution_space_timeout_secs),
        );
        let log_area_policy = RetryPolicy::new(
            poll,
            Duration::from_secs(self.config.wait_for_log_area_timeout_secs),
        );

        groups.retain(|g| !g.unsplit_recipes.is_empty());
        let mut iteration = 0usize;
        while !groups.is_empty() {
            iteration += 1;
            let remaining: usize = groups.iter().map(|g| g.unsplit_recipes.len()).sum();
            let maximum = match self.config.max_parallel_iuts {
                Some(cap) => remaining.min(cap.max(1)),
                None => remaining,
            };
            debug!(
                "Checkout iteration {}: {} recipe(s) in {} group(s), requesting up to {} IUT(s)",
                iteration,
                remaining,
                groups.len(),
                maximum
            );
            let dataset = dataset
                .with("total_test_count", json!(remaining))
                .with("number_of_test_runners", json!(groups.len()));

            let request = CheckoutRequest::new(1, maximum, iut_policy.capped_at(deadline));
            let iuts = match providers.iut.wait_for_and_checkout(&request, &dataset).await {
                Ok(iuts) => iuts,
                Err(e) if e.is_retryable() => {
                    debug!("No IUTs this iteration: {}", e);
                    Vec::new()
                }
                Err(e) => return Err(e.into()),
            };

            for iut in splitter::assign_iuts(&mut groups, iuts) {
                if let Err(e) = providers.iut.checkin(&iut).await {
                    warn!("Failed to check in unused IUT {}: {}", iut.id, e);
                }
            }

            for group in groups.iter_mut().filter(|g| !g.assignments.is_empty()) {
                let dataset = dataset.with("test_runner", json!(group.test_runner));
                for assignment in &mut group.assignments {
                    let dataset = dataset.with("iut", assignment.iut.to_value()).with(
                        "suite",
                        json!({
                            "name": test_suite.name,
                            "test_runner": group.test_runner,
                            "priority": group.priority,
                            "iut": assignment.iut.to_value(),
                            "recipes": assignment.recipes,
                        }),
                    );
                    let executor = checkout_one(
                        providers.execution_space.as_ref(),
                        execution_space_policy.capped_at(deadline),
                        &dataset,
                    )
                    .await?;
                    let dataset = dataset.with("executor", executor.to_value());
                    let log_area = checkout_one(
                        providers.log_area.as_ref(),
                        log_area_policy.capped_at(deadline),
                        &dataset,
                    )
                    .await?;
                    assignment.executor = Some(executor);
                    assignment.log_area = Some(log_area);
                }

                splitter::split(group);
                for assignment in std::mem::take(&mut group.assignments) {
                    let sub_suite = test_suite.add(&group.test_runner, group.priority, assignment)?;
                    records.record_sub_suite(sub_suite).await?;
                    let uri = sub_suite_url(
                        &self.executor.environment_provider_url,
                        &sub_suite.sub_suite_id,
                    );
                    info!(
                        "Sub-suite {} ready with {} recipe(s)",
                        sub_suite.name,
                        sub_suite.recipes.len()
                    );
                    self.publisher.environment_defined(&uri, sub_suite).await;
                }
            }

            groups.retain(|g| !g.unsplit_recipes.is_empty());
            if groups.is_empty() {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CheckoutError::CheckoutTimeout {
                    remaining: groups.iter().map(|g| g.unsplit_recipes.len()).sum(),
                    timeout_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
        Ok(())
    }

    async fn write_termination_log(&self, error: &CheckoutError) {
        let path = &self.config.termination_log;
        if path.is_empty() {
            return;
        }
        if let Err(e) = tokio::fs::write(path, error.to_string()).await {
            warn!("Failed to write termination log {}: {}", path, e);
        }
    }
}

/// The context every provider rule of a testrun is evaluated against.
///
/// Process environment and testrun metadata come first; the stored dataset
/// is bound whole as `dataset` and its members are merged on top.
fn base_dataset(testrun: &TestRun, stored: Map<String, Value>) -> Dataset {
    let environment: Map<String, Value> = std::env::vars()
        .map(|(key, value)| (key, Value::String(value)))
        .collect();
    Dataset::new()
        .with("environment", Value::Object(environment))
        .with("identity", json!(testrun.identity))
        .with("artifact_id", json!(testrun.artifact))
        .with("custom_data", Value::Object(testrun.custom_data.clone()))
        .with("uuid", json!(uuid::Uuid::new_v4().to_string()))
        .with("dataset", Value::Object(stored.clone()))
        .merged(&stored)
}

/// Checks out exactly one resource.
async fn checkout_one(
    provider: &dyn ResourceProvider,
    policy: RetryPolicy,
    dataset: &Dataset,
) -> CheckoutResult<Resource> {
    provider
        .wait_for_and_checkout(&CheckoutRequest::single(policy), dataset)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| {
            CheckoutError::Incomplete(format!(
                "{} provider '{}' returned nothing",
                provider.kind(),
                provider.id()
            ))
        })
}
