//! Provider registry: finds, validates and instantiates resource providers.
//!
//! Provider configurations are looked up in the [`ConfigStore`]:
//!
//! | Scope | Path |
//! |-------|------|
//! | Testrun | `/testrun/{id}/provider/{iut\|execution-space\|log-area}` |
//! | Global | `/environment/provider/{kind}/{provider-id}` |
//!
//! A testrun with an id only ever uses its own configurations. Without an
//! id the global configuration with exactly the requested provider id is
//! used.
//!
//! Every configuration is validated against the fixed schema for its kind
//! (see [`schema`]) before a provider is built from it. Providers are
//! created at most once per registry and registered in the registry's
//! [`ProviderSession`] so that a failed checkout can check everything in.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use testbed::provider::{ProviderSession, ResourceKind};
//! use testbed::registry::ProviderRegistry;
//! use testbed::rules::TemplateEvaluator;
//! use testbed::store::MemoryStore;
//!
//! # tokio_test::block_on(async {
//! let registry = ProviderRegistry::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(TemplateEvaluator),
//!     Arc::new(ProviderSession::new()),
//! );
//! let config = json!({"log": {"id": "default", "list": {"possible": [{}], "available": []}}});
//! registry.register(ResourceKind::LogArea, &config).await.unwrap();
//! assert!(registry.log_area_provider().await.unwrap().is_some());
//! # });
//! ```

pub mod schema;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::provider::{
    ExecutionSpaceProvider, IutProvider, LogAreaProvider, ProviderError, ProviderSession,
    ResourceKind, ResourceProvider,
};
use crate::rules::RuleEvaluator;
use crate::store::{ConfigStore, StoreError, StorePath};
use crate::testrun::{ProviderIds, TestRun};
use crate::wait::RetryPolicy;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors raised while resolving or registering provider configurations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The configuration does not satisfy the schema for its kind.
    #[error("Invalid {kind} provider configuration: {reason}")]
    Validation { kind: ResourceKind, reason: String },

    /// The stored configuration is not JSON at all.
    #[error("Configuration at {path} is not valid JSON: {source}")]
    InvalidJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    UnknownKind(String),

    /// A list of datasets that does not line up with the test suites.
    #[error("Got {datasets} dataset(s) for {suites} test suite(s)")]
    DatasetMismatch { datasets: usize, suites: usize },

    /// A dataset that is neither an object nor a list of objects.
    #[error("Invalid dataset: {0}")]
    InvalidDataset(String),

    /// Datasets are always stored per testrun.
    #[error("A testrun id is required to register a dataset")]
    NoTestrun,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// The dataset stored for a testrun.
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetEntry {
    /// One dataset, shared by every test suite.
    Single(Map<String, Value>),
    /// One dataset per test suite, in suite order.
    PerSuite(Vec<Map<String, Value>>),
}

impl DatasetEntry {
    fn from_value(value: Value) -> RegistryResult<Self> {
        match value {
            Value::Object(map) => Ok(DatasetEntry::Single(map)),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(map) => Ok(map),
                    other => Err(RegistryError::InvalidDataset(format!(
                        "entries must be objects, got {other}"
                    ))),
                })
                .collect::<RegistryResult<Vec<_>>>()
                .map(DatasetEntry::PerSuite),
            other => Err(RegistryError::InvalidDataset(format!(
                "expected an object or a list of objects, got {other}"
            ))),
        }
    }
}

/// Resolves and instantiates the providers of one testrun.
pub struct ProviderRegistry {
    store: Arc<dyn ConfigStore>,
    evaluator: Arc<dyn RuleEvaluator>,
    session: Arc<ProviderSession>,
    testrun_id: Option<String>,
    provider_ids: ProviderIds,
    executor: ExecutorConfig,
    instances: Mutex<HashMap<ResourceKind, Arc<dyn ResourceProvider>>>,
}

impl ProviderRegistry {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        evaluator: Arc<dyn RuleEvaluator>,
        session: Arc<ProviderSession>,
    ) -> Self {
        Self {
            store,
            evaluator,
            session,
            testrun_id: None,
            provider_ids: ProviderIds::default(),
            executor: ExecutorConfig::default(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Scopes the registry to a testrun: its id and requested provider ids.
    pub fn with_testrun(mut self, testrun: &TestRun) -> Self {
        self.testrun_id = testrun.id.clone();
        self.provider_ids = testrun.providers.clone();
        self
    }

    pub fn with_testrun_id(mut self, id: impl Into<String>) -> Self {
        self.testrun_id = Some(id.into());
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn session(&self) -> &Arc<ProviderSession> {
        &self.session
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn testrun_id(&self) -> Option<&str> {
        self.testrun_id.as_deref()
    }

    fn requested_id(&self, kind: ResourceKind) -> &str {
        match kind {
            ResourceKind::Iut => &self.provider_ids.iut,
            ResourceKind::ExecutionSpace => &self.provider_ids.execution_space,
            ResourceKind::LogArea => &self.provider_ids.log_area,
        }
    }

    /// Where the configuration for `kind` is looked up.
    pub fn provider_path(&self, kind: ResourceKind) -> StorePath {
        match &self.testrun_id {
            Some(id) => StorePath::testrun(id)
                .join("provider")
                .join(kind.path_segment()),
            None => global_path(kind, self.requested_id(kind)),
        }
    }

    /// Reads, parses and validates the configuration for `kind`.
    ///
    /// Returns `Ok(None)` when nothing is stored.
    pub async fn resolve(&self, kind: ResourceKind) -> RegistryResult<Option<Value>> {
        self.load(kind, &self.provider_path(kind)).await
    }

    async fn load(&self, kind: ResourceKind, path: &StorePath) -> RegistryResult<Option<Value>> {
        let Some(bytes) = self.store.read(path).await? else {
            return Ok(None);
        };
        let config: Value =
            serde_json::from_slice(&bytes).map_err(|source| RegistryError::InvalidJson {
                path: path.to_string(),
                source,
            })?;
        schema::validate(kind, &config)?;
        Ok(Some(config))
    }

    /// Whether all three provider kinds are present and valid.
    pub async fn is_configured(&self) -> bool {
        for kind in ResourceKind::ALL {
            match self.resolve(kind).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!("No {} provider at {}", kind, self.provider_path(kind));
                    return false;
                }
                Err(e) => {
                    warn!("Ignoring {} provider configuration: {}", kind, e);
                    return false;
                }
            }
        }
        true
    }

    /// Polls until [`is_configured`](Self::is_configured) holds or the
    /// policy's timeout elapses.
    pub async fn wait_for_configuration(&self, policy: RetryPolicy) -> bool {
        policy
            .wait_for("provider configuration", || async {
                self.is_configured().await.then_some(())
            })
            .await
            .is_some()
    }

    pub async fn iut_provider(&self) -> RegistryResult<Option<Arc<dyn ResourceProvider>>> {
        self.provider(ResourceKind::Iut).await
    }

    pub async fn execution_space_provider(
        &self,
    ) -> RegistryResult<Option<Arc<dyn ResourceProvider>>> {
        self.provider(ResourceKind::ExecutionSpace).await
    }

    pub async fn log_area_provider(&self) -> RegistryResult<Option<Arc<dyn ResourceProvider>>> {
        self.provider(ResourceKind::LogArea).await
    }

    /// The provider for `kind`, instantiated on first use.
    ///
    /// `Ok(None)` means no configuration exists, which callers must treat
    /// as "provider unavailable".
    pub async fn provider(
        &self,
        kind: ResourceKind,
    ) -> RegistryResult<Option<Arc<dyn ResourceProvider>>> {
        let mut instances = self.instances.lock().await;
        if let Some(provider) = instances.get(&kind) {
            return Ok(Some(provider.clone()));
        }
        let Some(config) = self.resolve(kind).await? else {
            return Ok(None);
        };

        let provider = self.instantiate(kind, &config)?;
        info!("Using {} provider '{}'", kind, provider.id());
        self.session.register(provider.clone()).await;
        instances.insert(kind, provider.clone());
        Ok(Some(provider))
    }

    /// A provider built from the global configuration with id `id`.
    ///
    /// Used to return resources whose original provider is gone; the
    /// instance is neither cached nor registered for cleanup.
    pub async fn provider_by_id(
        &self,
        kind: ResourceKind,
        id: &str,
    ) -> RegistryResult<Option<Arc<dyn ResourceProvider>>> {
        let mut candidates = Vec::new();
        if self.testrun_id.is_some() {
            candidates.push(self.provider_path(kind));
        }
        candidates.push(global_path(kind, id));

        for path in candidates {
            if let Some(config) = self.load(kind, &path).await?
                && config[kind.config_key()]["id"] == id
            {
                return Ok(Some(self.instantiate(kind, &config)?));
            }
        }
        Ok(None)
    }

    fn instantiate(
        &self,
        kind: ResourceKind,
        config: &Value,
    ) -> RegistryResult<Arc<dyn ResourceProvider>> {
        let evaluator = self.evaluator.clone();
        let provider: Arc<dyn ResourceProvider> = match kind {
            ResourceKind::Iut => Arc::new(IutProvider::from_config(config, evaluator)?),
            ResourceKind::ExecutionSpace => Arc::new(ExecutionSpaceProvider::from_config(
                config,
                evaluator,
                self.executor.clone(),
            )?),
            ResourceKind::LogArea => Arc::new(LogAreaProvider::from_config(config, evaluator)?),
        };
        Ok(provider)
    }

    /// Validates and stores a provider configuration.
    ///
    /// With a testrun id it becomes that testrun's provider; otherwise it is
    /// stored globally under its own `id`.
    pub async fn register(&self, kind: ResourceKind, config: &Value) -> RegistryResult<StorePath> {
        schema::validate(kind, config)?;
        let path = match &self.testrun_id {
            Some(_) => self.provider_path(kind),
            None => {
                let id = config[kind.config_key()]["id"].as_str().unwrap_or_default();
                global_path(kind, id)
            }
        };

        let bytes = serde_json::to_vec(config).map_err(|source| RegistryError::InvalidJson {
            path: path.to_string(),
            source,
        })?;
        self.store.write(&path, &bytes).await?;
        info!("Registered {} provider at {}", kind, path);
        Ok(path)
    }

    /// Registers a configuration given as a kind name (`iut`,
    /// `execution-space`, `log-area`).
    pub async fn register_named(&self, kind: &str, config: &Value) -> RegistryResult<StorePath> {
        let kind: ResourceKind = kind.parse().map_err(RegistryError::UnknownKind)?;
        self.register(kind, config).await
    }

    /// Stores the dataset of the current testrun.
    pub async fn register_dataset(&self, dataset: &Value) -> RegistryResult<StorePath> {
        let id = self.testrun_id.as_deref().ok_or(RegistryError::NoTestrun)?;
        DatasetEntry::from_value(dataset.clone())?;
        let path = dataset_path(id);
        let bytes = serde_json::to_vec(dataset).map_err(|source| RegistryError::InvalidJson {
            path: path.to_string(),
            source,
        })?;
        self.store.write(&path, &bytes).await?;
        info!("Registered dataset at {}", path);
        Ok(path)
    }

    /// The dataset stored for the current testrun, if any.
    pub async fn dataset(&self) -> RegistryResult<Option<DatasetEntry>> {
        let Some(id) = &self.testrun_id else {
            return Ok(None);
        };
        let path = dataset_path(id);
        let Some(bytes) = self.store.read(&path).await? else {
            return Ok(None);
        };
        let value: Value =
            serde_json::from_slice(&bytes).map_err(|source| RegistryError::InvalidJson {
                path: path.to_string(),
                source,
            })?;
        DatasetEntry::from_value(value).map(Some)
    }

    /// One dataset per test suite.
    ///
    /// A single dataset is shared by every suite; a list must have exactly
    /// one entry per suite. Without a dataset every suite gets an empty one.
    pub async fn datasets_for(&self, suites: usize) -> RegistryResult<Vec<Map<String, Value>>> {
        match self.dataset().await? {
            None => Ok(vec![Map::new(); suites]),
            Some(DatasetEntry::Single(dataset)) => Ok(vec![dataset; suites]),
            Some(DatasetEntry::PerSuite(datasets)) if datasets.len() == suites => Ok(datasets),
            Some(DatasetEntry::PerSuite(datasets)) => Err(RegistryError::DatasetMismatch {
                datasets: datasets.len(),
                suites,
            }),
        }
    }

    /// Forgets cached providers and empties the cleanup session.
    pub async fn reset(&self) {
        self.instances.lock().await.clear();
        self.session.reset().await;
    }
}

fn global_path(kind: ResourceKind, id: &str) -> StorePath {
    StorePath::environment_providers()
        .join(kind.path_segment())
        .join(id)
}

fn dataset_path(testrun_id: &str) -> StorePath {
    StorePath::testrun(testrun_id)
        .join("provider")
        .join("dataset")
}
