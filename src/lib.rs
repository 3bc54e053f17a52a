//! testbed: a test environment provider.
//!
//! Given a testrun (suites of test recipes, each bound to a test runner
//! image), testbed checks out the resources the tests need and splits the
//! recipes across them.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Registry**: Finds, validates and instantiates providers from
//!   configurations kept in a [`ConfigStore`](store::ConfigStore)
//! - **Providers**: Check out IUTs, execution spaces and log areas by
//!   evaluating templated rulesets against a [`Dataset`](rules::Dataset)
//! - **Engine**: The checkout loop, the splitter and the sub-suite records
//! - **Events**: Lifecycle signals and sub-suite announcements
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use testbed::config::load_config;
//! use testbed::engine::CheckoutEngine;
//! use testbed::events::{LogPublisher, StoreMainSuiteSource};
//! use testbed::provider::ProviderSession;
//! use testbed::registry::ProviderRegistry;
//! use testbed::rules::TemplateEvaluator;
//! use testbed::store::FileStore;
//! use testbed::testrun::TestRun;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("testbed.toml"))?;
//!     let testrun = TestRun::load(std::path::Path::new("testrun.json"))?;
//!     let store = Arc::new(FileStore::new("~/.testbed/store"));
//!
//!     let registry = ProviderRegistry::new(
//!         store.clone(),
//!         Arc::new(TemplateEvaluator),
//!         Arc::new(ProviderSession::new()),
//!     )
//!     .with_testrun(&testrun)
//!     .with_executor(config.executor.clone());
//!     let main_suites = StoreMainSuiteSource::new(store, testrun.id.clone().unwrap_or_default());
//!
//!     let engine = CheckoutEngine::new(config.engine, config.executor, registry, LogPublisher, main_suites);
//!     let result = engine.run(&testrun, &[]).await;
//!     println!("{}", serde_json::to_string_pretty(&result)?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod events;
pub mod provider;
pub mod registry;
pub mod rules;
pub mod store;
pub mod testrun;
pub mod wait;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use engine::{CheckoutEngine, CheckoutError, EnvironmentResult, SubSuite, TestSuite};
pub use events::{EventPublisher, MainSuiteSource};
pub use provider::{Resource, ResourceKind, ResourceProvider};
pub use registry::ProviderRegistry;
pub use store::ConfigStore;
pub use testrun::TestRun;
