//! Lifecycle signals and sub-suite announcements.
//!
//! The checkout engine reports what it does through an [`EventPublisher`]:
//! one activity per test suite (triggered, started, finished) and one
//! "environment defined" announcement per sub-suite. Before checking out
//! resources for a suite it waits for the suite runner's main suite to be
//! announced, which it learns from a [`MainSuiteSource`].

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info};

use crate::engine::SubSuite;
use crate::store::{ConfigStore, StorePath};

/// How an activity ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "conclusion", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Successful,
    Unsuccessful { description: String },
}

impl Outcome {
    pub fn unsuccessful(description: impl Into<String>) -> Self {
        Outcome::Unsuccessful {
            description: description.into(),
        }
    }

    pub fn is_successful(&self) -> bool {
        matches!(self, Outcome::Successful)
    }
}

/// Receives lifecycle signals and announcements during a checkout.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// An activity was requested for a test suite.
    async fn activity_triggered(&self, activity_id: &str, name: &str);

    async fn activity_started(&self, activity_id: &str);

    /// Emitted exactly once per activity.
    async fn activity_finished(&self, activity_id: &str, outcome: &Outcome);

    /// A sub-suite is ready; `uri` is where its definition can be fetched.
    async fn environment_defined(&self, uri: &str, sub_suite: &SubSuite);
}

/// A publisher that drops everything.
pub struct NullPublisher;

#[async_trait]
impl EventPublisher for NullPublisher {
    async fn activity_triggered(&self, _activity_id: &str, _name: &str) {}
    async fn activity_started(&self, _activity_id: &str) {}
    async fn activity_finished(&self, _activity_id: &str, _outcome: &Outcome) {}
    async fn environment_defined(&self, _uri: &str, _sub_suite: &SubSuite) {}
}

/// A publisher that writes every signal to the log.
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn activity_triggered(&self, activity_id: &str, name: &str) {
        info!("Activity {} triggered: {}", activity_id, name);
    }

    async fn activity_started(&self, activity_id: &str) {
        info!("Activity {} started", activity_id);
    }

    async fn activity_finished(&self, activity_id: &str, outcome: &Outcome) {
        match outcome {
            Outcome::Successful => info!("Activity {} finished successfully", activity_id),
            Outcome::Unsuccessful { description } => {
                error!("Activity {} failed: {}", activity_id, description)
            }
        }
    }

    async fn environment_defined(&self, uri: &str, sub_suite: &SubSuite) {
        info!(
            "Environment defined for {} ({} recipe(s)): {}",
            sub_suite.name,
            sub_suite.recipes.len(),
            uri
        );
    }
}

/// A recorded signal.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Triggered { activity_id: String, name: String },
    Started { activity_id: String },
    Finished { activity_id: String, outcome: Outcome },
    EnvironmentDefined { uri: String, sub_suite: SubSuite },
}

/// A publisher that keeps every signal in memory.
#[derive(Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<Event>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Announced sub-suites, in announcement order.
    pub fn environments(&self) -> Vec<(String, SubSuite)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::EnvironmentDefined { uri, sub_suite } => Some((uri, sub_suite)),
                _ => None,
            })
            .collect()
    }

    /// Outcomes of finished activities, in order.
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Finished { outcome, .. } => Some(outcome),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn activity_triggered(&self, activity_id: &str, name: &str) {
        self.push(Event::Triggered {
            activity_id: activity_id.to_string(),
            name: name.to_string(),
        });
    }

    async fn activity_started(&self, activity_id: &str) {
        self.push(Event::Started {
            activity_id: activity_id.to_string(),
        });
    }

    async fn activity_finished(&self, activity_id: &str, outcome: &Outcome) {
        self.push(Event::Finished {
            activity_id: activity_id.to_string(),
            outcome: outcome.clone(),
        });
    }

    async fn environment_defined(&self, uri: &str, sub_suite: &SubSuite) {
        self.push(Event::EnvironmentDefined {
            uri: uri.to_string(),
            sub_suite: sub_suite.clone(),
        });
    }
}

/// Where the main suite of a suite runner is announced.
#[async_trait]
pub trait MainSuiteSource: Send + Sync {
    /// The test-suite-started id of the suite runner's main suite, if it
    /// has been announced yet.
    async fn main_suite_id(&self, suite_runner_id: &str) -> Option<String>;
}

/// Reads main suite ids from `/testrun/{id}/main-suite/{suite_runner_id}`.
pub struct StoreMainSuiteSource {
    store: Arc<dyn ConfigStore>,
    testrun_id: String,
}

impl StoreMainSuiteSource {
    pub fn new(store: Arc<dyn ConfigStore>, testrun_id: impl Into<String>) -> Self {
        Self {
            store,
            testrun_id: testrun_id.into(),
        }
    }

    pub fn path(testrun_id: &str, suite_runner_id: &str) -> StorePath {
        StorePath::testrun(testrun_id)
            .join("main-suite")
            .join(suite_runner_id)
    }
}

#[async_trait]
impl MainSuiteSource for StoreMainSuiteSource {
    async fn main_suite_id(&self, suite_runner_id: &str) -> Option<String> {
        let path = Self::path(&self.testrun_id, suite_runner_id);
        match self.store.read(&path).await {
            Ok(Some(bytes)) => {
                let id = String::from_utf8_lossy(&bytes).trim().to_string();
                (!id.is_empty()).then_some(id)
            }
            Ok(None) => None,
            Err(e) => {
                error!("Failed to read main suite id at {}: {}", path, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_outcome_serialization() {
        assert_eq!(
            serde_json::to_value(Outcome::Successful).unwrap(),
            serde_json::json!({"conclusion": "SUCCESSFUL"})
        );
        assert_eq!(
            serde_json::to_value(Outcome::unsuccessful("no IUTs")).unwrap(),
            serde_json::json!({"conclusion": "UNSUCCESSFUL", "description": "no IUTs"})
        );
    }

    #[tokio::test]
    async fn test_memory_publisher_records_in_order() {
        let publisher = MemoryPublisher::new();
        publisher.activity_triggered("a1", "smoke").await;
        publisher.activity_started("a1").await;
        publisher.activity_finished("a1", &Outcome::Successful).await;

        let events = publisher.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], Event::Triggered { name, .. } if name == "smoke"));
        assert_eq!(publisher.outcomes(), vec![Outcome::Successful]);
        assert!(publisher.environments().is_empty());
    }

    #[tokio::test]
    async fn test_store_main_suite_source() {
        let store = Arc::new(MemoryStore::new());
        let source = StoreMainSuiteSource::new(store.clone(), "run-1");
        assert!(source.main_suite_id("runner-1").await.is_none());

        store.insert("/testrun/run-1/main-suite/runner-1", "  main-42\n");
        assert_eq!(source.main_suite_id("runner-1").await.as_deref(), Some("main-42"));
    }
}
