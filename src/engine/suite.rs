//! Test suites, their sub-suites, and the records kept of them.
//!
//! A [`TestSuite`] collects the [`SubSuite`]s built for one suite of a
//! testrun. Each sub-suite is one IUT, one execution space and one log area
//! together with the recipes split onto them. [`SuiteRecords`] persists both
//! so that executors can fetch a sub-suite by its identifier and so that the
//! environment can be released later.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::splitter::Assignment;
use super::{CheckoutError, CheckoutResult};
use crate::provider::Resource;
use crate::provider::execution_space::instructions_identifier;
use crate::store::{ConfigStore, StoreError, StorePath, StoreResult, read_json};
use crate::testrun::Recipe;

/// Everything one executor needs to run its share of a test suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubSuite {
    pub name: String,
    pub sub_suite_id: String,
    pub test_suite_started_id: String,
    pub test_runner: String,
    pub priority: i64,
    pub recipes: Vec<Recipe>,
    pub iut: Resource,
    pub executor: Resource,
    pub log_area: Resource,
}

impl SubSuite {
    /// Serializes the sub-suite, failing if it does not read back equal.
    pub fn to_json(&self) -> CheckoutResult<Vec<u8>> {
        let serialization = |reason: String| CheckoutError::Serialization {
            name: self.name.clone(),
            reason,
        };
        let bytes = serde_json::to_vec(self).map_err(|e| serialization(e.to_string()))?;
        let parsed: SubSuite =
            serde_json::from_slice(&bytes).map_err(|e| serialization(e.to_string()))?;
        if &parsed != self {
            return Err(serialization(
                "sub-suite changed when read back from JSON".to_string(),
            ));
        }
        Ok(bytes)
    }
}

/// The sub-suites of one suite of a testrun.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSuite {
    pub name: String,
    pub test_suite_started_id: String,
    #[serde(default)]
    pub sub_suites: Vec<SubSuite>,
}

impl TestSuite {
    pub fn new(name: impl Into<String>, test_suite_started_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            test_suite_started_id: test_suite_started_id.into(),
            sub_suites: Vec::new(),
        }
    }

    /// Builds a sub-suite from a fully bound, split assignment.
    ///
    /// The sub-suite id is the executor's instructions identifier, which is
    /// what the executor will ask for; an executor without one gets a fresh
    /// id.
    pub fn add(
        &mut self,
        test_runner: &str,
        priority: i64,
        assignment: Assignment,
    ) -> CheckoutResult<&SubSuite> {
        let Assignment {
            iut,
            executor,
            log_area,
            recipes,
        } = assignment;
        let executor = executor.ok_or_else(|| {
            CheckoutError::Incomplete(format!("IUT '{}' has no execution space", iut.id))
        })?;
        let log_area = log_area.ok_or_else(|| {
            CheckoutError::Incomplete(format!("IUT '{}' has no log area", iut.id))
        })?;

        let sub_suite_id = instructions_identifier(&executor)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let sub_suite = SubSuite {
            name: format!("{}_SubSuite_{}", self.name, self.sub_suites.len()),
            sub_suite_id,
            test_suite_started_id: self.test_suite_started_id.clone(),
            test_runner: test_runner.to_string(),
            priority,
            recipes,
            iut,
            executor,
            log_area,
        };
        sub_suite.to_json()?;

        self.sub_suites.push(sub_suite);
        Ok(&self.sub_suites[self.sub_suites.len() - 1])
    }

    pub fn recipe_count(&self) -> usize {
        self.sub_suites.iter().map(|s| s.recipes.len()).sum()
    }
}

/// Sub-suite and test-suite records of one testrun in the [`ConfigStore`].
pub struct SuiteRecords {
    store: Arc<dyn ConfigStore>,
    testrun_id: String,
}

impl SuiteRecords {
    pub fn new(store: Arc<dyn ConfigStore>, testrun_id: impl Into<String>) -> Self {
        Self {
            store,
            testrun_id: testrun_id.into(),
        }
    }

    pub fn testrun_id(&self) -> &str {
        &self.testrun_id
    }

    fn sub_suite_path(&self, sub_suite_id: &str) -> StorePath {
        StorePath::testrun(&self.testrun_id)
            .join("subsuite")
            .join(sub_suite_id)
    }

    fn suites_path(&self) -> StorePath {
        StorePath::testrun(&self.testrun_id).join("suite")
    }

    /// Stores a sub-suite's definition and the test suite it belongs to.
    pub async fn record_sub_suite(&self, sub_suite: &SubSuite) -> StoreResult<()> {
        let path = self.sub_suite_path(&sub_suite.sub_suite_id);
        self.store
            .write(
                &path.join("suite"),
                sub_suite.test_suite_started_id.as_bytes(),
            )
            .await?;

        let definition = path.join("definition");
        let bytes = serde_json::to_vec(sub_suite).map_err(|source| StoreError::InvalidJson {
            path: definition.to_string(),
            source,
        })?;
        self.store.write(&definition, &bytes).await?;
        debug!("Recorded sub-suite {} at {}", sub_suite.name, path);
        Ok(())
    }

    pub async fn record_test_suite(&self, suite: &TestSuite) -> StoreResult<()> {
        let path = self.suites_path().join(&suite.test_suite_started_id);
        let bytes = serde_json::to_vec(suite).map_err(|source| StoreError::InvalidJson {
            path: path.to_string(),
            source,
        })?;
        self.store.write(&path, &bytes).await?;
        debug!("Recorded test suite {} at {}", suite.name, path);
        Ok(())
    }

    /// The definition of a sub-suite, looked up by its identifier.
    pub async fn load_sub_suite(&self, sub_suite_id: &str) -> StoreResult<Option<SubSuite>> {
        read_json(
            self.store.as_ref(),
            &self.sub_suite_path(sub_suite_id).join("definition"),
        )
        .await
    }

    /// Every test suite recorded for this testrun.
    pub async fn test_suites(&self) -> StoreResult<Vec<TestSuite>> {
        self.store
            .read_all(&self.suites_path())
            .await?
            .into_iter()
            .map(|(path, bytes)| {
                serde_json::from_slice(&bytes).map_err(|source| StoreError::InvalidJson {
                    path: path.to_string(),
                    source,
                })
            })
            .collect()
    }

    /// Deletes a test suite and the records of its sub-suites.
    pub async fn forget(&self, suite: &TestSuite) -> StoreResult<()> {
        for sub_suite in &suite.sub_suites {
            let path = self.sub_suite_path(&sub_suite.sub_suite_id);
            self.store.delete(&path.join("suite")).await?;
            self.store.delete(&path.join("definition")).await?;
        }
        self.store
            .delete(&self.suites_path().join(&suite.test_suite_started_id))
            .await
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::assignment;
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_add_builds_named_sub_suites() {
        let mut suite = TestSuite::new("smoke", "tss-1");
        let first = suite.add("runner:1", 2, assignment(0, 2)).unwrap();
        assert_eq!(first.name, "smoke_SubSuite_0");
        assert_eq!(first.sub_suite_id, "sub-0");
        assert_eq!(first.test_suite_started_id, "tss-1");
        assert_eq!(first.priority, 2);

        let second = suite.add("runner:1", 2, assignment(1, 1)).unwrap();
        assert_eq!(second.name, "smoke_SubSuite_1");
        assert_eq!(suite.recipe_count(), 3);
    }

    #[test]
    fn test_add_without_identifier_generates_one() {
        let mut suite = TestSuite::new("smoke", "tss-1");
        let mut bound = assignment(0, 1);
        if let Some(executor) = bound.executor.as_mut() {
            executor.attributes.remove("instructions");
        }
        let sub_suite = suite.add("runner:1", 1, bound).unwrap();
        assert!(uuid::Uuid::parse_str(&sub_suite.sub_suite_id).is_ok());
    }

    #[test]
    fn test_add_rejects_unbound_assignment() {
        let mut suite = TestSuite::new("smoke", "tss-1");
        let mut bound = assignment(0, 1);
        bound.log_area = None;
        let err = suite.add("runner:1", 1, bound).unwrap_err();
        assert!(matches!(err, CheckoutError::Incomplete(_)));
        assert!(suite.sub_suites.is_empty());
    }

    #[test]
    fn test_sub_suite_json_round_trip() {
        let mut suite = TestSuite::new("smoke", "tss-1");
        let sub_suite = suite.add("runner:1", 1, assignment(0, 1)).unwrap().clone();
        let bytes = sub_suite.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["iut"]["id"], "iut-0");
        assert_eq!(value["iut"]["provider_id"], "lab");
        assert_eq!(value["executor"]["instructions"]["identifier"], "sub-0");
        assert_eq!(value["recipes"][0]["testCase"]["id"], "test_0-0");
    }

    #[tokio::test]
    async fn test_records_round_trip_and_forget() {
        let store = Arc::new(MemoryStore::new());
        let records = SuiteRecords::new(store.clone(), "run-1");

        let mut suite = TestSuite::new("smoke", "tss-1");
        for n in 0..2 {
            let sub_suite = suite.add("runner:1", 1, assignment(n, 1)).unwrap().clone();
            records.record_sub_suite(&sub_suite).await.unwrap();
        }
        records.record_test_suite(&suite).await.unwrap();

        let loaded = records.load_sub_suite("sub-1").await.unwrap().unwrap();
        assert_eq!(loaded, suite.sub_suites[1]);
        assert_eq!(
            store
                .read(&StorePath::new("/testrun/run-1/subsuite/sub-1/suite"))
                .await
                .unwrap()
                .as_deref(),
            Some(b"tss-1".as_slice())
        );
        assert_eq!(records.test_suites().await.unwrap(), vec![suite.clone()]);

        records.forget(&suite).await.unwrap();
        assert!(records.test_suites().await.unwrap().is_empty());
        assert!(records.load_sub_suite("sub-0").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_missing_sub_suite() {
        let records = SuiteRecords::new(Arc::new(MemoryStore::new()), "run-1");
        assert!(records.load_sub_suite("nope").await.unwrap().is_none());
    }
}
