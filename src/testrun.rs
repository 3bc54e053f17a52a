//! The testrun request: what to test, with which test runners and
//! providers.
//!
//! A testrun holds one or more suites, each an ordered list of recipes. A
//! recipe is a single test case together with everything needed to execute
//! it, including the test runner image it must run in.
//!
//! ```json
//! {
//!   "id": "6f1e...",
//!   "artifact": "2a2d...",
//!   "identity": "pkg:testrun/product@1.0",
//!   "providers": {"iut": "default", "executionSpace": "default", "logArea": "default"},
//!   "suites": [{
//!     "name": "smoke",
//!     "priority": 1,
//!     "tests": [{
//!       "id": "t1",
//!       "testCase": {"id": "test_boot", "tracker": "jira", "url": "https://..."},
//!       "execution": {"checkout": ["git clone ..."], "command": "pytest", "testRunner": "runner:latest"}
//!     }]
//!   }]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Top-level testrun request.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
    /// Testrun identifier. Without one, providers are resolved from the
    /// global namespace by id.
    #[serde(default)]
    pub id: Option<String>,

    /// Artifact under test.
    #[serde(default)]
    pub artifact: String,

    /// Identity of the artifact (typically a package URL).
    #[serde(default)]
    pub identity: String,

    /// Provider ids requested for this testrun.
    #[serde(default)]
    pub providers: ProviderIds,

    /// Free-form data made available to provider templates.
    #[serde(default)]
    pub custom_data: Map<String, Value>,

    pub suites: Vec<Suite>,
}

impl TestRun {
    /// Loads a testrun from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read testrun: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse testrun: {}", path.display()))
    }

    pub fn total_recipes(&self) -> usize {
        self.suites.iter().map(|s| s.tests.len()).sum()
    }
}

/// Provider ids to use for each resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderIds {
    #[serde(default = "default_provider_id")]
    pub iut: String,
    #[serde(default = "default_provider_id")]
    pub execution_space: String,
    #[serde(default = "default_provider_id")]
    pub log_area: String,
}

impl Default for ProviderIds {
    fn default() -> Self {
        Self {
            iut: default_provider_id(),
            execution_space: default_provider_id(),
            log_area: default_provider_id(),
        }
    }
}

fn default_provider_id() -> String {
    "default".to_string()
}

/// A single test suite of a testrun.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Suite {
    pub name: String,

    /// Higher priorities get IUTs first.
    #[serde(default = "default_priority")]
    pub priority: i64,

    /// Recipes, in the order they were requested.
    #[serde(default)]
    pub tests: Vec<Recipe>,
}

fn default_priority() -> i64 {
    1
}

/// One test case plus its execution constraints.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub id: String,

    pub test_case: TestCase,

    pub execution: Execution,

    /// Environment the test requires (not the executor's variables).
    #[serde(default)]
    pub environment: Map<String, Value>,
}

impl Recipe {
    /// Image of the test runner this recipe must execute in.
    pub fn test_runner(&self) -> &str {
        &self.execution.test_runner
    }
}

/// Meta information about a test case.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TestCase {
    pub id: String,
    #[serde(default)]
    pub tracker: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "master".to_string()
}

/// How to execute a single test case.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    #[serde(default)]
    pub checkout: Vec<String>,
    #[serde(default)]
    pub command: String,
    pub test_runner: String,
    #[serde(default)]
    pub environment: Map<String, Value>,
    #[serde(default)]
    pub execute: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn recipe(id: &str, test_runner: &str) -> Recipe {
        Recipe {
            id: id.to_string(),
            test_case: TestCase {
                id: format!("test_{id}"),
                tracker: "tracker".to_string(),
                url: format!("https://tracker/{id}"),
                version: default_version(),
            },
            execution: Execution {
                checkout: vec!["git clone https://example.com/tests".to_string()],
                command: "pytest".to_string(),
                test_runner: test_runner.to_string(),
                environment: Map::new(),
                execute: Vec::new(),
                parameters: BTreeMap::new(),
            },
            environment: Map::new(),
        }
    }

    pub fn suite(name: &str, priority: i64, recipes: Vec<Recipe>) -> Suite {
        Suite {
            name: name.to_string(),
            priority,
            tests: recipes,
        }
    }

    pub fn testrun(id: Option<&str>, suites: Vec<Suite>) -> TestRun {
        TestRun {
            id: id.map(str::to_string),
            artifact: "artifact-1".to_string(),
            identity: "pkg:testrun/product@1.0".to_string(),
            providers: ProviderIds::default(),
            custom_data: Map::new(),
            suites,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_testrun() {
        let testrun: TestRun = serde_json::from_str(
            r#"{
                "id": "run-1",
                "suites": [{
                    "name": "smoke",
                    "tests": [{
                        "id": "t1",
                        "testCase": {"id": "test_boot"},
                        "execution": {"testRunner": "runner:1", "command": "pytest"}
                    }]
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(testrun.id.as_deref(), Some("run-1"));
        assert_eq!(testrun.providers, ProviderIds::default());
        assert_eq!(testrun.suites[0].priority, 1);
        assert_eq!(testrun.suites[0].tests[0].test_runner(), "runner:1");
        assert_eq!(testrun.suites[0].tests[0].test_case.version, "master");
        assert_eq!(testrun.total_recipes(), 1);
    }

    #[test]
    fn test_provider_ids_camel_case() {
        let ids: ProviderIds =
            serde_json::from_str(r#"{"iut": "lab", "executionSpace": "k8s"}"#).unwrap();
        assert_eq!(ids.iut, "lab");
        assert_eq!(ids.execution_space, "k8s");
        assert_eq!(ids.log_area, "default");
    }
}
