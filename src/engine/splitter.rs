//! Assigning IUTs to test runners and splitting recipes into sub-suites.
//!
//! Recipes of a suite are grouped by the test runner they must execute in.
//! Each checked-out IUT becomes one sub-suite slot of one group; once a
//! group's slots have an execution space and a log area, its recipes are
//! split across them.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use testbed::engine::splitter::{TestRunnerGroup, assign_iuts, split};
//! use testbed::provider::{Resource, ResourceKind};
//! use testbed::testrun::Recipe;
//!
//! let recipe = |id: &str| -> Recipe {
//!     serde_json::from_value(json!({
//!         "id": id,
//!         "testCase": {"id": id},
//!         "execution": {"testRunner": "runner:1"}
//!     }))
//!     .unwrap()
//! };
//! let mut groups = vec![TestRunnerGroup::new("runner:1", 1, vec![recipe("a"), recipe("b"), recipe("c")])];
//! let iuts = vec![
//!     Resource::from_value(ResourceKind::Iut, "lab", json!({"id": "iut-1"})),
//!     Resource::from_value(ResourceKind::Iut, "lab", json!({"id": "iut-2"})),
//! ];
//!
//! let leftover = assign_iuts(&mut groups, iuts);
//! assert!(leftover.is_empty());
//!
//! split(&mut groups[0]);
//! assert_eq!(groups[0].assignments[0].recipes.len(), 2);
//! assert_eq!(groups[0].assignments[1].recipes.len(), 1);
//! ```

use crate::provider::Resource;
use crate::testrun::{Recipe, Suite};

/// One IUT slot of a test runner group, and what has been bound to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub iut: Resource,
    pub executor: Option<Resource>,
    pub log_area: Option<Resource>,
    pub recipes: Vec<Recipe>,
}

impl Assignment {
    fn new(iut: Resource) -> Self {
        Self {
            iut,
            executor: None,
            log_area: None,
            recipes: Vec::new(),
        }
    }
}

/// The recipes of one test runner within a suite.
#[derive(Debug, Clone, PartialEq)]
pub struct TestRunnerGroup {
    pub test_runner: String,
    pub priority: i64,
    pub unsplit_recipes: Vec<Recipe>,
    pub assignments: Vec<Assignment>,
}

impl TestRunnerGroup {
    pub fn new(test_runner: impl Into<String>, priority: i64, recipes: Vec<Recipe>) -> Self {
        Self {
            test_runner: test_runner.into(),
            priority,
            unsplit_recipes: recipes,
            assignments: Vec::new(),
        }
    }

    /// How many more IUTs this group can use.
    fn capacity(&self) -> usize {
        self.unsplit_recipes.len().saturating_sub(self.assignments.len())
    }
}

/// Groups a suite's recipes by test runner, in order of first appearance.
pub fn groups_from_suite(suite: &Suite) -> Vec<TestRunnerGroup> {
    let mut groups: Vec<TestRunnerGroup> = Vec::new();
    for recipe in &suite.tests {
        match groups
            .iter_mut()
            .find(|g| g.test_runner == recipe.test_runner())
        {
            Some(group) => group.unsplit_recipes.push(recipe.clone()),
            None => groups.push(TestRunnerGroup::new(
                recipe.test_runner(),
                suite.priority,
                vec![recipe.clone()],
            )),
        }
    }
    groups
}

/// Distributes `iuts` over the groups and returns the ones nobody needs.
///
/// Groups are served by priority (highest first), then by the number of
/// unsplit recipes (largest first); ties keep their original order. Every
/// group that needs an IUT gets one before any group gets a second, and no
/// group gets more IUTs than it has recipes. IUTs are handed out in the
/// order they were checked out.
pub fn assign_iuts(groups: &mut [TestRunnerGroup], iuts: Vec<Resource>) -> Vec<Resource> {
    let mut order: Vec<usize> = (0..groups.len()).collect();
    order.sort_by(|&a, &b| {
        groups[b]
            .priority
            .cmp(&groups[a].priority)
            .then(groups[b].unsplit_recipes.len().cmp(&groups[a].unsplit_recipes.len()))
    });

    let mut iuts = iuts.into_iter();
    loop {
        let mut assigned = false;
        for &index in &order {
            let group = &mut groups[index];
            if group.capacity() == 0 {
                continue;
            }
            let Some(iut) = iuts.next() else {
                return Vec::new();
            };
            group.assignments.push(Assignment::new(iut));
            assigned = true;
        }
        if !assigned {
            return iuts.collect();
        }
    }
}

/// Moves the group's unsplit recipes into its assignments.
///
/// Recipes are cut into contiguous chunks whose sizes differ by at most
/// one, the larger chunks first, so identical inputs always give identical
/// sub-suites. A group without assignments is left untouched.
pub fn split(group: &mut TestRunnerGroup) {
    let slots = group.assignments.len();
    if slots == 0 {
        return;
    }
    let recipes = std::mem::take(&mut group.unsplit_recipes);
    let base = recipes.len() / slots;
    let extra = recipes.len() % slots;

    let mut recipes = recipes.into_iter();
    for (i, assignment) in group.assignments.iter_mut().enumerate() {
        let size = base + usize::from(i < extra);
        assignment.recipes.extend(recipes.by_ref().take(size));
    }
}
