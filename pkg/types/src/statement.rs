use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One allow statement of a policy: a resource ARN and the actions granted on it.
///
/// Two statements are equal when they name the same resource and grant the same
/// set of actions, regardless of action order or duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementSpec {
    pub resource: String,
    #[serde(default)]
    pub action: Vec<String>,
}

impl StatementSpec {
    pub fn new<I, S>(resource: impl Into<String>, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resource: resource.into(),
            action: actions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn action_set(&self) -> BTreeSet<&str> {
        self.action.iter().map(String::as_str).collect()
    }
}

impl PartialEq for StatementSpec {
    fn eq(&self, other: &Self) -> bool {
        self.resource == other.resource && self.action_set() == other.action_set()
    }
}

impl Eq for StatementSpec {}

/// Compare two statement lists, ignoring statement order, action order and duplicates.
pub fn statements_equal(a: &[StatementSpec], b: &[StatementSpec]) -> bool {
    normalize(a) == normalize(b)
}

fn normalize(statements: &[StatementSpec]) -> BTreeSet<(&str, BTreeSet<&str>)> {
    statements
        .iter()
        .map(|s| (s.resource.as_str(), s.action_set()))
        .collect()
}
