use std::collections::BTreeMap;

use futures::future::BoxFuture;

use flowmill_core::config::EngineConfig;
use flowmill_core::error::Result;
use flowmill_core::traits::GroupDirectory;

/// Group membership fixed at startup, usually from the `[groups]` config
/// table. Unknown groups have no members.
#[derive(Debug, Clone, Default)]
pub struct StaticGroupDirectory {
    groups: BTreeMap<String, Vec<String>>,
}

impl StaticGroupDirectory {
    pub fn new(groups: BTreeMap<String, Vec<String>>) -> Self {
        Self { groups }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.groups.clone())
    }

    pub fn with_group<I, S>(mut self, group_id: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups
            .insert(group_id.into(), members.into_iter().map(Into::into).collect());
        self
    }

    /// Groups `user_id` belongs to.
    pub fn groups_of(&self, user_id: &str) -> Vec<String> {
        self.groups
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m == user_id))
            .map(|(group, _)| group.clone())
            .collect()
    }
}

impl GroupDirectory for StaticGroupDirectory {
    fn members_of(&self, group_id: &str) -> BoxFuture<'_, Result<Vec<String>>> {
        let members = self.groups.get(group_id).cloned().unwrap_or_default();
        Box::pin(async move { Ok(members) })
    }
}
