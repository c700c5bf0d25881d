//! Target group update builder.

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_target: Option<i64>,
}

pub struct GroupUpdateBuilder(GroupUpdate);

impl GroupUpdateBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self(GroupUpdate::default())
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.0.name = Some(name.into());
        self
    }

    #[must_use]
    pub const fn completion_target(mut self, target: i64) -> Self {
        self.0.completion_target = Some(target);
        self
    }

    #[must_use]
    pub fn build(self) -> GroupUpdate {
        self.0
    }
}

impl Default for GroupUpdateBuilder {
    fn default() -> Self {
        Self::new()
    }
}
