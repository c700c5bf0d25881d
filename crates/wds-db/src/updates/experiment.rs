//! Experiment update builder.

use serde::Serialize;
use wds_core::enums::ExperimentState;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExperimentUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ExperimentState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
}

pub struct ExperimentUpdateBuilder(ExperimentUpdate);

impl ExperimentUpdateBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self(ExperimentUpdate::default())
    }

    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.0.title = Some(title.into());
        self
    }

    #[must_use]
    pub const fn state(mut self, state: ExperimentState) -> Self {
        self.0.state = Some(state);
        self
    }

    #[must_use]
    pub const fn approved(mut self, approved: bool) -> Self {
        self.0.approved = Some(approved);
        self
    }

    #[must_use]
    pub fn build(self) -> ExperimentUpdate {
        self.0
    }
}

impl Default for ExperimentUpdateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_only_serializes_set_fields() {
        let update = ExperimentUpdateBuilder::new()
            .state(ExperimentState::Piloting)
            .build();
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json, serde_json::json!({ "state": "piloting" }));
    }
}
