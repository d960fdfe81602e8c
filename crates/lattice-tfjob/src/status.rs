//! TFJob status conditions and the policy that turns them into a job state
//!
//! The control plane gives no ordering guarantee for `status.conditions`, so
//! the authoritative entry is the one with the newest timestamp
//! (`lastTransitionTime`, then `lastUpdateTime`). Timestamped entries outrank
//! untimestamped ones; ties fall back to list position, last one wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// `status` block of a TFJob
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TFJobStatus {
    #[serde(default)]
    pub conditions: Vec<JobCondition>,
}

/// One entry of `status.conditions`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobCondition {
    /// Condition type (Created, Running, Restarting, Succeeded, Failed)
    #[serde(rename = "type", default)]
    pub type_: String,
    /// Whether the condition holds; accepts `true` or `"True"`
    #[serde(deserialize_with = "bool_or_string")]
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl JobCondition {
    /// Condition with no timestamps
    pub fn new(type_: impl Into<String>, status: bool) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: None,
            message: None,
            last_update_time: None,
            last_transition_time: None,
        }
    }

    /// Set the transition timestamp
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.last_transition_time = Some(time);
        self
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_transition_time.or(self.last_update_time)
    }
}

/// What the authoritative condition says about the job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionState {
    /// No terminal condition yet
    Running,
    /// The job finished successfully
    Succeeded,
    /// The job failed
    Failed,
}

impl TFJobStatus {
    /// Parse the `status` object of a TFJob; a missing status is empty
    pub fn from_value(status: Option<&serde_json::Value>) -> Result<Self, serde_json::Error> {
        match status {
            Some(v) if !v.is_null() => serde_json::from_value(v.clone()),
            _ => Ok(Self::default()),
        }
    }

    /// The authoritative condition: newest timestamp, then last in list order
    pub fn latest_condition(&self) -> Option<&JobCondition> {
        self.conditions
            .iter()
            .enumerate()
            .max_by_key(|(i, c)| (c.timestamp(), *i))
            .map(|(_, c)| c)
    }

    /// Resolve the job state from the authoritative condition.
    ///
    /// A false condition means still running. A true `Failed` means failed, a
    /// true `Succeeded`/`Completed` means succeeded, any other true condition
    /// (Created, Running, Restarting) means still running.
    pub fn state(&self) -> ConditionState {
        match self.latest_condition() {
            Some(c) if c.status => match c.type_.as_str() {
                "Failed" => ConditionState::Failed,
                "Succeeded" | "Completed" => ConditionState::Succeeded,
                _ => ConditionState::Running,
            },
            _ => ConditionState::Running,
        }
    }
}

fn bool_or_string<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Bool(b) => Ok(b),
        Raw::Str(s) => Ok(s.eq_ignore_ascii_case("true")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn last_entry_wins_without_timestamps() {
        // An earlier false entry is ignored once a later entry is true.
        let status = TFJobStatus {
            conditions: vec![
                JobCondition::new("Running", false),
                JobCondition::new("Succeeded", true),
            ],
        };
        assert_eq!(status.latest_condition().unwrap().type_, "Succeeded");
        assert_eq!(status.state(), ConditionState::Succeeded);
    }

    #[test]
    fn last_entry_wins_even_when_it_is_negative() {
        let status = TFJobStatus {
            conditions: vec![
                JobCondition::new("Succeeded", true),
                JobCondition::new("Succeeded", false),
            ],
        };
        assert_eq!(status.state(), ConditionState::Running);
    }

    #[test]
    fn newest_timestamp_beats_list_position() {
        // Failure recorded at t=20 but listed first must not be masked by a
        // stale success listed last.
        let status = TFJobStatus {
            conditions: vec![
                JobCondition::new("Failed", true).at(ts(20)),
                JobCondition::new("Succeeded", true).at(ts(10)),
            ],
        };
        assert_eq!(status.state(), ConditionState::Failed);
    }

    #[test]
    fn timestamped_entries_outrank_untimestamped_ones() {
        let status = TFJobStatus {
            conditions: vec![
                JobCondition::new("Succeeded", true).at(ts(5)),
                JobCondition::new("Running", true),
            ],
        };
        assert_eq!(status.state(), ConditionState::Succeeded);
    }

    #[test]
    fn non_terminal_true_conditions_keep_running() {
        let status = TFJobStatus {
            conditions: vec![JobCondition::new("Created", true)],
        };
        assert_eq!(status.state(), ConditionState::Running);
        assert_eq!(TFJobStatus::default().state(), ConditionState::Running);
    }

    #[test]
    fn parses_string_and_bool_status() {
        let value = serde_json::json!({
            "conditions": [
                {"type": "Created", "status": "True", "lastTransitionTime": "2024-01-01T00:00:00Z"},
                {"type": "Failed", "status": false}
            ]
        });
        let status = TFJobStatus::from_value(Some(&value)).unwrap();
        assert!(status.conditions[0].status);
        assert!(!status.conditions[1].status);
        assert!(status.conditions[0].last_transition_time.is_some());
    }

    #[test]
    fn missing_status_is_empty() {
        assert!(TFJobStatus::from_value(None).unwrap().conditions.is_empty());
        assert!(TFJobStatus::from_value(Some(&serde_json::Value::Null))
            .unwrap()
            .conditions
            .is_empty());
    }
}
