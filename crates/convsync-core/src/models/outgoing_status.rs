use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle stage of an outgoing message.
///
/// Variant order is the lifecycle order; `Failed` sorts last so that the
/// resolver sees it first when scanning from the top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    HeldForQualityAssessment,
    Accepted,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl Stage {
    /// Resolution hierarchy, lowest first.
    pub const HIERARCHY: [Stage; 7] = [
        Stage::Pending,
        Stage::HeldForQualityAssessment,
        Stage::Accepted,
        Stage::Sent,
        Stage::Delivered,
        Stage::Read,
        Stage::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::HeldForQualityAssessment => "held_for_quality_assessment",
            Stage::Accepted => "accepted",
            Stage::Sent => "sent",
            Stage::Delivered => "delivered",
            Stage::Read => "read",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown message stage: {0}")]
pub struct UnknownStage(pub String);

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::HIERARCHY
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

/// Stage name -> time the stage was reached.
///
/// Rows accumulate stages; a stage present with a `None` timestamp was reached
/// but reported with a missing or unparseable time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingStatus {
    stages: BTreeMap<Stage, Option<DateTime<Utc>>>,
}

impl OutgoingStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: Stage, reached_at: DateTime<Utc>) -> Self {
        self.stages.insert(stage, Some(reached_at));
        self
    }

    /// Record `stage` unless it is already present.
    pub fn mark(&mut self, stage: Stage, reached_at: Option<DateTime<Utc>>) -> bool {
        if self.stages.contains_key(&stage) {
            return false;
        }
        self.stages.insert(stage, reached_at);
        true
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains_key(&stage)
    }

    pub fn reached_at(&self, stage: Stage) -> Option<DateTime<Utc>> {
        self.stages.get(&stage).copied().flatten()
    }

    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.stages.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Add every stage of `other` missing from `self`. Existing timestamps are kept.
    /// Returns true if anything was added.
    pub fn absorb(&mut self, other: &OutgoingStatus) -> bool {
        let mut changed = false;
        for (stage, reached_at) in &other.stages {
            changed |= self.mark(*stage, *reached_at);
        }
        changed
    }
}

impl Serialize for OutgoingStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.stages.len()))?;
        for (stage, reached_at) in &self.stages {
            match reached_at {
                Some(t) => map.serialize_entry(stage.as_str(), &t.to_rfc3339())?,
                // Reached without a usable time; null would read back as absent
                None => map.serialize_entry(stage.as_str(), &true)?,
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for OutgoingStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: BTreeMap<String, serde_json::Value> = BTreeMap::deserialize(deserializer)?;
        let mut status = OutgoingStatus::new();
        for (key, value) in raw {
            // Unknown stages from newer backends are ignored
            let Ok(stage) = key.parse::<Stage>() else {
                continue;
            };
            if value.is_null() || value.as_bool() == Some(false) {
                continue;
            }
            let reached_at = value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));
            status.stages.insert(stage, reached_at);
        }
        Ok(status)
    }
}
