//! Time-stamped facts.
//!
//! Facts belong to the external fact store; the registry reads their time,
//! value, owning source and owner tag and nothing else.

use crate::{is_reserved, FactId, Owner, SourceId, Timestamp};
use serde::{Deserialize, Serialize};

/// Value recorded by a fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FactValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

/// A single time-stamped fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub fact_id: FactId,
    /// The source this fact belongs to (cascade-deleted with it).
    pub source_id: SourceId,
    /// The computation that produced the fact.
    pub owner: Owner,
    pub name: String,
    pub time: Option<Timestamp>,
    /// `None` marks a placeholder, such as an empty diary field.
    pub value: Option<FactValue>,
}

impl Fact {
    pub fn new(
        source_id: SourceId,
        owner: Owner,
        name: impl Into<String>,
        time: Option<Timestamp>,
        value: Option<FactValue>,
    ) -> Self {
        Self {
            fact_id: FactId::now_v7(),
            source_id,
            owner,
            name: name.into(),
            time,
            value,
        }
    }

    /// The fact's time if it takes part in range computations.
    ///
    /// Constants live at the epoch and placeholders inside the reserved first
    /// day; neither counts.
    pub fn counting_time(&self) -> Option<Timestamp> {
        self.time.filter(|t| !is_reserved(*t))
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }
}

/// Partial update applied to a persisted fact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactUpdate {
    /// New time; `Some(None)` clears it.
    pub time: Option<Option<Timestamp>>,
    /// New value; `Some(None)` clears it.
    pub value: Option<Option<FactValue>>,
}

impl FactUpdate {
    pub fn is_empty(&self) -> bool {
        self.time.is_none() && self.value.is_none()
    }

    /// Apply to a copy of `fact`.
    pub fn applied_to(&self, fact: &Fact) -> Fact {
        let mut updated = fact.clone();
        if let Some(time) = self.time {
            updated.time = time;
        }
        if let Some(value) = &self.value {
            updated.value = value.clone();
        }
        updated
    }
}
