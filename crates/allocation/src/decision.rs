//! Allocation decisions
//!
//! A decision is either a single verdict from one decider or a multi decision collecting
//! the verdicts of a whole decider chain. The kind of a multi decision is the worst kind
//! among its parts.

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Verdict kind, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    Yes,
    /// Temporarily not possible (concurrency or backoff limits); retry later
    Throttle,
    No,
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionKind::Yes => write!(f, "YES"),
            DecisionKind::Throttle => write!(f, "THROTTLE"),
            DecisionKind::No => write!(f, "NO"),
        }
    }
}

/// Allocation decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Single {
        kind: DecisionKind,
        /// Name of the decider that produced it
        label: Option<&'static str>,
        explanation: Option<String>,
    },
    Multi(Vec<Decision>),
}

impl Decision {
    pub const ALWAYS: Decision = Decision::Single {
        kind: DecisionKind::Yes,
        label: None,
        explanation: None,
    };

    pub const THROTTLE: Decision = Decision::Single {
        kind: DecisionKind::Throttle,
        label: None,
        explanation: None,
    };

    pub const NO: Decision = Decision::Single {
        kind: DecisionKind::No,
        label: None,
        explanation: None,
    };

    pub fn single(kind: DecisionKind, label: &'static str, explanation: impl Into<String>) -> Self {
        Decision::Single {
            kind,
            label: Some(label),
            explanation: Some(explanation.into()),
        }
    }

    pub fn yes(label: &'static str, explanation: impl Into<String>) -> Self {
        Self::single(DecisionKind::Yes, label, explanation)
    }

    pub fn no(label: &'static str, explanation: impl Into<String>) -> Self {
        Self::single(DecisionKind::No, label, explanation)
    }

    pub fn throttle(label: &'static str, explanation: impl Into<String>) -> Self {
        Self::single(DecisionKind::Throttle, label, explanation)
    }

    /// Empty multi decision (kind YES until something is added)
    pub fn multi() -> Self {
        Decision::Multi(Vec::new())
    }

    /// Append to a multi decision; a single decision is turned into a multi one
    pub fn add(&mut self, decision: Decision) {
        match self {
            Decision::Multi(parts) => parts.push(decision),
            Decision::Single { .. } => {
                let first = std::mem::replace(self, Decision::multi());
                *self = Decision::Multi(vec![first, decision]);
            }
        }
    }

    pub fn kind(&self) -> DecisionKind {
        match self {
            Decision::Single { kind, .. } => *kind,
            Decision::Multi(parts) => parts
                .iter()
                .map(Decision::kind)
                .max()
                .unwrap_or(DecisionKind::Yes),
        }
    }

    pub fn is_yes(&self) -> bool {
        self.kind() == DecisionKind::Yes
    }

    pub fn is_no(&self) -> bool {
        self.kind() == DecisionKind::No
    }

    pub fn is_throttle(&self) -> bool {
        self.kind() == DecisionKind::Throttle
    }

    pub fn label(&self) -> Option<&'static str> {
        match self {
            Decision::Single { label, .. } => *label,
            Decision::Multi(_) => None,
        }
    }

    pub fn explanation(&self) -> Option<&str> {
        match self {
            Decision::Single { explanation, .. } => explanation.as_deref(),
            Decision::Multi(_) => None,
        }
    }

    /// Flattened single decisions
    pub fn singles(&self) -> Vec<&Decision> {
        match self {
            Decision::Single { .. } => vec![self],
            Decision::Multi(parts) => parts.iter().flat_map(|d| d.singles()).collect(),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Single {
                kind,
                label,
                explanation,
            } => {
                write!(f, "{}", kind)?;
                if let Some(label) = label {
                    write!(f, "({})", label)?;
                }
                if let Some(explanation) = explanation {
                    write!(f, ": {}", explanation)?;
                }
                Ok(())
            }
            Decision::Multi(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", part)?;
                }
                Ok(())
            }
        }
    }
}

impl Serialize for Decision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Decision::Single {
                kind,
                label,
                explanation,
            } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("decider", label)?;
                map.serialize_entry("decision", kind)?;
                map.serialize_entry("explanation", explanation)?;
                map.end()
            }
            Decision::Multi(_) => {
                let singles = self.singles();
                let mut seq = serializer.serialize_seq(Some(singles.len()))?;
                for single in singles {
                    seq.serialize_element(single)?;
                }
                seq.end()
            }
        }
    }
}
