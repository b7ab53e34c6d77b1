//! Bookkeeping for unassigned shard copies

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::node::NodeId;

/// Why a shard copy became unassigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnassignedReason {
    /// Index was created
    IndexCreated,
    /// Full cluster recovery
    ClusterRecovered,
    /// Closed index was reopened
    IndexReopened,
    /// New index restored from a snapshot
    NewIndexRestored,
    /// Existing index restored from a snapshot
    ExistingIndexRestored,
    /// Replica count was increased
    ReplicaAdded,
    /// Allocation of the copy failed
    AllocationFailed,
    /// Node hosting the copy left the cluster
    NodeLeft,
    /// Copy was cancelled by an explicit command
    RerouteCancelled,
    /// Copy was re-initialized (e.g. primary failed while recovering from it)
    Reinitialized,
    /// Primary failed while this replica was initializing from it
    PrimaryFailed,
    /// Empty primary was forced by an operator
    ForcedEmptyPrimary,
    /// Copy was manually allocated
    ManualAllocation,
}

impl std::fmt::Display for UnassignedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnassignedReason::IndexCreated => "INDEX_CREATED",
            UnassignedReason::ClusterRecovered => "CLUSTER_RECOVERED",
            UnassignedReason::IndexReopened => "INDEX_REOPENED",
            UnassignedReason::NewIndexRestored => "NEW_INDEX_RESTORED",
            UnassignedReason::ExistingIndexRestored => "EXISTING_INDEX_RESTORED",
            UnassignedReason::ReplicaAdded => "REPLICA_ADDED",
            UnassignedReason::AllocationFailed => "ALLOCATION_FAILED",
            UnassignedReason::NodeLeft => "NODE_LEFT",
            UnassignedReason::RerouteCancelled => "REROUTE_CANCELLED",
            UnassignedReason::Reinitialized => "REINITIALIZED",
            UnassignedReason::PrimaryFailed => "PRIMARY_FAILED",
            UnassignedReason::ForcedEmptyPrimary => "FORCED_EMPTY_PRIMARY",
            UnassignedReason::ManualAllocation => "MANUAL_ALLOCATION",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of the last allocation attempt for an unassigned copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    /// No attempt has been made yet
    NoAttempt,
    /// Every node was rejected by the deciders
    DecidersNo,
    /// At least one node was throttled, none accepted
    DecidersThrottled,
    /// Persisted shard state is still being collected
    FetchingShardData,
    /// No in-sync copy of the primary could be found
    NoValidShardCopy,
    /// Allocation is intentionally delayed (node may come back)
    DelayedAllocation,
}

impl std::fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AllocationStatus::NoAttempt => "no_attempt",
            AllocationStatus::DecidersNo => "deciders_no",
            AllocationStatus::DecidersThrottled => "deciders_throttled",
            AllocationStatus::FetchingShardData => "fetching_shard_data",
            AllocationStatus::NoValidShardCopy => "no_valid_shard_copy",
            AllocationStatus::DelayedAllocation => "delayed_allocation",
        };
        write!(f, "{}", s)
    }
}

/// Details about an unassigned copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnassignedInfo {
    pub reason: UnassignedReason,
    pub message: Option<String>,
    pub failure: Option<String>,
    pub unassigned_at: DateTime<Utc>,
    /// Consecutive allocation failures (the retry counter)
    pub failed_allocations: u32,
    /// Allocation is postponed because the previous node may return
    #[serde(default)]
    pub delayed: bool,
    pub last_allocation_status: AllocationStatus,
    /// Nodes on which allocation of this copy failed
    #[serde(default)]
    pub failed_node_ids: BTreeSet<NodeId>,
    /// Node the copy was on before it became unassigned
    pub last_allocated_node_id: Option<NodeId>,
}

impl UnassignedInfo {
    pub fn new(reason: UnassignedReason, message: Option<String>, unassigned_at: DateTime<Utc>) -> Self {
        Self {
            reason,
            message,
            failure: None,
            unassigned_at,
            failed_allocations: 0,
            delayed: false,
            last_allocation_status: AllocationStatus::NoAttempt,
            failed_node_ids: BTreeSet::new(),
            last_allocated_node_id: None,
        }
    }

    pub fn with_failure(mut self, failure: Option<String>) -> Self {
        self.failure = failure;
        self
    }

    pub fn with_failed_allocations(mut self, failed_allocations: u32) -> Self {
        self.failed_allocations = failed_allocations;
        self
    }

    pub fn with_delayed(mut self, delayed: bool) -> Self {
        self.delayed = delayed;
        self
    }

    pub fn with_status(mut self, status: AllocationStatus) -> Self {
        self.last_allocation_status = status;
        self
    }

    pub fn with_failed_nodes(mut self, failed_node_ids: BTreeSet<NodeId>) -> Self {
        self.failed_node_ids = failed_node_ids;
        self
    }

    pub fn with_last_allocated_node(mut self, node_id: Option<NodeId>) -> Self {
        self.last_allocated_node_id = node_id;
        self
    }

    /// Back-off before the next automatic attempt: `base * 2^(failures - 1)`, capped at `max`
    pub fn retry_delay(&self, base_ms: u64, max_ms: u64) -> Duration {
        if self.failed_allocations == 0 || base_ms == 0 {
            return Duration::zero();
        }
        let exponent = (self.failed_allocations - 1).min(32);
        let delay = base_ms.saturating_mul(1u64 << exponent).min(max_ms);
        Duration::milliseconds(i64::try_from(delay).unwrap_or(i64::MAX))
    }

    /// Earliest time at which the copy may be retried
    pub fn retry_at(&self, base_ms: u64, max_ms: u64) -> DateTime<Utc> {
        self.unassigned_at + self.retry_delay(base_ms, max_ms)
    }

    /// Remaining node-left delay; zero for any other reason
    pub fn remaining_delay(&self, now: DateTime<Utc>, timeout_ms: u64) -> Duration {
        if self.reason != UnassignedReason::NodeLeft || timeout_ms == 0 {
            return Duration::zero();
        }
        let timeout = Duration::milliseconds(i64::try_from(timeout_ms).unwrap_or(i64::MAX));
        let remaining = self.unassigned_at + timeout - now;
        if remaining < Duration::zero() {
            Duration::zero()
        } else {
            remaining
        }
    }

    pub fn short_summary(&self) -> String {
        let mut s = format!("[reason={}], at[{}]", self.reason, self.unassigned_at.to_rfc3339());
        if self.failed_allocations > 0 {
            s.push_str(&format!(", failed_attempts[{}]", self.failed_allocations));
        }
        if self.delayed {
            s.push_str(", delayed=true");
        }
        if let Some(message) = &self.message {
            s.push_str(&format!(", details[{}]", message));
        }
        s.push_str(&format!(", allocation_status[{}]", self.last_allocation_status));
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(n: u32) -> UnassignedInfo {
        UnassignedInfo::new(UnassignedReason::AllocationFailed, None, Utc::now())
            .with_failed_allocations(n)
    }

    #[test]
    fn test_retry_delay_is_exponential_and_capped() {
        assert_eq!(failed(0).retry_delay(1000, 60_000), Duration::zero());
        assert_eq!(failed(1).retry_delay(1000, 60_000), Duration::milliseconds(1000));
        assert_eq!(failed(2).retry_delay(1000, 60_000), Duration::milliseconds(2000));
        assert_eq!(failed(4).retry_delay(1000, 60_000), Duration::milliseconds(8000));
        assert_eq!(failed(30).retry_delay(1000, 60_000), Duration::milliseconds(60_000));
    }

    #[test]
    fn test_remaining_delay_only_for_node_left() {
        let now = Utc::now();
        let info = UnassignedInfo::new(UnassignedReason::NodeLeft, None, now);
        assert_eq!(info.remaining_delay(now, 5000), Duration::milliseconds(5000));
        assert_eq!(
            info.remaining_delay(now + Duration::milliseconds(6000), 5000),
            Duration::zero()
        );

        let info = UnassignedInfo::new(UnassignedReason::IndexCreated, None, now);
        assert_eq!(info.remaining_delay(now, 5000), Duration::zero());
    }
}
