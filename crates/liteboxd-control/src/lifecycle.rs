// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sandbox lifecycle states and transition rules.
//!
//! ```text
//!   pending ──► running ──► succeeded | failed
//!      │           │
//!      └─────┬─────┘  (absent longer than the grace period)
//!            ▼
//!          lost
//!
//!   any ──► terminating ──► deleted
//! ```
//!
//! `desired_state` is the operator's intent; `lifecycle_status` is the best
//! known condition. Once the intent is `deleted` the status is pinned to
//! `terminating` or `deleted`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::Workload;
use crate::db::SandboxRecord;

/// Operator intent for a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    /// Should exist and run.
    Active,
    /// Should be torn down.
    Deleted,
}

impl DesiredState {
    /// Persisted form.
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Active => "active",
            DesiredState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DesiredState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(DesiredState::Active),
            "deleted" => Ok(DesiredState::Deleted),
            other => Err(format!("unknown desired state '{}'", other)),
        }
    }
}

/// Best-known condition of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    /// Workload accepted, not yet running.
    Pending,
    /// Workload running.
    Running,
    /// Workload exited successfully.
    Succeeded,
    /// Workload exited with an error.
    Failed,
    /// Deletion requested, workload may still exist.
    Terminating,
    /// Workload missing from the cluster past the grace period.
    Lost,
    /// Logically deleted.
    Deleted,
    /// Observed phase not recognised.
    Unknown,
}

impl LifecycleStatus {
    /// Persisted form.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::Pending => "pending",
            LifecycleStatus::Running => "running",
            LifecycleStatus::Succeeded => "succeeded",
            LifecycleStatus::Failed => "failed",
            LifecycleStatus::Terminating => "terminating",
            LifecycleStatus::Lost => "lost",
            LifecycleStatus::Deleted => "deleted",
            LifecycleStatus::Unknown => "unknown",
        }
    }

    /// Map a runtime phase string to a status.
    pub fn from_phase(phase: &str) -> Self {
        match phase {
            "Pending" => LifecycleStatus::Pending,
            "Running" => LifecycleStatus::Running,
            "Succeeded" => LifecycleStatus::Succeeded,
            "Failed" => LifecycleStatus::Failed,
            _ => LifecycleStatus::Unknown,
        }
    }

    /// Status implied by an observed workload.
    pub fn from_observed(workload: &Workload) -> Self {
        if workload.terminating {
            LifecycleStatus::Terminating
        } else {
            Self::from_phase(&workload.phase)
        }
    }

    /// Statuses the TTL sweep leaves alone.
    pub fn is_winding_down(&self) -> bool {
        matches!(self, LifecycleStatus::Terminating | LifecycleStatus::Deleted)
    }

    /// Workload ran to completion. A finished sandbox is never escalated to `lost`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleStatus::Succeeded | LifecycleStatus::Failed)
    }

    /// Statuses that already reflect an absent workload.
    pub fn reflects_absence(&self) -> bool {
        matches!(self, LifecycleStatus::Deleted | LifecycleStatus::Lost)
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => LifecycleStatus::Pending,
            "running" => LifecycleStatus::Running,
            "succeeded" => LifecycleStatus::Succeeded,
            "failed" => LifecycleStatus::Failed,
            "terminating" => LifecycleStatus::Terminating,
            "lost" => LifecycleStatus::Lost,
            "deleted" => LifecycleStatus::Deleted,
            "unknown" => LifecycleStatus::Unknown,
            other => return Err(format!("unknown lifecycle status '{}'", other)),
        })
    }
}

/// Whether a record's TTL has run out and it should be torn down.
///
/// `now >= expires_at` and the record is not already terminating or deleted.
pub fn expire_if_due(record: &SandboxRecord, now: DateTime<Utc>) -> bool {
    now >= record.expires_at && !record.status().is_winding_down()
}

/// Status a record should carry given what the cluster shows.
///
/// A record whose intent is `deleted` keeps its status; the cluster
/// observation never pulls it back out of `terminating`/`deleted`.
pub fn derive_status(record: &SandboxRecord, workload: &Workload) -> LifecycleStatus {
    if record.desired() == DesiredState::Deleted {
        record.status()
    } else {
        LifecycleStatus::from_observed(workload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::sample_record;
    use chrono::Duration;

    fn workload(phase: &str, terminating: bool) -> Workload {
        Workload {
            sandbox_id: "s1".into(),
            name: "sandbox-s1".into(),
            uid: "u1".into(),
            phase: phase.into(),
            ip: "10.0.0.1".into(),
            terminating,
        }
    }

    #[test]
    fn test_expire_if_due_ttl_boundary() {
        let t0 = Utc::now();
        let record = sample_record("s1", t0, 3600);

        assert!(!expire_if_due(&record, t0 + Duration::seconds(3599)));
        assert!(expire_if_due(&record, t0 + Duration::seconds(3600)));
        assert!(expire_if_due(&record, t0 + Duration::seconds(3601)));
    }

    #[test]
    fn test_expire_skips_records_already_going_away() {
        let t0 = Utc::now();
        let later = t0 + Duration::hours(2);

        let mut record = sample_record("s1", t0, 60);
        record.lifecycle_status = "terminating".into();
        assert!(!expire_if_due(&record, later));

        record.lifecycle_status = "deleted".into();
        assert!(!expire_if_due(&record, later));

        record.lifecycle_status = "lost".into();
        assert!(expire_if_due(&record, later));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(LifecycleStatus::Succeeded.is_terminal());
        assert!(LifecycleStatus::Failed.is_terminal());
        assert!(!LifecycleStatus::Running.is_terminal());
        assert!(!LifecycleStatus::Unknown.is_terminal());
        assert!(!LifecycleStatus::Lost.is_terminal());
    }

    #[test]
    fn test_phase_mapping() {
        assert_eq!(LifecycleStatus::from_phase("Pending"), LifecycleStatus::Pending);
        assert_eq!(LifecycleStatus::from_phase("Running"), LifecycleStatus::Running);
        assert_eq!(LifecycleStatus::from_phase("Succeeded"), LifecycleStatus::Succeeded);
        assert_eq!(LifecycleStatus::from_phase("Failed"), LifecycleStatus::Failed);
        assert_eq!(LifecycleStatus::from_phase("Evicted"), LifecycleStatus::Unknown);
        assert_eq!(
            LifecycleStatus::from_observed(&workload("Running", true)),
            LifecycleStatus::Terminating
        );
    }

    #[test]
    fn test_derive_status_respects_deletion_intent() {
        let mut record = sample_record("s1", Utc::now(), 60);
        assert_eq!(
            derive_status(&record, &workload("Running", false)),
            LifecycleStatus::Running
        );

        record.desired_state = "deleted".into();
        record.lifecycle_status = "terminating".into();
        assert_eq!(
            derive_status(&record, &workload("Running", false)),
            LifecycleStatus::Terminating
        );
    }

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            LifecycleStatus::Pending,
            LifecycleStatus::Running,
            LifecycleStatus::Succeeded,
            LifecycleStatus::Failed,
            LifecycleStatus::Terminating,
            LifecycleStatus::Lost,
            LifecycleStatus::Deleted,
            LifecycleStatus::Unknown,
        ] {
            assert_eq!(status.as_str().parse::<LifecycleStatus>(), Ok(status));
        }
        assert!("bogus".parse::<LifecycleStatus>().is_err());
        assert_eq!("deleted".parse::<DesiredState>(), Ok(DesiredState::Deleted));
    }
}
