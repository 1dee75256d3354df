// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster runtime gateway - where sandbox workloads actually run.
//!
//! The control plane depends only on a stable per-workload UID, an observed
//! phase, an IP once running, and label-based listing. Workloads are always
//! located through the `sandbox-id` label, never by name prefix.

pub mod kube;
pub mod mock;
mod traits;

pub use kube::KubeCluster;
pub use mock::{ListHold, MockCluster, running_workload};
pub use traits::*;
