// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Adaptive farm management
//!
//! A farm is a pipeline of an optional emitter, N workers and an optional
//! collector. The farm runtime itself (queues, load balancing, gathering)
//! lives outside this library; the [`Farm`] and [`FarmNode`] traits are
//! the narrow contract the [`manager::AdaptiveFarmManager`] requires from
//! it, and [`AdaptivityParameters`](params::AdaptivityParameters) is the
//! user's contract with the manager.

pub mod manager;
pub mod params;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cpufreq::Frequency;
use crate::energy::JoulesCpu;
use crate::task::Task;
use crate::topology::VirtualCoreId;
use crate::Result;

/// One pull-and-reset measurement from a farm node: the share of wall time
/// spent inside the service logic and the tasks completed since the last
/// pull.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeSample {
    pub load_percent: f64,
    pub tasks_count: u64,
}

/// A `(workers, frequency)` operating point of the farm. The frequency is
/// zero when the manager does not drive DVFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmConfiguration {
    pub num_workers: usize,
    pub frequency: Frequency,
}

impl FarmConfiguration {
    pub fn new(num_workers: usize, frequency: Frequency) -> Self {
        Self {
            num_workers,
            frequency,
        }
    }
}

/// One node of the farm, as seen by the manager.
pub trait FarmNode: Send + Sync {
    /// The node's thread handle. `None` until the node's service loop has
    /// started; the returned handle stays valid while the thread lives.
    fn thread_handle(&self) -> Option<Arc<dyn Task>>;

    /// A consistent snapshot of the node's load and task count since the
    /// last call, resetting both. `None` once the node has terminated.
    fn get_and_reset_sample(&self) -> Option<NodeSample>;

    /// Asks the node to emit a sentinel null task next, draining every
    /// node downstream.
    fn produce_null(&self);

    /// Warns the node that the number of active workers is changing, so
    /// it can rebalance shared state before the farm resumes.
    fn notify_workers_change(&self, old_workers: usize, new_workers: usize);
}

/// The farm-level primitives of the runtime.
pub trait Farm: Send + Sync {
    fn emitter(&self) -> Option<Arc<dyn FarmNode>>;

    /// All workers, active or not, in position order. The length is the
    /// maximum worker count the manager may activate.
    fn workers(&self) -> Vec<Arc<dyn FarmNode>>;

    fn collector(&self) -> Option<Arc<dyn FarmNode>>;

    /// Restarts the farm with exactly `num_workers` workers, running until
    /// the next freeze.
    fn run_then_freeze(&self, num_workers: usize) -> Result<()>;

    /// Blocks until every active worker has frozen.
    fn wait_freezing(&self) -> Result<()>;
}

/// What an [`Observer`] sees once per sampling iteration.
#[derive(Debug, Clone)]
pub struct ObserverSample {
    pub num_workers: usize,
    pub frequency: Frequency,
    pub emitter_core: Option<VirtualCoreId>,
    pub worker_cores: Vec<VirtualCoreId>,
    pub collector_core: Option<VirtualCoreId>,
    pub bandwidth: f64,
    pub utilization: f64,
    pub used_joules: JoulesCpu,
    pub unused_joules: JoulesCpu,
}

/// Receives one callback per sampling iteration, after the averages have
/// been updated.
pub trait Observer: Send {
    fn observe(&mut self, sample: &ObserverSample);
}
