// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # wattfarm
//!
//! A library for observing and driving the power/performance knobs of a
//! multi-socket multicore machine, plus an adaptive manager that keeps a
//! pipelined farm of worker threads inside a user-supplied performance or
//! power contract.
//!
//! The substrate modules mirror what the hardware offers:
//!
//! - [`topology`]: the Cpu -> PhysicalCore -> VirtualCore tree, hot-plug,
//!   idle states, utilization spinners.
//! - [`cpufreq`]: frequency domains, governors, bounds, turbo boost,
//!   rollback points.
//! - [`energy`]: RAPL package/cores/graphics/DRAM counters with wrap
//!   handling, and power capping.
//! - [`task`]: moving threads between cores and changing their priority.
//!
//! On top of them, [`farm`] hosts the adaptive manager: given a running
//! farm (optional emitter, workers, optional collector) it periodically
//! samples load, throughput and energy, and reconfigures the worker count
//! and the CPU frequency whenever the contract is violated.
//!
//! Every module can also be constructed against a [`remote::Communicator`]
//! instead of the local machine, turning each call into a request/response
//! round-trip to a remote agent serving the same modules.

pub mod cpufreq;
pub mod cpumask;
pub mod energy;
mod error;
pub mod farm;
mod misc;
pub mod remote;
pub mod task;
pub mod topology;
pub mod voltage;

pub use cpufreq::{CpuFreq, Domain, DomainId, Frequency, Governor, RollbackPoint};
pub use cpumask::Cpumask;
pub use energy::{Counter, CounterCpus, CounterType, Energy, Joules, JoulesCpu, PowerCap, PowerCapper};
pub use error::{ConfigError, Error, Result};
pub use farm::manager::{AdaptiveFarmManager, ManagerState, ManagerStats};
pub use farm::params::{
    AdaptivityParameters, FrequencyStrategy, MappingStrategy, UnusedVcStrategy,
};
pub use farm::{Farm, FarmConfiguration, FarmNode, NodeSample, Observer, ObserverSample};
pub use misc::default_root;
pub use task::{Task, TasksManager, ThreadHandle};
pub use topology::{Cpu, CpuId, PhysicalCore, PhysicalCoreId, Topology, VirtualCore, VirtualCoreId};
pub use voltage::{Voltage, VoltageTable};
