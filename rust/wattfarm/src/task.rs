// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Thread placement and priority
//!
//! [`ThreadHandle`] is a weakly-owned reference to a running thread: it
//! can move the thread between virtual cores, restrict its affinity set
//! and change its priority, and becomes invalid the moment the thread
//! terminates. The [`Task`] trait captures exactly the capability set the
//! adaptive manager needs from the task layer, so farm runtimes and test
//! doubles can supply their own handles.

use std::mem::size_of;
use std::path::Path;

use crate::cpumask::Cpumask;
use crate::misc::read_file_string;
use crate::topology::{Topology, VirtualCoreId};
use crate::{Error, Result};

/// Lowest priority accepted by [`Task::set_priority`].
pub const PRIORITY_MIN: u32 = 0;
/// Highest priority accepted by [`Task::set_priority`]. The range maps
/// onto nice values +19 (lowest) to -20 (highest).
pub const PRIORITY_MAX: u32 = 39;

/// What the adaptive manager is allowed to do with a running thread.
pub trait Task: Send + Sync {
    /// Pins the thread to a single virtual core.
    fn move_to(&self, vc: VirtualCoreId) -> Result<()>;

    /// Restricts the thread to an affinity set.
    fn move_to_set(&self, mask: &Cpumask) -> Result<()>;

    /// The set of virtual cores the thread may run on.
    fn affinity(&self) -> Result<Cpumask>;

    /// The virtual core the thread last ran on.
    fn virtual_core_id(&self) -> Result<VirtualCoreId>;

    /// Priority in `[PRIORITY_MIN, PRIORITY_MAX]`, higher is stronger.
    fn priority(&self) -> Result<u32>;

    fn set_priority(&self, priority: u32) -> Result<()>;

    /// False once the thread has terminated; every other operation fails
    /// with [`Error::NotFound`] from that point on.
    fn is_active(&self) -> bool;
}

/// Hands out [`ThreadHandle`]s sized to this machine's cpu-id space.
pub struct TasksManager {
    nr_cpu_ids: usize,
}

impl TasksManager {
    pub fn new(topology: &Topology) -> Self {
        Self {
            nr_cpu_ids: topology.nr_cpu_ids(),
        }
    }

    /// A handle for the calling thread.
    pub fn this_thread(&self) -> ThreadHandle {
        ThreadHandle {
            tid: unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t },
            nr_cpu_ids: self.nr_cpu_ids,
        }
    }

    /// A handle for an arbitrary thread id. The thread is not owned; the
    /// handle simply goes invalid when the thread exits.
    pub fn thread_handle(&self, tid: i32) -> ThreadHandle {
        ThreadHandle {
            tid,
            nr_cpu_ids: self.nr_cpu_ids,
        }
    }
}

/// A libc-backed [`Task`].
#[derive(Debug, Clone)]
pub struct ThreadHandle {
    tid: libc::pid_t,
    nr_cpu_ids: usize,
}

impl ThreadHandle {
    pub fn tid(&self) -> i32 {
        self.tid
    }

    fn errno_error(&self, op: &str) -> Error {
        let errno = std::io::Error::last_os_error();
        match errno.raw_os_error() {
            Some(libc::ESRCH) => Error::NotFound(format!("thread {} is gone", self.tid)),
            Some(libc::EPERM) | Some(libc::EACCES) => {
                Error::Unsupported(format!("{} on thread {}: {}", op, self.tid, errno))
            }
            _ => Error::InvalidArgument(format!("{} on thread {}: {}", op, self.tid, errno)),
        }
    }

    fn set_affinity(&self, ids: &[usize]) -> Result<()> {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            for &id in ids {
                libc::CPU_SET(id, &mut set);
            }
            if libc::sched_setaffinity(self.tid, size_of::<libc::cpu_set_t>(), &set) != 0 {
                return Err(self.errno_error("sched_setaffinity"));
            }
        }
        Ok(())
    }
}

impl Task for ThreadHandle {
    fn move_to(&self, vc: VirtualCoreId) -> Result<()> {
        self.set_affinity(&[vc as usize])
    }

    fn move_to_set(&self, mask: &Cpumask) -> Result<()> {
        if mask.is_empty() {
            return Err(Error::InvalidArgument("empty affinity set".into()));
        }
        self.set_affinity(&mask.iter().collect::<Vec<_>>())
    }

    fn affinity(&self) -> Result<Cpumask> {
        let mut mask = Cpumask::new(self.nr_cpu_ids);
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            if libc::sched_getaffinity(self.tid, size_of::<libc::cpu_set_t>(), &mut set) != 0 {
                return Err(self.errno_error("sched_getaffinity"));
            }
            for id in 0..self.nr_cpu_ids {
                if libc::CPU_ISSET(id, &set) {
                    mask.set_cpu(id)?;
                }
            }
        }
        Ok(mask)
    }

    fn virtual_core_id(&self) -> Result<VirtualCoreId> {
        let stat = read_file_string(Path::new(&format!("/proc/{}/stat", self.tid)))
            .map_err(|_| Error::NotFound(format!("thread {} is gone", self.tid)))?;
        // The comm field may contain anything, parse from its closing paren.
        let rest = stat
            .rsplit_once(')')
            .map(|(_, rest)| rest)
            .unwrap_or(&stat);
        let processor = rest
            .split_whitespace()
            .nth(36)
            .ok_or_else(|| Error::Fatal(format!("malformed stat for thread {}", self.tid)))?;
        processor
            .parse()
            .map_err(|e| Error::Fatal(format!("bad processor field {:?}: {}", processor, e)))
    }

    fn priority(&self) -> Result<u32> {
        unsafe {
            // getpriority() can legitimately return -1; clear errno first.
            *libc::__errno_location() = 0;
            let nice = libc::getpriority(libc::PRIO_PROCESS, self.tid as libc::id_t);
            if nice == -1 && *libc::__errno_location() != 0 {
                return Err(self.errno_error("getpriority"));
            }
            Ok((19 - nice) as u32)
        }
    }

    fn set_priority(&self, priority: u32) -> Result<()> {
        if priority > PRIORITY_MAX {
            return Err(Error::InvalidArgument(format!(
                "priority {} outside [{}, {}]",
                priority, PRIORITY_MIN, PRIORITY_MAX
            )));
        }
        let nice = 19 - priority as libc::c_int;
        unsafe {
            if libc::setpriority(libc::PRIO_PROCESS, self.tid as libc::id_t, nice) != 0 {
                return Err(self.errno_error("setpriority"));
            }
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        Path::new(&format!("/proc/{}", self.tid)).exists()
    }
}

/// Pins the calling thread to one virtual core.
pub(crate) fn pin_current_thread(vc: VirtualCoreId) -> Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(vc as usize, &mut set);
        if libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(Error::Unsupported(format!(
                "cannot pin to vc {}: {}",
                vc,
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn this_thread_is_active_and_prioritized() {
        let manager = TasksManager { nr_cpu_ids: 128 };
        let handle = manager.this_thread();
        assert!(handle.is_active());
        let prio = handle.priority().unwrap();
        assert!(prio <= PRIORITY_MAX);
        let affinity = handle.affinity().unwrap();
        assert!(!affinity.is_empty());
    }

    #[test]
    fn priority_out_of_range_is_rejected() {
        let manager = TasksManager { nr_cpu_ids: 128 };
        let handle = manager.this_thread();
        assert!(matches!(
            handle.set_priority(PRIORITY_MAX + 1).unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }
}
