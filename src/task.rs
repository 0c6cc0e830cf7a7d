//! The thinnest possible model of "the current task", just enough for the memory
//! manager to tell kernel context from user context and to find the right
//! virtual-address space and block descriptors to operate on.
//!
//! The actual scheduler that decides *which* task runs next lives outside this
//! crate; all we model here is the fact a scheduler would hand us: who is running
//! right now, and whether they have a page directory of their own.

use spin::Mutex;

use crate::config::DESC_COUNT;
use crate::memory::heap::BlockDesc;
use crate::memory::virt_space::VirtAddrSpace;

/// Which physical/virtual pool a request should be serviced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Kernel,
    User,
}

/// A user task's private allocator state. Kernel threads share one process-wide
/// set of these instead (see `memory::kernel_block_descs`).
pub struct Task {
    /// Physical address of this task's page directory. Kernel threads have none.
    pub pgdir: Option<u32>,
    pub vspace: VirtAddrSpace,
    pub block_descs: [BlockDesc; DESC_COUNT],
}

impl Task {
    pub fn new_user(pgdir: u32, vspace: VirtAddrSpace, block_descs: [BlockDesc; DESC_COUNT]) -> Self {
        Task {
            pgdir: Some(pgdir),
            vspace,
            block_descs,
        }
    }
}

/// The task presently executing on this CPU. `None` means a kernel thread with no
/// task of its own is running.
static CURRENT: Mutex<Option<Task>> = Mutex::new(None);

/// Install (or clear) the current task. Called by the scheduler on a context switch.
pub fn set_current(task: Option<Task>) {
    *CURRENT.lock() = task;
}

/// Which domain is the currently running context in.
pub fn domain() -> Domain {
    if CURRENT.lock().as_ref().map_or(false, |t| t.pgdir.is_some()) {
        Domain::User
    } else {
        Domain::Kernel
    }
}

/// Run `f` with mutable access to the current user task, if there is one.
/// Returns `None` if a kernel thread (no task) is current.
pub fn with_current<R>(f: impl FnOnce(&mut Task) -> R) -> Option<R> {
    CURRENT.lock().as_mut().map(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_current_task_is_kernel_domain() {
        set_current(None);
        assert_eq!(domain(), Domain::Kernel);
    }
}
