//! Minimal interrupt enable/disable surface.
//!
//! The kernel does not need a full IDT for the memory manager itself; the only thing
//! the allocator cares about is being able to take a critical section that interrupt
//! handlers cannot reenter, and to snapshot/restore whatever state it found.

use crate::machine;

/// Unconditionally enable interrupts.
pub fn enable() {
    unsafe {
        machine::restore_flags(true);
    }
}

/// Unconditionally disable interrupts.
pub fn disable() {
    unsafe {
        machine::cli_save();
    }
}

/// Is the interrupt flag currently set?
pub fn is_enabled() -> bool {
    unsafe { machine::interrupts_enabled() }
}

/// RAII guard that disables interrupts on construction and restores the prior
/// enable state on drop. Used to bracket the slab free-list population loop,
/// which must run as one atomic group because interrupt handlers may themselves
/// allocate from the same size class.
pub struct InterruptGuard {
    was_enabled: bool,
}

impl InterruptGuard {
    pub fn new() -> Self {
        let was_enabled = unsafe { machine::cli_save() };
        InterruptGuard { was_enabled }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        unsafe {
            machine::restore_flags(self.was_enabled);
        }
    }
}
