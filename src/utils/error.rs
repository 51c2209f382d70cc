/*
 * Typed errors
 *
 * Resource-exhaustion failures get a `thiserror`-derived enum per
 * subsystem rather than a sentinel value, so callers match exhaustively.
 * Invariant violations still panic (see `irql`, `sched`); expected
 * transients (coalesce declined, steal rejected) still return plain
 * `bool`/`Option` and never appear here.
 */

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("out of physical memory")]
    OutOfPhysicalMemory,
    #[error("out of virtual address space")]
    OutOfAddressSpace,
    #[error("requested alignment is not a power of two")]
    InvalidAlignment,
    #[error("address range is not owned by this allocator")]
    NotOwned,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkqueueError {
    #[error("workqueue ring is full")]
    Full,
    #[error("workqueue has no registered workers")]
    NoWorkers,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BioSchedError {
    #[error("scheduler queue for this priority level is full")]
    QueueFull,
}
