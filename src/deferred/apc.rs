/*
 * Asynchronous Procedure Calls
 *
 * Per-thread deferred work delivered at APC_LEVEL, once IRQL drops below
 * it on the thread's own CPU (see `irql::lower`'s drain hook). Three
 * kinds, in delivery priority order: SPECIAL_KERNEL (never blocked by
 * `kernel_apc_disable`), KERNEL (blocked by `kernel_apc_disable`), and
 * EVENT (delivered to a specific waiting thread, carries a wake reason
 * the caller already applied before queuing).
 */

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::irql;
use crate::sched::{thread, ThreadId};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(usize)]
pub enum ApcType {
    SpecialKernel = 0,
    Kernel = 1,
    Event = 2,
}

static NEXT_APC_ID: AtomicU64 = AtomicU64::new(1);

pub struct Apc {
    id: u64,
    pub ty: ApcType,
    cancelled: Arc<AtomicBool>,
    routine: Box<dyn FnOnce() + Send>,
}

impl Apc {
    pub fn new(ty: ApcType, routine: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id: NEXT_APC_ID.fetch_add(1, Ordering::Relaxed),
            ty,
            cancelled: Arc::new(AtomicBool::new(false)),
            routine: Box::new(routine),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A handle returned by `queue`, usable from any context to cancel the
/// APC before it is delivered. Per §4.4: "Cancellation is atomic: sets a
/// cancelled flag, unlinks from any per-type list, clears the pending bit
/// if that list is now empty."
#[derive(Clone)]
pub struct ApcHandle {
    target: ThreadId,
    ty: ApcType,
    id: u64,
    cancelled: Arc<AtomicBool>,
}

fn pending_bit(ty: ApcType) -> u8 {
    1 << (ty as u8)
}

/// Queues `apc` on `target`'s list for its type. If `target` is the
/// calling thread and IRQL is already below APC_LEVEL, nothing drains it
/// immediately here — delivery only happens through `irql::lower`'s hook
/// or an explicit `drain_current_thread` call, so queuing is always a
/// cheap, non-reentrant operation. Returns a handle the caller can pass
/// to `cancel` before the APC runs.
pub fn queue(target: ThreadId, apc: Apc) -> ApcHandle {
    let ty = apc.ty;
    let id = apc.id;
    let cancelled = apc.cancelled.clone();
    thread::with_mut(target, |t| {
        t.apc_list_mut(ty).push(apc);
        t.apc_pending_mask |= pending_bit(ty);
    });
    ApcHandle { target, ty, id, cancelled }
}

/// Cancels a queued APC before it is delivered. Sets the cancelled flag,
/// unlinks the APC from its owner's per-type list under the thread lock
/// (so it can never race a concurrent `drain` of the same thread), and
/// clears the type's pending bit if the list is now empty. A no-op if the
/// APC already ran or was already cancelled.
pub fn cancel(handle: &ApcHandle) {
    handle.cancelled.store(true, Ordering::Release);
    thread::with_mut(handle.target, |t| {
        let list = t.apc_list_mut(handle.ty);
        if let Some(pos) = list.iter().position(|a| a.id == handle.id) {
            list.remove(pos);
        }
        if t.apc_list_mut(handle.ty).is_empty() {
            t.apc_pending_mask &= !pending_bit(handle.ty);
        }
    });
}

/// Drains every deliverable APC for the calling thread, in
/// SpecialKernel, Kernel, Event order, respecting the disable counters.
/// Called from `irql::lower` whenever IRQL crosses back below APC_LEVEL;
/// also callable directly (e.g. after decrementing a disable counter).
pub fn drain_current_thread() {
    drain(crate::sched::current_id());
}

/// Drains a specific thread's deliverable APCs. Only safe to call for a
/// thread that is not concurrently running on another CPU — in practice
/// always the calling thread (`drain_current_thread`), exposed separately
/// so tests can exercise ordering without a live scheduler.
pub(crate) fn drain(tid: ThreadId) {
    fn pop_front(t: &mut thread::Thread, ty: ApcType) -> Option<Apc> {
        if t.apc_list_mut(ty).is_empty() {
            return None;
        }
        let apc = t.apc_list_mut(ty).remove(0);
        if t.apc_list_mut(ty).is_empty() {
            t.apc_pending_mask &= !pending_bit(ty);
        }
        Some(apc)
    }

    loop {
        let next = thread::with_mut(tid, |t| {
            if t.apc_pending_mask & pending_bit(ApcType::SpecialKernel) != 0 {
                if let Some(apc) = pop_front(t, ApcType::SpecialKernel) {
                    return Some(apc);
                }
            }
            if t.kernel_apc_disable == 0 && t.apc_pending_mask & pending_bit(ApcType::Kernel) != 0 {
                if let Some(apc) = pop_front(t, ApcType::Kernel) {
                    return Some(apc);
                }
            }
            if t.apc_pending_mask & pending_bit(ApcType::Event) != 0 {
                if let Some(apc) = pop_front(t, ApcType::Event) {
                    return Some(apc);
                }
            }
            None
        })
        .flatten();

        match next {
            // `cancel` already unlinks under the same thread-table lock
            // this loop takes, so a cancelled APC should never surface
            // here — the `is_cancelled` check is defense in depth, not
            // the primary mechanism.
            Some(apc) if !apc.is_cancelled() => (apc.routine)(),
            Some(_) => continue,
            None => break,
        }
    }
}

/// Disables KERNEL-mode APC delivery on the calling thread; matching
/// `enable_kernel_apcs` decrements and drains anything that queued up
/// while disabled. Nests like a reference count, per §4.6.
pub fn disable_kernel_apcs() {
    let tid = crate::sched::current_id();
    thread::with_mut(tid, |t| t.kernel_apc_disable += 1);
}

pub fn enable_kernel_apcs() {
    let tid = crate::sched::current_id();
    let zero = thread::with_mut(tid, |t| {
        t.kernel_apc_disable = t.kernel_apc_disable.saturating_sub(1);
        t.kernel_apc_disable == 0
    })
    .unwrap_or(false);
    if zero && irql::get() < irql::APC {
        drain_current_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::PriorityClass;
    use core::sync::atomic::{AtomicU32, Ordering};

    static HITS: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn special_kernel_apc_drains_before_kernel() {
        crate::irql::init_cpu();
        HITS.store(0, Ordering::SeqCst);
        let tid = thread::spawn("apc-test", PriorityClass::Normal, None);
        queue(tid, Apc::new(ApcType::Kernel, || {
            HITS.fetch_add(10, Ordering::SeqCst);
        }));
        queue(tid, Apc::new(ApcType::SpecialKernel, || {
            HITS.fetch_add(1, Ordering::SeqCst);
        }));

        drain(tid);
        assert_eq!(HITS.load(Ordering::SeqCst), 11);
        assert_eq!(thread::with(tid, |t| t.apc_pending_mask).unwrap(), 0);
    }

    #[test]
    fn kernel_apc_disable_blocks_delivery_but_not_special() {
        crate::irql::init_cpu();
        let tid = thread::spawn("apc-disable-test", PriorityClass::Normal, None);
        thread::with_mut(tid, |t| t.kernel_apc_disable = 1);
        queue(tid, Apc::new(ApcType::Kernel, || {}));
        let mask = thread::with(tid, |t| t.apc_pending_mask).unwrap();
        assert_ne!(mask & (1 << (ApcType::Kernel as u8)), 0);
    }

    #[test]
    fn cancelled_apc_never_runs() {
        crate::irql::init_cpu();
        HITS.store(0, Ordering::SeqCst);
        let tid = thread::spawn("apc-cancel-test", PriorityClass::Normal, None);
        let handle = queue(tid, Apc::new(ApcType::Kernel, || {
            HITS.fetch_add(1, Ordering::SeqCst);
        }));

        cancel(&handle);

        assert_eq!(thread::with(tid, |t| t.apc_pending_mask).unwrap(), 0);
        drain(tid);
        assert_eq!(HITS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_clears_pending_bit_only_when_list_empties() {
        crate::irql::init_cpu();
        let tid = thread::spawn("apc-cancel-partial", PriorityClass::Normal, None);
        let h1 = queue(tid, Apc::new(ApcType::Kernel, || {}));
        let _h2 = queue(tid, Apc::new(ApcType::Kernel, || {}));

        cancel(&h1);

        // One KERNEL apc remains queued, so the pending bit must still be set.
        let mask = thread::with(tid, |t| t.apc_pending_mask).unwrap();
        assert_ne!(mask & (1 << (ApcType::Kernel as u8)), 0);
    }
}
