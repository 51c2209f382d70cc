/*
 * Bio scheduler
 *
 * A generic, device-agnostic 5-level multi-level feedback queue sitting
 * between filesystem/cache callers and a block driver's
 * `submit_bio_async`. Devices plug in two optimizations through a
 * `SchedulerOps` capability table (mirroring the IRQ-chip-ops / block-
 * device-ops pattern used throughout the core, per §9's "capability
 * tables instead of deep inheritance" note): coalescing, which merges two
 * adjacent requests into one, and reordering, which is left as a named
 * stub (`noop_reorder`) for device-specific policies to override rather
 * than guessed at here.
 *
 * `URGENT` requests bypass the queue entirely: `submit_bio_async` sees
 * them before they ever touch a `Request`'s scheduling state. Every other
 * request sits in its priority's FIFO until dispatched, coalesced away
 * (merged into a higher-priority sibling and dropped from the queue), or
 * boosted into a higher queue after waiting too long.
 */

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::block::{BlockDevice, Direction, Lba};
use crate::sync::spinlock::Spinlock;
use crate::utils::error::BioSchedError;

/// How many priority levels the MLFQ has.
pub const LEVELS: usize = 5;
/// Highest valid level index (`URGENT`).
pub const MAX_LEVEL: usize = LEVELS - 1;

/// First boost always raises priority by exactly one level.
const STARVATION_BOOST: u32 = 1;
/// `adjusted_wait = base_wait >> min(boost_count, BOOST_SHIFT_LIMIT)`.
const BOOST_SHIFT_LIMIT: u32 = 4;
/// How many candidates to scan forward within a queue before bailing.
const COALESCE_SCAN_LIMIT: usize = 8;
/// Max coalesces performed in one `enqueue` call.
const MAX_COALESCES: usize = 4;
/// Starvation boosts never raise a request all the way to `URGENT` —
/// `URGENT` bypasses the queue entirely (direct submit) and is reserved
/// for callers that ask for it explicitly, not for the boost ladder.
/// Per §4.10/scenario #3, the ceiling is `URGENT - 1`, i.e. `HIGH`.
pub const BIO_SCHED_MAX: usize = MAX_LEVEL - 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum Priority {
    Background = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Urgent = 4,
}

impl Priority {
    fn from_index(idx: usize) -> Priority {
        match idx.min(MAX_LEVEL) {
            0 => Priority::Background,
            1 => Priority::Low,
            2 => Priority::Medium,
            3 => Priority::High,
            _ => Priority::Urgent,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Completion callback: invoked once a request is actually transferred
/// (or failed). The scheduler never interprets `status`; only this
/// callback and whoever inspects it afterward do (§7).
pub type CompletionFn = alloc::boxed::Box<dyn FnOnce(&Request) + Send>;

/// A block I/O request. Mutable scheduling state (`priority`, `skip`,
/// `is_aggregate`, `sector_count`, `boost_count`, `enqueue_time`,
/// `status`, `done`) lives behind atomics rather than a lock so the
/// caller's `Arc<Request>` handle stays readable (and, for completion,
/// writable) while the scheduler concurrently holds its own clone of the
/// same `Arc` in a queue.
pub struct Request {
    pub device: &'static dyn BlockDevice,
    pub lba: Lba,
    pub direction: Direction,
    pub buffer: spin::Mutex<Vec<u8>>,
    priority: AtomicU32,
    skip: AtomicBool,
    is_aggregate: AtomicBool,
    sector_count: AtomicU32,
    boost_count: AtomicU32,
    enqueue_time: AtomicU64,
    status: AtomicI32,
    done: AtomicBool,
    completion: spin::Mutex<Option<CompletionFn>>,
    pub driver_private: spin::Mutex<Option<alloc::boxed::Box<dyn Any + Send>>>,
}

impl Request {
    pub fn new(
        device: &'static dyn BlockDevice,
        lba: Lba,
        direction: Direction,
        priority: Priority,
        sector_count: u32,
        buffer: Vec<u8>,
        completion: Option<CompletionFn>,
    ) -> Arc<Request> {
        Arc::new(Request {
            device,
            lba,
            direction,
            buffer: spin::Mutex::new(buffer),
            priority: AtomicU32::new(priority.index() as u32),
            skip: AtomicBool::new(false),
            is_aggregate: AtomicBool::new(false),
            sector_count: AtomicU32::new(sector_count),
            boost_count: AtomicU32::new(0),
            enqueue_time: AtomicU64::new(0),
            status: AtomicI32::new(-1),
            done: AtomicBool::new(false),
            completion: spin::Mutex::new(completion),
            driver_private: spin::Mutex::new(None),
        })
    }

    pub fn priority(&self) -> Priority {
        Priority::from_index(self.priority.load(Ordering::Acquire) as usize)
    }

    fn set_priority(&self, p: Priority) {
        self.priority.store(p.index() as u32, Ordering::Release);
    }

    pub fn is_skip(&self) -> bool {
        self.skip.load(Ordering::Acquire)
    }

    fn mark_skip(&self) {
        self.skip.store(true, Ordering::Release);
    }

    pub fn is_aggregate(&self) -> bool {
        self.is_aggregate.load(Ordering::Acquire)
    }

    fn mark_aggregate(&self) {
        self.is_aggregate.store(true, Ordering::Release);
    }

    pub fn sector_count(&self) -> u32 {
        self.sector_count.load(Ordering::Acquire)
    }

    pub fn set_sector_count(&self, count: u32) {
        self.sector_count.store(count, Ordering::Release);
    }

    pub fn boost_count(&self) -> u32 {
        self.boost_count.load(Ordering::Acquire)
    }

    fn bump_boost(&self, new_priority: Priority) {
        self.boost_count.fetch_add(1, Ordering::AcqRel);
        self.set_priority(new_priority);
    }

    pub fn enqueue_time(&self) -> u64 {
        self.enqueue_time.load(Ordering::Acquire)
    }

    fn set_enqueue_time(&self, now: u64) {
        self.enqueue_time.store(now, Ordering::Release);
    }

    pub fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }

    pub fn set_status(&self, status: i32) {
        self.status.store(status, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Marks the request done and fires its completion callback, if any.
    /// Called by drivers once a transfer (real or simulated) finishes.
    pub fn complete(self: &Arc<Request>) {
        self.done.store(true, Ordering::Release);
        let cb = self.completion.lock().take();
        if let Some(cb) = cb {
            cb(self);
        }
    }
}

/// Device-specific policy hooks (§4.10). `should_coalesce`/`do_coalesce`
/// default to the original's `noop_should_coalesce`/`noop_do_coalesce`
/// (never coalesce); `reorder` defaults to `noop_reorder`. Per §9's open
/// question, these stub defaults are preserved explicitly rather than
/// guessed at — a device that wants coalescing or reordering overrides
/// them itself.
pub trait SchedulerOps: Send + Sync {
    fn should_coalesce(&self, _device: &dyn BlockDevice, _a: &Request, _b: &Request) -> bool {
        noop_should_coalesce()
    }

    fn do_coalesce(&self, _device: &dyn BlockDevice, _into: &Request, _from: &Request) {
        noop_do_coalesce()
    }

    /// Stub: the original's `noop_reorder` does nothing. A device that
    /// benefits from request reordering (e.g. to minimize seek distance)
    /// overrides this to reorder its own queues in place.
    fn reorder(&self, _device: &dyn BlockDevice) {
        noop_reorder()
    }

    /// Per-level queue depth cap. Unbounded by default; a device backed
    /// by scarce DMA descriptors overrides this to push back instead of
    /// growing the queue without limit.
    fn queue_capacity(&self) -> usize {
        usize::MAX
    }

    fn max_wait_time(&self) -> [u32; LEVELS];
    fn dispatch_threshold(&self) -> u32;
    fn boost_occupance_limit(&self) -> [u64; LEVELS];
    fn tick_ms(&self) -> u64;
    fn min_wait_ms(&self) -> u64;
}

pub fn noop_should_coalesce() -> bool {
    false
}

pub fn noop_do_coalesce() {}

pub fn noop_reorder() {}

struct Inner {
    queues: [VecDeque<Arc<Request>>; LEVELS],
    dirty: [bool; LEVELS],
}

pub struct Scheduler {
    device: &'static dyn BlockDevice,
    ops: &'static dyn SchedulerOps,
    inner: Spinlock<Inner>,
    total_requests: AtomicU64,
}

fn now_ms() -> u64 {
    // No calibrated wall clock this deep in the core; the HPET-driven
    // tick counter (`deferred::timer`) stands in for milliseconds, same
    // approximation the timer module itself documents.
    crate::deferred::timer::now()
}

impl Scheduler {
    pub fn create(device: &'static dyn BlockDevice, ops: &'static dyn SchedulerOps) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            device,
            ops,
            inner: Spinlock::new(Inner {
                queues: core::array::from_fn(|_| VecDeque::new()),
                dirty: [false; LEVELS],
            }),
            total_requests: AtomicU64::new(0),
        })
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        let guard = self.inner.lock();
        guard.queues.iter().all(VecDeque::is_empty)
    }

    /// §4.10's enqueue algorithm: bypass for urgent/skip-scheduling
    /// requests, stamp and enqueue, coalesce up to `MAX_COALESCES`
    /// rounds, dispatch early if the device is backed up, then boost any
    /// requests that have been starving. Fails with `QueueFull` if the
    /// target level is already at `ops.queue_capacity()` — the caller is
    /// expected to retry after a dispatch drains the queue.
    pub fn enqueue(&self, req: Arc<Request>) -> Result<(), BioSchedError> {
        if self.device.skip_sched() || req.priority() == Priority::Urgent {
            self.device.submit_bio_async(req);
            return Ok(());
        }

        req.set_enqueue_time(now_ms());
        let level = req.priority().index();
        {
            let mut guard = self.inner.lock();
            if guard.queues[level].len() >= self.ops.queue_capacity() {
                return Err(BioSchedError::QueueFull);
            }
            guard.queues[level].push_back(req);
            guard.dirty[level] = true;
        }
        self.total_requests.fetch_add(1, Ordering::AcqRel);

        for _ in 0..MAX_COALESCES {
            if !self.try_coalesce_round() {
                break;
            }
        }

        if self.total_requests.load(Ordering::Acquire) as u32 > self.ops.dispatch_threshold() {
            self.dispatch_highest_nonempty();
        }

        self.boost_starved();
        Ok(())
    }

    /// Removes `req` from whichever queue still holds it (a no-op if it
    /// has already been dispatched, coalesced away, or submitted
    /// urgently). Leaves `total_requests` consistent with what remains
    /// enqueued.
    pub fn dequeue(&self, req: &Arc<Request>) -> bool {
        let mut guard = self.inner.lock();
        for level in 0..LEVELS {
            if let Some(pos) = guard.queues[level].iter().position(|r| Arc::ptr_eq(r, req)) {
                guard.queues[level].remove(pos);
                drop(guard);
                self.total_requests.fetch_sub(1, Ordering::AcqRel);
                return true;
            }
        }
        false
    }

    /// One pass of `bio_sched_try_coalesce`: intra-queue coalescing for
    /// every level, then cross-priority folding between each adjacent
    /// pair. Returns whether anything merged this round (callers loop
    /// this up to `MAX_COALESCES` times).
    fn try_coalesce_round(&self) -> bool {
        let mut coalesced_any = false;
        for level in 0..LEVELS {
            if self.coalesce_within_queue(level) {
                coalesced_any = true;
            }
        }
        for level in 0..MAX_LEVEL {
            if self.coalesce_adjacent(level, level + 1) {
                coalesced_any = true;
            }
        }
        coalesced_any
    }

    fn coalesce_within_queue(&self, level: usize) -> bool {
        let mut guard = self.inner.lock();
        if guard.queues[level].is_empty() || !guard.dirty[level] {
            return false;
        }
        let len = guard.queues[level].len();
        let mut coalesced = false;
        let mut coalesces_left = MAX_COALESCES;
        let mut to_remove: Vec<usize> = Vec::new();

        'outer: for i in 0..len {
            if coalesces_left == 0 {
                break;
            }
            if to_remove.contains(&i) {
                continue;
            }
            let into = guard.queues[level][i].clone();
            if into.is_skip() {
                continue;
            }
            let scan_end = (i + 1 + COALESCE_SCAN_LIMIT).min(len);
            for j in (i + 1)..scan_end {
                if to_remove.contains(&j) {
                    continue;
                }
                let from = guard.queues[level][j].clone();
                if from.is_skip() {
                    continue;
                }
                if self.ops.should_coalesce(self.device, &into, &from) {
                    self.ops.do_coalesce(self.device, &into, &from);
                    into.mark_aggregate();
                    from.mark_skip();
                    to_remove.push(j);
                    coalesced = true;
                    coalesces_left -= 1;
                    if coalesces_left == 0 {
                        break 'outer;
                    }
                }
            }
        }

        if !to_remove.is_empty() {
            to_remove.sort_unstable_by(|a, b| b.cmp(a));
            to_remove.dedup();
            let removed = to_remove.len();
            for idx in to_remove {
                guard.queues[level].remove(idx);
            }
            guard.dirty[level] = false;
            drop(guard);
            self.total_requests.fetch_sub(removed as u64, Ordering::AcqRel);
        } else {
            guard.dirty[level] = false;
        }
        coalesced
    }

    /// Folds candidates from `lower` into `higher` (a lower-priority
    /// request merged into a higher-priority one is dispatched sooner,
    /// as part of the aggregate). Only one coalesce per lower candidate.
    fn coalesce_adjacent(&self, lower: usize, higher: usize) -> bool {
        let mut guard = self.inner.lock();
        if guard.queues[lower].is_empty() || guard.queues[higher].is_empty() {
            return false;
        }
        if !guard.dirty[lower] || !guard.dirty[higher] {
            return false;
        }

        let mut coalesced = false;
        let mut coalesces_left = MAX_COALESCES;
        let mut lower_remove: Vec<usize> = Vec::new();
        let lower_len = guard.queues[lower].len();

        'outer: for li in 0..lower_len {
            if coalesces_left == 0 {
                break;
            }
            let from = guard.queues[lower][li].clone();
            if from.is_skip() {
                continue;
            }
            let higher_len = guard.queues[higher].len();
            for hi in 0..higher_len {
                let into = guard.queues[higher][hi].clone();
                if into.is_skip() {
                    continue;
                }
                if self.ops.should_coalesce(self.device, &into, &from) {
                    self.ops.do_coalesce(self.device, &into, &from);
                    into.mark_aggregate();
                    from.mark_skip();
                    lower_remove.push(li);
                    coalesced = true;
                    coalesces_left -= 1;
                    break; // only one coalesce per candidate
                }
            }
            if coalesces_left == 0 {
                break 'outer;
            }
        }

        if !lower_remove.is_empty() {
            lower_remove.sort_unstable_by(|a, b| b.cmp(a));
            lower_remove.dedup();
            let removed = lower_remove.len();
            for idx in lower_remove {
                guard.queues[lower].remove(idx);
            }
            guard.dirty[lower] = false;
            guard.dirty[higher] = false;
            drop(guard);
            self.total_requests.fetch_sub(removed as u64, Ordering::AcqRel);
        } else {
            guard.dirty[lower] = false;
            guard.dirty[higher] = false;
        }
        coalesced
    }

    /// Pops the head of the highest non-empty queue and submits it.
    pub fn dispatch_highest_nonempty(&self) {
        let req = {
            let mut guard = self.inner.lock();
            let mut found = None;
            for level in (0..LEVELS).rev() {
                if let Some(front) = guard.queues[level].pop_front() {
                    found = Some(front);
                    break;
                }
            }
            found
        };
        if let Some(req) = req {
            self.total_requests.fetch_sub(1, Ordering::AcqRel);
            self.device.submit_bio_async(req);
        }
    }

    /// Drains and dispatches every request still queued, highest
    /// priority first. Used for device shutdown/flush.
    pub fn dispatch_all(&self) {
        while !self.is_empty() {
            self.dispatch_highest_nonempty();
        }
    }

    /// §4.10's starvation-boost algorithm: a request becomes eligible
    /// once `now > enqueue_time + (max_wait_time[level] >> min(boost_count,
    /// BOOST_SHIFT_LIMIT))`, floored by `min_wait_ms`. The first boost
    /// always raises priority by one level; later boosts raise by a
    /// bigger step (capped at `BIO_SCHED_MAX`, one below `URGENT`), gated
    /// by the target level's occupancy limit so a boost can't flood an
    /// already-busy queue.
    pub fn boost_starved(&self) -> bool {
        self.boost_starved_at(now_ms())
    }

    /// Same as `boost_starved`, but against an explicit timestamp instead
    /// of the live clock — lets tests exercise the boost math
    /// deterministically without racing other tests over a shared clock.
    pub fn boost_starved_at(&self, now: u64) -> bool {
        let max_wait = self.ops.max_wait_time();
        let min_wait = self.ops.min_wait_ms();
        let occupance_limit = self.ops.boost_occupance_limit();

        let mut candidates: Vec<(usize, Arc<Request>, usize)> = Vec::new();
        {
            let guard = self.inner.lock();
            for level in 0..MAX_LEVEL {
                for req in guard.queues[level].iter() {
                    if req.is_skip() {
                        continue;
                    }
                    let boost_count = req.boost_count();
                    let shift = boost_count.min(BOOST_SHIFT_LIMIT);
                    let base_wait = max_wait[level] as u64;
                    let adjusted_wait = (base_wait >> shift).max(min_wait);
                    if now <= req.enqueue_time().saturating_add(adjusted_wait) {
                        continue;
                    }
                    let step = if boost_count >= 3 {
                        2
                    } else if boost_count >= STARVATION_BOOST {
                        1
                    } else {
                        0
                    };
                    let to = (level + 1 + step as usize).min(BIO_SCHED_MAX);
                    if to == level {
                        continue;
                    }
                    if (guard.queues[to].len() as u64) < occupance_limit[to] {
                        candidates.push((level, req.clone(), to));
                    }
                }
            }
        }

        if candidates.is_empty() {
            return false;
        }

        let mut guard = self.inner.lock();
        let mut boosted_any = false;
        for (from, req, to) in candidates {
            if let Some(pos) = guard.queues[from].iter().position(|r| Arc::ptr_eq(r, &req)) {
                guard.queues[from].remove(pos);
                req.bump_boost(Priority::from_index(to));
                guard.queues[to].push_back(req);
                boosted_any = true;
            }
        }
        boosted_any
    }

    /// Periodic maintenance driven by `ops.tick_ms()`: re-runs the
    /// starvation boost and coalesce passes even when nothing new is
    /// enqueued, per §4.10's "checked automatically every tick_ms" note.
    pub fn tick(&self) {
        self.boost_starved();
        for _ in 0..MAX_COALESCES {
            if !self.try_coalesce_round() {
                break;
            }
        }
        self.ops.reorder(self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use core::sync::atomic::{AtomicUsize, Ordering as O};

    struct TestDevice {
        submitted: spin::Mutex<Vec<Arc<Request>>>,
        skip: bool,
    }

    impl BlockDevice for TestDevice {
        fn read_sector(&self, _lba: Lba, _buf: &mut [u8], _sector_count: u32) -> bool {
            true
        }
        fn write_sector(&self, _lba: Lba, _buf: &[u8], _sector_count: u32) -> bool {
            true
        }
        fn submit_bio_async(&self, request: Arc<Request>) {
            self.submitted.lock().push(request);
        }
        fn skip_sched(&self) -> bool {
            self.skip
        }
    }

    struct AdjacentCoalesceOps;
    impl SchedulerOps for AdjacentCoalesceOps {
        fn should_coalesce(&self, _d: &dyn BlockDevice, a: &Request, b: &Request) -> bool {
            b.lba == a.lba + a.sector_count() as u64
        }
        fn do_coalesce(&self, _d: &dyn BlockDevice, into: &Request, from: &Request) {
            into.set_sector_count(into.sector_count() + from.sector_count());
        }
        fn max_wait_time(&self) -> [u32; LEVELS] {
            [75, 75, 75, 75, 75]
        }
        fn dispatch_threshold(&self) -> u32 {
            1000
        }
        fn boost_occupance_limit(&self) -> [u64; LEVELS] {
            [1000; LEVELS]
        }
        fn tick_ms(&self) -> u64 {
            10
        }
        fn min_wait_ms(&self) -> u64 {
            2
        }
    }

    fn leak_device(skip: bool) -> &'static TestDevice {
        alloc::boxed::Box::leak(Box::new(TestDevice { submitted: spin::Mutex::new(Vec::new()), skip }))
    }

    fn leak_ops() -> &'static AdjacentCoalesceOps {
        alloc::boxed::Box::leak(Box::new(AdjacentCoalesceOps))
    }

    #[test]
    fn urgent_requests_bypass_the_queue() {
        let device = leak_device(false);
        let ops = leak_ops();
        let sched = Scheduler::create(device, ops);
        let req = Request::new(device, 0, Direction::Read, Priority::Urgent, 1, alloc::vec![0; 512], None);
        sched.enqueue(req).expect("urgent requests never hit the queue-full path");
        assert!(sched.is_empty());
        assert_eq!(device.submitted.lock().len(), 1);
    }

    #[test]
    fn adjacent_requests_coalesce_into_one_aggregate() {
        let device = leak_device(false);
        let ops = leak_ops();
        let sched = Scheduler::create(device, ops);
        let r1 = Request::new(device, 0, Direction::Read, Priority::Medium, 8, alloc::vec![0; 4096], None);
        let r2 = Request::new(device, 8, Direction::Read, Priority::Medium, 8, alloc::vec![0; 4096], None);
        sched.enqueue(r1.clone()).expect("enqueue should succeed");
        sched.enqueue(r2.clone()).expect("enqueue should succeed");

        assert!(r1.is_aggregate());
        assert!(r2.is_skip());
        assert_eq!(r1.sector_count(), 16);
        assert_eq!(sched.total_requests(), 1);
    }

    #[test]
    fn starvation_boost_caps_below_urgent() {
        let device = leak_device(false);
        let ops = leak_ops();
        let sched = Scheduler::create(device, ops);
        let req = Request::new(device, 100, Direction::Read, Priority::Low, 1, alloc::vec![0; 512], None);
        sched.enqueue(req.clone()).expect("enqueue should succeed");
        req.set_enqueue_time(0);

        // First boost: now = 80ms, base_wait[LOW]=75 -> boosts to MEDIUM.
        sched.boost_starved_at(80);
        assert_eq!(req.priority(), Priority::Medium);
        assert_eq!(req.boost_count(), 1);

        // Second boost 80ms later: boost_count>=1 -> step=1 -> HIGH, never URGENT.
        req.set_enqueue_time(80);
        sched.boost_starved_at(160);
        assert_eq!(req.priority(), Priority::High);
        assert!(req.priority() < Priority::Urgent);
    }

    #[test]
    fn dequeue_removes_without_disturbing_count() {
        let device = leak_device(false);
        let ops = leak_ops();
        let sched = Scheduler::create(device, ops);
        let r1 = Request::new(device, 0, Direction::Read, Priority::Background, 1, alloc::vec![0; 512], None);
        let r2 = Request::new(device, 1000, Direction::Read, Priority::Background, 1, alloc::vec![0; 512], None);
        sched.enqueue(r1.clone()).expect("enqueue should succeed");
        sched.enqueue(r2.clone()).expect("enqueue should succeed");
        let before = sched.total_requests();
        assert!(sched.dequeue(&r1));
        assert_eq!(sched.total_requests(), before - 1);
    }

    #[test]
    fn device_skip_sched_bypasses_queue_entirely() {
        let device = leak_device(true);
        let ops = leak_ops();
        let sched = Scheduler::create(device, ops);
        let req = Request::new(device, 0, Direction::Read, Priority::Background, 1, alloc::vec![0; 512], None);
        sched.enqueue(req).expect("skip_sched devices never hit the queue-full path");
        assert_eq!(device.submitted.lock().len(), 1);
    }

    #[test]
    fn enqueue_rejects_once_the_level_is_at_capacity() {
        struct CappedOps;
        impl SchedulerOps for CappedOps {
            fn queue_capacity(&self) -> usize {
                1
            }
            fn max_wait_time(&self) -> [u32; LEVELS] {
                [1_000_000; LEVELS]
            }
            fn dispatch_threshold(&self) -> u32 {
                1000
            }
            fn boost_occupance_limit(&self) -> [u64; LEVELS] {
                [1000; LEVELS]
            }
            fn tick_ms(&self) -> u64 {
                10
            }
            fn min_wait_ms(&self) -> u64 {
                2
            }
        }

        let device = leak_device(false);
        let ops: &'static CappedOps = alloc::boxed::Box::leak(Box::new(CappedOps));
        let sched = Scheduler::create(device, ops);
        let r1 = Request::new(device, 0, Direction::Read, Priority::Background, 1, alloc::vec![0; 512], None);
        let r2 = Request::new(device, 1000, Direction::Read, Priority::Background, 1, alloc::vec![0; 512], None);
        sched.enqueue(r1).expect("first request fits under capacity 1");
        assert_eq!(sched.enqueue(r2), Err(BioSchedError::QueueFull));
        assert_eq!(sched.total_requests(), 1);
    }

    #[test]
    fn completion_callback_fires_once() {
        let device = leak_device(false);
        static HITS: AtomicUsize = AtomicUsize::new(0);
        let req = Request::new(
            device,
            0,
            Direction::Read,
            Priority::Urgent,
            1,
            alloc::vec![0; 512],
            Some(alloc::boxed::Box::new(|_r: &Request| {
                HITS.fetch_add(1, O::SeqCst);
            })),
        );
        req.complete();
        assert_eq!(HITS.load(O::SeqCst), 1);
    }
}
