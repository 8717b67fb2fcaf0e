// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Native-stack segments: the hard-switch substrate.
//!
//! A suspended tasklet that still owns live native frames needs its stack
//! preserved until it is resumed. Raw stack copying is not expressible in
//! safe Rust, so this implementation multiplexes suspended native stacks
//! onto parked OS threads, called *segments*. The thread that entered the
//! scheduler is the *origin* segment and anchors the initial stub; helper
//! segments host the frame dispatch loop and become the captured stack of
//! whichever tasklet hard-suspends on them.
//!
//! At most one segment per scheduler record runs at any time. A transfer
//! unparks the target and then parks (or retires) the source, so execution
//! is strictly serialized, which is the global-lock discipline of the embedding
//! interpreter, with the configured lock hooks invoked around every park.
//!
//! Segments that finished dispatching park in a per-thread pool and are
//! reactivated as fresh stubs; every activation is a new stub epoch and
//! bumps the thread's switch serial.

use crate::sched::SchedThread;
use crate::tasklet::Tasklet;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::Thread;

/// One-slot parker over [`std::thread::park`].
///
/// The stdlib token already latches: an unpark delivered before the park
/// does not block, which keeps the transfer hand-off race-free (the
/// switcher may unpark the target before the target reaches its park
/// point). `std::thread::park` may also return spuriously, so an explicit
/// token decides when the wait is really over.
pub(crate) struct Parker {
    token: AtomicBool,
    /// The thread currently parked here. Different OS threads may park on
    /// the same slot over time (the block lock is taken by whichever
    /// segment drives the scheduler), so the handle is captured per park.
    waiter: spin::Mutex<Option<Thread>>,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self {
            token: AtomicBool::new(false),
            waiter: spin::Mutex::new(None),
        }
    }

    /// Block until a token is available, then consume it.
    pub(crate) fn park(&self) {
        *self.waiter.lock() = Some(std::thread::current());
        while !self.token.swap(false, Ordering::Acquire) {
            std::thread::park();
        }
    }

    /// Deposit a token, waking the parked side if there is one.
    pub(crate) fn unpark(&self) {
        self.token.store(true, Ordering::Release);
        let waiter = self.waiter.lock().clone();
        if let Some(thread) = waiter {
            thread.unpark();
        }
    }
}

/// Work order for a pooled segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentRole {
    /// Run the frame dispatch loop.
    Dispatch,
    /// Unwind and exit the hosting OS thread.
    Shutdown,
}

/// One native stack: either the origin thread or a spawned helper thread.
pub(crate) struct Segment {
    id: u64,
    parker: Parker,
    role: spin::Mutex<Option<SegmentRole>>,
    /// Serial of the stub epoch this segment currently embodies.
    stub_serial: AtomicU64,
    /// Control has moved to another stack; the dispatcher must retire
    /// without touching thread state again.
    detached: AtomicBool,
    origin: bool,
}

static SEGMENT_IDS: AtomicU64 = AtomicU64::new(1);

impl Segment {
    fn new(origin: bool) -> Arc<Self> {
        Arc::new(Self {
            id: SEGMENT_IDS.fetch_add(1, Ordering::Relaxed),
            parker: Parker::new(),
            role: spin::Mutex::new(None),
            stub_serial: AtomicU64::new(0),
            detached: AtomicBool::new(false),
            origin,
        })
    }

    /// Handle for the thread that is entering the scheduler from outside.
    pub(crate) fn origin() -> Arc<Self> {
        Self::new(true)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_origin(&self) -> bool {
        self.origin
    }

    pub(crate) fn stub_serial(&self) -> u64 {
        self.stub_serial.load(Ordering::Relaxed)
    }

    pub(crate) fn set_stub_serial(&self, serial: u64) {
        self.stub_serial.store(serial, Ordering::Relaxed);
    }

    pub(crate) fn set_detached(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub(crate) fn take_detached(&self) -> bool {
        self.detached.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn set_role(&self, role: SegmentRole) {
        *self.role.lock() = Some(role);
    }

    pub(crate) fn take_role(&self) -> Option<SegmentRole> {
        self.role.lock().take()
    }

    /// Park the calling thread on this segment.
    pub(crate) fn park(&self) {
        self.parker.park();
    }

    /// Resume whatever continuation is parked on this segment.
    pub(crate) fn unpark(&self) {
        self.parker.unpark();
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("stub_serial", &self.stub_serial())
            .finish_non_exhaustive()
    }
}

/// A snapshot of a native stack, owned by at most one tasklet.
///
/// A tasklet in a soft-switchable state references its thread's *initial
/// stub* (`nesting_level == 0`); a hard-suspended tasklet references the
/// segment its continuation is parked on. Two tasklets never share a
/// non-stub snapshot.
pub struct NativeStack {
    /// Id of the scheduler record this stack belongs to. Restoring on any
    /// other thread is refused.
    thread: u64,
    thread_ref: Weak<SchedThread>,
    segment: spin::Mutex<Option<Arc<Segment>>>,
    serial: u64,
    nesting: AtomicU32,
    stub: bool,
    /// Back-pointer to the owning tasklet, cleared when the snapshot is
    /// dropped or re-seated.
    task: spin::Mutex<Weak<Tasklet>>,
}

impl NativeStack {
    /// The initial stub of a thread: the origin segment, nesting level zero.
    pub(crate) fn stub(thread: &Arc<SchedThread>, segment: Arc<Segment>, serial: u64) -> Arc<Self> {
        segment.set_stub_serial(serial);
        Arc::new(Self {
            thread: thread.id(),
            thread_ref: Arc::downgrade(thread),
            segment: spin::Mutex::new(Some(segment)),
            serial,
            nesting: AtomicU32::new(0),
            stub: true,
            task: spin::Mutex::new(Weak::new()),
        })
    }

    /// Seal the currently running segment into a snapshot for `task`.
    pub(crate) fn capture(
        thread: &Arc<SchedThread>,
        segment: Arc<Segment>,
        nesting: u32,
        task: &Arc<Tasklet>,
    ) -> Arc<Self> {
        let serial = segment.stub_serial();
        Arc::new(Self {
            thread: thread.id(),
            thread_ref: Arc::downgrade(thread),
            segment: spin::Mutex::new(Some(segment)),
            serial,
            nesting: AtomicU32::new(nesting),
            stub: false,
            task: spin::Mutex::new(Arc::downgrade(task)),
        })
    }

    pub(crate) fn thread_id(&self) -> u64 {
        self.thread
    }

    /// The scheduler record this stack belongs to, if it is still alive.
    pub(crate) fn thread(&self) -> Option<Arc<SchedThread>> {
        self.thread_ref.upgrade()
    }

    pub(crate) fn segment(&self) -> Option<Arc<Segment>> {
        self.segment.lock().clone()
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn nesting_level(&self) -> u32 {
        self.nesting.load(Ordering::Relaxed)
    }

    pub(crate) fn is_stub(&self) -> bool {
        self.stub
    }

    pub(crate) fn task(&self) -> Option<Arc<Tasklet>> {
        self.task.lock().upgrade()
    }

    pub(crate) fn clear_task(&self) {
        *self.task.lock() = Weak::new();
    }
}

impl fmt::Debug for NativeStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeStack")
            .field("thread", &self.thread)
            .field("serial", &self.serial)
            .field("nesting", &self.nesting_level())
            .field("stub", &self.stub)
            .finish_non_exhaustive()
    }
}

/// Spawn a fresh helper segment for `th`. The segment parks immediately and
/// waits for a role.
pub(crate) fn spawn_segment(th: Arc<SchedThread>) -> Arc<Segment> {
    let seg = Segment::new(false);
    let seg2 = Arc::clone(&seg);
    std::thread::Builder::new()
        .name(format!("silk-segment-{}", seg.id()))
        .spawn(move || segment_main(th, seg2))
        .expect("failed to spawn a stack segment");
    seg
}

fn segment_main(th: Arc<SchedThread>, seg: Arc<Segment>) {
    crate::sched::bind_tls(&th, &seg);
    loop {
        seg.park();
        match seg.take_role() {
            Some(SegmentRole::Dispatch) => {
                tracing::trace!(segment = seg.id(), "segment activated as stub");
                crate::sched::dispatch::run(&th);
                th.retire_segment(&seg);
            }
            Some(SegmentRole::Shutdown) | None => break,
        }
    }
    tracing::trace!(segment = seg.id(), "segment exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpark_before_park_is_latched() {
        let p = Parker::new();
        p.unpark();
        // Does not block: the token was deposited up front.
        p.park();
    }

    #[test]
    fn parker_hands_off_between_threads() {
        let p = Arc::new(Parker::new());
        let p2 = Arc::clone(&p);
        let t = std::thread::spawn(move || {
            p2.park();
        });
        p.unpark();
        t.join().unwrap();
    }
}
