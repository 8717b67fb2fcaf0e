// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # Scheduler Subsystem
//!
//! Per OS thread the runtime keeps one [`SchedThread`] record: the circular
//! ready queue (head = current tasklet), the distinguished main tasklet,
//! switch serials, tick counters, the watchdog stack, the block lock used to
//! park an idle thread, and the mirrored slices of interpreter state
//! (staged frame, recursion depth, exception info, context, trace state)
//! that the switch engine exchanges between tasklets.
//!
//! A [`Runtime`] owns the registry of thread records plus everything that
//! is per-embedding rather than per-thread: callbacks, the error handler,
//! the lock and exit hooks, and default pickle flags. Records find each
//! other through the registry for inter-thread hand-offs and for the
//! deadlock check.
//!
//! All mutations of a record happen behind its single `spin::Mutex`; the
//! lock is never held across a park, a callback, or a frame call.

pub(crate) mod dispatch;
mod schedule;
mod watchdog;

pub use schedule::schedule_task;
pub use watchdog::{run_watchdog, run_watchdog_ex, RunFlags};

use crate::channel::Channel;
use crate::error::{fatal, Exception};
use crate::frame::FrameRef;
use crate::stack::{NativeStack, Parker, Segment, SegmentRole};
use crate::tasklet::{Container, ExcInfoRef, ExcItem, Tasklet, TaskletRef, TraceSlot};
use crate::unwind::{self, Soft};
use crate::value::Value;
use bitflags::bitflags;
use core::cell::RefCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

pub type ChannelCallback = Arc<dyn Fn(&Arc<Channel>, &TaskletRef, bool, bool) + Send + Sync>;
pub type ScheduleCallback = Arc<dyn Fn(Option<&TaskletRef>, Option<&TaskletRef>) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&TaskletRef, &Exception) -> bool + Send + Sync>;
pub type LockHook = Arc<dyn Fn() + Send + Sync>;
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

bitflags! {
    /// Flags controlling what tasklet serialization should preserve.
    /// Storage and masked-update semantics only; serialization itself is a
    /// host concern.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PickleFlags: u8 {
        const PRESERVE_TRACING_STATE = 1;
        const PRESERVE_FINALIZER     = 2;
        const PICKLE_CONTEXT         = 4;
    }
}

/// Everything the switch engine reads and writes under the record's lock.
pub(crate) struct ThreadInner {
    /// Runnable tasklets; index 0 is the current tasklet.
    pub(crate) ready: VecDeque<TaskletRef>,
    pub(crate) main: Option<TaskletRef>,
    pub(crate) initial_stub: Option<Arc<NativeStack>>,
    /// Incremented for every new stub epoch (entering the scheduler from
    /// the outside, activating a pooled dispatch segment).
    pub(crate) serial: u64,
    /// Serial of the stub the currently running native stack belongs to.
    pub(crate) serial_last_jump: u64,
    pub(crate) tick_counter: i64,
    pub(crate) tick_watermark: i64,
    pub(crate) interval: i64,
    /// The evaluator should yield at its next safe point.
    pub(crate) drop_request: bool,
    pub(crate) runflags: RunFlags,
    /// Active watchdog tasklets, innermost last.
    pub(crate) watchdogs: SmallVec<[TaskletRef; 2]>,
    /// Tasklet displaced by a watchdog interrupt, claimed on watchdog
    /// return.
    pub(crate) interrupted: Option<TaskletRef>,
    /// Deferred-drop slot: destruction must not run until the switch that
    /// scheduled it has completed.
    pub(crate) del_post_switch: Option<Box<dyn Send>>,
    /// Non-zero forbids switching away from the current tasklet.
    pub(crate) switch_trap: i32,
    /// Nested native interpreter invocations on the running stack.
    pub(crate) nesting_level: u32,
    pub(crate) recursion_depth: usize,
    /// Frame staged for the dispatch loop.
    pub(crate) next_frame: Option<FrameRef>,
    /// The frame currently being executed.
    pub(crate) current_frame: Option<FrameRef>,
    /// Resume value staged alongside `next_frame` (frame-to-frame return
    /// delivery); when empty, the dispatcher claims the current tasklet's
    /// tempval instead.
    pub(crate) pending: Option<Result<Value, Exception>>,
    /// Topmost exception-info item of the running tasklet.
    pub(crate) exc_info: ExcInfoRef,
    pub(crate) context: Option<Value>,
    pub(crate) context_ver: u64,
    pub(crate) trace: TraceSlot,
    pub(crate) profile: TraceSlot,
    pub(crate) pickleflags: PickleFlags,
}

/// The per-OS-thread scheduler record.
pub struct SchedThread {
    id: u64,
    rt: Weak<Runtime>,
    pub(crate) inner: spin::Mutex<ThreadInner>,
    /// Trap for recursive scheduling out of callbacks.
    pub(crate) schedlock: AtomicBool,
    /// Parks this thread while its ready queue is empty in thread-blocking
    /// watchdog mode.
    block_parker: Parker,
    is_blocked: AtomicBool,
    is_idle: AtomicBool,
    /// Retired dispatch segments, reusable as fresh stubs.
    pool: spin::Mutex<Vec<Arc<Segment>>>,
    origin_segment: Arc<Segment>,
}

/// One embedding of the runtime: thread registry, callbacks and hooks.
pub struct Runtime {
    threads: spin::Mutex<Vec<Arc<SchedThread>>>,
    next_thread_id: AtomicU64,
    /// Id of the first-initialized ("primary") thread; SystemExit only
    /// terminates the process from there.
    primary: AtomicU64,
    channel_cb: spin::Mutex<Option<ChannelCallback>>,
    schedule_cb: spin::Mutex<Option<ScheduleCallback>>,
    schedule_fast_cb: spin::Mutex<Option<ScheduleCallback>>,
    error_handler: spin::Mutex<Option<ErrorHandler>>,
    lock_drop_hook: spin::Mutex<Option<LockHook>>,
    lock_acquire_hook: spin::Mutex<Option<LockHook>>,
    exit_hook: spin::Mutex<Option<ExitHook>>,
    pickleflags_default: spin::Mutex<PickleFlags>,
}

std::thread_local! {
    static TLS: RefCell<Option<(Arc<SchedThread>, Arc<Segment>)>> = const { RefCell::new(None) };
}

/// The scheduler record bound to the calling OS thread.
pub(crate) fn current_thread() -> Result<Arc<SchedThread>, Exception> {
    TLS.with(|tls| tls.borrow().as_ref().map(|(th, _)| Arc::clone(th)))
        .ok_or_else(|| Exception::runtime_error("thread is not initialized"))
}

/// The native-stack segment the calling OS thread runs on.
pub(crate) fn current_segment() -> Option<Arc<Segment>> {
    TLS.with(|tls| tls.borrow().as_ref().map(|(_, seg)| Arc::clone(seg)))
}

pub(crate) fn bind_tls(th: &Arc<SchedThread>, seg: &Arc<Segment>) {
    TLS.with(|tls| *tls.borrow_mut() = Some((Arc::clone(th), Arc::clone(seg))));
}

impl Runtime {
    pub fn new() -> Arc<Runtime> {
        Arc::new(Runtime {
            threads: spin::Mutex::new(Vec::new()),
            next_thread_id: AtomicU64::new(1),
            primary: AtomicU64::new(0),
            channel_cb: spin::Mutex::new(None),
            schedule_cb: spin::Mutex::new(None),
            schedule_fast_cb: spin::Mutex::new(None),
            error_handler: spin::Mutex::new(None),
            lock_drop_hook: spin::Mutex::new(None),
            lock_acquire_hook: spin::Mutex::new(None),
            exit_hook: spin::Mutex::new(None),
            pickleflags_default: spin::Mutex::new(PickleFlags::empty()),
        })
    }

    /// Initialize the calling OS thread for tasklet scheduling: create its
    /// record, anchor the initial stub on this stack, and pre-insert the
    /// main tasklet. Idempotent for an already-initialized thread.
    pub fn init_current_thread(self: &Arc<Runtime>) -> Result<Arc<SchedThread>, Exception> {
        if let Some(th) = TLS.with(|tls| tls.borrow().as_ref().map(|(th, _)| Arc::clone(th))) {
            if Weak::as_ptr(&th.rt) == Arc::as_ptr(self) {
                return Ok(th);
            }
            return Err(Exception::runtime_error(
                "thread is already bound to another runtime",
            ));
        }

        let origin = Segment::origin();
        let th = Arc::new(SchedThread {
            id: self.next_thread_id.fetch_add(1, Ordering::Relaxed),
            rt: Arc::downgrade(self),
            inner: spin::Mutex::new(ThreadInner {
                ready: VecDeque::new(),
                main: None,
                initial_stub: None,
                serial: 0,
                serial_last_jump: 0,
                tick_counter: 0,
                tick_watermark: i64::MAX,
                interval: 0,
                drop_request: false,
                runflags: RunFlags::empty(),
                watchdogs: SmallVec::new(),
                interrupted: None,
                del_post_switch: None,
                switch_trap: 0,
                nesting_level: 0,
                recursion_depth: 0,
                next_frame: None,
                current_frame: None,
                pending: None,
                exc_info: Arc::new(spin::Mutex::new(ExcItem::default())),
                context: None,
                context_ver: 0,
                trace: TraceSlot::default(),
                profile: TraceSlot::default(),
                pickleflags: *self.pickleflags_default.lock(),
            }),
            schedlock: AtomicBool::new(false),
            block_parker: Parker::new(),
            is_blocked: AtomicBool::new(false),
            is_idle: AtomicBool::new(false),
            pool: spin::Mutex::new(Vec::new()),
            origin_segment: Arc::clone(&origin),
        });

        let stub = {
            let mut inner = th.inner.lock();
            inner.serial = 1;
            inner.serial_last_jump = 1;
            let stub = NativeStack::stub(&th, origin.clone(), 1);
            inner.initial_stub = Some(Arc::clone(&stub));
            stub
        };

        let main = Tasklet::new_main(stub);
        {
            let mut inner = th.inner.lock();
            inner.main = Some(main.clone());
            // the thread adopts main's exception-info item
            core::mem::swap(&mut inner.exc_info, &mut main.inner.lock().exc_info);
        }
        th.ready_push_back(main.clone());

        self.threads.lock().push(Arc::clone(&th));
        let _ = self
            .primary
            .compare_exchange(0, th.id, Ordering::Relaxed, Ordering::Relaxed);
        bind_tls(&th, &origin);

        notify_schedule(&th, None, Some(&main));
        tracing::debug!(thread = th.id, "scheduler thread initialized");
        Ok(th)
    }

    pub(crate) fn thread_by_id(&self, id: u64) -> Option<Arc<SchedThread>> {
        self.threads.lock().iter().find(|t| t.id == id).cloned()
    }

    pub(crate) fn threads(&self) -> Vec<Arc<SchedThread>> {
        self.threads.lock().clone()
    }

    pub(crate) fn is_primary(&self, th: &SchedThread) -> bool {
        self.primary.load(Ordering::Relaxed) == th.id
    }

    // --- callbacks and hooks -------------------------------------------

    /// Install (or clear) the channel callback, returning the previous one.
    pub fn set_channel_callback(&self, cb: Option<ChannelCallback>) -> Option<ChannelCallback> {
        core::mem::replace(&mut *self.channel_cb.lock(), cb)
    }

    pub fn set_schedule_callback(&self, cb: Option<ScheduleCallback>) -> Option<ScheduleCallback> {
        core::mem::replace(&mut *self.schedule_cb.lock(), cb)
    }

    /// The low-level schedule hook, called before the host-level one.
    pub fn set_schedule_fastcallback(
        &self,
        cb: Option<ScheduleCallback>,
    ) -> Option<ScheduleCallback> {
        core::mem::replace(&mut *self.schedule_fast_cb.lock(), cb)
    }

    /// Handler for uncaught exceptions of non-main tasklets. Returns `true`
    /// when the exception was dealt with; otherwise it is wrapped into a
    /// bomb and routed to the innermost watchdog.
    pub fn set_error_handler(&self, cb: Option<ErrorHandler>) -> Option<ErrorHandler> {
        core::mem::replace(&mut *self.error_handler.lock(), cb)
    }

    /// Hooks invoked when the interpreter lock is dropped and re-acquired
    /// around every park.
    pub fn set_lock_hooks(&self, drop: Option<LockHook>, acquire: Option<LockHook>) {
        *self.lock_drop_hook.lock() = drop;
        *self.lock_acquire_hook.lock() = acquire;
    }

    /// Hook invoked when a true SystemExit reaches the end of a tasklet on
    /// the primary thread. The library default is to silence the exit; an
    /// embedder typically installs `std::process::exit` here.
    pub fn set_exit_hook(&self, cb: Option<ExitHook>) -> Option<ExitHook> {
        core::mem::replace(&mut *self.exit_hook.lock(), cb)
    }

    /// Masked update of the runtime-default pickle flags; returns the
    /// previous value.
    pub fn pickle_flags_default(&self, new: u8, mask: u8) -> Result<u8, Exception> {
        let mut flags = self.pickleflags_default.lock();
        let old = flags.bits();
        *flags = masked_pickle_flags(old, new, mask)?;
        Ok(old)
    }

    pub(crate) fn lock_drop(&self) {
        let hook = self.lock_drop_hook.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub(crate) fn lock_acquire(&self) {
        let hook = self.lock_acquire_hook.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub(crate) fn call_error_handler(&self, task: &TaskletRef, exc: &Exception) -> bool {
        let handler = self.error_handler.lock().clone();
        match handler {
            Some(h) => h(task, exc),
            None => false,
        }
    }

    pub(crate) fn call_exit_hook(&self, exc: &Exception) {
        let hook = self.exit_hook.lock().clone();
        if let Some(hook) = hook {
            let code = exc
                .value()
                .and_then(|v| v.downcast_ref::<i32>().copied())
                .unwrap_or(0);
            hook(code);
        }
    }
}

fn masked_pickle_flags(old: u8, new: u8, mask: u8) -> Result<PickleFlags, Exception> {
    let all = PickleFlags::all().bits();
    if new & !all != 0 || mask & !all != 0 {
        return Err(Exception::value_error("invalid pickle flags"));
    }
    let merged = (old & !mask) | (new & mask);
    Ok(PickleFlags::from_bits_truncate(merged))
}

impl SchedThread {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn runtime(&self) -> Arc<Runtime> {
        self.rt.upgrade().expect("runtime dropped while threads are live")
    }

    /// Fails on a thread whose scheduler was never initialized.
    pub fn ensure_main(&self) -> Result<(), Exception> {
        if self.has_main() {
            Ok(())
        } else {
            Err(Exception::runtime_error("thread is not initialized"))
        }
    }

    pub(crate) fn has_main(&self) -> bool {
        self.inner.lock().main.is_some()
    }

    pub fn main(&self) -> Option<TaskletRef> {
        self.inner.lock().main.clone()
    }

    pub fn current(&self) -> Option<TaskletRef> {
        self.inner.lock().ready.front().cloned()
    }

    pub(crate) fn current_id(&self) -> Option<u64> {
        self.inner.lock().ready.front().map(|t| t.id())
    }

    pub(crate) fn next_after_current(&self) -> Option<TaskletRef> {
        self.inner.lock().ready.get(1).cloned()
    }

    /// Number of runnable tasklets, including the current one.
    pub fn runcount(&self) -> usize {
        self.inner.lock().ready.len()
    }

    pub(crate) fn initial_stub(&self) -> Arc<NativeStack> {
        self.inner
            .lock()
            .initial_stub
            .clone()
            .expect("thread record without an initial stub")
    }

    pub fn nesting_level(&self) -> u32 {
        self.inner.lock().nesting_level
    }

    pub fn recursion_depth(&self) -> usize {
        self.inner.lock().recursion_depth
    }

    pub(crate) fn serials(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.serial, inner.serial_last_jump)
    }

    // --- ready queue ----------------------------------------------------

    /// Append at the tail of the circular ready queue.
    pub(crate) fn ready_push_back(&self, t: TaskletRef) {
        let mut inner = self.inner.lock();
        t.inner.lock().container = Container::Ready(self.id);
        inner.ready.push_back(t);
    }

    /// Insert before the current tasklet so it runs first.
    pub(crate) fn ready_push_front(&self, t: TaskletRef) {
        let mut inner = self.inner.lock();
        t.inner.lock().container = Container::Ready(self.id);
        inner.ready.push_front(t);
    }

    /// Insert immediately after the current tasklet.
    pub(crate) fn ready_insert_after_current(&self, t: TaskletRef) {
        let mut inner = self.inner.lock();
        t.inner.lock().container = Container::Ready(self.id);
        let at = 1.min(inner.ready.len());
        inner.ready.insert(at, t);
    }

    /// Unlink a tasklet wherever it sits in the queue.
    pub(crate) fn ready_remove(&self, t: &TaskletRef) -> bool {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.ready.iter().position(|q| q.id() == t.id()) else {
            return false;
        };
        inner.ready.remove(pos);
        t.inner.lock().container = Container::None;
        true
    }

    /// Remove and return the current tasklet; the next one becomes current.
    pub(crate) fn ready_pop_current(&self) -> Option<TaskletRef> {
        let mut inner = self.inner.lock();
        let t = inner.ready.pop_front()?;
        t.inner.lock().container = Container::None;
        Some(t)
    }

    /// Undo a [`ready_pop_current`][Self::ready_pop_current].
    pub(crate) fn ready_unremove_current(&self, t: TaskletRef) {
        let mut inner = self.inner.lock();
        t.inner.lock().container = Container::Ready(self.id);
        inner.ready.push_front(t);
    }

    // --- thread blocking ------------------------------------------------

    pub(crate) fn is_idle(&self) -> bool {
        self.is_idle.load(Ordering::Acquire)
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.is_blocked.load(Ordering::Acquire)
    }

    /// Announce that this thread is about to park. Inserts from sibling
    /// threads observing the flags will deposit a wake token; the caller
    /// must re-check for work *after* this call, then either
    /// [`block_park`][Self::block_park] or [`cancel_block`][Self::cancel_block].
    pub(crate) fn begin_block(&self) {
        self.is_blocked.store(true, Ordering::Release);
        self.is_idle.store(true, Ordering::Release);
    }

    pub(crate) fn cancel_block(&self) {
        self.is_blocked.store(false, Ordering::Release);
        self.is_idle.store(false, Ordering::Release);
    }

    /// Park this thread until new work arrives from a sibling thread.
    pub(crate) fn block_park(&self) {
        let rt = self.runtime();
        rt.lock_drop();
        unwind::clear();
        self.block_parker.park();
        rt.lock_acquire();
        self.is_idle.store(false, Ordering::Release);
    }

    /// Release the block lock if this thread is parked on it.
    pub(crate) fn unblock(&self) {
        if self.is_blocked.swap(false, Ordering::AcqRel) {
            self.block_parker.unpark();
        }
    }

    // --- segments -------------------------------------------------------

    pub(crate) fn origin_segment(&self) -> &Arc<Segment> {
        &self.origin_segment
    }

    /// Hand a retired dispatch segment back for reuse.
    pub(crate) fn retire_segment(&self, seg: &Arc<Segment>) {
        debug_assert!(!seg.is_origin());
        self.pool.lock().push(Arc::clone(seg));
    }

    /// Activate a fresh stub: reuse a pooled dispatch segment or spawn a
    /// new one. Every activation is a new stub epoch.
    pub(crate) fn activate_stub(self: &Arc<Self>) {
        let seg = {
            let pooled = self.pool.lock().pop();
            pooled.unwrap_or_else(|| crate::stack::spawn_segment(Arc::clone(self)))
        };
        let serial = {
            let mut inner = self.inner.lock();
            inner.serial += 1;
            inner.serial_last_jump = inner.serial;
            inner.serial
        };
        seg.set_stub_serial(serial);
        seg.set_role(SegmentRole::Dispatch);
        tracing::trace!(thread = self.id, segment = seg.id(), serial, "stub activated");
        seg.unpark();
    }

    // --- interpreter-state mirror ---------------------------------------

    pub(crate) fn claim_next_frame(&self) -> Option<FrameRef> {
        self.inner.lock().next_frame.take()
    }

    pub(crate) fn stage_frame(&self, f: FrameRef, input: Result<Value, Exception>) {
        let mut inner = self.inner.lock();
        inner.next_frame = Some(f);
        inner.pending = Some(input);
    }

    pub(crate) fn clear_current_frame(&self) {
        self.inner.lock().current_frame = None;
    }

    pub fn context(&self) -> Option<Value> {
        self.inner.lock().context.clone()
    }

    /// Replace the live context, returning the previous one.
    pub fn set_context(&self, ctx: Option<Value>) -> Option<Value> {
        let mut inner = self.inner.lock();
        inner.context_ver += 1;
        core::mem::replace(&mut inner.context, ctx)
    }

    pub fn trace_function(&self) -> Option<Value> {
        self.inner.lock().trace.func.clone()
    }

    pub fn set_trace_function(&self, func: Option<Value>) {
        self.inner.lock().trace.func = func;
    }

    pub fn profile_function(&self) -> Option<Value> {
        self.inner.lock().profile.func.clone()
    }

    pub fn set_profile_function(&self, func: Option<Value>) {
        self.inner.lock().profile.func = func;
    }

    // --- scheduling state -----------------------------------------------

    pub(crate) fn get_watchdog(&self) -> TaskletRef {
        let inner = self.inner.lock();
        inner
            .watchdogs
            .last()
            .cloned()
            .or_else(|| inner.main.clone())
            .expect("get_watchdog on an uninitialized thread")
    }

    pub(crate) fn take_interrupted(&self) -> Option<TaskletRef> {
        self.inner.lock().interrupted.take()
    }

    /// Park a payload whose destruction must wait until the switch that
    /// scheduled it has completed.
    pub(crate) fn defer_drop(&self, payload: Box<dyn Send>) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.del_post_switch.is_none(), "deferred-drop slot occupied");
        inner.del_post_switch = Some(payload);
    }

    pub(crate) fn take_deferred_drop(&self) -> Option<Box<dyn Send>> {
        self.inner.lock().del_post_switch.take()
    }

    /// Drop whatever destruction was deferred across the last switch.
    pub(crate) fn clear_del_post_switch(&self) {
        drop(self.take_deferred_drop());
    }

    /// Adjust the switch trap; while non-zero, switching away from the
    /// current tasklet raises.
    pub fn switch_trap_delta(&self, delta: i32) -> i32 {
        let mut inner = self.inner.lock();
        let old = inner.switch_trap;
        inner.switch_trap += delta;
        old
    }

    pub(crate) fn switch_trap(&self) -> i32 {
        self.inner.lock().switch_trap
    }

    /// Account for `n` executed instructions. Returns `true` once the
    /// watchdog watermark fired and the evaluator should yield at its next
    /// safe point.
    pub fn consume_ticks(&self, n: i64) -> bool {
        let mut inner = self.inner.lock();
        inner.tick_counter = inner.tick_counter.saturating_add(n);
        if inner.tick_counter >= inner.tick_watermark && !inner.watchdogs.is_empty() {
            inner.drop_request = true;
            if inner.runflags.contains(RunFlags::SOFT) {
                if let Some(cur) = inner.ready.front() {
                    cur.inner
                        .lock()
                        .flags
                        .insert(crate::tasklet::TaskletFlags::PENDING_IRQ);
                }
            }
        }
        inner.drop_request
    }

    /// Masked update of this thread's pickle flags; returns the previous
    /// value.
    pub fn pickle_flags(&self, new: u8, mask: u8) -> Result<u8, Exception> {
        let mut inner = self.inner.lock();
        let old = inner.pickleflags.bits();
        inner.pickleflags = masked_pickle_flags(old, new, mask)?;
        Ok(old)
    }
}

impl fmt::Debug for SchedThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SchedThread")
            .field("id", &self.id)
            .field("runcount", &inner.ready.len())
            .field("serial", &inner.serial)
            .field("nesting_level", &inner.nesting_level)
            .field("blocked", &self.is_blocked())
            .finish_non_exhaustive()
    }
}

// --- callback plumbing ---------------------------------------------------

/// Run `f` with the recursive-scheduling trap armed.
fn with_schedlock(th: &SchedThread, f: impl FnOnce()) {
    if th.schedlock.swap(true, Ordering::AcqRel) {
        fatal("recursive scheduler call due to a callback");
    }
    f();
    th.schedlock.store(false, Ordering::Release);
}

pub(crate) fn call_channel_callback(
    th: &Arc<SchedThread>,
    chan: &Arc<Channel>,
    task: &TaskletRef,
    sending: bool,
    willblock: bool,
) {
    let cb = th.runtime().channel_cb.lock().clone();
    if let Some(cb) = cb {
        with_schedlock(th, || cb(chan, task, sending, willblock));
    }
}

pub(crate) fn notify_schedule(
    th: &Arc<SchedThread>,
    prev: Option<&TaskletRef>,
    next: Option<&TaskletRef>,
) {
    let rt = th.runtime();
    let fast = rt.schedule_fast_cb.lock().clone();
    let cb = rt.schedule_cb.lock().clone();
    if fast.is_none() && cb.is_none() {
        return;
    }
    with_schedlock(th, || {
        if let Some(fast) = fast {
            fast(prev, next);
        }
        if let Some(cb) = cb {
            cb(prev, next);
        }
    });
}

// --- module-level API ----------------------------------------------------

/// The current tasklet of the calling thread.
pub fn get_current() -> Option<TaskletRef> {
    current_thread().ok().and_then(|th| th.current())
}

/// Id of the current tasklet of the calling thread.
pub fn get_current_id() -> Option<u64> {
    current_thread().ok().and_then(|th| th.current_id())
}

/// The main tasklet of the calling thread.
pub fn get_main() -> Option<TaskletRef> {
    current_thread().ok().and_then(|th| th.main())
}

/// Number of runnable tasklets on the calling thread.
pub fn get_runcount() -> usize {
    current_thread().map(|th| th.runcount()).unwrap_or(0)
}

/// Yield to the next runnable tasklet. `retval` becomes the caller's
/// tempval, delivered back when it is resumed.
pub fn schedule(retval: Option<Value>) -> Result<Value, Exception> {
    let th = current_thread()?;
    match schedule_impl(&th, retval, false, false)? {
        Soft::Done(v) => Ok(v),
        Soft::Unwind => unreachable!("hard schedule cannot unwind"),
    }
}

/// Soft-capable [`schedule()`] for use inside frames.
pub fn schedule_soft(retval: Option<Value>) -> Result<Soft<Value>, Exception> {
    let th = current_thread()?;
    schedule_soft_on(&th, retval, false)
}

/// Yield and remove the caller from the ready queue, leaving it paused.
pub fn schedule_remove(retval: Option<Value>) -> Result<Value, Exception> {
    let th = current_thread()?;
    match schedule_impl(&th, retval, true, false)? {
        Soft::Done(v) => Ok(v),
        Soft::Unwind => unreachable!("hard schedule cannot unwind"),
    }
}

/// Soft-capable [`schedule_remove()`].
pub fn schedule_remove_soft(retval: Option<Value>) -> Result<Soft<Value>, Exception> {
    let th = current_thread()?;
    unwind::offer();
    let r = schedule_impl(&th, retval, true, true);
    unwind::assert_clear();
    r
}

pub(crate) fn schedule_soft_on(
    th: &Arc<SchedThread>,
    retval: Option<Value>,
    remove: bool,
) -> Result<Soft<Value>, Exception> {
    unwind::offer();
    let r = schedule_impl(th, retval, remove, true);
    unwind::assert_clear();
    r
}

fn schedule_impl(
    th: &Arc<SchedThread>,
    retval: Option<Value>,
    remove: bool,
    soft: bool,
) -> Result<Soft<Value>, Exception> {
    let may_unwind = if soft { unwind::take_offer() } else { false };
    th.ensure_main()?;
    let prev = th
        .current()
        .ok_or_else(|| Exception::runtime_error("thread has no current tasklet"))?;
    if let Some(v) = retval {
        prev.set_tempval(v);
    }
    if remove {
        th.ready_pop_current();
        let next = th.current();
        return schedule_task(th, prev, next, may_unwind);
    }
    let next = th.next_after_current().unwrap_or_else(|| prev.clone());
    schedule_task(th, prev, Some(next), may_unwind)
}

/// Adjust the calling thread's switch trap, returning the previous value.
pub fn switch_trap(delta: i32) -> Result<i32, Exception> {
    Ok(current_thread()?.switch_trap_delta(delta))
}

/// Masked update of the calling thread's pickle flags.
pub fn pickle_flags(new: u8, mask: u8) -> Result<u8, Exception> {
    current_thread()?.pickle_flags(new, mask)
}

/// Masked update of the runtime-wide default pickle flags.
pub fn pickle_flags_default(new: u8, mask: u8) -> Result<u8, Exception> {
    current_thread()?.runtime().pickle_flags_default(new, mask)
}
