// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The switch engine.
//!
//! `schedule_task` is the single funnel every context transfer goes
//! through: generic yields, channel rendezvous, watchdog suspension, throw
//! and kill, and tasklet termination. It decides between four legs:
//!
//! * **self**: prev == next. Claim the tempval and return, no transfer;
//! * **soft**: the caller is at nesting level zero and opted in. Re-seat the
//!   staged frame, exchange thread state, and answer the unwind token;
//! * **bridge**: soft-capable caller but a hard-suspended target. Stage a
//!   helper frame whose execution performs the native leg;
//! * **hard**: capture the running native stack into the suspending
//!   tasklet and resume the target's stack (or a fresh stub for a
//!   soft-suspended target).
//!
//! Blocking (empty ready queue), the deadlock check, inter-thread
//! hand-offs, watchdog interrupts, and the exchange of exception-info /
//! context / trace state all live here as well, because they are all
//! entangled with the same transfer machinery.

use crate::bomb::{Bomb, explode_to_result};
use crate::error::{Exception, fatal};
use crate::frame::{Frame, FrameCx, FrameRef, FrameResult};
use crate::sched::{RunFlags, SchedThread, ThreadInner, notify_schedule};
use crate::stack::NativeStack;
use crate::tasklet::{TaskletFlags, TaskletRef};
use crate::unwind::{self, Soft};
use crate::value::Value;
use std::sync::Arc;

/// Schedule away from `prev` towards `next` (or block when there is no
/// target). Returns the delivered value, or the unwind token when a soft
/// switch was staged and the caller must unwind to the dispatcher.
pub fn schedule_task(
    th: &Arc<SchedThread>,
    prev: TaskletRef,
    next: Option<TaskletRef>,
    may_unwind: bool,
) -> Result<Soft<Value>, Exception> {
    if th.schedlock.load(core::sync::atomic::Ordering::Acquire) {
        fatal("recursive scheduler call due to a callback");
    }

    let Some(next) = next else {
        return schedule_task_block(th, prev, may_unwind);
    };

    // A target living on another thread never switches locally.
    let next_thread = next.inner.lock().stack.thread_id();
    if next_thread != th.id() && next.id() != prev.id() {
        return schedule_task_interthread(th, prev, next, may_unwind);
    }

    if th.switch_trap() != 0 && next.id() != prev.id() {
        return Err(Exception::runtime_error("switch_trap"));
    }

    // Prepare the target: pull it out of a channel, or reactivate it if it
    // is floating.
    let (blocked, floating) = {
        let ni = next.inner.lock();
        (ni.blocked != 0, ni.container.is_none())
    };
    if blocked {
        if let Some(chan) = next.channel() {
            chan.unchain(&next);
        }
        th.ready_push_back(next.clone());
    } else if floating {
        th.ready_push_back(next.clone());
    }

    schedule_task_prepared(th, prev, next, may_unwind)
}

fn schedule_task_prepared(
    th: &Arc<SchedThread>,
    prev: TaskletRef,
    mut next: TaskletRef,
    may_unwind: bool,
) -> Result<Soft<Value>, Exception> {
    {
        let mut inner = th.inner.lock();
        // one-shot suppression of soft interrupts for this schedule
        let not_now = inner.runflags.contains(RunFlags::NO_SOFT_IRQ);
        inner.runflags.remove(RunFlags::NO_SOFT_IRQ);
        schedule_soft_irq(th, &mut inner, &prev, &mut next, not_now);
        schedule_hard_irq(th, &mut inner, &prev, &mut next);
    }

    if next.id() == prev.id() {
        // No transfer; the pending tempval (possibly a bomb) is the result.
        th.clear_del_post_switch();
        let v = prev.claim_tempval();
        return explode_to_result(v).map(Soft::Done);
    }

    notify_schedule(th, Some(&prev), Some(&next));

    let mut inner = th.inner.lock();
    if !inner.runflags.contains(RunFlags::TOTAL_TIMEOUT) {
        // reset the timeslice; a non-positive interval means no watermark
        inner.tick_watermark = if inner.interval > 0 {
            inner.tick_counter.saturating_add(inner.interval)
        } else {
            i64::MAX
        };
        inner.drop_request = false;
    }

    // Seat the suspending side: remember its frame and recursion depth.
    {
        let mut pi = prev.inner.lock();
        pi.recursion_depth = inner.recursion_depth;
        debug_assert!(pi.frame.is_none(), "suspending tasklet already owns a frame");
        pi.frame = inner.current_frame.take();
    }

    let next_stack = next.inner.lock().stack.clone();

    if may_unwind && inner.nesting_level == 0 {
        // --- soft switching ---------------------------------------------
        reseat_on_stub(&mut inner, &prev);

        if next_stack.nesting_level() != 0 {
            // The target was hard-suspended: stage a helper frame that will
            // perform the native leg once the dispatcher evaluates it. Any
            // bomb stays unexploded in the target's tempval; the resumed
            // side claims it.
            let bridge: FrameRef = Arc::new(BridgeFrame {
                target: Arc::clone(&next_stack),
                del: spin::Mutex::new(inner.del_post_switch.take()),
            });
            inner.next_frame = Some(bridge);
            // the target's tempval belongs to its own resume; feed the
            // bridge an inert input instead
            inner.pending = Some(Ok(Value::none()));
        } else {
            let f = next.inner.lock().frame.take();
            debug_assert!(f.is_some(), "soft switch target has no frame");
            inner.next_frame = f;
            inner.pending = None;
        }

        update_thread_state_on_switch(&mut inner, &prev, &next);
        inner.recursion_depth = next.inner.lock().recursion_depth;
        rotate_to(&mut inner, &next);
        drop(inner);
        tracing::trace!(prev = prev.id(), next = next.id(), "soft switch");
        return Ok(Soft::Unwind);
    }

    // --- hard switching --------------------------------------------------

    // Since we change stacks, the protocol must have been honored.
    unwind::assert_clear();

    let seg = crate::sched::current_segment()
        .unwrap_or_else(|| fatal("scheduling from a thread without a bound stack segment"));

    if !next_stack.is_stub() && next_stack.thread_id() != th.id() {
        // Refuse to restore a foreign stack; reinstate the situation for
        // diagnosis instead of transferring into an incoherent state.
        drop(inner);
        return Err(Exception::runtime_error(
            "attempt to restore a native stack on the wrong thread",
        ));
    }

    inner.nesting_level += 1;
    let captured_nesting = inner.nesting_level;

    update_thread_state_on_switch(&mut inner, &prev, &next);
    inner.recursion_depth = next.inner.lock().recursion_depth;
    rotate_to(&mut inner, &next);

    // Capture the running stack into prev.
    {
        let mut pi = prev.inner.lock();
        if !pi.stack.is_stub() {
            pi.stack.clear_task();
        }
        pi.stack = NativeStack::capture(th, Arc::clone(&seg), captured_nesting, &prev);
    }

    // Arrange for the target to run.
    enum Leg {
        Resume(Arc<crate::stack::Segment>),
        Stub,
    }
    let leg = if next_stack.nesting_level() != 0 {
        let Some(tseg) = next_stack.segment() else {
            fatal("hard switch target lost its stack segment");
        };
        inner.serial_last_jump = next_stack.serial();
        inner.nesting_level = next_stack.nesting_level() - 1;
        Leg::Resume(tseg)
    } else {
        // Soft-suspended target: a fresh stub will dispatch its frame.
        let f = next.inner.lock().frame.take();
        debug_assert!(f.is_some(), "hard switch to a soft target without a frame");
        inner.next_frame = f;
        inner.pending = None;
        inner.nesting_level = 0;
        Leg::Stub
    };
    drop(inner);

    tracing::trace!(prev = prev.id(), next = next.id(), "hard switch");

    // Drop the interpreter lock before the target can start running.
    let rt = th.runtime();
    rt.lock_drop();
    unwind::clear();
    match leg {
        Leg::Resume(tseg) => tseg.unpark(),
        Leg::Stub => th.activate_stub(),
    }

    // Park; when this returns, `prev` is the running tasklet again.
    seg.park();
    rt.lock_acquire();
    after_resume(th, &prev)
}

/// Reinstall the resumed tasklet's execution state and deliver its tempval.
fn after_resume(th: &Arc<SchedThread>, me: &TaskletRef) -> Result<Soft<Value>, Exception> {
    // The switch that brought us back has completed; deferred destruction
    // happens here, on the destination stack.
    th.clear_del_post_switch();
    let f = me.inner.lock().frame.take();
    th.inner.lock().current_frame = f;
    let v = me.claim_tempval();
    explode_to_result(v).map(Soft::Done)
}

/// Re-parent a softly suspending tasklet onto the thread's initial stub.
fn reseat_on_stub(inner: &mut ThreadInner, prev: &TaskletRef) {
    let stub = inner
        .initial_stub
        .clone()
        .expect("soft switch on an uninitialized thread");
    let mut pi = prev.inner.lock();
    if !pi.stack.is_stub() {
        pi.stack.clear_task();
    }
    pi.stack = stub;
}

/// Make `next` the head of the circular ready queue, preserving relative
/// order.
fn rotate_to(inner: &mut ThreadInner, next: &TaskletRef) {
    if let Some(pos) = inner.ready.iter().position(|t| t.id() == next.id()) {
        inner.ready.rotate_left(pos);
    } else {
        debug_assert!(false, "switch target is not on the ready queue");
    }
}

/// The state exchange performed at every switch: exception info, context,
/// and trace/profile installations move between the thread and the two
/// tasklets.
fn update_thread_state_on_switch(inner: &mut ThreadInner, prev: &TaskletRef, next: &TaskletRef) {
    // Exception info: thread ends up holding next's, prev holds what the
    // thread held.
    {
        let mut pi = prev.inner.lock();
        core::mem::swap(&mut inner.exc_info, &mut pi.exc_info);
        debug_assert!(
            pi.exc_info.lock().previous.is_none(),
            "suspended exception item must not chain"
        );
    }
    {
        let mut ni = next.inner.lock();
        core::mem::swap(&mut inner.exc_info, &mut ni.exc_info);
    }

    // Context: prev takes the thread's, the thread takes next's.
    {
        let mut pi = prev.inner.lock();
        pi.context = inner.context.take();
    }
    {
        let mut ni = next.inner.lock();
        inner.context = ni.context.take();
        inner.context_ver += 1;
    }

    // Trace and profile installations move only when either side has one.
    let next_trace = next.inner.lock().trace.clone();
    if inner.trace.is_installed() || next_trace.is_installed() {
        {
            let mut pi = prev.inner.lock();
            debug_assert!(!pi.trace.is_installed());
            pi.trace = core::mem::take(&mut inner.trace);
        }
        inner.trace = next_trace;
        next.inner.lock().trace = Default::default();
    }
    let next_profile = next.inner.lock().profile.clone();
    if inner.profile.is_installed() || next_profile.is_installed() {
        {
            let mut pi = prev.inner.lock();
            debug_assert!(!pi.profile.is_installed());
            pi.profile = core::mem::take(&mut inner.profile);
        }
        inner.profile = next_profile;
        next.inner.lock().profile = Default::default();
    }
}

/// Helper frame performing the native leg of a mixed soft-to-hard switch.
/// The deferred-drop payload rides along so its destruction happens on the
/// destination side of the transfer.
struct BridgeFrame {
    target: Arc<NativeStack>,
    del: spin::Mutex<Option<Box<dyn Send>>>,
}

impl Frame for BridgeFrame {
    fn execute(&self, cx: &FrameCx<'_>, _input: Result<Value, Exception>) -> FrameResult {
        let th = cx.thread();
        let seg = crate::sched::current_segment()
            .unwrap_or_else(|| fatal("bridge frame without a bound stack segment"));
        {
            let mut inner = th.inner.lock();
            debug_assert!(inner.del_post_switch.is_none());
            inner.del_post_switch = self.del.lock().take();
            inner.serial_last_jump = self.target.serial();
            inner.nesting_level = self.target.nesting_level().saturating_sub(1);
        }
        let Some(tseg) = self.target.segment() else {
            fatal("soft-to-hard bridge lost the target stack");
        };
        // This segment is done: control moves to the target's stack and the
        // dispatcher must retire without touching thread state again.
        seg.set_detached();
        tracing::trace!(serial = self.target.serial(), "bridge transfer");
        tseg.unpark();
        FrameResult::Unwind
    }
}

// --- blocking and deadlock -----------------------------------------------

/// Called when the ready queue will be empty once `prev` leaves.
fn schedule_task_block(
    th: &Arc<SchedThread>,
    prev: TaskletRef,
    may_unwind: bool,
) -> Result<Soft<Value>, Exception> {
    let wakeup = th.get_watchdog();

    // Never block the thread while a watchdog runs without THREADBLOCK.
    let revive_main = {
        let inner = th.inner.lock();
        !inner.runflags.contains(RunFlags::THREADBLOCK)
            && wakeup.inner.lock().container.is_none()
    };

    if revive_main || check_for_deadlock(th) {
        return cant_block(th, prev, wakeup, revive_main, may_unwind);
    }

    loop {
        // Keep the frame visible on the tasklet while the thread is parked
        // so a foreign insert does not mistake it for dead.
        let current_frame = th.inner.lock().current_frame.clone();
        let lent = {
            let mut pi = prev.inner.lock();
            if pi.frame.is_none() && current_frame.is_some() {
                pi.frame = current_frame;
                true
            } else {
                false
            }
        };

        // Announce the park first: an insert from a sibling thread that
        // races past the re-checks below will deposit a wake token instead
        // of being lost.
        th.begin_block();
        if th.current().is_some() {
            th.cancel_block();
        } else if check_for_deadlock(th) {
            th.cancel_block();
            if lent {
                prev.inner.lock().frame = None;
            }
            return cant_block(th, prev, wakeup, false, may_unwind);
        } else {
            tracing::debug!(thread = th.id(), "parking idle thread");
            th.block_park();
        }
        if lent {
            prev.inner.lock().frame = None;
        }

        // Another thread may have queued a tasklet while we re-acquired the
        // lock.
        if let Some(next) = th.current() {
            let r = schedule_task(th, prev, Some(next), may_unwind);
            if r.is_ok() {
                th.clear_del_post_switch();
            }
            return r;
        }
        // woken without work (stale token); park again
    }
}

fn cant_block(
    th: &Arc<SchedThread>,
    prev: TaskletRef,
    wakeup: TaskletRef,
    revive_main: bool,
    may_unwind: bool,
) -> Result<Soft<Value>, Exception> {
    let wakeup_floating = wakeup.inner.lock().container.is_none();
    if revive_main || (th.runtime().is_primary(th) && wakeup_floating) {
        // Revive the watchdog / main; pass a value along only if it is an
        // exception.
        if prev.tempval_is_bomb() {
            let bomb = prev.inner.lock().tempval.clone();
            wakeup.set_tempval(bomb);
        }
        return schedule_task(th, prev, Some(wakeup), may_unwind);
    }
    // Nobody can ever wake us: explode a deadlock bomb in the caller.
    tracing::debug!(thread = th.id(), "deadlock detected");
    let bomb = Bomb::wrap(Exception::runtime_error(
        "Deadlock: the last runnable tasklet cannot be blocked.",
    ));
    prev.set_tempval(bomb);
    let target = prev.clone();
    schedule_task(th, prev, Some(target), may_unwind)
}

/// Is any sibling thread still able to make progress?
fn check_for_deadlock(th: &Arc<SchedThread>) -> bool {
    let threads = th.runtime().threads();
    for other in threads {
        if other.id() == th.id() {
            continue;
        }
        if !other.is_blocked() {
            return false;
        }
    }
    true
}

// --- inter-thread hand-off -----------------------------------------------

/// The target belongs to another thread: plant it into that thread's ready
/// queue, wake the thread if it is parked, and return normally on the
/// local thread.
fn schedule_task_interthread(
    th: &Arc<SchedThread>,
    prev: TaskletRef,
    next: TaskletRef,
    may_unwind: bool,
) -> Result<Soft<Value>, Exception> {
    let Some(nts) = next.bound_thread() else {
        return Err(Exception::runtime_error("tasklet has no thread"));
    };

    // Get ourselves ready first: the previous task continues locally.
    let target = prev.clone();
    let result = schedule_task(th, prev, Some(target), may_unwind)?;

    let (blocked, floating) = {
        let ni = next.inner.lock();
        (ni.blocked != 0, ni.container.is_none())
    };
    if blocked {
        if let Some(chan) = next.channel() {
            chan.unchain(&next);
        }
        nts.ready_push_back(next.clone());
    } else if floating {
        nts.ready_push_back(next.clone());
    }
    nts.unblock();
    tracing::trace!(
        from = th.id(),
        to = nts.id(),
        tasklet = next.id(),
        "inter-thread hand-off"
    );

    Ok(result)
}

// --- watchdog interruption -----------------------------------------------

/// Soft interrupt: reroute the chosen target to the innermost watchdog,
/// displacing the target into the `interrupted` slot.
fn schedule_soft_irq(
    th: &Arc<SchedThread>,
    inner: &mut ThreadInner,
    prev: &TaskletRef,
    next: &mut TaskletRef,
    not_now: bool,
) {
    if !inner.runflags.contains(RunFlags::SOFT) {
        return;
    }
    if !prev.inner.lock().flags.contains(TaskletFlags::PENDING_IRQ) {
        return;
    }
    let Some(watchdog) = inner.watchdogs.last().cloned().or_else(|| inner.main.clone()) else {
        return;
    };

    prev.inner.lock().flags.remove(TaskletFlags::PENDING_IRQ);

    if !watchdog.inner.lock().container.is_none() {
        // target isn't floating, probably busy raising an exception
        return;
    }
    if watchdog.id() == prev.id() || watchdog.id() == next.id() {
        return;
    }

    if not_now || !nesting_ok(inner, prev) {
        // pass the interrupt on to whoever runs next
        next.inner.lock().flags.insert(TaskletFlags::PENDING_IRQ);
        return;
    }

    // Signal the interruption by parking the displaced target, and splice
    // the watchdog into the queue at the position the target would have
    // occupied.
    debug_assert!(inner.interrupted.is_none());
    inner.interrupted = Some(next.clone());
    watchdog.inner.lock().container = crate::tasklet::Container::Ready(th.id());
    match inner.ready.iter().position(|t| t.id() == next.id()) {
        Some(pos) => inner.ready.insert(pos, watchdog.clone()),
        None => inner.ready.push_back(watchdog.clone()),
    }
    tracing::trace!(interrupted = next.id(), "soft interrupt fired");
    *next = watchdog;
}

/// Hard-mode watchdog interruption: on a fired watermark the yielding
/// tasklet itself is displaced and the watchdog takes over.
fn schedule_hard_irq(
    th: &Arc<SchedThread>,
    inner: &mut ThreadInner,
    prev: &TaskletRef,
    next: &mut TaskletRef,
) {
    if !inner.drop_request || inner.runflags.contains(RunFlags::SOFT) {
        return;
    }
    if inner.watchdogs.is_empty() {
        return;
    }
    let Some(watchdog) = inner.watchdogs.last().cloned() else {
        return;
    };
    if !watchdog.inner.lock().container.is_none() {
        return;
    }
    if watchdog.id() == prev.id() || watchdog.id() == next.id() {
        return;
    }
    if !nesting_ok(inner, prev) {
        return; // retry at the next safe point
    }

    inner.drop_request = false;
    inner.interrupted = Some(prev.clone());
    if let Some(pos) = inner.ready.iter().position(|t| t.id() == prev.id()) {
        inner.ready.remove(pos);
        prev.inner.lock().container = crate::tasklet::Container::None;
    }
    watchdog.inner.lock().container = crate::tasklet::Container::Ready(th.id());
    inner.ready.push_back(watchdog.clone());
    tracing::trace!(interrupted = prev.id(), "watchdog timeout fired");
    *next = watchdog;
}

/// Atomic and nesting rules for firing an interrupt at `prev`.
fn nesting_ok(inner: &ThreadInner, prev: &TaskletRef) -> bool {
    let pi = prev.inner.lock();
    if pi.flags.contains(TaskletFlags::ATOMIC) {
        return false;
    }
    inner.nesting_level == 0
        || pi.flags.contains(TaskletFlags::IGNORE_NESTING)
        || inner.runflags.contains(RunFlags::IGNORE_NESTING)
}

// --- tasklet termination -------------------------------------------------

/// The outermost frame of `task` finished (value or exception). Clean up,
/// pick a successor, and leave the corpse in the deferred-drop slot so its
/// destruction happens after the switch.
pub(crate) fn tasklet_end(th: &Arc<SchedThread>, task: &TaskletRef, outcome: Result<Value, Exception>) {
    debug_assert!(!task.is_main(), "the main tasklet does not run frames");
    let rt = th.runtime();

    let mut retval: Value = match outcome {
        Ok(_) => Value::none(), // a plain return value of a tasklet is dropped
        Err(e) if e.is_system_exit() => {
            // TaskletExit (and a handled SystemExit) silently end the
            // tasklet; a true SystemExit on the primary thread reaches the
            // exit hook first.
            if !e.is_tasklet_exit() && rt.is_primary(th) {
                rt.call_exit_hook(&e);
            }
            Value::none()
        }
        Err(e) => {
            tracing::debug!(tasklet = task.id(), error = %e, "uncaught exception in tasklet");
            if rt.call_error_handler(task, &e) {
                Value::none()
            } else {
                Bomb::wrap(e)
            }
        }
    };
    task.set_tempval(retval.clone());

    // Remove the corpse from the runnables; we are its last stop.
    let popped = th.ready_pop_current();
    debug_assert!(popped.is_some_and(|t| t.id() == task.id()));
    th.clear_current_frame();

    // This tasklet is dead: clear any current exception.
    th.inner.lock().exc_info.lock().exc = None;

    let mut next = th.current();
    if next.is_none() {
        // Nobody left to run: wake the watchdog or main.
        let wakeup = th.get_watchdog();
        let blocked = wakeup.blocked();
        if blocked != 0 && !Bomb::is_bomb(&retval) {
            // The wakeup target is stuck on a channel and nobody can ever
            // pair with it.
            let txt = if blocked < 0 {
                "the main tasklet is receiving without a sender available."
            } else {
                "the main tasklet is sending without a receiver available."
            };
            retval = Bomb::wrap(Exception::runtime_error(txt));
            task.set_tempval(retval.clone());
        }
        next = Some(wakeup);
    }
    let mut next = next.expect("successor");

    if Bomb::is_bomb(&retval) {
        // A bomb must wake the watchdog, whoever the successor would have
        // been.
        next = th.get_watchdog();
        let bomb = task.claim_tempval();
        next.set_tempval(bomb);
    }

    {
        let mut ti = task.inner.lock();
        ti.recursion_depth = 0;
        ti.frame = None;
    }
    th.defer_drop(Box::new(task.clone()));

    match schedule_task(th, task.clone(), Some(next), true) {
        Ok(_) => {}
        Err(_) => fatal("could not end a tasklet"),
    }
}
