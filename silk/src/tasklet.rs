// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tasklets: the cooperatively scheduled microthreads.
//!
//! A tasklet is a chain of host frames plus the bookkeeping that lets the
//! scheduler suspend and resume it: a single-slot mailbox (`tempval`), a
//! flag word, the captured native stack, and the saved slices of thread
//! state (exception info, context, trace state) that travel with it across
//! switches.
//!
//! A tasklet is a member of at most one chain at a time, its thread's
//! ready queue or one channel's wait queue, recorded in an explicit
//! [`Container`] tag. `blocked != 0` implies channel membership; the
//! current tasklet is always the head of its thread's ready queue.

use crate::bomb::Bomb;
use crate::channel::Channel;
use crate::error::Exception;
use crate::frame::{Callable, FrameCx, FrameRef, FrameResult, TaskFrame};
use crate::sched::{self, SchedThread};
use crate::stack::NativeStack;
use crate::value::Value;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub type TaskletRef = Arc<Tasklet>;

bitflags! {
    /// The packed flag word of a tasklet. `blocked` is kept separately
    /// because it is a signed tri-state, not a bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskletFlags: u8 {
        /// Inhibits tick-driven preemption while set.
        const ATOMIC          = 1 << 0;
        /// Allow auto-scheduling even at a non-zero nesting level.
        const IGNORE_NESTING  = 1 << 1;
        /// Reserved; kept for host compatibility.
        const AUTOSCHEDULE    = 1 << 2;
        /// A channel operation that would block raises instead.
        const BLOCK_TRAP      = 1 << 3;
        /// Set while the runtime force-kills the tasklet during teardown.
        const IS_ZOMBIE       = 1 << 4;
        /// A soft interrupt is pending for this tasklet.
        const PENDING_IRQ     = 1 << 5;
    }
}

/// Which chain a tasklet is linked into.
#[derive(Clone)]
pub(crate) enum Container {
    /// Floating: neither ready nor blocked.
    None,
    /// On the ready queue of the thread with this id.
    Ready(u64),
    /// On the wait queue of this channel.
    Channel(Weak<Channel>),
}

impl Container {
    pub(crate) fn is_none(&self) -> bool {
        matches!(self, Container::None)
    }
}

/// One item of the per-tasklet exception-handling context. The `previous`
/// link must be empty whenever the tasklet is suspended.
#[derive(Default)]
pub(crate) struct ExcItem {
    pub(crate) exc: Option<Exception>,
    pub(crate) previous: Option<Arc<spin::Mutex<ExcItem>>>,
}

pub(crate) type ExcInfoRef = Arc<spin::Mutex<ExcItem>>;

/// Saved trace or profile installation: the host hook object plus the
/// tracing depth captured at suspension.
#[derive(Default, Clone)]
pub(crate) struct TraceSlot {
    pub(crate) func: Option<Value>,
    pub(crate) depth: u32,
}

impl TraceSlot {
    pub(crate) fn is_installed(&self) -> bool {
        self.func.is_some()
    }
}

pub(crate) struct TaskletInner {
    pub(crate) flags: TaskletFlags,
    /// −1 blocked receiving, 0 not blocked, +1 blocked sending.
    pub(crate) blocked: i8,
    /// Top of the frame chain, empty while running (the thread holds it)
    /// or when dead/unbound.
    pub(crate) frame: Option<FrameRef>,
    /// The single-slot mailbox. Never empty; `None` stands in.
    pub(crate) tempval: Value,
    pub(crate) stack: Arc<NativeStack>,
    pub(crate) recursion_depth: usize,
    /// Topmost exception-info item; exchanged with the thread at switches.
    pub(crate) exc_info: ExcInfoRef,
    /// The tasklet's context object; empty while current (the thread holds
    /// it then).
    pub(crate) context: Option<Value>,
    pub(crate) trace: TraceSlot,
    pub(crate) profile: TraceSlot,
    pub(crate) container: Container,
    pub(crate) is_main: bool,
}

pub struct Tasklet {
    id: u64,
    pub(crate) inner: spin::Mutex<TaskletInner>,
}

static TASKLET_IDS: AtomicU64 = AtomicU64::new(1);

/// Wrapper giving a bound-but-not-set-up callable a home in `tempval`.
struct BoundFunc(Arc<dyn Callable>);

impl Tasklet {
    fn alloc(stack: Arc<NativeStack>, is_main: bool) -> TaskletRef {
        Arc::new(Tasklet {
            id: TASKLET_IDS.fetch_add(1, Ordering::Relaxed),
            inner: spin::Mutex::new(TaskletInner {
                flags: TaskletFlags::empty(),
                blocked: 0,
                frame: None,
                tempval: Value::none(),
                stack,
                recursion_depth: 0,
                exc_info: Arc::new(spin::Mutex::new(ExcItem::default())),
                context: None,
                trace: TraceSlot::default(),
                profile: TraceSlot::default(),
                container: Container::None,
                is_main,
            }),
        })
    }

    /// Create a new tasklet on the calling thread, optionally binding it to
    /// a callable right away.
    pub fn new(func: Option<Arc<dyn Callable>>) -> Result<TaskletRef, Exception> {
        let th = sched::current_thread()?;
        th.ensure_main()?;
        let t = Self::alloc(th.initial_stub(), false);
        if let Some(f) = func {
            t.bind(Some(f), None)?;
        }
        Ok(t)
    }

    /// The pre-inserted main tasklet of a freshly initialized thread.
    pub(crate) fn new_main(stub: Arc<NativeStack>) -> TaskletRef {
        Self::alloc(stub, true)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    // --- chain and state predicates -------------------------------------

    /// The thread record this tasklet belongs to.
    pub(crate) fn bound_thread(&self) -> Option<Arc<SchedThread>> {
        self.inner.lock().stack.thread()
    }

    pub fn thread_id(&self) -> Option<u64> {
        self.bound_thread().map(|th| th.id())
    }

    /// −1 blocked receiving, 0 not blocked, +1 blocked sending.
    pub fn blocked(&self) -> i8 {
        self.inner.lock().blocked
    }

    pub fn is_main(&self) -> bool {
        self.inner.lock().is_main
    }

    pub fn is_current(&self) -> bool {
        match self.bound_thread() {
            Some(th) => th.current_id() == Some(self.id),
            None => false,
        }
    }

    /// Alive: it has frames to run, or it is the current tasklet of its
    /// thread (the thread holds the frame of the current tasklet).
    pub fn alive(&self) -> bool {
        if self.inner.lock().frame.is_some() {
            return true;
        }
        self.is_current()
    }

    /// Alive but on no chain.
    pub fn paused(&self) -> bool {
        self.alive() && self.inner.lock().container.is_none()
    }

    /// On the ready queue or a channel wait queue.
    pub fn scheduled(&self) -> bool {
        !self.inner.lock().container.is_none()
    }

    /// The channel this tasklet is blocked on, if any.
    pub fn channel(&self) -> Option<Arc<Channel>> {
        match &self.inner.lock().container {
            Container::Channel(w) => w.upgrade(),
            _ => None,
        }
    }

    pub fn recursion_depth(&self) -> usize {
        if self.is_current() {
            if let Some(th) = self.bound_thread() {
                return th.recursion_depth();
            }
        }
        self.inner.lock().recursion_depth
    }

    /// Native-call nesting captured at suspension; zero for the current
    /// tasklet mirrors the thread's live counter.
    pub fn nesting_level(&self) -> u32 {
        if self.is_current() {
            if let Some(th) = self.bound_thread() {
                return th.nesting_level();
            }
        }
        self.inner.lock().stack.nesting_level()
    }

    /// Soft-switchable: no live native stack owned by this tasklet.
    pub fn restorable(&self) -> bool {
        self.nesting_level() == 0
    }

    // --- flag accessors -------------------------------------------------

    pub fn set_atomic(&self, flag: bool) -> bool {
        let mut inner = self.inner.lock();
        let old = inner.flags.contains(TaskletFlags::ATOMIC);
        inner.flags.set(TaskletFlags::ATOMIC, flag);
        old
    }

    pub fn atomic(&self) -> bool {
        self.inner.lock().flags.contains(TaskletFlags::ATOMIC)
    }

    pub fn set_ignore_nesting(&self, flag: bool) -> bool {
        let mut inner = self.inner.lock();
        let old = inner.flags.contains(TaskletFlags::IGNORE_NESTING);
        inner.flags.set(TaskletFlags::IGNORE_NESTING, flag);
        old
    }

    pub fn ignore_nesting(&self) -> bool {
        self.inner.lock().flags.contains(TaskletFlags::IGNORE_NESTING)
    }

    pub fn set_block_trap(&self, flag: bool) -> bool {
        let mut inner = self.inner.lock();
        let old = inner.flags.contains(TaskletFlags::BLOCK_TRAP);
        inner.flags.set(TaskletFlags::BLOCK_TRAP, flag);
        old
    }

    pub fn block_trap(&self) -> bool {
        self.inner.lock().flags.contains(TaskletFlags::BLOCK_TRAP)
    }

    // --- tempval --------------------------------------------------------

    /// Take the mailbox, leaving `None` behind.
    pub(crate) fn claim_tempval(&self) -> Value {
        core::mem::replace(&mut self.inner.lock().tempval, Value::none())
    }

    pub(crate) fn set_tempval(&self, v: Value) {
        self.inner.lock().tempval = v;
    }

    pub(crate) fn tempval_is_bomb(&self) -> bool {
        Bomb::is_bomb(&self.inner.lock().tempval)
    }

    // --- binding --------------------------------------------------------

    /// Bind a callable (and optionally arguments) to this tasklet. With
    /// everything `None` the tasklet is unbound instead.
    pub fn bind(
        self: &TaskletRef,
        func: Option<Arc<dyn Callable>>,
        args: Option<Value>,
    ) -> Result<(), Exception> {
        let bound = self.bound_thread();
        if let Some(th) = &bound {
            if th.current_id() == Some(self.id) {
                return Err(Exception::runtime_error("can't (re)bind the current tasklet"));
            }
        }
        if self.scheduled() {
            return Err(Exception::runtime_error("tasklet is scheduled"));
        }
        if self.nesting_level() != 0 {
            return Err(Exception::runtime_error("tasklet has C state on its stack"));
        }
        if self.is_main() && func.is_none() && args.is_none() {
            return Err(Exception::runtime_error("can't unbind the main tasklet"));
        }

        // A freshly bound tasklet starts in the context of its creator.
        if func.is_some() {
            let ctx = sched::current_thread().ok().and_then(|th| th.context());
            self.inner.lock().context = ctx;
        }

        {
            let mut inner = self.inner.lock();
            inner.frame = None;
            inner.recursion_depth = 0;
            debug_assert_eq!(inner.blocked, 0);
        }

        match (func, args) {
            (func, None) => {
                let tempval = match func {
                    Some(f) => Value::new(BoundFunc(f)),
                    None => Value::none(),
                };
                self.set_tempval(tempval);
                Ok(())
            }
            (func, Some(args)) => {
                if let Some(f) = func {
                    self.set_tempval(Value::new(BoundFunc(f)));
                }
                self.setup_impl(args, false)
            }
        }
    }

    /// Supply the parameters for the bound callable and make the tasklet
    /// runnable.
    pub fn setup(self: &TaskletRef, args: Value) -> Result<(), Exception> {
        if self.alive() {
            return Err(Exception::runtime_error("tasklet is alive"));
        }
        self.setup_impl(args, true)
    }

    fn setup_impl(self: &TaskletRef, args: Value, insert: bool) -> Result<(), Exception> {
        let func = {
            let inner = self.inner.lock();
            let Some(bound) = inner.tempval.downcast_ref::<BoundFunc>() else {
                return Err(Exception::runtime_error(
                    "the tasklet was not bound to a function",
                ));
            };
            Arc::clone(&bound.0)
        };
        let th = self
            .bound_thread()
            .ok_or_else(|| Exception::runtime_error("tasklet has no thread"))?;
        {
            let mut inner = self.inner.lock();
            if inner.frame.is_some() {
                return Err(Exception::runtime_error("tasklet is already bound to a frame"));
            }
            inner.frame = Some(TaskFrame::new(func, args));
            // a bound tasklet is soft-switchable; seat it on the stub
            inner.stack = th.initial_stub();
            inner.tempval = Value::none();
        }
        if insert {
            th.ready_push_back(self.clone());
        }
        Ok(())
    }

    /// Re-bind this tasklet to another thread's scheduler. `None` targets
    /// the calling thread.
    pub fn bind_thread(self: &TaskletRef, thread_id: Option<u64>) -> Result<(), Exception> {
        let cth = sched::current_thread()?;
        if thread_id.is_none() && self.thread_id() == Some(cth.id()) {
            return Ok(());
        }
        if self.scheduled() && self.blocked() == 0 {
            return Err(Exception::runtime_error("can't (re)bind a runnable tasklet"));
        }
        if self.nesting_level() != 0 {
            return Err(Exception::runtime_error("tasklet has C state on its stack"));
        }
        let target = match thread_id {
            None => Some(cth.clone()),
            Some(id) => cth.runtime().thread_by_id(id),
        };
        let target = match target {
            Some(th) if th.has_main() => th,
            _ => return Err(Exception::value_error("bad thread")),
        };
        self.inner.lock().stack = target.initial_stub();
        Ok(())
    }

    // --- scheduling operations ------------------------------------------

    pub(crate) fn insert_checks(&self, target_th: &Arc<SchedThread>) -> Result<bool, Exception> {
        let (blocked, scheduled, has_frame) = {
            let inner = self.inner.lock();
            (inner.blocked != 0, !inner.container.is_none(), inner.frame.is_some())
        };
        if blocked {
            return Err(Exception::runtime_error("You cannot run a blocked tasklet"));
        }
        if scheduled {
            return Ok(false); // already scheduled, nothing to do
        }
        if !target_th.has_main() {
            return Err(Exception::runtime_error("Target thread isn't initialized"));
        }
        if !has_frame && target_th.current_id() != Some(self.id) {
            return Err(Exception::runtime_error("You cannot run an unbound(dead) tasklet"));
        }
        Ok(true)
    }

    /// Insert at the end of the ready queue of the bound thread.
    pub fn insert(self: &TaskletRef) -> Result<(), Exception> {
        let target_th = self
            .bound_thread()
            .ok_or_else(|| Exception::runtime_error("tasklet has no thread"))?;
        if self.insert_checks(&target_th)? {
            target_th.ready_push_back(self.clone());
            // the target thread may be parked waiting for work
            target_th.unblock();
        }
        Ok(())
    }

    /// Remove from the ready queue, leaving the tasklet paused.
    pub fn remove(self: &TaskletRef) -> Result<(), Exception> {
        let Some(target_th) = self.bound_thread() else {
            return Ok(());
        };
        if self.blocked() != 0 {
            return Err(Exception::runtime_error("You cannot remove a blocked tasklet."));
        }
        if target_th.current_id() == Some(self.id) {
            return Err(Exception::runtime_error("The current tasklet cannot be removed."));
        }
        target_th.ready_remove(self);
        Ok(())
    }

    /// Make this tasklet runnable and switch to it, keeping the caller
    /// scheduled.
    pub fn run(self: &TaskletRef) -> Result<Value, Exception> {
        match self.run_remove(false, false)? {
            crate::unwind::Soft::Done(v) => Ok(v),
            crate::unwind::Soft::Unwind => unreachable!("hard run cannot unwind"),
        }
    }

    /// Soft-capable variant of [`run`][Self::run] for use inside frames.
    pub fn run_soft(self: &TaskletRef) -> Result<crate::unwind::Soft<Value>, Exception> {
        crate::unwind::offer();
        let flag = crate::unwind::take_offer();
        // re-advertise the taken offer for the implementation to consume
        crate::unwind::promote(flag);
        let r = self.run_remove(false, true);
        crate::unwind::assert_clear();
        r
    }

    /// Like `run`, but atomically remove the caller from the ready queue.
    /// Only meaningful for tasklets of the same thread.
    pub fn switch(self: &TaskletRef) -> Result<Value, Exception> {
        match self.run_remove(true, false)? {
            crate::unwind::Soft::Done(v) => Ok(v),
            crate::unwind::Soft::Unwind => unreachable!("hard switch cannot unwind"),
        }
    }

    /// Soft-capable variant of [`switch`][Self::switch].
    pub fn switch_soft(self: &TaskletRef) -> Result<crate::unwind::Soft<Value>, Exception> {
        crate::unwind::offer();
        let r = self.run_remove(true, true);
        crate::unwind::assert_clear();
        r
    }

    fn run_remove(
        self: &TaskletRef,
        remove: bool,
        soft: bool,
    ) -> Result<crate::unwind::Soft<Value>, Exception> {
        let may_unwind = if soft { crate::unwind::take_offer() } else { false };
        let th = sched::current_thread()?;
        th.ensure_main()?;
        let prev = th
            .current()
            .ok_or_else(|| Exception::runtime_error("thread has no current tasklet"))?;
        let target_th = self
            .bound_thread()
            .ok_or_else(|| Exception::runtime_error("tasklet has no thread"))?;

        let mut removed = false;
        if target_th.id() == th.id() {
            // Same thread: append at the tail and switch over. This upsets
            // strict FIFO order on purpose.
            if self.insert_checks(&th)? {
                th.ready_push_back(self.clone());
            }
            if remove {
                th.defer_drop(Box::new(prev.clone()));
                th.ready_pop_current();
                removed = true;
            }
        } else {
            if remove {
                return Err(Exception::runtime_error("can't switch to a different thread."));
            }
            let proceed = self.insert_checks(&target_th)?;
            if proceed {
                if target_th.is_idle() {
                    // parked or not yet re-acquired: let it run first on wake
                    target_th.ready_push_front(self.clone());
                } else if target_th.current().is_some() {
                    target_th.ready_insert_after_current(self.clone());
                } else {
                    target_th.ready_push_back(self.clone());
                }
                target_th.unblock();
            }
        }

        let result = sched::schedule_task(&th, prev.clone(), Some(self.clone()), may_unwind);
        if result.is_err() && removed {
            th.take_deferred_drop();
            if !prev.scheduled() {
                th.ready_unremove_current(prev);
            }
        }
        result
    }

    // --- exceptions -----------------------------------------------------

    /// Raise `exc` inside this tasklet. With `pending` the tasklet is only
    /// made runnable with the exception staged; otherwise it is activated
    /// immediately.
    pub fn throw(self: &TaskletRef, exc: Exception, pending: bool) -> Result<(), Exception> {
        self.throw_impl(exc, pending).map(|_| ())
    }

    /// `throw` with immediate activation.
    pub fn raise_exception(self: &TaskletRef, exc: Exception) -> Result<(), Exception> {
        self.throw(exc, false)
    }

    /// Raise the distinguished `TaskletExit` in this tasklet. A regular
    /// exception that can be caught; unhandled, it silently ends the
    /// tasklet.
    pub fn kill(self: &TaskletRef, pending: bool) -> Result<(), Exception> {
        if self.bound_thread().is_none() {
            // Without a thread the kill must not be able to fail: drop the
            // frames so the dead-tasklet path below accepts it.
            self.inner.lock().frame = None;
        }
        self.throw(Exception::tasklet_exit(), pending)
    }

    fn throw_impl(self: &TaskletRef, exc: Exception, pending: bool) -> Result<Value, Exception> {
        let th = sched::current_thread()?;
        th.ensure_main()?;
        let bomb = Bomb::wrap(exc.clone());

        // Target is ourselves: a delayed exception makes no sense, raise
        // directly.
        if th.current_id() == Some(self.id) {
            return Err(exc);
        }

        let target_th = self.bound_thread();
        if !self.alive() {
            // TaskletExit to a tasklet that already ran to its end is a
            // no-op; everything else is an error.
            let ran_to_end =
                !(target_th.is_none() && self.inner.lock().frame.is_some());
            if !exc.is_tasklet_exit() || !ran_to_end {
                if target_th.is_none() {
                    return Err(Exception::runtime_error("tasklet has no thread"));
                }
                return Err(Exception::runtime_error("You cannot throw to a dead tasklet"));
            }
            // Post-conditions of throw: not blocked, not scheduled. Work
            // around corpses that are still chained somewhere.
            debug_assert!(self.inner.lock().container.is_none());
            if let Some(chan) = self.channel() {
                chan.unchain(self);
            } else if let Some(tth) = &target_th {
                tth.ready_remove(self);
            }
            return Ok(Value::none());
        }
        let target_th =
            target_th.ok_or_else(|| Exception::runtime_error("tasklet has no thread"))?;
        if pending && !target_th.has_main() {
            return Err(Exception::runtime_error("Target thread isn't initialised"));
        }

        let displaced = self.claim_tempval();
        self.set_tempval(bomb);
        if !pending {
            let prev = th
                .current()
                .ok_or_else(|| Exception::runtime_error("thread has no current tasklet"))?;
            match sched::schedule_task(&th, prev, Some(self.clone()), false) {
                Ok(crate::unwind::Soft::Done(v)) => Ok(v),
                Ok(crate::unwind::Soft::Unwind) => unreachable!("hard throw cannot unwind"),
                Err(e) => {
                    self.set_tempval(displaced);
                    Err(e)
                }
            }
        } else {
            // Pending throw: unblock from a channel if needed and make it
            // runnable.
            if let Some(chan) = self.channel() {
                chan.unchain(self);
            }
            match self.insert() {
                Ok(()) => Ok(Value::none()),
                Err(e) => {
                    self.set_tempval(displaced);
                    Err(e)
                }
            }
        }
    }

    // --- context and trace state ----------------------------------------

    /// The tasklet's context object.
    pub fn context(&self) -> Option<Value> {
        if self.is_current() {
            return self.bound_thread().and_then(|th| th.context());
        }
        self.inner.lock().context.clone()
    }

    /// Install a context object for this tasklet.
    pub fn set_context(self: &TaskletRef, ctx: Value) -> Result<(), Exception> {
        if self.is_current() {
            let th = self
                .bound_thread()
                .ok_or_else(|| Exception::runtime_error("tasklet has no thread"))?;
            th.set_context(Some(ctx));
        } else {
            self.inner.lock().context = Some(ctx);
        }
        Ok(())
    }

    /// Run `func` under this tasklet's context on the calling tasklet,
    /// with context switching trapped for the duration.
    pub fn context_run(
        self: &TaskletRef,
        func: &Arc<dyn Callable>,
        args: Value,
    ) -> Result<Value, Exception> {
        let th = sched::current_thread()?;
        let run_in_place = self.is_current();
        let saved = if run_in_place {
            None
        } else {
            Some(th.set_context(self.inner.lock().context.clone()))
        };

        th.switch_trap_delta(1);
        let cx = FrameCx { th: &th };
        let result = func.run(&cx, Ok(args));
        th.switch_trap_delta(-1);

        if let Some(saved) = saved {
            // write any context replacement back before restoring
            let after = th.set_context(saved);
            self.inner.lock().context = after;
        }

        match result {
            FrameResult::Return(v) => Ok(v),
            FrameResult::Raise(e) => Err(e),
            FrameResult::Unwind => Err(Exception::system_error(
                "context_run callable returned an unwind token",
            )),
        }
    }

    /// The trace hook of this tasklet: the thread's live installation when
    /// current, the saved slot otherwise.
    pub fn trace_function(&self) -> Option<Value> {
        if self.is_current() {
            return self.bound_thread().and_then(|th| th.trace_function());
        }
        self.inner.lock().trace.func.clone()
    }

    pub fn set_trace_function(&self, func: Option<Value>) {
        if self.is_current() {
            if let Some(th) = self.bound_thread() {
                th.set_trace_function(func);
                return;
            }
        }
        self.inner.lock().trace.func = func;
    }

    pub fn profile_function(&self) -> Option<Value> {
        if self.is_current() {
            return self.bound_thread().and_then(|th| th.profile_function());
        }
        self.inner.lock().profile.func.clone()
    }

    pub fn set_profile_function(&self, func: Option<Value>) {
        if self.is_current() {
            if let Some(th) = self.bound_thread() {
                th.set_profile_function(func);
                return;
            }
        }
        self.inner.lock().profile.func = func;
    }

    /// The top of the saved frame chain, if any.
    pub fn frame(&self) -> Option<FrameRef> {
        self.inner.lock().frame.clone()
    }
}

impl fmt::Debug for Tasklet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Tasklet")
            .field("id", &self.id)
            .field("main", &inner.is_main)
            .field("blocked", &inner.blocked)
            .field("flags", &inner.flags)
            .field("alive", &inner.frame.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExcKind;
    use crate::test_util::{body, init, int, run_test};

    #[test]
    fn binding_rules() {
        run_test(|| {
            let (_rt, th) = init();
            let main = th.main().unwrap();

            // the current tasklet cannot be (re)bound
            let err = main.bind(Some(body(|_cx| Ok(Value::none()))), None).unwrap_err();
            assert!(err.message().contains("current tasklet"));
            // and main cannot be unbound
            let t = Tasklet::new(None).unwrap();
            let err = t.setup(Value::none()).unwrap_err();
            assert!(err.message().contains("not bound to a function"));

            t.bind(Some(body(|_cx| Ok(Value::none()))), None).unwrap();
            assert!(!t.alive(), "bound without args is not alive yet");
            t.setup(int(1)).unwrap();
            assert!(t.alive());
            assert!(t.scheduled());

            // a scheduled tasklet cannot be rebound
            let err = t.bind(None, None).unwrap_err();
            assert!(err.message().contains("scheduled"));

            // run it to death; a dead tasklet can be rebound and rerun
            t.run().unwrap();
            assert!(!t.alive());
            t.bind(Some(body(|_cx| Ok(Value::none()))), Some(Value::none()))
                .unwrap();
            assert!(t.alive());
            t.insert().unwrap();
            t.run().unwrap();
            assert!(!t.alive());
        });
    }

    #[test]
    fn unbinding_main_is_refused() {
        run_test(|| {
            let (_rt, th) = init();
            let main = th.main().unwrap();
            let err = main.bind(None, None).unwrap_err();
            // the current tasklet is caught first; verify the main guard on
            // a non-current main is the documented message
            assert_eq!(err.kind(), ExcKind::RuntimeError);
        });
    }

    #[test]
    fn live_native_stack_blocks_rebinding() {
        run_test(|| {
            let _rt = init();
            let t = crate::spawn(
                body(|_cx| {
                    crate::schedule(None)?; // suspend with a live native stack
                    Ok(Value::none())
                }),
                Value::none(),
            )
            .unwrap();
            t.run().unwrap();
            assert_eq!(t.nesting_level(), 1);
            assert!(!t.restorable());

            // take it off the queue so the stack check is what fires
            t.remove().unwrap();
            let err = t.bind(Some(body(|_cx| Ok(Value::none()))), None).unwrap_err();
            assert!(err.message().contains("C state"));

            // drive it to completion so nothing stays parked
            t.insert().unwrap();
            while t.alive() {
                crate::schedule(None).unwrap();
            }
        });
    }

    #[test]
    fn flag_setters_return_the_previous_value() {
        run_test(|| {
            let _rt = init();
            let t = Tasklet::new(None).unwrap();
            assert!(!t.set_atomic(true));
            assert!(t.set_atomic(false));
            assert!(!t.atomic());
            assert!(!t.set_ignore_nesting(true));
            assert!(t.ignore_nesting());
            assert!(t.set_ignore_nesting(false));
            assert!(!t.set_block_trap(true));
            assert!(t.block_trap());
            t.set_block_trap(false);
        });
    }

    #[test]
    fn predicates_follow_the_lifecycle() {
        run_test(|| {
            let (_rt, th) = init();
            let t = Tasklet::new(Some(body(|_cx| {
                crate::schedule_remove(None)?;
                Ok(Value::none())
            })))
            .unwrap();

            // new and bound, but no frame yet
            assert!(!t.alive());
            assert!(!t.scheduled());
            assert!(!t.paused());
            assert!(t.restorable());
            assert_eq!(t.thread_id(), Some(th.id()));

            t.setup(Value::none()).unwrap();
            assert!(t.alive());
            assert!(t.scheduled());
            assert!(!t.paused());

            // runs, removes itself, stays alive but floating
            t.run().unwrap();
            assert!(t.alive());
            assert!(!t.scheduled());
            assert!(t.paused());

            // resume it to completion
            t.insert().unwrap();
            t.run().unwrap();
            assert!(!t.alive());
            assert!(!t.scheduled());
        });
    }

    #[test]
    fn raise_exception_hits_the_target_immediately() {
        run_test(|| {
            let _rt = init();
            let ch = crate::channel::Channel::new();
            let ich = Arc::clone(&ch);
            let seen = crate::test_util::Log::new();
            let iseen = seen.clone();
            let t = crate::spawn(
                body(move |_cx| match ich.receive() {
                    Ok(_) => Ok(Value::none()),
                    Err(e) => {
                        iseen.push(format!("caught-{}", e.kind().name()));
                        Ok(Value::none())
                    }
                }),
                Value::none(),
            )
            .unwrap();
            t.run().unwrap();
            t.raise_exception(Exception::value_error("zap")).unwrap();
            assert_eq!(seen.events(), vec!["caught-ValueError"]);
            assert!(!t.alive());
        });
    }

    #[test]
    fn throwing_at_yourself_raises_in_place() {
        run_test(|| {
            let (_rt, th) = init();
            let main = th.main().unwrap();
            let err = main
                .throw(Exception::value_error("self"), false)
                .unwrap_err();
            assert_eq!(err.kind(), ExcKind::ValueError);
            assert_eq!(err.message(), "self");
        });
    }

    #[test]
    fn context_run_traps_switching() {
        run_test(|| {
            let _rt = init();
            let t = Tasklet::new(None).unwrap();
            t.set_context(Value::new("inner-ctx")).unwrap();

            // the callable observes the tasklet's context on this thread
            let probe: Arc<dyn Callable> = Arc::new(
                |cx: &FrameCx<'_>, _input: Result<Value, Exception>| {
                    let ctx = cx.thread().context();
                    match ctx {
                        Some(c) if c.is::<&str>() => FrameResult::Return(int_marker()),
                        _ => FrameResult::Raise(Exception::system_error("context missing")),
                    }
                },
            );
            let v = t.context_run(&probe, Value::none()).unwrap();
            assert_eq!(*v.downcast_ref::<i64>().unwrap(), 99);

            // switching away from inside context_run is trapped
            let switcher: Arc<dyn Callable> = Arc::new(
                |_cx: &FrameCx<'_>, _input: Result<Value, Exception>| {
                    match crate::sched::schedule(None) {
                        Ok(_) => FrameResult::Return(Value::none()),
                        Err(e) => FrameResult::Raise(e),
                    }
                },
            );
            crate::spawn(body(|_cx| Ok(Value::none())), Value::none()).unwrap();
            let err = t.context_run(&switcher, Value::none()).unwrap_err();
            assert_eq!(err.message(), "switch_trap");

            // clean up the helper
            crate::schedule(None).unwrap();
        });
    }

    fn int_marker() -> Value {
        Value::new(99_i64)
    }
}
