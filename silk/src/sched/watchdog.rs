// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The watchdog: time-sliced driving of the ready queue.
//!
//! `run_watchdog_ex` suspends the invoking tasklet, pushes it onto the
//! thread's watchdog stack, and runs the remaining tasklets until the
//! queue drains, the tick watermark fires, or an uncaught exception is
//! routed back. Watchdogs nest; the innermost one receives interrupts and
//! bombs.

use crate::error::Exception;
use crate::sched::{self, SchedThread};
use crate::tasklet::TaskletRef;
use crate::unwind::Soft;
use bitflags::bitflags;
use std::sync::Arc;

bitflags! {
    /// Behaviour flags for [`run_watchdog_ex`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RunFlags: u8 {
        /// Park the thread on its block lock when the queue drains instead
        /// of returning, until a sibling thread queues new work.
        const THREADBLOCK    = 1 << 0;
        /// Interrupt softly: set a pending interrupt and reroute at the
        /// next scheduling point instead of displacing the running
        /// tasklet immediately.
        const SOFT           = 1 << 1;
        /// Allow interrupting tasklets at a non-zero nesting level.
        const IGNORE_NESTING = 1 << 2;
        /// The timeout is absolute: do not reset the watermark per
        /// timeslice.
        const TOTAL_TIMEOUT  = 1 << 3;
        /// One-shot internal suppression of soft interrupts, consumed by
        /// the next schedule.
        const NO_SOFT_IRQ    = 1 << 7;
    }
}

/// [`run_watchdog_ex`] without flags.
pub fn run_watchdog(timeout: i64) -> Result<Option<TaskletRef>, Exception> {
    run_watchdog_ex(timeout, RunFlags::empty())
}

/// Suspend the calling tasklet and drive the scheduler.
///
/// `timeout` is a tick budget (0 = unlimited). Returns the interrupted
/// tasklet when the watermark fired (removed from the ready queue, so the
/// caller decides whether to reinsert or kill it), or `None` when the
/// queue drained. An exception that propagated to the watchdog (uncaught
/// error, deadlock) is re-raised here.
pub fn run_watchdog_ex(timeout: i64, flags: RunFlags) -> Result<Option<TaskletRef>, Exception> {
    let th = sched::current_thread()?;
    run_watchdog_on(&th, timeout, flags)
}

pub(crate) fn run_watchdog_on(
    th: &Arc<SchedThread>,
    timeout: i64,
    flags: RunFlags,
) -> Result<Option<TaskletRef>, Exception> {
    th.ensure_main()?;
    let invoker = th
        .current()
        .ok_or_else(|| Exception::runtime_error("thread has no current tasklet"))?;
    {
        let inner = th.inner.lock();
        if inner.watchdogs.iter().any(|w| w.id() == invoker.id()) {
            return Err(Exception::runtime_error(
                "the current tasklet is already running a watchdog",
            ));
        }
    }

    tracing::debug!(thread = th.id(), timeout, ?flags, "watchdog armed");
    let saved = {
        let mut inner = th.inner.lock();
        let saved = (inner.runflags, inner.interval, inner.tick_watermark);
        inner.runflags = flags
            & (RunFlags::THREADBLOCK
                | RunFlags::SOFT
                | RunFlags::IGNORE_NESTING
                | RunFlags::TOTAL_TIMEOUT);
        inner.interval = timeout;
        inner.tick_watermark = if timeout > 0 {
            inner.tick_counter.saturating_add(timeout)
        } else {
            i64::MAX
        };
        inner.drop_request = false;
        inner.watchdogs.push(invoker.clone());
        saved
    };

    // Suspend the invoker and hand control to the queue (or the block
    // logic when it is empty).
    let popped = th.ready_pop_current();
    debug_assert!(popped.is_some_and(|t| t.id() == invoker.id()));
    let next = th.current();
    let result = sched::schedule_task(th, invoker.clone(), next, false);

    // Resumed: restore the outer watchdog's parameters.
    {
        let mut inner = th.inner.lock();
        if let Some(pos) = inner.watchdogs.iter().position(|w| w.id() == invoker.id()) {
            inner.watchdogs.remove(pos);
        }
        inner.runflags = saved.0;
        inner.interval = saved.1;
        inner.tick_watermark = saved.2;
        inner.drop_request = false;
    }
    th.clear_del_post_switch();

    let interrupted = th.take_interrupted();
    match result {
        Err(e) => Err(e),
        Ok(Soft::Unwind) => unreachable!("watchdog suspension is never soft"),
        Ok(Soft::Done(_)) => {
            if let Some(t) = interrupted {
                // The displaced tasklet leaves the queue; its fate is the
                // caller's decision.
                th.ready_remove(&t);
                tracing::debug!(interrupted = t.id(), "watchdog timeout");
                Ok(Some(t))
            } else {
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameResult;
    use crate::test_util::{Log, body, init, raw_body, run_test};
    use crate::value::Value;

    /// A compute-bound body: burns one tick per simulated instruction and
    /// yields at the safe point once the runtime asks for it.
    fn compute_body(ticks_per_step: i64, iterations: Arc<spin::Mutex<i64>>) -> Arc<dyn crate::frame::Callable> {
        raw_body(move |cx, input| {
            if let Err(e) = input {
                // a kill arrives as the resume input
                return FrameResult::Raise(e);
            }
            loop {
                *iterations.lock() += 1;
                if cx.consume_ticks(ticks_per_step) {
                    match cx.schedule_soft(None) {
                        Ok(crate::unwind::Soft::Unwind) => return FrameResult::Unwind,
                        Ok(crate::unwind::Soft::Done(_)) => continue,
                        Err(e) => return FrameResult::Raise(e),
                    }
                }
            }
        })
    }

    #[test]
    fn draining_the_queue_returns_none() {
        run_test(|| {
            let _rt = init();
            let log = Log::new();
            for tag in ["a", "b"] {
                let ilog = log.clone();
                crate::spawn(
                    body(move |_cx| {
                        ilog.push(tag);
                        Ok(Value::none())
                    }),
                    Value::none(),
                )
                .unwrap();
            }
            let interrupted = run_watchdog(0).unwrap();
            assert!(interrupted.is_none());
            assert_eq!(log.events(), vec!["a", "b"]);
            assert_eq!(crate::get_runcount(), 1);
        });
    }

    #[test]
    fn soft_interrupt_displaces_a_compute_bound_tasklet() {
        run_test(|| {
            let _rt = init();
            let iterations = Arc::new(spin::Mutex::new(0_i64));
            let t = crate::spawn(compute_body(1, Arc::clone(&iterations)), Value::none()).unwrap();

            let interrupted = run_watchdog_ex(100, RunFlags::SOFT).unwrap();
            let interrupted = interrupted.expect("the watermark must fire");
            assert_eq!(interrupted.id(), t.id());
            // displaced out of the ready queue, but alive and resumable
            assert!(!interrupted.scheduled());
            assert!(interrupted.paused());
            assert!(*iterations.lock() >= 100);

            // the caller decides its fate: kill it
            interrupted.kill(false).unwrap();
            assert!(!t.alive());
        });
    }

    #[test]
    fn hard_interrupt_displaces_the_running_tasklet() {
        run_test(|| {
            let _rt = init();
            let iterations = Arc::new(spin::Mutex::new(0_i64));
            let t = crate::spawn(compute_body(1, Arc::clone(&iterations)), Value::none()).unwrap();

            let interrupted = run_watchdog_ex(50, RunFlags::empty()).unwrap();
            let interrupted = interrupted.expect("the watermark must fire");
            assert_eq!(interrupted.id(), t.id());
            assert!(interrupted.paused());
            interrupted.kill(false).unwrap();
        });
    }

    #[test]
    fn atomic_defers_the_soft_interrupt() {
        run_test(|| {
            let _rt = init();
            let steps = Arc::new(spin::Mutex::new(0_i64));
            let isteps = Arc::clone(&steps);
            let t = crate::spawn(
                raw_body(move |cx, input| {
                    if let Err(e) = input {
                        return FrameResult::Raise(e);
                    }
                    loop {
                        let n = {
                            let mut s = isteps.lock();
                            *s += 1;
                            *s
                        };
                        let me = cx.current().unwrap();
                        if n == 5 {
                            // enter a critical section: no preemption now
                            me.set_atomic(true);
                        }
                        if n == 25 {
                            me.set_atomic(false);
                        }
                        if cx.consume_ticks(1) {
                            match cx.schedule_soft(None) {
                                Ok(crate::unwind::Soft::Unwind) => return FrameResult::Unwind,
                                Ok(crate::unwind::Soft::Done(_)) => continue,
                                Err(e) => return FrameResult::Raise(e),
                            }
                        }
                    }
                }),
                Value::none(),
            )
            .unwrap();

            let interrupted = run_watchdog_ex(10, RunFlags::SOFT).unwrap();
            let interrupted = interrupted.expect("the watermark must fire");
            assert_eq!(interrupted.id(), t.id());
            // the interrupt could not fire before the atomic section ended
            assert!(*steps.lock() >= 25, "fired at {}", *steps.lock());
            interrupted.kill(false).unwrap();
        });
    }

    #[test]
    fn total_timeout_is_an_absolute_deadline() {
        run_test(|| {
            let _rt = init();
            // Two well-behaved tasklets that yield every few ticks. With a
            // per-slice watermark they never exceed their slice and the
            // queue drains; with TOTAL_TIMEOUT the budget is cumulative.
            let spawn_pair = || {
                for _ in 0..2 {
                    let iterations = Arc::new(spin::Mutex::new(0_i64));
                    let it = Arc::clone(&iterations);
                    crate::spawn(
                        raw_body(move |cx, input| {
                            if let Err(e) = input {
                                return FrameResult::Raise(e);
                            }
                            loop {
                                let n = {
                                    let mut s = it.lock();
                                    *s += 1;
                                    *s
                                };
                                if n > 10 {
                                    return FrameResult::Return(Value::none());
                                }
                                cx.consume_ticks(3);
                                match cx.schedule_soft(None) {
                                    Ok(crate::unwind::Soft::Unwind) => return FrameResult::Unwind,
                                    Ok(crate::unwind::Soft::Done(_)) => continue,
                                    Err(e) => return FrameResult::Raise(e),
                                }
                            }
                        }),
                        Value::none(),
                    )
                    .unwrap();
                }
            };

            spawn_pair();
            let r = run_watchdog_ex(10, RunFlags::SOFT).unwrap();
            assert!(r.is_none(), "per-slice watermark never fires for 3-tick slices");

            spawn_pair();
            let r = run_watchdog_ex(10, RunFlags::SOFT | RunFlags::TOTAL_TIMEOUT).unwrap();
            let interrupted = r.expect("the absolute deadline must fire");
            interrupted.kill(false).unwrap();
            // drain the survivor
            let r = run_watchdog(0).unwrap();
            assert!(r.is_none());
        });
    }

    #[test]
    fn watchdogs_nest_innermost_first() {
        run_test(|| {
            let _rt = init();
            let log = Log::new();

            let ilog = log.clone();
            let inner_worker = move |_cx: &crate::frame::FrameCx<'_>| {
                ilog.push("inner-worker");
                Ok(Value::none())
            };
            let olog = log.clone();
            crate::spawn(
                body(move |_cx| {
                    olog.push("outer-start");
                    // this tasklet becomes the innermost watchdog
                    crate::spawn(body(inner_worker.clone()), Value::none())?;
                    let r = run_watchdog(0)?;
                    assert!(r.is_none());
                    olog.push("outer-end");
                    Ok(Value::none())
                }),
                Value::none(),
            )
            .unwrap();

            let r = run_watchdog(0).unwrap();
            assert!(r.is_none());
            assert_eq!(
                log.events(),
                vec!["outer-start", "inner-worker", "outer-end"]
            );
        });
    }

    #[test]
    fn uncaught_exceptions_propagate_to_the_watchdog() {
        run_test(|| {
            let _rt = init();
            crate::spawn(
                body(|_cx| Err(crate::error::Exception::value_error("lost"))),
                Value::none(),
            )
            .unwrap();
            let err = run_watchdog(0).unwrap_err();
            assert_eq!(err.kind(), crate::error::ExcKind::ValueError);
            assert_eq!(err.message(), "lost");
        });
    }

    #[test]
    fn the_watchdog_rearms_after_returning() {
        run_test(|| {
            let _rt = init();
            let fired = Arc::new(spin::Mutex::new(0_u32));
            for _ in 0..2 {
                let ifired = Arc::clone(&fired);
                crate::spawn(
                    body(move |_cx| {
                        *ifired.lock() += 1;
                        Ok(Value::none())
                    }),
                    Value::none(),
                )
                .unwrap();
                let r = run_watchdog(0).unwrap();
                assert!(r.is_none());
            }
            assert_eq!(*fired.lock(), 2);
        });
    }
}
