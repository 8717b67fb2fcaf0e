// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The evaluator seam: frames and the callable top frame.
//!
//! Bytecode evaluation itself belongs to the host. The core sees a tasklet's
//! work as a chain of [`Frame`] trait objects and drives them through the
//! dispatch loop. A frame must be *resumable*: when its tasklet suspends
//! softly, the very same frame is executed again later, with the delivered
//! tempval (or the exploded bomb) as its input. Host frames therefore keep
//! their own progress state, the way an interpreter frame keeps its
//! instruction pointer.

use crate::error::Exception;
use crate::sched::SchedThread;
use crate::tasklet::TaskletRef;
use crate::unwind::Soft;
use crate::value::Value;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type FrameRef = Arc<dyn Frame>;

/// Outcome of one execution of a frame: the object-returning ternary.
///
/// `Unwind` is the unwind token: a context switch has been staged and the
/// result must be propagated upward without inspection.
#[derive(Debug)]
pub enum FrameResult {
    Return(Value),
    Raise(Exception),
    Unwind,
}

/// One unit of host execution.
pub trait Frame: Send + Sync {
    /// Run (or resume) this frame.
    ///
    /// `input` is the value delivered by whoever resumed the tasklet: the
    /// bound arguments on first entry, a channel payload after a rendezvous,
    /// or an error when a bomb exploded on delivery.
    fn execute(&self, cx: &FrameCx<'_>, input: Result<Value, Exception>) -> FrameResult;

    /// The frame below this one, receiving our return value when we finish.
    fn back(&self) -> Option<FrameRef> {
        None
    }
}

/// Execution context handed to every frame.
///
/// Carries the scheduler record of the thread the frame is running on and
/// proxies the operations an evaluator performs at safe points.
pub struct FrameCx<'a> {
    pub(crate) th: &'a Arc<SchedThread>,
}

impl FrameCx<'_> {
    pub fn thread(&self) -> &Arc<SchedThread> {
        self.th
    }

    /// The tasklet this frame is executing under.
    pub fn current(&self) -> Option<TaskletRef> {
        self.th.current()
    }

    /// Account for `n` executed instructions; returns `true` once the
    /// watchdog watermark has fired and the frame should yield at its next
    /// safe point.
    pub fn consume_ticks(&self, n: i64) -> bool {
        self.th.consume_ticks(n)
    }

    /// Yield to the scheduler from a safe point, soft-switching when
    /// possible. `retval` becomes this tasklet's tempval, delivered back on
    /// resume.
    pub fn schedule_soft(&self, retval: Option<Value>) -> Result<Soft<Value>, Exception> {
        crate::sched::schedule_soft_on(self.th, retval, false)
    }
}

/// The tasklet body. `bind` stores the callable, `setup` puts a
/// [`TaskFrame`] around it and makes the tasklet runnable.
///
/// The re-entry contract is the same as for frames; a body written as a
/// plain closure may simply perform hard (blocking) operations and run
/// straight through.
pub trait Callable: Send + Sync {
    fn run(&self, cx: &FrameCx<'_>, input: Result<Value, Exception>) -> FrameResult;
}

impl<F> Callable for F
where
    F: Fn(&FrameCx<'_>, Result<Value, Exception>) -> FrameResult + Send + Sync,
{
    fn run(&self, cx: &FrameCx<'_>, input: Result<Value, Exception>) -> FrameResult {
        self(cx, input)
    }
}

/// The top frame of a bound tasklet: feeds the bound arguments into the
/// callable on first entry, passes resume values through afterwards.
pub(crate) struct TaskFrame {
    func: Arc<dyn Callable>,
    args: Value,
    started: AtomicBool,
}

impl TaskFrame {
    pub(crate) fn new(func: Arc<dyn Callable>, args: Value) -> Arc<Self> {
        Arc::new(Self {
            func,
            args,
            started: AtomicBool::new(false),
        })
    }
}

impl Frame for TaskFrame {
    fn execute(&self, cx: &FrameCx<'_>, input: Result<Value, Exception>) -> FrameResult {
        let input = if self.started.swap(true, Ordering::Relaxed) {
            input
        } else {
            match input {
                // The first activation replaces the (empty) tempval with the
                // bound arguments. A bomb thrown at a fresh tasklet still
                // wins.
                Ok(_) => Ok(self.args.clone()),
                Err(e) => Err(e),
            }
        };
        self.func.run(cx, input)
    }
}
