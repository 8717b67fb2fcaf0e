// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # silk
//!
//! A cooperative-microthread runtime core, designed to be grafted onto a
//! host interpreter. Each OS thread carries its own scheduler of
//! lightweight [`Tasklet`]s that communicate exclusively over typed,
//! synchronous rendezvous [`Channel`]s.
//!
//! The host's bytecode evaluator stays outside: the core sees host
//! execution as resumable [`Frame`] trait objects and drives them through
//! a per-thread dispatch loop. Three tightly coupled subsystems make up
//! the core:
//!
//! * the **scheduler**: a circular per-thread ready queue (head = current
//!   tasklet), watchdog time-slicing with soft interrupts, inter-thread
//!   hand-off, and idle-thread parking;
//! * the **switch engine**: dual-mode context transfer; a *soft* switch
//!   re-seats the staged frame and answers an unwind token through the
//!   call chain, a *hard* switch captures the running native stack and
//!   resumes another one;
//! * the **channel rendezvous**: balanced send/receive with a
//!   configurable scheduling preference, close semantics, and the
//!   [`Bomb`] delayed-exception carrier flowing through it.
//!
//! ## A tiny session
//!
//! ```
//! use silk::{Callable, Channel, Exception, FrameCx, FrameResult, Runtime, Tasklet, Value};
//! use std::sync::Arc;
//!
//! let rt = Runtime::new();
//! rt.init_current_thread().unwrap();
//!
//! let ch = Channel::new();
//! let ch2 = Arc::clone(&ch);
//! let body = move |_cx: &FrameCx<'_>, _input: Result<Value, Exception>| {
//!     match ch2.send(Value::new(42_i64)) {
//!         Ok(()) => FrameResult::Return(Value::none()),
//!         Err(e) => FrameResult::Raise(e),
//!     }
//! };
//! let t = Tasklet::new(Some(Arc::new(body) as Arc<dyn Callable>)).unwrap();
//! t.setup(Value::none()).unwrap();
//!
//! let got = ch.receive().unwrap();
//! assert_eq!(got.downcast_ref::<i64>(), Some(&42));
//! ```

mod bomb;
mod channel;
#[cfg(test)]
mod test_util;
mod error;
mod frame;
mod sched;
mod stack;
mod tasklet;
mod unwind;
mod value;

pub use bomb::Bomb;
pub use channel::Channel;
pub use error::{ExcKind, Exception};
pub use frame::{Callable, Frame, FrameCx, FrameRef, FrameResult};
pub use sched::{
    ChannelCallback, ErrorHandler, ExitHook, LockHook, PickleFlags, RunFlags, Runtime,
    ScheduleCallback, SchedThread, get_current, get_current_id, get_main, get_runcount,
    pickle_flags, pickle_flags_default, run_watchdog, run_watchdog_ex, schedule, schedule_remove,
    schedule_remove_soft, schedule_soft, switch_trap,
};
pub use stack::NativeStack;
pub use tasklet::{Tasklet, TaskletFlags, TaskletRef};
pub use unwind::Soft;
pub use value::Value;

use std::sync::Arc;

/// Create a tasklet bound to `func`, hand it `args`, and insert it into
/// the calling thread's ready queue.
pub fn spawn(func: Arc<dyn Callable>, args: Value) -> Result<TaskletRef, Exception> {
    let t = Tasklet::new(Some(func))?;
    t.setup(args)?;
    Ok(t)
}

// The whole object graph migrates between stack segments (OS threads).
static_assertions::assert_impl_all!(Tasklet: Send, Sync);
static_assertions::assert_impl_all!(Channel: Send, Sync);
static_assertions::assert_impl_all!(SchedThread: Send, Sync);
static_assertions::assert_impl_all!(Value: Send, Sync, Clone);
static_assertions::assert_impl_all!(Exception: Send, Sync, Clone);
