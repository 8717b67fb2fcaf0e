// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shared helpers for the in-crate tests.

use crate::error::Exception;
use crate::frame::{Callable, FrameCx, FrameResult};
use crate::sched::{Runtime, SchedThread};
use crate::value::Value;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Run a test body on a dedicated OS thread.
///
/// Scheduler state is bound thread-locally, so every test needs a thread
/// that has never seen a runtime before; the harness thread may be reused
/// across tests. A watchdog turns a deadlocked test into a failure instead
/// of a hang.
pub(crate) fn run_test(f: impl FnOnce() + Send + 'static) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let (done_tx, done_rx) = mpsc::channel::<()>();
    let handle = std::thread::Builder::new()
        .name("silk-test".into())
        .spawn(move || {
            f();
            let _ = done_tx.send(());
        })
        .expect("failed to spawn the test thread");

    match done_rx.recv_timeout(Duration::from_secs(60)) {
        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test timed out; the scheduler appears to be stuck");
        }
    }
}

/// Fresh runtime bound to the calling (test) thread.
pub(crate) fn init() -> (Arc<Runtime>, Arc<SchedThread>) {
    let rt = Runtime::new();
    let th = rt.init_current_thread().expect("thread init failed");
    (rt, th)
}

/// A tasklet body from a plain fallible closure; errors surface as raised
/// exceptions.
pub(crate) fn body<F>(f: F) -> Arc<dyn Callable>
where
    F: Fn(&FrameCx<'_>) -> Result<Value, Exception> + Send + Sync + 'static,
{
    Arc::new(
        move |cx: &FrameCx<'_>, _input: Result<Value, Exception>| match f(cx) {
            Ok(v) => FrameResult::Return(v),
            Err(e) => FrameResult::Raise(e),
        },
    )
}

/// A raw (re-entrant) tasklet body.
pub(crate) fn raw_body<F>(f: F) -> Arc<dyn Callable>
where
    F: Fn(&FrameCx<'_>, Result<Value, Exception>) -> FrameResult + Send + Sync + 'static,
{
    Arc::new(f)
}

pub(crate) fn int(v: i64) -> Value {
    Value::new(v)
}

pub(crate) fn as_int(v: &Value) -> i64 {
    *v.downcast_ref::<i64>().expect("value is not an integer")
}

/// An append-only event log shared between tasklets.
#[derive(Clone, Default)]
pub(crate) struct Log(Arc<spin::Mutex<Vec<String>>>);

impl Log {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, ev: impl Into<String>) {
        self.0.lock().push(ev.into());
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}
