// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::value::Value;
use core::fmt;
use std::borrow::Cow;

/// The kind of an [`Exception`].
///
/// These mirror the exception classes a host interpreter is expected to
/// provide. The runtime core only ever needs to distinguish kinds, never
/// full class hierarchies, with one exception: [`ExcKind::TaskletExit`] is a
/// subtype of [`ExcKind::SystemExit`] and both answer `true` to
/// [`ExcKind::is_system_exit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcKind {
    /// Misuse of the API: wrong argument types, binding a non-callable.
    TypeError,
    /// A state-machine violation: scheduling while trapped, inserting a
    /// blocked tasklet, deadlock, a fired block trap.
    RuntimeError,
    /// Cross-object resets, binding to an unknown thread id, bad flag bits.
    ValueError,
    /// The distinguished kill signal. Silently terminates a non-main
    /// tasklet.
    TaskletExit,
    /// Host-level exit request. On the primary thread this reaches the
    /// configured exit hook.
    SystemExit,
    /// An invariant breach observed at runtime.
    SystemError,
    /// Allocation failure. Always delivered via the preallocated bomb so
    /// that propagation cannot itself fail.
    MemoryError,
    /// Operation on a closed channel (the `StopIteration` equivalent of the
    /// host).
    ChannelClosed,
}

impl ExcKind {
    pub fn name(self) -> &'static str {
        match self {
            ExcKind::TypeError => "TypeError",
            ExcKind::RuntimeError => "RuntimeError",
            ExcKind::ValueError => "ValueError",
            ExcKind::TaskletExit => "TaskletExit",
            ExcKind::SystemExit => "SystemExit",
            ExcKind::SystemError => "SystemError",
            ExcKind::MemoryError => "MemoryError",
            ExcKind::ChannelClosed => "ChannelClosed",
        }
    }

    /// `TaskletExit` is a subtype of `SystemExit`; both count.
    pub fn is_system_exit(self) -> bool {
        matches!(self, ExcKind::SystemExit | ExcKind::TaskletExit)
    }
}

/// An in-flight exception: kind, message and the optional host payload and
/// traceback objects that travel with it through bombs and channels.
#[derive(Debug, Clone)]
pub struct Exception {
    kind: ExcKind,
    message: Cow<'static, str>,
    value: Option<Value>,
    traceback: Option<Value>,
}

impl Exception {
    pub fn new(kind: ExcKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            value: None,
            traceback: None,
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_traceback(mut self, tb: Value) -> Self {
        self.traceback = Some(tb);
        self
    }

    pub fn type_error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ExcKind::TypeError, message)
    }

    pub fn runtime_error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ExcKind::RuntimeError, message)
    }

    pub fn value_error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ExcKind::ValueError, message)
    }

    pub fn system_error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ExcKind::SystemError, message)
    }

    pub fn memory_error() -> Self {
        Self::new(ExcKind::MemoryError, "out of memory")
    }

    pub fn tasklet_exit() -> Self {
        Self::new(ExcKind::TaskletExit, "tasklet exit")
    }

    pub fn channel_closed() -> Self {
        Self::new(ExcKind::ChannelClosed, "the channel is closed")
    }

    pub fn kind(&self) -> ExcKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn traceback(&self) -> Option<&Value> {
        self.traceback.as_ref()
    }

    pub fn is_system_exit(&self) -> bool {
        self.kind.is_system_exit()
    }

    pub fn is_tasklet_exit(&self) -> bool {
        self.kind == ExcKind::TaskletExit
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(self.kind.name())
        } else {
            write!(f, "{}: {}", self.kind.name(), self.message)
        }
    }
}

impl core::error::Error for Exception {}

/// Unrecoverable runtime states. The native stack is no longer coherent at
/// these points, so there is no error value that could express them.
#[cold]
pub(crate) fn fatal(msg: &str) -> ! {
    panic!("fatal runtime inconsistency: {msg}");
}
