// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The delayed-exception carrier.
//!
//! A [`Bomb`] wraps an exception into a [`Value`] so it can travel wherever
//! a normal result travels: through a tasklet's tempval, through a channel
//! rendezvous, or to the watchdog that has to learn about an uncaught error.
//! The receiving side detects the bomb by downcast when it claims the value
//! and re-raises the carried exception instead of delivering a result.
//!
//! The out-of-memory bomb is a process-wide singleton that exists before it
//! is ever needed: delivering an allocation failure must not allocate.

use crate::error::{Exception, ExcKind};
use crate::value::Value;
use core::fmt;
use std::sync::OnceLock;

/// An immutable `(kind, value, traceback)` triple riding inside a [`Value`].
pub struct Bomb {
    exc: Exception,
}

impl Bomb {
    /// Wrap an exception into a bomb value, ready to be planted in a
    /// tempval.
    pub fn wrap(exc: Exception) -> Value {
        Value::new(Bomb { exc })
    }

    /// The preallocated out-of-memory bomb. Shared and never deallocated.
    pub fn no_memory() -> Value {
        static NOMEM: OnceLock<Value> = OnceLock::new();
        NOMEM
            .get_or_init(|| Bomb::wrap(Exception::memory_error()))
            .clone()
    }

    /// Does this value carry a bomb?
    pub fn is_bomb(v: &Value) -> bool {
        v.is::<Bomb>()
    }

    /// Detonate: discard the carrier and surface the exception.
    ///
    /// Calling this on a non-bomb value is an invariant breach and reports
    /// a `SystemError`.
    pub fn explode(v: Value) -> Exception {
        match v.downcast_ref::<Bomb>() {
            Some(b) => b.exc.clone(),
            None => Exception::system_error("explode called on a non-bomb value"),
        }
    }

    pub fn kind(&self) -> ExcKind {
        self.exc.kind()
    }

    pub fn exception(&self) -> &Exception {
        &self.exc
    }
}

impl fmt::Debug for Bomb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bomb({})", self.exc)
    }
}

/// Claimed-tempval helper: a bomb turns into an error, anything else is the
/// delivered value.
pub(crate) fn explode_to_result(v: Value) -> Result<Value, Exception> {
    if Bomb::is_bomb(&v) { Err(Bomb::explode(v)) } else { Ok(v) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bomb_roundtrip() {
        let v = Bomb::wrap(Exception::runtime_error("boom"));
        assert!(Bomb::is_bomb(&v));
        let e = Bomb::explode(v);
        assert_eq!(e.kind(), ExcKind::RuntimeError);
        assert_eq!(e.message(), "boom");
    }

    #[test]
    fn no_memory_bomb_is_shared() {
        assert!(Bomb::no_memory().ptr_eq(&Bomb::no_memory()));
        assert_eq!(Bomb::explode(Bomb::no_memory()).kind(), ExcKind::MemoryError);
    }

    #[test]
    fn plain_values_pass_through() {
        assert!(explode_to_result(Value::new(7_i64)).is_ok());
        assert!(explode_to_result(Bomb::wrap(Exception::tasklet_exit())).is_err());
    }
}
