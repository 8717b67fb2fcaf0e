// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The frame dispatch loop.
//!
//! This is the anchor of soft switching: frames are staged in the thread
//! record's `next_frame` slot and the loop repeatedly claims and executes
//! them. A soft switch manifests here as nothing more than a different
//! frame being staged when the current one answers the unwind token.
//!
//! The loop runs on dispatch segments. It ends when control leaves the
//! segment: either no frame is staged anymore (the scheduler moved on
//! through a hard transfer) or a bridge frame detached the segment. The
//! hosting segment then retires into its thread's pool.

use crate::bomb::explode_to_result;
use crate::error::fatal;
use crate::frame::{FrameCx, FrameResult};
use crate::sched::SchedThread;
use crate::sched::schedule::tasklet_end;
use crate::unwind;
use std::sync::Arc;

pub(crate) fn run(th: &Arc<SchedThread>) {
    let seg = crate::sched::current_segment()
        .unwrap_or_else(|| fatal("dispatching without a bound stack segment"));

    loop {
        // Whatever destruction the previous switch deferred is safe now.
        th.clear_del_post_switch();

        let Some(frame) = th.claim_next_frame() else {
            // Control has moved to another stack; nothing to evaluate here.
            break;
        };

        let (input, task) = {
            let mut inner = th.inner.lock();
            inner.current_frame = Some(frame.clone());
            (inner.pending.take(), inner.ready.front().cloned())
        };
        let Some(task) = task else {
            fatal("staged frame without a current tasklet");
        };
        // No staged resume value: deliver the tasklet's tempval, exploding
        // any bomb that was planted for it.
        let input = match input {
            Some(input) => input,
            None => explode_to_result(task.claim_tempval()),
        };

        let cx = FrameCx { th };
        let result = frame.execute(&cx, input);

        if seg.take_detached() {
            // A bridge moved control off this segment mid-frame.
            break;
        }

        match result {
            FrameResult::Unwind => {
                // A switch was staged; the next claim picks it up.
                unwind::assert_clear();
            }
            FrameResult::Return(v) => match frame.back() {
                Some(back) => th.stage_frame(back, Ok(v)),
                None => tasklet_end(th, &task, Ok(v)),
            },
            FrameResult::Raise(e) => match frame.back() {
                Some(back) => th.stage_frame(back, Err(e)),
                None => tasklet_end(th, &task, Err(e)),
            },
        }
    }

    tracing::trace!(thread = th.id(), segment = seg.id(), "dispatch loop retired");
}
