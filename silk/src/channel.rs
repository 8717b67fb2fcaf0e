// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronous rendezvous channels.
//!
//! A channel is a wait queue of blocked tasklets plus a balance counter:
//! negative when receivers wait, positive when senders wait, zero when the
//! queue is empty. A send meeting a waiting receiver (or vice versa) hands
//! the value over directly (there is no buffer) and the channel's
//! *preference* decides which of the two parties continues running:
//!
//! * `-1` (default): the receiver is preferred and runs next,
//! * `+1`: the sender is preferred,
//! * `0`: whoever performed the operation continues.
//!
//! With `schedule_all` set, every operation yields to the next ready
//! tasklet regardless of preference. An unbalanced operation parks the
//! caller on the wait queue and hands control to the scheduler; exceptions
//! travel through the same rendezvous as [`Bomb`] values.

use crate::bomb::Bomb;
use crate::error::Exception;
use crate::sched::{self, SchedThread};
use crate::tasklet::{Container, TaskletRef};
use crate::unwind::{self, Soft};
use crate::value::Value;
use core::fmt;
use std::collections::VecDeque;
use std::sync::Arc;

struct ChanState {
    queue: VecDeque<TaskletRef>,
    balance: i64,
    preference: i8,
    schedule_all: bool,
    closing: bool,
}

pub struct Channel {
    state: spin::Mutex<ChanState>,
}

impl Channel {
    pub fn new() -> Arc<Channel> {
        Arc::new(Channel {
            state: spin::Mutex::new(ChanState {
                queue: VecDeque::new(),
                balance: 0,
                // receivers are preferred by default
                preference: -1,
                schedule_all: false,
                closing: false,
            }),
        })
    }

    // --- attributes -----------------------------------------------------

    /// Negative: receivers waiting; positive: senders waiting.
    pub fn balance(&self) -> i64 {
        self.state.lock().balance
    }

    pub fn preference(&self) -> i8 {
        self.state.lock().preference
    }

    /// Clamped to {−1, 0, +1}.
    pub fn set_preference(&self, pref: i8) {
        self.state.lock().preference = pref.clamp(-1, 1);
    }

    pub fn schedule_all(&self) -> bool {
        self.state.lock().schedule_all
    }

    pub fn set_schedule_all(&self, flag: bool) {
        self.state.lock().schedule_all = flag;
    }

    pub fn closing(&self) -> bool {
        self.state.lock().closing
    }

    pub fn closed(&self) -> bool {
        let state = self.state.lock();
        state.closing && state.balance == 0
    }

    /// Prevent any further blocking on the channel. Pending parties may
    /// still drain; once the balance reaches zero the channel is closed.
    pub fn close(&self) {
        self.state.lock().closing = true;
    }

    /// Reopen a closing channel.
    pub fn open(&self) {
        self.state.lock().closing = false;
    }

    /// The blocked tasklets, head first.
    pub fn queue(&self) -> Vec<TaskletRef> {
        self.state.lock().queue.iter().cloned().collect()
    }

    // --- operations -----------------------------------------------------

    /// Send `value`, blocking until a receiver takes it.
    pub fn send(self: &Arc<Self>, value: Value) -> Result<(), Exception> {
        match self.action(value, 1, false)? {
            Soft::Done(_) => Ok(()),
            Soft::Unwind => unreachable!("hard send cannot unwind"),
        }
    }

    /// Soft-capable send for use inside frames: may answer
    /// [`Soft::Unwind`], which the frame must propagate.
    pub fn send_soft(self: &Arc<Self>, value: Value) -> Result<Soft<()>, Exception> {
        unwind::offer();
        let r = self.action(value, 1, true);
        unwind::assert_clear();
        r.map(|soft| soft.map(|_| ()))
    }

    /// Receive, blocking until a sender provides a value.
    pub fn receive(self: &Arc<Self>) -> Result<Value, Exception> {
        match self.action(Value::none(), -1, false)? {
            Soft::Done(v) => Ok(v),
            Soft::Unwind => unreachable!("hard receive cannot unwind"),
        }
    }

    /// Soft-capable receive. On [`Soft::Unwind`] the received value arrives
    /// as the frame's next input.
    pub fn receive_soft(self: &Arc<Self>) -> Result<Soft<Value>, Exception> {
        unwind::offer();
        let r = self.action(Value::none(), -1, true);
        unwind::assert_clear();
        r
    }

    /// Send an exception: the receiver's `receive` raises it.
    pub fn send_exception(self: &Arc<Self>, exc: Exception) -> Result<(), Exception> {
        match self.action(Bomb::wrap(exc), 1, false)? {
            Soft::Done(_) => Ok(()),
            Soft::Unwind => unreachable!("hard send cannot unwind"),
        }
    }

    /// Alias of [`send_exception`][Self::send_exception] taking a fully
    /// formed exception (value and traceback attached).
    pub fn send_throw(self: &Arc<Self>, exc: Exception) -> Result<(), Exception> {
        self.send_exception(exc)
    }

    /// One balanced or parking rendezvous step. `dir` is +1 for send, −1
    /// for receive.
    fn action(self: &Arc<Self>, arg: Value, dir: i8, soft: bool) -> Result<Soft<Value>, Exception> {
        let may_unwind = if soft { unwind::take_offer() } else { false };
        let th = sched::current_thread()?;
        th.ensure_main()?;
        let caller = th
            .current()
            .ok_or_else(|| Exception::runtime_error("thread has no current tasklet"))?;

        let (cando, closing) = {
            let state = self.state.lock();
            let cando = if dir > 0 { state.balance < 0 } else { state.balance > 0 };
            (cando, state.closing)
        };

        sched::call_channel_callback(&th, self, &caller, dir > 0, !cando);

        if cando {
            self.action_rendezvous(&th, caller, arg, dir, may_unwind)
        } else {
            if closing {
                return Err(Exception::channel_closed());
            }
            if caller.block_trap() {
                return Err(Exception::runtime_error(
                    "this tasklet does not like to be blocked.",
                ));
            }
            self.action_park(&th, caller, arg, dir, may_unwind)
        }
    }

    /// The balanced case: pop the counterparty, exchange the value, and let
    /// the preference pick who continues.
    fn action_rendezvous(
        self: &Arc<Self>,
        th: &Arc<SchedThread>,
        caller: TaskletRef,
        arg: Value,
        dir: i8,
        may_unwind: bool,
    ) -> Result<Soft<Value>, Exception> {
        let (target, preference, schedule_all) = {
            let mut state = self.state.lock();
            let Some(target) = state.queue.pop_front() else {
                // raced away by a foreign thread; retry as a parking op
                drop(state);
                return self.action_park(th, caller, arg, dir, may_unwind);
            };
            state.balance += i64::from(dir);
            (target, state.preference, state.schedule_all)
        };
        {
            let mut ti = target.inner.lock();
            debug_assert_eq!(ti.blocked, -dir, "wait queue side mismatch");
            ti.blocked = 0;
            ti.container = Container::None;
        }
        tracing::trace!(
            channel = ?Arc::as_ptr(self),
            target = target.id(),
            dir,
            "rendezvous"
        );

        // Hand the value over: the receiver's mailbox ends up holding it.
        if dir > 0 {
            target.set_tempval(arg);
        } else {
            let v = target.claim_tempval();
            caller.set_tempval(v);
        }

        let target_th = target.bound_thread();
        let next = match target_th {
            Some(ref tth) if tth.id() != th.id() => {
                // Counterparty on another thread: plant it in that thread's
                // ready queue and continue locally.
                if tth.is_idle() {
                    tth.ready_push_front(target.clone());
                } else if tth.current().is_some() {
                    tth.ready_insert_after_current(target.clone());
                } else {
                    tth.ready_push_back(target.clone());
                }
                tth.unblock();
                caller.clone()
            }
            _ => {
                if schedule_all {
                    // both parties queue up; the next ready tasklet runs
                    th.ready_push_back(target.clone());
                    th.next_after_current().unwrap_or_else(|| caller.clone())
                } else if preference == -dir {
                    // counterparty preferred: splice it in right behind us
                    // and switch; we end up at the ready tail
                    th.ready_insert_after_current(target.clone());
                    target.clone()
                } else {
                    // caller preferred: counterparty to the tail, no switch
                    th.ready_push_back(target.clone());
                    caller.clone()
                }
            }
        };

        sched::schedule_task(th, caller, Some(next), may_unwind)
    }

    /// The unbalanced case: park the caller on the wait queue and yield.
    fn action_park(
        self: &Arc<Self>,
        th: &Arc<SchedThread>,
        caller: TaskletRef,
        arg: Value,
        dir: i8,
        may_unwind: bool,
    ) -> Result<Soft<Value>, Exception> {
        if dir > 0 {
            caller.set_tempval(arg);
        }
        // leave the ready queue first; the chain tag below must survive
        let popped = th.ready_pop_current();
        debug_assert!(popped.is_some_and(|t| t.id() == caller.id()));
        {
            let mut state = self.state.lock();
            state.queue.push_back(caller.clone());
            state.balance += i64::from(dir);
        }
        {
            let mut ci = caller.inner.lock();
            ci.blocked = dir;
            ci.container = Container::Channel(Arc::downgrade(self));
        }
        let next = th.current();

        tracing::trace!(
            channel = ?Arc::as_ptr(self),
            caller = caller.id(),
            dir,
            "parking on channel"
        );

        let result = sched::schedule_task(th, caller.clone(), next, may_unwind);
        if result.is_err() {
            // The switch never happened; undo the parking. The deadlock
            // path may already have pulled the caller back into the ready
            // queue, in which case there is nothing left to restore.
            self.unchain(&caller);
            if !caller.scheduled() {
                th.ready_unremove_current(caller);
            }
        }
        result
    }

    /// Unlink a blocked tasklet from the wait queue, fixing the balance.
    /// Used when a blocked tasklet is killed, thrown into, or migrated to
    /// another thread. Returns `false` if the tasklet was not queued here.
    pub(crate) fn unchain(&self, t: &TaskletRef) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = state.queue.iter().position(|q| q.id() == t.id()) else {
            return false;
        };
        state.queue.remove(pos);
        let mut ti = t.inner.lock();
        state.balance -= i64::from(ti.blocked);
        ti.blocked = 0;
        ti.container = Container::None;
        true
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Channel")
            .field("balance", &state.balance)
            .field("preference", &state.preference)
            .field("schedule_all", &state.schedule_all)
            .field("closing", &state.closing)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExcKind;
    use crate::test_util::{Log, as_int, body, init, int, run_test};
    use crate::unwind::Soft;

    #[test]
    fn ping_pong() {
        // main -> ch1 -> A -> ch2 -> B -> ch3 -> main, incrementing at each
        // hop. After N rounds every delivered value came through intact.
        run_test(|| {
            const ROUNDS: i64 = 10;
            let _rt = init();
            let (ch1, ch2, ch3) = (Channel::new(), Channel::new(), Channel::new());

            let (ich1, och2) = (Arc::clone(&ch1), Arc::clone(&ch2));
            let a = crate::spawn(
                body(move |_cx| {
                    for _ in 0..ROUNDS {
                        let v = ich1.receive()?;
                        och2.send(int(as_int(&v) + 1))?;
                    }
                    Ok(Value::none())
                }),
                Value::none(),
            )
            .unwrap();
            let (ich2, och3) = (Arc::clone(&ch2), Arc::clone(&ch3));
            let b = crate::spawn(
                body(move |_cx| {
                    for _ in 0..ROUNDS {
                        let v = ich2.receive()?;
                        och3.send(int(as_int(&v) + 1))?;
                    }
                    Ok(Value::none())
                }),
                Value::none(),
            )
            .unwrap();

            assert_eq!(crate::get_runcount(), 3); // main, A, B

            for k in 0..ROUNDS {
                ch1.send(int(k * 10)).unwrap();
                let v = ch3.receive().unwrap();
                assert_eq!(as_int(&v), k * 10 + 2);
            }

            // let the workers run off the end of their loops
            while crate::get_runcount() > 1 {
                crate::schedule(None).unwrap();
            }

            // both workers ran their full loops and are done
            assert!(!a.alive());
            assert!(!b.alive());
            assert_eq!(crate::get_runcount(), 1);
        });
    }

    #[test]
    fn deadlock_raises_in_the_blocked_tasklet() {
        // A receive that nobody can ever answer must not hang: the runtime
        // plants a deadlock bomb and the receive raises it.
        run_test(|| {
            let _rt = init();
            let ch = Channel::new();
            let err = ch.receive().unwrap_err();
            assert_eq!(err.kind(), ExcKind::RuntimeError);
            assert!(err.message().starts_with("Deadlock"), "got: {err}");
            // the failed rendezvous left no residue
            assert_eq!(ch.balance(), 0);
            assert_eq!(crate::get_runcount(), 1);
        });
    }

    #[test]
    fn preference_decides_who_continues() {
        run_test(|| {
            let _rt = init();
            let log = Log::new();

            let block_receiver = |ch: &Arc<Channel>, tag: &'static str| {
                let ich = Arc::clone(ch);
                let ilog = log.clone();
                let r = crate::spawn(
                    body(move |_cx| {
                        let v = ich.receive()?;
                        ilog.push(format!("{tag}-got-{}", as_int(&v)));
                        Ok(Value::none())
                    }),
                    Value::none(),
                )
                .unwrap();
                // let it run until it parks on the channel
                r.run().unwrap();
                assert_eq!(r.blocked(), -1);
                r
            };

            // Sender preferred: after the hand-over the sender continues and
            // the receiver waits its turn at the ready tail.
            let ch = Channel::new();
            ch.set_preference(1);
            block_receiver(&ch, "r1");
            ch.send(int(1)).unwrap();
            log.push("sent-1");
            crate::schedule(None).unwrap(); // now the receiver gets its turn
            assert_eq!(log.events(), vec!["sent-1", "r1-got-1"]);

            // Receiver preferred (the default): the receiver runs before the
            // send returns.
            let ch = Channel::new();
            ch.set_preference(-1);
            block_receiver(&ch, "r2");
            ch.send(int(2)).unwrap();
            log.push("sent-2");
            assert_eq!(log.events()[2..], ["r2-got-2".to_string(), "sent-2".to_string()]);
        });
    }

    #[test]
    fn schedule_all_yields_after_every_operation() {
        run_test(|| {
            let _rt = init();
            let log = Log::new();
            let ch = Channel::new();
            ch.set_schedule_all(true);

            let (ich, ilog) = (Arc::clone(&ch), log.clone());
            let receiver = crate::spawn(
                body(move |_cx| {
                    let v = ich.receive()?;
                    ilog.push(format!("recv-{}", as_int(&v)));
                    Ok(Value::none())
                }),
                Value::none(),
            )
            .unwrap();
            receiver.run().unwrap();

            let wlog = log.clone();
            crate::spawn(
                body(move |_cx| {
                    wlog.push("bystander");
                    Ok(Value::none())
                }),
                Value::none(),
            )
            .unwrap();

            // With schedule_all the sender yields to the next ready tasklet
            // (the bystander), and the receiver only runs after it.
            ch.send(int(7)).unwrap();
            log.push("send-returned");
            assert_eq!(
                log.events(),
                vec!["bystander", "recv-7", "send-returned"]
            );
        });
    }

    #[test]
    fn exceptions_travel_through_the_rendezvous() {
        run_test(|| {
            let _rt = init();
            let ch = Channel::new();
            let result = Log::new();

            let (ich, ilog) = (Arc::clone(&ch), result.clone());
            let r = crate::spawn(
                body(move |_cx| {
                    match ich.receive() {
                        Ok(_) => ilog.push("value"),
                        Err(e) => ilog.push(format!("raised-{}", e.kind().name())),
                    }
                    Ok(Value::none())
                }),
                Value::none(),
            )
            .unwrap();
            r.run().unwrap();

            ch.send_exception(Exception::value_error("sour")).unwrap();
            assert_eq!(result.events(), vec!["raised-ValueError"]);
            assert_eq!(ch.balance(), 0);
        });
    }

    #[test]
    fn block_trap_refuses_to_park() {
        run_test(|| {
            let (_rt, th) = init();
            let ch = Channel::new();
            let main = th.main().unwrap();
            main.set_block_trap(true);
            let err = ch.receive().unwrap_err();
            assert_eq!(err.kind(), ExcKind::RuntimeError);
            assert!(err.message().contains("does not like to be blocked"));
            main.set_block_trap(false);
            // nothing was queued by the refused operation
            assert_eq!(ch.balance(), 0);
            assert!(ch.queue().is_empty());
        });
    }

    #[test]
    fn close_drains_then_refuses() {
        run_test(|| {
            let _rt = init();
            let ch = Channel::new();

            let och = Arc::clone(&ch);
            let sender = crate::spawn(
                body(move |_cx| {
                    och.send(int(9))?;
                    Ok(Value::none())
                }),
                Value::none(),
            )
            .unwrap();
            sender.run().unwrap();
            assert_eq!(ch.balance(), 1);

            ch.close();
            assert!(ch.closing());
            assert!(!ch.closed());

            // draining the queued sender still works
            let v = ch.receive().unwrap();
            assert_eq!(as_int(&v), 9);
            assert!(ch.closed());

            assert_eq!(ch.receive().unwrap_err().kind(), ExcKind::ChannelClosed);
            assert_eq!(ch.send(int(1)).unwrap_err().kind(), ExcKind::ChannelClosed);

            ch.open();
            assert!(!ch.closing());
            assert!(!ch.closed());
        });
    }

    #[test]
    fn dying_sender_wakes_a_blocked_main() {
        // main parks on a receive; the only other tasklet ends without
        // sending. main must be woken with the dedicated RuntimeError.
        run_test(|| {
            let _rt = init();
            let ch = Channel::new();
            crate::spawn(body(move |_cx| Ok(Value::none())), Value::none()).unwrap();

            let err = ch.receive().unwrap_err();
            assert_eq!(err.kind(), ExcKind::RuntimeError);
            assert!(
                err.message().contains("receiving without a sender"),
                "got: {err}"
            );
        });
    }

    #[test]
    fn soft_rendezvous_resumes_the_frame_with_the_value() {
        // A state-machine body blocks softly; the received value arrives as
        // the frame's next input instead of a return value.
        run_test(|| {
            let _rt = init();
            let ch = Channel::new();
            let log = Log::new();

            let (ich, ilog) = (Arc::clone(&ch), log.clone());
            let state = Arc::new(spin::Mutex::new(0_u8));
            let r = crate::spawn(
                crate::test_util::raw_body(move |_cx, input| {
                    let mut st = state.lock();
                    match *st {
                        0 => {
                            *st = 1;
                            match ich.receive_soft() {
                                Ok(Soft::Done(v)) => {
                                    ilog.push(format!("inline-{}", as_int(&v)));
                                    crate::frame::FrameResult::Return(Value::none())
                                }
                                Ok(Soft::Unwind) => crate::frame::FrameResult::Unwind,
                                Err(e) => crate::frame::FrameResult::Raise(e),
                            }
                        }
                        _ => match input {
                            Ok(v) => {
                                ilog.push(format!("resumed-{}", as_int(&v)));
                                crate::frame::FrameResult::Return(Value::none())
                            }
                            Err(e) => crate::frame::FrameResult::Raise(e),
                        },
                    }
                }),
                Value::none(),
            )
            .unwrap();
            r.run().unwrap();
            assert_eq!(r.blocked(), -1);
            // the receiver never owned a native stack while waiting
            assert_eq!(r.nesting_level(), 0);
            assert!(r.restorable());

            ch.send(int(5)).unwrap();
            assert_eq!(log.events(), vec!["resumed-5"]);
            assert!(!r.alive());
        });
    }
}
