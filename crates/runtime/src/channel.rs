//! Channel rendezvous
//!
//! `send` and `recv` complete immediately when the opposite queue holds a
//! parked peer: the value (or the send's nil result) is deposited straight
//! onto the peer's value stack and the peer is handed back to its
//! scheduler. Otherwise the calling fiber parks in the channel and the VM
//! surrenders its scheduler slot without requeueing.

use cedar_core::channel::{ChannelState, ParkedSender};
use cedar_core::error::type_error;
use cedar_core::host;
use cedar_core::lambda::{CallContext, Control};
use cedar_core::object::Obj;
use cedar_core::value::Value;
use std::sync::Arc;

fn channel_of<'a>(name: &str, v: &'a Value) -> Result<&'a ChannelState, Value> {
    v.as_obj()
        .and_then(|o| o.as_channel())
        .ok_or_else(|| type_error(format!("{name} requires a channel, given {v}")))
}

/// Push a rendezvous result onto a parked fiber's value stack. The fiber
/// is not running (it parked and its scheduler dropped it), so the state
/// lock is only ever contended for the instant its parking slice returns.
fn deposit(fiber: &Arc<Obj>, value: Value) {
    let data = fiber.as_fiber().expect("parked entry wraps a fiber");
    data.state
        .lock()
        .expect("deposit: fiber state poisoned")
        .stack
        .push(value);
}

pub fn send(chan: &Value, value: Value, ctx: &mut CallContext) -> Result<Control, Value> {
    let ch = channel_of("send", chan)?;
    let mut queues = ch.queues.lock().expect("channel queues poisoned");
    if let Some(receiver) = queues.recvq.pop_front() {
        deposit(&receiver, value);
        host::host()?.wake(receiver);
        return Ok(Control::Value(Value::nil()));
    }
    match ctx.fiber {
        Some(fiber) => {
            queues.sendq.push_back(ParkedSender {
                fiber: fiber.clone(),
                value,
            });
            Ok(Control::Park)
        }
        None => Err(type_error("send would block outside a fiber")),
    }
}

pub fn recv(chan: &Value, ctx: &mut CallContext) -> Result<Control, Value> {
    let ch = channel_of("recv", chan)?;
    let mut queues = ch.queues.lock().expect("channel queues poisoned");
    if let Some(ParkedSender { fiber: sender, value }) = queues.sendq.pop_front() {
        // the sender's pending `send` call completes with nil
        deposit(&sender, Value::nil());
        host::host()?.wake(sender);
        return Ok(Control::Value(value));
    }
    match ctx.fiber {
        Some(fiber) => {
            queues.recvq.push_back(fiber.clone());
            Ok(Control::Park)
        }
        None => Err(type_error("recv would block outside a fiber")),
    }
}
