//! Channel state
//!
//! A channel couples one sender with one receiver at a time. Both parked
//! queues live behind a single lock; at most one of the two is non-empty
//! at any instant. The rendezvous logic (waking the peer, depositing the
//! value on its stack) lives in the runtime crate next to the scheduler.

use crate::object::{Obj, Payload};
use crate::types;
use crate::value::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A fiber parked waiting for a receiver, with the value it is sending.
#[derive(Debug)]
pub struct ParkedSender {
    pub fiber: Arc<Obj>,
    pub value: Value,
}

#[derive(Debug, Default)]
pub struct ChannelQueues {
    pub sendq: VecDeque<ParkedSender>,
    pub recvq: VecDeque<Arc<Obj>>,
}

#[derive(Debug)]
pub struct ChannelState {
    /// capacity requested at construction; the rendezvous contract does
    /// not buffer, but the figure is kept for introspection
    pub capacity: i64,
    pub queues: Mutex<ChannelQueues>,
}

impl ChannelState {
    pub fn new(capacity: i64) -> ChannelState {
        ChannelState {
            capacity,
            queues: Mutex::new(ChannelQueues::default()),
        }
    }
}

/// Allocate a channel object.
pub fn new_channel(capacity: i64) -> Value {
    Value::obj(Obj::new(
        types::builtins().channel_t.clone(),
        Payload::Channel(ChannelState::new(capacity)),
    ))
}
