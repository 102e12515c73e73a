//! Activated-message mailbox
//!
//! Fixed-capacity slot array handing inbound messages from the engine's
//! receive cycle to the dispatcher. A message lands in the first free slot;
//! the dispatcher takes the whole batch in slot order under one lock.

use bytes::Bytes;
use parking_lot::Mutex;

use crate::protocol::QoS;

/// Default number of slots
pub const DEFAULT_MAILBOX_CAPACITY: usize = 10;

/// An inbound message awaiting dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivatedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl ActivatedMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }
}

#[derive(Debug)]
pub struct Mailbox {
    slots: Mutex<Vec<Option<ActivatedMessage>>>,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX_CAPACITY)
    }
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new(vec![None; capacity]),
        }
    }

    /// Place a message in the first free slot
    ///
    /// Hands the message back when every slot is occupied.
    pub fn deliver(&self, message: ActivatedMessage) -> Result<(), ActivatedMessage> {
        let mut slots = self.slots.lock();
        match slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(message);
                Ok(())
            }
            None => Err(message),
        }
    }

    /// Take every pending message in slot order, leaving all slots free
    pub fn drain(&self) -> Vec<ActivatedMessage> {
        let mut slots = self.slots.lock();
        slots.iter_mut().filter_map(Option::take).collect()
    }

    pub fn is_full(&self) -> bool {
        self.slots.lock().iter().all(Option::is_some)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }
}
