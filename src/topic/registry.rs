//! Subscription registry
//!
//! Ordered mapping from topic filter to handler. Insertion order is kept so
//! that handlers for one concrete topic fire in registration order.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use super::matches;
use crate::client::MessageHandler;
use crate::protocol::QoS;

/// A registered subscription
#[derive(Clone)]
pub struct Subscription {
    /// Topic filter, may contain wildcards
    pub filter: String,
    /// Handler invoked for every matching message
    pub handler: Arc<dyn MessageHandler>,
    /// Requested QoS
    pub qos: QoS,
    /// Whether the broker currently holds this subscription
    pub engine_active: bool,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("engine_active", &self.engine_active)
            .finish_non_exhaustive()
    }
}

/// Handlers matching one topic; most topics match only a few filters
pub type HandlerSet = SmallVec<[Arc<dyn MessageHandler>; 4]>;

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `filter`
    ///
    /// An existing filter keeps its position; its handler and qos are replaced.
    pub fn add(&mut self, filter: &str, handler: Arc<dyn MessageHandler>, qos: QoS) {
        if let Some(entry) = self.entries.iter_mut().find(|s| s.filter == filter) {
            entry.handler = handler;
            entry.qos = qos;
            entry.engine_active = true;
            return;
        }

        self.entries.push(Subscription {
            filter: filter.to_string(),
            handler,
            qos,
            engine_active: true,
        });
    }

    /// Register a handler ahead of the broker round trip
    ///
    /// The entry dispatches immediately but stays engine-inactive until
    /// [`set_active`](Self::set_active). Returns the entry it replaced, for
    /// [`restore`](Self::restore) if the broker refuses.
    pub fn stage(
        &mut self,
        filter: &str,
        handler: Arc<dyn MessageHandler>,
        qos: QoS,
    ) -> Option<Subscription> {
        let staged = Subscription {
            filter: filter.to_string(),
            handler,
            qos,
            engine_active: false,
        };
        match self.entries.iter_mut().find(|s| s.filter == filter) {
            Some(entry) => Some(std::mem::replace(entry, staged)),
            None => {
                self.entries.push(staged);
                None
            }
        }
    }

    /// Undo [`stage`](Self::stage): put back `previous`, or drop the filter
    pub fn restore(&mut self, filter: &str, previous: Option<Subscription>) {
        match previous {
            Some(previous) => {
                if let Some(entry) = self.entries.iter_mut().find(|s| s.filter == filter) {
                    *entry = previous;
                }
            }
            None => {
                self.remove(filter);
            }
        }
    }

    /// Remove the subscription for `filter`, returning it if present
    pub fn remove(&mut self, filter: &str) -> Option<Subscription> {
        let idx = self.entries.iter().position(|s| s.filter == filter)?;
        Some(self.entries.remove(idx))
    }

    pub fn get(&self, filter: &str) -> Option<&Subscription> {
        self.entries.iter().find(|s| s.filter == filter)
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.get(filter).is_some()
    }

    /// All handlers whose filter matches `topic`, in registration order
    pub fn lookup_all(&self, topic: &str) -> HandlerSet {
        self.lookup_with(topic, matches)
    }

    /// Like [`lookup_all`](Self::lookup_all) with a caller-supplied matcher
    /// taking `(topic, filter)`
    pub fn lookup_with<F>(&self, topic: &str, matcher: F) -> HandlerSet
    where
        F: Fn(&str, &str) -> bool,
    {
        self.entries
            .iter()
            .filter(|s| matcher(topic, &s.filter))
            .map(|s| s.handler.clone())
            .collect()
    }

    /// Whether subscribing `filter` at `qos` requires a broker round trip
    pub fn needs_engine_subscribe(&self, filter: &str, qos: QoS) -> bool {
        match self.get(filter) {
            Some(entry) => !entry.engine_active || entry.qos != qos,
            None => true,
        }
    }

    /// Forget broker-side state, keeping the local handlers
    pub fn mark_all_inactive(&mut self) {
        for entry in &mut self.entries {
            entry.engine_active = false;
        }
    }

    pub fn set_active(&mut self, filter: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|s| s.filter == filter) {
            entry.engine_active = true;
        }
    }

    /// Filters not currently held by the broker, with their qos
    pub fn inactive(&self) -> Vec<(String, QoS)> {
        self.entries
            .iter()
            .filter(|s| !s.engine_active)
            .map(|s| (s.filter.clone(), s.qos))
            .collect()
    }

    pub fn filters(&self) -> Vec<String> {
        self.entries.iter().map(|s| s.filter.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
