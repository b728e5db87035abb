//! Bounded bookkeeping kept by the brokers.
//!
//! - [`AsyncSendQueue`]: control messages held back until the bootstrap
//!   channel exists
//! - [`RecentPipes`]: pipe ids remembered for late replies, oldest forgotten first

use std::collections::{HashMap, VecDeque};

use crate::error::{BrokerError, Result};
use crate::messages::BrokerMessage;
use crate::types::PipeId;

/// Default bound on messages queued before bootstrap.
pub const DEFAULT_MAX_QUEUED_MESSAGES: usize = 1024;

/// Default bound on remembered stale pipe ids.
pub const DEFAULT_MAX_STALE_PIPES: usize = 1024;

/// Strict FIFO of control messages written before the parent channel exists.
///
/// Drained exactly once, in order, when the channel arrives. Nothing is ever
/// reordered or elided.
#[derive(Debug)]
pub struct AsyncSendQueue {
    messages: VecDeque<BrokerMessage>,
    limit: usize,
}

impl AsyncSendQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            limit,
        }
    }

    pub fn push(&mut self, message: BrokerMessage) -> Result<()> {
        if self.messages.len() >= self.limit {
            return Err(BrokerError::QueueOverflow(self.messages.len()));
        }
        self.messages.push_back(message);
        Ok(())
    }

    /// Take every queued message, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = BrokerMessage> + '_ {
        self.messages.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }
}

impl Default for AsyncSendQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUED_MESSAGES)
    }
}

/// Insertion-ordered pipe id table that evicts its oldest entry when full.
#[derive(Debug)]
pub struct RecentPipes<V> {
    entries: HashMap<PipeId, V>,
    order: VecDeque<PipeId>,
    limit: usize,
}

impl<V> RecentPipes<V> {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            limit,
        }
    }

    /// Remember `pipe_id`. Returns the id evicted to make room, if any.
    pub fn insert(&mut self, pipe_id: PipeId, value: V) -> Option<PipeId> {
        if self.entries.insert(pipe_id, value).is_some() {
            self.order.retain(|id| *id != pipe_id);
        }
        self.order.push_back(pipe_id);
        if self.order.len() <= self.limit {
            return None;
        }
        let evicted = self.order.pop_front()?;
        self.entries.remove(&evicted);
        Some(evicted)
    }

    pub fn remove(&mut self, pipe_id: &PipeId) -> Option<V> {
        let value = self.entries.remove(pipe_id)?;
        self.order.retain(|id| id != pipe_id);
        Some(value)
    }

    pub fn contains(&self, pipe_id: &PipeId) -> bool {
        self.entries.contains_key(pipe_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
