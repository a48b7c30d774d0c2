//! Event pool slot bookkeeping
//!
//! Not synchronized: the allocator is driven through `&mut self` from the thread that owns the
//! pool. Sharing one across threads needs its own locking design first.

use crate::handle::EventHandle;
use crate::{Error, Result};
use std::collections::HashMap;

/// Maps live events to pool indices and tracks which indices are free.
#[derive(Debug)]
pub struct EventIndexAllocator {
    available: Vec<bool>,
    live: HashMap<EventHandle, u32>,
}

impl EventIndexAllocator {
    pub fn new(capacity: u32) -> Self {
        Self {
            available: vec![true; capacity as usize],
            live: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.available.len() as u32
    }

    /// Number of indices currently bound to live events.
    pub fn live(&self) -> usize {
        self.live.len()
    }

    /// First free index, or `None` when every slot is taken.
    ///
    /// The index stays free until [`bind`](Self::bind) records the event created on it.
    pub fn acquire_index(&self) -> Option<u32> {
        self.available.iter().position(|&free| free).map(|i| i as u32)
    }

    /// Record that `event` now occupies `index`.
    pub fn bind(&mut self, event: EventHandle, index: u32) -> Result<()> {
        if let Some(held) = self.live.get(&event) {
            return Err(Error::Protocol(format!("{} is already bound to index {}", event, held)));
        }
        match self.available.get_mut(index as usize) {
            Some(free) if *free => *free = false,
            _ => {
                return Err(Error::Protocol(format!(
                    "event index {} is not free in a pool of {}",
                    index,
                    self.capacity()
                )))
            }
        }
        self.live.insert(event, index);
        Ok(())
    }

    /// Free the index held by `event`. Unknown events are an error, so an index is returned
    /// to the pool exactly once.
    pub fn release_index(&mut self, event: EventHandle) -> Result<u32> {
        let index = self
            .live
            .remove(&event)
            .ok_or_else(|| Error::UnknownEvent(event.raw().unwrap_or(0)))?;
        self.available[index as usize] = true;
        Ok(index)
    }

    /// Index held by a live event.
    pub fn index_of(&self, event: EventHandle) -> Option<u32> {
        self.live.get(&event).copied()
    }

    /// Live events, in no particular order.
    pub fn events(&self) -> impl Iterator<Item = EventHandle> + '_ {
        self.live.keys().copied()
    }
}
