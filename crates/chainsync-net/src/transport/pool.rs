//! Reusable message slots.
//!
//! Decoded messages are written into an arena of slots and handed out as
//! generation-stamped handles. A handle must be released exactly once;
//! releasing twice, or touching a slot after release, trips the generation
//! check instead of silently corrupting a recycled message.

use crate::error::{NetError, Result};
use crate::transport::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHandle {
    index: usize,
    generation: u32,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    in_use: bool,
    message: Message,
}

#[derive(Debug, Default)]
pub struct MessagePool {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl MessagePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut pool = Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
        };
        for _ in 0..capacity {
            pool.slots.push(Slot::default());
        }
        pool.free.extend((0..capacity).rev());
        pool
    }

    /// Take a slot, reusing a released one when available.
    pub fn acquire(&mut self) -> MessageHandle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.in_use = true;
        slot.message.reset();
        MessageHandle {
            index,
            generation: slot.generation,
        }
    }

    pub fn get(&self, handle: MessageHandle) -> Result<&Message> {
        let slot = self.checked_slot(handle)?;
        Ok(&slot.message)
    }

    pub fn get_mut(&mut self, handle: MessageHandle) -> Result<&mut Message> {
        self.checked_slot_index(handle)?;
        Ok(&mut self.slots[handle.index].message)
    }

    /// Return a message to the pool. Exactly once per acquire.
    pub fn release(&mut self, handle: MessageHandle) -> Result<()> {
        self.checked_slot_index(handle)?;
        let slot = &mut self.slots[handle.index];
        slot.in_use = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(())
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn checked_slot(&self, handle: MessageHandle) -> Result<&Slot> {
        self.checked_slot_index(handle)?;
        Ok(&self.slots[handle.index])
    }

    fn checked_slot_index(&self, handle: MessageHandle) -> Result<()> {
        let slot = self
            .slots
            .get(handle.index)
            .ok_or_else(|| NetError::PoolMisuse(format!("handle index {}", handle.index)))?;
        if !slot.in_use || slot.generation != handle.generation {
            debug_assert!(
                false,
                "stale message handle: slot {} gen {} vs handle gen {}",
                handle.index, slot.generation, handle.generation
            );
            return Err(NetError::PoolMisuse(format!(
                "stale handle for slot {}",
                handle.index
            )));
        }
        Ok(())
    }
}
