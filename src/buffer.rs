//! Bounded, thread-safe block buffer (spec §3, §4.3, §8).
//!
//! Design note (spec §9): the Python original ties a buffer entry, its
//! completion event, and back-references together in a cyclic object
//! graph. Here the buffer is an arena of value records (`slots`) plus a
//! separate completion `Condvar`; entries are referred to by `BlockDefn`
//! key, never by cyclic reference.

use crate::assoc::BlockAssociations;
use crate::block::BlockDefn;
use crate::error::RiosError;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct Slot {
    value: BlockAssociations,
}

struct Inner {
    slots: std::collections::BTreeMap<BlockDefn, Slot>,
    /// FIFO of blocks that became complete, for `pop_next_block`'s
    /// "any completed block" semantics.
    completed_order: VecDeque<BlockDefn>,
    capacity: usize,
}

/// A bounded map from [`BlockDefn`] to a (partial or complete)
/// [`BlockAssociations`] value, with completion notification and two pop
/// disciplines. Capacity is `2 * num_workers` (spec §3). One buffer per
/// direction (input/output) per run; producers relinquish ownership on
/// insert, consumers take ownership on pop.
pub struct BlockBuffer {
    inner: Mutex<Inner>,
    not_full: Condvar,
    completed: Condvar,
}

impl BlockBuffer {
    pub fn new(num_workers: usize) -> Self {
        let capacity = (2 * num_workers.max(1)).max(2);
        Self {
            inner: Mutex::new(Inner {
                slots: std::collections::BTreeMap::new(),
                completed_order: VecDeque::new(),
                capacity,
            }),
            not_full: Condvar::new(),
            completed: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve a slot for `block` if the buffer has capacity, pre-allocated
    /// with `empty`'s shape. Blocks until capacity is available or
    /// `timeout` elapses.
    fn reserve_slot(&self, block: BlockDefn, empty: BlockAssociations, timeout: Duration) -> Result<(), RiosError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.slots.len() >= inner.capacity && !inner.slots.contains_key(&block) {
            let now = Instant::now();
            if now >= deadline {
                return Err(RiosError::Timeout {
                    what: "block buffer insert".into(),
                    seconds: timeout.as_secs_f64(),
                    config_key: "bufferInsertTimeout".into(),
                });
            }
            let (guard, result) = self.not_full.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
            if result.timed_out() && inner.slots.len() >= inner.capacity && !inner.slots.contains_key(&block) {
                return Err(RiosError::Timeout {
                    what: "block buffer insert".into(),
                    seconds: timeout.as_secs_f64(),
                    config_key: "bufferInsertTimeout".into(),
                });
            }
        }
        inner.slots.entry(block).or_insert_with(|| Slot { value: empty });
        Ok(())
    }

    /// Add one leaf to a block's assembly, creating the slot on first use.
    /// Decrements the slot's missing-count; when it reaches zero the block
    /// moves onto the completed queue and wakes `pop_next_block` waiters.
    pub fn add_block_data(
        &self,
        block: BlockDefn,
        key: crate::assoc::SlotKey,
        array: crate::assoc::BlockArray,
        empty_shape: &BlockAssociations,
        timeout: Duration,
    ) -> Result<(), RiosError> {
        self.reserve_slot(block, empty_shape.clone(), timeout)?;
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.slots.get_mut(&block).expect("slot just reserved");
        slot.value.fill(key, array);
        if slot.value.is_complete() {
            inner.completed_order.push_back(block);
            drop(inner);
            self.completed.notify_all();
        }
        Ok(())
    }

    /// Insert an already-complete block value, overwriting any partial
    /// assembly for that key. Used by compute workers publishing outputs.
    pub fn insert_complete_block(
        &self,
        block: BlockDefn,
        value: BlockAssociations,
        timeout: Duration,
    ) -> Result<(), RiosError> {
        assert!(value.is_complete(), "insert_complete_block requires a fully populated value");
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.slots.len() >= inner.capacity && !inner.slots.contains_key(&block) {
            let now = Instant::now();
            if now >= deadline {
                return Err(RiosError::Timeout {
                    what: "block buffer insert".into(),
                    seconds: timeout.as_secs_f64(),
                    config_key: "bufferInsertTimeout".into(),
                });
            }
            let (guard, _) = self.not_full.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
        inner.slots.insert(block, Slot { value });
        inner.completed_order.push_back(block);
        drop(inner);
        self.completed.notify_all();
        Ok(())
    }

    /// Wait for `block` to complete and remove it, returning ownership of
    /// its value to the caller.
    pub fn pop_complete_block(&self, block: BlockDefn, timeout: Duration) -> Result<BlockAssociations, RiosError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            let ready = inner
                .slots
                .get(&block)
                .map(|s| s.value.is_complete())
                .unwrap_or(false);
            if ready {
                let slot = inner.slots.remove(&block).unwrap();
                inner.completed_order.retain(|b| *b != block);
                drop(inner);
                self.not_full.notify_all();
                return Ok(slot.value);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RiosError::Timeout {
                    what: format!("block buffer pop of {block:?}"),
                    seconds: timeout.as_secs_f64(),
                    config_key: "bufferPopTimeout".into(),
                });
            }
            let (guard, _) = self.completed.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }

    /// Wait for *any* completed block and remove it, returning the
    /// [`BlockDefn`] that was popped along with its value. Used by
    /// subprocess/batch compute managers where completion order is
    /// indeterminate (spec §4.5).
    pub fn pop_next_block(&self, timeout: Duration) -> Result<(BlockDefn, BlockAssociations), RiosError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(block) = inner.completed_order.pop_front() {
                let slot = inner.slots.remove(&block).expect("completed block must have a slot");
                drop(inner);
                self.not_full.notify_all();
                return Ok((block, slot.value));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RiosError::Timeout {
                    what: "block buffer pop_next_block".into(),
                    seconds: timeout.as_secs_f64(),
                    config_key: "bufferPopTimeout".into(),
                });
            }
            let (guard, _) = self.completed.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assoc::{BlockArray, FilenameAssociations, SlotKey};
    use std::sync::Arc;
    use std::time::Duration;

    fn spec_one_input() -> FilenameAssociations {
        let mut spec = FilenameAssociations::new();
        spec.set_single("in", std::path::PathBuf::from("a.tif"));
        spec
    }

    #[test]
    fn capacity_never_exceeded() {
        let buf = BlockBuffer::new(2); // capacity 4
        assert_eq!(buf.capacity(), 4);
        let spec = spec_one_input();
        let empty = BlockAssociations::from_spec(&spec);
        for i in 0..4 {
            buf.add_block_data(
                BlockDefn::new(i, 0, 1, 1),
                SlotKey::single("in"),
                BlockArray::zeros(1, 1, 1),
                &empty,
                Duration::from_millis(100),
            )
            .unwrap();
        }
        assert_eq!(buf.len(), 4);
        let err = buf.add_block_data(
            BlockDefn::new(5, 0, 1, 1),
            SlotKey::single("in"),
            BlockArray::zeros(1, 1, 1),
            &empty,
            Duration::from_millis(50),
        );
        assert!(err.is_err());
    }

    #[test]
    fn pop_complete_block_waits_for_completion() {
        let buf = Arc::new(BlockBuffer::new(1));
        let spec = {
            let mut s = FilenameAssociations::new();
            s.set_single("a", std::path::PathBuf::from("a.tif"));
            s.set_single("b", std::path::PathBuf::from("b.tif"));
            s
        };
        let empty = BlockAssociations::from_spec(&spec);
        let block = BlockDefn::new(0, 0, 1, 1);

        buf.add_block_data(block, SlotKey::single("a"), BlockArray::zeros(1, 1, 1), &empty, Duration::from_millis(100))
            .unwrap();

        let buf2 = buf.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            buf2.add_block_data(block, SlotKey::single("b"), BlockArray::zeros(1, 1, 1), &empty, Duration::from_millis(100))
                .unwrap();
        });

        let result = buf.pop_complete_block(block, Duration::from_secs(1)).unwrap();
        assert!(result.is_complete());
        handle.join().unwrap();
    }

    #[test]
    fn pop_next_block_returns_in_completion_order() {
        let buf = BlockBuffer::new(4);
        let spec = spec_one_input();
        let values: Vec<_> = (0..3)
            .map(|i| {
                let mut v = BlockAssociations::from_spec(&spec);
                v.fill(SlotKey::single("in"), BlockArray::zeros(1, 1, 1));
                (BlockDefn::new(i, 0, 1, 1), v)
            })
            .collect();
        // insert in reverse order; pop should match insertion (completion) order
        for (b, v) in values.iter().rev() {
            buf.insert_complete_block(*b, v.clone(), Duration::from_millis(100)).unwrap();
        }
        let (first, _) = buf.pop_next_block(Duration::from_millis(100)).unwrap();
        assert_eq!(first, BlockDefn::new(2, 0, 1, 1));
    }
}
