//! Bounded FIFO of slots awaiting execution.

use crate::error::{CoreError, SlotWarning};
use crate::slot::Slot;
use pacer_protocol::QueueStatus;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Default number of slots a controller can hold.
pub const DEFAULT_QUEUE_CAPACITY: usize = 500;

/// Result of decoding one command buffer into the queue.
#[derive(Debug, Default)]
pub struct EnqueueOutcome {
    /// Slots appended, in order.
    pub accepted: usize,
    /// Validation warnings with the index of the block that raised them.
    pub warnings: Vec<(usize, SlotWarning)>,
    /// Set when decoding stopped before the end of the buffer.
    pub error: Option<CoreError>,
}

impl EnqueueOutcome {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

struct QueueInner {
    slots: VecDeque<Slot>,
    executed: u64,
}

/// Shared between the link task, which appends, and a single executor,
/// which pops.
pub struct CommandQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                slots: VecDeque::with_capacity(capacity),
                executed: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Decodes the sub-blocks in `raw` and appends them.
    ///
    /// Stops at the first malformed block or when the queue is full.
    /// Blocks decoded before the failure stay queued.
    pub fn enqueue(&self, raw: &[u8]) -> EnqueueOutcome {
        let mut outcome = EnqueueOutcome::default();
        let mut inner = self.inner.lock();
        let mut offset = 0;
        let mut index = 0;

        while offset < raw.len() {
            if inner.slots.len() >= self.capacity {
                outcome.error = Some(CoreError::QueueFull {
                    capacity: self.capacity,
                });
                break;
            }

            let (slot, consumed) = match Slot::decode_block(&raw[offset..]) {
                Ok(decoded) => decoded,
                Err(CoreError::MalformedSlot(reason)) => {
                    outcome.error = Some(CoreError::MalformedBlock { index, reason });
                    break;
                }
                Err(e) => {
                    outcome.error = Some(e);
                    break;
                }
            };

            for warning in slot.validate() {
                warn!(block = index, "Slot validation warning: {}", warning);
                outcome.warnings.push((index, warning));
            }

            inner.slots.push_back(slot);
            outcome.accepted += 1;
            offset += consumed;
            index += 1;
        }

        debug!(
            accepted = outcome.accepted,
            used = inner.slots.len(),
            "Enqueued command blocks"
        );
        outcome
    }

    /// Appends an already decoded slot.
    pub fn push(&self, slot: Slot) -> Result<(), CoreError> {
        let mut inner = self.inner.lock();
        if inner.slots.len() >= self.capacity {
            return Err(CoreError::QueueFull {
                capacity: self.capacity,
            });
        }
        inner.slots.push_back(slot);
        Ok(())
    }

    /// Pops the oldest slot.
    pub fn dequeue(&self) -> Option<Slot> {
        self.inner.lock().slots.pop_front()
    }

    /// Counts one slot as fully executed.
    pub fn mark_executed(&self) {
        self.inner.lock().executed += 1;
    }

    /// Drops every pending slot and returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let discarded = inner.slots.len();
        inner.slots.clear();
        discarded
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().slots.is_empty()
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    pub fn executed(&self) -> u64 {
        self.inner.lock().executed
    }

    /// Counters as reported on the wire; `executed` wraps at 16 bits.
    pub fn status(&self) -> QueueStatus {
        let inner = self.inner.lock();
        let used = inner.slots.len();
        QueueStatus {
            available: self.capacity.saturating_sub(used).min(u16::MAX as usize) as u16,
            used: used.min(u16::MAX as usize) as u16,
            executed: inner.executed as u16,
        }
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::BasicLinearMove;
    use bytes::BytesMut;

    fn delay_block(micros: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        Slot::Delay { micros }.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_fifo_order() {
        let queue = CommandQueue::default();
        let mut raw = BytesMut::new();
        for micros in 1..=3 {
            raw.extend_from_slice(&delay_block(micros));
        }

        let outcome = queue.enqueue(&raw);
        assert!(outcome.is_complete());
        assert_eq!(outcome.accepted, 3);

        for micros in 1..=3 {
            assert_eq!(queue.dequeue(), Some(Slot::Delay { micros }));
        }
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_five_blocks_third_overruns() {
        let queue = CommandQueue::default();
        let mut raw = BytesMut::new();
        raw.extend_from_slice(&delay_block(1));
        raw.extend_from_slice(&delay_block(2));
        raw.extend_from_slice(&[0xF0, 0x02, 0x00, 0x00, 0x00, 0x03]);
        raw.extend_from_slice(&delay_block(4));
        raw.extend_from_slice(&delay_block(5));

        let outcome = queue.enqueue(&raw);
        assert_eq!(outcome.accepted, 2);
        assert_eq!(
            outcome.error,
            Some(CoreError::MalformedBlock {
                index: 2,
                reason: "length past end of buffer"
            })
        );
        assert_eq!(queue.status().used, 2);
        assert_eq!(queue.dequeue(), Some(Slot::Delay { micros: 1 }));
        assert_eq!(queue.dequeue(), Some(Slot::Delay { micros: 2 }));
    }

    #[test]
    fn test_zero_length_block() {
        let queue = CommandQueue::default();
        let mut raw = delay_block(1);
        raw.extend_from_slice(&[0x00]);

        let outcome = queue.enqueue(&raw);
        assert_eq!(outcome.accepted, 1);
        assert_eq!(
            outcome.error,
            Some(CoreError::MalformedBlock {
                index: 1,
                reason: "zero length"
            })
        );
    }

    #[test]
    fn test_capacity_501_of_500() {
        let queue = CommandQueue::new(500);
        for micros in 0..500u32 {
            let outcome = queue.enqueue(&delay_block(micros));
            assert!(outcome.is_complete());
        }
        assert_eq!(queue.status().available, 0);

        let outcome = queue.enqueue(&delay_block(500));
        assert_eq!(outcome.accepted, 0);
        assert_eq!(outcome.error, Some(CoreError::QueueFull { capacity: 500 }));

        let status = queue.status();
        assert_eq!(status.available, 0);
        assert_eq!(status.used, 500);

        for micros in 0..500u32 {
            assert_eq!(queue.dequeue(), Some(Slot::Delay { micros }));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_partial_accept_when_filling() {
        let queue = CommandQueue::new(2);
        let mut raw = BytesMut::new();
        for micros in 0..3 {
            raw.extend_from_slice(&delay_block(micros));
        }

        let outcome = queue.enqueue(&raw);
        assert_eq!(outcome.accepted, 2);
        assert!(outcome.error.as_ref().is_some_and(|e| e.is_retryable()));
    }

    #[test]
    fn test_warnings_do_not_abort() {
        let queue = CommandQueue::default();
        let mut linear = BasicLinearMove::new(0).with_axis(0, 5).unwrap();
        linear.nominal_speed = 1;
        linear.end_speed = 2;
        linear.acceleration_steps = 10;

        let mut raw = BytesMut::new();
        Slot::BasicLinearMove(linear).encode(&mut raw).unwrap();
        raw.extend_from_slice(&delay_block(7));

        let outcome = queue.enqueue(&raw);
        assert!(outcome.is_complete());
        assert_eq!(outcome.accepted, 2);
        assert_eq!(outcome.warnings.len(), 2);
        assert!(outcome.warnings.iter().all(|(index, _)| *index == 0));
    }

    #[test]
    fn test_status_counters() {
        let queue = CommandQueue::new(10);
        queue.enqueue(&delay_block(1));
        queue.enqueue(&delay_block(2));

        queue.dequeue();
        queue.mark_executed();

        let status = queue.status();
        assert_eq!(status.available, 9);
        assert_eq!(status.used, 1);
        assert_eq!(status.executed, 1);

        assert_eq!(queue.clear(), 1);
        assert_eq!(queue.status().available, 10);
        assert_eq!(queue.executed(), 1);
    }
}
