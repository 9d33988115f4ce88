//! Bounded I/O wait queue.
//!
//! Deterministic FIFO of unit indices blocked on I/O, with an explicit
//! capacity and no duplicate membership.

use std::collections::VecDeque;
use std::fmt;

/// Queue error types.
///
/// Both indicate a scheduler logic defect, never an external condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    Full { index: usize, capacity: usize },
    Duplicate { index: usize },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full { index, capacity } => {
                write!(f, "I/O queue full (capacity {}) enqueueing unit {}", capacity, index)
            }
            QueueError::Duplicate { index } => {
                write!(f, "unit {} is already in the I/O queue", index)
            }
        }
    }
}

/// Bounded FIFO of blocked unit indices.
#[derive(Debug, Clone)]
pub struct IoWaitQueue {
    capacity: usize,
    entries: VecDeque<usize>,
}

impl IoWaitQueue {
    /// Creates a queue with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns the configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of queued indices.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns whether `index` is queued.
    pub fn contains(&self, index: usize) -> bool {
        self.entries.contains(&index)
    }

    /// Pushes an index onto the back of the queue.
    pub fn push(&mut self, index: usize) -> Result<(), QueueError> {
        if self.contains(index) {
            return Err(QueueError::Duplicate { index });
        }
        if self.entries.len() >= self.capacity {
            return Err(QueueError::Full {
                index,
                capacity: self.capacity,
            });
        }
        self.entries.push_back(index);
        Ok(())
    }

    /// Pops the head of the queue.
    pub fn pop(&mut self) -> Option<usize> {
        self.entries.pop_front()
    }

    /// Removes `index`, keeping the relative order of the rest.
    ///
    /// Returns whether anything was removed.
    pub fn remove(&mut self, index: usize) -> bool {
        let before = self.entries.len();
        self.entries.retain(|&queued| queued != index);
        self.entries.len() != before
    }

    /// Queued indices, head first.
    pub fn to_vec(&self) -> Vec<usize> {
        self.entries.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_ordering() {
        let mut queue = IoWaitQueue::with_capacity(3);
        queue.push(2).unwrap();
        queue.push(0).unwrap();
        queue.push(1).unwrap();

        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_queue_capacity() {
        let mut queue = IoWaitQueue::with_capacity(2);
        queue.push(0).unwrap();
        queue.push(1).unwrap();
        assert_eq!(
            queue.push(2),
            Err(QueueError::Full {
                index: 2,
                capacity: 2
            })
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_queue_rejects_duplicates() {
        let mut queue = IoWaitQueue::with_capacity(3);
        queue.push(1).unwrap();
        assert_eq!(queue.push(1), Err(QueueError::Duplicate { index: 1 }));
        assert_eq!(queue.to_vec(), vec![1]);
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut queue = IoWaitQueue::with_capacity(3);
        queue.push(2).unwrap();
        queue.push(0).unwrap();
        queue.push(1).unwrap();

        assert!(queue.remove(0));
        assert_eq!(queue.to_vec(), vec![2, 1]);
        assert!(!queue.remove(0));
        assert_eq!(queue.len(), 2);
    }
}
