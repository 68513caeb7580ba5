//! # Thread-Safe Queue
//!
//! A double-ended queue guarded by a single mutex.
//!
//! Every operation takes the lock for its own duration only, so there is no
//! atomicity across calls: checking [`ThreadSafeQueue::is_empty`] and then
//! calling [`ThreadSafeQueue::pop_front`] can race with another thread. Use the
//! `Option` returned by the pop/peek operations instead of a separate check.
//!
//! [`ThreadSafeQueue::for_each`] holds the lock for the whole traversal. The
//! closure must not touch the same queue again or it deadlocks.
//!
//! ## Usage
//! ```rust
//! use framewire::utils::ts_queue::ThreadSafeQueue;
//!
//! let queue = ThreadSafeQueue::new();
//! queue.push_back(2);
//! queue.push_front(1);
//! assert_eq!(queue.pop_front(), Some(1));
//! assert_eq!(queue.len(), 1);
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mutex-guarded `VecDeque`
pub struct ThreadSafeQueue<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> Default for ThreadSafeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ThreadSafeQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    #[inline]
    fn guard(&self) -> MutexGuard<'_, VecDeque<T>> {
        lock_unpoisoned(&self.inner)
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    pub fn shrink_to_fit(&self) {
        self.guard().shrink_to_fit();
    }

    pub fn push_back(&self, value: T) {
        self.guard().push_back(value);
    }

    pub fn push_front(&self, value: T) {
        self.guard().push_front(value);
    }

    pub fn pop_front(&self) -> Option<T> {
        self.guard().pop_front()
    }

    pub fn pop_back(&self) -> Option<T> {
        self.guard().pop_back()
    }

    /// Insert at `index`, clamped to the current length.
    pub fn insert(&self, index: usize, value: T) {
        let mut queue = self.guard();
        let index = index.min(queue.len());
        queue.insert(index, value);
    }

    /// Remove and return the element at `index`.
    pub fn remove(&self, index: usize) -> Option<T> {
        self.guard().remove(index)
    }

    /// Keep only the elements for which `keep` returns true.
    pub fn retain<F>(&self, keep: F)
    where
        F: FnMut(&T) -> bool,
    {
        self.guard().retain(keep);
    }

    /// Remove and return the first element matching `predicate`.
    pub fn remove_first<F>(&self, mut predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut queue = self.guard();
        let index = queue.iter().position(&mut predicate)?;
        queue.remove(index)
    }

    /// Visit every element with the lock held for the whole traversal.
    pub fn for_each<F>(&self, mut func: F)
    where
        F: FnMut(&mut T),
    {
        let mut queue = self.guard();
        for item in queue.iter_mut() {
            func(item);
        }
    }

    /// Return the first value produced by `func`, lock held during the search.
    pub fn find_map<R, F>(&self, func: F) -> Option<R>
    where
        F: FnMut(&T) -> Option<R>,
    {
        self.guard().iter().find_map(func)
    }

    /// Take every element out, leaving the queue empty.
    pub fn drain_all(&self) -> Vec<T> {
        self.guard().drain(..).collect()
    }
}

impl<T: Clone> ThreadSafeQueue<T> {
    pub fn front(&self) -> Option<T> {
        self.guard().front().cloned()
    }

    pub fn back(&self) -> Option<T> {
        self.guard().back().cloned()
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.guard().get(index).cloned()
    }

    /// Copy of the current contents, front to back.
    pub fn snapshot(&self) -> Vec<T> {
        self.guard().iter().cloned().collect()
    }
}

impl<T: Clone> Clone for ThreadSafeQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Mutex::new(self.guard().clone()),
        }
    }
}

impl<T> From<VecDeque<T>> for ThreadSafeQueue<T> {
    fn from(queue: VecDeque<T>) -> Self {
        Self {
            inner: Mutex::new(queue),
        }
    }
}

impl<T> FromIterator<T> for ThreadSafeQueue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<VecDeque<T>>())
    }
}

impl<T> fmt::Debug for ThreadSafeQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSafeQueue")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_front_and_back_ordering() {
        let queue = ThreadSafeQueue::new();
        queue.push_back(2);
        queue.push_back(3);
        queue.push_front(1);

        assert_eq!(queue.front(), Some(1));
        assert_eq!(queue.back(), Some(3));
        assert_eq!(queue.snapshot(), vec![1, 2, 3]);
        assert_eq!(queue.pop_back(), Some(3));
        assert_eq!(queue.pop_front(), Some(1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_empty_queue_returns_none() {
        let queue: ThreadSafeQueue<u8> = ThreadSafeQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.front(), None);
        assert_eq!(queue.pop_front(), None);
        assert_eq!(queue.remove(3), None);
    }

    #[test]
    fn test_insert_and_remove_first() {
        let queue: ThreadSafeQueue<u32> = (0..5).collect();
        queue.insert(100, 9);
        assert_eq!(queue.back(), Some(9));

        assert_eq!(queue.remove_first(|v| *v == 3), Some(3));
        assert_eq!(queue.snapshot(), vec![0, 1, 2, 4, 9]);

        queue.retain(|v| v % 2 == 0);
        assert_eq!(queue.snapshot(), vec![0, 2, 4]);
    }

    #[test]
    fn test_for_each_mutates_in_place() {
        let queue: ThreadSafeQueue<u32> = (1..=3).collect();
        queue.for_each(|v| *v *= 10);
        assert_eq!(queue.snapshot(), vec![10, 20, 30]);
        assert_eq!(queue.find_map(|v| (*v > 15).then_some(*v)), Some(20));
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(ThreadSafeQueue::new());
        let mut workers = Vec::new();

        for worker in 0..8u32 {
            let queue = Arc::clone(&queue);
            workers.push(thread::spawn(move || {
                for i in 0..1_000u32 {
                    queue.push_back(worker * 1_000 + i);
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(queue.len(), 8_000);
        let mut drained = queue.drain_all();
        drained.sort_unstable();
        assert_eq!(drained, (0..8_000).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }
}
