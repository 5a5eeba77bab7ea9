//! Unbounded FIFO queues which block OS threads on pop.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use ignore_result::Ignore;
use static_assertions::assert_impl_all;

use crate::fiber;

/// Unbounded FIFO queue that is always open. [BlockingQueue::pop] blocks until an item arrives.
pub struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

assert_impl_all!(BlockingQueue<Vec<u8>>: Send, Sync);

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        BlockingQueue { items: Mutex::new(VecDeque::new()), not_empty: Condvar::new() }
    }

    pub fn push(&self, item: T) {
        let mut items = self.items.lock().unwrap();
        items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Pops the oldest item, blocking current thread until one is available.
    pub fn pop(&self) -> T {
        fiber::note_blocking("BlockingQueue::pop");
        let mut items = self.items.lock().unwrap();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            items = self.not_empty.wait(items).unwrap();
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        BlockingQueue::new()
    }
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Unbounded FIFO queue that could be closed.
///
/// After [ClosableQueue::close], pushes are discarded while items already queued stay poppable.
/// [ClosableQueue::pop] returns [None] once the queue is closed and drained.
pub struct ClosableQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
}

assert_impl_all!(ClosableQueue<Vec<u8>>: Send, Sync);

impl<T> ClosableQueue<T> {
    pub fn new() -> Self {
        ClosableQueue { state: Mutex::new(State { items: VecDeque::new(), closed: false }), not_empty: Condvar::new() }
    }

    /// Pushes an item. It is dropped silently if this queue is closed.
    pub fn push(&self, item: T) {
        self.try_push(item).ignore();
    }

    /// Pushes an item, or hands it back if this queue is closed.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pops the oldest item, blocking until one is available or this queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        fiber::note_blocking("ClosableQueue::pop");
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            } else if state.closed {
                return None;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    /// Closes this queue and wakes all blocking pops. Subsequent closes are no-op.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.closed {
            state.closed = true;
            self.not_empty.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for ClosableQueue<T> {
    fn default() -> Self {
        ClosableQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn blocking_fifo() {
        let queue = BlockingQueue::new();
        assert!(queue.is_empty());
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), 1);
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.pop(), 3);
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn blocking_pop_wakes_on_push() {
        let queue = Arc::new(BlockingQueue::new());
        let consumer = thread::spawn({
            let queue = queue.clone();
            move || (0..3).map(|_| queue.pop()).collect::<Vec<_>>()
        });
        for i in 0..3 {
            thread::sleep(Duration::from_millis(10));
            queue.push(i);
        }
        assert_eq!(consumer.join().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn closable_drain_after_close() {
        let queue = ClosableQueue::new();
        queue.push("a");
        queue.push("b");
        queue.close();
        assert!(queue.is_closed());
        queue.push("c");
        assert_eq!(queue.try_push("d"), Err("d"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), Some("b"));
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn closable_close_wakes_blocking_pops() {
        let queue = Arc::new(ClosableQueue::<usize>::new());
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || queue.pop())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        queue.close();
        queue.close();
        for consumer in consumers {
            assert_eq!(consumer.join().unwrap(), None);
        }
    }

    #[test]
    fn closable_multiple_producers() {
        const PRODUCERS: usize = 4;
        const ITEMS: usize = 500;
        let queue = Arc::new(ClosableQueue::new());
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || (0..ITEMS).for_each(|i| queue.push((p, i))))
            })
            .collect();
        let consumer = thread::spawn({
            let queue = queue.clone();
            move || {
                let mut last = [None; PRODUCERS];
                let mut count = 0;
                while let Some((p, i)) = queue.pop() {
                    // Per producer order is preserved.
                    assert!(last[p].map_or(true, |last| last < i));
                    last[p] = Some(i);
                    count += 1;
                }
                count
            }
        });
        producers.into_iter().for_each(|producer| producer.join().unwrap());
        queue.close();
        assert_eq!(consumer.join().unwrap(), PRODUCERS * ITEMS);
    }
}
