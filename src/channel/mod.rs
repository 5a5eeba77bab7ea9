//! Rendezvous channel for direct handoff between producers and consumers.
//!
//! The channel holds no buffer but a single slot. [Rendezvous::push] does not return until its value
//! has been taken by [Rendezvous::pop] or the channel is closed. Both block OS threads.

use std::iter::FusedIterator;
use std::sync::{Condvar, Mutex, MutexGuard};

use static_assertions::assert_impl_all;

pub use crate::error::PushError;
use crate::fiber;

struct State<T> {
    slot: Option<T>,
    closed: bool,
    // Ticket of last value put into slot.
    pushed: u64,
    // Number of values taken from slot.
    popped: u64,
}

/// Multi-producer multi-consumer channel without buffering.
pub struct Rendezvous<T> {
    state: Mutex<State<T>>,
    // Slot is filled or channel is closed.
    not_empty: Condvar,
    // Slot is drained or channel is closed.
    not_full: Condvar,
    // Some value was taken or channel is closed.
    taken: Condvar,
}

assert_impl_all!(Rendezvous<Vec<u8>>: Send, Sync);

impl<T> Rendezvous<T> {
    pub fn new() -> Self {
        Rendezvous {
            state: Mutex::new(State { slot: None, closed: false, pushed: 0, popped: 0 }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            taken: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap()
    }

    /// Hands a value over to some consumer.
    ///
    /// It blocks until the slot is free, and then until the value is taken. If the channel is
    /// closed after the value is put into slot, the value stays for [Rendezvous::pop] and this
    /// returns `Ok(())` without waiting further.
    ///
    /// # Errors
    /// [PushError::Closed] with given value if the channel is closed before the value gets slot.
    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        fiber::note_blocking("Rendezvous::push");
        let mut state = self.lock();
        while state.slot.is_some() && !state.closed {
            state = self.not_full.wait(state).unwrap();
        }
        if state.closed {
            return Err(PushError::Closed(value));
        }
        state.slot = Some(value);
        state.pushed += 1;
        let ticket = state.pushed;
        self.not_empty.notify_all();
        while state.popped < ticket && !state.closed {
            state = self.taken.wait(state).unwrap();
        }
        Ok(())
    }

    /// Takes a value from producers.
    ///
    /// Returns [None] if the channel is closed and drained.
    pub fn pop(&self) -> Option<T> {
        fiber::note_blocking("Rendezvous::pop");
        let mut state = self.lock();
        loop {
            if let Some(value) = state.slot.take() {
                state.popped += 1;
                self.taken.notify_all();
                self.not_full.notify_all();
                return Some(value);
            } else if state.closed {
                return None;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    /// Closes this channel and wakes all waiters. Subsequent closes are no-op.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.taken.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Returns an iterator which pops values until the channel is closed and drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { channel: self }
    }
}

impl<T> Default for Rendezvous<T> {
    fn default() -> Self {
        Rendezvous::new()
    }
}

impl<'a, T> IntoIterator for &'a Rendezvous<T> {
    type IntoIter = Iter<'a, T>;
    type Item = T;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator returned by [Rendezvous::iter].
pub struct Iter<'a, T> {
    channel: &'a Rendezvous<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.channel.pop()
    }
}

impl<T> FusedIterator for Iter<'_, T> {}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use more_asserts::{assert_gt, assert_le, assert_lt};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test]
    fn push_returns_after_pop() {
        let channel = Arc::new(Rendezvous::new());
        let consumer = thread::spawn({
            let channel = channel.clone();
            move || {
                thread::sleep(Duration::from_millis(50));
                let value = channel.pop();
                (value, Instant::now())
            }
        });
        let t1 = Instant::now();
        channel.push(5).unwrap();
        let t3 = Instant::now();
        let (value, t2) = consumer.join().unwrap();
        assert_eq!(value, Some(5));
        assert_lt!(t1, t2);
        assert_le!(t2, t3);
        assert_gt!(t3 - t1, Duration::from_millis(50));
    }

    #[test]
    fn push_after_close() {
        let channel = Rendezvous::new();
        channel.close();
        channel.close();
        assert!(channel.is_closed());
        let start = Instant::now();
        assert_eq!(channel.push(vec![1]), Err(PushError::Closed(vec![1])));
        assert_lt!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(channel.pop(), None);
    }

    #[test]
    fn close_with_pending_value() {
        let channel = Arc::new(Rendezvous::new());
        let producer = thread::spawn({
            let channel = channel.clone();
            move || channel.push("pending")
        });
        // Wait until value is put into slot.
        while channel.lock().slot.is_none() {
            thread::sleep(Duration::from_millis(1));
        }
        channel.close();
        assert_eq!(producer.join().unwrap(), Ok(()));
        assert_eq!(channel.pop(), Some("pending"));
        assert_eq!(channel.pop(), None);
        assert_eq!(channel.pop(), None);
    }

    #[test]
    fn close_wakes_waiters() {
        let channel = Arc::new(Rendezvous::<usize>::new());
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let channel = channel.clone();
                thread::spawn(move || channel.pop())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        channel.close();
        for consumer in consumers {
            assert_eq!(consumer.join().unwrap(), None);
        }
    }

    #[test]
    fn close_wakes_blocked_push() {
        let channel = Arc::new(Rendezvous::new());
        let first = thread::spawn({
            let channel = channel.clone();
            move || channel.push(1)
        });
        while channel.lock().slot.is_none() {
            thread::sleep(Duration::from_millis(1));
        }
        let second = thread::spawn({
            let channel = channel.clone();
            move || channel.push(2)
        });
        thread::sleep(Duration::from_millis(20));
        channel.close();
        assert_eq!(first.join().unwrap(), Ok(()));
        assert_eq!(second.join().unwrap(), Err(PushError::Closed(2)));
        assert_eq!(channel.iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test_case(1, 1)]
    #[test_case(4, 1)]
    #[test_case(1, 4)]
    #[test_case(4, 4)]
    fn multiple_producers_consumers(producers: usize, consumers: usize) {
        const VALUES: usize = 200;
        let channel = Arc::new(Rendezvous::new());
        let producers: Vec<_> = (0..producers)
            .map(|p| {
                let channel = channel.clone();
                thread::spawn(move || (0..VALUES).for_each(|i| channel.push((p, i)).unwrap()))
            })
            .collect();
        let consumers: Vec<_> = (0..consumers)
            .map(|_| {
                let channel = channel.clone();
                thread::spawn(move || channel.iter().collect::<Vec<_>>())
            })
            .collect();
        let expected = producers.len() * VALUES;
        producers.into_iter().for_each(|producer| producer.join().unwrap());
        channel.close();
        let mut received = HashSet::new();
        for consumer in consumers {
            for value in consumer.join().unwrap() {
                assert!(received.insert(value), "value {:?} delivered twice", value);
            }
        }
        assert_eq!(received.len(), expected);
    }
}
