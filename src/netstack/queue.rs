//! Bounded async queues used across the stack boundary
//!
//! One primitive serves both the link's packet queues and the per-socket
//! byte queues: a capacity-bounded deque with notify-based blocking on both
//! ends, a close flag, and an optional wake handle poked on every state
//! change so the reactor can sleep until something happens.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

#[derive(Debug)]
pub struct BoundedQueue<T> {
    inner: Mutex<QueueState<T>>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
    wake: Option<Arc<Notify>>,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, wake: Option<Arc<Notify>>) -> Self {
        Self {
            inner: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
            wake,
        }
    }

    fn poke(&self) {
        if let Some(wake) = &self.wake {
            wake.notify_one();
        }
    }

    pub fn close(&self) {
        self.inner.lock().expect("queue lock").closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
        self.poke();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("queue lock").closed
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("queue lock").items.is_empty()
    }

    pub fn has_space(&self) -> bool {
        let state = self.inner.lock().expect("queue lock");
        state.items.len() < self.capacity
    }

    /// Non-blocking push. `Err(Some(item))` when full, `Err(None)` when
    /// closed.
    pub fn try_push(&self, item: T) -> Result<(), Option<T>> {
        let mut state = self.inner.lock().expect("queue lock");
        if state.closed {
            return Err(None);
        }
        if state.items.len() >= self.capacity {
            return Err(Some(item));
        }
        state.items.push_back(item);
        drop(state);
        self.readable.notify_one();
        self.poke();
        Ok(())
    }

    /// Push to the front, bypassing the capacity check. Used to return a
    /// partially consumed item.
    pub fn requeue_front(&self, item: T) {
        self.inner
            .lock()
            .expect("queue lock")
            .items
            .push_front(item);
        self.readable.notify_one();
        self.poke();
    }

    /// Blocking push; resolves to Err(()) once the queue closes.
    pub async fn push(&self, mut item: T) -> Result<(), ()> {
        loop {
            match self.try_push(item) {
                Ok(()) => return Ok(()),
                Err(None) => return Err(()),
                Err(Some(back)) => {
                    item = back;
                    self.writable.notified().await;
                }
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let item = self.inner.lock().expect("queue lock").items.pop_front();
        if item.is_some() {
            self.writable.notify_one();
            self.poke();
        }
        item
    }

    /// Blocking pop; None once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            self.readable.notified().await;
        }
    }

    /// Resolves when an item can be popped (or the queue closed).
    pub async fn readable(&self) {
        loop {
            {
                let state = self.inner.lock().expect("queue lock");
                if !state.items.is_empty() || state.closed {
                    return;
                }
            }
            self.readable.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn push_pop_fifo() {
        let q: BoundedQueue<u32> = BoundedQueue::new(4, None);
        q.push(1).await.unwrap();
        q.push(2).await.unwrap();
        assert_eq!(q.pop().await, Some(1));
        assert_eq!(q.pop().await, Some(2));
    }

    #[tokio::test]
    async fn full_queue_blocks_until_space() {
        let q = Arc::new(BoundedQueue::new(1, None));
        q.push(1u32).await.unwrap();

        let q2 = q.clone();
        let pusher = tokio::spawn(async move { q2.push(2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pusher.is_finished());

        assert_eq!(q.pop().await, Some(1));
        pusher.await.unwrap().unwrap();
        assert_eq!(q.pop().await, Some(2));
    }

    #[tokio::test]
    async fn close_unblocks_everyone() {
        let q: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(1, None));
        let q2 = q.clone();
        let popper = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();
        assert_eq!(popper.await.unwrap(), None);
        assert!(q.push(1).await.is_err());
    }

    #[tokio::test]
    async fn drains_after_close() {
        let q: BoundedQueue<u32> = BoundedQueue::new(4, None);
        q.push(7).await.unwrap();
        q.close();
        // already queued items still come out
        assert_eq!(q.pop().await, Some(7));
        assert_eq!(q.pop().await, None);
    }

    #[tokio::test]
    async fn wake_handle_is_poked_on_push() {
        let wake = Arc::new(Notify::new());
        let q: BoundedQueue<u32> = BoundedQueue::new(4, Some(wake.clone()));
        let waiter = tokio::spawn(async move { wake.notified().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.try_push(1).unwrap();
        waiter.await.unwrap();
    }
}
