//! The link object between the WireGuard device and the virtual stack
//!
//! Two half-duplex packet queues owned by one shared object. The device and
//! the stack each hold a [`LinkEndpoint`] facing the other way; neither ever
//! references the other directly. Backpressure is cooperative: writers block
//! while the opposite queue is full.

use std::sync::Arc;

use crate::error::NetworkError;
use crate::netstack::queue::BoundedQueue;

/// Packets buffered per direction before writers block.
const LINK_QUEUE_CAP: usize = 512;

/// One side of the link. `read` takes packets the other side wrote;
/// `write` hands packets to the other side.
#[derive(Clone)]
pub struct LinkEndpoint {
    rx: Arc<BoundedQueue<Vec<u8>>>,
    tx: Arc<BoundedQueue<Vec<u8>>>,
    mtu: usize,
}

impl LinkEndpoint {
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Next raw IP packet from the other side; None once the link closed
    /// and drained.
    pub async fn read(&self) -> Option<Vec<u8>> {
        self.rx.pop().await
    }

    pub fn try_read(&self) -> Option<Vec<u8>> {
        self.rx.try_pop()
    }

    /// Resolves when `try_read` would yield, or the link is closed.
    pub async fn readable(&self) {
        self.rx.readable().await
    }

    /// Hand a raw IP packet to the other side, blocking while its queue is
    /// full. Oversized packets are dropped silently.
    pub async fn write(&self, packet: Vec<u8>) -> Result<(), NetworkError> {
        if packet.len() > self.mtu {
            tracing::trace!(len = packet.len(), mtu = self.mtu, "dropping oversized packet");
            return Ok(());
        }
        self.tx.push(packet).await.map_err(|_| NetworkError::StackClosed)
    }

    /// Close both directions. Either side may call this; readers drain and
    /// then see end-of-link.
    pub fn close(&self) {
        self.rx.close();
        self.tx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Build the two facing endpoints of a link.
pub fn link_pair(mtu: usize) -> (LinkEndpoint, LinkEndpoint) {
    let a_to_b = Arc::new(BoundedQueue::new(LINK_QUEUE_CAP, None));
    let b_to_a = Arc::new(BoundedQueue::new(LINK_QUEUE_CAP, None));
    let a = LinkEndpoint {
        rx: b_to_a.clone(),
        tx: a_to_b.clone(),
        mtu,
    };
    let b = LinkEndpoint {
        rx: a_to_b,
        tx: b_to_a,
        mtu,
    };
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packets_cross_the_link_both_ways() {
        let (dev, stack) = link_pair(1330);
        dev.write(vec![1, 2, 3]).await.unwrap();
        assert_eq!(stack.read().await, Some(vec![1, 2, 3]));
        stack.write(vec![4]).await.unwrap();
        assert_eq!(dev.read().await, Some(vec![4]));
    }

    #[tokio::test]
    async fn oversized_packets_are_dropped_not_errors() {
        let (dev, stack) = link_pair(16);
        dev.write(vec![0u8; 17]).await.unwrap();
        dev.write(vec![0u8; 16]).await.unwrap();
        assert_eq!(stack.read().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn close_from_either_side_ends_both() {
        let (dev, stack) = link_pair(1330);
        stack.close();
        assert!(dev.write(vec![1]).await.is_err());
        assert_eq!(dev.read().await, None);
    }
}
