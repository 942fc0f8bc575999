//! smoltcp phy device over in-memory packet queues
//!
//! The interface neither owns a descriptor nor touches the host network:
//! inbound packets are appended by the reactor after it drains the link,
//! outbound packets accumulate for the reactor to push back onto the link.

use std::collections::VecDeque;

use smoltcp::phy::{Checksum, Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;

pub struct VirtualDevice {
    pub inbound: VecDeque<Vec<u8>>,
    pub outbound: VecDeque<Vec<u8>>,
    caps: DeviceCapabilities,
}

impl VirtualDevice {
    pub fn new(mtu: usize) -> Self {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = mtu;
        // packets cross a trusted in-process boundary; still checksum both
        // ways because the remote end of the tunnel is a real network
        caps.checksum.ipv4 = Checksum::Both;
        caps.checksum.tcp = Checksum::Both;
        caps.checksum.udp = Checksum::Both;
        Self {
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            caps,
        }
    }
}

pub struct VirtRxToken(Vec<u8>);

impl RxToken for VirtRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

pub struct VirtTxToken<'a>(&'a mut VecDeque<Vec<u8>>);

impl<'a> TxToken for VirtTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        self.0.push_back(buf);
        result
    }
}

impl Device for VirtualDevice {
    type RxToken<'a> = VirtRxToken;
    type TxToken<'a> = VirtTxToken<'a>;

    fn receive(&mut self, _now: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        self.inbound
            .pop_front()
            .map(|pkt| (VirtRxToken(pkt), VirtTxToken(&mut self.outbound)))
    }

    fn transmit(&mut self, _now: Instant) -> Option<Self::TxToken<'_>> {
        Some(VirtTxToken(&mut self.outbound))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.caps.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transmit_lands_in_outbound() {
        let mut dev = VirtualDevice::new(1330);
        let token = dev.transmit(Instant::from_millis(0)).unwrap();
        token.consume(4, |buf| buf.copy_from_slice(&[9, 9, 9, 9]));
        assert_eq!(dev.outbound.pop_front(), Some(vec![9, 9, 9, 9]));
    }

    #[test]
    fn receive_consumes_inbound() {
        let mut dev = VirtualDevice::new(1330);
        assert!(dev.receive(Instant::from_millis(0)).is_none());
        dev.inbound.push_back(vec![1, 2]);
        let (rx, _tx) = dev.receive(Instant::from_millis(0)).unwrap();
        let got = rx.consume(|buf| buf.to_vec());
        assert_eq!(got, vec![1, 2]);
    }

    #[test]
    fn capabilities_carry_the_mtu() {
        let dev = VirtualDevice::new(1280);
        assert_eq!(dev.capabilities().max_transmission_unit, 1280);
    }
}
