//! Candidate address generation
//!
//! Each prefix is walked in pseudo-random order without replacement. Small
//! prefixes are shuffled up front; large ones are sampled with a seen-set,
//! which keeps memory proportional to the number of candidates actually
//! probed. When every prefix runs dry the walks restart, so a long-running
//! scan keeps re-visiting addresses as results expire.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::ScanError;

/// Materialize-and-shuffle threshold, in addresses.
const SHUFFLE_LIMIT: u128 = 1 << 16;
/// Sampling attempts per candidate before a large prefix counts as dry.
const SAMPLE_TRIES: usize = 64;

struct PrefixWalk {
    net: IpNet,
    /// Pre-shuffled candidates for small prefixes.
    shuffled: Option<Vec<IpAddr>>,
    pos: usize,
    /// Sampling history for large prefixes.
    seen: HashSet<IpAddr>,
}

impl PrefixWalk {
    fn new(net: IpNet) -> Self {
        let size = prefix_size(&net);
        let shuffled = if size <= SHUFFLE_LIMIT {
            let mut all: Vec<IpAddr> = net.hosts().collect();
            if all.is_empty() {
                // /31, /32 and the v6 equivalents have no "hosts"; use the
                // network address itself
                all.push(net.addr());
            }
            all.shuffle(&mut rand::thread_rng());
            Some(all)
        } else {
            None
        };
        Self {
            net,
            shuffled,
            pos: 0,
            seen: HashSet::new(),
        }
    }

    fn next(&mut self) -> Option<IpAddr> {
        match &self.shuffled {
            Some(list) => {
                let addr = list.get(self.pos).copied();
                if addr.is_some() {
                    self.pos += 1;
                }
                addr
            }
            None => {
                let mut rng = rand::thread_rng();
                for _ in 0..SAMPLE_TRIES {
                    let candidate = random_in_prefix(&self.net, &mut rng);
                    if self.seen.insert(candidate) {
                        return Some(candidate);
                    }
                }
                None
            }
        }
    }

    fn restart(&mut self) {
        self.pos = 0;
        self.seen.clear();
        if let Some(list) = &mut self.shuffled {
            list.shuffle(&mut rand::thread_rng());
        }
    }
}

pub struct IpGenerator {
    walks: Vec<PrefixWalk>,
    batch_size: usize,
}

impl IpGenerator {
    /// Filters prefixes down to the enabled address families.
    pub fn new(
        cidrs: &[IpNet],
        use_ipv4: bool,
        use_ipv6: bool,
        batch_size: usize,
    ) -> Result<Self, ScanError> {
        let walks: Vec<PrefixWalk> = cidrs
            .iter()
            .filter(|net| match net {
                IpNet::V4(_) => use_ipv4,
                IpNet::V6(_) => use_ipv6,
            })
            .map(|net| PrefixWalk::new(*net))
            .collect();
        if walks.is_empty() {
            return Err(ScanError::NoPrefixes);
        }
        Ok(Self { walks, batch_size })
    }

    /// Up to `batch_size` fresh candidates, interleaved across prefixes.
    /// When every walk is dry, all walks restart and the batch is drawn
    /// from the fresh cycle.
    pub fn next_batch(&mut self) -> Vec<IpAddr> {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut restarted = false;
        'fill: while batch.len() < self.batch_size {
            let mut yielded = false;
            for walk in &mut self.walks {
                if batch.len() >= self.batch_size {
                    break 'fill;
                }
                if let Some(addr) = walk.next() {
                    batch.push(addr);
                    yielded = true;
                }
            }
            if !yielded {
                if restarted {
                    break;
                }
                for walk in &mut self.walks {
                    walk.restart();
                }
                restarted = true;
            }
        }
        batch
    }
}

fn prefix_size(net: &IpNet) -> u128 {
    let host_bits = (net.max_prefix_len() - net.prefix_len()) as u32;
    1u128.checked_shl(host_bits).unwrap_or(u128::MAX)
}

fn random_in_prefix(net: &IpNet, rng: &mut impl Rng) -> IpAddr {
    match net {
        IpNet::V4(v4) => {
            let base = u32::from(v4.network());
            let host_bits = 32 - v4.prefix_len() as u32;
            let mask = if host_bits == 32 {
                u32::MAX
            } else {
                (1u32 << host_bits) - 1
            };
            IpAddr::from(std::net::Ipv4Addr::from(base | (rng.gen::<u32>() & mask)))
        }
        IpNet::V6(v6) => {
            let base = u128::from(v6.network());
            let host_bits = 128 - v6.prefix_len() as u32;
            let mask = if host_bits == 128 {
                u128::MAX
            } else {
                (1u128 << host_bits) - 1
            };
            IpAddr::from(std::net::Ipv6Addr::from(base | (rng.gen::<u128>() & mask)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn small_prefix_yields_each_host_once_per_cycle() {
        let net: IpNet = "192.0.2.0/29".parse().unwrap();
        let mut gen = IpGenerator::new(&[net], true, true, 4).unwrap();

        let mut seen: HashSet<IpAddr> = HashSet::new();
        // /29 has 6 hosts; two batches of 4 wrap into the next cycle
        let first = gen.next_batch();
        let second = gen.next_batch();
        assert_eq!(first.len(), 4);
        for addr in first.iter().chain(second.iter().take(2)) {
            assert!(net.contains(addr));
            assert!(seen.insert(*addr), "duplicate before exhaustion: {addr}");
        }
    }

    #[test]
    fn family_filter_drops_disabled_prefixes() {
        let v4: IpNet = "192.0.2.0/24".parse().unwrap();
        let v6: IpNet = "2001:db8::/64".parse().unwrap();

        let mut only_v6 = IpGenerator::new(&[v4, v6], false, true, 8).unwrap();
        assert!(only_v6.next_batch().iter().all(|a| a.is_ipv6()));

        assert!(matches!(
            IpGenerator::new(&[v6], true, false, 8),
            Err(ScanError::NoPrefixes)
        ));
    }

    #[test]
    fn empty_cidr_list_is_an_error() {
        assert!(matches!(
            IpGenerator::new(&[], true, true, 8),
            Err(ScanError::NoPrefixes)
        ));
    }

    #[test]
    fn large_prefix_samples_without_replacement() {
        let net: IpNet = "2606:4700:d0::/48".parse().unwrap();
        let mut gen = IpGenerator::new(&[net], true, true, 16).unwrap();
        let batch = gen.next_batch();
        assert_eq!(batch.len(), 16);
        let unique: HashSet<_> = batch.iter().collect();
        assert_eq!(unique.len(), 16);
        assert!(batch.iter().all(|a| net.contains(a)));
    }

    #[test]
    fn exhausted_walks_restart() {
        let net: IpNet = "192.0.2.0/30".parse().unwrap(); // 2 hosts
        let mut gen = IpGenerator::new(&[net], true, false, 8).unwrap();
        let batch = gen.next_batch();
        // 2 fresh + restart yields the same 2 again
        assert_eq!(batch.len(), 4);
    }
}
