//! The scan loop
//!
//! While the result set wants more entries, pull a candidate batch and
//! probe it with a small worker pool; otherwise idle briefly and run the
//! expiry sweep. Every await honors shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use super::generator::IpGenerator;
use super::result_queue::IpQueue;
use super::{ping, ScannerOptions};

/// Pause between rounds when the set is full.
const IDLE_PAUSE: Duration = Duration::from_millis(200);
/// Back-off after a generator failure.
const GENERATOR_BACKOFF: Duration = Duration::from_secs(2);
/// Concurrent probes per batch.
const PROBE_POOL: usize = 8;

pub async fn run(
    opts: Arc<ScannerOptions>,
    queue: Arc<IpQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut generator = match IpGenerator::new(
        &opts.cidr_list,
        opts.use_ipv4,
        opts.use_ipv6,
        opts.batch_size,
    ) {
        Ok(g) => g,
        Err(e) => {
            debug!(error = %e, "scanner has nothing to do");
            return;
        }
    };

    debug!(prefixes = opts.cidr_list.len(), mode = ?opts.ping_mode, "scan started");

    loop {
        if *shutdown.borrow() {
            return;
        }

        if !queue.needs_work() {
            queue.expire();
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(IDLE_PAUSE) => continue,
            }
        }

        let batch = generator.next_batch();
        if batch.is_empty() {
            trace!("generator dry; backing off");
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(GENERATOR_BACKOFF) => continue,
            }
        }

        let mut pool: JoinSet<()> = JoinSet::new();
        for addr in batch {
            while pool.len() >= PROBE_POOL {
                tokio::select! {
                    _ = shutdown.changed() => {
                        pool.abort_all();
                        return;
                    }
                    _ = pool.join_next() => {}
                }
            }
            let opts = opts.clone();
            let queue = queue.clone();
            pool.spawn(async move {
                trace!(%addr, "probing");
                match ping::probe(&opts, addr).await {
                    Ok(info) => {
                        trace!(addr_port = %info.addr_port, rtt = ?info.rtt, "probe ok");
                        queue.enqueue(info);
                    }
                    Err(e) => trace!(%addr, error = %e, "probe failed"),
                }
            });
        }
        while pool.join_next().await.is_some() {
            if *shutdown.borrow() {
                pool.abort_all();
                return;
            }
        }
    }
}
