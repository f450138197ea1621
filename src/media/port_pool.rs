// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Returned by [`PortPool::acquire`] when every port in the range is taken
#[derive(Debug, thiserror::Error)]
#[error("RTP port range exhausted, {0} ports in use")]
pub struct ResourceExhausted(pub usize);

/// Manages the bridge's RTP port range
///
/// Tracks the UDP ports used by the per-call RTP receivers. One port per
/// active call; the range is capped by the maximum number of concurrent
/// calls. Owned by the `Core`, not a global.
#[derive(Debug)]
pub struct PortPool {
    /// Start of the port range
    port_start: u16,
    /// Number of ports in the range
    capacity: u16,
    /// Ports currently handed out
    used: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    pub fn new(port_start: u16, capacity: u16) -> Self {
        log::trace!(
            "bridge will use ports {} - {} for RTP",
            port_start,
            port_start + capacity.saturating_sub(1)
        );

        Self {
            port_start,
            capacity,
            used: Mutex::new(BTreeSet::new()),
        }
    }

    /// Hand out the lowest free port of the range
    ///
    /// Allocation is ascending lowest-free-first so recently returned ports
    /// stay hot.
    pub fn acquire(&self) -> Result<u16, ResourceExhausted> {
        let mut used = self.used.lock();

        let port = (0..self.capacity)
            .map(|i| self.port_start + i)
            .find(|port| !used.contains(port));

        match port {
            Some(port) => {
                used.insert(port);
                log::trace!("acquired RTP port {port}");
                Ok(port)
            }
            None => Err(ResourceExhausted(used.len())),
        }
    }

    /// Return a port to the pool
    ///
    /// Releasing a port that is not handed out is a silent no-op, cleanup
    /// paths may double-release.
    pub fn release(&self, port: u16) {
        let mut used = self.used.lock();

        if used.remove(&port) {
            log::trace!("released RTP port {port}");
        }
    }

    pub fn in_use(&self) -> usize {
        self.used.lock().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn acquires_ascending() {
        let pool = PortPool::new(12000, 4);

        assert_eq!(pool.acquire().unwrap(), 12000);
        assert_eq!(pool.acquire().unwrap(), 12001);
        assert_eq!(pool.acquire().unwrap(), 12002);
        assert_eq!(pool.acquire().unwrap(), 12003);
        assert!(pool.acquire().is_err());
    }

    #[test]
    fn released_port_is_reused_lowest_first() {
        let pool = PortPool::new(12000, 3);

        let _ = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        let _ = pool.acquire().unwrap();

        pool.release(second);
        assert_eq!(pool.acquire().unwrap(), second);
    }

    #[test]
    fn double_release_is_a_noop() {
        let pool = PortPool::new(12000, 2);

        let port = pool.acquire().unwrap();
        pool.release(port);
        pool.release(port);
        pool.release(50000);

        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.acquire().unwrap(), port);
        assert_eq!(pool.in_use(), 1);
    }
}
