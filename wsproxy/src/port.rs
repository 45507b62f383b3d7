//! Local port allocation for tunnel listeners.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum PortError {
    #[error("No ports available in {min}-{max} after {attempts} attempts")]
    NoPortsAvailable { min: u16, max: u16, attempts: usize },

    #[error("Invalid port range {min}-{max}")]
    InvalidRange { min: u16, max: u16 },
}

#[derive(Debug, Clone)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
    /// Number of candidates drawn into the pool on every refill.
    pub pool_size: usize,
    /// Candidates probed before giving up on a single acquisition.
    pub max_attempts: usize,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 10000,
            max: 30000,
            pool_size: 256,
            max_attempts: 64,
        }
    }
}

impl PortRange {
    fn ports(&self) -> RangeInclusive<u16> {
        self.min..=self.max
    }
}

#[derive(Debug, Default)]
struct Pool {
    candidates: Vec<u16>,
    leased: HashSet<u16>,
}

impl Pool {
    fn refill(&mut self, range: &PortRange) {
        let mut rng = rand::thread_rng();
        let mut free: Vec<u16> = range
            .ports()
            .filter(|port| !self.leased.contains(port))
            .collect();
        free.shuffle(&mut rng);
        free.truncate(range.pool_size.max(1));
        trace!("Refilled port pool with {} candidates", free.len());
        self.candidates = free;
    }
}

/// Hands out locally free ports from a randomized candidate pool.
///
/// Pop and probe happen under one lock, and a port stays leased until
/// [`PortAllocator::release`] is called, so two callers never receive the
/// same port even when the pool is down to its last candidate.
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    probe_ip: IpAddr,
    pool: Mutex<Pool>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Result<Self, PortError> {
        if range.min == 0 || range.min > range.max {
            return Err(PortError::InvalidRange {
                min: range.min,
                max: range.max,
            });
        }
        Ok(Self {
            range,
            probe_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            pool: Mutex::new(Pool::default()),
        })
    }

    /// Probe on a specific address instead of `0.0.0.0`.
    pub fn with_probe_ip(mut self, ip: IpAddr) -> Self {
        self.probe_ip = ip;
        self
    }

    pub fn range(&self) -> &PortRange {
        &self.range
    }

    pub fn acquire(&self) -> Result<u16, PortError> {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());

        for _ in 0..self.range.max_attempts {
            let port = match pool.candidates.pop() {
                Some(port) => port,
                None => {
                    pool.refill(&self.range);
                    match pool.candidates.pop() {
                        Some(port) => port,
                        None => break,
                    }
                }
            };

            if pool.leased.contains(&port) {
                continue;
            }

            if Self::is_port_available(self.probe_ip, port) {
                pool.leased.insert(port);
                debug!("Allocated port {}", port);
                return Ok(port);
            }
            trace!("Port {} is occupied, discarding", port);
        }

        Err(PortError::NoPortsAvailable {
            min: self.range.min,
            max: self.range.max,
            attempts: self.range.max_attempts,
        })
    }

    /// Like [`PortAllocator::acquire`], but the port goes back to the pool
    /// when the returned lease is dropped.
    pub fn lease(self: &Arc<Self>) -> Result<PortLease, PortError> {
        let port = self.acquire()?;
        Ok(PortLease {
            port,
            allocator: self.clone(),
        })
    }

    pub fn release(&self, port: u16) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        if pool.leased.remove(&port) {
            debug!("Released port {}", port);
        }
    }

    pub fn is_leased(&self, port: u16) -> bool {
        let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.leased.contains(&port)
    }

    fn is_port_available(ip: IpAddr, port: u16) -> bool {
        TcpListener::bind(SocketAddr::from((ip, port))).is_ok()
    }
}

/// A leased port, released on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    allocator: Arc<PortAllocator>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release(self.port);
    }
}
