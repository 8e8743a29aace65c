//! Reconnection policy for the WiFi link
//!
//! The polling loop runs this once per tick. Nothing here ever retries
//! inline; a lost link stays lost until the duty cycle comes around.

use std::{
    net::TcpStream,
    time::{Duration, Instant},
};

use log::{debug, info};

use crate::{resolve, Link};
use shared::{PROBE_TIMEOUT_MS, RECONNECT_PERIOD_S};

/// Decides when to try getting the WiFi link back.
///
/// A full reconnect can block for the connect timeout, so it is only
/// attempted after a cheap short-timeout probe confirms the board is
/// reachable, and at most once per duty-cycle window. Failed probes are
/// silent.
pub struct Supervisor {
    period: Duration,
    last_probe: Option<Instant>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_period(Duration::from_secs(RECONNECT_PERIOD_S))
    }

    pub fn with_period(period: Duration) -> Self {
        Self {
            period,
            last_probe: None,
        }
    }

    /// Run one duty-cycle check. Returns true when the link came back.
    pub fn tick(&mut self, link: &Link) -> bool {
        if link.is_connected() || !link.auto_reconnect() {
            return false;
        }

        let (ip, port) = match link.last_known() {
            Some(endpoint) => endpoint,
            None => return false,
        };

        if let Some(last) = self.last_probe {
            if last.elapsed() < self.period {
                return false;
            }
        }

        self.last_probe = Some(Instant::now());

        let addr = match resolve(&ip, port) {
            Ok(addr) => addr,
            Err(_) => return false,
        };

        // Cheap liveness probe, bounded well below the tick budget
        match TcpStream::connect_timeout(&addr, Duration::from_millis(PROBE_TIMEOUT_MS)) {
            Ok(probe) => drop(probe),
            Err(e) => {
                debug!("probe of {} failed: {}", addr, e);
                return false;
            }
        }

        info!("board reachable again, reconnecting to {}", addr);

        link.connect_wifi(&ip, port).is_ok()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
