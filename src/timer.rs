//! Retransmission timer for the single outstanding packet of a session.
//!
//! Stop-and-wait only ever has one unacknowledged packet, so one timer per
//! session is enough. It is armed on every fresh transmission, which also
//! resets the attempt counter, and disarmed once the session is idle or
//! finished. A disarmed timer consumes nothing and its [`expired`] future
//! never resolves.
//!
//! [`expired`]: RetransmitTimer::expired

use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Result, TransferError};
use crate::protocol::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitConfig {
    /// How long to wait for a reply before re-sending.
    pub timeout: Duration,
    /// Retransmissions allowed for one packet before the peer is declared
    /// unreachable.
    pub max_retries: u32,
    /// How long a finished receiver keeps answering a re-sent final block.
    pub dally: Duration,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            dally: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
pub struct RetransmitTimer {
    config: RetransmitConfig,
    deadline: Option<Instant>,
    /// Retransmissions of the current packet so far.
    retries: u32,
}

impl RetransmitTimer {
    pub fn new(config: RetransmitConfig) -> Self {
        Self {
            config,
            deadline: None,
            retries: 0,
        }
    }

    /// Start timing a freshly sent packet.
    pub fn arm(&mut self) {
        self.retries = 0;
        self.deadline = Some(Instant::now() + self.config.timeout);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
        self.retries = 0;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Resolves at the deadline; pending forever while disarmed.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Account for a deadline that passed. Returns the retransmission number
    /// to perform, or `PeerUnreachable` once the budget is spent.
    pub fn on_expiry(&mut self) -> Result<u32> {
        if self.retries >= self.config.max_retries {
            let attempts = self.retries + 1;
            self.disarm();
            return Err(TransferError::PeerUnreachable { attempts });
        }
        self.retries += 1;
        self.deadline = Some(Instant::now() + self.config.timeout);
        Ok(self.retries)
    }
}
