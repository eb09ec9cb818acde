//! Client session: request the stream, fill the gaps, persist the result.
//!
//! ```text
//! Idle -> AwaitingInitialBatch -> DetectingGaps -> Complete
//!                                      |              ^
//!                                      v              |
//!                               AwaitingResends ------+
//! any non-terminal state -> Failed
//! ```
//!
//! The session owns its [`ReconstructionState`] and its exchange connection;
//! nothing is shared with other sessions. I/O is blocking, so the only
//! places a session waits are the exchange calls.
use std::fmt;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{error, info};

use crate::error::{FeedError, Result};
use crate::exchange::{Exchange, TcpExchange};
use crate::gap::{detect_gaps, ReconstructionState, DEFAULT_MAX_MISSING};
use crate::packet::{decode_all, Packet};
use crate::resend::{recover, ResendReport, DEFAULT_ATTEMPTS};
use crate::store::Output;
use crate::wire::BatchFraming;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingInitialBatch,
    DetectingGaps,
    AwaitingResends,
    Complete,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingInitialBatch => "awaiting initial batch",
            SessionState::DetectingGaps => "detecting gaps",
            SessionState::AwaitingResends => "awaiting resends",
            SessionState::Complete => "complete",
            SessionState::Failed => "failed",
        })
    }
}

/// Shared stop flag, tripped from a signal handler or another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub framing: BatchFraming,
    /// Per-read timeout on the exchange connection. `None` blocks forever.
    pub read_timeout: Option<Duration>,
    /// Requests per missing sequence before giving up.
    pub attempts: u32,
    /// Gaps in the initial batch beyond which the session fails instead of
    /// asking for each one.
    pub max_missing: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            framing: BatchFraming::Counted,
            read_timeout: Some(Duration::from_secs(5)),
            attempts: DEFAULT_ATTEMPTS,
            max_missing: DEFAULT_MAX_MISSING,
        }
    }
}

/// What a completed session produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub batch_len: usize,
    pub gaps: Vec<i32>,
    pub resends: ResendReport,
    pub packets: usize,
}

pub struct Session<E: Exchange> {
    exchange: E,
    config: SessionConfig,
    cancel: CancelToken,
    state: SessionState,
}

impl Session<TcpExchange> {
    /// Open a TCP connection to the exchange at `addr`.
    pub fn connect<A: ToSocketAddrs>(addr: A, config: SessionConfig, cancel: CancelToken) -> Result<Self> {
        let exchange = TcpExchange::connect(addr, config.framing, config.read_timeout)?;
        info!(peer = %exchange.peer_addr(), framing = ?config.framing, "session connected");
        Ok(Self::new(exchange, config, cancel))
    }
}

impl<E: Exchange> Session<E> {
    pub fn new(exchange: E, config: SessionConfig, cancel: CancelToken) -> Self {
        Self { exchange, config, cancel, state: SessionState::Idle }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Reconstruct the full sequence and persist it to `output`.
    /// Nothing is written unless every gap was filled.
    pub fn run(&mut self, output: &Output) -> Result<SessionSummary> {
        self.ensure_fresh()?;
        let result = self.reconstruct().and_then(|(packets, mut summary)| {
            output.persist(&packets)?;
            summary.packets = packets.len();
            Ok(summary)
        });
        self.finish(result)
    }

    /// Reconstruct without persisting; the connection is closed either way.
    pub fn collect(&mut self) -> Result<Vec<Packet>> {
        self.ensure_fresh()?;
        let result = self.reconstruct().map(|(packets, _)| packets);
        self.finish(result)
    }

    /// A session runs once; a second call leaves the recorded outcome alone.
    fn ensure_fresh(&self) -> Result<()> {
        match self.state {
            SessionState::Idle => Ok(()),
            state => Err(FeedError::SessionReused { state }),
        }
    }

    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        self.exchange.close();
        match &result {
            Ok(_) => {
                self.state = SessionState::Complete;
                info!("session complete");
            }
            Err(e) => {
                error!(state = %self.state, error = %e, "session failed");
                self.state = SessionState::Failed;
            }
        }
        result
    }

    fn reconstruct(&mut self) -> Result<(Vec<Packet>, SessionSummary)> {
        self.enter(SessionState::AwaitingInitialBatch)?;
        let bytes = match self.exchange.stream_all() {
            Ok(b) => b,
            Err(e) if e.is_timeout() => return Err(FeedError::Timeout { state: self.state }),
            Err(e) => return Err(e),
        };
        let batch = decode_all(&bytes)?;
        info!(packets = batch.len(), "initial batch received");

        self.enter(SessionState::DetectingGaps)?;
        let batch_len = batch.len();
        let mut recon = ReconstructionState::new();
        let missing = detect_gaps(&mut recon, batch, self.config.max_missing)?;
        let gaps = missing.to_vec();

        let resends = if missing.is_empty() {
            ResendReport::default()
        } else {
            info!(missing = ?gaps, "gaps detected");
            self.enter(SessionState::AwaitingResends)?;
            recover(&mut self.exchange, &mut recon, missing, self.config.attempts, &self.cancel)?
        };

        let packets = recon.into_sorted();
        let summary = SessionSummary { batch_len, gaps, resends, packets: packets.len() };
        Ok((packets, summary))
    }

    fn enter(&mut self, next: SessionState) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(FeedError::Cancelled { state: self.state });
        }
        info!(from = %self.state, to = %next, "session transition");
        self.state = next;
        Ok(())
    }
}
