//! Resend orchestration.
//!
//! Resends are issued one at a time on the session's connection. Each pass
//! asks once for every still-missing sequence; a sequence is retried on the
//! next pass until the attempt budget runs out.
use tracing::{debug, info, warn};

use crate::error::{FeedError, Result};
use crate::exchange::Exchange;
use crate::gap::{MissingSet, ReconstructionState};
use crate::packet::decode;
use crate::session::{CancelToken, SessionState};

/// Attempts per missing sequence used when nothing else is configured:
/// the first request plus one retry.
pub const DEFAULT_ATTEMPTS: u32 = 2;

/// Counters from one recovery run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResendReport {
    /// Resend requests written to the exchange.
    pub requests: usize,
    /// Replies whose sequence matched the request.
    pub answered: usize,
    /// Replies carrying some other sequence. Recorded under their own
    /// sequence; the request that produced them stays outstanding.
    pub strays: usize,
    /// Requests that timed out without a reply.
    pub timeouts: usize,
    /// Replies flagged as synthetic filler by the exchange.
    pub fillers: usize,
}

/// Drive resends until `missing` is empty or every sequence has used
/// `attempts` requests.
pub fn recover<E>(
    exchange: &mut E,
    state: &mut ReconstructionState,
    mut missing: MissingSet,
    attempts: u32,
    cancel: &CancelToken,
) -> Result<ResendReport>
where
    E: Exchange + ?Sized,
{
    let mut report = ResendReport::default();
    for attempt in 1..=attempts.max(1) {
        if missing.is_empty() {
            break;
        }
        info!(attempt, missing = ?missing.to_vec(), "requesting resends");
        for seq in missing.to_vec() {
            if cancel.is_cancelled() {
                return Err(FeedError::Cancelled { state: SessionState::AwaitingResends });
            }
            if state.contains(seq) {
                continue;
            }
            report.requests += 1;
            let frame = match exchange.resend(seq) {
                Ok(f) => f,
                // the exchange drops a connection that timed out mid-frame, so the retry starts clean
                Err(e) if e.is_timeout() => {
                    warn!(sequence = seq, attempt, "resend timed out");
                    report.timeouts += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let reply = decode(&frame)?;
            if reply.is_filler() {
                report.fillers += 1;
                debug!(sequence = reply.sequence, "exchange sent filler for resend");
            }
            if reply.sequence == seq {
                report.answered += 1;
            } else {
                report.strays += 1;
                warn!(requested = seq, got = reply.sequence, "resend reply for a different sequence");
            }
            state.insert(reply);
        }
        // a stray settles nothing unless its own sequence was missing too
        missing.retain_absent(state);
    }
    if missing.is_empty() {
        info!(requests = report.requests, "recovery complete");
        Ok(report)
    } else {
        Err(FeedError::RecoveryIncomplete { missing: missing.to_vec() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{encode, Packet, Side, Symbol, FRAME_LEN};
    use std::collections::HashMap;
    use std::io;

    /// Answers resends from a table; absent entries time out.
    struct Scripted {
        replies: HashMap<i32, Vec<Packet>>,
        asked: Vec<i32>,
    }

    impl Scripted {
        fn new(replies: &[(i32, i32)]) -> Self {
            let mut map: HashMap<i32, Vec<Packet>> = HashMap::new();
            for &(req, reply_seq) in replies {
                map.entry(req).or_default().push(pkt(reply_seq));
            }
            Self { replies: map, asked: Vec::new() }
        }
    }

    impl Exchange for Scripted {
        fn stream_all(&mut self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn resend(&mut self, sequence: i32) -> Result<[u8; FRAME_LEN]> {
            self.asked.push(sequence);
            match self.replies.get_mut(&sequence).and_then(|v| (!v.is_empty()).then(|| v.remove(0))) {
                Some(p) => Ok(encode(&p)),
                None => Err(io::Error::from(io::ErrorKind::TimedOut).into()),
            }
        }
    }

    fn pkt(seq: i32) -> Packet {
        Packet { symbol: Symbol::new("SYMB").unwrap(), side: Side::Sell, quantity: 5, price: 7, sequence: seq }
    }

    fn state_with(seqs: &[i32]) -> ReconstructionState {
        let mut st = ReconstructionState::new();
        for &s in seqs {
            st.insert(pkt(s));
        }
        st
    }

    #[test]
    fn one_request_per_missing_sequence() {
        let mut st = state_with(&[1, 4, 6]);
        let mut ex = Scripted::new(&[(2, 2), (3, 3), (5, 5)]);
        let missing = st.missing();
        let report = recover(&mut ex, &mut st, missing, DEFAULT_ATTEMPTS, &CancelToken::new()).unwrap();
        assert_eq!(ex.asked, vec![2, 3, 5]);
        assert_eq!(report.requests, 3);
        assert_eq!(report.answered, 3);
        assert_eq!(st.max_contiguous(), 6);
    }

    #[test]
    fn timeout_is_retried_once() {
        let mut st = state_with(&[1, 3]);
        let mut ex = Scripted::new(&[]);
        let missing = st.missing();
        let err = recover(&mut ex, &mut st, missing, 2, &CancelToken::new()).unwrap_err();
        assert_eq!(ex.asked, vec![2, 2]);
        match err {
            FeedError::RecoveryIncomplete { missing } => assert_eq!(missing, vec![2]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn retry_succeeds_after_timeout() {
        let mut st = state_with(&[1, 3]);
        let mut ex = Scripted::new(&[]);
        let missing = st.missing();
        // first ask times out, then the exchange learns the answer
        let first = recover(&mut ex, &mut st, missing.clone(), 1, &CancelToken::new());
        assert!(first.is_err());
        ex.replies.insert(2, vec![pkt(2)]);
        let report = recover(&mut ex, &mut st, missing, 1, &CancelToken::new()).unwrap();
        assert_eq!(report.timeouts, 0);
        assert!(st.missing().is_empty());
    }

    #[test]
    fn stray_reply_is_recorded_but_request_stays_open() {
        let mut st = state_with(&[1, 2, 4, 5]);
        let mut ex = Scripted::new(&[(3, 9), (3, 9)]);
        let missing = st.missing();
        let err = recover(&mut ex, &mut st, missing, 2, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, FeedError::RecoveryIncomplete { ref missing } if missing == &vec![3]));
        assert!(st.contains(9));
        assert!(!st.contains(3));
        assert_eq!(ex.asked, vec![3, 3]);
    }

    #[test]
    fn cancelled_before_first_request() {
        let mut st = state_with(&[2]);
        let mut ex = Scripted::new(&[(1, 1)]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let missing = st.missing();
        let err = recover(&mut ex, &mut st, missing, 2, &cancel).unwrap_err();
        assert!(matches!(err, FeedError::Cancelled { state: SessionState::AwaitingResends }));
        assert!(ex.asked.is_empty());
    }

    #[test]
    fn transport_error_aborts() {
        struct Reset;
        impl Exchange for Reset {
            fn stream_all(&mut self) -> Result<Vec<u8>> {
                Ok(Vec::new())
            }
            fn resend(&mut self, _: i32) -> Result<[u8; FRAME_LEN]> {
                Err(io::Error::from(io::ErrorKind::ConnectionReset).into())
            }
        }
        let mut st = state_with(&[3]);
        let missing = st.missing();
        let err = recover(&mut Reset, &mut st, missing, 2, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, FeedError::Transport(_)));
    }
}
