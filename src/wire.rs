//! Request frames and batch framing.
//!
//! A request is one tag byte followed by a tag-specific fixed payload:
//!
//! | tag | meaning | payload |
//! |---|---|---|
//! | 1 | stream all, batch ends when the server closes | none |
//! | 2 | resend one sequence | 1 byte |
//! | 3 | stream all, reply prefixed with a `u32` BE packet count | none |
//! | 4 | resend one sequence | 4 bytes, `i32` BE |
//!
//! Tags 1 and 2 are the original protocol. Tags 3 and 4 make the batch
//! boundary explicit and lift the 255 ceiling on resendable sequences.
use std::io::{self, Read};

use clap::ValueEnum;

use crate::error::{FeedError, Result};

pub mod tag {
    pub const STREAM_ALL: u8 = 1;
    pub const RESEND: u8 = 2;
    pub const STREAM_ALL_COUNTED: u8 = 3;
    pub const RESEND_WIDE: u8 = 4;
}

/// Length of the count prefix in front of a counted batch.
pub const COUNT_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    StreamAll,
    StreamAllCounted,
    Resend(i32),
}

impl Request {
    /// Encode using the shortest form that can carry the request.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Request::StreamAll => vec![tag::STREAM_ALL],
            Request::StreamAllCounted => vec![tag::STREAM_ALL_COUNTED],
            Request::Resend(seq) => match u8::try_from(seq) {
                Ok(b) => vec![tag::RESEND, b],
                Err(_) => {
                    let mut out = Vec::with_capacity(5);
                    out.push(tag::RESEND_WIDE);
                    out.extend_from_slice(&seq.to_be_bytes());
                    out
                }
            },
        }
    }

    /// Encode with the original one-byte resend form only.
    pub fn encode_compact(&self) -> Result<Vec<u8>> {
        match *self {
            Request::Resend(seq) if u8::try_from(seq).is_err() => {
                Err(FeedError::SequenceOutOfRange { sequence: seq })
            }
            Request::StreamAllCounted => Err(FeedError::UnknownRequest { tag: tag::STREAM_ALL_COUNTED }),
            _ => Ok(self.encode()),
        }
    }
}

/// Read one request from a byte stream. `Ok(None)` means the peer closed
/// cleanly between requests.
pub fn read_request<R: Read>(r: &mut R) -> Result<Option<Request>> {
    let mut t = [0u8; 1];
    match r.read_exact(&mut t) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let req = match t[0] {
        tag::STREAM_ALL => Request::StreamAll,
        tag::STREAM_ALL_COUNTED => Request::StreamAllCounted,
        tag::RESEND => {
            let mut b = [0u8; 1];
            r.read_exact(&mut b)?;
            Request::Resend(i32::from(b[0]))
        }
        tag::RESEND_WIDE => {
            let mut b = [0u8; 4];
            r.read_exact(&mut b)?;
            Request::Resend(i32::from_be_bytes(b))
        }
        other => return Err(FeedError::UnknownRequest { tag: other }),
    };
    Ok(Some(req))
}

/// How the end of the initial batch is recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum BatchFraming {
    /// Reply carries a packet count; the connection stays open for resends.
    #[default]
    Counted,
    /// Original behaviour: the batch ends when the server closes the stream.
    CloseDelimited,
}

impl BatchFraming {
    pub fn stream_request(self) -> Request {
        match self {
            BatchFraming::Counted => Request::StreamAllCounted,
            BatchFraming::CloseDelimited => Request::StreamAll,
        }
    }
}
