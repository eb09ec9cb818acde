//! Packet codec for the fixed 17-byte trade frame.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! [symbol:4 ascii][side:1][quantity:i32][price:i32][sequence:i32]
//! ```
//!
//! [`decode`] parses exactly one frame; [`frames`] walks a buffer holding
//! zero or more concatenated frames and reports residual bytes as
//! [`FeedError::TruncatedFrame`].
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{FeedError, Result};

/// Size of one packet frame on the wire.
pub const FRAME_LEN: usize = 17;

const OFF_SIDE: usize = 4;
const OFF_QTY: usize = 5;
const OFF_PRICE: usize = 9;
const OFF_SEQ: usize = 13;

/// Four-byte ASCII instrument identifier, space- or null-padded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol([u8; 4]);

impl Symbol {
    /// Build a symbol from up to four ASCII characters, space padding the rest.
    pub fn new(s: &str) -> Option<Self> {
        if s.len() > 4 || !s.is_ascii() {
            return None;
        }
        let mut raw = [b' '; 4];
        raw[..s.len()].copy_from_slice(s.as_bytes());
        Some(Self(raw))
    }

    pub fn from_bytes(raw: [u8; 4]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Symbol text with wire padding stripped.
    pub fn trimmed(&self) -> String {
        let end = self
            .0
            .iter()
            .rposition(|b| *b != b' ' && *b != 0)
            .map_or(0, |i| i + 1);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.trimmed())
    }
}

impl Serialize for Symbol {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.trimmed())
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Symbol::new(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid symbol {s:?}")))
    }
}

/// Trade direction. `Resend` only appears on synthetic filler frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "B")]
    Buy,
    #[serde(rename = "S")]
    Sell,
    #[serde(rename = "R")]
    Resend,
}

impl Side {
    pub fn to_byte(self) -> u8 {
        match self {
            Side::Buy => b'B',
            Side::Sell => b'S',
            Side::Resend => b'R',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            b'B' => Ok(Side::Buy),
            b'S' => Ok(Side::Sell),
            b'R' => Ok(Side::Resend),
            _ => Err(FeedError::InvalidSide { byte }),
        }
    }
}

/// One trade event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: i32,
    /// Server-defined fixed-point unit.
    pub price: i32,
    pub sequence: i32,
}

impl Packet {
    /// Filler the exchange returns when it cannot regenerate a sequence.
    /// Only `sequence` is meaningful.
    pub fn filler(symbol: Symbol, sequence: i32) -> Self {
        Self { symbol, side: Side::Resend, quantity: 0, price: 0, sequence }
    }

    pub fn is_filler(&self) -> bool {
        self.side == Side::Resend
    }
}

/// Serialise a packet into its 17-byte frame.
pub fn encode(p: &Packet) -> [u8; FRAME_LEN] {
    let mut buf = [0u8; FRAME_LEN];
    buf[..OFF_SIDE].copy_from_slice(p.symbol.as_bytes());
    buf[OFF_SIDE] = p.side.to_byte();
    buf[OFF_QTY..OFF_PRICE].copy_from_slice(&p.quantity.to_be_bytes());
    buf[OFF_PRICE..OFF_SEQ].copy_from_slice(&p.price.to_be_bytes());
    buf[OFF_SEQ..FRAME_LEN].copy_from_slice(&p.sequence.to_be_bytes());
    buf
}

/// Parse one frame from the start of `bytes`. Bytes past the first frame are ignored.
pub fn decode(bytes: &[u8]) -> Result<Packet> {
    if bytes.len() < FRAME_LEN {
        return Err(FeedError::MalformedFrame { expected: FRAME_LEN, got: bytes.len() });
    }
    let read_i32 = |off: usize| {
        let mut tmp = [0u8; 4];
        tmp.copy_from_slice(&bytes[off..off + 4]);
        i32::from_be_bytes(tmp)
    };
    let mut symbol = [0u8; 4];
    symbol.copy_from_slice(&bytes[..OFF_SIDE]);
    if !symbol.is_ascii() {
        return Err(FeedError::InvalidSymbol { bytes: symbol });
    }
    Ok(Packet {
        symbol: Symbol::from_bytes(symbol),
        side: Side::from_byte(bytes[OFF_SIDE])?,
        quantity: read_i32(OFF_QTY),
        price: read_i32(OFF_PRICE),
        sequence: read_i32(OFF_SEQ),
    })
}

/// Lazy iterator over concatenated frames. Cloning restarts from the
/// position the clone was taken at; [`frames`] always starts at offset 0.
#[derive(Debug, Clone)]
pub struct Frames<'a> {
    buf: &'a [u8],
    off: usize,
    done: bool,
}

pub fn frames(buf: &[u8]) -> Frames<'_> {
    Frames { buf, off: 0, done: false }
}

impl Iterator for Frames<'_> {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let rest = &self.buf[self.off..];
        if rest.is_empty() {
            self.done = true;
            return None;
        }
        if rest.len() < FRAME_LEN {
            self.done = true;
            return Some(Err(FeedError::TruncatedFrame { residual: rest.len() }));
        }
        self.off += FRAME_LEN;
        let item = decode(rest);
        if item.is_err() {
            self.done = true;
        }
        Some(item)
    }
}

/// Decode a whole buffer, failing on the first bad frame or on residual bytes.
pub fn decode_all(buf: &[u8]) -> Result<Vec<Packet>> {
    frames(buf).collect()
}
