//! The exchange side of the protocol.
//!
//! [`Exchange`] is the seam the session talks through: ask for the whole
//! stream, ask for one sequence. [`TcpExchange`] implements it over a TCP
//! connection; [`ExchangeServer`] is the matching server that produces the
//! reference tape and answers resends.
use std::io::{BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::error::{FeedError, Result};
use crate::packet::{encode, Packet, Side, Symbol, FRAME_LEN};
use crate::wire::{read_request, BatchFraming, Request, COUNT_LEN};

/// Request/response contract of the exchange.
pub trait Exchange {
    /// Ask for the whole stream; returns the raw bytes of the batch.
    fn stream_all(&mut self) -> Result<Vec<u8>>;

    /// Ask for one sequence; returns the single reply frame.
    fn resend(&mut self, sequence: i32) -> Result<[u8; FRAME_LEN]>;

    /// Release the connection. Further calls may reconnect.
    fn close(&mut self) {}
}

/// TCP client end of the protocol.
pub struct TcpExchange {
    addr: SocketAddr,
    framing: BatchFraming,
    read_timeout: Option<Duration>,
    stream: Option<TcpStream>,
}

impl TcpExchange {
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        framing: BatchFraming,
        read_timeout: Option<Duration>,
    ) -> Result<Self> {
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            FeedError::Transport(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "address resolved to nothing",
            ))
        })?;
        let mut this = Self { addr, framing, read_timeout, stream: None };
        this.stream()?;
        Ok(this)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        let s = match self.stream.take() {
            Some(s) => s,
            None => {
                let s = TcpStream::connect(self.addr)?;
                s.set_read_timeout(self.read_timeout)?;
                s.set_nodelay(true)?;
                debug!(peer = %self.addr, "connected to exchange");
                s
            }
        };
        Ok(self.stream.insert(s))
    }

    fn send(&mut self, req: Request) -> Result<()> {
        let bytes = match self.framing {
            BatchFraming::Counted => req.encode(),
            BatchFraming::CloseDelimited => req.encode_compact()?,
        };
        self.stream()?.write_all(&bytes)?;
        Ok(())
    }
}

impl Exchange for TcpExchange {
    fn stream_all(&mut self) -> Result<Vec<u8>> {
        self.send(self.framing.stream_request())?;
        let mut buf = Vec::new();
        match self.framing {
            BatchFraming::Counted => {
                let s = self.stream()?;
                let mut count = [0u8; COUNT_LEN];
                s.read_exact(&mut count)?;
                let want = u64::from(u32::from_be_bytes(count)) * FRAME_LEN as u64;
                Read::by_ref(s).take(want).read_to_end(&mut buf)?;
                if (buf.len() as u64) < want {
                    return Err(FeedError::Transport(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("batch cut short: {} of {want} bytes", buf.len()),
                    )));
                }
            }
            BatchFraming::CloseDelimited => {
                self.stream()?.read_to_end(&mut buf)?;
                // the server is gone; resends go over a fresh connection
                self.stream = None;
            }
        }
        Ok(buf)
    }

    fn resend(&mut self, sequence: i32) -> Result<[u8; FRAME_LEN]> {
        self.send(Request::Resend(sequence))?;
        let mut frame = [0u8; FRAME_LEN];
        if let Err(e) = self.stream()?.read_exact(&mut frame) {
            // part of a frame may already be consumed; the next request
            // needs a connection that starts on a frame boundary
            self.close();
            return Err(e.into());
        }
        Ok(frame)
    }

    fn close(&mut self) {
        if let Some(s) = self.stream.take() {
            let _ = s.shutdown(Shutdown::Both);
        }
    }
}

/// What the exchange server streams.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Number of packets on the tape, sequences `1..=packets`.
    pub packets: usize,
    pub symbol: Symbol,
    /// Sequences withheld from every stream-all batch, to simulate loss.
    pub drop: Vec<i32>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self { packets: 5, symbol: Symbol::from_bytes(*b"SYMB"), drop: Vec::new() }
    }
}

/// Largest tape whose quantity and price fields still fit in an `i32`.
pub const MAX_TAPE_PACKETS: usize = ((i32::MAX - 1000) / 100) as usize;

impl ExchangeConfig {
    /// Reject tapes whose sequence, quantity or price would overflow.
    pub fn validate(&self) -> Result<()> {
        if self.packets > MAX_TAPE_PACKETS {
            return Err(FeedError::InvalidConfig(format!(
                "{} packets, at most {MAX_TAPE_PACKETS} fit the frame fields",
                self.packets
            )));
        }
        Ok(())
    }

    /// The full tape: alternating buy/sell, quantity `100+i`, price `1000+100*i`.
    pub fn tape(&self) -> Vec<Packet> {
        let last = i32::try_from(self.packets.min(MAX_TAPE_PACKETS)).unwrap_or(0);
        (1..=last).map(|seq| self.packet_at(seq)).collect()
    }

    fn packet_at(&self, sequence: i32) -> Packet {
        let i = sequence - 1;
        Packet {
            symbol: self.symbol,
            side: if i % 2 == 0 { Side::Buy } else { Side::Sell },
            quantity: 100 + i,
            price: 1000 + i * 100,
            sequence,
        }
    }

    /// Reply to a resend: the packet from the tape, or filler when the
    /// sequence was never on it.
    pub fn resend_reply(&self, sequence: i32) -> Packet {
        let on_tape = usize::try_from(sequence)
            .is_ok_and(|s| (1..=self.packets.min(MAX_TAPE_PACKETS)).contains(&s));
        if on_tape {
            self.packet_at(sequence)
        } else {
            Packet::filler(self.symbol, sequence)
        }
    }

    fn batch(&self) -> Vec<Packet> {
        self.tape()
            .into_iter()
            .filter(|p| !self.drop.contains(&p.sequence))
            .collect()
    }
}

/// Blocking TCP exchange server, one thread per connection.
pub struct ExchangeServer {
    listener: TcpListener,
    config: Arc<ExchangeConfig>,
    tap: Option<Sender<Request>>,
}

impl ExchangeServer {
    pub fn bind<A: ToSocketAddrs>(addr: A, config: ExchangeConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(addr)?;
        Ok(Self { listener, config: Arc::new(config), tap: None })
    }

    /// Publish every decoded request on `tap`. A full channel drops requests.
    pub fn with_tap(mut self, tap: Sender<Request>) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails.
    pub fn serve(self) -> Result<()> {
        info!(addr = %self.local_addr()?, packets = self.config.packets, "exchange listening");
        for conn in self.listener.incoming() {
            let stream = match conn {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let config = Arc::clone(&self.config);
            let tap = self.tap.clone();
            std::thread::spawn(move || {
                let peer = stream.peer_addr().ok();
                info!(?peer, "client connected");
                match handle_connection(stream, &config, tap.as_ref()) {
                    Ok(()) => info!(?peer, "client disconnected"),
                    Err(e) => warn!(?peer, error = %e, "connection error"),
                }
            });
        }
        Ok(())
    }

    /// Run [`serve`](Self::serve) on a background thread and return the bound address.
    pub fn spawn(self) -> Result<SocketAddr> {
        let addr = self.local_addr()?;
        std::thread::spawn(move || {
            if let Err(e) = self.serve() {
                warn!(error = %e, "exchange stopped");
            }
        });
        Ok(addr)
    }
}

fn handle_connection(
    mut stream: TcpStream,
    config: &ExchangeConfig,
    tap: Option<&Sender<Request>>,
) -> Result<()> {
    let mut reader = stream.try_clone()?;
    while let Some(req) = read_request(&mut reader)? {
        debug!(?req, "request");
        if let Some(tap) = tap {
            if let Err(TrySendError::Full(_)) = tap.try_send(req) {
                debug!("request tap full");
            }
        }
        match req {
            Request::StreamAll => {
                write_batch(&mut stream, &config.batch(), false)?;
                stream.shutdown(Shutdown::Write)?;
                return Ok(());
            }
            Request::StreamAllCounted => write_batch(&mut stream, &config.batch(), true)?,
            Request::Resend(seq) => {
                let reply = config.resend_reply(seq);
                stream.write_all(&encode(&reply))?;
            }
        }
    }
    Ok(())
}

fn write_batch(stream: &mut TcpStream, batch: &[Packet], counted: bool) -> Result<()> {
    let mut w = BufWriter::new(stream);
    if counted {
        let count = u32::try_from(batch.len())
            .map_err(|_| FeedError::InvalidConfig(format!("batch of {} packets", batch.len())))?;
        w.write_all(&count.to_be_bytes())?;
    }
    for p in batch {
        w.write_all(&encode(p))?;
    }
    w.flush()?;
    Ok(())
}
