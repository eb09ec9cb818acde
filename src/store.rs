//! Durable output of a completed session.
//!
//! Two formats:
//! - `json`: pretty-printed array of packets, ascending by sequence
//! - `capture`: length/CRC framed bincode records, a [`CaptureHeader`]
//!   followed by one frame per packet
//!
//! Both are written to a hidden sibling file first and renamed into place,
//! so a failed write never leaves a partial artifact under the final name.
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use clap::ValueEnum;
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FeedError, Result};
use crate::packet::Packet;

pub const CAPTURE_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureHeader {
    pub version: u16,
    pub created_unix_ns: u128,
    pub packets: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecordFrame {
    Header(CaptureHeader),
    Packet(Packet),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Capture,
}

/// Where and how the reconstructed set is written.
#[derive(Debug, Clone)]
pub struct Output {
    pub path: PathBuf,
    pub format: OutputFormat,
}

impl Output {
    /// `format` wins when given; otherwise a `.bin` extension means capture.
    pub fn new(path: impl Into<PathBuf>, format: Option<OutputFormat>) -> Self {
        let path = path.into();
        let format = format.unwrap_or_else(|| match path.extension().and_then(|e| e.to_str()) {
            Some("bin") => OutputFormat::Capture,
            _ => OutputFormat::Json,
        });
        Self { path, format }
    }

    /// Write `packets`, which must already be sorted by sequence.
    pub fn persist(&self, packets: &[Packet]) -> Result<()> {
        let tmp = partial_path(&self.path);
        let written = self.write_to(&tmp, packets).and_then(|()| fs::rename(&tmp, &self.path));
        if let Err(source) = written {
            let _ = fs::remove_file(&tmp);
            return Err(FeedError::Persist { path: self.path.clone(), source });
        }
        info!(path = %self.path.display(), format = ?self.format, packets = packets.len(), "output saved");
        Ok(())
    }

    fn write_to(&self, tmp: &Path, packets: &[Packet]) -> io::Result<()> {
        if let Some(parent) = tmp.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(tmp)?;
        let mut w = BufWriter::with_capacity(1 << 16, file);
        match self.format {
            OutputFormat::Json => {
                serde_json::to_writer_pretty(&mut w, packets)?;
                w.write_all(b"\n")?;
            }
            OutputFormat::Capture => {
                write_frame(&mut w, &RecordFrame::Header(CaptureHeader {
                    version: CAPTURE_VERSION,
                    created_unix_ns: now_unix_ns(),
                    packets: packets.len() as u64,
                }))?;
                for p in packets {
                    write_frame(&mut w, &RecordFrame::Packet(p.clone()))?;
                }
            }
        }
        w.flush()?;
        w.get_ref().sync_all()?;
        Ok(())
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!(".{name}.partial"))
}

fn now_unix_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// `captures/trades_YYYY_MM_DD.json`, dated from the local clock when the
/// offset is known, UTC otherwise.
pub fn default_output_path() -> PathBuf {
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    let d = now.date();
    let mut p = PathBuf::from("captures");
    p.push(format!("trades_{}_{:02}_{:02}.json", d.year(), d.month() as u8, d.day()));
    p
}

/// `[len:u32 LE][crc32:u32 LE][bincode payload]`
pub fn write_frame<W: Write>(w: &mut W, frame: &RecordFrame) -> io::Result<()> {
    let payload = bincode::serialize(frame).map_err(io::Error::other)?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let len = payload.len() as u32;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(&payload)?;
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Read the next frame, `None` at a clean end of file.
pub fn read_frame<R: Read>(r: &mut R, index: usize) -> anyhow::Result<Option<RecordFrame>> {
    let len = match read_u32(r) {
        Ok(v) => v as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let crc_on_file = read_u32(r).with_context(|| format!("frame {index}: crc"))?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).with_context(|| format!("frame {index}: payload"))?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc_calc = hasher.finalize();
    if crc_calc != crc_on_file {
        bail!("CRC mismatch at frame {index}: file={crc_on_file:#x}, calc={crc_calc:#x}");
    }
    let frame = bincode::deserialize(&payload).context("bincode decode")?;
    Ok(Some(frame))
}

/// Load a capture written by [`Output::persist`].
pub fn read_capture(path: &Path) -> anyhow::Result<(CaptureHeader, Vec<Packet>)> {
    let mut r = BufReader::new(File::open(path).with_context(|| format!("open {path:?}"))?);
    let header = match read_frame(&mut r, 0)? {
        Some(RecordFrame::Header(h)) => h,
        Some(RecordFrame::Packet(_)) => bail!("capture does not start with a header"),
        None => bail!("empty capture"),
    };
    if header.version != CAPTURE_VERSION {
        bail!("unsupported capture version {}", header.version);
    }
    let mut packets = Vec::with_capacity(header.packets as usize);
    let mut index = 1;
    while let Some(frame) = read_frame(&mut r, index)? {
        match frame {
            RecordFrame::Packet(p) => packets.push(p),
            RecordFrame::Header(_) => bail!("unexpected header at frame {index}"),
        }
        index += 1;
    }
    if packets.len() as u64 != header.packets {
        bail!("capture holds {} packets, header says {}", packets.len(), header.packets);
    }
    Ok((header, packets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Side, Symbol};

    fn pkts(n: i32) -> Vec<Packet> {
        (1..=n)
            .map(|s| Packet { symbol: Symbol::new("SYMB").unwrap(), side: Side::Sell, quantity: s, price: 10 * s, sequence: s })
            .collect()
    }

    #[test]
    fn format_inferred_from_extension() {
        assert_eq!(Output::new("a/b.bin", None).format, OutputFormat::Capture);
        assert_eq!(Output::new("a/b.json", None).format, OutputFormat::Json);
        assert_eq!(Output::new("a/b.bin", Some(OutputFormat::Json)).format, OutputFormat::Json);
    }

    #[test]
    fn json_written_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let out = Output::new(dir.path().join("nested/out.json"), None);
        out.persist(&pkts(3)).unwrap();
        let text = fs::read_to_string(&out.path).unwrap();
        let back: Vec<Packet> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, pkts(3));
        assert!(!partial_path(&out.path).exists());
    }

    #[test]
    fn empty_set_is_empty_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let out = Output::new(dir.path().join("out.json"), None);
        out.persist(&[]).unwrap();
        let back: Vec<Packet> = serde_json::from_str(&fs::read_to_string(&out.path).unwrap()).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn capture_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let out = Output::new(dir.path().join("out.bin"), None);
        out.persist(&pkts(4)).unwrap();
        let (header, back) = read_capture(&out.path).unwrap();
        assert_eq!(header.version, CAPTURE_VERSION);
        assert_eq!(header.packets, 4);
        assert_eq!(back, pkts(4));
    }

    #[test]
    fn corrupted_capture_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let out = Output::new(dir.path().join("out.bin"), None);
        out.persist(&pkts(2)).unwrap();
        let mut bytes = fs::read(&out.path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&out.path, bytes).unwrap();
        let err = read_capture(&out.path).unwrap_err();
        assert!(format!("{err:#}").contains("CRC mismatch"));
    }

    #[test]
    fn failed_write_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        // the parent "directory" is a regular file, so creating it fails
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();
        let out = Output::new(blocker.join("out.json"), None);
        match out.persist(&pkts(1)) {
            Err(FeedError::Persist { path, source }) => {
                assert_eq!(path, out.path);
                // the OS error survives instead of being flattened to text
                assert!(source.raw_os_error().is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!out.path.exists());
    }

    #[test]
    fn default_path_is_dated_json() {
        let p = default_output_path();
        assert!(p.starts_with("captures"));
        let name = p.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("trades_") && name.ends_with(".json"));
    }
}
