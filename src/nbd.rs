//! Minimal NBD client and the extent-copy transfer built on it.
//!
//! Speaks the fixed-newstyle handshake with `NBD_OPT_EXPORT_NAME` and simple
//! replies, which every `nbdkit` version accepts. Only reads are issued; the
//! exports are read-only.
//!
//! `extent_copy` is the incremental transfer: each extent is read from the
//! export and written at the same offset of the target, so copying an extent
//! twice leaves the same bytes as copying it once.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::fs::FileExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{MigrationError, Result};
use crate::types::Extent;

const NBDMAGIC: u64 = 0x4e42_444d_4147_4943; // "NBDMAGIC"
const IHAVEOPT: u64 = 0x4948_4156_454f_5054; // "IHAVEOPT"
const OLDSTYLE_MAGIC: u64 = 0x0000_4202_8186_1253;

const FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
const FLAG_NO_ZEROES: u16 = 1 << 1;
const CLIENT_FIXED_NEWSTYLE: u32 = 1 << 0;
const CLIENT_NO_ZEROES: u32 = 1 << 1;

const OPT_EXPORT_NAME: u32 = 1;

const REQUEST_MAGIC: u32 = 0x2560_9513;
const SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;
const CMD_READ: u16 = 0;
const CMD_DISC: u16 = 2;

/// Largest single read request
pub const MAX_READ: u32 = 32 * 1024 * 1024;

/// Where the export listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NbdAddress {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

/// `nbd://host:port[/export]` or `nbd+unix:///[export]?socket=PATH`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NbdUri {
    pub address: NbdAddress,
    pub export_name: String,
}

impl NbdUri {
    pub fn parse(uri: &str) -> Result<Self> {
        if let Some(rest) = uri.strip_prefix("nbd+unix://") {
            return Self::parse_unix(uri, rest);
        }
        let rest = uri
            .strip_prefix("nbd://")
            .ok_or_else(|| MigrationError::protocol(format!("unsupported URI '{}'", uri)))?;
        let (authority, export_name) = match rest.split_once('/') {
            Some((authority, name)) => (authority, name.to_string()),
            None => (rest, String::new()),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| MigrationError::protocol(format!("invalid port in '{}'", uri)))?;
                (host, port)
            }
            None => (authority, 10809),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(MigrationError::protocol(format!("missing host in '{}'", uri)));
        }
        Ok(Self {
            address: NbdAddress::Tcp {
                host: host.to_string(),
                port,
            },
            export_name,
        })
    }

    fn parse_unix(uri: &str, rest: &str) -> Result<Self> {
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        let export_name = path.strip_prefix('/').unwrap_or(path).to_string();
        let socket = query
            .split('&')
            .find_map(|pair| pair.strip_prefix("socket="))
            .filter(|socket| !socket.is_empty())
            .ok_or_else(|| MigrationError::protocol(format!("missing socket in '{}'", uri)))?;
        Ok(Self {
            address: NbdAddress::Unix(PathBuf::from(socket)),
            export_name,
        })
    }
}

/// Byte stream to the server.
enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

/// One connection to an NBD export.
pub struct NbdClient {
    stream: Transport,
    size: u64,
    next_handle: u64,
}

impl NbdClient {
    pub fn connect(uri: &NbdUri, timeout: Duration) -> Result<Self> {
        let stream = match &uri.address {
            NbdAddress::Tcp { host, port } => {
                let address = (host.as_str(), *port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| MigrationError::protocol(format!("cannot resolve {}", host)))?;
                let stream = TcpStream::connect_timeout(&address, timeout)?;
                stream.set_nodelay(true)?;
                Transport::Tcp(stream)
            }
            NbdAddress::Unix(path) => Transport::Unix(UnixStream::connect(path)?),
        };
        Self::handshake(stream, &uri.export_name)
    }

    fn handshake(mut stream: Transport, export_name: &str) -> Result<Self> {
        if read_u64(&mut stream)? != NBDMAGIC {
            return Err(MigrationError::protocol("bad server greeting"));
        }
        match read_u64(&mut stream)? {
            IHAVEOPT => {}
            OLDSTYLE_MAGIC => {
                return Err(MigrationError::protocol("oldstyle servers are not supported"));
            }
            other => {
                return Err(MigrationError::protocol(format!(
                    "unexpected handshake magic {:#x}",
                    other
                )));
            }
        }

        let server_flags = read_u16(&mut stream)?;
        let mut client_flags = 0u32;
        if server_flags & FLAG_FIXED_NEWSTYLE != 0 {
            client_flags |= CLIENT_FIXED_NEWSTYLE;
        }
        let no_zeroes = server_flags & FLAG_NO_ZEROES != 0;
        if no_zeroes {
            client_flags |= CLIENT_NO_ZEROES;
        }
        stream.write_all(&client_flags.to_be_bytes())?;

        let name = export_name.as_bytes();
        let mut option = Vec::with_capacity(16 + name.len());
        option.extend_from_slice(&IHAVEOPT.to_be_bytes());
        option.extend_from_slice(&OPT_EXPORT_NAME.to_be_bytes());
        option.extend_from_slice(&(name.len() as u32).to_be_bytes());
        option.extend_from_slice(name);
        stream.write_all(&option)?;

        let size = read_u64(&mut stream)?;
        let _transmission_flags = read_u16(&mut stream)?;
        if !no_zeroes {
            let mut zeroes = [0u8; 124];
            stream.read_exact(&mut zeroes)?;
        }

        Ok(Self {
            stream,
            size,
            next_handle: 1,
        })
    }

    /// Export size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Fill `buf` from `offset`. `buf` must not exceed `MAX_READ`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() as u64 > MAX_READ as u64 {
            return Err(MigrationError::protocol("read request too large"));
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.send_request(CMD_READ, handle, offset, buf.len() as u32)?;

        if read_u32(&mut self.stream)? != SIMPLE_REPLY_MAGIC {
            return Err(MigrationError::protocol("bad reply magic"));
        }
        let error = read_u32(&mut self.stream)?;
        let reply_handle = read_u64(&mut self.stream)?;
        if reply_handle != handle {
            return Err(MigrationError::protocol(format!(
                "reply for handle {} while waiting for {}",
                reply_handle, handle
            )));
        }
        if error != 0 {
            return Err(MigrationError::protocol(format!(
                "read of {} bytes at {} failed with error {}",
                buf.len(),
                offset,
                error
            )));
        }
        self.stream.read_exact(buf)?;
        Ok(())
    }

    /// Polite disconnect. The server sends no reply.
    pub fn disconnect(mut self) -> Result<()> {
        self.send_request(CMD_DISC, 0, 0, 0)?;
        Ok(())
    }

    fn send_request(&mut self, kind: u16, handle: u64, offset: u64, length: u32) -> Result<()> {
        let mut request = [0u8; 28];
        request[0..4].copy_from_slice(&REQUEST_MAGIC.to_be_bytes());
        request[4..6].copy_from_slice(&0u16.to_be_bytes());
        request[6..8].copy_from_slice(&kind.to_be_bytes());
        request[8..16].copy_from_slice(&handle.to_be_bytes());
        request[16..24].copy_from_slice(&offset.to_be_bytes());
        request[24..28].copy_from_slice(&length.to_be_bytes());
        self.stream.write_all(&request)?;
        Ok(())
    }
}

fn read_u16(r: &mut impl Read) -> Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

/// Copy `extents` from the export at `source` into `target` at the same
/// offsets, then flush the target. Returns the number of bytes written.
///
/// Progress is printed to stdout after each extent, thinned out to about a
/// hundred lines for long lists.
pub fn extent_copy(
    source: &str,
    target: &Path,
    extents: &[Extent],
    cancel: &CancelToken,
) -> Result<u64> {
    let uri = NbdUri::parse(source)?;
    let mut client = NbdClient::connect(&uri, Duration::from_secs(10))?;
    let size = client.size();
    if let Some(bad) = extents.iter().find(|e| e.end() > size) {
        return Err(MigrationError::protocol(format!(
            "extent {} lies beyond the {}-byte export",
            bad, size
        )));
    }

    let file = OpenOptions::new().write(true).open(target)?;
    let total: u64 = extents.iter().map(|e| e.length).sum();
    let mut buf = vec![0u8; MAX_READ.min(largest_chunk(extents)) as usize];
    let mut written = 0u64;

    let stdout = std::io::stdout();
    for (index, extent) in extents.iter().enumerate() {
        let mut offset = extent.offset;
        while offset < extent.end() {
            if cancel.is_cancelled() {
                return Err(MigrationError::cancelled("extent copy"));
            }
            let chunk = (extent.end() - offset).min(MAX_READ as u64) as usize;
            client.read_at(offset, &mut buf[..chunk])?;
            file.write_all_at(&buf[..chunk], offset)?;
            offset += chunk as u64;
            written += chunk as u64;
        }
        if !report_progress(index, extents.len()) {
            continue;
        }
        let mut out = stdout.lock();
        let _ = writeln!(
            out,
            "extent {}/{} {} done, {}/{} bytes",
            index + 1,
            extents.len(),
            extent,
            written,
            total
        );
    }

    file.sync_all()?;
    client.disconnect()?;
    Ok(written)
}

fn report_progress(index: usize, count: usize) -> bool {
    let step = (count / 100).max(1);
    (index + 1) % step == 0 || index + 1 == count
}

fn largest_chunk(extents: &[Extent]) -> u32 {
    extents
        .iter()
        .map(|e| e.length.min(MAX_READ as u64) as u32)
        .max()
        .unwrap_or(0)
}
