//! # SAM-BA client
//!
//! Typed memory-access primitives, remote `go`, chip-erase, checksum, and
//! buffer-write, plus capability discovery from the bootloader's version
//! banner, over the SAM-BA monitor's ASCII/binary wire protocol.

use crate::error::{Error, Result};
use crate::transport::{strip_crlf, timeout, SerialConnection, Transport};

/// Capabilities and quirks discovered from the bootloader's version
/// banner.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub can_chip_erase: bool,
    pub can_write_buffer: bool,
    pub can_checksum_buffer: bool,
    pub can_protect: bool,
    /// Read chunk size cap; 0 means unlimited (no USB quirk).
    pub read_buffer_size: usize,
}

/// Largest single read/write chunk used when no capability-driven cap
/// applies, chosen to stay well under typical SAM-BA command buffers.
const DEFAULT_CHUNK: usize = 4096;

/// Drives the SAM-BA ASCII/binary protocol over an already-framed
/// `Transport`.
pub struct SambaClient {
    transport: Transport,
    capabilities: Capabilities,
}

impl SambaClient {
    /// Opens a session: puts the bootloader in binary mode, reads its
    /// version banner, and parses capabilities out of it.
    pub fn new(mut transport: Transport) -> Result<Self> {
        set_binary_mode(&mut transport)?;
        let version = read_version_string(&mut transport)?;
        let capabilities = parse_capabilities(&version);
        log::info!("SAM-BA target: {version:?} capabilities={capabilities:?}");
        Ok(Self {
            transport,
            capabilities,
        })
    }

    /// Convenience constructor taking ownership of a raw connection.
    pub fn connect(connection: Box<dyn SerialConnection>) -> Result<Self> {
        Self::new(Transport::new(connection)?)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// `o<addr>,4` — reads a single byte.
    pub fn read_byte(&mut self, addr: u32) -> Result<u8> {
        self.transport.send_command(&format!("o{addr:08x},4"))?;
        let bytes = self.transport.read_buffer(timeout::NORMAL, Some(1))?;
        Ok(bytes[0])
    }

    /// `O<addr>,<val:2>` — writes a single byte.
    pub fn write_byte(&mut self, addr: u32, value: u8) -> Result<()> {
        self.transport.send_command(&format!("O{addr:08x},{value:02x}"))
    }

    /// `w<addr>,4` — reads a little-endian word.
    pub fn read_word(&mut self, addr: u32) -> Result<u32> {
        self.transport.send_command(&format!("w{addr:08x},4"))?;
        let bytes = self.transport.read_buffer(timeout::NORMAL, Some(4))?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// `W<addr>,<val:8>` — writes a word.
    pub fn write_word(&mut self, addr: u32, value: u32) -> Result<()> {
        self.transport.send_command(&format!("W{addr:08x},{value:08x}"))
    }

    /// `R<addr>,<size>` — reads a block of memory, applying the USB read
    /// quirk some SAM-BA USB CDC implementations need: when no explicit
    /// `readBufferSize` cap is in effect and the request is both `>32`
    /// bytes and a power of two, the first byte is split off into a
    /// `readByte` and the rest chunked as `R`; otherwise reads are chunked
    /// to `readBufferSize` (or, absent any cap, a generous internal
    /// default so huge reads still succeed in one logical call).
    pub fn read(&mut self, addr: u32, size: usize) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }

        if self.capabilities.read_buffer_size == 0 {
            if size > 32 && size.is_power_of_two() {
                let mut out = Vec::with_capacity(size);
                out.push(self.read_byte(addr)?);
                out.extend(self.read_chunked(addr.wrapping_add(1), size - 1, DEFAULT_CHUNK)?);
                return Ok(out);
            }
            return self.read_chunked(addr, size, DEFAULT_CHUNK);
        }

        self.read_chunked(addr, size, self.capabilities.read_buffer_size)
    }

    fn read_chunked(&mut self, addr: u32, size: usize, chunk_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size);
        let mut offset = 0usize;
        while offset < size {
            let this_chunk = (size - offset).min(chunk_size.max(1));
            out.extend(self.read_raw(addr.wrapping_add(offset as u32), this_chunk)?);
            offset += this_chunk;
        }
        Ok(out)
    }

    fn read_raw(&mut self, addr: u32, size: usize) -> Result<Vec<u8>> {
        self.transport.send_command(&format!("R{addr:08x},{size:x}"))?;
        self.transport.read_buffer(timeout::NORMAL, Some(size))
    }

    /// `S<addr>,<size>` + payload — writes a block of memory.
    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.transport.send_command(&format!("S{addr:08x},{:x}", data.len()))?;
        self.transport.send_payload(data)
    }

    /// `G<addr>` — executes at `addr`.
    pub fn go(&mut self, addr: u32) -> Result<()> {
        self.transport.send_command(&format!("G{addr:08x}"))
    }

    /// `X<addr>` — chip erase. Capability-gated by the caller (the NVM
    /// engine decides whether to use it based on the bootloader's
    /// advertised capabilities).
    pub fn chip_erase(&mut self, addr: u32) -> Result<()> {
        self.transport.send_command(&format!("X{addr:08x}"))?;
        let reply = self.transport.read_buffer(timeout::VERY_LONG, Some(3))?;
        expect_leading_byte(&reply, b'X')
    }

    /// `Y<src>,0` then `Y<dst>,<size>` — two-phase buffer write.
    pub fn write_buffer(&mut self, src: u32, dst: u32, size: u32) -> Result<()> {
        self.transport.send_command(&format!("Y{src:08x},0"))?;
        let reply = self.transport.read_buffer(timeout::NORMAL, Some(3))?;
        expect_leading_byte(&reply, b'Y')?;

        self.transport.send_command(&format!("Y{dst:08x},{size:x}"))?;
        let reply = self.transport.read_buffer(timeout::NORMAL, Some(3))?;
        expect_leading_byte(&reply, b'Y')
    }

    /// `Z<addr>,<size>` — CRC32 over a memory region, computed on-target.
    pub fn checksum_buffer(&mut self, addr: u32, size: u32) -> Result<u32> {
        self.transport.send_command(&format!("Z{addr:08x},{size:x}"))?;
        let reply = self.transport.read_buffer(timeout::NORMAL, Some(12))?;
        expect_leading_byte(&reply, b'Z')?;
        let hex = std::str::from_utf8(&reply[1..9])
            .map_err(|_| Error::ProtocolError("checksum reply was not valid UTF-8".into()))?;
        u32::from_str_radix(hex, 16)
            .map_err(|_| Error::ProtocolError(format!("malformed checksum reply: {reply:02x?}")))
    }
}

fn set_binary_mode(transport: &mut Transport) -> Result<()> {
    transport.send_command("N")?;
    transport.read_buffer(timeout::SHORT, Some(2))?;
    Ok(())
}

fn read_version_string(transport: &mut Transport) -> Result<String> {
    transport.send_command("V")?;
    let mut reply = transport.read_buffer(timeout::NORMAL, None)?;
    if reply.last() == Some(&0x00) {
        reply.pop();
    }
    let reply = strip_crlf(reply);
    String::from_utf8(reply).map_err(|_| Error::ProtocolError("version banner was not valid UTF-8".into()))
}

/// Parses `[Arduino:WXYZ]`-style capability markers out of a version
/// banner.
fn parse_capabilities(version: &str) -> Capabilities {
    let mut caps = Capabilities::default();
    if let Some(start) = version.find("[Arduino:") {
        let rest = &version[start + "[Arduino:".len()..];
        if let Some(end) = rest.find(']') {
            let flags = &rest[..end];
            caps.can_chip_erase = flags.contains('X');
            caps.can_write_buffer = flags.contains('Y');
            caps.can_checksum_buffer = flags.contains('Z');
            caps.can_protect = flags.contains('P');
            caps.read_buffer_size = 63;
        }
    }
    caps
}

fn expect_leading_byte(reply: &[u8], expected: u8) -> Result<()> {
    match reply.first() {
        Some(&b) if b == expected => Ok(()),
        Some(&b) => Err(Error::ProtocolError(format!(
            "expected reply starting with {expected:#04x?}, got {b:#04x?}"
        ))),
        None => Err(Error::ProtocolError("empty reply".into())),
    }
}
