//! # Transport
//!
//! Frames ASCII SAM-BA commands (optionally followed by a raw binary
//! payload) onto a serial byte stream, and collects replies off a
//! background reader thread with timeout tiers matching the kind of
//! operation in flight.
//!
//! All commands are strictly serialized: at most one is outstanding at a
//! time, and the next is not issued until the previous reply has been
//! consumed or timed out. There is no pipelining.

use crate::buffer::ByteFifo;
use crate::error::{Error, Result};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Command/response timeout tiers, scaled to how long each kind of
/// operation is expected to take on the target.
pub mod timeout {
    use std::time::Duration;

    /// Sync / no-op commands (e.g. setBinaryMode).
    pub const SHORT: Duration = Duration::from_millis(100);
    /// Ordinary memory access (byte/word/block read or write).
    pub const NORMAL: Duration = Duration::from_secs(1);
    /// A single region erase.
    pub const LONG: Duration = Duration::from_secs(5);
    /// Chip erase.
    pub const VERY_LONG: Duration = Duration::from_secs(300);
}

/// Quiet time observed before a binary payload follows a command.
const INTER_MESSAGE_DELAY: Duration = Duration::from_millis(50);

/// How often the foreground polls the shared input buffer while waiting on
/// `read_buffer`.
const POLL_INTERVAL: Duration = Duration::from_micros(500);

/// Command terminator byte.
const COMMAND_TERMINATOR: u8 = b'#';

/// Abstraction over a full-duplex byte stream, implemented for a boxed
/// `serialport::SerialPort` in normal use and by an in-memory mock in
/// tests. `try_clone_box` mirrors `serialport::SerialPort::try_clone`: it
/// gives the background reader its own handle onto the same underlying
/// connection.
pub trait SerialConnection: Read + Write + Send {
    /// Clones this connection, handle-style: reads/writes through the
    /// clone observe the same underlying stream.
    fn try_clone_box(&self) -> std::io::Result<Box<dyn SerialConnection>>;
}

impl SerialConnection for Box<dyn serialport::SerialPort> {
    fn try_clone_box(&self) -> std::io::Result<Box<dyn SerialConnection>> {
        Ok(Box::new(self.as_ref().try_clone()?))
    }
}

/// Serial port settings used at connect.
#[derive(Debug, Clone, Copy)]
pub struct PortConfig {
    pub baud_rate: u32,
    pub flow_control: bool,
    /// Hint for USB CDC devices with a small internal buffer; not to be
    /// confused with the SAM-BA client's capability-negotiated
    /// `readBufferSize` (see `samba::Capabilities`).
    pub usb_buffer_size: usize,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            baud_rate: 921_600,
            flow_control: true,
            usb_buffer_size: 63,
        }
    }
}

/// Frames commands onto a serial connection and collects replies.
pub struct Transport {
    writer: Box<dyn SerialConnection>,
    input: Arc<Mutex<ByteFifo>>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl Transport {
    /// Takes ownership of an already-open connection and starts the
    /// background reader thread. The serial port lifecycle (opening,
    /// closing, baud changes) beyond this byte-stream contract is the
    /// caller's responsibility.
    pub fn new(connection: Box<dyn SerialConnection>) -> Result<Self> {
        let reader_conn = connection.try_clone_box()?;
        let input = Arc::new(Mutex::new(ByteFifo::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let reader_input = Arc::clone(&input);
        let reader_stop = Arc::clone(&stop);
        let reader = std::thread::spawn(move || {
            read_loop(reader_conn, reader_input, reader_stop);
        });

        Ok(Self {
            writer: connection,
            input,
            stop,
            reader: Some(reader),
        })
    }

    /// Sends an ASCII command, terminated with `#`.
    pub fn send_command(&mut self, command: &str) -> Result<()> {
        log::debug!("-> {command}#");
        self.writer.write_all(command.as_bytes())?;
        self.writer.write_all(&[COMMAND_TERMINATOR])?;
        self.writer.flush()?;
        Ok(())
    }

    /// Sends a raw binary payload after the quiet time that follows a
    /// command.
    pub fn send_payload(&mut self, payload: &[u8]) -> Result<()> {
        std::thread::sleep(INTER_MESSAGE_DELAY);
        log::debug!("-> {} bytes of payload", payload.len());
        self.writer.write_all(payload)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Accumulates bytes from the background reader until either
    /// `expected_size` bytes have arrived, a trailing `0x00` appears after
    /// at least two bytes (used for CRLF-terminated ASCII replies, see
    /// `strip_crlf`), or `timeout` elapses.
    pub fn read_buffer(&mut self, timeout: Duration, expected_size: Option<usize>) -> Result<Vec<u8>> {
        let start = Instant::now();
        loop {
            {
                let mut input = self.input.lock().unwrap();
                if let Some(n) = expected_size {
                    if input.len() >= n {
                        return Ok(input.shift_n(n).expect("checked len above"));
                    }
                } else if input.len() >= 2 {
                    let view = input.view();
                    if *view.last().unwrap() == 0x00 {
                        let n = view.len();
                        return Ok(input.shift_n(n).expect("checked len above"));
                    }
                }
            }

            if start.elapsed() >= timeout {
                log::warn!("transport timed out after {timeout:?}");
                return Err(Error::TransportTimeout);
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

/// Continuously drains the connection's readable stream into the shared
/// input buffer. Exits when `stop` is set (transport drop/disconnect) or
/// the underlying read errors with anything other than a timeout.
fn read_loop(mut connection: Box<dyn SerialConnection>, input: Arc<Mutex<ByteFifo>>, stop: Arc<AtomicBool>) {
    let mut chunk = [0u8; 256];
    while !stop.load(Ordering::Relaxed) {
        match connection.read(&mut chunk) {
            Ok(0) => std::thread::sleep(POLL_INTERVAL),
            Ok(n) => {
                input.lock().unwrap().copy(&chunk[..n]);
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                continue;
            }
            Err(e) => {
                log::debug!("reader thread exiting: {e}");
                break;
            }
        }
    }
}

/// Strips a trailing CRLF from an ASCII reply: compares the trailing two
/// bytes and strips them only when they equal CR, LF.
pub fn strip_crlf(mut bytes: Vec<u8>) -> Vec<u8> {
    if bytes.len() >= 2 && bytes[bytes.len() - 2] == b'\r' && bytes[bytes.len() - 1] == b'\n' {
        bytes.truncate(bytes.len() - 2);
    }
    bytes
}

#[cfg(test)]
pub mod mock {
    //! In-memory `SerialConnection` used by transport and SAM-BA client
    //! tests. Cloning shares the same underlying queues, mirroring how
    //! `serialport::SerialPort::try_clone` hands the reader thread a
    //! second handle onto one real port.

    use super::SerialConnection;
    use std::collections::VecDeque;
    use std::io::{Read, Write};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct MockPort {
        pub to_host: Arc<Mutex<VecDeque<u8>>>,
        pub from_host: Arc<Mutex<Vec<u8>>>,
    }

    impl MockPort {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queues bytes as if the target had sent them.
        pub fn push_target_reply(&self, bytes: &[u8]) {
            self.to_host.lock().unwrap().extend(bytes.iter().copied());
        }

        /// Returns everything written by the host so far.
        pub fn sent(&self) -> Vec<u8> {
            self.from_host.lock().unwrap().clone()
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let mut queue = self.to_host.lock().unwrap();
            let n = buf.len().min(queue.len());
            for slot in buf.iter_mut().take(n) {
                *slot = queue.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.from_host.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SerialConnection for MockPort {
        fn try_clone_box(&self) -> std::io::Result<Box<dyn SerialConnection>> {
            Ok(Box::new(self.clone()))
        }
    }
}
