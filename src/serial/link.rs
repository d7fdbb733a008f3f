//! Line-oriented channel over a serial port
//!
//! Control messages travel as `\n`-terminated ASCII lines, payloads as raw
//! bytes. The port is expected to have a read timeout configured; a timeout
//! surfaces as "no data" rather than as an error.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Pause between polls when the port reports end-of-stream
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Longest accepted protocol line
const MAX_LINE_LEN: usize = 4096;

/// Read size for fixed-length payloads
const PAYLOAD_BLOCK: usize = 4096;

/// Returns true for the error kinds a port uses to report a read timeout
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// A serial link carrying protocol lines and raw payload bytes
pub struct Link<P> {
    port: P,
    /// Bytes of a line whose terminator has not arrived yet
    pending: Vec<u8>,
    /// Skipping the rest of an oversize line
    discarding: bool,
}

impl<P: Read + Write> Link<P> {
    /// Wrap an opened port
    pub fn new(port: P) -> Self {
        Self {
            port,
            pending: Vec::new(),
            discarding: false,
        }
    }

    #[cfg(test)]
    fn get_ref(&self) -> &P {
        &self.port
    }

    /// Read one line, without its terminator and surrounding whitespace.
    ///
    /// Returns `Ok(None)` when the port times out before a full line is
    /// available. Partial lines are kept and completed by later calls.
    /// Lines that are not valid UTF-8 are dropped.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut byte = [0u8; 1];

        loop {
            match self.port.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    if byte[0] == b'\n' {
                        if self.discarding {
                            self.discarding = false;
                            return Ok(None);
                        }
                        break;
                    }
                    if self.discarding {
                        continue;
                    }
                    self.pending.push(byte[0]);
                    if self.pending.len() > MAX_LINE_LEN {
                        let dropped = std::mem::take(&mut self.pending);
                        self.discarding = true;
                        log::debug!("Dropping line longer than {} bytes:", MAX_LINE_LEN);
                        for row in hexdump::hexdump_iter(&dropped[..64]) {
                            log::debug!("  {}", row);
                        }
                        return Ok(None);
                    }
                }
                Err(ref e) if is_timeout(e) => return Ok(None),
                Err(e) => return Err(e),
            }
        }

        let raw = std::mem::take(&mut self.pending);
        match String::from_utf8(raw) {
            Ok(line) => Ok(Some(line.trim().to_string())),
            Err(e) => {
                log::debug!("Dropping undecodable line:");
                for row in hexdump::hexdump_iter(e.as_bytes()) {
                    log::debug!("  {}", row);
                }
                Ok(None)
            }
        }
    }

    /// Read a line, polling until one arrives or `timeout` elapses
    pub fn read_line_within(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.read_line()? {
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Read at least one payload byte into `buf`.
    ///
    /// Fails with `TimedOut` if nothing arrives for `idle`.
    pub fn read_chunk(&mut self, buf: &mut [u8], idle: Duration) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }

        let started = Instant::now();
        loop {
            match self.port.read(buf) {
                Ok(0) => std::thread::sleep(IDLE_POLL),
                Ok(n) => return Ok(n),
                Err(ref e) if is_timeout(e) => {}
                Err(e) => return Err(e),
            }

            if started.elapsed() >= idle {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no data received for {:?}", idle),
                ));
            }
        }
    }

    /// Read exactly `len` payload bytes.
    ///
    /// The buffer grows as data arrives, so `len` is never allocated up front.
    pub fn read_exact_within(&mut self, len: usize, idle: Duration) -> io::Result<Vec<u8>> {
        let mut data = Vec::with_capacity(len.min(PAYLOAD_BLOCK));
        let mut block = [0u8; PAYLOAD_BLOCK];
        while data.len() < len {
            let want = (len - data.len()).min(block.len());
            let n = self.read_chunk(&mut block[..want], idle)?;
            data.extend_from_slice(&block[..n]);
        }
        Ok(data)
    }

    /// Write a protocol line, appending the terminator
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line.as_bytes());
        framed.push(b'\n');
        self.port.write_all(&framed)?;
        self.port.flush()
    }

    /// Write raw payload bytes
    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)
    }

    /// Flush output buffer
    pub fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}
