//! The byte-queue adapter: the only place raw bytes cross the TLS boundary
//! (spec.md §4.1). Presents the encrypted input buffer and the per-session
//! output buffer/pool to the TLS engine through a minimal read/write
//! surface, and carries the renegotiation detector described in spec.md §9
//! ("Renegotiation detection via re-entry flag").

use crate::buffer::{Buffer, Pool, PoolSlice, Prototype};
use crate::error::SocketError;
use std::io;

/// A re-entry token scoped to one `decode_ssl_input` call (spec.md §9:
/// "replace the raw pointer-to-stack-int trick with a per-call re-entry
/// token scoped to the read invocation"). While armed, any write the
/// engine performs against the byte-queue adapter is rejected and flags
/// the session as having observed a renegotiation attempt (spec.md §4.1,
/// §8 property 3).
#[derive(Default)]
pub struct RenegotiationToken {
    armed: bool,
    fired: bool,
}

impl RenegotiationToken {
    pub fn arm(&mut self) {
        self.armed = true;
        self.fired = false;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn fired(&self) -> bool {
        self.fired
    }
}

/// The byte-queue adapter bound to one TLS session. Holds the encrypted
/// input buffer (read side) and the output buffer/pool (write side).
pub struct ByteQueue {
    input: Buffer,
    output: Vec<PoolSlice>,
    pool: Pool,
    reneg: RenegotiationToken,
    shutdown: bool,
}

impl ByteQueue {
    pub fn new(proto: Prototype) -> Self {
        Self {
            input: Buffer::new(proto),
            output: Vec::new(),
            pool: Pool::new(proto),
            reneg: RenegotiationToken::default(),
            shutdown: false,
        }
    }

    pub fn input_mut(&mut self) -> &mut Buffer {
        &mut self.input
    }

    pub fn input(&self) -> &Buffer {
        &self.input
    }

    pub fn output_slices(&self) -> &[PoolSlice] {
        &self.output
    }

    pub fn output_is_empty(&self) -> bool {
        self.output.is_empty()
    }

    /// Clears the output buffer, which releases the pool (spec.md §3
    /// invariant 2).
    pub fn clear_output(&mut self) {
        self.output.clear();
        self.pool.clear();
    }

    pub fn set_shutdown(&mut self, v: bool) {
        self.shutdown = v;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn reparent(&mut self, proto: Prototype) {
        self.input.reparent(proto);
        self.pool.reparent(proto);
    }

    pub fn arm_renegotiation_detector(&mut self) {
        self.reneg.arm();
    }

    pub fn disarm_renegotiation_detector(&mut self) -> bool {
        let fired = self.reneg.fired();
        self.reneg.disarm();
        fired
    }

    /// Read side of the vtable (spec.md §4.1): if the encrypted input is
    /// empty, signal retry (`WouldBlock`); otherwise copy up to `buf.len()`
    /// bytes out and consume them.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.input.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no ciphertext buffered"));
        }
        let n = buf.len().min(self.input.len());
        buf[..n].copy_from_slice(&self.input.as_slice()[..n]);
        self.input.consume(n);
        Ok(n)
    }

    /// Write side of the vtable (spec.md §4.1): if the renegotiation
    /// detector is armed, fail the write and record that it fired — this
    /// is the sole mechanism by which mid-session key exchange is
    /// detected. Otherwise copy into the pool and append a descriptor to
    /// the output buffer.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.reneg.armed {
            self.reneg.fired = true;
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "write attempted during read (renegotiation)",
            ));
        }
        let slice = self.pool.alloc_copy(data);
        let n = slice.len();
        self.output.push(slice);
        Ok(n)
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<(), SocketError> {
        // Records never exceed the pool's chunk size in practice (TLS
        // records top out at 16 KiB + overhead, matched to CHUNK_SIZE);
        // split defensively in case a future cipher overhead changes that.
        const MAX_CHUNK: usize = 16 * 1024;
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + MAX_CHUNK).min(data.len());
            self.write(&data[offset..end]).map_err(SocketError::Io)?;
            offset = end;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_on_empty_input_signals_retry() {
        let mut q = ByteQueue::new(Prototype::Pooling);
        let mut buf = [0u8; 16];
        let err = q.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn write_without_armed_detector_succeeds() {
        let mut q = ByteQueue::new(Prototype::Pooling);
        let n = q.write(b"hello").unwrap();
        assert_eq!(n, 5);
        assert_eq!(q.output_slices().len(), 1);
    }

    #[test]
    fn write_while_armed_fails_and_sets_fired() {
        let mut q = ByteQueue::new(Prototype::Pooling);
        q.arm_renegotiation_detector();
        assert!(q.write(b"x").is_err());
        assert!(q.disarm_renegotiation_detector());
        // Disarming clears the flag for the next call.
        assert!(!q.reneg.fired());
    }

    #[test]
    fn clear_output_releases_pool() {
        let mut q = ByteQueue::new(Prototype::Pooling);
        q.write(b"abc").unwrap();
        q.clear_output();
        assert!(q.output_is_empty());
    }
}
