// Multi-reactor TCP server library: one event loop per thread
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2022-2023 by
//     Dr. Maxim Orlovsky <orlovsky@cyphernet.org>
//
// Copyright 2022-2023 Cyphernet DAO, Switzerland
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! User-space byte buffer backing non-blocking socket I/O.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0      <=        reader     <=      writer      <=    capacity
//! ```
//!
//! The readable region holds bytes received from (or queued towards) a
//! socket which the application has not consumed yet; the prepend zone in
//! front of it is reserved for protocol framing inserted after the fact.

use std::io::IoSliceMut;
use std::os::fd::BorrowedFd;

use nix::errno::Errno;
use nix::sys::uio::readv;
use nix::unistd::write;

/// Space reserved in front of the readable region, suitable for prepending
/// length fields or other framing without moving the payload.
pub const PREPEND: usize = 8;

/// Default capacity of the readable + writable region.
pub const INITIAL_SIZE: usize = 1024;

/// Stack-resident spill segment used by [`Buffer::read_from_fd`]. A single
/// gather read suffices for any arrival up to the writable region plus this
/// many bytes.
const SPILL_SIZE: usize = 65536;

/// Growable byte container with separate reader and writer cursors.
///
/// Invariant: `PREPEND <= reader <= writer <= capacity`. The readable span
/// is `[reader, writer)`, the writable span is `[writer, capacity)`.
#[derive(Clone, Debug)]
pub struct Buffer {
    storage: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Self { Buffer::with_capacity(INITIAL_SIZE) }
}

impl Buffer {
    /// Creates a buffer able to hold `initial` bytes in front of the prepend
    /// zone before the first reallocation.
    pub fn with_capacity(initial: usize) -> Self {
        Buffer {
            storage: vec![0u8; PREPEND + initial],
            reader: PREPEND,
            writer: PREPEND,
        }
    }

    /// Number of bytes available for reading.
    pub fn readable_len(&self) -> usize { self.writer - self.reader }

    /// Number of bytes which can be appended without reallocating.
    pub fn writable_len(&self) -> usize { self.storage.len() - self.writer }

    /// Size of the zone in front of the readable region.
    pub fn prependable_len(&self) -> usize { self.reader }

    /// Readable bytes, without consuming them.
    pub fn peek(&self) -> &[u8] { &self.storage[self.reader..self.writer] }

    /// Marks `len` readable bytes as consumed.
    ///
    /// Consuming everything resets both cursors to the prepend mark so the
    /// whole capacity becomes writable again.
    pub fn consume(&mut self, len: usize) {
        debug_assert!(len <= self.readable_len());
        if len < self.readable_len() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Discards all readable bytes, resetting both cursors to the prepend
    /// mark.
    pub fn retrieve_all(&mut self) {
        self.reader = PREPEND;
        self.writer = PREPEND;
    }

    /// Takes `len` readable bytes out of the buffer as a string.
    pub fn take_as_string(&mut self, len: usize) -> String {
        debug_assert!(len <= self.readable_len());
        let string =
            String::from_utf8_lossy(&self.storage[self.reader..self.reader + len]).into_owned();
        self.consume(len);
        string
    }

    /// Takes all readable bytes out of the buffer as a string and resets the
    /// cursors.
    pub fn take_all_as_string(&mut self) -> String { self.take_as_string(self.readable_len()) }

    /// Appends `data` behind the current writer cursor, growing or compacting
    /// the storage as needed. Never fails.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Makes sure at least `len` bytes can be written contiguously.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_len() < len {
            self.make_space(len);
        }
    }

    /// Either compacts the readable region back to the prepend mark (when the
    /// slack in front of it is large enough) or grows the storage to exactly
    /// `writer + len` bytes, so that a single oversized append does not leave
    /// a permanently over-allocated buffer behind.
    fn make_space(&mut self, len: usize) {
        if self.writable_len() + self.prependable_len() < len + PREPEND {
            self.storage.resize(self.writer + len, 0);
        } else {
            let readable = self.readable_len();
            self.storage.copy_within(self.reader..self.writer, PREPEND);
            self.reader = PREPEND;
            self.writer = PREPEND + readable;
        }
    }

    /// Gather-reads from `fd` into the writable region plus a 64 KiB stack
    /// spill, so one syscall drains even bursts far larger than the current
    /// capacity; spill overflow is appended afterwards.
    ///
    /// Returns the raw byte count reported by the kernel; zero signals EOF.
    pub fn read_from_fd(&mut self, fd: BorrowedFd) -> Result<usize, Errno> {
        let mut spill = [0u8; SPILL_SIZE];
        let writable = self.writable_len();
        let n = {
            let (_, tail) = self.storage.split_at_mut(self.writer);
            let mut segments = [IoSliceMut::new(tail), IoSliceMut::new(&mut spill)];
            let count = if writable < SPILL_SIZE { 2 } else { 1 };
            readv(fd, &mut segments[..count])?
        };
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.storage.len();
            self.append(&spill[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable region to `fd`. Cursors are left untouched; the
    /// caller consumes whatever the kernel accepted.
    pub fn write_to_fd(&self, fd: BorrowedFd) -> Result<usize, Errno> {
        write(fd, &self.storage[self.reader..self.writer])
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;

    use nix::unistd::pipe;

    use super::*;

    #[test]
    fn append_take_all_roundtrip() {
        let mut buffer = Buffer::default();
        buffer.append(b"alpha");
        buffer.append(b" ");
        buffer.append(b"beta");
        assert_eq!(buffer.readable_len(), 10);
        assert_eq!(buffer.take_all_as_string(), "alpha beta");
        assert_eq!(buffer.readable_len(), 0);
        assert_eq!(buffer.prependable_len(), PREPEND);
    }

    #[test]
    fn take_prefix_preserves_rest() {
        let mut buffer = Buffer::default();
        buffer.append(b"hello world");
        assert_eq!(buffer.take_as_string(5), "hello");
        assert_eq!(buffer.prependable_len(), PREPEND + 5);
        assert_eq!(buffer.take_all_as_string(), " world");
    }

    #[test]
    fn consume_everything_resets_cursors() {
        let mut buffer = Buffer::default();
        buffer.append(b"data");
        buffer.consume(4);
        assert_eq!(buffer.readable_len(), 0);
        assert_eq!(buffer.prependable_len(), PREPEND);
        assert_eq!(buffer.writable_len(), INITIAL_SIZE);
    }

    #[test]
    fn oversized_append_grows_to_exact_size() {
        let mut buffer = Buffer::with_capacity(16);
        buffer.append(&[0xAA; 1000]);
        assert_eq!(buffer.readable_len(), 1000);
        assert_eq!(buffer.writable_len(), 0);
    }

    #[test]
    fn compaction_reclaims_consumed_prefix() {
        let mut buffer = Buffer::with_capacity(64);
        buffer.append(&[1u8; 60]);
        buffer.consume(40);
        // 20 readable bytes left; slack in front is large enough for another
        // 40 without reallocating.
        buffer.append(&[2u8; 40]);
        assert_eq!(buffer.readable_len(), 60);
        assert_eq!(buffer.prependable_len(), PREPEND);
        assert_eq!(buffer.peek()[..20], [1u8; 20]);
        assert_eq!(buffer.peek()[20..], [2u8; 40]);
    }

    #[test]
    fn gather_read_spills_past_writable_region() {
        let (rx, tx) = pipe().unwrap();
        let mut sink = File::from(tx);
        sink.write_all(&[0x42; 10_000]).unwrap();
        drop(sink);

        let mut buffer = Buffer::default();
        let n = buffer.read_from_fd(rx.as_fd()).unwrap();
        assert_eq!(n, 10_000);
        assert_eq!(buffer.readable_len(), 10_000);
        assert!(buffer.peek().iter().all(|byte| *byte == 0x42));
    }

    #[test]
    fn read_from_fd_reports_eof_as_zero() {
        let (rx, tx) = pipe().unwrap();
        drop(File::from(tx));
        let mut buffer = Buffer::default();
        assert_eq!(buffer.read_from_fd(rx.as_fd()).unwrap(), 0);
    }

    #[test]
    fn write_to_fd_leaves_cursors_for_caller() {
        let (rx, tx) = pipe().unwrap();
        let mut buffer = Buffer::default();
        buffer.append(b"payload");
        let n = buffer.write_to_fd(tx.as_fd()).unwrap();
        assert_eq!(n, 7);
        assert_eq!(buffer.readable_len(), 7);
        buffer.consume(n);
        drop(tx);

        let mut read_back = String::new();
        File::from(rx).read_to_string(&mut read_back).unwrap();
        assert_eq!(read_back, "payload");
    }
}
