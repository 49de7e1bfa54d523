//! The two reading disciplines over a shared ring: forward (streaming, with
//! consumed-position hand-back) and reverse (overwritable, freshest first).

use crate::common::MmapHeader;
use core::ptr::NonNull;
use std::sync::atomic::Ordering;
use tracing::trace;

/// Result of a single read: how many bytes were copied out, and whether the
/// current snapshot is exhausted. End-of-batch is the normal way a drain
/// loop terminates, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub len: usize,
    pub end_of_batch: bool,
}

/// Reader over one mapped ring, selected once at construction by the ring's
/// write mode. The set is closed: the kernel knows exactly these two
/// disciplines.
pub(crate) enum RingReader {
    Forward(ForwardReader),
    Reverse(ReverseReader),
}

impl RingReader {
    pub(crate) fn load_head(&mut self) {
        match self {
            RingReader::Forward(r) => r.load_head(),
            RingReader::Reverse(r) => r.load_head(),
        }
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Chunk {
        match self {
            RingReader::Forward(r) => r.read(buf),
            RingReader::Reverse(r) => r.read(buf),
        }
    }

    pub(crate) fn write_tail(&self) {
        match self {
            RingReader::Forward(r) => r.write_tail(),
            RingReader::Reverse(r) => r.write_tail(),
        }
    }

    pub(crate) fn size(&self) -> usize {
        match self {
            RingReader::Forward(r) => r.size(),
            RingReader::Reverse(r) => r.size(),
        }
    }

    pub(crate) fn available(&self) -> u64 {
        match self {
            RingReader::Forward(r) => r.available(),
            RingReader::Reverse(r) => r.available(),
        }
    }
}

// Raw region pointers; the owning ring serializes all access.
unsafe impl Send for RingReader {}

/// Streaming reader. Tracks a local snapshot of the producer position and its
/// own read cursor, which it publishes back so the kernel can reuse space.
pub(crate) struct ForwardReader {
    meta: NonNull<MmapHeader>,
    head: u64,
    tail: u64,
    mask: u64,
    data: NonNull<u8>,
    len: usize,
}

impl ForwardReader {
    /// `len` must be a power of two; the mapping layer validates it.
    pub(crate) fn new(meta: NonNull<MmapHeader>, data: NonNull<u8>, len: usize) -> Self {
        let header = unsafe { meta.as_ref() };
        ForwardReader {
            meta,
            head: header.data_head.load(Ordering::Acquire),
            tail: header.data_tail.load(Ordering::Acquire),
            mask: (len - 1) as u64,
            data,
            len,
        }
    }

    fn meta(&self) -> &MmapHeader {
        unsafe { self.meta.as_ref() }
    }

    /// Snapshot the producer position. Must happen before trusting any byte
    /// range as available; the Acquire pairs with the producer's Release so
    /// published bytes are visible before the counter is.
    pub(crate) fn load_head(&mut self) {
        self.head = self.meta().data_head.load(Ordering::Acquire);
        trace!(head = self.head, tail = self.tail, "loaded producer position");
    }

    pub(crate) fn size(&self) -> usize {
        self.len
    }

    pub(crate) fn available(&self) -> u64 {
        self.head.saturating_sub(self.tail)
    }

    /// Publish the consumed position so the kernel may overwrite that space.
    /// Only called at batch boundaries; a partially read record must never be
    /// acknowledged.
    pub(crate) fn write_tail(&self) {
        self.meta().data_tail.store(self.tail, Ordering::Release);
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Chunk {
        let start = (self.tail & self.mask) as usize;

        let mut n = buf.len();
        // Stop at the physical end of the region; the next read wraps to 0.
        n = n.min(self.len - start);
        // Stop at the last byte the producer has published.
        n = n.min(self.head.saturating_sub(self.tail) as usize);

        unsafe {
            std::ptr::copy_nonoverlapping(self.data.as_ptr().add(start), buf.as_mut_ptr(), n);
        }
        self.tail += n as u64;

        Chunk {
            len: n,
            end_of_batch: self.tail == self.head,
        }
    }
}

/// Reader for overwritable rings. The kernel writes backward, decrementing
/// the producer counter, and keeps overwriting the oldest data once the
/// region fills; there is no acknowledgment protocol. Counters decrease over
/// time, so all cursor arithmetic wraps.
pub(crate) struct ReverseReader {
    meta: NonNull<MmapHeader>,
    /// Boundary of the newest unread batch, set at refresh time.
    head: u64,
    /// Read cursor, advances from head toward tail.
    read: u64,
    /// Oldest position still safe to read. No reads past it.
    tail: u64,
    mask: u64,
    data: NonNull<u8>,
    len: usize,
}

impl ReverseReader {
    pub(crate) fn new(meta: NonNull<MmapHeader>, data: NonNull<u8>, len: usize) -> Self {
        let mut reader = ReverseReader {
            meta,
            head: 0,
            read: 0,
            tail: 0,
            mask: (len - 1) as u64,
            data,
            len,
        };
        reader.load_head();
        reader
    }

    fn meta(&self) -> &MmapHeader {
        unsafe { self.meta.as_ref() }
    }

    /// Start a fresh batch at the current producer position.
    ///
    /// Anything readable before this call but not yet consumed is abandoned:
    /// the kernel may have overwritten those bytes since, and a sample from a
    /// previous batch must never be returned twice.
    pub(crate) fn load_head(&mut self) {
        // [head, read) was consumed, [read, tail) is deliberately dropped.
        self.tail = self.head;

        self.head = self.meta().data_head.load(Ordering::Acquire);
        self.read = self.head;

        // Full wrap since the last refresh: at most one capacity's worth of
        // bytes is still intact, anything older is gone.
        if self.tail.wrapping_sub(self.head) > self.len as u64 {
            self.tail = self.head.wrapping_add(self.len as u64);
        }
        trace!(head = self.head, tail = self.tail, "refreshed overwritable batch");
    }

    pub(crate) fn size(&self) -> usize {
        self.len
    }

    pub(crate) fn available(&self) -> u64 {
        self.tail.wrapping_sub(self.read)
    }

    /// An overwritable ring has no consumed-position hand-back; the kernel
    /// overwrites the oldest data regardless of consumption progress.
    pub(crate) fn write_tail(&self) {}

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Chunk {
        let start = (self.read & self.mask) as usize;

        let mut n = buf.len();
        n = n.min(self.len - start);
        n = n.min(self.tail.wrapping_sub(self.read) as usize);

        unsafe {
            std::ptr::copy_nonoverlapping(self.data.as_ptr().add(start), buf.as_mut_ptr(), n);
        }
        self.read = self.read.wrapping_add(n as u64);

        Chunk {
            len: n,
            end_of_batch: self.read == self.tail,
        }
    }
}
