//! One monitored CPU: an event descriptor, its shared mapping, and the
//! reader draining it.

use crate::error::PerfBufError;
use crate::event::{self, EventOptions};
use crate::memory::{self, Memory};
use crate::reader::{Chunk, ForwardReader, ReverseReader, RingReader};
use nix::sys::mman::ProtFlags;
use serde::{Deserialize, Serialize};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use tracing::{debug, trace};

/// Per-CPU ring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// Requested data-region capacity in bytes; rounded up to a power-of-two
    /// number of pages.
    #[serde(default = "default_per_cpu_buffer")]
    pub per_cpu_buffer: usize,
    /// Byte threshold at which the kernel wakes a blocked poller. Zero wakes
    /// on the first byte.
    #[serde(default)]
    pub watermark: usize,
    /// Let the kernel overwrite the oldest unread data once the region
    /// fills, keeping the freshest samples instead of dropping new ones.
    #[serde(default)]
    pub overwritable: bool,
    #[serde(default)]
    pub options: EventOptions,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            per_cpu_buffer: default_per_cpu_buffer(),
            watermark: 0,
            overwritable: false,
            options: EventOptions::default(),
        }
    }
}

fn default_per_cpu_buffer() -> usize {
    256 * 1024
}

/// Handle for one CPU's ring. Owns the descriptor and the mapping; the
/// external poller drives it through `load_head`/`read`/`write_tail` and may
/// poll the descriptor via [`AsFd`]. Callers serialize access; the single
/// consumer assumption of the protocol means there is no internal lock to
/// hide behind.
pub struct PerfEventRing {
    cpu: u32,
    fd: OwnedFd,
    _memory: Memory,
    reader: RingReader,
}

impl PerfEventRing {
    /// Validates the configuration, then acquires resources in order:
    /// event source, non-blocking mode, mapping, reader. Each failure path
    /// releases whatever was acquired before it.
    pub fn new(cpu: u32, config: &RingConfig) -> Result<Self, PerfBufError> {
        if config.watermark >= config.per_cpu_buffer {
            return Err(PerfBufError::InvalidWatermark {
                watermark: config.watermark,
                buffer: config.per_cpu_buffer,
            });
        }

        let fd = event::open_event(cpu, config.watermark, config.overwritable, &config.options)?;
        set_nonblock(&fd)?;

        let size = memory::mmap_size(config.per_cpu_buffer, memory::page_size());
        let mut prot = ProtFlags::PROT_READ;
        if !config.overwritable {
            // Forward rings publish data_tail back through the mapping.
            prot |= ProtFlags::PROT_WRITE;
        }
        let memory = Memory::map(&fd, size, prot)?;

        let (data, len) = memory.data_region()?;
        let reader = if config.overwritable {
            RingReader::Reverse(ReverseReader::new(memory.header_ptr(), data, len))
        } else {
            RingReader::Forward(ForwardReader::new(memory.header_ptr(), data, len))
        };

        debug!(
            cpu = cpu,
            per_cpu_buffer = config.per_cpu_buffer,
            watermark = config.watermark,
            overwritable = config.overwritable,
            mapped = size,
            "created perf event ring"
        );

        Ok(PerfEventRing {
            cpu,
            fd,
            _memory: memory,
            reader,
        })
    }

    /// Snapshot the producer position before a drain pass.
    pub fn load_head(&mut self) {
        self.reader.load_head();
    }

    /// Copy available bytes into `buf`. The returned [`Chunk`] carries the
    /// byte count and the end-of-batch signal; the call never blocks and
    /// never fails.
    pub fn read(&mut self, buf: &mut [u8]) -> Chunk {
        self.reader.read(buf)
    }

    /// Publish consumption progress back to the kernel after a drain pass.
    /// A no-op for overwritable rings.
    pub fn write_tail(&self) {
        self.reader.write_tail();
    }

    /// Capacity of the maskable data region.
    pub fn size(&self) -> usize {
        self.reader.size()
    }

    /// Bytes left in the current snapshot.
    pub fn available(&self) -> u64 {
        self.reader.available()
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    /// Deterministic teardown: the descriptor closes before the region is
    /// unmapped. Dropping the ring does the same; this form makes the point
    /// explicit at call sites.
    pub fn close(self) {}
}

impl AsFd for PerfEventRing {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for PerfEventRing {
    fn drop(&mut self) {
        trace!(cpu = self.cpu, "closing perf event ring");
    }
}

fn set_nonblock(fd: &OwnedFd) -> Result<(), PerfBufError> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(PerfBufError::Nonblock(std::io::Error::last_os_error()));
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(PerfBufError::Nonblock(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_must_stay_below_the_buffer() {
        let config = RingConfig {
            per_cpu_buffer: 4096,
            watermark: 4096,
            ..RingConfig::default()
        };
        match PerfEventRing::new(0, &config) {
            Err(PerfBufError::InvalidWatermark { watermark, buffer }) => {
                assert_eq!((watermark, buffer), (4096, 4096));
            }
            Err(other) => panic!("expected InvalidWatermark, got {other}"),
            Ok(_) => panic!("expected InvalidWatermark, got a ring"),
        }
    }

    #[test]
    #[ignore = "requires perf_event_open privileges"]
    fn opens_and_drains_a_real_streaming_ring() -> eyre::Result<()> {
        let config = RingConfig {
            per_cpu_buffer: 64 * 1024,
            ..RingConfig::default()
        };
        let mut ring = PerfEventRing::new(0, &config)?;
        assert!(ring.size().is_power_of_two());
        assert!(ring.size() >= 64 * 1024);

        ring.load_head();
        let mut buf = [0u8; 512];
        let chunk = ring.read(&mut buf);
        assert!(chunk.len <= buf.len());
        ring.write_tail();
        ring.close();
        Ok(())
    }

    #[test]
    #[ignore = "requires perf_event_open privileges"]
    fn opens_an_overwritable_ring() -> eyre::Result<()> {
        let config = RingConfig {
            per_cpu_buffer: 64 * 1024,
            overwritable: true,
            ..RingConfig::default()
        };
        let mut ring = PerfEventRing::new(0, &config)?;
        ring.load_head();
        let mut buf = [0u8; 512];
        let chunk = ring.read(&mut buf);
        assert!(chunk.len <= buf.len());
        // No acknowledgment protocol to exercise, but the call must be safe.
        ring.write_tail();
        Ok(())
    }
}
