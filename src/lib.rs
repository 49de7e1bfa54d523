//! # perfbuf - Per-CPU perf event ring buffer consumer
//!
//! User-space side of the kernel's per-CPU perf event ring buffers: each
//! monitored CPU gets a memory-mapped region the kernel writes events into
//! without taking a lock, and this crate reads them back with correct index
//! arithmetic, acquire/release visibility, and an explicit consumed-position
//! hand-back so the kernel can reuse the space.
//!
//! A mapping is one metadata page followed by a power-of-two number of data
//! pages. The metadata page carries two monotonically increasing 64-bit
//! counters, projected onto the data region through a mask; they are never
//! used as offsets directly. Record payloads are handed back as raw byte
//! ranges; parsing them is the caller's business.
//!
//! ## Opening a ring
//!
//! ```rust,no_run
//! use perfbuf::{PerfEventRing, RingConfig};
//!
//! let config = RingConfig {
//!     per_cpu_buffer: 256 * 1024,
//!     watermark: 4096,
//!     ..RingConfig::default()
//! };
//! let ring = PerfEventRing::new(0, &config)?;
//! # Ok::<(), perfbuf::PerfBufError>(())
//! ```
//!
//! The watermark must be smaller than the buffer; that is checked before any
//! resource is acquired. The returned ring owns the descriptor and the
//! mapping, and both are released when it drops (or via
//! [`PerfEventRing::close`] when teardown should be visible at the call
//! site).
//!
//! ## Draining
//!
//! A drain pass is: snapshot the producer position, read until end-of-batch,
//! publish progress. Reads never block; a short read together with
//! `end_of_batch` is how a pass normally ends, not an error.
//!
//! ```rust,no_run
//! # use perfbuf::{PerfEventRing, RingConfig};
//! # let mut ring = PerfEventRing::new(0, &RingConfig::default())?;
//! let mut buf = vec![0u8; 4096];
//!
//! ring.load_head();
//! loop {
//!     let chunk = ring.read(&mut buf);
//!     // hand buf[..chunk.len] to the record parser
//!     if chunk.end_of_batch {
//!         break;
//!     }
//! }
//! ring.write_tail();
//! # Ok::<(), perfbuf::PerfBufError>(())
//! ```
//!
//! An external poller typically waits on the ring's descriptor (the type
//! implements [`std::os::fd::AsFd`]) and runs one such pass per wakeup.
//!
//! ## Overwritable rings
//!
//! With `overwritable: true` the kernel keeps writing over the oldest unread
//! data once the region fills, which suits crash- and snapshot-style capture:
//! the freshest samples survive. Reads run freshest-to-oldest within each
//! snapshot, a refresh deliberately discards whatever the previous snapshot
//! left unread (the kernel may have overwritten it), and `write_tail` is a
//! no-op because there is no acknowledgment protocol.
//!
//! ```rust,no_run
//! use perfbuf::{PerfEventRing, RingConfig};
//!
//! let config = RingConfig {
//!     per_cpu_buffer: 64 * 1024,
//!     overwritable: true,
//!     ..RingConfig::default()
//! };
//! let mut ring = PerfEventRing::new(0, &config)?;
//!
//! let mut snapshot = vec![0u8; ring.size()];
//! ring.load_head();
//! let mut filled = 0;
//! loop {
//!     let chunk = ring.read(&mut snapshot[filled..]);
//!     filled += chunk.len;
//!     if chunk.end_of_batch {
//!         break;
//!     }
//! }
//! # Ok::<(), perfbuf::PerfBufError>(())
//! ```
//!
//! ## Watchpoints and capture options
//!
//! Instead of streaming raw samples, a ring can watch a single address with
//! a hardware breakpoint, and either mode can capture user registers or a
//! stack slice for later unwinding:
//!
//! ```rust,no_run
//! use perfbuf::{
//!     Breakpoint, BreakpointLen, BreakpointTrigger, EventOptions, PerfEventRing, RingConfig,
//!     SampleCapture,
//! };
//!
//! let config = RingConfig {
//!     per_cpu_buffer: 64 * 1024,
//!     options: EventOptions {
//!         breakpoint: Some(Breakpoint {
//!             addr: 0x7fff_dead_b000,
//!             len: BreakpointLen::Len8,
//!             pid: 4242,
//!             trigger: BreakpointTrigger::Write,
//!         }),
//!         capture: SampleCapture::Stack { regs: 0xff, size: 8192 },
//!         track_mappings: true,
//!     },
//!     ..RingConfig::default()
//! };
//! let ring = PerfEventRing::new(0, &config)?;
//! # Ok::<(), perfbuf::PerfBufError>(())
//! ```

pub use error::PerfBufError;
pub use event::{Breakpoint, BreakpointLen, BreakpointTrigger, EventOptions, SampleCapture};
pub use reader::Chunk;
pub use ring::{PerfEventRing, RingConfig};

pub(crate) mod common;
pub mod error;
pub mod event;
pub(crate) mod memory;
pub(crate) mod reader;
pub mod ring;
