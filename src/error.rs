use thiserror::Error;

#[derive(Error, Debug)]
pub enum PerfBufError {
    #[error("watermark ({watermark} bytes) must be smaller than the per-cpu buffer ({buffer} bytes)")]
    InvalidWatermark { watermark: usize, buffer: usize },

    #[error("failed to open perf event: {0}")]
    EventOpen(#[source] std::io::Error),

    #[error("failed to set descriptor non-blocking: {0}")]
    Nonblock(#[source] std::io::Error),

    #[error("memory mapping failed: {0}")]
    MmapFailed(#[from] nix::errno::Errno),

    #[error("data region (offset {offset}, size {size}) exceeds the {mapped} byte mapping")]
    DataRegionBounds { offset: u64, size: u64, mapped: usize },

    #[error("data region size {0} is not a power of two")]
    DataRegionSize(u64),
}
