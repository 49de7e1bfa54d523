//! Event-source configuration: what to sample, how to be woken, and the
//! syscall boundary that turns a configuration into a descriptor.

use crate::error::PerfBufError;
use serde::{Deserialize, Serialize};
use std::os::fd::{FromRawFd, OwnedFd};
use tracing::debug;

// Kernel perf ABI values, declared locally at the values the ABI fixes.
const PERF_TYPE_SOFTWARE: u32 = 1;
const PERF_TYPE_BREAKPOINT: u32 = 5;

const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
const PERF_COUNT_SW_BPF_OUTPUT: u64 = 10;

const PERF_SAMPLE_TID: u64 = 1 << 1;
const PERF_SAMPLE_ADDR: u64 = 1 << 3;
const PERF_SAMPLE_RAW: u64 = 1 << 10;
const PERF_SAMPLE_REGS_USER: u64 = 1 << 12;
const PERF_SAMPLE_STACK_USER: u64 = 1 << 13;

const ATTR_MMAP: u64 = 1 << 8;
const ATTR_COMM: u64 = 1 << 9;
const ATTR_WATERMARK: u64 = 1 << 14;
const ATTR_MMAP_DATA: u64 = 1 << 17;
const ATTR_MMAP2: u64 = 1 << 23;
const ATTR_WRITE_BACKWARD: u64 = 1 << 27;

const PERF_FLAG_FD_CLOEXEC: u64 = 1 << 3;

/// Size of the attribute record through `sample_max_stack` (ABI version 5).
const PERF_ATTR_SIZE_VER5: u32 = 112;

/// The kernel's event attribute record at its fixed ver-5 layout. Unions in
/// the C declaration are flattened to the member this crate sets.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct EventAttr {
    kind: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_watermark: u32,
    bp_type: u32,
    bp_addr: u64,
    bp_len: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved_2: u16,
}

/// Discrete byte lengths a hardware breakpoint can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakpointLen {
    Len1 = 1,
    Len2 = 2,
    Len3 = 3,
    Len4 = 4,
    Len5 = 5,
    Len6 = 6,
    Len7 = 7,
    Len8 = 8,
}

impl BreakpointLen {
    pub fn bytes(self) -> u64 {
        self as u64
    }
}

/// Access kind that trips a hardware breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakpointTrigger {
    Read,
    Write,
    ReadWrite,
    Execute,
}

impl BreakpointTrigger {
    fn bp_type(self) -> u32 {
        match self {
            BreakpointTrigger::Read => 1,
            BreakpointTrigger::Write => 2,
            BreakpointTrigger::ReadWrite => 3,
            BreakpointTrigger::Execute => 4,
        }
    }
}

/// Hardware-breakpoint watch on a single address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub addr: u64,
    pub len: BreakpointLen,
    /// Process to watch.
    pub pid: i32,
    pub trigger: BreakpointTrigger,
}

/// What additional state each sample carries for user-space unwinding.
///
/// Stack capture implies register capture; the modes are mutually exclusive
/// by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SampleCapture {
    #[default]
    None,
    /// User registers only.
    Registers { regs: u64 },
    /// User registers plus a slice of the user stack.
    Stack { regs: u64, size: u32 },
}

/// Extended event-source options layered onto the baseline sampling setup.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EventOptions {
    /// Watch a single address instead of streaming raw samples.
    #[serde(default)]
    pub breakpoint: Option<Breakpoint>,
    #[serde(default)]
    pub capture: SampleCapture,
    /// Record mmap/comm events for later symbolization.
    #[serde(default)]
    pub track_mappings: bool,
}

fn build_attr(watermark: usize, overwritable: bool, opts: &EventOptions) -> EventAttr {
    let watermark = watermark.max(1);

    let mut flags = ATTR_WATERMARK;
    if overwritable {
        flags |= ATTR_WRITE_BACKWARD;
    }

    let mut attr = match opts.breakpoint {
        Some(bp) => EventAttr {
            kind: PERF_TYPE_BREAKPOINT,
            config: PERF_COUNT_SW_CPU_CLOCK,
            flags,
            sample_type: PERF_SAMPLE_ADDR | PERF_SAMPLE_TID,
            // Every hit matters for a watchpoint.
            sample_period: 1,
            wakeup_watermark: 1,
            bp_type: bp.trigger.bp_type(),
            bp_addr: bp.addr,
            bp_len: bp.len.bytes(),
            ..EventAttr::default()
        },
        None => EventAttr {
            kind: PERF_TYPE_SOFTWARE,
            config: PERF_COUNT_SW_BPF_OUTPUT,
            flags,
            sample_type: PERF_SAMPLE_RAW,
            wakeup_watermark: watermark as u32,
            ..EventAttr::default()
        },
    };

    match opts.capture {
        SampleCapture::None => {}
        SampleCapture::Registers { regs } => {
            attr.sample_type |= PERF_SAMPLE_REGS_USER;
            attr.sample_regs_user = regs;
        }
        SampleCapture::Stack { regs, size } => {
            attr.sample_type |= PERF_SAMPLE_STACK_USER | PERF_SAMPLE_REGS_USER;
            attr.sample_regs_user = regs;
            attr.sample_stack_user = size;
        }
    }

    if opts.track_mappings {
        attr.flags |= ATTR_MMAP | ATTR_COMM | ATTR_MMAP_DATA | ATTR_MMAP2;
    }

    attr.size = PERF_ATTR_SIZE_VER5;
    attr
}

/// Open the event source on one CPU and hand back the owned descriptor.
/// Breakpoint watches target the configured process; streaming sampling
/// targets every process on the CPU.
pub(crate) fn open_event(
    cpu: u32,
    watermark: usize,
    overwritable: bool,
    opts: &EventOptions,
) -> Result<OwnedFd, PerfBufError> {
    let attr = build_attr(watermark, overwritable, opts);
    let pid: libc::pid_t = opts.breakpoint.map_or(-1, |bp| bp.pid);

    debug!(cpu = cpu, pid = pid, kind = attr.kind, "opening perf event");

    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            &attr as *const EventAttr,
            pid,
            cpu as libc::c_int,
            -1 as libc::c_int,
            PERF_FLAG_FD_CLOEXEC as libc::c_ulong,
        )
    };
    if fd < 0 {
        return Err(PerfBufError::EventOpen(std::io::Error::last_os_error()));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}
