// SPDX-License-Identifier: GPL-2.0
//
// Raw perf_event layer: counter-group acquisition and grouped reads.
//
// One group per traced process: a disabled software dummy leader plus
// one raw PMU member per configured event. The whole group is reset and
// enabled through the leader, and read back with a single read(2) in
// PERF_FORMAT_GROUP|PERF_FORMAT_ID layout. Decoded entries are matched
// to configured counters by kernel-assigned id, never by position.

use std::io;
use std::mem;

use anyhow::{bail, Context, Result};
use libc::{c_int, c_ulong, pid_t};
use log::debug;

use crate::events::CounterSpec;

pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_COUNT_SW_DUMMY: u64 = 9;

// read_format bits
pub const PERF_FORMAT_ID: u64 = 1 << 2;
pub const PERF_FORMAT_GROUP: u64 = 1 << 3;

// attr.flags bitfield; on little-endian bit N is (1 << N)
pub const PERF_ATTR_FLAG_DISABLED: u64 = 1 << 0;
pub const PERF_ATTR_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const PERF_ATTR_FLAG_EXCLUDE_HV: u64 = 1 << 6;

pub const PERF_FLAG_FD_CLOEXEC: c_ulong = 1 << 3;

// _IO('$', 0) .. _IO('$', 3); _IOR('$', 7, u64)
pub const PERF_EVENT_IOC_ENABLE: c_ulong = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: c_ulong = 0x2401;
pub const PERF_EVENT_IOC_RESET: c_ulong = 0x2403;
pub const PERF_EVENT_IOC_ID: c_ulong = 0x8008_2407;

pub const PERF_IOC_FLAG_GROUP: c_ulong = 1;

/// Minimal perf_event_attr, fields we touch plus zeroed tail.
#[repr(C)]
#[derive(Debug)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub bp_addr_or_config1: u64,
    pub bp_len_or_config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clock_id: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
}

impl PerfEventAttr {
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

fn perf_event_open(
    attr: &PerfEventAttr,
    pid: pid_t,
    cpu: c_int,
    group_fd: c_int,
    flags: c_ulong,
) -> io::Result<c_int> {
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const _ as *const libc::c_void,
            pid,
            cpu,
            group_fd,
            flags,
        ) as c_int
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn perf_ioctl(fd: c_int, request: c_ulong, arg: c_ulong) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, request as _, arg) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn perf_event_id(fd: c_int) -> io::Result<u64> {
    let mut id: u64 = 0;
    let ret = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_ID as _, &mut id as *mut u64) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(id)
}

/// One grouped read, decoded: (kernel id, cumulative value) per entry.
/// May contain fewer entries than configured counters; the kernel
/// decides inclusion.
#[derive(Debug, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub entries: Vec<(u64, u64)>,
}

/// Decode a PERF_FORMAT_GROUP|PERF_FORMAT_ID read buffer:
/// u64 nr, then nr * { u64 value, u64 id }.
fn decode_group_read(buf: &[u8]) -> Result<CounterSnapshot> {
    if buf.len() < 8 {
        bail!("short counter read: {} bytes", buf.len());
    }
    let nr = u64::from_ne_bytes(buf[0..8].try_into().unwrap()) as usize;
    let need = 8 + nr * 16;
    if buf.len() < need {
        bail!(
            "truncated counter read: {} entries need {} bytes, got {}",
            nr,
            need,
            buf.len()
        );
    }

    let mut entries = Vec::with_capacity(nr);
    for i in 0..nr {
        let off = 8 + i * 16;
        let value = u64::from_ne_bytes(buf[off..off + 8].try_into().unwrap());
        let id = u64::from_ne_bytes(buf[off + 8..off + 16].try_into().unwrap());
        entries.push((id, value));
    }
    Ok(CounterSnapshot { entries })
}

/// Fold a decoded snapshot into the configured counters, matching by
/// kernel id. The leader's own entry carries no PMU data and is
/// skipped. An id that matches no configured counter means the group
/// no longer corresponds to our configuration, which is fatal.
fn reconcile(specs: &mut [CounterSpec], snapshot: &CounterSnapshot, leader_id: u64) -> Result<()> {
    for &(id, value) in &snapshot.entries {
        if id == leader_id {
            continue;
        }
        match specs.iter_mut().find(|spec| spec.id == id) {
            Some(spec) => spec.value = value,
            None => bail!("counter read returned unknown id {}", id),
        }
    }
    Ok(())
}

/// A kernel counter group scoped to one traced process.
pub struct CounterGroup {
    leader_fd: c_int,
    leader_id: u64,
    specs: Vec<CounterSpec>,
    stopped: bool,
}

impl CounterGroup {
    /// Open the group against `pid`. The leader is a disabled software
    /// dummy; members are raw PMU events attached to it, counting user
    /// space only. Any acquisition failure is fatal.
    pub fn open(pid: pid_t, specs: Vec<CounterSpec>) -> Result<Self> {
        let mut attr = PerfEventAttr::zeroed();
        attr.type_ = PERF_TYPE_SOFTWARE;
        attr.size = mem::size_of::<PerfEventAttr>() as u32;
        attr.config = PERF_COUNT_SW_DUMMY;
        attr.read_format = PERF_FORMAT_GROUP | PERF_FORMAT_ID;
        attr.flags =
            PERF_ATTR_FLAG_DISABLED | PERF_ATTR_FLAG_EXCLUDE_KERNEL | PERF_ATTR_FLAG_EXCLUDE_HV;

        let leader_fd = perf_event_open(&attr, pid, -1, -1, PERF_FLAG_FD_CLOEXEC)
            .context("perf_event_open group leader")?;

        // The group owns every fd from here on; error paths below drop
        // it, which closes whatever was opened.
        let mut group = Self {
            leader_fd,
            leader_id: 0,
            specs,
            stopped: false,
        };
        group.leader_id = perf_event_id(leader_fd).context("PERF_EVENT_IOC_ID on leader")?;

        for spec in &mut group.specs {
            let mut attr = PerfEventAttr::zeroed();
            attr.type_ = PERF_TYPE_RAW;
            attr.size = mem::size_of::<PerfEventAttr>() as u32;
            attr.config = spec.code;
            attr.read_format = PERF_FORMAT_GROUP | PERF_FORMAT_ID;
            attr.flags = PERF_ATTR_FLAG_EXCLUDE_KERNEL | PERF_ATTR_FLAG_EXCLUDE_HV;

            spec.fd = perf_event_open(&attr, pid, -1, leader_fd, PERF_FLAG_FD_CLOEXEC)
                .with_context(|| format!("perf_event_open {}", spec.name))?;
            spec.id = perf_event_id(spec.fd)
                .with_context(|| format!("PERF_EVENT_IOC_ID on {}", spec.name))?;
            debug!("counter {} code {:#06x} fd {} id {}", spec.name, spec.code, spec.fd, spec.id);
        }

        Ok(group)
    }

    /// Reset and enable the whole group. Must complete before the
    /// traced process runs its first user instruction.
    pub fn arm_and_start(&self) -> Result<()> {
        perf_ioctl(self.leader_fd, PERF_EVENT_IOC_RESET, PERF_IOC_FLAG_GROUP)
            .context("PERF_EVENT_IOC_RESET")?;
        perf_ioctl(self.leader_fd, PERF_EVENT_IOC_ENABLE, PERF_IOC_FLAG_GROUP)
            .context("PERF_EVENT_IOC_ENABLE")?;
        Ok(())
    }

    /// One grouped read. Updates the configured counters' cumulative
    /// values by id and returns the raw snapshot. A failed or short
    /// read is fatal; the round's integrity cannot be re-established.
    pub fn read_snapshot(&mut self) -> Result<CounterSnapshot> {
        // nr + (leader + members) * (value, id)
        let cap = 8 + (self.specs.len() + 1) * 16;
        let mut buf = vec![0u8; cap];
        let n = unsafe { libc::read(self.leader_fd, buf.as_mut_ptr() as *mut libc::c_void, cap) };
        if n < 0 {
            return Err(io::Error::last_os_error()).context("read counter group");
        }
        buf.truncate(n as usize);

        let snapshot = decode_group_read(&buf)?;
        reconcile(&mut self.specs, &snapshot, self.leader_id)?;
        Ok(snapshot)
    }

    /// Last observed cumulative value of a configured counter.
    pub fn value(&self, name: &str) -> Option<u64> {
        self.specs
            .iter()
            .find(|spec| spec.name == name)
            .map(|spec| spec.value)
    }

    pub fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        perf_ioctl(self.leader_fd, PERF_EVENT_IOC_DISABLE, PERF_IOC_FLAG_GROUP)
            .context("PERF_EVENT_IOC_DISABLE")?;
        self.stopped = true;
        Ok(())
    }
}

impl Drop for CounterGroup {
    fn drop(&mut self) {
        for spec in &self.specs {
            if spec.fd >= 0 {
                unsafe { libc::close(spec.fd) };
            }
        }
        unsafe { libc::close(self.leader_fd) };
    }
}
