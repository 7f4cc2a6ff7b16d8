// SPDX-License-Identifier: GPL-2.0
//
// Core-residency sampling from /proc/<pid>/stat.
//
// Only one field is consumed: `processor` (field 39), the CPU the
// process last ran on. Parsing starts after the parenthesized comm,
// which may itself contain spaces and parentheses.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use anyhow::{bail, Context, Result};
use nix::unistd::Pid;

// 0-based index of `processor` among the fields following comm.
const PROCESSOR_FIELD: usize = 36;

fn parse_last_cpu(stat: &str) -> Result<usize> {
    let comm_end = stat.rfind(')').context("malformed stat line: no comm")?;
    let fields: Vec<&str> = stat[comm_end + 1..].split_whitespace().collect();
    let Some(field) = fields.get(PROCESSOR_FIELD) else {
        bail!("stat line has only {} fields after comm", fields.len());
    };
    field
        .parse::<usize>()
        .with_context(|| format!("bad processor field {:?}", field))
}

/// Tracks which core class the traced process is observed on each
/// tick. The stat file is held open and re-read from the start, like
/// the sensor endpoints.
pub struct ResidencyTracker {
    stat: File,
    big_cpus: Vec<usize>,
    on_big: u64,
    total: u64,
}

impl ResidencyTracker {
    pub fn open(pid: Pid, big_cpus: &[usize]) -> Result<Self> {
        let path = format!("/proc/{}/stat", pid);
        let stat = File::open(&path).with_context(|| format!("open {}", path))?;
        Ok(Self {
            stat,
            big_cpus: big_cpus.to_vec(),
            on_big: 0,
            total: 0,
        })
    }

    /// Record where the process was last seen running.
    pub fn sample(&mut self) -> Result<()> {
        self.stat.seek(SeekFrom::Start(0)).context("seek stat")?;
        let mut buf = String::new();
        self.stat.read_to_string(&mut buf).context("read stat")?;

        let cpu = parse_last_cpu(&buf)?;
        if self.big_cpus.contains(&cpu) {
            self.on_big += 1;
        }
        self.total += 1;
        Ok(())
    }

    /// (big, little) fractions of samples; (0, 0) when nothing was
    /// sampled.
    pub fn mix(&self) -> (f64, f64) {
        if self.total == 0 {
            return (0.0, 0.0);
        }
        let big = self.on_big as f64 / self.total as f64;
        (big, 1.0 - big)
    }
}
