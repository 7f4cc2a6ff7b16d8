// SPDX-License-Identifier: GPL-2.0
//
// CPU-set membership for the traced process.
//
// The controller is the only mutator of the traced process's affinity
// mask, so its last-known state is authoritative; a successful
// transition is never read back from the kernel.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use log::info;
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoreClass {
    Big,
    Little,
}

impl std::fmt::Display for CoreClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreClass::Big => write!(f, "big"),
            CoreClass::Little => write!(f, "LITTLE"),
        }
    }
}

/// Parse a CPU list such as "0-3,6". Ranges and singles, no duplicates.
pub fn parse_cpu_list(optarg: &str) -> Result<Vec<usize>> {
    let mut cpus = Vec::new();
    let mut seen = HashSet::new();

    for token in optarg.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        if let Some((start_str, end_str)) = token.split_once('-') {
            let start = start_str
                .trim()
                .parse::<usize>()
                .with_context(|| format!("invalid range start in {:?}", token))?;
            let end = end_str
                .trim()
                .parse::<usize>()
                .with_context(|| format!("invalid range end in {:?}", token))?;
            if start > end {
                bail!("invalid CPU range: {}-{}", start, end);
            }
            for cpu in start..=end {
                if seen.insert(cpu) {
                    cpus.push(cpu);
                }
            }
        } else {
            let cpu = token
                .parse::<usize>()
                .with_context(|| format!("invalid CPU: {:?}", token))?;
            if seen.insert(cpu) {
                cpus.push(cpu);
            }
        }
    }

    if cpus.is_empty() {
        bail!("empty CPU list {:?}", optarg);
    }
    Ok(cpus)
}

fn cpu_set(cpus: &[usize]) -> Result<CpuSet> {
    let mut set = CpuSet::new();
    for &cpu in cpus {
        set.set(cpu)
            .with_context(|| format!("CPU {} out of range", cpu))?;
    }
    Ok(set)
}

pub struct AffinityController {
    big: CpuSet,
    little: CpuSet,
    current: CoreClass,
    switches: u64,
}

impl AffinityController {
    /// Core-id sets come from configuration; `initial` is the class the
    /// traced process is placed on before its first instruction.
    pub fn new(big_cpus: &[usize], little_cpus: &[usize], initial: CoreClass) -> Result<Self> {
        Ok(Self {
            big: cpu_set(big_cpus)?,
            little: cpu_set(little_cpus)?,
            current: initial,
            switches: 0,
        })
    }

    /// Pin `pid` onto the initial class's set. Used once at launch so
    /// that the recorded state and the kernel agree from round zero.
    pub fn apply_initial(&mut self, pid: Pid) -> Result<()> {
        let set = self.set_for(self.current);
        sched_setaffinity(pid, &set)
            .with_context(|| format!("sched_setaffinity({}) to initial {} set", pid, self.current))
    }

    /// Place `pid` on the target class. Issues no syscall when the
    /// target matches the last-known state; returns whether a migration
    /// was actually performed.
    pub fn ensure(&mut self, pid: Pid, target: CoreClass) -> Result<bool> {
        if target == self.current {
            return Ok(false);
        }

        let set = self.set_for(target);
        sched_setaffinity(pid, &set)
            .with_context(|| format!("sched_setaffinity({}) to {} set", pid, target))?;
        info!("migrated pid {} to {} cores", pid, target);
        self.current = target;
        self.switches += 1;
        Ok(true)
    }

    fn set_for(&self, class: CoreClass) -> CpuSet {
        match class {
            CoreClass::Big => self.big,
            CoreClass::Little => self.little,
        }
    }

    pub fn current(&self) -> CoreClass {
        self.current
    }

    pub fn switches(&self) -> u64 {
        self.switches
    }
}
