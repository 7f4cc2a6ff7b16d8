// SPDX-License-Identifier: GPL-2.0
//
// The migration decision loop.
//
// Lifecycle: Initializing -> Armed -> Sampling -> Finalizing ->
// Terminated. Each sampling round is strictly sequential: energy
// sample, residency sample, counter snapshot, per-round deltas,
// predictor verdict, affinity decision, sleep. Finalization is
// triggered by SIGCHLD, which only sets a flag; the loop observes it
// between rounds and finalizes exactly once. Any failure during a
// round is fatal because a corrupted round cannot be trusted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, info};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::Serialize;

use crate::affinity::{AffinityController, CoreClass};
use crate::energy::{EnergyMonitor, EnergyReport};
use crate::events::parse_event_list;
use crate::launch::{spawn_traced, LaunchBarrier};
use crate::perf::CounterGroup;
use crate::predictor::{PhasePredictor, PhaseSample, PredictorChannel};
use crate::residency::ResidencyTracker;

/// Counters the classifier was trained on, in wire order.
const WIRE_EVENTS: [&str; 5] = [
    "cpu_cycles",
    "inst_retired",
    "l2d_cache",
    "l2d_cache_refill",
    "br_mis_pred",
];

pub struct SchedulerConfig {
    /// When false, verdicts are logged but no affinity is changed.
    pub run_scheduler: bool,
    pub big_cpus: Vec<usize>,
    pub little_cpus: Vec<usize>,
    pub program: String,
    pub args: Vec<String>,
    pub events: String,
    pub tick: Duration,
    pub phase_threshold: i64,
    pub predictor_cmd: String,
    pub voltage_path: PathBuf,
    pub current_path: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct FinalReport {
    #[serde(flatten)]
    pub energy: EnergyReport,
    pub big_residency: f64,
    pub little_residency: f64,
    pub migrations: u64,
    pub rounds: u64,
}

/// Cumulative values of the wire counters at one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct WireCounters {
    cpu_cycles: u64,
    inst_retired: u64,
    l2d_cache: u64,
    l2d_cache_refill: u64,
    br_mis_pred: u64,
}

impl WireCounters {
    fn delta_since(&self, prev: &WireCounters) -> WireCounters {
        WireCounters {
            cpu_cycles: self.cpu_cycles.saturating_sub(prev.cpu_cycles),
            inst_retired: self.inst_retired.saturating_sub(prev.inst_retired),
            l2d_cache: self.l2d_cache.saturating_sub(prev.l2d_cache),
            l2d_cache_refill: self.l2d_cache_refill.saturating_sub(prev.l2d_cache_refill),
            br_mis_pred: self.br_mis_pred.saturating_sub(prev.br_mis_pred),
        }
    }
}

fn wire_counters(group: &CounterGroup) -> Result<WireCounters> {
    let get = |name: &str| {
        group
            .value(name)
            .with_context(|| format!("counter {} not configured", name))
    };
    Ok(WireCounters {
        cpu_cycles: get("cpu_cycles")?,
        inst_retired: get("inst_retired")?,
        l2d_cache: get("l2d_cache")?,
        l2d_cache_refill: get("l2d_cache_refill")?,
        br_mis_pred: get("br_mis_pred")?,
    })
}

/// Phase at or above the threshold means memory-bound: prefer the
/// little set. Below it, compute-bound: prefer big.
fn target_for(phase: i64, threshold: i64) -> CoreClass {
    if phase >= threshold {
        CoreClass::Little
    } else {
        CoreClass::Big
    }
}

/// One round's decision: consult the classifier on the deltas and move
/// the process if the verdict asks for the other class. A round with no
/// forward progress (no retired instructions) has no defined phase and
/// is skipped outright. Returns the phase when one was predicted.
fn run_round<P: PhasePredictor>(
    predictor: &mut P,
    affinity: &mut AffinityController,
    pid: Pid,
    deltas: &WireCounters,
    threshold: i64,
    migrate: bool,
) -> Result<Option<i64>> {
    if deltas.inst_retired == 0 {
        debug!("no forward progress this round; skipping prediction");
        return Ok(None);
    }

    let sample = PhaseSample {
        cpu_cycles: deltas.cpu_cycles,
        inst_retired: deltas.inst_retired,
        l2d_cache: deltas.l2d_cache,
        l2d_cache_refill: deltas.l2d_cache_refill,
        br_mis_pred: deltas.br_mis_pred,
        cluster: PhaseSample::cluster_for(affinity.current()),
    };
    let phase = predictor.predict(&sample)?;
    let target = target_for(phase, threshold);

    if migrate {
        affinity.ensure(pid, target)?;
    } else {
        debug!("observe-only: phase {} wants {} cores", phase, target);
    }
    Ok(Some(phase))
}

pub struct MigrationScheduler {
    cfg: SchedulerConfig,
}

impl MigrationScheduler {
    pub fn new(cfg: SchedulerConfig) -> Self {
        Self { cfg }
    }

    pub fn run(self) -> Result<FinalReport> {
        let cfg = &self.cfg;

        // Initializing: validate configuration and acquire every
        // collaborator before the child exists.
        let specs = parse_event_list(&cfg.events)?;
        for name in WIRE_EVENTS {
            if !specs.iter().any(|spec| spec.name == name) {
                anyhow::bail!("event list must include {} for the predictor protocol", name);
            }
        }
        let mut predictor = PredictorChannel::spawn(&cfg.predictor_cmd)?;
        let mut energy = EnergyMonitor::open(&cfg.voltage_path, &cfg.current_path)?;
        let barrier = LaunchBarrier::new()?;
        // The child starts its life on the efficiency cores.
        let mut affinity =
            AffinityController::new(&cfg.big_cpus, &cfg.little_cpus, CoreClass::Little)?;

        // Armed: the child parks on the barrier; instrumentation is
        // armed against its pid before release, so not a single target
        // instruction runs uncounted.
        let child_exited = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGCHLD, Arc::clone(&child_exited))
            .context("register SIGCHLD flag")?;

        let pid = spawn_traced(&cfg.program, &cfg.args, &barrier)?;
        info!("traced child pid {} parked at launch barrier", pid);
        affinity.apply_initial(pid)?;
        let mut residency = ResidencyTracker::open(pid, &cfg.big_cpus)?;
        let mut group = CounterGroup::open(pid.as_raw(), specs)?;
        group.arm_and_start()?;
        barrier.wait()?;
        let start = Instant::now();
        debug!("barrier released; sampling every {:?}", cfg.tick);

        // Sampling: one snapshot produced and consumed per round, no
        // overlap between rounds.
        let mut prev: Option<WireCounters> = None;
        let mut rounds: u64 = 0;
        let exit_status = loop {
            std::thread::sleep(cfg.tick);
            if child_exited.load(Ordering::Relaxed) {
                // SIGCHLD fires for any of our children; only the
                // traced child's exit is a lifecycle transition. The
                // predictor going away is a broken collaborator.
                match waitpid(pid, Some(WaitPidFlag::WNOHANG)).context("reap traced child")? {
                    WaitStatus::StillAlive => {
                        anyhow::bail!("predictor subprocess exited unexpectedly")
                    }
                    status => break status,
                }
            }

            energy.sample()?;
            residency.sample()?;
            group.read_snapshot()?;
            let cur = wire_counters(&group)?;
            // The group is reset at arm time, so the first round's
            // cumulative values are already deltas.
            let deltas = match prev {
                Some(ref p) => cur.delta_since(p),
                None => cur,
            };
            prev = Some(cur);
            rounds += 1;

            run_round(
                &mut predictor,
                &mut affinity,
                pid,
                &deltas,
                cfg.phase_threshold,
                cfg.run_scheduler,
            )?;
        };

        // Finalizing: runs once, no rounds after child exit.
        let elapsed = start.elapsed();
        group.stop()?;
        info!(
            "traced child pid {} exited ({:?}) after {:?}",
            pid, exit_status, elapsed
        );

        // A child that exits before the first tick leaves nothing to
        // average; finalize is undefined with zero samples.
        let energy_report = if energy.samples() == 0 {
            EnergyReport {
                avg_power_mw: 0,
                elapsed_ms: elapsed.as_millis() as i64,
                energy_mj: 0,
            }
        } else {
            energy.finalize(elapsed)?
        };
        let (big, little) = residency.mix();
        Ok(FinalReport {
            energy: energy_report,
            big_residency: big,
            little_residency: little,
            migrations: affinity.switches(),
            rounds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sched::{sched_getaffinity, CpuSet};

    struct ScriptedPredictor {
        replies: Vec<i64>,
        requests: usize,
    }

    impl PhasePredictor for ScriptedPredictor {
        fn predict(&mut self, _sample: &PhaseSample) -> Result<i64> {
            let phase = self.replies[self.requests];
            self.requests += 1;
            Ok(phase)
        }
    }

    fn own_cpus() -> Vec<usize> {
        let set = sched_getaffinity(Pid::from_raw(0)).unwrap();
        (0..CpuSet::count())
            .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
            .collect()
    }

    fn deltas(inst_retired: u64) -> WireCounters {
        WireCounters {
            cpu_cycles: 100_000,
            inst_retired,
            l2d_cache: 500,
            l2d_cache_refill: 40,
            br_mis_pred: 12,
        }
    }

    #[test]
    fn threshold_direction() {
        assert_eq!(target_for(5, 5), CoreClass::Little);
        assert_eq!(target_for(9, 5), CoreClass::Little);
        assert_eq!(target_for(4, 5), CoreClass::Big);
        assert_eq!(target_for(0, 5), CoreClass::Big);
        // the threshold is configuration, not a constant
        assert_eq!(target_for(1, 1), CoreClass::Little);
    }

    #[test]
    fn delta_computation_saturates() {
        let a = deltas(100);
        let b = deltas(70);
        assert_eq!(a.delta_since(&b).inst_retired, 30);
        // a counter going backwards must not wrap
        assert_eq!(b.delta_since(&a).inst_retired, 0);
    }

    #[test]
    fn round_skips_when_no_instructions_retired() {
        let cpus = own_cpus();
        let mut affinity =
            AffinityController::new(&cpus, &cpus, CoreClass::Big).unwrap();
        let mut predictor = ScriptedPredictor { replies: vec![], requests: 0 };

        let phase = run_round(
            &mut predictor,
            &mut affinity,
            Pid::this(),
            &deltas(0),
            5,
            true,
        )
        .unwrap();

        assert_eq!(phase, None);
        assert_eq!(predictor.requests, 0);
        assert_eq!(affinity.switches(), 0);
    }

    #[test]
    fn observe_only_never_migrates() {
        let cpus = own_cpus();
        let mut affinity =
            AffinityController::new(&cpus, &cpus, CoreClass::Big).unwrap();
        let mut predictor = ScriptedPredictor { replies: vec![9], requests: 0 };

        run_round(&mut predictor, &mut affinity, Pid::this(), &deltas(100), 5, false).unwrap();
        assert_eq!(predictor.requests, 1);
        assert_eq!(affinity.switches(), 0);
        assert_eq!(affinity.current(), CoreClass::Big);
    }

    // The end-to-end decision sequence: phase below the threshold keeps
    // the process on big with zero affinity syscalls, crossing it
    // migrates to little exactly once.
    #[test]
    fn migration_sequence_big_to_little() {
        let cpus = own_cpus();
        let mut affinity =
            AffinityController::new(&cpus, &cpus, CoreClass::Big).unwrap();
        let mut predictor = ScriptedPredictor { replies: vec![3, 7], requests: 0 };
        let pid = Pid::this();

        let phase = run_round(&mut predictor, &mut affinity, pid, &deltas(500), 5, true).unwrap();
        assert_eq!(phase, Some(3));
        assert_eq!(affinity.current(), CoreClass::Big);
        assert_eq!(affinity.switches(), 0);

        let phase = run_round(&mut predictor, &mut affinity, pid, &deltas(400), 5, true).unwrap();
        assert_eq!(phase, Some(7));
        assert_eq!(affinity.current(), CoreClass::Little);
        assert_eq!(affinity.switches(), 1);

        assert_eq!(predictor.requests, 2);
    }

    #[test]
    fn cluster_sentinel_follows_current_class() {
        struct CaptureCluster {
            seen: Vec<u64>,
        }
        impl PhasePredictor for CaptureCluster {
            fn predict(&mut self, sample: &PhaseSample) -> Result<i64> {
                self.seen.push(sample.cluster);
                Ok(0)
            }
        }

        let cpus = own_cpus();
        let mut affinity =
            AffinityController::new(&cpus, &cpus, CoreClass::Little).unwrap();
        let mut predictor = CaptureCluster { seen: vec![] };
        let pid = Pid::this();

        // on little the sentinel is 0; the reply 0 migrates us to big,
        // so the next request carries 4
        run_round(&mut predictor, &mut affinity, pid, &deltas(100), 5, true).unwrap();
        run_round(&mut predictor, &mut affinity, pid, &deltas(100), 5, true).unwrap();
        assert_eq!(predictor.seen, vec![0, 4]);
    }
}
