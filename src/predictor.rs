// SPDX-License-Identifier: GPL-2.0
//
// Bridge to the external phase classifier.
//
// The classifier is a long-lived subprocess spoken to over its stdin
// and stdout, one request per scheduling round, strictly
// request-then-response. The protocol is newline-framed ASCII: six
// comma-separated integers out, one integer back. The subprocess is
// assumed healthy or dead, never partially responsive; any framing or
// parse failure is fatal.

use std::io::{BufReader, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use anyhow::{bail, Context, Result};
use log::{debug, warn};

use crate::affinity::CoreClass;

/// Longest well-formed response: one integer and a newline.
const MAX_RESPONSE_LEN: usize = 64;

/// Per-round counter deltas plus the class sentinel, in the order the
/// classifier was trained on.
#[derive(Debug, Clone, Copy)]
pub struct PhaseSample {
    pub cpu_cycles: u64,
    pub inst_retired: u64,
    pub l2d_cache: u64,
    pub l2d_cache_refill: u64,
    pub br_mis_pred: u64,
    /// 0 when currently on the little set, 4 on the big set (the
    /// cluster encoding the model was trained with).
    pub cluster: u64,
}

impl PhaseSample {
    pub fn cluster_for(class: CoreClass) -> u64 {
        match class {
            CoreClass::Little => 0,
            CoreClass::Big => 4,
        }
    }
}

/// The classifier seam. The scheduler only ever talks to this trait,
/// so the subprocess can be swapped for an in-process model.
pub trait PhasePredictor {
    fn predict(&mut self, sample: &PhaseSample) -> Result<i64>;
}

/// Classifier reached over a subprocess's stdio pipes. Owns the
/// subprocess lifecycle; the child is killed when this is dropped and
/// additionally dies with the controller via PDEATHSIG.
pub struct PredictorChannel {
    child: Child,
    request_pipe: ChildStdin,
    response_pipe: BufReader<ChildStdout>,
}

impl PredictorChannel {
    /// Launch `command` through the shell with both data pipes
    /// attached.
    pub fn spawn(command: &str) -> Result<Self> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        unsafe {
            cmd.pre_exec(|| {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
                Ok(())
            });
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn predictor {:?}", command))?;
        debug!("predictor {:?} running as pid {}", command, child.id());

        let request_pipe = child.stdin.take().context("predictor stdin missing")?;
        let response_pipe =
            BufReader::new(child.stdout.take().context("predictor stdout missing")?);
        Ok(Self {
            child,
            request_pipe,
            response_pipe,
        })
    }

    fn read_response_line(&mut self) -> Result<String> {
        // Accumulate bytes until the frame terminator; a stream closed
        // mid-line or an overlong response is a broken collaborator.
        let mut line = Vec::with_capacity(MAX_RESPONSE_LEN);
        let mut byte = [0u8; 1];
        loop {
            match self
                .response_pipe
                .read(&mut byte)
                .context("read predictor response")?
            {
                0 => bail!("predictor closed its pipe mid-response"),
                _ => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    if line.len() >= MAX_RESPONSE_LEN {
                        bail!("predictor response exceeds {} bytes", MAX_RESPONSE_LEN);
                    }
                    line.push(byte[0]);
                }
            }
        }
        String::from_utf8(line).context("predictor response is not ASCII")
    }
}

impl PhasePredictor for PredictorChannel {
    fn predict(&mut self, sample: &PhaseSample) -> Result<i64> {
        let request = format!(
            "{},{},{},{},{},{}\n",
            sample.cpu_cycles,
            sample.inst_retired,
            sample.l2d_cache,
            sample.l2d_cache_refill,
            sample.br_mis_pred,
            sample.cluster,
        );

        self.request_pipe
            .write_all(request.as_bytes())
            .context("write predictor request")?;
        self.request_pipe.flush().context("flush predictor request")?;

        let line = self.read_response_line()?;
        let phase = line
            .trim()
            .parse::<i64>()
            .with_context(|| format!("malformed predictor response {:?}", line))?;
        debug!("predictor replied phase {}", phase);
        Ok(phase)
    }
}

impl Drop for PredictorChannel {
    fn drop(&mut self) {
        if let Err(err) = self.child.kill() {
            warn!("failed to kill predictor: {}", err);
        }
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PhaseSample {
        PhaseSample {
            cpu_cycles: 1000,
            inst_retired: 800,
            l2d_cache: 60,
            l2d_cache_refill: 5,
            br_mis_pred: 9,
            cluster: 4,
        }
    }

    #[test]
    fn round_trips_one_request_per_line() {
        // Echo predictor: replies with the request's last field.
        let mut chan =
            PredictorChannel::spawn("while read line; do echo ${line##*,}; done").unwrap();
        assert_eq!(chan.predict(&sample()).unwrap(), 4);

        let mut second = sample();
        second.cluster = 0;
        assert_eq!(chan.predict(&second).unwrap(), 0);
    }

    #[test]
    fn malformed_response_is_fatal() {
        let mut chan = PredictorChannel::spawn("while read line; do echo nonsense; done").unwrap();
        assert!(chan.predict(&sample()).is_err());
    }

    #[test]
    fn closed_pipe_is_fatal() {
        let mut chan = PredictorChannel::spawn("exec true").unwrap();
        assert!(chan.predict(&sample()).is_err());
    }

    #[test]
    fn cluster_sentinel_matches_training_format() {
        assert_eq!(PhaseSample::cluster_for(CoreClass::Little), 0);
        assert_eq!(PhaseSample::cluster_for(CoreClass::Big), 4);
    }
}
