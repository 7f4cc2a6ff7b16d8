// SPDX-License-Identifier: GPL-2.0
//
// Power/energy telemetry from the platform fuel gauge.
//
// The sensor endpoints are sysfs power-supply attributes reporting
// instantaneous readings as ASCII integers in microvolts and
// microamps. Each sample converts to millivolts/milliamps before
// accumulating; all derived quantities (average power, energy) are
// computed once at finalization so rounding error does not compound
// across samples.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EnergyReport {
    pub avg_power_mw: i64,
    pub elapsed_ms: i64,
    pub energy_mj: i64,
}

pub struct EnergyMonitor {
    voltage: File,
    current: File,
    voltage_sum_mv: i64,
    current_sum_ma: i64,
    samples: i64,
}

fn read_sensor(file: &mut File, what: &str) -> Result<i64> {
    file.seek(SeekFrom::Start(0))
        .with_context(|| format!("seek {} sensor", what))?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)
        .with_context(|| format!("read {} sensor", what))?;
    buf.trim()
        .parse::<i64>()
        .with_context(|| format!("{} sensor returned {:?}", what, buf))
}

impl EnergyMonitor {
    pub fn open<P: AsRef<Path>>(voltage_path: P, current_path: P) -> Result<Self> {
        let voltage = File::open(&voltage_path)
            .with_context(|| format!("open voltage sensor {:?}", voltage_path.as_ref()))?;
        let current = File::open(&current_path)
            .with_context(|| format!("open current sensor {:?}", current_path.as_ref()))?;
        Ok(Self {
            voltage,
            current,
            voltage_sum_mv: 0,
            current_sum_ma: 0,
            samples: 0,
        })
    }

    /// One paired voltage/current reading added to the running sums.
    pub fn sample(&mut self) -> Result<()> {
        let uv = read_sensor(&mut self.voltage, "voltage")?;
        let ua = read_sensor(&mut self.current, "current")?;

        self.voltage_sum_mv += uv / 1000;
        self.current_sum_ma += ua / 1000;
        self.samples += 1;
        Ok(())
    }

    pub fn samples(&self) -> i64 {
        self.samples
    }

    /// Average power and total energy over `elapsed`. Only valid once
    /// at least one sample has been taken.
    pub fn finalize(&self, elapsed: Duration) -> Result<EnergyReport> {
        if self.samples == 0 {
            bail!("no energy samples taken; cannot finalize");
        }

        let avg_power_mw =
            (self.voltage_sum_mv / self.samples) * (self.current_sum_ma / self.samples) / 1000;
        let elapsed_ms = elapsed.as_millis() as i64;
        let energy_mj = avg_power_mw * elapsed_ms / 1000;

        Ok(EnergyReport {
            avg_power_mw,
            elapsed_ms,
            energy_mj,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sensor(contents: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "{}", contents).unwrap();
        f
    }

    #[test]
    fn accumulates_and_finalizes() {
        let v = sensor("3700000\n"); // 3.7 V
        let c = sensor("2000000\n"); // 2.0 A
        let mut mon = EnergyMonitor::open(v.path(), c.path()).unwrap();

        mon.sample().unwrap();
        mon.sample().unwrap();
        assert_eq!(mon.samples(), 2);

        let report = mon.finalize(Duration::from_millis(1000)).unwrap();
        // 3700 mV * 2000 mA / 1000 = 7400 mW
        assert_eq!(report.avg_power_mw, 7400);
        assert_eq!(report.elapsed_ms, 1000);
        assert_eq!(report.energy_mj, 7400);
    }

    #[test]
    fn rereads_sensor_every_sample() {
        let v = sensor("1000000\n");
        let c = sensor("1000000\n");
        let mut mon = EnergyMonitor::open(v.path(), c.path()).unwrap();

        mon.sample().unwrap();
        std::fs::write(v.path(), "3000000\n").unwrap();
        mon.sample().unwrap();

        // avg voltage (1000 + 3000) / 2 = 2000 mV, current 1000 mA
        let report = mon.finalize(Duration::from_millis(500)).unwrap();
        assert_eq!(report.avg_power_mw, 2000);
        assert_eq!(report.energy_mj, 1000);
    }

    #[test]
    fn zero_samples_is_guarded() {
        let v = sensor("1\n");
        let c = sensor("1\n");
        let mon = EnergyMonitor::open(v.path(), c.path()).unwrap();
        assert!(mon.finalize(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn garbage_sensor_data_is_fatal() {
        let v = sensor("not-a-number\n");
        let c = sensor("1000000\n");
        let mut mon = EnergyMonitor::open(v.path(), c.path()).unwrap();
        assert!(mon.sample().is_err());
    }

    #[test]
    fn missing_endpoint_fails_open() {
        let c = sensor("1\n");
        let missing = std::path::Path::new("/nonexistent/voltage_now");
        assert!(EnergyMonitor::open(missing, c.path()).is_err());
    }
}
