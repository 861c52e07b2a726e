//! kmemleak scanner.
//!
//! Scans are expensive and must run with no prog executing; the gate's
//! barrier provides that, this module only drives the kernel interface.

use anyhow::Context;
use hornet_exec::features::KMEMLEAK_PATH;
use std::{
    fs::{read_to_string, OpenOptions},
    io::Write,
    sync::Mutex,
    thread::sleep,
    time::{Duration, Instant},
};

/// Leave the kernel some room between scans; kmemleak is slow and a scan
/// right after the previous one reports mostly transient objects.
const MIN_SCAN_INTERVAL: Duration = Duration::from_secs(10);

pub struct LeakScanner {
    enabled: bool,
    last_scan: Mutex<Option<Instant>>,
}

impl LeakScanner {
    /// Prepare kmemleak for on-demand scanning and drop the boot-time
    /// records, which are not caused by fuzzing.
    pub fn init(enabled: bool) -> anyhow::Result<Self> {
        if !enabled {
            return Ok(Self {
                enabled: false,
                last_scan: Mutex::new(None),
            });
        }
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(KMEMLEAK_PATH)
            .context("kmemleak interface unavailable")?;
        // kernel-side periodic scans would race with the gate barrier
        let _ = f.write_all(b"scan=off");
        f.write_all(b"clear").context("failed to reset kmemleak baseline")?;
        Ok(Self {
            enabled: true,
            last_scan: Mutex::new(None),
        })
    }

    /// Run one scan; with `report` false only a new baseline is taken.
    /// Callers are responsible for quiescing execution first.
    pub fn scan(&self, report: bool) {
        if !self.enabled {
            return;
        }
        {
            let mut last = self.last_scan.lock().unwrap();
            if let Some(t) = *last {
                if t.elapsed() < MIN_SCAN_INTERVAL {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        if let Err(e) = self.scan_inner(report) {
            log::warn!("kmemleak scan failed: {}", e);
        }
    }

    fn scan_inner(&self, report: bool) -> anyhow::Result<()> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(KMEMLEAK_PATH)?;
        f.write_all(b"scan")?;
        // kmemleak wants a settle period before the results stabilize
        sleep(Duration::from_secs(1));

        if report {
            let records = read_to_string(KMEMLEAK_PATH)?;
            let leaks = records
                .split("unreferenced object")
                .skip(1)
                .count();
            if leaks != 0 {
                log::warn!("kmemleak: {} unreferenced objects:\n{}", leaks, records);
            }
        }
        f.write_all(b"clear")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_scanner_is_inert() {
        let scanner = LeakScanner::init(false).unwrap();
        scanner.scan(true);
        scanner.scan(false);
        assert!(scanner.last_scan.lock().unwrap().is_none());
    }
}
