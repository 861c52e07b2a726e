//! Execution gate: bounded concurrency plus a quiescence barrier.
//!
//! Every proc wraps each executor round-trip in `enter`/`leave`. At most
//! `cap` executions are in flight; periodically the gate drains to zero,
//! runs the leak-scan callback while nothing executes, then releases the
//! waiters. This is the only mechanism serializing leak scans with
//! execution.

use std::sync::{Condvar, Mutex};

pub type ScanCallback = Box<dyn Fn() + Send + Sync>;

#[must_use = "a ticket must be returned via Gate::leave"]
#[derive(Debug)]
pub struct Ticket {
    _priv: (),
}

#[derive(Debug, Default)]
struct GateState {
    in_flight: usize,
    completed: u64,
    scanning: bool,
}

pub struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
    cap: usize,
    scan_period: u64,
    scan: Option<ScanCallback>,
}

impl Gate {
    /// `scan` runs after every `scan_period` completed executions, with all
    /// tickets returned and new entries suspended.
    pub fn new(cap: usize, scan_period: u64, scan: Option<ScanCallback>) -> Self {
        assert!(cap > 0 && scan_period > 0);
        Self {
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
            cap,
            scan_period,
            scan,
        }
    }

    /// Suspends while the gate is full or a scan is in progress.
    pub fn enter(&self) -> Ticket {
        let mut st = self.state.lock().unwrap();
        while st.in_flight >= self.cap || st.scanning {
            st = self.cond.wait(st).unwrap();
        }
        st.in_flight += 1;
        Ticket { _priv: () }
    }

    pub fn leave(&self, ticket: Ticket) {
        drop(ticket);
        let mut st = self.state.lock().unwrap();
        st.in_flight -= 1;
        st.completed += 1;

        let scan_due =
            self.scan.is_some() && !st.scanning && st.completed >= self.scan_period;
        if !scan_due {
            self.cond.notify_all();
            return;
        }

        // barrier: block new entries, drain the in-flight tickets
        st.scanning = true;
        st.completed = 0;
        while st.in_flight > 0 {
            st = self.cond.wait(st).unwrap();
        }
        drop(st);
        // quiesced; `scanning` keeps the gate shut without holding the lock
        (self.scan.as_ref().unwrap())();
        let mut st = self.state.lock().unwrap();
        st.scanning = false;
        drop(st);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::thread;
    use std::time::Duration;

    #[test]
    fn cap_is_respected() {
        let gate = Arc::new(Gate::new(4, u64::MAX, None));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(thread::spawn(move || {
                for _ in 0..64 {
                    let ticket = gate.enter();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_micros(50));
                    active.fetch_sub(1, Ordering::SeqCst);
                    gate.leave(ticket);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[test]
    fn scan_observes_quiescence() {
        let active = Arc::new(AtomicUsize::new(0));
        let scans = Arc::new(AtomicUsize::new(0));
        let gate = {
            let active = Arc::clone(&active);
            let scans = Arc::clone(&scans);
            Arc::new(Gate::new(
                3,
                16,
                Some(Box::new(move || {
                    assert_eq!(active.load(Ordering::SeqCst), 0);
                    scans.fetch_add(1, Ordering::SeqCst);
                })),
            ))
        };

        let mut handles = Vec::new();
        for _ in 0..6 {
            let gate = Arc::clone(&gate);
            let active = Arc::clone(&active);
            handles.push(thread::spawn(move || {
                for _ in 0..64 {
                    let ticket = gate.enter();
                    active.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_micros(20));
                    active.fetch_sub(1, Ordering::SeqCst);
                    gate.leave(ticket);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // 6 * 64 executions with a period of 16 must have scanned
        assert!(scans.load(Ordering::SeqCst) >= 1);
    }
}
