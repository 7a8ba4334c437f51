//! Memory watchdog: graceful-then-forceful termination of runaway processes.
//!
//! Per process the lifecycle is
//! `healthy -> over-limit -> term-sent -> (gone | kill-sent -> gone)`.
//! A kill is sent at most once per process incarnation, delivered or not.
//! The grace period is measured across calls to [`Watchdog::enforce`]; it
//! never sleeps. State is keyed by pid and fingerprinted with the process
//! start time, so a recycled pid starts fresh.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::io;

use crate::config::WatchdogConfig;
use crate::types::MonitoredProcess;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Terminate,
    Kill,
}

/// Delivers signals. Implementations must refuse to signal a pid whose
/// start time no longer matches.
pub trait ProcessSignaller: Send {
    fn signal(&self, pid: u32, start_time: u64, signal: Signal) -> io::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KillAction {
    pub pid: u32,
    pub start_time: u64,
    pub signal: Signal,
    pub rss_bytes: u64,
    pub session_id: Option<String>,
    pub at: DateTime<Utc>,
    /// False when delivery failed; the action still counts as taken.
    pub delivered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    TermSent { at: DateTime<Utc> },
    KillSent { at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy)]
struct WatchEntry {
    start_time: u64,
    phase: WatchPhase,
}

pub struct Watchdog {
    ceiling_bytes: u64,
    grace: Duration,
    signaller: Box<dyn ProcessSignaller>,
    entries: HashMap<u32, WatchEntry>,
}

impl Watchdog {
    pub fn new(ceiling_bytes: u64, grace: Duration, signaller: Box<dyn ProcessSignaller>) -> Self {
        Self {
            ceiling_bytes,
            grace,
            signaller,
            entries: HashMap::new(),
        }
    }

    pub fn from_config(config: &WatchdogConfig, signaller: Box<dyn ProcessSignaller>) -> Self {
        Self::new(
            config.memory_ceiling_bytes,
            Duration::seconds(config.grace_secs.max(0)),
            signaller,
        )
    }

    pub fn phase_of(&self, pid: u32) -> Option<WatchPhase> {
        self.entries.get(&pid).map(|entry| entry.phase)
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    pub fn enforce(&mut self, processes: &[MonitoredProcess], now: DateTime<Utc>) -> Vec<KillAction> {
        let mut actions = Vec::new();

        // Pids absent from the sample have exited.
        self.entries
            .retain(|pid, _| processes.iter().any(|process| process.pid == *pid));

        for process in processes {
            if let Some(entry) = self.entries.get(&process.pid) {
                if entry.start_time != process.start_time {
                    tracing::debug!(pid = process.pid, "Pid reused; dropping stale watchdog state");
                    self.entries.remove(&process.pid);
                }
            }

            if process.rss_bytes <= self.ceiling_bytes {
                self.entries.remove(&process.pid);
                continue;
            }

            // KillSent is terminal: nothing more is sent to this incarnation.
            let next = match self.entries.get(&process.pid).map(|entry| entry.phase) {
                None => Some(Signal::Terminate),
                Some(WatchPhase::TermSent { at }) if now - at >= self.grace => Some(Signal::Kill),
                Some(_) => None,
            };
            let Some(signal) = next else {
                continue;
            };

            let delivered = match self.signaller.signal(process.pid, process.start_time, signal) {
                Ok(()) => true,
                Err(err) => {
                    // Already gone or not ours to kill; either way nothing to retry.
                    tracing::info!(
                        pid = process.pid,
                        signal = ?signal,
                        error = %err,
                        "Watchdog signal not delivered"
                    );
                    false
                }
            };
            tracing::warn!(
                pid = process.pid,
                rss_bytes = process.rss_bytes,
                ceiling_bytes = self.ceiling_bytes,
                signal = ?signal,
                session_id = process.session_id.as_deref().unwrap_or(""),
                "Watchdog terminating process over memory ceiling"
            );

            let phase = match signal {
                Signal::Terminate => WatchPhase::TermSent { at: now },
                Signal::Kill => WatchPhase::KillSent { at: now },
            };
            self.entries.insert(
                process.pid,
                WatchEntry {
                    start_time: process.start_time,
                    phase,
                },
            );
            actions.push(KillAction {
                pid: process.pid,
                start_time: process.start_time,
                signal,
                rss_bytes: process.rss_bytes,
                session_id: process.session_id.clone(),
                at: now,
                delivered,
            });
        }

        actions
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OS Signaller
// ═══════════════════════════════════════════════════════════════════════════════

/// Sends real signals after re-checking the start-time fingerprint.
#[derive(Debug, Default)]
pub struct OsSignaller;

impl ProcessSignaller for OsSignaller {
    fn signal(&self, pid: u32, start_time: u64, signal: Signal) -> io::Result<()> {
        if process_start_time(pid) != Some(start_time) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "process exited or pid was reused",
            ));
        }
        send_signal(pid, signal)
    }
}

fn process_start_time(pid: u32) -> Option<u64> {
    use sysinfo::{Pid, ProcessRefreshKind, System};

    let mut sys = System::new();
    let sys_pid = Pid::from_u32(pid);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid).map(|process| process.start_time())
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    let raw = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let Ok(pid) = i32::try_from(pid) else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"));
    };
    // SAFETY: kill(2) with a validated positive pid and a standard signal.
    // ESRCH (already exited) is reported as an error and logged by the caller.
    #[allow(unsafe_code)]
    let result = unsafe { libc::kill(pid, raw) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: Signal) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signals are only supported on unix",
    ))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every signal instead of sending it.
    #[derive(Clone, Default)]
    pub struct RecordingSignaller {
        pub sent: Arc<Mutex<Vec<(u32, Signal)>>>,
        pub fail: bool,
    }

    impl ProcessSignaller for RecordingSignaller {
        fn signal(&self, pid: u32, _start_time: u64, signal: Signal) -> io::Result<()> {
            self.sent.lock().expect("sent lock").push((pid, signal));
            if self.fail {
                return Err(io::Error::from_raw_os_error(libc::ESRCH));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingSignaller;
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn process(pid: u32, start_time: u64, rss_bytes: u64, now: DateTime<Utc>) -> MonitoredProcess {
        MonitoredProcess {
            pid,
            start_time,
            rss_bytes,
            cpu_percent: 0.0,
            session_id: None,
            first_observed: now,
        }
    }

    fn watchdog(signaller: &RecordingSignaller) -> Watchdog {
        Watchdog::new(8 * GIB, Duration::seconds(5), Box::new(signaller.clone()))
    }

    #[test]
    fn below_ceiling_is_never_signalled() {
        let signaller = RecordingSignaller::default();
        let mut dog = watchdog(&signaller);
        let now = Utc::now();
        for step in 0..5 {
            let at = now + Duration::seconds(step * 10);
            assert!(dog.enforce(&[process(1, 10, 8 * GIB, at)], at).is_empty());
        }
        assert!(signaller.sent.lock().expect("lock").is_empty());
    }

    #[test]
    fn term_then_kill_after_grace() {
        let signaller = RecordingSignaller::default();
        let mut dog = watchdog(&signaller);
        let t0 = Utc::now();
        let fat = |at| [process(7, 10, 9 * GIB, at)];

        let actions = dog.enforce(&fat(t0), t0);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].signal, Signal::Terminate);

        let t1 = t0 + Duration::seconds(2);
        assert!(dog.enforce(&fat(t1), t1).is_empty());

        let t2 = t0 + Duration::seconds(6);
        let actions = dog.enforce(&fat(t2), t2);
        assert_eq!(actions[0].signal, Signal::Kill);
        assert!(matches!(dog.phase_of(7), Some(WatchPhase::KillSent { .. })));

        // Gone: state dropped.
        let t3 = t0 + Duration::seconds(7);
        assert!(dog.enforce(&[], t3).is_empty());
        assert_eq!(dog.tracked(), 0);

        let sent = signaller.sent.lock().expect("lock").clone();
        assert_eq!(sent, vec![(7, Signal::Terminate), (7, Signal::Kill)]);
    }

    #[test]
    fn reused_pid_starts_fresh() {
        let signaller = RecordingSignaller::default();
        let mut dog = watchdog(&signaller);
        let t0 = Utc::now();
        dog.enforce(&[process(7, 10, 9 * GIB, t0)], t0);

        let t1 = t0 + Duration::seconds(10);
        let actions = dog.enforce(&[process(7, 99, 9 * GIB, t1)], t1);
        assert_eq!(actions[0].signal, Signal::Terminate);
    }

    #[test]
    fn delivery_failure_is_treated_as_done() {
        let signaller = RecordingSignaller {
            fail: true,
            ..RecordingSignaller::default()
        };
        let mut dog = watchdog(&signaller);
        let t0 = Utc::now();
        let actions = dog.enforce(&[process(7, 10, 9 * GIB, t0)], t0);
        assert!(!actions[0].delivered);

        let t1 = t0 + Duration::seconds(1);
        assert!(dog.enforce(&[process(7, 10, 9 * GIB, t1)], t1).is_empty());
    }

    #[test]
    fn kill_is_sent_once_even_when_delivery_keeps_failing() {
        let signaller = RecordingSignaller {
            fail: true,
            ..RecordingSignaller::default()
        };
        let mut dog = watchdog(&signaller);
        let t0 = Utc::now();

        let mut actions = Vec::new();
        for step in 0..12 {
            let at = t0 + Duration::seconds(step * 6);
            actions.extend(dog.enforce(&[process(7, 10, 9 * GIB, at)], at));
        }

        let signals: Vec<Signal> = actions.iter().map(|action| action.signal).collect();
        assert_eq!(signals, vec![Signal::Terminate, Signal::Kill]);
        assert!(matches!(dog.phase_of(7), Some(WatchPhase::KillSent { .. })));
        assert_eq!(
            signaller.sent.lock().expect("lock").clone(),
            vec![(7, Signal::Terminate), (7, Signal::Kill)]
        );

        // A new incarnation on the same pid starts over.
        let later = t0 + Duration::seconds(120);
        let actions = dog.enforce(&[process(7, 11, 9 * GIB, later)], later);
        assert_eq!(actions[0].signal, Signal::Terminate);
    }

    #[test]
    fn os_signaller_refuses_mismatched_fingerprint() {
        let err = OsSignaller
            .signal(std::process::id(), 1, Signal::Terminate)
            .expect_err("fingerprint mismatch");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
