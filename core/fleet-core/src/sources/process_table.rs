//! Process-table sampler built on `sysinfo`.
//!
//! Keeps one `System` across samples so CPU usage has a previous reading to
//! diff against. Only processes whose executable name is in the monitored set
//! are reported.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use sysinfo::{ProcessRefreshKind, System, UpdateKind};

use super::ProcessSource;
use crate::patterns::session_id_from_command;
use crate::types::MonitoredProcess;

pub struct SysinfoProcessSampler {
    system: System,
    executables: Vec<String>,
    first_seen: HashMap<(u32, u64), DateTime<Utc>>,
}

impl SysinfoProcessSampler {
    pub fn new(executables: Vec<String>) -> Self {
        Self {
            system: System::new(),
            executables,
            first_seen: HashMap::new(),
        }
    }

    fn is_monitored(&self, name: &str, cmd: &[String]) -> bool {
        let argv0 = cmd
            .first()
            .and_then(|arg| Path::new(arg).file_name())
            .map(|name| name.to_string_lossy().to_string());
        self.executables.iter().any(|exe| {
            exe == name || argv0.as_deref() == Some(exe.as_str())
        })
    }
}

impl ProcessSource for SysinfoProcessSampler {
    fn sample(&mut self, now: DateTime<Utc>) -> Vec<MonitoredProcess> {
        self.system.refresh_processes_specifics(
            ProcessRefreshKind::new()
                .with_cmd(UpdateKind::OnlyIfNotSet)
                .with_memory()
                .with_cpu(),
        );

        let mut processes = Vec::new();
        for (pid, process) in self.system.processes() {
            let cmd = process.cmd();
            if !self.is_monitored(process.name(), cmd) {
                continue;
            }
            let command_line = cmd.join(" ");
            processes.push(MonitoredProcess {
                pid: pid.as_u32(),
                start_time: process.start_time(),
                rss_bytes: process.memory(),
                cpu_percent: process.cpu_usage(),
                session_id: session_id_from_command(&command_line),
                first_observed: now,
            });
        }

        carry_first_observed(&mut self.first_seen, &mut processes, now);
        processes.sort_by_key(|process| process.pid);
        processes
    }
}

/// Stamps each process with the time its `(pid, start_time)` was first seen
/// and forgets fingerprints that are no longer present.
pub(crate) fn carry_first_observed(
    first_seen: &mut HashMap<(u32, u64), DateTime<Utc>>,
    processes: &mut [MonitoredProcess],
    now: DateTime<Utc>,
) {
    let mut current = HashMap::with_capacity(processes.len());
    for process in processes.iter_mut() {
        let key = process.fingerprint();
        let first = first_seen.get(&key).copied().unwrap_or(now);
        process.first_observed = first;
        current.insert(key, first);
    }
    *first_seen = current;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(pid: u32, start_time: u64, now: DateTime<Utc>) -> MonitoredProcess {
        MonitoredProcess {
            pid,
            start_time,
            rss_bytes: 0,
            cpu_percent: 0.0,
            session_id: None,
            first_observed: now,
        }
    }

    #[test]
    fn first_observed_survives_until_the_fingerprint_changes() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(10);
        let mut first_seen = HashMap::new();

        let mut batch = vec![process(42, 100, t0)];
        carry_first_observed(&mut first_seen, &mut batch, t0);

        let mut batch = vec![process(42, 100, t1), process(43, 100, t1)];
        carry_first_observed(&mut first_seen, &mut batch, t1);
        assert_eq!(batch[0].first_observed, t0);
        assert_eq!(batch[1].first_observed, t1);

        // Same pid, new incarnation.
        let mut batch = vec![process(42, 200, t1)];
        carry_first_observed(&mut first_seen, &mut batch, t1);
        assert_eq!(batch[0].first_observed, t1);
        assert_eq!(first_seen.len(), 1);
    }

    #[test]
    fn matches_by_name_or_argv0() {
        let sampler = SysinfoProcessSampler::new(vec!["opencode".to_string()]);
        assert!(sampler.is_monitored("opencode", &[]));
        assert!(sampler.is_monitored(
            "node",
            &["/usr/local/bin/opencode".to_string(), "-s".to_string()]
        ));
        assert!(!sampler.is_monitored("bash", &["bash".to_string()]));
    }
}
