/*
 * Copyright (C) 2026 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use super::heartbeat::MemberStatus;
use super::{Role, Topology};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;

// a spawned member gets this many intervals to write its first heartbeat
const SPAWN_GRACE_INTERVALS: i64 = 3;

pub trait Spawner: Send {
    fn spawn(&self, member_id: u16, role: Role) -> Result<(), io::Error>;
}

pub trait ProcessProbe: Send {
    fn exists(&self, pid: u32) -> bool;
}

// signal 0 checks for existence without delivering anything
pub struct KillProbe;

impl ProcessProbe for KillProbe {
    fn exists(&self, pid: u32) -> bool {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }

        // SAFETY: signal 0 performs only the permission and existence check
        let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };

        if ret == 0 {
            return true;
        }

        // exists, but belongs to someone else
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

// runs this same executable with the member id as its argument
pub struct ExecSpawner {
    exe: PathBuf,
    config_file: Option<PathBuf>,
    log_level: Option<u8>,
}

impl ExecSpawner {
    pub fn new(exe: PathBuf, config_file: Option<PathBuf>, log_level: Option<u8>) -> Self {
        Self {
            exe,
            config_file,
            log_level,
        }
    }

    pub fn current(config_file: Option<PathBuf>, log_level: Option<u8>) -> Result<Self, io::Error> {
        Ok(Self::new(std::env::current_exe()?, config_file, log_level))
    }

    pub fn args(&self, member_id: u16) -> Vec<String> {
        let mut args = vec![member_id.to_string()];

        if let Some(path) = &self.config_file {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }

        if let Some(level) = self.log_level {
            args.push("--log-level".to_string());
            args.push(level.to_string());
        }

        args
    }
}

impl Spawner for ExecSpawner {
    fn spawn(&self, member_id: u16, role: Role) -> Result<(), io::Error> {
        let args = self.args(member_id);

        debug!("running: {} {}", self.exe.display(), args.join(" "));

        let mut child = Command::new(&self.exe).args(&args).spawn()?;

        info!(
            "spawned member {} ({:?}) as pid {}",
            member_id,
            role,
            child.id()
        );

        // reap the child so it does not linger as a zombie
        thread::Builder::new()
            .name(format!("reaper-{}", member_id))
            .spawn(move || match child.wait() {
                Ok(status) if status.success() => info!("member {} exited", member_id),
                Ok(status) => warn!("member {} exited: {}", member_id, status),
                Err(e) => error!("failed to wait for member {}: {}", member_id, e),
            })?;

        Ok(())
    }
}

// brings the set of running members in line with the topology
pub struct Reconciler {
    topology: Topology,
    self_id: u16,
    interval: Duration,
    spawner: Box<dyn Spawner>,
    probe: Box<dyn ProcessProbe>,

    // when each member was last spawned by us
    recent: HashMap<u16, i64>,
}

impl Reconciler {
    pub fn new(
        topology: Topology,
        self_id: u16,
        interval: Duration,
        spawner: Box<dyn Spawner>,
        probe: Box<dyn ProcessProbe>,
    ) -> Self {
        Self {
            topology,
            self_id,
            interval,
            spawner,
            probe,
            recent: HashMap::new(),
        }
    }

    fn is_running(&self, statuses: &[MemberStatus], id: u16) -> bool {
        match statuses.iter().find(|s| s.id == id) {
            Some(s) => s.live && self.probe.exists(s.record.pid),
            None => false,
        }
    }

    // spawn every expected member that is not running. safe to repeat, and
    // safe for two members to run concurrently. returns the ids spawned
    pub fn ensure(&mut self, statuses: &[MemberStatus], now_ms: i64) -> Vec<u16> {
        let grace = self.interval.as_millis() as i64 * SPAWN_GRACE_INTERVALS;

        let mut spawned = Vec::new();

        for id in self.topology.expected_ids() {
            if id == self.self_id {
                continue;
            }

            if self.is_running(statuses, id) {
                self.recent.remove(&id);
                continue;
            }

            if let Some(t) = self.recent.get(&id) {
                if now_ms - t < grace {
                    continue;
                }
            }

            let role = match self.topology.role_of(id) {
                Some(role) => role,
                None => continue,
            };

            info!("member {} is missing, spawning", id);

            match self.spawner.spawn(id, role) {
                Ok(()) => {
                    self.recent.insert(id, now_ms);
                    spawned.push(id);
                }
                // retried next tick
                Err(e) => error!("failed to spawn member {}: {}", id, e),
            }
        }

        spawned
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::cluster::table::MemberRecord;
    use std::process;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct RecordingSpawner {
        pub spawned: Arc<Mutex<Vec<(u16, Role)>>>,
    }

    impl Spawner for RecordingSpawner {
        fn spawn(&self, member_id: u16, role: Role) -> Result<(), io::Error> {
            self.spawned.lock().unwrap().push((member_id, role));

            Ok(())
        }
    }

    struct FailingSpawner;

    impl Spawner for FailingSpawner {
        fn spawn(&self, _member_id: u16, _role: Role) -> Result<(), io::Error> {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }

    pub struct AnyPid;

    impl ProcessProbe for AnyPid {
        fn exists(&self, pid: u32) -> bool {
            pid != 0
        }
    }

    fn status(id: u16, pid: u32, live: bool) -> MemberStatus {
        MemberStatus {
            id,
            record: MemberRecord {
                pid,
                ..Default::default()
            },
            age_ms: 0,
            live,
        }
    }

    const INTERVAL: Duration = Duration::from_millis(1000);

    #[test]
    fn spawns_missing_with_their_roles() {
        let spawner = RecordingSpawner::default();

        let mut r = Reconciler::new(
            Topology::new(8, 2, 2),
            0,
            INTERVAL,
            Box::new(spawner.clone()),
            Box::new(AnyPid),
        );

        // 1 is up, 2 is stale, 3 never started
        let statuses = vec![status(0, 10, true), status(1, 11, true), status(2, 12, false)];

        assert_eq!(r.ensure(&statuses, 10_000), vec![2, 3]);
        assert_eq!(
            *spawner.spawned.lock().unwrap(),
            vec![(2, Role::Worker), (3, Role::Worker)]
        );

        // within the grace period nothing is spawned again
        assert!(r.ensure(&statuses, 12_999).is_empty());

        // 2 came up, 3 did not
        let statuses = vec![status(0, 10, true), status(1, 11, true), status(2, 22, true)];
        assert_eq!(r.ensure(&statuses, 13_000), vec![3]);
    }

    #[test]
    fn dead_pid_counts_as_missing() {
        struct NoPids;

        impl ProcessProbe for NoPids {
            fn exists(&self, _pid: u32) -> bool {
                false
            }
        }

        let spawner = RecordingSpawner::default();

        let mut r = Reconciler::new(
            Topology::new(4, 1, 1),
            0,
            INTERVAL,
            Box::new(spawner.clone()),
            Box::new(NoPids),
        );

        // fresh heartbeat, but the process is gone
        assert_eq!(r.ensure(&[status(1, 99, true)], 0), vec![1]);
        assert_eq!(*spawner.spawned.lock().unwrap(), vec![(1, Role::Worker)]);
    }

    #[test]
    fn failed_spawn_is_retried() {
        let mut r = Reconciler::new(
            Topology::new(4, 2, 0),
            1,
            INTERVAL,
            Box::new(FailingSpawner),
            Box::new(AnyPid),
        );

        assert!(r.ensure(&[], 0).is_empty());
        assert!(r.recent.is_empty());
    }

    #[test]
    fn kill_probe() {
        assert!(KillProbe.exists(process::id()));
        assert!(!KillProbe.exists(0));
        assert!(!KillProbe.exists(u32::MAX));
    }

    #[test]
    fn exec_args() {
        let s = ExecSpawner::new(
            PathBuf::from("/usr/bin/relaygate"),
            Some(PathBuf::from("/etc/relaygate.conf")),
            Some(3),
        );

        assert_eq!(
            s.args(4),
            vec!["4", "--config", "/etc/relaygate.conf", "--log-level", "3"]
        );

        let s = ExecSpawner::new(PathBuf::from("/usr/bin/relaygate"), None, None);
        assert_eq!(s.args(0), vec!["0"]);
    }
}
