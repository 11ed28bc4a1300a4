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

use super::respawn::Reconciler;
use super::table::{ManagerClaim, MemberRecord, MembershipTable, ResourceSnapshot, TableError};
use super::Role;
use crate::balancer::Liveness;
use crate::core::time::epoch_millis;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

// a member is down once its heartbeat is older than 1.25 intervals
pub fn is_down(now_ms: i64, timestamp_ms: i64, interval: Duration) -> bool {
    let age = (now_ms as i128) - (timestamp_ms as i128);

    age * 4 > (interval.as_millis() as i128) * 5
}

// the manager role is up for grabs once unclaimed or unrefreshed for two
// intervals
pub fn manager_is_stale(now_ms: i64, claim: &ManagerClaim, interval: Duration) -> bool {
    if claim.member_id.is_none() {
        return true;
    }

    let age = (now_ms as i128) - (claim.timestamp_ms as i128);

    age > (interval.as_millis() as i128) * 2
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberStatus {
    pub id: u16,
    pub record: MemberRecord,
    pub age_ms: i64,
    pub live: bool,
}

// the most recent survey of the table, shared with readers
#[derive(Clone, Default)]
pub struct LiveView {
    inner: Arc<RwLock<Vec<MemberStatus>>>,
}

impl LiveView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, statuses: Vec<MemberStatus>) {
        *self.inner.write().unwrap() = statuses;
    }

    pub fn snapshot(&self) -> Vec<MemberStatus> {
        self.inner.read().unwrap().clone()
    }

    pub fn get(&self, id: u16) -> Option<MemberStatus> {
        self.inner
            .read()
            .unwrap()
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }
}

impl Liveness for LiveView {
    // the same process that attached, still heartbeating
    fn is_live(&self, member_id: u16, started_ms: i64) -> bool {
        match self.get(member_id) {
            Some(s) => s.live && s.record.started_ms == started_ms,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Election {
    Follower,

    // wrote a claim, waiting one round to see it persist
    Claiming,

    Manager,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ports {
    pub tls: u16,
    pub plain: u16,
    pub admin: u16,
}

pub struct Heartbeat {
    id: u16,
    role: Role,
    pid: u32,
    started_ms: i64,
    ports: Ports,
    interval: Duration,
    table: Arc<MembershipTable>,
    in_flight: Arc<AtomicUsize>,
    view: LiveView,
    election: Election,
    down: HashSet<u16>,
    reconciler: Option<Reconciler>,
}

impl Heartbeat {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u16,
        role: Role,
        started_ms: i64,
        ports: Ports,
        interval: Duration,
        table: Arc<MembershipTable>,
        in_flight: Arc<AtomicUsize>,
        view: LiveView,
    ) -> Self {
        Self {
            id,
            role,
            pid: std::process::id(),
            started_ms,
            ports,
            interval,
            table,
            in_flight,
            view,
            election: Election::Follower,
            down: HashSet::new(),
            reconciler: None,
        }
    }

    // without a reconciler this member never claims the manager role
    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = Some(reconciler);

        self
    }

    pub fn election(&self) -> Election {
        self.election
    }

    pub fn tick(&mut self, now_ms: i64) -> Result<(), TableError> {
        if self.reconciler.is_some() {
            self.elect(now_ms)?;
        }

        self.write_own(now_ms)?;

        let statuses = self.survey(now_ms)?;

        if self.election == Election::Manager {
            if let Some(r) = &mut self.reconciler {
                r.ensure(&statuses, now_ms);
            }
        }

        self.view.update(statuses);

        Ok(())
    }

    fn claim(&self, now_ms: i64) -> Result<(), TableError> {
        self.table.write_manager(&ManagerClaim {
            member_id: Some(self.id),
            timestamp_ms: now_ms,
        })
    }

    fn elect(&mut self, now_ms: i64) -> Result<(), TableError> {
        let claim = self.table.manager()?;
        let mine = claim.member_id == Some(self.id);

        self.election = match self.election {
            Election::Follower => {
                if mine || manager_is_stale(now_ms, &claim, self.interval) {
                    debug!("claiming manager role, previous {:?}", claim.member_id);

                    self.claim(now_ms)?;

                    Election::Claiming
                } else {
                    Election::Follower
                }
            }
            Election::Claiming => {
                if mine {
                    info!("acting as manager");

                    self.claim(now_ms)?;

                    Election::Manager
                } else {
                    debug!("manager claim lost to {:?}", claim.member_id);

                    Election::Follower
                }
            }
            Election::Manager => {
                if mine || manager_is_stale(now_ms, &claim, self.interval) {
                    self.claim(now_ms)?;

                    Election::Manager
                } else {
                    warn!(
                        "member {:?} took over as manager, stepping down",
                        claim.member_id
                    );

                    Election::Follower
                }
            }
        };

        Ok(())
    }

    fn write_own(&self, now_ms: i64) -> Result<(), TableError> {
        let record = MemberRecord {
            pid: self.pid,
            started_ms: self.started_ms,
            timestamp_ms: now_ms,
            tls_port: self.ports.tls,
            plain_port: self.ports.plain,
            admin_port: self.ports.admin,
            terminator: self.role == Role::Terminator,
            manager: self.election == Election::Manager,
            resources: ResourceSnapshot::capture(self.in_flight.load(Ordering::Relaxed)),
        };

        self.table.write(self.id, &record)
    }

    fn survey(&mut self, now_ms: i64) -> Result<Vec<MemberStatus>, TableError> {
        let records = self.table.read_all()?;

        let mut out = Vec::new();

        for (id, record) in records.into_iter().enumerate() {
            let id = id as u16;

            let record = match record {
                Some(r) => r,
                None => continue,
            };

            let live = id == self.id || !is_down(now_ms, record.timestamp_ms, self.interval);

            if live {
                if self.down.remove(&id) {
                    info!("member {} is up", id);
                }
            } else if self.down.insert(id) {
                warn!(
                    "member {} is down, last heartbeat {}ms ago",
                    id,
                    now_ms - record.timestamp_ms
                );
            }

            out.push(MemberStatus {
                id,
                record,
                age_ms: now_ms - record.timestamp_ms,
                live,
            });
        }

        Ok(out)
    }

    // give up the slot, and the manager role if held
    pub fn leave(&mut self) {
        if self.election == Election::Manager {
            match self.table.manager() {
                Ok(claim) if claim.member_id == Some(self.id) => {
                    if let Err(e) = self.table.write_manager(&ManagerClaim::none()) {
                        error!("failed to release manager role: {}", e);
                    }
                }
                _ => {}
            }
        }

        if let Err(e) = self.table.clear(self.id) {
            error!("failed to clear membership slot: {}", e);
        }

        self.election = Election::Follower;
    }
}

// runs a heartbeat on its own timer until dropped
pub struct HeartbeatThread {
    thread: Option<thread::JoinHandle<()>>,
    stop: Option<mpsc::Sender<()>>,
}

impl HeartbeatThread {
    pub fn start(mut hb: Heartbeat) -> Result<Self, std::io::Error> {
        let (s, r) = mpsc::channel();

        let interval = hb.interval;

        let thread = thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || {
                loop {
                    if let Err(e) = hb.tick(epoch_millis()) {
                        error!("heartbeat failed: {}", e);
                    }

                    match r.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                }

                hb.leave();
            })?;

        Ok(Self {
            thread: Some(thread),
            stop: Some(s),
        })
    }
}

impl Drop for HeartbeatThread {
    fn drop(&mut self) {
        self.stop.take();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::respawn::tests::{AnyPid, RecordingSpawner};
    use crate::cluster::table::tests::temp_table_path;
    use crate::cluster::Topology;
    use std::fs;

    const INTERVAL: Duration = Duration::from_millis(1000);

    #[test]
    fn down_boundary() {
        let ts = 100_000;

        // 1.25 x 1000ms = 1250ms
        assert!(!is_down(ts + 1249, ts, INTERVAL));
        assert!(!is_down(ts + 1250, ts, INTERVAL));
        assert!(is_down(ts + 1251, ts, INTERVAL));

        let interval = Duration::from_millis(40);
        assert!(!is_down(ts + 49, ts, interval));
        assert!(is_down(ts + 51, ts, interval));

        // clock going backwards is not a failure
        assert!(!is_down(ts - 5000, ts, INTERVAL));
    }

    #[test]
    fn manager_staleness() {
        let claim = ManagerClaim {
            member_id: Some(1),
            timestamp_ms: 10_000,
        };

        assert!(!manager_is_stale(12_000, &claim, INTERVAL));
        assert!(manager_is_stale(12_001, &claim, INTERVAL));
        assert!(manager_is_stale(0, &ManagerClaim::none(), INTERVAL));
    }

    fn member(
        id: u16,
        table: &Arc<MembershipTable>,
        view: &LiveView,
        spawner: &RecordingSpawner,
    ) -> Heartbeat {
        let topology = Topology::new(4, 2, 0);

        let reconciler = Reconciler::new(
            topology.clone(),
            id,
            INTERVAL,
            Box::new(spawner.clone()),
            Box::new(AnyPid),
        );

        Heartbeat::new(
            id,
            Role::Terminator,
            1_000 + id as i64,
            Ports {
                tls: 8443 + id,
                plain: 8080 + id,
                admin: 9443 + id,
            },
            INTERVAL,
            Arc::clone(table),
            Arc::new(AtomicUsize::new(0)),
            view.clone(),
        )
        .with_reconciler(reconciler)
    }

    #[test]
    fn election_and_handover() {
        let path = temp_table_path("election");
        let table = Arc::new(MembershipTable::open(&path, 4).unwrap());

        let view_a = LiveView::new();
        let view_b = LiveView::new();
        let spawner = RecordingSpawner::default();

        let mut a = member(0, &table, &view_a, &spawner);
        let mut b = member(1, &table, &view_b, &spawner);

        let t0 = 1_000_000;

        // no manager: a claims first, b sees a fresh claim
        a.tick(t0).unwrap();
        assert_eq!(a.election(), Election::Claiming);

        b.tick(t0 + 10).unwrap();
        assert_eq!(b.election(), Election::Follower);

        // a's claim persisted for a round
        a.tick(t0 + 1000).unwrap();
        assert_eq!(a.election(), Election::Manager);
        assert!(table.read(0).unwrap().unwrap().manager);

        // both members are up, so nothing to spawn
        assert!(spawner.spawned.lock().unwrap().is_empty());

        b.tick(t0 + 1010).unwrap();
        assert_eq!(b.election(), Election::Follower);
        assert!(view_b.is_live(0, 1_000));
        assert!(!view_b.is_live(0, 999));

        // a stalls. its claim is not yet stale
        b.tick(t0 + 2010).unwrap();
        assert_eq!(b.election(), Election::Follower);

        // a is down and its claim stale, so b claims
        b.tick(t0 + 3010).unwrap();
        assert_eq!(b.election(), Election::Claiming);
        assert!(!view_b.is_live(0, 1_000));

        b.tick(t0 + 4010).unwrap();
        assert_eq!(b.election(), Election::Manager);

        // b, as manager, respawns a
        assert_eq!(
            *spawner.spawned.lock().unwrap(),
            vec![(0, Role::Terminator)]
        );

        // a resumes and finds itself replaced
        a.tick(t0 + 4020).unwrap();
        assert_eq!(a.election(), Election::Follower);
        assert!(!table.read(0).unwrap().unwrap().manager);

        b.leave();
        assert_eq!(table.read(1).unwrap(), None);
        assert_eq!(table.manager().unwrap().member_id, None);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn resource_snapshot_in_record() {
        let path = temp_table_path("snapshot");
        let table = Arc::new(MembershipTable::open(&path, 2).unwrap());

        let in_flight = Arc::new(AtomicUsize::new(5));

        let mut hb = Heartbeat::new(
            1,
            Role::Worker,
            42,
            Ports::default(),
            INTERVAL,
            Arc::clone(&table),
            Arc::clone(&in_flight),
            LiveView::new(),
        );

        hb.tick(10_000).unwrap();

        let r = table.read(1).unwrap().unwrap();
        assert_eq!(r.pid, std::process::id());
        assert_eq!(r.started_ms, 42);
        assert_eq!(r.timestamp_ms, 10_000);
        assert!(!r.terminator);
        assert_eq!(r.resources.in_flight, 5);

        // no reconciler, no election
        assert_eq!(hb.election(), Election::Follower);
        assert_eq!(table.manager().unwrap().member_id, None);

        fs::remove_file(&path).unwrap();
    }
}
