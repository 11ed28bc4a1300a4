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

use crate::bridge::BridgePeer;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const PICK_ATTEMPTS: usize = 32;
pub const PICK_RETRY_DELAY: Duration = Duration::from_millis(250);

const PERSISTENCE_MAX: usize = 16;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum BalancerError {
    #[error("no available workers")]
    NoAvailableWorkers,

    #[error("member {0} is not a worker")]
    NotWorker(u16),
}

// whether a member, identified by id and start time, is believed to be up
pub trait Liveness: Send + Sync {
    fn is_live(&self, member_id: u16, started_ms: i64) -> bool;
}

impl<F> Liveness for F
where
    F: Fn(u16, i64) -> bool + Send + Sync,
{
    fn is_live(&self, member_id: u16, started_ms: i64) -> bool {
        self(member_id, started_ms)
    }
}

struct State {
    slots: Vec<Option<BridgePeer>>,
    cursor: usize,
    run: usize,
}

pub struct LoadBalancer {
    // ids below this are terminators and never occupy a slot
    offset: u16,

    persistence: usize,
    attempts: usize,
    retry_delay: Duration,
    liveness: Arc<dyn Liveness>,
    state: Mutex<State>,
}

impl LoadBalancer {
    pub fn new(
        terminators: u16,
        workers: u16,
        parallelism: usize,
        liveness: Arc<dyn Liveness>,
    ) -> Self {
        Self {
            offset: terminators,
            persistence: parallelism.clamp(1, PERSISTENCE_MAX),
            attempts: PICK_ATTEMPTS,
            retry_delay: PICK_RETRY_DELAY,
            liveness,
            state: Mutex::new(State {
                slots: vec![None; workers as usize],
                cursor: 0,
                run: 0,
            }),
        }
    }

    pub fn with_retry(mut self, attempts: usize, retry_delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = retry_delay;

        self
    }

    pub fn persistence(&self) -> usize {
        self.persistence
    }

    fn slot_index(&self, member_id: u16, slot_count: usize) -> Result<usize, BalancerError> {
        if member_id < self.offset {
            return Err(BalancerError::NotWorker(member_id));
        }

        let index = (member_id - self.offset) as usize;

        if index >= slot_count {
            return Err(BalancerError::NotWorker(member_id));
        }

        Ok(index)
    }

    fn is_healthy(&self, peer: &BridgePeer) -> bool {
        peer.is_open() && self.liveness.is_live(peer.member_id(), peer.started_ms())
    }

    // returns the peer this one replaced, if any
    pub fn register(&self, peer: BridgePeer) -> Result<Option<BridgePeer>, BalancerError> {
        let state = &mut *self.state.lock().unwrap();

        let index = self.slot_index(peer.member_id(), state.slots.len())?;

        info!("registered worker {} as {}", peer.member_id(), peer.name());

        Ok(state.slots[index].replace(peer))
    }

    // removes the peer only if it still occupies its slot
    pub fn deregister(&self, peer: &BridgePeer) -> bool {
        let state = &mut *self.state.lock().unwrap();

        let index = match self.slot_index(peer.member_id(), state.slots.len()) {
            Ok(index) => index,
            Err(_) => return false,
        };

        match &state.slots[index] {
            Some(p) if p.serial() == peer.serial() => {
                state.slots[index] = None;

                debug!("deregistered worker {}", peer.member_id());

                true
            }
            _ => false,
        }
    }

    fn try_pick(&self) -> Option<BridgePeer> {
        let state = &mut *self.state.lock().unwrap();

        let count = state.slots.len();

        if count == 0 {
            return None;
        }

        if state.run < self.persistence {
            if let Some(p) = &state.slots[state.cursor] {
                if self.is_healthy(p) {
                    state.run += 1;

                    return Some(p.clone());
                }
            }
        }

        for i in 1..=count {
            let index = (state.cursor + i) % count;

            if let Some(p) = &state.slots[index] {
                if self.is_healthy(p) {
                    let p = p.clone();

                    state.cursor = index;
                    state.run = 1;

                    return Some(p);
                }
            }
        }

        None
    }

    // a healthy worker, waiting a bounded time for one to appear
    pub fn pick(&self) -> Result<BridgePeer, BalancerError> {
        for attempt in 0..self.attempts {
            if let Some(p) = self.try_pick() {
                return Ok(p);
            }

            if attempt + 1 < self.attempts {
                thread::sleep(self.retry_delay);
            }
        }

        warn!("no available workers after {} attempts", self.attempts);

        Err(BalancerError::NoAvailableWorkers)
    }

    pub fn peers(&self) -> Vec<BridgePeer> {
        let state = &*self.state.lock().unwrap();

        state.slots.iter().flatten().cloned().collect()
    }

    pub fn close_all(&self) {
        let peers: Vec<BridgePeer> = {
            let state = &mut *self.state.lock().unwrap();

            state.slots.iter_mut().filter_map(|s| s.take()).collect()
        };

        for p in peers {
            p.close();
            p.join();
        }
    }
}
