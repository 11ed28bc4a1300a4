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

//! Cluster membership.
//!
//! Every member owns one slot of a shared [`table::MembershipTable`] and
//! refreshes it on each heartbeat. Members read all slots to decide who is
//! up. One member at a time acts as manager and respawns missing members;
//! the role is claimed through the table header when the current manager
//! stops refreshing it.

pub mod heartbeat;
pub mod respawn;
pub mod table;

use crate::core::config::Settings;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    // accepts client connections
    Terminator,

    // serves bridge requests from terminators
    Worker,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    capacity: u16,
    terminators: u16,
    workers: u16,
}

impl Topology {
    pub fn new(capacity: u16, terminators: u16, workers: u16) -> Self {
        Self {
            capacity,
            terminators,
            workers,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.cluster.capacity,
            settings.cluster.terminators,
            settings.cluster.workers,
        )
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn terminators(&self) -> u16 {
        self.terminators
    }

    pub fn workers(&self) -> u16 {
        self.workers
    }

    // terminators answer requests themselves when there are no workers
    pub fn is_embedded(&self) -> bool {
        self.workers == 0
    }

    pub fn role_of(&self, id: u16) -> Option<Role> {
        if id < self.terminators {
            Some(Role::Terminator)
        } else if id < self.terminators + self.workers {
            Some(Role::Worker)
        } else {
            None
        }
    }

    // every member id that should be running
    pub fn expected_ids(&self) -> Range<u16> {
        0..(self.terminators + self.workers)
    }

    pub fn terminator_ids(&self) -> Range<u16> {
        0..self.terminators
    }

    pub fn worker_ids(&self) -> Range<u16> {
        self.terminators..(self.terminators + self.workers)
    }
}
