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

//! Fixed-slot membership file shared by all cluster members.
//!
//! Layout: a 64 byte header followed by `capacity` records of 64 bytes,
//! record `i` belonging to member `i`. Each member writes only its own
//! record, in a single positioned write. Records and the header carry a
//! checksum so a reader can tell a record that is being rewritten from a
//! valid one.

use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"RGMT";
const VERSION: u16 = 1;

pub const HEADER_SIZE: usize = 64;
pub const RECORD_SIZE: usize = 64;

const FLAG_OCCUPIED: u32 = 0x01;
const FLAG_TERMINATOR: u32 = 0x02;
const FLAG_MANAGER: u32 = 0x04;

const NO_MANAGER: i32 = -1;

// header offsets
const H_MAGIC: usize = 0;
const H_VERSION: usize = 4;
const H_CAPACITY: usize = 6;
const H_MANAGER_ID: usize = 8;
const H_MANAGER_TS: usize = 16;
const H_CHECKSUM: usize = 24;

// record offsets
const R_FLAGS: usize = 0;
const R_PID: usize = 4;
const R_STARTED: usize = 8;
const R_TIMESTAMP: usize = 16;
const R_TLS_PORT: usize = 24;
const R_PLAIN_PORT: usize = 26;
const R_ADMIN_PORT: usize = 28;
const R_RSS: usize = 32;
const R_VSIZE: usize = 40;
const R_IN_FLIGHT: usize = 48;
const R_CHECKSUM: usize = 56;

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("membership table {0:?}: {1}")]
    Io(PathBuf, io::Error),

    #[error("membership table {0:?} has an unrecognized header")]
    BadHeader(PathBuf),

    #[error("membership table capacity is {found}, expected {expected}")]
    CapacityMismatch { found: u16, expected: u16 },

    #[error("member {0} outside table capacity")]
    OutOfRange(u16),

    #[error("record {0} failed its checksum")]
    Checksum(u16),
}

// FNV-1a
fn checksum(data: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;

    for b in data {
        h ^= *b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }

    h
}

fn get_u16(buf: &[u8], pos: usize) -> u16 {
    let mut a = [0; 2];
    a.copy_from_slice(&buf[pos..(pos + 2)]);
    u16::from_le_bytes(a)
}

fn get_u32(buf: &[u8], pos: usize) -> u32 {
    let mut a = [0; 4];
    a.copy_from_slice(&buf[pos..(pos + 4)]);
    u32::from_le_bytes(a)
}

fn get_i32(buf: &[u8], pos: usize) -> i32 {
    get_u32(buf, pos) as i32
}

fn get_u64(buf: &[u8], pos: usize) -> u64 {
    let mut a = [0; 8];
    a.copy_from_slice(&buf[pos..(pos + 8)]);
    u64::from_le_bytes(a)
}

fn get_i64(buf: &[u8], pos: usize) -> i64 {
    get_u64(buf, pos) as i64
}

fn put(buf: &mut [u8], pos: usize, src: &[u8]) {
    buf[pos..(pos + src.len())].copy_from_slice(src);
}

// memory use and load of a member at its last heartbeat
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub rss_bytes: u64,
    pub vsize_bytes: u64,
    pub in_flight: u32,
}

impl ResourceSnapshot {
    // memory figures come from /proc and are zero where unavailable
    pub fn capture(in_flight: usize) -> Self {
        let (vsize_bytes, rss_bytes) = match fs::read_to_string("/proc/self/statm") {
            Ok(s) => parse_statm(&s, page_size()),
            Err(_) => (0, 0),
        };

        Self {
            rss_bytes,
            vsize_bytes,
            in_flight: in_flight.min(u32::MAX as usize) as u32,
        }
    }
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if size > 0 {
        size as u64
    } else {
        4096
    }
}

// statm: size resident shared text lib data dt, in pages
fn parse_statm(s: &str, page_size: u64) -> (u64, u64) {
    let mut fields = s.split_whitespace().map(|f| f.parse::<u64>().unwrap_or(0));

    let size = fields.next().unwrap_or(0);
    let resident = fields.next().unwrap_or(0);

    (size * page_size, resident * page_size)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MemberRecord {
    pub pid: u32,
    pub started_ms: i64,
    pub timestamp_ms: i64,
    pub tls_port: u16,
    pub plain_port: u16,
    pub admin_port: u16,
    pub terminator: bool,
    pub manager: bool,
    pub resources: ResourceSnapshot,
}

impl MemberRecord {
    fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0; RECORD_SIZE];

        let mut flags = FLAG_OCCUPIED;

        if self.terminator {
            flags |= FLAG_TERMINATOR;
        }

        if self.manager {
            flags |= FLAG_MANAGER;
        }

        put(&mut buf, R_FLAGS, &flags.to_le_bytes());
        put(&mut buf, R_PID, &self.pid.to_le_bytes());
        put(&mut buf, R_STARTED, &self.started_ms.to_le_bytes());
        put(&mut buf, R_TIMESTAMP, &self.timestamp_ms.to_le_bytes());
        put(&mut buf, R_TLS_PORT, &self.tls_port.to_le_bytes());
        put(&mut buf, R_PLAIN_PORT, &self.plain_port.to_le_bytes());
        put(&mut buf, R_ADMIN_PORT, &self.admin_port.to_le_bytes());
        put(&mut buf, R_RSS, &self.resources.rss_bytes.to_le_bytes());
        put(&mut buf, R_VSIZE, &self.resources.vsize_bytes.to_le_bytes());
        put(&mut buf, R_IN_FLIGHT, &self.resources.in_flight.to_le_bytes());

        let sum = checksum(&buf[..R_CHECKSUM]);
        put(&mut buf, R_CHECKSUM, &sum.to_le_bytes());

        buf
    }

    // Ok(None) for a slot that was never written or has been cleared
    fn decode(buf: &[u8]) -> Result<Option<Self>, ()> {
        if buf.iter().all(|b| *b == 0) {
            return Ok(None);
        }

        if get_u32(buf, R_CHECKSUM) != checksum(&buf[..R_CHECKSUM]) {
            return Err(());
        }

        let flags = get_u32(buf, R_FLAGS);

        if flags & FLAG_OCCUPIED == 0 {
            return Ok(None);
        }

        Ok(Some(Self {
            pid: get_u32(buf, R_PID),
            started_ms: get_i64(buf, R_STARTED),
            timestamp_ms: get_i64(buf, R_TIMESTAMP),
            tls_port: get_u16(buf, R_TLS_PORT),
            plain_port: get_u16(buf, R_PLAIN_PORT),
            admin_port: get_u16(buf, R_ADMIN_PORT),
            terminator: flags & FLAG_TERMINATOR != 0,
            manager: flags & FLAG_MANAGER != 0,
            resources: ResourceSnapshot {
                rss_bytes: get_u64(buf, R_RSS),
                vsize_bytes: get_u64(buf, R_VSIZE),
                in_flight: get_u32(buf, R_IN_FLIGHT),
            },
        }))
    }
}

// who holds the manager role, and when they last said so
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManagerClaim {
    pub member_id: Option<u16>,
    pub timestamp_ms: i64,
}

impl ManagerClaim {
    pub fn none() -> Self {
        Self {
            member_id: None,
            timestamp_ms: 0,
        }
    }
}

pub struct MembershipTable {
    path: PathBuf,
    file: File,
    capacity: u16,
}

impl MembershipTable {
    pub fn open(path: &Path, capacity: u16) -> Result<Self, TableError> {
        let io_err = |e| TableError::Io(path.to_path_buf(), e);

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(io_err)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        let table = Self {
            path: path.to_path_buf(),
            file,
            capacity,
        };

        let size = (HEADER_SIZE + (RECORD_SIZE * capacity as usize)) as u64;

        let len = table.file.metadata().map_err(io_err)?.len();

        let mut header = [0; HEADER_SIZE];

        if len >= HEADER_SIZE as u64 {
            table.file.read_exact_at(&mut header, 0).map_err(io_err)?;
        }

        if header.iter().all(|b| *b == 0) {
            // new file, or one whose creator has yet to write the header.
            // concurrent initializers write identical bytes
            table.file.set_len(size).map_err(io_err)?;
            table.write_header(&ManagerClaim::none())?;

            return Ok(table);
        }

        if &header[H_MAGIC..(H_MAGIC + 4)] != MAGIC || get_u16(&header, H_VERSION) != VERSION {
            return Err(TableError::BadHeader(table.path.clone()));
        }

        let found = get_u16(&header, H_CAPACITY);

        if found != capacity {
            return Err(TableError::CapacityMismatch {
                found,
                expected: capacity,
            });
        }

        Ok(table)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    fn io_err(&self, e: io::Error) -> TableError {
        TableError::Io(self.path.clone(), e)
    }

    fn offset(&self, id: u16) -> Result<u64, TableError> {
        if id >= self.capacity {
            return Err(TableError::OutOfRange(id));
        }

        Ok((HEADER_SIZE + (RECORD_SIZE * id as usize)) as u64)
    }

    pub fn write(&self, id: u16, record: &MemberRecord) -> Result<(), TableError> {
        let pos = self.offset(id)?;

        self.file
            .write_all_at(&record.encode(), pos)
            .map_err(|e| self.io_err(e))
    }

    pub fn clear(&self, id: u16) -> Result<(), TableError> {
        let pos = self.offset(id)?;

        self.file
            .write_all_at(&[0; RECORD_SIZE], pos)
            .map_err(|e| self.io_err(e))
    }

    pub fn read(&self, id: u16) -> Result<Option<MemberRecord>, TableError> {
        let pos = self.offset(id)?;

        let mut buf = [0; RECORD_SIZE];

        // a failed checksum most likely means we raced the owner's write
        for _ in 0..2 {
            self.file
                .read_exact_at(&mut buf, pos)
                .map_err(|e| self.io_err(e))?;

            if let Ok(r) = MemberRecord::decode(&buf) {
                return Ok(r);
            }
        }

        Err(TableError::Checksum(id))
    }

    // unreadable records are reported as absent
    pub fn read_all(&self) -> Result<Vec<Option<MemberRecord>>, TableError> {
        let mut out = Vec::with_capacity(self.capacity as usize);

        for id in 0..self.capacity {
            match self.read(id) {
                Ok(r) => out.push(r),
                Err(TableError::Checksum(_)) => out.push(None),
                Err(e) => return Err(e),
            }
        }

        Ok(out)
    }

    pub fn manager(&self) -> Result<ManagerClaim, TableError> {
        let mut buf = [0; HEADER_SIZE];

        for _ in 0..2 {
            self.file
                .read_exact_at(&mut buf, 0)
                .map_err(|e| self.io_err(e))?;

            if get_u32(&buf, H_CHECKSUM) != checksum(&buf[..H_CHECKSUM]) {
                continue;
            }

            let id = get_i32(&buf, H_MANAGER_ID);

            let member_id = if id >= 0 && id < self.capacity as i32 {
                Some(id as u16)
            } else {
                None
            };

            return Ok(ManagerClaim {
                member_id,
                timestamp_ms: get_i64(&buf, H_MANAGER_TS),
            });
        }

        Err(TableError::BadHeader(self.path.clone()))
    }

    pub fn write_manager(&self, claim: &ManagerClaim) -> Result<(), TableError> {
        self.write_header(claim)
    }

    fn write_header(&self, claim: &ManagerClaim) -> Result<(), TableError> {
        let mut buf = [0; HEADER_SIZE];

        let id = match claim.member_id {
            Some(id) => id as i32,
            None => NO_MANAGER,
        };

        put(&mut buf, H_MAGIC, MAGIC);
        put(&mut buf, H_VERSION, &VERSION.to_le_bytes());
        put(&mut buf, H_CAPACITY, &self.capacity.to_le_bytes());
        put(&mut buf, H_MANAGER_ID, &id.to_le_bytes());
        put(&mut buf, H_MANAGER_TS, &claim.timestamp_ms.to_le_bytes());

        let sum = checksum(&buf[..H_CHECKSUM]);
        put(&mut buf, H_CHECKSUM, &sum.to_le_bytes());

        self.file
            .write_all_at(&buf, 0)
            .map_err(|e| self.io_err(e))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::env;
    use std::process;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT: AtomicUsize = AtomicUsize::new(0);

    pub fn temp_table_path(name: &str) -> PathBuf {
        let n = NEXT.fetch_add(1, Ordering::Relaxed);

        let path = env::temp_dir().join(format!(
            "relaygate-test-{}-{}-{}.members",
            process::id(),
            name,
            n
        ));

        let _ = fs::remove_file(&path);

        path
    }

    fn record(pid: u32, ts: i64) -> MemberRecord {
        MemberRecord {
            pid,
            started_ms: 1_000,
            timestamp_ms: ts,
            tls_port: 8443,
            plain_port: 8080,
            admin_port: 9443,
            terminator: true,
            manager: false,
            resources: ResourceSnapshot {
                rss_bytes: 4096,
                vsize_bytes: 8192,
                in_flight: 3,
            },
        }
    }

    #[test]
    fn slots_are_independent() {
        let path = temp_table_path("slots");

        let t = MembershipTable::open(&path, 4).unwrap();

        assert_eq!(t.read(0).unwrap(), None);

        t.write(1, &record(11, 5_000)).unwrap();
        t.write(3, &record(33, 6_000)).unwrap();

        // a second handle sees the same records
        let t2 = MembershipTable::open(&path, 4).unwrap();

        let all = t2.read_all().unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0], None);
        assert_eq!(all[1], Some(record(11, 5_000)));
        assert_eq!(all[2], None);
        assert_eq!(all[3], Some(record(33, 6_000)));

        t2.clear(1).unwrap();
        assert_eq!(t.read(1).unwrap(), None);

        assert!(matches!(
            t.write(4, &record(44, 0)),
            Err(TableError::OutOfRange(4))
        ));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn manager_claim() {
        let path = temp_table_path("manager");

        let t = MembershipTable::open(&path, 4).unwrap();
        assert_eq!(t.manager().unwrap(), ManagerClaim::none());

        let claim = ManagerClaim {
            member_id: Some(2),
            timestamp_ms: 12_345,
        };

        t.write_manager(&claim).unwrap();

        // reopening keeps the claim
        let t2 = MembershipTable::open(&path, 4).unwrap();
        assert_eq!(t2.manager().unwrap(), claim);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn capacity_must_match() {
        let path = temp_table_path("capacity");

        MembershipTable::open(&path, 4).unwrap();

        assert!(matches!(
            MembershipTable::open(&path, 8),
            Err(TableError::CapacityMismatch {
                found: 4,
                expected: 8
            })
        ));

        fs::write(&path, [0xff; HEADER_SIZE]).unwrap();

        assert!(matches!(
            MembershipTable::open(&path, 4),
            Err(TableError::BadHeader(_))
        ));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn torn_record_detected() {
        let path = temp_table_path("torn");

        let t = MembershipTable::open(&path, 2).unwrap();
        t.write(0, &record(1, 100)).unwrap();

        // corrupt the timestamp
        t.file
            .write_all_at(&[0xaa], (HEADER_SIZE + R_TIMESTAMP) as u64)
            .unwrap();

        assert!(matches!(t.read(0), Err(TableError::Checksum(0))));
        assert_eq!(t.read_all().unwrap()[0], None);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn statm() {
        assert_eq!(parse_statm("10 4 1 1 0 2 0\n", 4096), (40960, 16384));
        assert_eq!(parse_statm("", 4096), (0, 0));

        let snap = ResourceSnapshot::capture(7);
        assert_eq!(snap.in_flight, 7);
    }
}
