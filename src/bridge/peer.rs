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

use super::frame::{encode_message, FrameDecoder, Message};
use super::BridgeError;
use crate::connection::Channel;
use crate::core::net::{is_transient, wait_fd, Wait};
use log::{debug, error};
use std::cmp;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

// how often the reader checks for close while idle
const READ_POLL_INTERVAL: Duration = Duration::from_millis(250);

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

// invoked on the reader thread for each request arriving on a serving peer
pub type RequestHook = Arc<dyn Fn(&BridgePeer, Message) + Send + Sync>;

type Reply = Result<Vec<u8>, BridgeError>;

struct Inner {
    name: String,
    serial: u64,
    member_id: u16,
    started_ms: i64,
    fd: RawFd,
    channel: Mutex<Channel>,
    queue: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    pending: Mutex<HashMap<i64, mpsc::SyncSender<Reply>>>,
    next_id: AtomicI64,
    closed: AtomicBool,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    write_timeout: Duration,
}

// one end of a bridge connection. clones share the connection
#[derive(Clone)]
pub struct BridgePeer {
    inner: Arc<Inner>,
}

impl fmt::Debug for BridgePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgePeer")
            .field("name", &self.inner.name)
            .field("serial", &self.inner.serial)
            .field("member_id", &self.inner.member_id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl BridgePeer {
    // take over the channel and start the reader and writer threads.
    // initial holds bytes already read from the channel. with a hook, the
    // peer serves requests. without, it correlates responses to send calls
    pub fn start(
        name: &str,
        member_id: u16,
        started_ms: i64,
        channel: Channel,
        initial: &[u8],
        hook: Option<RequestHook>,
        write_timeout: Duration,
    ) -> Result<Self, BridgeError> {
        let (s, r) = mpsc::channel::<Vec<u8>>();

        let peer = Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
                member_id,
                started_ms,
                fd: channel.as_raw_fd(),
                channel: Mutex::new(channel),
                queue: Mutex::new(Some(s)),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(1),
                closed: AtomicBool::new(false),
                on_close: Mutex::new(None),
                threads: Mutex::new(Vec::new()),
                write_timeout,
            }),
        };

        let mut decoder = FrameDecoder::new();
        decoder.push(initial);

        let writer = {
            let peer = peer.clone();

            thread::Builder::new()
                .name(format!("{}-writer", name))
                .spawn(move || peer.write_loop(r))?
        };

        let reader = {
            let p = peer.clone();

            let ret = thread::Builder::new()
                .name(format!("{}-reader", name))
                .spawn(move || p.read_loop(decoder, hook));

            match ret {
                Ok(t) => t,
                Err(e) => {
                    peer.close();

                    return Err(e.into());
                }
            }
        };

        {
            let threads = &mut *peer.inner.threads.lock().unwrap();
            threads.push(writer);
            threads.push(reader);
        }

        Ok(peer)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    // distinguishes peers that share a member id
    pub fn serial(&self) -> u64 {
        self.inner.serial
    }

    pub fn member_id(&self) -> u16 {
        self.inner.member_id
    }

    pub fn started_ms(&self) -> i64 {
        self.inner.started_ms
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    // called once, after the peer closes. runs immediately if already closed
    pub fn set_on_close<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let on_close = &mut *self.inner.on_close.lock().unwrap();

            if self.is_open() {
                *on_close = Some(Box::new(f));
                return;
            }
        }

        f();
    }

    fn enqueue(&self, frames: Vec<u8>) -> Result<(), BridgeError> {
        let queue = self.inner.queue.lock().unwrap();

        match &*queue {
            Some(s) => s.send(frames).map_err(|_| BridgeError::Closed),
            None => Err(BridgeError::Closed),
        }
    }

    // send a request and block until the response with the same id arrives
    pub fn send(&self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>, BridgeError> {
        if !self.is_open() {
            return Err(BridgeError::Closed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut frames = Vec::new();
        encode_message(id, payload, &mut frames)?;

        let (s, r) = mpsc::sync_channel(1);

        self.inner.pending.lock().unwrap().insert(id, s);

        if let Err(e) = self.enqueue(frames) {
            self.inner.pending.lock().unwrap().remove(&id);

            return Err(e);
        }

        match r.recv_timeout(timeout) {
            Ok(ret) => ret,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                // a late response will find no pending entry
                self.inner.pending.lock().unwrap().remove(&id);

                Err(BridgeError::Timeout)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(BridgeError::Closed),
        }
    }

    // answer a request received by a serving peer
    pub fn reply(&self, id: i64, payload: &[u8]) -> Result<(), BridgeError> {
        let mut frames = Vec::new();
        encode_message(id, payload, &mut frames)?;

        self.enqueue(frames)
    }

    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!("{}: closing", self.inner.name);

        // stops the writer
        self.inner.queue.lock().unwrap().take();

        let pending: Vec<mpsc::SyncSender<Reply>> = {
            let pending = &mut *self.inner.pending.lock().unwrap();

            pending.drain().map(|(_, s)| s).collect()
        };

        for s in pending {
            let _ = s.send(Err(BridgeError::Closed));
        }

        self.inner.channel.lock().unwrap().close();

        let on_close = self.inner.on_close.lock().unwrap().take();

        if let Some(f) = on_close {
            f();
        }
    }

    // wait for the peer threads to exit. the peer must be closed first
    pub fn join(&self) {
        let threads: Vec<thread::JoinHandle<()>> =
            self.inner.threads.lock().unwrap().drain(..).collect();

        let current = thread::current().id();

        for t in threads {
            if t.thread().id() != current {
                let _ = t.join();
            }
        }
    }

    fn write_loop(&self, r: mpsc::Receiver<Vec<u8>>) {
        for frames in r {
            if let Err(e) = self.write_frames(&frames) {
                if is_transient(&e) {
                    debug!("{}: write failed: {}", self.inner.name, e);
                } else {
                    error!("{}: write failed: {}", self.inner.name, e);
                }

                self.close();
                break;
            }
        }
    }

    // the channel lock is only held for non-blocking writes, so the reader
    // keeps draining the socket while this waits for room. the timeout
    // bounds a stall, not the whole transfer
    fn write_frames(&self, frames: &[u8]) -> Result<(), io::Error> {
        let mut pos = 0;
        let mut deadline = Instant::now() + self.inner.write_timeout;

        loop {
            let (size, flushed) = {
                let channel = &mut *self.inner.channel.lock().unwrap();

                let size = if pos < frames.len() {
                    let end = cmp::min(frames.len(), pos + channel.write_capacity());

                    channel.write_some(&frames[pos..end])?
                } else {
                    0
                };

                (size, channel.flush_pending()?)
            };

            pos += size;

            if pos == frames.len() && flushed {
                return Ok(());
            }

            if size > 0 {
                deadline = Instant::now() + self.inner.write_timeout;
                continue;
            }

            let left = deadline.saturating_duration_since(Instant::now());

            if left.is_zero() || !wait_fd(self.inner.fd, Wait::Writable, Some(left))? {
                return Err(io::Error::from(io::ErrorKind::TimedOut));
            }

            if !self.is_open() {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
        }
    }

    fn read_loop(&self, mut decoder: FrameDecoder, hook: Option<RequestHook>) {
        loop {
            loop {
                match decoder.next_message() {
                    Ok(Some(msg)) => self.deliver(msg, &hook),
                    Ok(None) => break,
                    Err(e) => {
                        error!("{}: bad frame: {}", self.inner.name, e);

                        self.close();
                        return;
                    }
                }
            }

            if !self.is_open() {
                return;
            }

            match wait_fd(self.inner.fd, Wait::Readable, Some(READ_POLL_INTERVAL)) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!("{}: wait failed: {}", self.inner.name, e);

                    self.close();
                    return;
                }
            }

            let ret = self.inner.channel.lock().unwrap().read();

            match ret {
                Ok(Some(data)) => decoder.push(&data),
                Ok(None) => {
                    debug!("{}: peer closed", self.inner.name);

                    self.close();
                    return;
                }
                Err(e) => {
                    if is_transient(&e) {
                        debug!("{}: read failed: {}", self.inner.name, e);
                    } else {
                        error!("{}: read failed: {}", self.inner.name, e);
                    }

                    self.close();
                    return;
                }
            }
        }
    }

    fn deliver(&self, msg: Message, hook: &Option<RequestHook>) {
        if let Some(hook) = hook {
            hook(self, msg);

            return;
        }

        let s = self.inner.pending.lock().unwrap().remove(&msg.id);

        match s {
            Some(s) => {
                let _ = s.send(Ok(msg.payload));
            }
            None => debug!(
                "{}: dropping response for unknown id {}",
                self.inner.name, msg.id
            ),
        }
    }
}
