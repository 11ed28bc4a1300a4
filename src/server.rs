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

//! One event loop per listening port.
//!
//! The loop thread owns every connection accepted on its port. It reads,
//! frames requests with a [`RequestAssembler`], and hands each complete
//! request, together with the connection, to the port's worker pool. The
//! worker runs the handler, writes the response and sends the connection
//! back to the loop with a [`Command`]. While a connection is out on a
//! worker its slab entry is empty, so at most one request per connection
//! is ever in flight.
//!
//! TLS handshakes also run on the worker pool. Finished handshakes come
//! back to the loop for registration.

use crate::connection::Channel;
use crate::core::net::{is_transient, set_socket_opts};
use crate::core::pool::{PoolError, TaskRunner, WorkerPool};
use crate::handler::Routes;
use crate::http::assembler::AssembleError;
use crate::http::{Disposition, RequestAssembler, Response};
use crate::tls::{TlsAcceptor, TlsError};
use log::{debug, error, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const LISTENER: Token = Token(usize::MAX - 1);
const WAKER: Token = Token(usize::MAX - 2);

const EVENTS_MAX: usize = 1024;

// sweep for stale requests at least this often, in cycles or time
const SWEEP_CYCLES: usize = 64;
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

// poll briefly while handshakes are out so their sockets are picked up soon
const HANDSHAKE_POLL: Duration = Duration::from_millis(10);

// error pages are small. don't let a stalled client hold the loop
const ERROR_WRITE_TIMEOUT: Duration = Duration::from_millis(100);

const QUEUE_PER_THREAD: usize = 16;

// receives a connection promoted to a bridge link, with any bytes read
// past the promoting request
pub type PromoteHook = Arc<dyn Fn(Channel, u16, i64, Vec<u8>) + Send + Sync>;

pub type ShutdownHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    pub promote: Option<PromoteHook>,
    pub shutdown: Option<ShutdownHook>,
}

#[derive(Clone)]
pub struct PortConfig {
    pub name: String,
    pub addr: SocketAddr,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub keep_alive: Duration,
    pub max_request_size: usize,
    pub write_timeout: Duration,
    pub handshake_timeout: Duration,
    pub in_flight: Arc<AtomicUsize>,
}

impl PortConfig {
    pub fn new(name: &str, addr: SocketAddr) -> Self {
        Self {
            name: name.to_string(),
            addr,
            tls: None,
            concurrency: 8,
            request_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(30),
            max_request_size: 16 * 1024 * 1024,
            write_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

pub enum Command {
    // a connection that finished its handshake
    Register(Channel),

    // a connection back from a worker, with bytes read past its request
    Release(Token, Channel, Vec<u8>),

    Close(Token, Channel),

    Promote {
        token: Token,
        channel: Channel,
        member_id: u16,
        started_ms: i64,
        surplus: Vec<u8>,
    },

    Stop,
}

// the way back to the event loop from other threads
#[derive(Clone)]
struct Notifier {
    sender: mpsc::Sender<Command>,
    waker: Arc<Waker>,
}

impl Notifier {
    fn send(&self, c: Command) {
        // the loop may already be gone during shutdown
        if self.sender.send(c).is_ok() {
            if let Err(e) = self.waker.wake() {
                error!("failed to wake event loop: {}", e);
            }
        }
    }
}

struct Connection {
    // None while a worker has it
    channel: Option<Channel>,

    touched: Instant,
}

struct Dispatch {
    token: Token,
    channel: Channel,
    raw: Vec<u8>,
    surplus: Vec<u8>,
    routes: Arc<Routes>,
    hooks: Hooks,
    keep_alive_secs: u64,
    write_timeout: Duration,
    notifier: Notifier,
}

impl Dispatch {
    fn run(self) {
        let Self {
            token,
            mut channel,
            raw,
            surplus,
            routes,
            hooks,
            keep_alive_secs,
            write_timeout,
            notifier,
        } = self;

        let mut resp = routes.serve(raw);

        resp.stamp(keep_alive_secs);
        resp.finish();

        if let Err(e) = channel.write_chunked(resp.page(), write_timeout) {
            if is_transient(&e) {
                debug!("response write failed: {}", e);
            } else {
                error!("response write failed: {}", e);
            }

            notifier.send(Command::Close(token, channel));
            return;
        }

        match resp.disposition() {
            Disposition::KeepAlive => notifier.send(Command::Release(token, channel, surplus)),
            Disposition::Close => notifier.send(Command::Close(token, channel)),
            Disposition::Promote {
                member_id,
                started_ms,
            } => notifier.send(Command::Promote {
                token,
                channel,
                member_id,
                started_ms,
                surplus,
            }),
            Disposition::Shutdown => {
                notifier.send(Command::Close(token, channel));

                if let Some(f) = &hooks.shutdown {
                    f();
                }
            }
        }
    }
}

struct EventLoop {
    name: String,
    poll: Poll,
    listener: TcpListener,
    receiver: mpsc::Receiver<Command>,
    notifier: Notifier,
    conns: Slab<Connection>,
    parked: HashMap<Token, RequestAssembler>,
    pool: Arc<WorkerPool>,
    acceptor: Option<Arc<TlsAcceptor>>,
    tasks: Option<Arc<TaskRunner>>,
    handshakes: Arc<AtomicUsize>,
    routes: Arc<Routes>,
    hooks: Hooks,
    config: PortConfig,
}

impl EventLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_MAX);

        let mut cycles = 0;
        let mut last_sweep = Instant::now();

        'main: loop {
            let timeout = if self.handshakes.load(Ordering::Relaxed) > 0 {
                HANDSHAKE_POLL
            } else {
                SWEEP_INTERVAL
            };

            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                error!("{}: poll failed: {}", self.name, e);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {}
                    token => self.process(token),
                }
            }

            loop {
                match self.receiver.try_recv() {
                    Ok(Command::Stop) => break 'main,
                    Ok(c) => self.command(c),
                    Err(_) => break,
                }
            }

            cycles += 1;

            if cycles >= SWEEP_CYCLES || last_sweep.elapsed() >= SWEEP_INTERVAL {
                self.sweep();

                cycles = 0;
                last_sweep = Instant::now();
            }
        }

        self.shutdown();
    }

    fn accept(&mut self) {
        loop {
            let (stream, peer_addr) = match self.listener.accept() {
                Ok(ret) => ret,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("{}: accept error: {}", self.name, e);
                    break;
                }
            };

            debug!("{}: accepted connection from {}", self.name, peer_addr);

            set_socket_opts(&stream);

            let acceptor = match self.acceptor.clone() {
                Some(a) => a,
                None => {
                    self.register(Channel::plain(stream));
                    continue;
                }
            };

            let channel = match acceptor.channel(stream) {
                Ok(c) => c,
                Err(e) => {
                    error!("{}: tls setup failed: {}", self.name, e);
                    continue;
                }
            };

            let notifier = self.notifier.clone();
            let handshakes = Arc::clone(&self.handshakes);
            let timeout = self.config.handshake_timeout;
            let name = self.name.clone();

            handshakes.fetch_add(1, Ordering::Relaxed);

            let ret = self.pool.submit(move || {
                let mut channel = channel;

                match channel.handshake(timeout) {
                    Ok(()) => {
                        debug!("{}: handshake with {} complete", name, peer_addr);

                        notifier.send(Command::Register(Channel::tls(channel)));
                    }
                    Err(e) => log_handshake_error(&name, peer_addr, &e),
                }

                handshakes.fetch_sub(1, Ordering::Relaxed);
            });

            if let Err(e) = ret {
                // the closure and its socket are gone
                self.handshakes.fetch_sub(1, Ordering::Relaxed);

                warn!("{}: dropping connection from {}: {}", self.name, peer_addr, e);
            }
        }
    }

    fn register(&mut self, mut channel: Channel) {
        let entry = self.conns.vacant_entry();
        let token = Token(entry.key());

        if let Err(e) = self
            .poll
            .registry()
            .register(channel.stream_mut(), token, Interest::READABLE)
        {
            error!("{}: register failed: {}", self.name, e);
            return;
        }

        entry.insert(Connection {
            channel: Some(channel),
            touched: Instant::now(),
        });

        // bytes may have arrived before registration
        self.process(token);
    }

    fn command(&mut self, c: Command) {
        match c {
            Command::Register(channel) => self.register(channel),
            Command::Release(token, channel, surplus) => {
                let conn = match self.conns.get_mut(token.0) {
                    Some(conn) => conn,
                    None => return,
                };

                conn.channel = Some(channel);
                conn.touched = Instant::now();

                if !surplus.is_empty() {
                    self.feed(token, &surplus);
                }

                // readiness may have fired while the worker had the channel
                self.process(token);
            }
            Command::Close(token, channel) => self.close(token, Some(channel)),
            Command::Promote {
                token,
                mut channel,
                member_id,
                started_ms,
                surplus,
            } => {
                let _ = self.poll.registry().deregister(channel.stream_mut());

                self.parked.remove(&token);
                self.conns.try_remove(token.0);

                match &self.hooks.promote {
                    Some(f) => {
                        info!("{}: promoting connection to member {}", self.name, member_id);

                        f(channel, member_id, started_ms, surplus);
                    }
                    None => channel.close(),
                }
            }
            Command::Stop => {}
        }
    }

    // read until there is nothing more to read or a request is dispatched
    fn process(&mut self, token: Token) {
        loop {
            let conn = match self.conns.get_mut(token.0) {
                Some(conn) => conn,
                None => return,
            };

            let channel = match &mut conn.channel {
                Some(c) => c,
                None => return,
            };

            match channel.read() {
                Ok(None) => {
                    debug!("{}: connection closed by peer", self.name);

                    self.close(token, None);
                    return;
                }
                Ok(Some(data)) if data.is_empty() => return,
                Ok(Some(data)) => {
                    conn.touched = Instant::now();

                    self.feed(token, &data);
                }
                Err(e) => {
                    if is_transient(&e) {
                        debug!("{}: read failed: {}", self.name, e);
                    } else {
                        error!("{}: read failed: {}", self.name, e);
                    }

                    self.close(token, None);
                    return;
                }
            }
        }
    }

    fn feed(&mut self, token: Token, data: &[u8]) {
        let mut asm = match self.parked.remove(&token) {
            Some(asm) => asm,
            None => RequestAssembler::new(self.config.max_request_size),
        };

        match asm.add(data) {
            Ok(true) => self.dispatch(token, asm),
            Ok(false) => {
                self.parked.insert(token, asm);
            }
            Err(AssembleError::TooLarge) => {
                debug!("{}: request too large", self.name);

                self.fail(token, 413);
            }
            Err(e) => {
                debug!("{}: malformed request: {}", self.name, e);

                self.fail(token, 400);
            }
        }
    }

    fn dispatch(&mut self, token: Token, asm: RequestAssembler) {
        let channel = match self.conns.get_mut(token.0).and_then(|c| c.channel.take()) {
            Some(c) => c,
            None => return,
        };

        let (raw, surplus) = asm.finish();

        let task = Arc::new(Mutex::new(Some(Dispatch {
            token,
            channel,
            raw,
            surplus,
            routes: Arc::clone(&self.routes),
            hooks: self.hooks.clone(),
            keep_alive_secs: self.config.keep_alive.as_secs(),
            write_timeout: self.config.write_timeout,
            notifier: self.notifier.clone(),
        })));

        let ret = {
            let task = Arc::clone(&task);

            self.pool.submit(move || {
                let d = task.lock().unwrap().take();

                if let Some(d) = d {
                    d.run();
                }
            })
        };

        if let Err(e) = ret {
            let d = task.lock().unwrap().take();

            if let Some(d) = d {
                if e == PoolError::Full {
                    warn!("{}: worker pool full, rejecting request", self.name);
                }

                // back in place so the error page goes out through the
                // normal path
                if let Some(conn) = self.conns.get_mut(token.0) {
                    conn.channel = Some(d.channel);
                }

                self.fail(token, 503);
            }
        }
    }

    // answer with an error page and close
    fn fail(&mut self, token: Token, code: u16) {
        self.parked.remove(&token);

        if let Some(channel) = self.conns.get_mut(token.0).and_then(|c| c.channel.as_mut()) {
            let mut resp = Response::error(code).then(Disposition::Close);
            resp.stamp(self.config.keep_alive.as_secs());
            resp.finish();

            if let Err(e) = channel.write_all(resp.page(), ERROR_WRITE_TIMEOUT) {
                debug!("{}: error page write failed: {}", self.name, e);
            }
        }

        self.close(token, None);
    }

    fn close(&mut self, token: Token, channel: Option<Channel>) {
        self.parked.remove(&token);

        let conn = self.conns.try_remove(token.0);

        let channel = match (channel, conn.and_then(|c| c.channel)) {
            (Some(c), _) => Some(c),
            (None, c) => c,
        };

        if let Some(mut channel) = channel {
            let _ = self.poll.registry().deregister(channel.stream_mut());

            channel.close();
        }
    }

    // evict requests that never completed, and idle connections
    fn sweep(&mut self) {
        let now = Instant::now();

        let stale: Vec<Token> = self
            .parked
            .iter()
            .filter(|(_, asm)| now.duration_since(asm.created()) >= self.config.request_timeout)
            .map(|(token, _)| *token)
            .collect();

        for token in stale {
            debug!("{}: request timed out", self.name);

            self.fail(token, 400);
        }

        let idle: Vec<Token> = self
            .conns
            .iter()
            .filter(|(key, conn)| {
                conn.channel.is_some()
                    && !self.parked.contains_key(&Token(*key))
                    && now.duration_since(conn.touched) >= self.config.keep_alive
            })
            .map(|(key, _)| Token(key))
            .collect();

        for token in idle {
            debug!("{}: closing idle connection", self.name);

            self.close(token, None);
        }
    }

    fn shutdown(mut self) {
        let tokens: Vec<Token> = self.conns.iter().map(|(key, _)| Token(key)).collect();

        for token in tokens {
            self.close(token, None);
        }

        self.pool.stop();

        if let Some(tasks) = &self.tasks {
            tasks.stop();
        }

        // connections returned by workers during the stop
        while let Ok(c) = self.receiver.try_recv() {
            match c {
                Command::Register(mut channel)
                | Command::Release(_, mut channel, _)
                | Command::Close(_, mut channel)
                | Command::Promote { mut channel, .. } => channel.close(),
                Command::Stop => {}
            }
        }

        debug!("{}: stopped", self.name);
    }
}

fn log_handshake_error(name: &str, peer_addr: SocketAddr, e: &TlsError) {
    if e.is_unknown_client_cert() {
        debug!("{}: {} presented no trusted certificate", name, peer_addr);
        return;
    }

    match e {
        TlsError::Io(e) if is_transient(e) => {
            debug!("{}: handshake with {} failed: {}", name, peer_addr, e)
        }
        TlsError::Closed | TlsError::Timeout => {
            debug!("{}: handshake with {} failed: {}", name, peer_addr, e)
        }
        e => error!("{}: handshake with {} failed: {}", name, peer_addr, e),
    }
}

// a listening port and the thread serving it
pub struct Server {
    name: String,
    addr: SocketAddr,
    notifier: Notifier,
    thread: Option<thread::JoinHandle<()>>,
}

impl Server {
    pub fn start(config: PortConfig, routes: Arc<Routes>, hooks: Hooks) -> Result<Self, io::Error> {
        let name = config.name.clone();

        let poll = Poll::new()?;

        let mut listener = TcpListener::bind(config.addr)?;
        let addr = listener.local_addr()?;

        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let (sender, receiver) = mpsc::channel();

        let notifier = Notifier { sender, waker };

        let pool = Arc::new(WorkerPool::with_counter(
            &format!("{}-worker", name),
            config.concurrency,
            config.concurrency * QUEUE_PER_THREAD,
            Arc::clone(&config.in_flight),
        ));

        let (acceptor, tasks) = match &config.tls {
            Some(tls) => {
                let tasks = Arc::new(TaskRunner::new(
                    &format!("{}-task", name),
                    config.concurrency * QUEUE_PER_THREAD,
                ));

                let acceptor = TlsAcceptor::new(Arc::clone(tls), Arc::clone(&tasks));

                (Some(Arc::new(acceptor)), Some(tasks))
            }
            None => (None, None),
        };

        info!(
            "{}: listening on {}{}",
            name,
            addr,
            if acceptor.is_some() { " (tls)" } else { "" }
        );

        let l = EventLoop {
            name: name.clone(),
            poll,
            listener,
            receiver,
            notifier: notifier.clone(),
            conns: Slab::new(),
            parked: HashMap::new(),
            pool,
            acceptor,
            tasks,
            handshakes: Arc::new(AtomicUsize::new(0)),
            routes,
            hooks,
            config,
        };

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || l.run())?;

        Ok(Self {
            name,
            addr,
            notifier,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.notifier.send(Command::Stop);

            let _ = thread.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Handler, HandlerError};
    use crate::http::Request;
    use crate::http::Method;
    use std::io::{Read, Write};
    use std::mem;
    use std::net::TcpStream;
    use std::str;

    fn hello() -> Arc<dyn Handler> {
        Arc::new(|req: &Request| -> Result<Response, HandlerError> {
            let mut resp = Response::new();
            resp.set_body(format!("hello {}", req.path()).into_bytes());

            Ok(resp)
        })
    }

    fn start(config: PortConfig) -> Server {
        let routes = Routes::builder().add("/", &[Method::Get], hello()).build();

        Server::start(config, Arc::new(routes), Hooks::default()).unwrap()
    }

    fn local_config() -> PortConfig {
        PortConfig::new("test-plain", "127.0.0.1:0".parse().unwrap())
    }

    // read one response framed by its content length. bytes past its end
    // are kept in rest for the next call
    fn read_response(stream: &mut TcpStream, rest: &mut Vec<u8>) -> String {
        let mut asm = RequestAssembler::new(1_000_000);
        let mut buf = [0; 4096];

        let mut done = !rest.is_empty() && asm.add(&mem::take(rest)).unwrap();

        while !done {
            let size = stream.read(&mut buf).unwrap();
            assert!(size > 0, "connection closed early");

            done = asm.add(&buf[..size]).unwrap();
        }

        let (raw, surplus) = asm.finish();
        *rest = surplus;

        String::from_utf8(raw).unwrap()
    }

    #[test]
    fn get_then_keep_alive() {
        let server = start(local_config());

        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        let mut rest = Vec::new();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        client.write_all(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();

        let resp = read_response(&mut client, &mut rest);
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(resp.contains("Connection: Keep-Alive\r\n"));
        assert!(resp.contains("Keep-Alive: timeout=30\r\n"));
        assert!(resp.contains("Server: relaygate/"));
        assert!(resp.ends_with("hello /a"));

        // same connection, second request split across writes
        client.write_all(b"GET /b HT").unwrap();
        thread::sleep(Duration::from_millis(50));
        client.write_all(b"TP/1.1\r\n\r\n").unwrap();

        let resp = read_response(&mut client, &mut rest);
        assert!(resp.ends_with("hello /b"));
    }

    #[test]
    fn pipelined_requests_answered_in_order() {
        let server = start(local_config());

        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        let mut rest = Vec::new();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        client
            .write_all(b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\n")
            .unwrap();

        assert!(read_response(&mut client, &mut rest).ends_with("hello /1"));
        assert!(read_response(&mut client, &mut rest).ends_with("hello /2"));
    }

    #[test]
    fn incomplete_request_times_out() {
        let mut config = local_config();
        config.request_timeout = Duration::from_millis(300);

        let server = start(config);

        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        client.write_all(b"GET /slow HTTP/1.1\r\nHost:").unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).unwrap();

        let out = str::from_utf8(&out).unwrap();
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(out.contains("Date: "));
    }

    #[test]
    fn errors_and_close() {
        let mut config = local_config();
        config.max_request_size = 64;

        let server = start(config);

        // method not routed
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client
            .write_all(b"DELETE /x HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).unwrap();
        assert!(out.starts_with(b"HTTP/1.1 405 "));

        // too large
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client
            .write_all(b"POST /x HTTP/1.1\r\nContent-Length: 1000\r\n\r\n")
            .unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).unwrap();
        assert!(out.starts_with(b"HTTP/1.1 413 "));
    }

    #[test]
    fn shutdown_disposition() {
        let (s, r) = mpsc::channel();
        let s = Mutex::new(s);

        let shutdown: Arc<dyn Handler> = Arc::new(|_: &Request| -> Result<Response, HandlerError> {
            Ok(Response::with_status(200).then(Disposition::Shutdown))
        });

        let routes = Routes::builder().add("/shutdown", &[], shutdown).build();

        let hooks = Hooks {
            promote: None,
            shutdown: Some(Arc::new(move || {
                s.lock().unwrap().send(()).unwrap();
            })),
        };

        let server = Server::start(local_config(), Arc::new(routes), hooks).unwrap();

        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"GET /shutdown HTTP/1.1\r\n\r\n").unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).unwrap();

        let out = str::from_utf8(&out).unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(out.contains("Content-Length: 0\r\n"));

        r.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
