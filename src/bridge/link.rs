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

//! Worker side of the bridge.
//!
//! A worker dials the admin port of each terminator and announces itself
//! with `POST /connect`. Once accepted, the same connection carries framed
//! requests from the terminator, which the worker answers through its
//! routes.

use super::frame::Message;
use super::peer::{BridgePeer, RequestHook};
use super::BridgeError;
use crate::connection::Channel;
use crate::core::net::{is_transient, set_socket_opts, wait_fd, Wait};
use crate::core::pool::WorkerPool;
use crate::handler::Routes;
use crate::http::{RequestAssembler, Response};
use crate::tls::TlsConnector;
use log::{debug, error, info, warn};
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::str;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const ATTACH_RESPONSE_MAX: usize = 64 * 1024;

const LINK_POLL_INTERVAL: Duration = Duration::from_millis(250);

// "<member id> <started ms>", as sent in both directions of /connect
pub fn format_identity(member_id: u16, started_ms: i64) -> String {
    format!("{} {}", member_id, started_ms)
}

pub fn parse_identity(body: &[u8]) -> Option<(u16, i64)> {
    let s = str::from_utf8(body).ok()?;

    let mut parts = s.split_whitespace();

    let id = parts.next()?.parse().ok()?;
    let started = parts.next()?.parse().ok()?;

    if parts.next().is_some() {
        return None;
    }

    Some((id, started))
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub member_id: u16,
    pub started_ms: i64,
    pub terminator_id: u16,
    pub addr: SocketAddr,
    pub connect_timeout: Duration,
    pub reconnect: Duration,
    pub write_timeout: Duration,
}

pub struct Attachment {
    pub channel: Channel,
    pub server_id: u16,
    pub server_started_ms: i64,

    // frames that arrived right behind the /connect response
    pub surplus: Vec<u8>,
}

fn connect_request(config: &LinkConfig) -> Vec<u8> {
    let body = format_identity(config.member_id, config.started_ms);

    format!(
        "POST /connect HTTP/1.1\r\nHost: {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        config.addr,
        body.len(),
        body
    )
    .into_bytes()
}

fn read_response(
    channel: &mut Channel,
    deadline: Instant,
) -> Result<(Response, Vec<u8>), BridgeError> {
    let mut asm = RequestAssembler::new(ATTACH_RESPONSE_MAX);

    loop {
        let data = match channel.read()? {
            Some(data) => data,
            None => return Err(BridgeError::Closed),
        };

        if data.is_empty() {
            let now = Instant::now();

            if now >= deadline {
                return Err(BridgeError::Timeout);
            }

            wait_fd(channel.as_raw_fd(), Wait::Readable, Some(deadline - now))?;
            continue;
        }

        let done = asm
            .add(&data)
            .map_err(|e| BridgeError::Rejected(e.to_string()))?;

        if done {
            break;
        }
    }

    let (raw, surplus) = asm.finish();

    let resp = Response::from_raw(raw).map_err(|e| BridgeError::Rejected(e.to_string()))?;

    Ok((resp, surplus))
}

// connect to a terminator and complete the /connect exchange
pub fn attach(
    config: &LinkConfig,
    connector: Option<&TlsConnector>,
) -> Result<Attachment, BridgeError> {
    let deadline = Instant::now() + config.connect_timeout;

    let stream = TcpStream::connect_timeout(&config.addr, config.connect_timeout)?;
    stream.set_nonblocking(true)?;

    let stream = mio::net::TcpStream::from_std(stream);
    set_socket_opts(&stream);

    let mut channel = match connector {
        Some(connector) => {
            let mut tls = connector.channel(stream)?;
            tls.handshake(deadline.saturating_duration_since(Instant::now()))?;

            Channel::tls(tls)
        }
        None => Channel::plain(stream),
    };

    channel.write_all(&connect_request(config), config.write_timeout)?;

    let (resp, surplus) = read_response(&mut channel, deadline)?;

    if resp.status() != 200 {
        channel.close();

        return Err(BridgeError::Rejected(format!(
            "terminator answered {}",
            resp.status()
        )));
    }

    let (server_id, server_started_ms) = match parse_identity(resp.body()) {
        Some(ret) => ret,
        None => {
            channel.close();

            return Err(BridgeError::Rejected("malformed identity".to_string()));
        }
    };

    if server_id != config.terminator_id {
        channel.close();

        return Err(BridgeError::Rejected(format!(
            "expected member {}, reached {}",
            config.terminator_id, server_id
        )));
    }

    Ok(Attachment {
        channel,
        server_id,
        server_started_ms,
        surplus,
    })
}

// serve bridged requests on the pool. a full pool answers 503 in place
pub fn request_hook(pool: Arc<WorkerPool>, routes: Arc<Routes>, keep_alive_secs: u64) -> RequestHook {
    Arc::new(move |peer: &BridgePeer, msg: Message| {
        let id = msg.id;

        let ret = {
            let peer = peer.clone();
            let routes = Arc::clone(&routes);

            pool.submit(move || {
                let mut resp = routes.serve(msg.payload);
                resp.stamp(keep_alive_secs);
                resp.finish();

                if let Err(e) = peer.reply(id, &resp.into_page()) {
                    debug!("{}: reply to {} failed: {}", peer.name(), id, e);
                }
            })
        };

        if let Err(e) = ret {
            warn!("{}: rejecting request {}: {}", peer.name(), id, e);

            let mut resp = Response::error(503);
            resp.stamp(keep_alive_secs);
            resp.finish();

            if let Err(e) = peer.reply(id, &resp.into_page()) {
                debug!("{}: reply to {} failed: {}", peer.name(), id, e);
            }
        }
    })
}

fn log_attach_error(name: &str, addr: SocketAddr, e: &BridgeError) {
    match e {
        BridgeError::Io(e) if is_transient(e) || e.kind() == io::ErrorKind::ConnectionRefused => {
            debug!("{}: cannot reach {}: {}", name, addr, e)
        }
        BridgeError::Closed | BridgeError::Timeout => {
            debug!("{}: cannot attach to {}: {}", name, addr, e)
        }
        e => warn!("{}: cannot attach to {}: {}", name, addr, e),
    }
}

// true if asked to stop, false if the peer closed on its own
fn wait_closed(peer: &BridgePeer, stop: &mpsc::Receiver<()>) -> bool {
    loop {
        match stop.recv_timeout(LINK_POLL_INTERVAL) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if !peer.is_open() {
                    return false;
                }
            }
            _ => return true,
        }
    }
}

fn link_loop(
    name: String,
    config: LinkConfig,
    connector: Option<Arc<TlsConnector>>,
    hook: RequestHook,
    stop: mpsc::Receiver<()>,
) {
    loop {
        match attach(&config, connector.as_deref()) {
            Ok(a) => {
                info!(
                    "{}: attached to member {} at {}",
                    name, a.server_id, config.addr
                );

                let ret = BridgePeer::start(
                    &name,
                    a.server_id,
                    a.server_started_ms,
                    a.channel,
                    &a.surplus,
                    Some(Arc::clone(&hook)),
                    config.write_timeout,
                );

                match ret {
                    Ok(peer) => {
                        let stopped = wait_closed(&peer, &stop);

                        peer.close();
                        peer.join();

                        if stopped {
                            break;
                        }

                        info!("{}: detached from member {}", name, a.server_id);
                    }
                    Err(e) => error!("{}: failed to start bridge peer: {}", name, e),
                }
            }
            Err(e) => log_attach_error(&name, config.addr, &e),
        }

        match stop.recv_timeout(config.reconnect) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }

    debug!("{}: stopped", name);
}

// keeps one worker attached to one terminator, reconnecting as needed
pub struct Link {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Link {
    pub fn start(
        config: LinkConfig,
        connector: Option<Arc<TlsConnector>>,
        hook: RequestHook,
    ) -> Result<Self, io::Error> {
        let name = format!("link-{}", config.terminator_id);

        let (s, r) = mpsc::channel();

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || link_loop(name, config, connector, hook, r))?;

        Ok(Self {
            stop: Some(s),
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop.take();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::frame::{encode_message, read_header, HEADER_SIZE};
    use crate::handler::{Handler, HandlerError};
    use crate::http::Request;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn config(addr: SocketAddr) -> LinkConfig {
        LinkConfig {
            member_id: 5,
            started_ms: 1234,
            terminator_id: 0,
            addr,
            connect_timeout: Duration::from_secs(5),
            reconnect: Duration::from_millis(100),
            write_timeout: Duration::from_secs(5),
        }
    }

    // read the /connect request off a blocking stream
    fn read_request(stream: &mut TcpStream) -> Request {
        let mut asm = RequestAssembler::new(ATTACH_RESPONSE_MAX);
        let mut buf = [0; 1024];

        loop {
            let size = stream.read(&mut buf).unwrap();
            assert!(size > 0);

            if asm.add(&buf[..size]).unwrap() {
                break;
            }
        }

        Request::parse(asm.finish().0).unwrap()
    }

    #[test]
    fn identity() {
        assert_eq!(format_identity(3, 1700000000000), "3 1700000000000");
        assert_eq!(parse_identity(b"3 1700000000000"), Some((3, 1700000000000)));
        assert_eq!(parse_identity(b" 3  42\r\n"), Some((3, 42)));
        assert_eq!(parse_identity(b"3"), None);
        assert_eq!(parse_identity(b"3 4 5"), None);
        assert_eq!(parse_identity(b"x 4"), None);
        assert_eq!(parse_identity(b"70000 4"), None);
    }

    #[test]
    fn attach_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let t = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();

            let req = read_request(&mut stream);
            assert_eq!(req.path(), "/connect");
            assert_eq!(req.body(), b"5 1234");

            stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                .unwrap();
        });

        let ret = attach(&config(addr), None);
        assert!(matches!(ret, Err(BridgeError::Rejected(_))));

        t.join().unwrap();
    }

    #[test]
    fn serves_bridged_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let hello: Arc<dyn Handler> = Arc::new(|req: &Request| -> Result<Response, HandlerError> {
            let mut resp = Response::new();
            resp.set_body(format!("served {}", req.path()).into_bytes());

            Ok(resp)
        });

        let routes = Arc::new(Routes::builder().add("/", &[], hello).build());
        let pool = Arc::new(WorkerPool::new("test-link", 2, 16));

        let mut link = Link::start(config(addr), None, request_hook(pool, routes, 30)).unwrap();

        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let req = read_request(&mut stream);
        assert_eq!(req.method_str(), "POST");
        assert_eq!(req.body(), b"5 1234");

        let mut out = b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\n0 9999".to_vec();

        // a request right behind the response
        encode_message(9, b"GET /hello HTTP/1.1\r\n\r\n", &mut out).unwrap();
        stream.write_all(&out).unwrap();

        let mut head = [0; HEADER_SIZE];
        stream.read_exact(&mut head).unwrap();

        let h = read_header(&head).unwrap();
        assert_eq!(h.id, 9);
        assert!(h.is_final());

        let mut payload = vec![0; h.length as usize];
        stream.read_exact(&mut payload).unwrap();

        let page = String::from_utf8(payload).unwrap();
        assert!(page.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(page.contains("Keep-Alive: timeout=30\r\n"));
        assert!(page.ends_with("served /hello"));

        link.stop();

        // the worker side hung up
        let mut buf = [0; 16];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    // accept a worker, check its /connect and acknowledge it as member 0
    fn accept_attach(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let req = read_request(&mut stream);
        assert_eq!(req.path(), "/connect");
        assert_eq!(req.body(), b"5 1234");

        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\n0 9999")
            .unwrap();

        stream
    }

    fn ask(stream: &mut TcpStream, id: i64, path: &str) -> String {
        let mut out = Vec::new();
        encode_message(id, format!("GET {} HTTP/1.1\r\n\r\n", path).as_bytes(), &mut out)
            .unwrap();
        stream.write_all(&out).unwrap();

        let mut head = [0; HEADER_SIZE];
        stream.read_exact(&mut head).unwrap();

        let h = read_header(&head).unwrap();
        assert_eq!(h.id, id);

        let mut payload = vec![0; h.length as usize];
        stream.read_exact(&mut payload).unwrap();

        String::from_utf8(payload).unwrap()
    }

    #[test]
    fn reattaches_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let hello: Arc<dyn Handler> = Arc::new(|req: &Request| -> Result<Response, HandlerError> {
            let mut resp = Response::new();
            resp.set_body(format!("served {}", req.path()).into_bytes());

            Ok(resp)
        });

        let routes = Arc::new(Routes::builder().add("/", &[], hello).build());
        let pool = Arc::new(WorkerPool::new("test-link", 2, 16));

        let mut link = Link::start(config(addr), None, request_hook(pool, routes, 30)).unwrap();

        let mut stream = accept_attach(&listener);
        assert!(ask(&mut stream, 1, "/first").ends_with("served /first"));

        // the terminator side goes away
        let dropped = Instant::now();
        drop(stream);

        let mut stream = accept_attach(&listener);
        assert!(dropped.elapsed() >= Duration::from_millis(100));

        assert!(ask(&mut stream, 2, "/second").ends_with("served /second"));

        link.stop();
    }
}
