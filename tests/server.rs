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

use relaygate::admin::{
    promote_hook, ConnectHandler, ForwardHandler, InfoHandler, ShutdownHandler,
};
use relaygate::app::ShutdownSignal;
use relaygate::balancer::LoadBalancer;
use relaygate::bridge::link::{request_hook, Link, LinkConfig};
use relaygate::cluster::{Role, Topology};
use relaygate::core::pool::WorkerPool;
use relaygate::handler::{Handler, HandlerError, Routes};
use relaygate::http::{Method, Request, RequestAssembler, Response};
use relaygate::server::{Hooks, PortConfig, Server};
use std::io::{Read, Write};
use std::mem;
use std::net::TcpStream;
use std::str;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use test_log::test;

fn port(name: &str) -> PortConfig {
    let mut config = PortConfig::new(name, "127.0.0.1:0".parse().unwrap());
    config.concurrency = 2;

    config
}

fn client(server: &Server) -> TcpStream {
    let stream = TcpStream::connect(server.local_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    stream
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
fn plaintext_get() {
    let routes = Routes::builder()
        .add("/", &[Method::Get], Arc::new(InfoHandler::new(0, Role::Terminator)))
        .build();

    let server = Server::start(port("plain"), Arc::new(routes), Hooks::default()).unwrap();

    let mut c = client(&server);
    let mut rest = Vec::new();

    // delivered in pieces
    for part in ["GET /x HT", "TP/1.1\r\nHo", "st: h\r\n", "\r\n"] {
        c.write_all(part.as_bytes()).unwrap();
        thread::sleep(Duration::from_millis(20));
    }

    let resp = read_response(&mut c, &mut rest);

    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(resp.contains("Content-Type: application/json\r\n"));
    assert!(resp.contains("Connection: Keep-Alive\r\n"));
    assert!(resp.contains("Date: "));

    let body = &resp[(resp.find("\r\n\r\n").unwrap() + 4)..];
    let doc: serde_json::Value = serde_json::from_str(body).unwrap();

    assert_eq!(doc["member"], 0);
    assert_eq!(doc["path"], "/x");
}

#[test]
fn shutdown_over_plaintext() {
    let signal = Arc::new(ShutdownSignal::new());

    let hooks = {
        let signal = Arc::clone(&signal);

        Hooks {
            promote: None,
            shutdown: Some(Arc::new(move || signal.trigger())),
        }
    };

    let routes = Routes::builder()
        .add("/", &[], Arc::new(InfoHandler::new(0, Role::Terminator)))
        .add("/shutdown", &[], Arc::new(ShutdownHandler))
        .build();

    let server = Server::start(port("plain"), Arc::new(routes), hooks).unwrap();

    let mut c = client(&server);
    c.write_all(b"GET /shutdown HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();

    let mut out = Vec::new();
    c.read_to_end(&mut out).unwrap();

    let out = str::from_utf8(&out).unwrap();
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("Server: relaygate/"));
    assert!(out.ends_with("\r\n\r\n"));

    assert!(signal.wait_timeout(Duration::from_secs(5)));
}

#[test]
fn no_workers_is_unavailable() {
    let balancer = LoadBalancer::new(1, 1, 1, Arc::new(|_: u16, _: i64| true))
        .with_retry(2, Duration::from_millis(10));

    let forward = ForwardHandler::new(Arc::new(balancer), Duration::from_secs(5));

    let routes = Routes::builder().add("/", &[], Arc::new(forward)).build();

    let server = Server::start(port("tls"), Arc::new(routes), Hooks::default()).unwrap();

    let mut c = client(&server);
    let mut rest = Vec::new();
    c.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();

    let resp = read_response(&mut c, &mut rest);
    assert!(resp.starts_with("HTTP/1.1 503 "));

    // the connection survives a failed request
    c.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();

    let resp = read_response(&mut c, &mut rest);
    assert!(resp.starts_with("HTTP/1.1 503 "));
}

#[test]
fn forwards_through_worker_link() {
    let topology = Topology::new(4, 1, 1);

    let balancer = Arc::new(LoadBalancer::new(
        1,
        1,
        4,
        Arc::new(|_: u16, _: i64| true),
    ));

    // terminator admin port, accepting worker links
    let admin_routes = Routes::builder()
        .add(
            "/connect",
            &[Method::Post],
            Arc::new(ConnectHandler::new(0, 1000, topology.clone(), true)),
        )
        .build();

    let admin_hooks = Hooks {
        promote: Some(promote_hook(Arc::clone(&balancer), Duration::from_secs(5))),
        shutdown: None,
    };

    let admin = Server::start(port("admin"), Arc::new(admin_routes), admin_hooks).unwrap();

    // terminator front port
    let forward = ForwardHandler::new(Arc::clone(&balancer), Duration::from_secs(5));
    let front_routes = Routes::builder().add("/", &[], Arc::new(forward)).build();

    let front = Server::start(port("front"), Arc::new(front_routes), Hooks::default()).unwrap();

    // worker
    let echo: Arc<dyn Handler> = Arc::new(|req: &Request| -> Result<Response, HandlerError> {
        let mut resp = Response::new();
        resp.set_header("X-Served-By", "1");
        resp.set_body(format!("{} {} {}", req.method_str(), req.path(), req.body().len()).into_bytes());

        Ok(resp)
    });

    let worker_routes = Arc::new(Routes::builder().add("/", &[], echo).build());
    let pool = Arc::new(WorkerPool::new("worker", 2, 16));

    let link_config = LinkConfig {
        member_id: 1,
        started_ms: 2000,
        terminator_id: 0,
        addr: admin.local_addr(),
        connect_timeout: Duration::from_secs(5),
        reconnect: Duration::from_millis(100),
        write_timeout: Duration::from_secs(5),
    };

    let mut link = Link::start(link_config, None, request_hook(pool, worker_routes, 30)).unwrap();

    for _ in 0..250 {
        if !balancer.peers().is_empty() {
            break;
        }

        thread::sleep(Duration::from_millis(20));
    }

    let peers = balancer.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].member_id(), 1);
    assert_eq!(peers[0].started_ms(), 2000);

    let mut c = client(&front);
    let mut rest = Vec::new();

    c.write_all(b"POST /items HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
        .unwrap();

    let resp = read_response(&mut c, &mut rest);
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(resp.contains("X-Served-By: 1\r\n"));
    assert!(resp.ends_with("POST /items 5"));

    c.write_all(b"GET /other HTTP/1.1\r\n\r\n").unwrap();

    let resp = read_response(&mut c, &mut rest);
    assert!(resp.ends_with("GET /other 0"));

    // the worker leaving takes it out of rotation
    link.stop();

    for _ in 0..250 {
        if balancer.peers().is_empty() {
            break;
        }

        thread::sleep(Duration::from_millis(20));
    }

    assert!(balancer.peers().is_empty());
}
