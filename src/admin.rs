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

//! Built-in handlers: the admin control endpoints, the cluster status
//! document, plaintext redirection and forwarding through the bridge.

use crate::balancer::LoadBalancer;
use crate::bridge::link::{format_identity, parse_identity};
use crate::bridge::{BridgeError, BridgePeer};
use crate::cluster::heartbeat::LiveView;
use crate::cluster::{Role, Topology};
use crate::connection::Channel;
use crate::handler::{Handler, HandlerError};
use crate::http::{Disposition, Request, Response};
use crate::server::PromoteHook;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

// a worker announcing itself. the connection becomes its bridge link
pub struct ConnectHandler {
    member_id: u16,
    started_ms: i64,
    topology: Topology,
    accepting: bool,
}

impl ConnectHandler {
    // accepting is false when there is no balancer to take the link
    pub fn new(member_id: u16, started_ms: i64, topology: Topology, accepting: bool) -> Self {
        Self {
            member_id,
            started_ms,
            topology,
            accepting,
        }
    }
}

impl Handler for ConnectHandler {
    fn handle(&self, req: &Request) -> Result<Response, HandlerError> {
        let (worker_id, worker_started_ms) = match parse_identity(req.body()) {
            Some(ret) => ret,
            None => {
                return Err(HandlerError::BadRequest(
                    "expected \"<id> <started>\"".to_string(),
                ))
            }
        };

        if self.topology.role_of(worker_id) != Some(Role::Worker) {
            return Err(HandlerError::BadRequest(format!(
                "member {} is not a worker",
                worker_id
            )));
        }

        if !self.accepting {
            return Err(HandlerError::BadRequest(
                "not accepting worker links".to_string(),
            ));
        }

        debug!("worker {} started at {} connecting", worker_id, worker_started_ms);

        let mut resp = Response::new();
        resp.set_body(format_identity(self.member_id, self.started_ms).into_bytes());

        Ok(resp.then(Disposition::Promote {
            member_id: worker_id,
            started_ms: worker_started_ms,
        }))
    }
}

pub struct ShutdownHandler;

impl Handler for ShutdownHandler {
    fn handle(&self, _req: &Request) -> Result<Response, HandlerError> {
        info!("shutdown requested");

        Ok(Response::with_status(200).then(Disposition::Shutdown))
    }
}

// the live members of the cluster as JSON
pub struct StatusHandler {
    view: LiveView,
}

impl StatusHandler {
    pub fn new(view: LiveView) -> Self {
        Self { view }
    }
}

impl Handler for StatusHandler {
    fn handle(&self, _req: &Request) -> Result<Response, HandlerError> {
        let live: Vec<_> = self.view.snapshot().into_iter().filter(|s| s.live).collect();

        let body = serde_json::to_vec(&live).map_err(|e| HandlerError::Internal(e.to_string()))?;

        let mut resp = Response::new();
        resp.set_header("Content-Type", "application/json");
        resp.set_body(body);

        Ok(resp)
    }
}

// sends plaintext clients to the same path on the TLS port
pub struct RedirectHandler {
    host: String,
    tls_port: u16,
}

impl RedirectHandler {
    pub fn new(host: &str, tls_port: u16) -> Self {
        Self {
            host: host.to_string(),
            tls_port,
        }
    }

    fn location(&self, req: &Request) -> String {
        // prefer the name the client used
        let host = match req.header("Host") {
            Some(h) if !h.is_empty() => match h.rsplit_once(':') {
                Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
                _ => h,
            },
            _ => self.host.as_str(),
        };

        format!("https://{}:{}{}", host, self.tls_port, req.target())
    }
}

impl Handler for RedirectHandler {
    fn handle(&self, req: &Request) -> Result<Response, HandlerError> {
        let mut resp = Response::with_status(301);
        resp.set_header("Location", &self.location(req));

        Ok(resp)
    }
}

// answers from a worker picked by the balancer, relaying its response as is
pub struct ForwardHandler {
    balancer: Arc<LoadBalancer>,
    timeout: Duration,
}

impl ForwardHandler {
    pub fn new(balancer: Arc<LoadBalancer>, timeout: Duration) -> Self {
        Self { balancer, timeout }
    }
}

impl Handler for ForwardHandler {
    fn handle(&self, req: &Request) -> Result<Response, HandlerError> {
        // a peer can close between the pick and the send. try one other
        let mut tries = 2;

        let raw = loop {
            let peer = self.balancer.pick()?;

            tries -= 1;

            match peer.send(req.raw(), self.timeout) {
                Ok(raw) => break raw,
                Err(BridgeError::Closed) if tries > 0 => {
                    debug!("{} closed during send, retrying", peer.name());
                }
                Err(e) => return Err(e.into()),
            }
        };

        Response::from_raw(raw).map_err(|e| BridgeError::BadResponse(e.to_string()).into())
    }
}

// general information about the member, for traffic that no other handler
// takes
#[derive(Serialize)]
struct Info<'a> {
    member: u16,
    role: &'a str,
    method: &'a str,
    path: &'a str,
}

pub struct InfoHandler {
    member_id: u16,
    role: Role,
}

impl InfoHandler {
    pub fn new(member_id: u16, role: Role) -> Self {
        Self { member_id, role }
    }
}

impl Handler for InfoHandler {
    fn handle(&self, req: &Request) -> Result<Response, HandlerError> {
        let info = Info {
            member: self.member_id,
            role: match self.role {
                Role::Terminator => "terminator",
                Role::Worker => "worker",
            },
            method: req.method_str(),
            path: req.path(),
        };

        let body = serde_json::to_vec(&info).map_err(|e| HandlerError::Internal(e.to_string()))?;

        let mut resp = Response::new();
        resp.set_header("Content-Type", "application/json");
        resp.set_body(body);

        Ok(resp)
    }
}

// turn a promoted admin connection into a registered worker link
pub fn promote_hook(balancer: Arc<LoadBalancer>, write_timeout: Duration) -> PromoteHook {
    Arc::new(move |channel: Channel, member_id: u16, started_ms: i64, surplus: Vec<u8>| {
        let name = format!("bridge-{}", member_id);

        let peer = match BridgePeer::start(
            &name,
            member_id,
            started_ms,
            channel,
            &surplus,
            None,
            write_timeout,
        ) {
            Ok(peer) => peer,
            Err(e) => {
                error!("{}: failed to start: {}", name, e);
                return;
            }
        };

        match balancer.register(peer.clone()) {
            Ok(old) => {
                if let Some(old) = old {
                    info!("{}: replacing previous link", name);

                    old.close();
                }

                let balancer = Arc::clone(&balancer);
                let p = peer.clone();

                peer.set_on_close(move || {
                    if balancer.deregister(&p) {
                        info!("{}: link closed", p.name());
                    }
                });
            }
            Err(e) => {
                warn!("{}: {}", name, e);

                peer.close();
            }
        }
    })
}
