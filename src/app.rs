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

use crate::admin::{
    promote_hook, ConnectHandler, ForwardHandler, InfoHandler, RedirectHandler, ShutdownHandler,
    StatusHandler,
};
use crate::balancer::LoadBalancer;
use crate::bridge::link::{request_hook, Link, LinkConfig};
use crate::cluster::heartbeat::{Heartbeat, HeartbeatThread, LiveView, Ports};
use crate::cluster::respawn::{ExecSpawner, KillProbe, Reconciler};
use crate::cluster::table::MembershipTable;
use crate::cluster::{Role, Topology};
use crate::core::config::Settings;
use crate::core::pool::{TaskRunner, WorkerPool};
use crate::core::time::epoch_millis;
use crate::handler::{Handler, Routes};
use crate::http::Method;
use crate::server::{Hooks, PortConfig, Server};
use crate::tls::{IdentityProvider, PemIdentity, TlsConnector};
use log::{debug, info};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::iterator::Signals;
use std::error::Error;
use std::fs;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

const LINK_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const QUEUE_PER_THREAD: usize = 16;
const LINK_TASK_QUEUE_MAX: usize = 64;

// set once, by a signal or by /shutdown
#[derive(Default)]
pub struct ShutdownSignal {
    triggered: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let triggered = &mut *self.triggered.lock().unwrap();

        if !*triggered {
            *triggered = true;

            self.cond.notify_all();
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock().unwrap()
    }

    pub fn wait(&self) {
        let mut triggered = self.triggered.lock().unwrap();

        while !*triggered {
            triggered = self.cond.wait(triggered).unwrap();
        }
    }

    // returns whether triggered
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let triggered = self.triggered.lock().unwrap();

        let (triggered, _) = self
            .cond
            .wait_timeout_while(triggered, timeout, |t| !*t)
            .unwrap();

        *triggered
    }
}

// what the process was started with, beyond the settings
#[derive(Default)]
pub struct Launch {
    pub config_file: Option<PathBuf>,
    pub log_level: Option<u8>,

    // answers application requests. defaults to a description of the member
    pub handler: Option<Arc<dyn Handler>>,
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, io::Error> {
    match (host, port).to_socket_addrs()?.next() {
        Some(addr) => Ok(addr),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address for {}", host),
        )),
    }
}

fn port_config(
    settings: &Settings,
    name: &str,
    addr: SocketAddr,
    in_flight: &Arc<AtomicUsize>,
) -> PortConfig {
    let mut config = PortConfig::new(name, addr);

    config.concurrency = settings.server.concurrency;
    config.request_timeout = settings.request_timeout();
    config.keep_alive = Duration::from_secs(settings.server.keep_alive_secs);
    config.max_request_size = settings.server.max_request_size;
    config.write_timeout = settings.bridge_timeout();
    config.handshake_timeout = HANDSHAKE_TIMEOUT;
    config.in_flight = Arc::clone(in_flight);

    config
}

fn open_table(settings: &Settings) -> Result<MembershipTable, Box<dyn Error>> {
    let path = Path::new(&settings.cluster.table_path);

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }

    Ok(MembershipTable::open(path, settings.cluster.capacity)?)
}

pub struct App {
    id: u16,
    role: Role,
    shutdown: Arc<ShutdownSignal>,
    heartbeat: Option<HeartbeatThread>,
    links: Vec<Link>,
    servers: Vec<Server>,
    balancer: Option<Arc<LoadBalancer>>,
}

impl App {
    pub fn new(id: u16, settings: &Settings, launch: Launch) -> Result<Self, Box<dyn Error>> {
        let topology = Topology::from_settings(settings);

        let role = match topology.role_of(id) {
            Some(role) => role,
            None => {
                return Err(format!(
                    "member id {} is outside the configured topology ({} members)",
                    id,
                    topology.terminators() + topology.workers()
                )
                .into())
            }
        };

        let started_ms = epoch_millis();
        let shutdown = Arc::new(ShutdownSignal::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let view = LiveView::new();

        let identity = PemIdentity::new(
            Path::new(&settings.tls.cert_file),
            Path::new(&settings.tls.key_file),
            Path::new(&settings.tls.ca_file),
        );

        let app_handler: Arc<dyn Handler> = match launch.handler {
            Some(h) => h,
            None => Arc::new(InfoHandler::new(id, role)),
        };

        let hooks = {
            let shutdown = Arc::clone(&shutdown);

            Hooks {
                promote: None,
                shutdown: Some(Arc::new(move || shutdown.trigger())),
            }
        };

        let host = &settings.server.host;

        let mut servers = Vec::new();
        let mut links = Vec::new();
        let mut balancer = None;

        let ports = match role {
            Role::Terminator => {
                if !topology.is_embedded() {
                    balancer = Some(Arc::new(LoadBalancer::new(
                        topology.terminators(),
                        topology.workers(),
                        settings.server.concurrency,
                        Arc::new(view.clone()),
                    )));
                }

                let app_routes = Arc::new(match &balancer {
                    Some(b) => {
                        let forward = ForwardHandler::new(Arc::clone(b), settings.bridge_timeout());

                        Routes::builder().add("/", &[], Arc::new(forward)).build()
                    }
                    None => Routes::builder().add("/", &[], app_handler).build(),
                });

                let tls_port = settings.tls_port(id);
                let plain_port = settings.plain_port(id);
                let admin_port = settings.admin_port(id);

                let mut config =
                    port_config(settings, "tls", resolve(host, tls_port)?, &in_flight);
                config.tls = Some(identity.server_config(settings.tls.client_auth)?);

                servers.push(Server::start(config, Arc::clone(&app_routes), hooks.clone())?);

                let plain_routes = if settings.server.redirect_plain_to_tls {
                    let redirect = RedirectHandler::new(host, tls_port);

                    Arc::new(Routes::builder().add("/", &[], Arc::new(redirect)).build())
                } else {
                    Arc::clone(&app_routes)
                };

                let config = port_config(settings, "plain", resolve(host, plain_port)?, &in_flight);

                servers.push(Server::start(config, plain_routes, hooks.clone())?);

                let connect = ConnectHandler::new(id, started_ms, topology.clone(), balancer.is_some());

                let admin_routes = Routes::builder()
                    .add("/connect", &[Method::Post], Arc::new(connect))
                    .add("/shutdown", &[Method::Post], Arc::new(ShutdownHandler))
                    .add("/status", &[Method::Get], Arc::new(StatusHandler::new(view.clone())))
                    .build();

                let mut config = port_config(settings, "admin", resolve(host, admin_port)?, &in_flight);

                if settings.tls.admin_tls {
                    config.tls = Some(identity.server_config(true)?);
                }

                let mut admin_hooks = hooks.clone();
                admin_hooks.promote = balancer
                    .as_ref()
                    .map(|b| promote_hook(Arc::clone(b), settings.bridge_timeout()));

                servers.push(Server::start(config, Arc::new(admin_routes), admin_hooks)?);

                Ports {
                    tls: tls_port,
                    plain: plain_port,
                    admin: admin_port,
                }
            }
            Role::Worker => {
                let admin_port = settings.admin_port(id);

                let admin_routes = Routes::builder()
                    .add("/shutdown", &[Method::Post], Arc::new(ShutdownHandler))
                    .add("/status", &[Method::Get], Arc::new(StatusHandler::new(view.clone())))
                    .build();

                let mut config = port_config(settings, "admin", resolve(host, admin_port)?, &in_flight);

                if settings.tls.admin_tls {
                    config.tls = Some(identity.server_config(true)?);
                }

                servers.push(Server::start(config, Arc::new(admin_routes), hooks.clone())?);

                let connector = if settings.tls.admin_tls {
                    let tasks = Arc::new(TaskRunner::new("link-task", LINK_TASK_QUEUE_MAX));

                    Some(Arc::new(TlsConnector::new(
                        identity.client_config()?,
                        &settings.tls.server_name,
                        tasks,
                    )?))
                } else {
                    None
                };

                let pool = Arc::new(WorkerPool::with_counter(
                    "bridge-worker",
                    settings.server.concurrency,
                    settings.server.concurrency * QUEUE_PER_THREAD,
                    Arc::clone(&in_flight),
                ));

                let routes = Arc::new(Routes::builder().add("/", &[], app_handler).build());
                let hook = request_hook(pool, routes, settings.server.keep_alive_secs);

                for t in topology.terminator_ids() {
                    let config = LinkConfig {
                        member_id: id,
                        started_ms,
                        terminator_id: t,
                        addr: resolve(host, settings.admin_port(t))?,
                        connect_timeout: LINK_CONNECT_TIMEOUT,
                        reconnect: Duration::from_millis(settings.bridge.reconnect_ms),
                        write_timeout: settings.bridge_timeout(),
                    };

                    links.push(Link::start(config, connector.clone(), Arc::clone(&hook))?);
                }

                Ports {
                    tls: 0,
                    plain: 0,
                    admin: admin_port,
                }
            }
        };

        let table = Arc::new(open_table(settings)?);

        let mut hb = Heartbeat::new(
            id,
            role,
            started_ms,
            ports,
            settings.heartbeat_interval(),
            table,
            Arc::clone(&in_flight),
            view,
        );

        if settings.cluster.respawn {
            let spawner = ExecSpawner::current(launch.config_file, launch.log_level)?;

            hb = hb.with_reconciler(Reconciler::new(
                topology,
                id,
                settings.heartbeat_interval(),
                Box::new(spawner),
                Box::new(KillProbe),
            ));
        }

        let heartbeat = HeartbeatThread::start(hb)?;

        info!("member {} running as {:?}", id, role);

        Ok(Self {
            id,
            role,
            shutdown,
            heartbeat: Some(heartbeat),
            links,
            servers,
            balancer,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn shutdown_signal(&self) -> Arc<ShutdownSignal> {
        Arc::clone(&self.shutdown)
    }

    pub fn local_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.servers
            .iter()
            .map(|s| (s.name().to_string(), s.local_addr()))
            .collect()
    }

    // block until a termination signal or /shutdown
    pub fn wait_for_term(&self) -> Result<(), Box<dyn Error>> {
        let mut signals = Signals::new(TERM_SIGNALS)?;

        let term_now = Arc::new(AtomicBool::new(false));

        // ensure two term signals in a row causes the app to immediately exit
        for signal_type in TERM_SIGNALS {
            signal_hook::flag::register_conditional_shutdown(
                *signal_type,
                1, // exit code
                Arc::clone(&term_now),
            )?;

            signal_hook::flag::register(*signal_type, Arc::clone(&term_now))?;
        }

        let handle = signals.handle();

        let watcher = {
            let shutdown = Arc::clone(&self.shutdown);

            thread::Builder::new()
                .name("signals".to_string())
                .spawn(move || {
                    if let Some(signal) = signals.forever().next() {
                        debug!("received signal {}", signal);

                        shutdown.trigger();
                    }
                })?
        };

        self.shutdown.wait();

        handle.close();
        let _ = watcher.join();

        Ok(())
    }

    pub fn stop(&mut self) {
        // leave the cluster first so the manager notices promptly
        self.heartbeat.take();

        for mut link in self.links.drain(..) {
            link.stop();
        }

        for mut server in self.servers.drain(..) {
            server.stop();
        }

        if let Some(balancer) = self.balancer.take() {
            balancer.close_all();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn shutdown_signal() {
        let s = Arc::new(ShutdownSignal::new());
        assert!(!s.is_triggered());
        assert!(!s.wait_timeout(Duration::from_millis(10)));

        let t = {
            let s = Arc::clone(&s);

            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                s.trigger();
                s.trigger();
            })
        };

        let start = Instant::now();
        s.wait();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(s.is_triggered());
        assert!(s.wait_timeout(Duration::from_millis(10)));

        t.join().unwrap();
    }

    #[test]
    fn rejects_unknown_member() {
        let settings = Settings::default();

        // one terminator, no workers
        let ret = App::new(5, &settings, Launch::default());
        assert!(ret.is_err());
    }
}
