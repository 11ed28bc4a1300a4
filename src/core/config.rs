/*
 * Copyright (C) 2023-2026 Fastly, Inc.
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

use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Cluster {
    pub capacity: u16,
    pub terminators: u16,
    pub workers: u16,
    pub heartbeat_interval_ms: u64,
    pub table_path: String,
    pub respawn: bool,
}

impl Default for Cluster {
    fn default() -> Self {
        Self {
            capacity: 8,
            terminators: 1,
            workers: 0,
            heartbeat_interval_ms: 1000,
            table_path: String::from("run/relaygate.members"),
            respawn: true,
        }
    }
}

impl From<Cluster> for config::ValueKind {
    fn from(cluster: Cluster) -> Self {
        let mut properties = HashMap::new();
        properties.insert(
            "capacity".to_string(),
            config::Value::from(i64::from(cluster.capacity)),
        );
        properties.insert(
            "terminators".to_string(),
            config::Value::from(i64::from(cluster.terminators)),
        );
        properties.insert(
            "workers".to_string(),
            config::Value::from(i64::from(cluster.workers)),
        );
        properties.insert(
            "heartbeat_interval_ms".to_string(),
            config::Value::from(cluster.heartbeat_interval_ms as i64),
        );
        properties.insert(
            "table_path".to_string(),
            config::Value::from(cluster.table_path),
        );
        properties.insert("respawn".to_string(), config::Value::from(cluster.respawn));

        Self::Table(properties)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Server {
    pub host: String,
    pub tls_port_base: u16,
    pub plain_port_base: u16,
    pub admin_port_base: u16,
    pub concurrency: usize,
    pub request_timeout_secs: u64,
    pub keep_alive_secs: u64,
    pub redirect_plain_to_tls: bool,
    pub max_request_size: usize,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            tls_port_base: 8443,
            plain_port_base: 8080,
            admin_port_base: 9443,
            concurrency: 8,
            request_timeout_secs: 30,
            keep_alive_secs: 30,
            redirect_plain_to_tls: false,
            max_request_size: 16 * 1024 * 1024,
        }
    }
}

impl From<Server> for config::ValueKind {
    fn from(server: Server) -> Self {
        let mut properties = HashMap::new();
        properties.insert("host".to_string(), config::Value::from(server.host));
        properties.insert(
            "tls_port_base".to_string(),
            config::Value::from(i64::from(server.tls_port_base)),
        );
        properties.insert(
            "plain_port_base".to_string(),
            config::Value::from(i64::from(server.plain_port_base)),
        );
        properties.insert(
            "admin_port_base".to_string(),
            config::Value::from(i64::from(server.admin_port_base)),
        );
        properties.insert(
            "concurrency".to_string(),
            config::Value::from(server.concurrency as i64),
        );
        properties.insert(
            "request_timeout_secs".to_string(),
            config::Value::from(server.request_timeout_secs as i64),
        );
        properties.insert(
            "keep_alive_secs".to_string(),
            config::Value::from(server.keep_alive_secs as i64),
        );
        properties.insert(
            "redirect_plain_to_tls".to_string(),
            config::Value::from(server.redirect_plain_to_tls),
        );
        properties.insert(
            "max_request_size".to_string(),
            config::Value::from(server.max_request_size as i64),
        );

        Self::Table(properties)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Tls {
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,
    pub client_auth: bool,
    pub admin_tls: bool,
    pub server_name: String,
}

impl Default for Tls {
    fn default() -> Self {
        Self {
            cert_file: String::from("certs/server.crt"),
            key_file: String::from("certs/server.key"),
            ca_file: String::from("certs/ca.crt"),
            client_auth: false,
            admin_tls: true,
            server_name: String::from("localhost"),
        }
    }
}

impl From<Tls> for config::ValueKind {
    fn from(tls: Tls) -> Self {
        let mut properties = HashMap::new();
        properties.insert("cert_file".to_string(), config::Value::from(tls.cert_file));
        properties.insert("key_file".to_string(), config::Value::from(tls.key_file));
        properties.insert("ca_file".to_string(), config::Value::from(tls.ca_file));
        properties.insert(
            "client_auth".to_string(),
            config::Value::from(tls.client_auth),
        );
        properties.insert("admin_tls".to_string(), config::Value::from(tls.admin_tls));
        properties.insert(
            "server_name".to_string(),
            config::Value::from(tls.server_name),
        );

        Self::Table(properties)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Bridge {
    pub timeout_secs: u64,
    pub reconnect_ms: u64,
}

impl Default for Bridge {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            reconnect_ms: 1000,
        }
    }
}

impl From<Bridge> for config::ValueKind {
    fn from(bridge: Bridge) -> Self {
        let mut properties = HashMap::new();
        properties.insert(
            "timeout_secs".to_string(),
            config::Value::from(bridge.timeout_secs as i64),
        );
        properties.insert(
            "reconnect_ms".to_string(),
            config::Value::from(bridge.reconnect_ms as i64),
        );

        Self::Table(properties)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Log {
    pub level: u8,
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: 2,
            file: String::new(),
        }
    }
}

impl From<Log> for config::ValueKind {
    fn from(log: Log) -> Self {
        let mut properties = HashMap::new();
        properties.insert("level".to_string(), config::Value::from(i64::from(log.level)));
        properties.insert("file".to_string(), config::Value::from(log.file));

        Self::Table(properties)
    }
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct Settings {
    pub cluster: Cluster,
    pub server: Server,
    pub tls: Tls,
    pub bridge: Bridge,
    pub log: Log,
}

impl Settings {
    pub fn new(config_file: Option<&Path>) -> Result<Settings, ConfigError> {
        let mut builder = Config::builder()
            .set_default("cluster", Cluster::default())?
            .set_default("server", Server::default())?
            .set_default("tls", Tls::default())?
            .set_default("bridge", Bridge::default())?
            .set_default("log", Log::default())?;

        if let Some(f) = config_file {
            builder = builder.add_source(File::from(f).format(FileFormat::Ini));
        }

        let settings: Settings = builder.build()?.try_deserialize()?;

        settings.validate()?;

        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.cluster;

        if c.terminators == 0 {
            return Err(ConfigError::Message(
                "cluster.terminators must be at least 1".into(),
            ));
        }

        if u32::from(c.terminators) + u32::from(c.workers) > u32::from(c.capacity) {
            return Err(ConfigError::Message(format!(
                "cluster.terminators + cluster.workers ({}) exceeds cluster.capacity ({})",
                u32::from(c.terminators) + u32::from(c.workers),
                c.capacity
            )));
        }

        if c.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Message(
                "cluster.heartbeat_interval_ms must be greater than 0".into(),
            ));
        }

        // member ids run from 0 to capacity - 1
        let last_id = u32::from(c.capacity.saturating_sub(1));

        for (name, base) in [
            ("server.tls_port_base", self.server.tls_port_base),
            ("server.plain_port_base", self.server.plain_port_base),
            ("server.admin_port_base", self.server.admin_port_base),
        ] {
            if u32::from(base) + last_id > u32::from(u16::MAX) {
                return Err(ConfigError::Message(format!(
                    "{} ({}) leaves no room for {} members",
                    name, base, c.capacity
                )));
            }
        }

        if self.server.concurrency == 0 {
            return Err(ConfigError::Message(
                "server.concurrency must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge.timeout_secs)
    }

    pub fn tls_port(&self, id: u16) -> u16 {
        self.server.tls_port_base.saturating_add(id)
    }

    pub fn plain_port(&self, id: u16) -> u16 {
        self.server.plain_port_base.saturating_add(id)
    }

    pub fn admin_port(&self, id: u16) -> u16 {
        self.server.admin_port_base.saturating_add(id)
    }
}

pub fn get_config_file(
    work_dir: &Path,
    arg_config: Option<PathBuf>,
) -> Result<Option<PathBuf>, Box<dyn Error>> {
    if let Some(f) = arg_config {
        if !f.is_file() {
            return Err(format!("failed to open {}", f.display()).into());
        }

        return Ok(Some(f));
    }

    let candidates = [
        work_dir.join("config").join("relaygate.conf"),
        work_dir.join("relaygate.conf"),
    ];

    Ok(candidates.into_iter().find(|f| f.is_file()))
}
