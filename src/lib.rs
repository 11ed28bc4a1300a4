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

pub mod admin;
pub mod app;
pub mod balancer;
pub mod bridge;
pub mod cluster;
pub mod connection;
pub mod core;
pub mod handler;
pub mod http;
pub mod server;
pub mod tls;

use crate::core::config::Settings;
use app::{App, Launch};
use log::info;
use std::error::Error;

pub fn run(id: u16, settings: &Settings, launch: Launch) -> Result<(), Box<dyn Error>> {
    info!("starting...");

    {
        let a = App::new(id, settings, launch)?;

        info!("started");

        a.wait_for_term()?;

        info!("stopping...");
    }

    info!("stopped");

    Ok(())
}
