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

use clap::Parser;
use log::{error, info};
use relaygate::app::Launch;
use relaygate::core::config::{get_config_file, Settings};
use relaygate::core::log::{
    ensure_init_simple_logger, get_simple_logger, level_filter, local_offset_check, open_log_file,
};
use std::env;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser, Debug)]
#[command(
    name = "relaygate",
    version,
    about = "Clustered TLS-terminating HTTP front end with a worker bridge"
)]
struct CliArgs {
    /// Cluster member id of this process
    #[arg(value_name = "ID")]
    id: u16,

    /// Config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (0 = error .. 4 = trace)
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u8).range(0..=4))]
    log_level: Option<u8>,
}

fn process_args_and_run(args: CliArgs) -> Result<(), Box<dyn Error>> {
    let config_file = get_config_file(&env::current_dir()?, args.config)?;
    let settings = Settings::new(config_file.as_deref())?;

    let log_file = if settings.log.file.is_empty() {
        None
    } else {
        match open_log_file(Path::new(&settings.log.file)) {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("unable to open log file: {}. logging to standard out.", e);
                None
            }
        }
    };

    ensure_init_simple_logger(log_file, Some(args.id));
    log::set_logger(get_simple_logger()).map_err(|e| e.to_string())?;

    let level = args.log_level.unwrap_or(settings.log.level);
    log::set_max_level(level_filter(level));

    local_offset_check();

    match &config_file {
        Some(f) => info!("using config: {}", f.display()),
        None => info!("no config file, using defaults"),
    }

    let launch = Launch {
        config_file,
        log_level: args.log_level,
        handler: None,
    };

    if let Err(e) = relaygate::run(args.id, &settings, launch) {
        error!("{}", e);

        return Err(e);
    }

    Ok(())
}

fn main() {
    let args = CliArgs::parse();

    if let Err(e) = process_args_and_run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
