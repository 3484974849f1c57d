// Copyright 2026 The nsmdp Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use nsmdp_config::device_plugin::DevicePluginConfig;
use nsmdp_error::{Error, ResultExt};
use nsmdp_service::device_plugin_server::DevicePluginService;
use nsmdp_service::lifecycle::{
    LifecycleController, forward_signals, watch_registration_socket,
};
use nsmdp_service::metrics::DevicePluginMetrics;
use nsmdp_util::fs_util::create_dir_all;
use nsmdp_util::init_tracing;
use tokio::sync::mpsc;
use tracing::{Instrument, Level, event, trace_span};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Kubelet device plugin that hands out Network Service Mesh sockets.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// JSON5 config file to use. Built-in defaults apply when omitted.
    #[clap(long, value_parser)]
    config_file: Option<PathBuf>,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the device plugin. This is the default.
    Run,
    /// Print the effective settings as `NSM_<KEY>="<value>"` lines.
    Env,
}

fn get_config(config_file: Option<&Path>) -> Result<DevicePluginConfig, Error> {
    let Some(config_file) = config_file else {
        let config = DevicePluginConfig::default();
        config
            .validate()
            .err_tip(|| "Invalid default configuration")?;
        return Ok(config);
    };
    let json_contents = std::fs::read_to_string(config_file)
        .err_tip(|| format!("Could not open config file {}", config_file.display()))?;
    DevicePluginConfig::from_json5(&json_contents)
        .err_tip(|| format!("Invalid config file {}", config_file.display()))
}

fn print_env(config: &DevicePluginConfig) -> Result<(), Error> {
    let mut stdout = io::stdout().lock();
    for (key, value) in config.env_vars() {
        writeln!(stdout, "{key}=\"{value}\"")?;
    }
    Ok(())
}

async fn inner_main(config: DevicePluginConfig) -> Result<(), Error> {
    event!(Level::INFO, name = %config.name, ?config, "Starting device plugin");

    let metrics = Arc::new(DevicePluginMetrics::default());
    let service = DevicePluginService::new(&config, metrics);
    let server_dir = service.layout().host_server_dir();
    create_dir_all(Path::new(&server_dir))
        .await
        .err_tip(|| "Could not create the shared server directory")?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let _signals = forward_signals(events_tx.clone())?;
    let _watcher = watch_registration_socket(
        Path::new(&config.plugin_dir),
        Path::new(&config.registration_socket),
        events_tx,
    )?;

    LifecycleController::new(&config, service)
        .run(events_rx)
        .await
}

fn main() -> Result<(), Box<dyn core::error::Error>> {
    let args = Args::parse();
    let config = get_config(args.config_file.as_deref())?;

    if args.command == Some(Command::Env) {
        print_env(&config)?;
        return Ok(());
    }

    init_tracing()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime
        .block_on(inner_main(config).instrument(trace_span!("main")))
        .err_tip(|| "main() function failed")?;
    Ok(())
}
