// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The update agent daemon.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use slog::{info, Drain};
use update_agent::platform::HostPlatform;
use update_agent::registry::ModuleFactories;
use update_agent::sim;
use update_agent::store::SchemaMismatchPolicy;
use update_agent::{Config, Server};

#[derive(Debug, Parser)]
#[command(version, about = "on-device update agent")]
struct Args {
    /// Path of the agent's TOML config file.
    #[clap(long)]
    config: Utf8PathBuf,

    /// Wipe and reinitialize the state store if its schema version does not
    /// match this binary, instead of refusing to start.
    #[clap(long)]
    wipe_on_schema_mismatch: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log = setup_log();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading config from {}", args.config))?;

    let schema_policy = if args.wipe_on_schema_mismatch {
        SchemaMismatchPolicy::WipeAndReinit
    } else {
        SchemaMismatchPolicy::Fail
    };

    let factories = builtin_factories();
    let platform = Arc::new(HostPlatform::new(&log));

    let server =
        Server::start(&log, config, factories, platform, schema_policy)
            .await?;

    wait_for_shutdown_signal().await?;
    info!(log, "shutting down");
    server.coordinator.shutdown().await;

    Ok(())
}

/// The module plugins compiled into this binary.
///
/// Production module implementations live out of tree and register here in
/// their embedding binary; the stock daemon only ships the simulated one.
fn builtin_factories() -> ModuleFactories {
    let mut factories = ModuleFactories::new();
    factories.register("sim", sim::factory());
    factories
}

fn setup_log() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt())
        .context("registering SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }

    Ok(())
}
