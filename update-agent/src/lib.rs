// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-device update agent.
//!
//! The agent drives atomic updates of a device's independently updatable
//! components: a controller submits an update set, and the coordinator takes
//! each component through prepare, update, and apply (or revert), surviving
//! the reboots those phases demand. See [`coordinator::UpdateCoordinator`]
//! for the state machine at the center of it.

pub mod config;
pub mod context;
pub mod coordinator;
pub mod errors;
mod http_entrypoints;
pub mod images;
pub mod module;
pub mod platform;
mod reboot;
pub mod registry;
mod scheduler;
pub mod sim;
pub mod status;
pub mod store;

use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use dropshot::{ConfigDropshot, HandlerTaskMode, HttpServer};
use slog::{info, o, Logger};

pub use config::Config;
use context::ServerContext;
use coordinator::UpdateCoordinator;
use platform::Platform;
use registry::{ModuleFactories, ModuleRegistry};
use store::{SchemaMismatchPolicy, StateStore};

/// A running update agent: the coordinator plus its control API server.
pub struct Server {
    pub coordinator: Arc<UpdateCoordinator>,
    pub http_server: HttpServer<ServerContext>,
}

impl Server {
    /// Builds the store, registry, and coordinator from `config` and starts
    /// the control API.
    pub async fn start(
        log: &Logger,
        config: Config,
        factories: ModuleFactories,
        platform: Arc<dyn Platform>,
        schema_policy: SchemaMismatchPolicy,
    ) -> anyhow::Result<Server> {
        let store = StateStore::open(log, &config.database_path, schema_policy)
            .context("opening state store")?;

        let registry =
            ModuleRegistry::new(log, &store, &config.components, &factories)
                .context("constructing module registry")?;
        info!(log, "registered modules"; "count" => registry.len());

        let coordinator = Arc::new(
            UpdateCoordinator::new(
                log,
                store,
                registry,
                platform,
                config.download_dir.clone(),
            )
            .await
            .context("constructing update coordinator")?,
        );

        let dropshot_config = ConfigDropshot {
            bind_address: config.listen_address,
            default_handler_task_mode: HandlerTaskMode::Detached,
            ..Default::default()
        };

        let http_server = dropshot::ServerBuilder::new(
            http_entrypoints::api(),
            ServerContext {
                coordinator: Arc::clone(&coordinator),
                log: log.new(o!("component" => "dropshot")),
            },
            log.new(o!("component" => "dropshot")),
        )
        .config(dropshot_config)
        .start()
        .map_err(|err| anyhow!(err).context("initializing http server"))?;

        info!(
            log, "update agent listening";
            "address" => %http_server.local_addr(),
        );

        Ok(Server { coordinator, http_server })
    }

    /// Waits for the HTTP server to exit.
    pub async fn wait_for_finish(self) -> Result<(), String> {
        self.http_server.await
    }
}
