// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated module and platform implementations.
//!
//! `SimModule` honors the full module contract in memory, persisting its
//! lifecycle phase through its module-state blob so it survives simulated
//! restarts. Behavior (reboot counts, failure injection) is scriptable via
//! module params, which also makes it usable as the `sim` plugin for
//! bring-up on hardware that has no real modules yet.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use camino::Utf8Path;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use slog::debug;
use tokio::sync::Notify;

use crate::errors::Error;
use crate::module::{ModuleContext, UpdateModule};
use crate::platform::Platform;
use crate::registry::ModuleFactory;

/// Scripted behavior of a [`SimModule`], deserializable from module params.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SimBehavior {
    /// The vendor version the module starts out running.
    pub vendor_version: String,
    /// How many times `update` demands a reboot before completing.
    pub update_reboots: u32,
    /// How many times `apply` demands a reboot before completing.
    pub apply_reboots: u32,
    pub fail_init: bool,
    pub fail_prepare: bool,
    pub fail_update: bool,
    pub fail_apply: bool,
    pub fail_revert: bool,
    /// When set, `vendor_version` always reports this value regardless of
    /// lifecycle state (a module that does not actually change version).
    pub report_vendor: Option<String>,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            vendor_version: "1.0".to_string(),
            update_reboots: 0,
            apply_reboots: 0,
            fail_init: false,
            fail_prepare: false,
            fail_update: false,
            fail_apply: false,
            fail_revert: false,
            report_vendor: None,
        }
    }
}

/// Invocation counters, shared with tests across module rebuilds.
#[derive(Debug, Default)]
pub struct SimCounters {
    pub init: AtomicUsize,
    pub prepare: AtomicUsize,
    pub update: AtomicUsize,
    pub apply: AtomicUsize,
    pub revert: AtomicUsize,
    pub reboot: AtomicUsize,
    pub close: AtomicUsize,
}

/// Called at the start of every `update`, with the component id. Lets tests
/// rendezvous concurrent group members.
pub type UpdateHook =
    Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// The lifecycle state a `SimModule` persists through its state blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct PersistedSim {
    committed_vendor: String,
    staged_vendor: Option<String>,
    staged_image: Option<String>,
    updated: bool,
    update_reboots_left: Option<u32>,
    apply_reboots_left: Option<u32>,
}

pub struct SimModule {
    ctx: ModuleContext,
    behavior: SimBehavior,
    counters: Arc<SimCounters>,
    update_hook: Option<UpdateHook>,
    state: PersistedSim,
}

impl SimModule {
    pub fn new(ctx: ModuleContext, behavior: SimBehavior) -> Self {
        let state = PersistedSim {
            committed_vendor: behavior.vendor_version.clone(),
            staged_vendor: None,
            staged_image: None,
            updated: false,
            update_reboots_left: None,
            apply_reboots_left: None,
        };
        Self {
            ctx,
            behavior,
            counters: Arc::new(SimCounters::default()),
            update_hook: None,
            state,
        }
    }

    pub fn with_counters(mut self, counters: Arc<SimCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn with_update_hook(mut self, hook: UpdateHook) -> Self {
        self.update_hook = Some(hook);
        self
    }

    fn persist(&self) -> anyhow::Result<()> {
        let blob = serde_json::to_vec(&self.state)?;
        self.ctx.state.save(&blob).context("saving sim module state")?;
        Ok(())
    }
}

#[async_trait]
impl UpdateModule for SimModule {
    async fn init(&mut self) -> anyhow::Result<()> {
        self.counters.init.fetch_add(1, Ordering::SeqCst);
        if self.behavior.fail_init {
            bail!("injected init failure");
        }
        if let Some(blob) =
            self.ctx.state.load().context("loading sim module state")?
        {
            self.state = serde_json::from_slice(&blob)
                .context("decoding sim module state")?;
            debug!(self.ctx.log, "restored persisted state");
        }
        Ok(())
    }

    async fn vendor_version(&mut self) -> anyhow::Result<String> {
        if let Some(version) = &self.behavior.report_vendor {
            return Ok(version.clone());
        }
        if self.state.updated {
            if let Some(staged) = &self.state.staged_vendor {
                return Ok(staged.clone());
            }
        }
        Ok(self.state.committed_vendor.clone())
    }

    async fn prepare(
        &mut self,
        image_path: &Utf8Path,
        vendor_version: &str,
        _annotations: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.counters.prepare.fetch_add(1, Ordering::SeqCst);
        if self.behavior.fail_prepare {
            bail!("injected prepare failure");
        }
        if !image_path.exists() {
            bail!("image {image_path} does not exist");
        }
        self.state.staged_vendor = Some(vendor_version.to_string());
        self.state.staged_image = Some(image_path.to_string());
        self.persist()?;
        Ok(())
    }

    async fn update(&mut self) -> anyhow::Result<bool> {
        self.counters.update.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.update_hook.clone() {
            hook(self.ctx.id.clone()).await;
        }
        if self.behavior.fail_update {
            bail!("injected update failure");
        }

        let left = self
            .state
            .update_reboots_left
            .get_or_insert(self.behavior.update_reboots);
        if *left > 0 {
            *left -= 1;
            self.persist()?;
            return Ok(true);
        }

        self.state.updated = true;
        self.persist()?;
        Ok(false)
    }

    async fn apply(&mut self) -> anyhow::Result<bool> {
        self.counters.apply.fetch_add(1, Ordering::SeqCst);
        if self.behavior.fail_apply {
            bail!("injected apply failure");
        }

        let left = self
            .state
            .apply_reboots_left
            .get_or_insert(self.behavior.apply_reboots);
        if *left > 0 {
            *left -= 1;
            self.persist()?;
            return Ok(true);
        }

        if let Some(staged) = self.state.staged_vendor.take() {
            self.state.committed_vendor = staged;
        }
        self.state.staged_image = None;
        self.state.updated = false;
        self.state.update_reboots_left = None;
        self.state.apply_reboots_left = None;
        self.persist()?;
        Ok(false)
    }

    async fn revert(&mut self) -> anyhow::Result<bool> {
        self.counters.revert.fetch_add(1, Ordering::SeqCst);
        if self.behavior.fail_revert {
            bail!("injected revert failure");
        }

        self.state.staged_vendor = None;
        self.state.staged_image = None;
        self.state.updated = false;
        self.state.update_reboots_left = None;
        self.state.apply_reboots_left = None;
        self.persist()?;
        Ok(false)
    }

    async fn reboot(&mut self) -> anyhow::Result<()> {
        self.counters.reboot.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.counters.close.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The factory registered under plugin name `"sim"`; behavior comes from the
/// component's `params`.
pub fn factory() -> ModuleFactory {
    Box::new(|ctx: ModuleContext| {
        let behavior = if ctx.params.is_null() {
            SimBehavior::default()
        } else {
            serde_json::from_value(ctx.params.clone())
                .context("parsing sim module params")?
        };
        Ok(Box::new(SimModule::new(ctx, behavior)) as Box<dyn UpdateModule>)
    })
}

/// A platform that records reboot requests instead of performing them.
pub struct SimPlatform {
    reboots: AtomicUsize,
    reboot_requested: Arc<Notify>,
    /// When set, `system_reboot` never returns, imitating real hardware
    /// going down.
    park_on_reboot: bool,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            reboots: AtomicUsize::new(0),
            reboot_requested: Arc::new(Notify::new()),
            park_on_reboot: false,
        }
    }

    /// A platform whose `system_reboot` signals `reboot_requested` and then
    /// never returns.
    pub fn parking() -> Self {
        Self { park_on_reboot: true, ..Self::new() }
    }

    pub fn reboot_count(&self) -> usize {
        self.reboots.load(Ordering::SeqCst)
    }

    /// Notified every time `system_reboot` is invoked.
    pub fn reboot_requested(&self) -> Arc<Notify> {
        Arc::clone(&self.reboot_requested)
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for SimPlatform {
    fn platform_id(&self) -> Result<String, Error> {
        Ok("sim-platform".to_string())
    }

    async fn system_reboot(&self) -> Result<(), Error> {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        self.reboot_requested.notify_one();
        if self.park_on_reboot {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}
