// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The contract every update module implements.

use async_trait::async_trait;
use camino::Utf8Path;
use slog::Logger;

use crate::errors::Error;
use crate::store::StateStore;

/// One updatable component's module.
///
/// The coordinator serializes calls per module, so implementations never see
/// two operations in flight at once. `update`, `apply`, and `revert` may be
/// re-invoked after a reboot from the same logical state and must keep making
/// progress (or report that none is left by returning `false`).
#[async_trait]
pub trait UpdateModule: Send {
    /// Reconciles on-disk state. Called once per process lifetime before any
    /// other operation, including after reboots; must be idempotent.
    async fn init(&mut self) -> anyhow::Result<()>;

    /// The vendor version currently running on the device.
    async fn vendor_version(&mut self) -> anyhow::Result<String>;

    /// Stages `image_path`. Must be reversible until `update` is called.
    async fn prepare(
        &mut self,
        image_path: &Utf8Path,
        vendor_version: &str,
        annotations: &serde_json::Value,
    ) -> anyhow::Result<()>;

    /// Performs the committing part of the update. Returns `true` if a
    /// platform reboot is needed before the next call can make progress.
    async fn update(&mut self) -> anyhow::Result<bool>;

    /// Makes the updated state permanent, discarding the fallback. Same
    /// reboot-loop semantics as [`UpdateModule::update`].
    async fn apply(&mut self) -> anyhow::Result<bool>;

    /// Discards prepared or updated state, restoring pre-`prepare` behavior.
    async fn revert(&mut self) -> anyhow::Result<bool>;

    /// Invoked between reboot-required iterations. A module with its own
    /// reboot path may initiate it here (and never return); otherwise it
    /// records what it needs and returns, deferring to the platform reboot.
    async fn reboot(&mut self) -> anyhow::Result<()>;

    /// Releases resources. The module is not used again afterwards.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Everything a module factory gets to work with.
pub struct ModuleContext {
    /// The component id this module services.
    pub id: String,
    pub log: Logger,
    /// Opaque parameters from the component's config entry.
    pub params: serde_json::Value,
    /// The module's slice of persistent storage.
    pub state: ModuleStateHandle,
}

/// A module's namespaced slot in the state store.
///
/// The blob is opaque to the agent; modules own its format entirely.
#[derive(Clone)]
pub struct ModuleStateHandle {
    store: StateStore,
    id: String,
}

impl ModuleStateHandle {
    pub(crate) fn new(store: StateStore, id: String) -> Self {
        Self { store, id }
    }

    pub fn load(&self) -> Result<Option<Vec<u8>>, Error> {
        self.store.module_state(&self.id)
    }

    pub fn save(&self, blob: &[u8]) -> Result<(), Error> {
        self.store.set_module_state(&self.id, blob)
    }
}
