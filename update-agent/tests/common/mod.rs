// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared harness for coordinator integration tests: a tempdir-backed store,
//! sim modules wired through real factories, and a sim platform.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use sha2::Digest;
use slog::{o, Logger};
use update_agent::config::ComponentConfig;
use update_agent::coordinator::UpdateCoordinator;
use update_agent::module::UpdateModule;
use update_agent::platform::Platform;
use update_agent::registry::{ModuleFactories, ModuleRegistry};
use update_agent::sim::{
    SimBehavior, SimCounters, SimModule, SimPlatform, UpdateHook,
};
use update_agent::store::{SchemaMismatchPolicy, StateStore};
use update_agent_common::ComponentUpdateRequest;

pub fn test_log() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// One simulated component: its scripted behavior plus shared counters that
/// survive coordinator rebuilds.
pub struct SimComponent {
    pub id: String,
    pub behavior: SimBehavior,
    pub counters: Arc<SimCounters>,
    pub update_priority: u32,
    pub reboot_priority: u32,
    pub update_hook: Option<UpdateHook>,
}

impl SimComponent {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            behavior: SimBehavior::default(),
            counters: Arc::new(SimCounters::default()),
            update_priority: 10,
            reboot_priority: 0,
            update_hook: None,
        }
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub platform: Arc<SimPlatform>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_platform(SimPlatform::new())
    }

    pub fn with_platform(platform: SimPlatform) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            platform: Arc::new(platform),
        }
    }

    pub fn download_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::try_from(self.dir.path().join("download")).unwrap()
    }

    pub fn store(&self) -> StateStore {
        let path =
            Utf8PathBuf::try_from(self.dir.path().join("agent.db")).unwrap();
        StateStore::open(&test_log(), &path, SchemaMismatchPolicy::Fail)
            .unwrap()
    }

    /// Builds a coordinator over this harness's store; components map to sim
    /// modules through per-component factories. May be called again after a
    /// shutdown to simulate a process restart.
    pub async fn coordinator(
        &self,
        components: &[SimComponent],
    ) -> UpdateCoordinator {
        let log = test_log();
        let store = self.store();

        let mut factories = ModuleFactories::new();
        let mut configs = Vec::new();
        for component in components {
            let behavior = component.behavior.clone();
            let counters = Arc::clone(&component.counters);
            let hook = component.update_hook.clone();
            factories.register(
                component.id.clone(),
                Box::new(move |ctx| {
                    let mut module = SimModule::new(ctx, behavior.clone())
                        .with_counters(Arc::clone(&counters));
                    if let Some(hook) = hook.clone() {
                        module = module.with_update_hook(hook);
                    }
                    Ok(Box::new(module) as Box<dyn UpdateModule>)
                }),
            );
            configs.push(ComponentConfig {
                id: component.id.clone(),
                plugin: component.id.clone(),
                update_priority: component.update_priority,
                reboot_priority: component.reboot_priority,
                disabled: false,
                params: serde_json::Value::Null,
            });
        }

        let registry =
            ModuleRegistry::new(&log, &store, &configs, &factories).unwrap();
        let platform: Arc<dyn Platform> =
            Arc::clone(&self.platform) as Arc<dyn Platform>;

        UpdateCoordinator::new(
            &log,
            store,
            registry,
            platform,
            self.download_dir(),
        )
        .await
        .unwrap()
    }

    /// Writes an image file under the harness dir and returns a request
    /// describing it accurately.
    pub fn image_request(
        &self,
        id: &str,
        vendor_version: &str,
        aos_version: u64,
    ) -> ComponentUpdateRequest {
        let images = self.dir.path().join("images");
        std::fs::create_dir_all(&images).unwrap();
        let path = Utf8PathBuf::try_from(images.join(format!("{id}.img")))
            .unwrap();
        let contents = format!("image for {id} at {vendor_version}");
        std::fs::write(&path, &contents).unwrap();

        request_for_file(&path, id, vendor_version, aos_version)
    }
}

pub fn request_for_file(
    path: &Utf8Path,
    id: &str,
    vendor_version: &str,
    aos_version: u64,
) -> ComponentUpdateRequest {
    let contents = std::fs::read(path).unwrap();
    ComponentUpdateRequest {
        id: id.to_string(),
        vendor_version: vendor_version.to_string(),
        aos_version,
        url: format!("file://{path}"),
        size: contents.len() as u64,
        sha256: hex::encode(sha2::Sha256::digest(&contents)),
        sha512: hex::encode(sha2::Sha512::digest(&contents)),
        annotations: serde_json::Value::Null,
    }
}
