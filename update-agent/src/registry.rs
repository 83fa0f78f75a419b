// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Construction and lookup of the enabled module set.

use std::collections::BTreeMap;
use std::sync::Arc;

use slog::{info, o, Logger};
use tokio::sync::Mutex;

use crate::config::ComponentConfig;
use crate::errors::Error;
use crate::module::{ModuleContext, ModuleStateHandle, UpdateModule};
use crate::store::StateStore;

/// Builds a module for one component. Factories are registered explicitly by
/// the embedding binary; there is no implicit registration at load time.
pub type ModuleFactory = Box<
    dyn Fn(ModuleContext) -> anyhow::Result<Box<dyn UpdateModule>>
        + Send
        + Sync,
>;

/// The table of compiled-in module factories, keyed by plugin name.
#[derive(Default)]
pub struct ModuleFactories {
    factories: BTreeMap<String, ModuleFactory>,
}

impl ModuleFactories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        plugin: impl Into<String>,
        factory: ModuleFactory,
    ) {
        self.factories.insert(plugin.into(), factory);
    }

    fn get(&self, plugin: &str) -> Option<&ModuleFactory> {
        self.factories.get(plugin)
    }
}

pub(crate) struct ModuleEntry {
    /// Serializes coordinator-initiated calls: at most one operation per
    /// module is in flight at any time.
    pub module: Arc<Mutex<Box<dyn UpdateModule>>>,
    pub update_priority: u32,
    pub reboot_priority: u32,
}

impl std::fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("update_priority", &self.update_priority)
            .field("reboot_priority", &self.reboot_priority)
            .finish_non_exhaustive()
    }
}

/// The set of enabled modules, keyed by component id.
pub struct ModuleRegistry {
    entries: BTreeMap<String, ModuleEntry>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModuleRegistry {
    /// Instantiates a module for every enabled component in `components`.
    pub fn new(
        log: &Logger,
        store: &StateStore,
        components: &[ComponentConfig],
        factories: &ModuleFactories,
    ) -> Result<Self, Error> {
        let mut entries = BTreeMap::new();

        for component in components {
            if component.disabled {
                info!(
                    log, "skipping disabled component";
                    "id" => &component.id,
                );
                continue;
            }

            let factory = factories
                .get(&component.plugin)
                .ok_or_else(|| Error::UnknownPlugin(component.plugin.clone()))?;

            let context = ModuleContext {
                id: component.id.clone(),
                log: log.new(o!(
                    "component" => "module",
                    "id" => component.id.clone(),
                )),
                params: component.params.clone(),
                state: ModuleStateHandle::new(
                    store.clone(),
                    component.id.clone(),
                ),
            };

            let module = factory(context)
                .map_err(|err| Error::module(&component.id, err))?;

            entries.insert(
                component.id.clone(),
                ModuleEntry {
                    module: Arc::new(Mutex::new(module)),
                    update_priority: component.update_priority,
                    reboot_priority: component.reboot_priority,
                },
            );
        }

        Ok(Self { entries })
    }

    pub(crate) fn get(&self, id: &str) -> Result<&ModuleEntry, Error> {
        self.entries
            .get(id)
            .ok_or_else(|| Error::UnknownComponent(id.to_string()))
    }

    pub(crate) fn module(
        &self,
        id: &str,
    ) -> Result<Arc<Mutex<Box<dyn UpdateModule>>>, Error> {
        Ok(Arc::clone(&self.get(id)?.module))
    }

    /// Component ids of every enabled module, in stable order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub(crate) fn iter(
        &self,
    ) -> impl Iterator<Item = (&str, &ModuleEntry)> {
        self.entries.iter().map(|(id, entry)| (id.as_str(), entry))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{self, SimBehavior, SimModule};
    use camino::Utf8PathBuf;
    use slog::Logger;

    fn test_log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn test_store(dir: &tempfile::TempDir) -> StateStore {
        let path = Utf8PathBuf::try_from(dir.path().join("test.db")).unwrap();
        StateStore::open(
            &test_log(),
            &path,
            crate::store::SchemaMismatchPolicy::Fail,
        )
        .unwrap()
    }

    fn component(id: &str, plugin: &str, disabled: bool) -> ComponentConfig {
        ComponentConfig {
            id: id.to_string(),
            plugin: plugin.to_string(),
            update_priority: 0,
            reboot_priority: 0,
            disabled,
            params: serde_json::Value::Null,
        }
    }

    #[test]
    fn disabled_components_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);

        let mut factories = ModuleFactories::new();
        factories.register("sim", sim::factory());

        let components = vec![
            component("rootfs", "sim", false),
            component("bootloader", "sim", true),
        ];
        let registry =
            ModuleRegistry::new(&test_log(), &store, &components, &factories)
                .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.get("rootfs").is_ok());
        assert!(matches!(
            registry.get("bootloader").unwrap_err(),
            Error::UnknownComponent(_)
        ));
    }

    #[test]
    fn unknown_plugin_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);

        let factories = ModuleFactories::new();
        let components = vec![component("rootfs", "missing", false)];
        let err =
            ModuleRegistry::new(&test_log(), &store, &components, &factories)
                .unwrap_err();
        assert!(matches!(err, Error::UnknownPlugin(name) if name == "missing"));
    }

    #[test]
    fn params_reach_the_factory() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);

        let mut factories = ModuleFactories::new();
        factories.register(
            "sim",
            Box::new(|ctx: ModuleContext| {
                let behavior: SimBehavior =
                    serde_json::from_value(ctx.params.clone())?;
                assert_eq!(behavior.vendor_version, "3.1");
                Ok(Box::new(SimModule::new(ctx, behavior))
                    as Box<dyn UpdateModule>)
            }),
        );

        let mut config = component("rootfs", "sim", false);
        config.params = serde_json::json!({ "vendor_version": "3.1" });
        ModuleRegistry::new(&test_log(), &store, &[config], &factories)
            .unwrap();
    }
}
