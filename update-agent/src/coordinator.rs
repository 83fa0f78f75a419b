// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The update coordinator: the state machine driving component updates.
//!
//! The coordinator accepts controller events (`prepare`, `update`, `apply`,
//! `revert`), runs each transition on a background task, and persists its
//! state so an interrupted transition can be retried after a crash or a
//! planned reboot. Only the settled states `Idle`, `Prepared`, `Updated`, and
//! `Failed` are ever written to the store; while a transition executes, the
//! store keeps holding the source state, so a restart always resumes from a
//! well-defined point.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use slog::{error, info, o, warn, Logger};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use update_agent_common::{
    ComponentState, ComponentStatus, ComponentUpdateRequest, StatusSnapshot,
    UpdateState,
};

use crate::errors::Error;
use crate::images;
use crate::module::UpdateModule;
use crate::platform::Platform;
use crate::reboot;
use crate::registry::ModuleRegistry;
use crate::scheduler::{run_groups, GroupRunOutcome, PriorityTask};
use crate::status::StatusReporter;
use crate::store::StateStore;

/// The coordinator state persisted as a single blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct PersistentState {
    update_state: UpdateState,
    /// Global error of the last transition; empty on success.
    error: String,
    /// The in-flight update set, keyed by component id.
    component_statuses: BTreeMap<String, ComponentStatus>,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            update_state: UpdateState::Idle,
            error: String::new(),
            component_statuses: BTreeMap::new(),
        }
    }
}

struct CoordState {
    persistent: PersistentState,
    /// Vendor versions as last reported by the modules themselves; used to
    /// synthesize status entries for components with no in-flight state.
    vendor_versions: BTreeMap<String, String>,
    /// Set while a transition task is executing; no event is accepted until
    /// the transition settles.
    transition_running: bool,
    transition: Option<JoinHandle<()>>,
}

pub struct UpdateCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    log: Logger,
    store: StateStore,
    registry: ModuleRegistry,
    platform: Arc<dyn Platform>,
    download_dir: Utf8PathBuf,
    reporter: StatusReporter,
    state: Mutex<CoordState>,
}

impl UpdateCoordinator {
    /// Builds the coordinator: initializes every module, reloads persisted
    /// state, and publishes the initial status snapshot.
    ///
    /// Module `init` failures are logged and mark the component `Error`; they
    /// do not prevent the coordinator from starting.
    pub async fn new(
        log: &Logger,
        store: StateStore,
        registry: ModuleRegistry,
        platform: Arc<dyn Platform>,
        download_dir: Utf8PathBuf,
    ) -> Result<UpdateCoordinator, Error> {
        let log = log.new(o!("component" => "UpdateCoordinator"));

        let persistent = load_persistent(&store)?;
        let startup_state = persistent.update_state;
        info!(
            log, "loaded coordinator state";
            "state" => %startup_state,
            "components" => persistent.component_statuses.len(),
        );

        let inner = Arc::new(Inner {
            reporter: StatusReporter::new(&log),
            log,
            store,
            registry,
            platform,
            download_dir,
            state: Mutex::new(CoordState {
                persistent,
                vendor_versions: BTreeMap::new(),
                transition_running: false,
                transition: None,
            }),
        });

        // Staged images must survive a restart mid-update; anything else in
        // the download dir is garbage.
        if startup_state == UpdateState::Idle {
            inner.reset_download_dir().await;
        } else if let Err(err) =
            tokio::fs::create_dir_all(&inner.download_dir).await
        {
            error!(
                inner.log, "can't create download dir";
                "path" => inner.download_dir.as_str(),
                "error" => %err,
            );
        }

        inner.init_modules().await;
        inner.refresh_vendor_cache().await;

        match inner.platform.platform_id() {
            Ok(id) => {
                let system_version =
                    inner.store.system_version().unwrap_or(0);
                info!(
                    inner.log, "update agent initialized";
                    "platform_id" => id,
                    "system_version" => system_version,
                );
            }
            Err(err) => {
                warn!(inner.log, "can't read platform id"; "error" => %err);
            }
        }

        {
            let state = inner.state.lock().await;
            let snapshot = inner.snapshot_locked(&state);
            inner.reporter.publish(snapshot);
        }

        Ok(UpdateCoordinator { inner })
    }

    /// Stages the requested update set: `Idle -> Prepared`.
    ///
    /// Returns as soon as the transition has been admitted; completion is
    /// observable through the status stream.
    pub async fn prepare(
        &self,
        items: Vec<ComponentUpdateRequest>,
    ) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        self.inner.check_event(&state, "prepare", &[UpdateState::Idle])?;

        info!(
            self.inner.log, "prepare requested";
            "components" => items.len(),
        );

        // A new update set replaces whatever the previous one left behind,
        // including preserved Error entries.
        state.persistent.component_statuses = items
            .iter()
            .map(|item| {
                (
                    item.id.clone(),
                    ComponentStatus {
                        id: item.id.clone(),
                        vendor_version: item.vendor_version.clone(),
                        aos_version: item.aos_version,
                        status: ComponentState::Installing,
                        error: String::new(),
                    },
                )
            })
            .collect();

        let inner = Arc::clone(&self.inner);
        spawn_transition(&mut state, async move {
            inner.run_prepare(items).await;
        });
        Ok(())
    }

    /// Runs the update phase over the prepared set: `Prepared -> Updated`.
    pub async fn update(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        self.inner.check_event(&state, "update", &[UpdateState::Prepared])?;

        info!(self.inner.log, "update requested");

        let inner = Arc::clone(&self.inner);
        spawn_transition(&mut state, async move {
            inner.run_update().await;
        });
        Ok(())
    }

    /// Commits the updated set: `Updated -> Idle`, best effort.
    pub async fn apply(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        self.inner.check_event(&state, "apply", &[UpdateState::Updated])?;

        info!(self.inner.log, "apply requested");

        let inner = Arc::clone(&self.inner);
        spawn_transition(&mut state, async move {
            inner.run_apply().await;
        });
        Ok(())
    }

    /// Discards prepared or updated state: `{Prepared, Updated, Failed} ->
    /// Idle`, best effort.
    pub async fn revert(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        self.inner.check_event(
            &state,
            "revert",
            &[UpdateState::Prepared, UpdateState::Updated, UpdateState::Failed],
        )?;

        info!(self.inner.log, "revert requested");

        let inner = Arc::clone(&self.inner);
        spawn_transition(&mut state, async move {
            inner.run_revert().await;
        });
        Ok(())
    }

    /// The current aggregated status.
    pub async fn status(&self) -> StatusSnapshot {
        let state = self.inner.state.lock().await;
        self.inner.snapshot_locked(&state)
    }

    /// Subscribes to coalesced status snapshots; the receiver immediately
    /// holds the latest one.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.reporter.subscribe()
    }

    /// Waits until the in-flight transition (if any) has settled.
    pub async fn wait_settled(&self) {
        let handle = {
            let mut state = self.inner.state.lock().await;
            state.transition.take()
        };
        if let Some(handle) = handle {
            // The task never panics in normal operation; an abort during
            // shutdown also lands here.
            let _ = handle.await;
        }
    }

    /// Aborts any in-flight transition and closes every module.
    pub async fn shutdown(&self) {
        let handle = {
            let mut state = self.inner.state.lock().await;
            state.transition_running = false;
            state.transition.take()
        };
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        for (id, entry) in self.inner.registry.iter() {
            if let Err(err) = entry.module.lock().await.close().await {
                warn!(
                    self.inner.log, "error closing module";
                    "id" => id,
                    "error" => format!("{err:#}"),
                );
            }
        }
    }
}

fn spawn_transition(
    state: &mut CoordState,
    transition: impl std::future::Future<Output = ()> + Send + 'static,
) {
    state.transition_running = true;
    state.transition = Some(tokio::spawn(transition));
}

fn load_persistent(store: &StateStore) -> Result<PersistentState, Error> {
    let blob = store.update_state()?;
    if blob.is_empty() {
        return Ok(PersistentState::default());
    }
    Ok(serde_json::from_slice(&blob)?)
}

impl Inner {
    fn check_event(
        &self,
        state: &CoordState,
        event: &'static str,
        allowed: &[UpdateState],
    ) -> Result<(), Error> {
        let current = state.persistent.update_state;
        // An unsettled transition means the FSM is not in any event-accepting
        // state, whatever the store says.
        if state.transition_running {
            return Err(Error::WrongState { event, state: current });
        }
        if !allowed.contains(&current) {
            return Err(Error::WrongState { event, state: current });
        }
        Ok(())
    }

    async fn init_modules(&self) {
        for (id, entry) in self.registry.iter() {
            if let Err(err) = entry.module.lock().await.init().await {
                error!(
                    self.log, "module init failed";
                    "id" => id,
                    "error" => format!("{err:#}"),
                );
                let mut state = self.state.lock().await;
                let status = state
                    .persistent
                    .component_statuses
                    .entry(id.to_string())
                    .or_insert_with(|| ComponentStatus {
                        id: id.to_string(),
                        vendor_version: String::new(),
                        aos_version: 0,
                        status: ComponentState::Error,
                        error: String::new(),
                    });
                status.status = ComponentState::Error;
                status.error = format!("init failed: {err:#}");
            }
        }
    }

    /// Re-reads each module's vendor version into the in-memory cache
    /// without touching the store.
    async fn refresh_vendor_cache(&self) {
        let mut versions = BTreeMap::new();
        for (id, entry) in self.registry.iter() {
            match entry.module.lock().await.vendor_version().await {
                Ok(version) => {
                    versions.insert(id.to_string(), version);
                }
                Err(err) => {
                    warn!(
                        self.log, "can't read vendor version";
                        "id" => id,
                        "error" => format!("{err:#}"),
                    );
                }
            }
        }
        let mut state = self.state.lock().await;
        state.vendor_versions = versions;
    }

    // ---- transition bodies -------------------------------------------------

    async fn run_prepare(&self, items: Vec<ComponentUpdateRequest>) {
        let mut tasks = Vec::new();
        for item in &items {
            let entry = match self.registry.get(&item.id) {
                Ok(entry) => entry,
                Err(err) => {
                    self.settle_failed("prepare", Some(item.id.clone()), err)
                        .await;
                    return;
                }
            };

            let log = self.log.clone();
            let store = self.store.clone();
            let download_dir = self.download_dir.clone();
            let module = Arc::clone(&entry.module);
            let item = item.clone();
            tasks.push(PriorityTask {
                id: item.id.clone(),
                priority: entry.update_priority,
                task: async move {
                    prepare_component(&log, &store, &download_dir, module, item)
                        .await
                }
                .boxed(),
            });
        }

        let mut outcome = run_groups::<()>(&self.log, tasks, true).await;
        if let Some((id, err)) = outcome.take_first_error() {
            self.record_component_errors(&outcome.errors).await;
            self.settle_failed("prepare", Some(id), err).await;
            return;
        }

        self.settle(UpdateState::Prepared).await;
    }

    async fn run_update(&self) {
        let participants = self.participants().await;
        let mut pending = participants.clone();

        loop {
            let tasks = match self.module_op_tasks(&pending, ModuleOp::Update) {
                Ok(tasks) => tasks,
                Err((id, err)) => {
                    self.settle_failed("update", Some(id), err).await;
                    return;
                }
            };

            let mut outcome = run_groups::<bool>(&self.log, tasks, true).await;
            if let Some((id, err)) = outcome.take_first_error() {
                self.record_component_errors(&outcome.errors).await;
                self.settle_failed("update", Some(id), err).await;
                return;
            }

            let bucket = reboot_bucket(&outcome);
            if bucket.is_empty() {
                break;
            }

            // The store must hold the pre-reboot waiting state before the
            // platform goes down.
            self.persist_current().await;
            if let Err(err) = reboot::run_reboot_pass(
                &self.log,
                &self.registry,
                &self.platform,
                &bucket,
            )
            .await
            {
                self.settle_failed("update", None, err).await;
                return;
            }
            pending = bucket;
        }

        // Every module settled; the on-device vendor version must now match
        // what the controller asked for.
        for id in &participants {
            let expected = {
                let state = self.state.lock().await;
                match state.persistent.component_statuses.get(id) {
                    Some(status) => status.vendor_version.clone(),
                    None => continue,
                }
            };
            if expected.is_empty() {
                continue;
            }

            let module = match self.registry.module(id) {
                Ok(module) => module,
                Err(err) => {
                    self.settle_failed("update", Some(id.clone()), err).await;
                    return;
                }
            };
            let actual = match module.lock().await.vendor_version().await {
                Ok(actual) => actual,
                Err(err) => {
                    self.settle_failed(
                        "update",
                        Some(id.clone()),
                        Error::module(id, err),
                    )
                    .await;
                    return;
                }
            };
            if actual != expected {
                self.settle_failed(
                    "update",
                    Some(id.clone()),
                    Error::VersionMismatch {
                        id: id.clone(),
                        expected,
                        actual,
                    },
                )
                .await;
                return;
            }
        }

        {
            let mut state = self.state.lock().await;
            for id in &participants {
                if let Some(status) =
                    state.persistent.component_statuses.get_mut(id)
                {
                    status.status = ComponentState::InstalledUpdated;
                }
            }
        }

        self.settle(UpdateState::Updated).await;
    }

    async fn run_apply(&self) {
        let outcome = self.best_effort_loop(ModuleOp::Apply).await;

        // Persist versions for every component that committed.
        {
            let mut state = self.state.lock().await;
            for id in &outcome.completed {
                let Some(status) =
                    state.persistent.component_statuses.get_mut(id)
                else {
                    continue;
                };
                status.status = ComponentState::Installed;
                if status.aos_version != 0 {
                    if let Err(err) =
                        self.store.set_aos_version(id, status.aos_version)
                    {
                        error!(
                            self.log, "can't persist aos version";
                            "id" => id.as_str(),
                            "error" => %err,
                        );
                    }
                }
            }
        }
        self.record_component_errors(&outcome.errors).await;

        self.enter_idle(outcome.first_error_message()).await;
    }

    async fn run_revert(&self) {
        let outcome = self.best_effort_loop(ModuleOp::Revert).await;

        {
            let mut state = self.state.lock().await;
            for id in &outcome.completed {
                if let Some(status) =
                    state.persistent.component_statuses.get_mut(id)
                {
                    status.status = ComponentState::Installed;
                }
            }
        }
        self.record_component_errors(&outcome.errors).await;

        self.enter_idle(outcome.first_error_message()).await;
    }

    /// The reboot loop shared by `apply` and `revert`: run the operation over
    /// all participants, reboot for whoever asks, repeat with the bucket.
    /// Component errors drop the component out of later passes but never
    /// abort the loop.
    async fn best_effort_loop(&self, op: ModuleOp) -> BestEffortOutcome {
        let participants = self.participants().await;
        let mut pending = participants;
        let mut result = BestEffortOutcome::default();

        loop {
            let tasks = match self.module_op_tasks(&pending, op) {
                Ok(tasks) => tasks,
                Err((id, err)) => {
                    // Unknown component: record and give up on the loop; the
                    // remaining participants were already handled in earlier
                    // passes or are part of this failure.
                    result.record_error(id, err);
                    break;
                }
            };

            let mut outcome = run_groups::<bool>(&self.log, tasks, false).await;
            if let Some((id, err)) = outcome.take_first_error() {
                result.record_error(id, err);
            }
            for (id, err) in std::mem::take(&mut outcome.errors) {
                result.record_error(id, err);
            }

            let bucket = reboot_bucket(&outcome);
            for (id, reboot_required) in &outcome.outputs {
                if !reboot_required {
                    result.completed.push(id.clone());
                }
            }
            if bucket.is_empty() {
                break;
            }

            self.persist_current().await;
            if let Err(err) = reboot::run_reboot_pass(
                &self.log,
                &self.registry,
                &self.platform,
                &bucket,
            )
            .await
            {
                // Without the reboot the bucketed components can't finish;
                // surface the platform error through each of them.
                for id in bucket {
                    result.record_error(
                        id,
                        Error::Platform(format!("reboot failed: {err}")),
                    );
                }
                break;
            }
            pending = bucket;
        }

        result
    }

    fn module_op_tasks(
        &self,
        ids: &[String],
        op: ModuleOp,
    ) -> Result<Vec<PriorityTask<bool>>, (String, Error)> {
        let mut tasks = Vec::new();
        for id in ids {
            let entry = self
                .registry
                .get(id)
                .map_err(|err| (id.clone(), err))?;
            let module = Arc::clone(&entry.module);
            let task_id = id.clone();
            tasks.push(PriorityTask {
                id: id.clone(),
                priority: entry.update_priority,
                task: async move {
                    let mut module = module.lock().await;
                    let result = match op {
                        ModuleOp::Update => module.update().await,
                        ModuleOp::Apply => module.apply().await,
                        ModuleOp::Revert => module.revert().await,
                    };
                    result.map_err(|err| Error::module(&task_id, err))
                }
                .boxed(),
            });
        }
        Ok(tasks)
    }

    async fn participants(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.persistent.component_statuses.keys().cloned().collect()
    }

    // ---- settling ----------------------------------------------------------

    async fn settle(&self, dest: UpdateState) {
        let mut state = self.state.lock().await;
        state.persistent.update_state = dest;
        state.persistent.error = String::new();
        self.persist_locked(&state);
        info!(self.log, "transition settled"; "state" => %dest);
        self.finish_locked(&mut state);
    }

    async fn settle_failed(
        &self,
        event: &'static str,
        component: Option<String>,
        err: Error,
    ) {
        error!(
            self.log, "transition failed";
            "event" => event,
            "component" => component.as_deref().unwrap_or("-"),
            "error" => %err,
        );

        let mut state = self.state.lock().await;
        if let Some(id) = component {
            if let Some(status) =
                state.persistent.component_statuses.get_mut(&id)
            {
                status.status = ComponentState::Error;
                status.error = err.to_string();
            }
        }
        state.persistent.update_state = UpdateState::Failed;
        state.persistent.error = err.to_string();
        self.persist_locked(&state);
        self.finish_locked(&mut state);
    }

    /// Leaves a settled transition in `Idle`: refreshes vendor versions,
    /// purges everything but `Error` statuses, cleans the download
    /// directory, and persists.
    async fn enter_idle(&self, error: String) {
        for (id, entry) in self.registry.iter() {
            match entry.module.lock().await.vendor_version().await {
                Ok(version) => {
                    if let Err(err) =
                        self.store.set_vendor_version(id, &version)
                    {
                        error!(
                            self.log, "can't persist vendor version";
                            "id" => id,
                            "error" => %err,
                        );
                    }
                    let mut state = self.state.lock().await;
                    state.vendor_versions.insert(id.to_string(), version);
                }
                Err(err) => {
                    warn!(
                        self.log, "can't refresh vendor version";
                        "id" => id,
                        "error" => format!("{err:#}"),
                    );
                }
            }
        }

        self.reset_download_dir().await;

        let mut state = self.state.lock().await;
        state
            .persistent
            .component_statuses
            .retain(|_, status| status.status == ComponentState::Error);
        state.persistent.update_state = UpdateState::Idle;
        state.persistent.error = error;
        self.persist_locked(&state);
        info!(self.log, "transition settled"; "state" => %UpdateState::Idle);
        self.finish_locked(&mut state);
    }

    fn finish_locked(&self, state: &mut CoordState) {
        state.transition_running = false;
        let snapshot = self.snapshot_locked(state);
        self.reporter.publish(snapshot);
    }

    async fn record_component_errors(
        &self,
        errors: &BTreeMap<String, Error>,
    ) {
        if errors.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        for (id, err) in errors {
            if let Some(status) =
                state.persistent.component_statuses.get_mut(id)
            {
                status.status = ComponentState::Error;
                status.error = err.to_string();
            }
        }
    }

    /// Re-persists the current in-memory state (still the source state of
    /// the running transition) so it is durable across an imminent reboot.
    async fn persist_current(&self) {
        let state = self.state.lock().await;
        self.persist_locked(&state);
    }

    fn persist_locked(&self, state: &CoordState) {
        let result = serde_json::to_vec(&state.persistent)
            .map_err(Error::from)
            .and_then(|blob| self.store.set_update_state(&blob));
        if let Err(err) = result {
            // Nothing sensible to do beyond shouting: the in-memory state is
            // still authoritative for this process lifetime.
            error!(self.log, "can't persist coordinator state"; "error" => %err);
        }
    }

    async fn reset_download_dir(&self) {
        if let Err(err) = tokio::fs::remove_dir_all(&self.download_dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                error!(
                    self.log, "can't clean download dir";
                    "path" => self.download_dir.as_str(),
                    "error" => %err,
                );
            }
        }
        if let Err(err) = tokio::fs::create_dir_all(&self.download_dir).await {
            error!(
                self.log, "can't create download dir";
                "path" => self.download_dir.as_str(),
                "error" => %err,
            );
        }
    }

    fn snapshot_locked(&self, state: &CoordState) -> StatusSnapshot {
        let mut components = Vec::with_capacity(self.registry.len());
        for id in self.registry.ids() {
            if let Some(status) = state.persistent.component_statuses.get(id) {
                components.push(status.clone());
                continue;
            }
            components.push(ComponentStatus {
                id: id.to_string(),
                vendor_version: state
                    .vendor_versions
                    .get(id)
                    .cloned()
                    .or_else(|| self.store.vendor_version(id).ok())
                    .unwrap_or_default(),
                aos_version: self.store.aos_version(id).unwrap_or(0),
                status: ComponentState::Installed,
                error: String::new(),
            });
        }
        // Statuses can outlive their module (a component dropped from the
        // config); still report them.
        for (id, status) in &state.persistent.component_statuses {
            if self.registry.get(id).is_err() {
                components.push(status.clone());
            }
        }

        StatusSnapshot {
            state: state.persistent.update_state,
            error: state.persistent.error.clone(),
            components,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum ModuleOp {
    Update,
    Apply,
    Revert,
}

#[derive(Default)]
struct BestEffortOutcome {
    /// Components whose final pass completed without requesting a reboot.
    completed: Vec<String>,
    errors: BTreeMap<String, Error>,
    first_error: Option<String>,
}

impl BestEffortOutcome {
    fn record_error(&mut self, id: String, err: Error) {
        if self.first_error.is_none() {
            self.first_error = Some(id.clone());
        }
        self.errors.entry(id).or_insert(err);
    }

    fn first_error_message(&self) -> String {
        self.first_error
            .as_ref()
            .and_then(|id| self.errors.get(id))
            .map(|err| err.to_string())
            .unwrap_or_default()
    }
}

fn reboot_bucket(outcome: &GroupRunOutcome<bool>) -> Vec<String> {
    outcome
        .outputs
        .iter()
        .filter(|&(_, &reboot_required)| reboot_required)
        .map(|(id, _)| id.clone())
        .collect()
}

async fn prepare_component(
    log: &Logger,
    store: &StateStore,
    download_dir: &Utf8Path,
    module: Arc<Mutex<Box<dyn UpdateModule>>>,
    item: ComponentUpdateRequest,
) -> Result<(), Error> {
    let id = item.id.as_str();

    // Record the declared vendor version first; an Idle re-entry after a
    // revert restores the module-reported one.
    store.set_vendor_version(id, &item.vendor_version)?;

    if !item.vendor_version.is_empty() {
        let current = module
            .lock()
            .await
            .vendor_version()
            .await
            .map_err(|err| Error::module(id, err))?;
        if current == item.vendor_version {
            return Err(Error::AlreadyAtVersion {
                id: id.to_string(),
                version: item.vendor_version.clone(),
            });
        }
    }

    if item.aos_version != 0 {
        let stored = store.aos_version(id)?;
        if stored == item.aos_version {
            return Err(Error::AlreadyAtVersion {
                id: id.to_string(),
                version: item.aos_version.to_string(),
            });
        }
        if stored > item.aos_version {
            return Err(Error::DowngradeRefused {
                id: id.to_string(),
                stored,
                requested: item.aos_version,
            });
        }
    }

    let path = images::fetch(log, &item.url, download_dir).await?;
    images::verify(&path, item.size, &item.sha256, &item.sha512).await?;

    info!(
        log, "image staged";
        "id" => id,
        "path" => path.as_str(),
        "vendor_version" => item.vendor_version.as_str(),
        "aos_version" => item.aos_version,
    );

    module
        .lock()
        .await
        .prepare(&path, &item.vendor_version, &item.annotations)
        .await
        .map_err(|err| Error::module(id, err))
}
