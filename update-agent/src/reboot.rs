// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The reboot pass run between reboot-required iterations.

use std::sync::Arc;

use futures::FutureExt;
use slog::{info, warn, Logger};

use crate::errors::Error;
use crate::platform::Platform;
use crate::registry::ModuleRegistry;
use crate::scheduler::{run_groups, PriorityTask};

/// Gives every bucketed module a chance to handle its own reboot (in reboot
/// priority order), then reboots the platform.
///
/// Module reboot errors are logged and otherwise ignored: the reboot itself
/// is what lets the update make progress, so it proceeds regardless. The
/// caller must have persisted the pre-reboot waiting state already. On real
/// hardware this function does not return.
pub(crate) async fn run_reboot_pass(
    log: &Logger,
    registry: &ModuleRegistry,
    platform: &Arc<dyn Platform>,
    ids: &[String],
) -> Result<(), Error> {
    let mut tasks = Vec::new();
    for id in ids {
        let entry = registry.get(id)?;
        let module = Arc::clone(&entry.module);
        let task_id = id.clone();
        tasks.push(PriorityTask {
            id: id.clone(),
            priority: entry.reboot_priority,
            task: async move {
                module
                    .lock()
                    .await
                    .reboot()
                    .await
                    .map_err(|err| Error::module(&task_id, err))
            }
            .boxed(),
        });
    }

    let outcome = run_groups::<()>(log, tasks, false).await;
    for (id, err) in &outcome.errors {
        warn!(log, "module reboot failed"; "id" => id.as_str(), "error" => %err);
    }

    info!(log, "rebooting system"; "components" => ids.len());
    platform.system_reboot().await
}
