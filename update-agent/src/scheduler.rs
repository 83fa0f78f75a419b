// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority-grouped execution of per-component operations.
//!
//! Tasks are sorted by priority descending and partitioned into groups of
//! equal priority. Each group runs concurrently on a [`JoinSet`]; a barrier
//! joins the whole group before the next one starts, so an operation never
//! observes a module mid-transition from a different priority group.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use slog::{debug, Logger};
use tokio::task::JoinSet;

use crate::errors::Error;

pub(crate) struct PriorityTask<O> {
    /// Component id; used to key outcomes and attribute errors.
    pub id: String,
    pub priority: u32,
    pub task: BoxFuture<'static, Result<O, Error>>,
}

pub(crate) struct GroupRunOutcome<O> {
    /// Output of every task that completed successfully.
    pub outputs: BTreeMap<String, O>,
    /// Error of every task that failed.
    pub errors: BTreeMap<String, Error>,
    /// Id of the first task to fail, in completion order.
    pub first_error: Option<String>,
}

impl<O> GroupRunOutcome<O> {
    /// The first error, removed from the per-task map.
    pub fn take_first_error(&mut self) -> Option<(String, Error)> {
        let id = self.first_error.take()?;
        let err = self.errors.remove(&id)?;
        Some((id, err))
    }
}

/// Runs `tasks` in descending priority groups.
///
/// With `stop_on_error` set, execution aborts after the first group that
/// produced an error; otherwise every group runs and the first error seen is
/// retained in the outcome.
pub(crate) async fn run_groups<O: Send + 'static>(
    log: &Logger,
    tasks: Vec<PriorityTask<O>>,
    stop_on_error: bool,
) -> GroupRunOutcome<O> {
    let mut tasks = tasks;
    // Stable sort: equal priorities keep their submission order, though
    // within a group completion order is unspecified anyway.
    tasks.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut outcome = GroupRunOutcome {
        outputs: BTreeMap::new(),
        errors: BTreeMap::new(),
        first_error: None,
    };
    // First-error cell, written by whichever task fails first.
    let first_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let mut tasks = tasks.into_iter().peekable();
    while let Some(head) = tasks.next() {
        let priority = head.priority;
        let mut group = vec![head];
        while tasks.peek().is_some_and(|t| t.priority == priority) {
            group.push(tasks.next().expect("peeked"));
        }

        debug!(
            log, "running priority group";
            "priority" => priority,
            "tasks" => group.len(),
        );

        let mut set = JoinSet::new();
        for task in group {
            let PriorityTask { id, task, .. } = task;
            let first_error = Arc::clone(&first_error);
            set.spawn(async move {
                let result = task.await;
                if result.is_err() {
                    let mut cell =
                        first_error.lock().expect("first-error cell poisoned");
                    if cell.is_none() {
                        *cell = Some(id.clone());
                    }
                }
                (id, result)
            });
        }

        // Barrier: the next group must not start until this one is done.
        while let Some(joined) = set.join_next().await {
            let (id, result) = joined.expect("scheduler task panicked");
            match result {
                Ok(output) => {
                    outcome.outputs.insert(id, output);
                }
                Err(err) => {
                    outcome.errors.insert(id, err);
                }
            }
        }

        if stop_on_error && !outcome.errors.is_empty() {
            break;
        }
    }

    outcome.first_error =
        first_error.lock().expect("first-error cell poisoned").take();
    outcome
}
