// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Publishing coalesced status snapshots to the controller.

use slog::{debug, Logger};
use tokio::sync::watch;
use update_agent_common::StatusSnapshot;

/// Publishes [`StatusSnapshot`]s through a watch channel.
///
/// The channel holds only the latest snapshot, so a slow consumer observes
/// the most recent state rather than a backlog.
pub struct StatusReporter {
    log: Logger,
    tx: watch::Sender<StatusSnapshot>,
}

impl StatusReporter {
    pub fn new(log: &Logger) -> Self {
        let (tx, _rx) = watch::channel(StatusSnapshot::initial());
        Self { log: log.new(slog::o!("component" => "StatusReporter")), tx }
    }

    /// A receiver that immediately yields the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn publish(&self, snapshot: StatusSnapshot) {
        debug!(
            self.log, "publishing status";
            "state" => %snapshot.state,
            "components" => snapshot.components.len(),
        );
        // Publishing is independent of whether anyone is subscribed.
        self.tx.send_replace(snapshot);
    }

    /// The most recently published snapshot.
    pub fn latest(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }
}
