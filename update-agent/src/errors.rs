// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The error taxonomy shared by every part of the agent.

use thiserror::Error;
use update_agent_common::UpdateState;

#[derive(Debug, Error)]
pub enum Error {
    /// The requested event is not legal in the coordinator's current state.
    #[error("can't {event} in state {state}")]
    WrongState { event: &'static str, state: UpdateState },

    #[error("unknown component: {0}")]
    UnknownComponent(String),

    #[error("no module factory registered for plugin {0}")]
    UnknownPlugin(String),

    #[error("failed to fetch {url}")]
    Fetch {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    /// Size or digest of a fetched image disagrees with the request.
    #[error("image integrity check failed: {0}")]
    Integrity(String),

    #[error("component {id} is already at version {version}")]
    AlreadyAtVersion { id: String, version: String },

    #[error(
        "wrong Aos version for component {id}: stored {stored}, \
         requested {requested}"
    )]
    DowngradeRefused { id: String, stored: u64, requested: u64 },

    #[error(
        "vendor version mismatch for component {id}: \
         expected {expected}, got {actual}"
    )]
    VersionMismatch { id: String, expected: String, actual: String },

    /// An error returned by a module operation.
    #[error("module {id}: {message}")]
    Module { id: String, message: String },

    #[error("storage error")]
    Storage(#[from] rusqlite::Error),

    #[error("state serialization error")]
    StateEncoding(#[from] serde_json::Error),

    #[error("unsupported database schema version {found} (expected {expected})")]
    SchemaVersion { found: u64, expected: u64 },

    #[error("platform error: {0}")]
    Platform(String),

    #[error("{message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Wraps a module operation failure, flattening the cause chain into a
    /// single message so it can be persisted in a component status.
    pub(crate) fn module(id: &str, err: anyhow::Error) -> Self {
        Error::Module { id: id.to_string(), message: format!("{err:#}") }
    }

    pub(crate) fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io { message: message.into(), source }
    }
}
