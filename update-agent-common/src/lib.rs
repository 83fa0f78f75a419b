// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared between the update agent and its controller.
//!
//! Everything here crosses the control API, so it is serializable and carries
//! a JSON schema. The agent's internal machinery lives in the `update-agent`
//! crate; controllers should only ever need this one.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The externally visible state of the update coordinator.
///
/// Only settled states are ever reported (or persisted); a transition that is
/// still executing reports its source state.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    /// No update in progress.
    Idle,
    /// Images are staged and every module has accepted `prepare`.
    Prepared,
    /// Every module has completed `update`; `apply` has not started.
    Updated,
    /// A transition aborted; only `revert` is accepted.
    Failed,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateState::Idle => "idle",
            UpdateState::Prepared => "prepared",
            UpdateState::Updated => "updated",
            UpdateState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-component installation state.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    /// The component is running its installed version.
    Installed,
    /// The component is part of an in-flight update.
    Installing,
    /// `update` has completed for this component; `apply` has not.
    InstalledUpdated,
    /// The last operation on this component failed; see `error`.
    Error,
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComponentState::Installed => "installed",
            ComponentState::Installing => "installing",
            ComponentState::InstalledUpdated => "installed_updated",
            ComponentState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Runtime status of a single component.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ComponentStatus {
    pub id: String,
    pub vendor_version: String,
    pub aos_version: u64,
    pub status: ComponentState,
    /// Empty unless `status` is `Error`.
    #[serde(default)]
    pub error: String,
}

/// One component's slice of an update bundle, as submitted by the controller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ComponentUpdateRequest {
    pub id: String,
    /// Declared vendor version; may be empty if the vendor does not version
    /// this component.
    #[serde(default)]
    pub vendor_version: String,
    /// Declared Aos version; 0 disables version gating for this item.
    #[serde(default)]
    pub aos_version: u64,
    /// Where to obtain the image. `file:` URLs are used in place.
    pub url: String,
    /// Expected image size in bytes.
    pub size: u64,
    /// Hex-encoded SHA-256 digest of the image.
    pub sha256: String,
    /// Hex-encoded SHA-512 digest of the image.
    pub sha512: String,
    /// Opaque controller-supplied data, forwarded to the module untouched.
    #[serde(default)]
    pub annotations: serde_json::Value,
}

/// Body of the `prepare` control request.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct PrepareRequest {
    pub components: Vec<ComponentUpdateRequest>,
}

/// Aggregated agent status, published after every settled transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StatusSnapshot {
    pub state: UpdateState,
    /// Empty unless the last transition failed.
    #[serde(default)]
    pub error: String,
    pub components: Vec<ComponentStatus>,
}

impl StatusSnapshot {
    /// A snapshot for an agent that has not finished initializing.
    pub fn initial() -> Self {
        Self {
            state: UpdateState::Idle,
            error: String::new(),
            components: Vec::new(),
        }
    }
}
