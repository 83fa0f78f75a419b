// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared state for the control API server.

use std::sync::Arc;

use slog::Logger;

use crate::coordinator::UpdateCoordinator;

pub struct ServerContext {
    pub coordinator: Arc<UpdateCoordinator>,
    pub log: Logger,
}
