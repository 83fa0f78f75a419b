// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The platform facilities the coordinator depends on.

use async_trait::async_trait;
use slog::{info, Logger};

use crate::errors::Error;

#[async_trait]
pub trait Platform: Send + Sync {
    /// A stable identifier of this device.
    fn platform_id(&self) -> Result<String, Error>;

    /// Reboots the device. On real hardware this does not return; callers
    /// must have persisted everything they need beforehand.
    async fn system_reboot(&self) -> Result<(), Error>;
}

/// Platform implementation for a real host.
pub struct HostPlatform {
    log: Logger,
}

impl HostPlatform {
    pub fn new(log: &Logger) -> Self {
        Self { log: log.new(slog::o!("component" => "HostPlatform")) }
    }
}

#[async_trait]
impl Platform for HostPlatform {
    fn platform_id(&self) -> Result<String, Error> {
        match std::fs::read_to_string("/etc/machine-id") {
            Ok(id) => Ok(id.trim().to_string()),
            Err(err) => {
                Err(Error::Platform(format!("reading machine id: {err}")))
            }
        }
    }

    async fn system_reboot(&self) -> Result<(), Error> {
        info!(self.log, "initiating system reboot");

        let status = tokio::process::Command::new("/sbin/reboot")
            .status()
            .await
            .map_err(|err| {
                Error::Platform(format!("spawning /sbin/reboot: {err}"))
            })?;

        if !status.success() {
            return Err(Error::Platform(format!(
                "/sbin/reboot exited with {status}"
            )));
        }

        Ok(())
    }
}
