// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Crash-consistent persistence for coordinator, version, and module state.
//!
//! The store is a small sqlite database opened with WAL journaling and
//! `synchronous=FULL`: once a setter returns, the write survives power loss.
//! Every operation is short and synchronous; callers in async context invoke
//! them directly (they do not block long enough to matter and are serialized
//! by the inner mutex anyway).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8Path;
use rusqlite::{params, Connection, OptionalExtension};
use slog::{info, o, Logger};

use crate::errors::Error;

/// Bump on any incompatible schema change.
const SCHEMA_VERSION: u64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(60);

/// What to do when the on-disk schema version is not [`SCHEMA_VERSION`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaMismatchPolicy {
    /// Return [`Error::SchemaVersion`] and leave the database untouched.
    Fail,
    /// Drop all tables and reinitialize. Loses all persisted state.
    WipeAndReinit,
}

#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Mutex<Connection>>,
}

impl StateStore {
    pub fn open(
        log: &Logger,
        path: &Utf8Path,
        policy: SchemaMismatchPolicy,
    ) -> Result<Self, Error> {
        let log = log.new(o!("component" => "StateStore"));

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                Error::io(format!("creating database directory {parent}"), err)
            })?;
        }

        info!(log, "opening state store"; "path" => path.as_str());

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        create_schema(&conn)?;

        let found: u64 =
            conn.query_row("SELECT version FROM config", [], |row| row.get(0))?;
        if found != SCHEMA_VERSION {
            match policy {
                SchemaMismatchPolicy::Fail => {
                    return Err(Error::SchemaVersion {
                        found,
                        expected: SCHEMA_VERSION,
                    });
                }
                SchemaMismatchPolicy::WipeAndReinit => {
                    info!(
                        log, "schema version mismatch; wiping state store";
                        "found" => found,
                        "expected" => SCHEMA_VERSION,
                    );
                    conn.execute_batch(
                        "DROP TABLE config;
                         DROP TABLE components;
                         DROP TABLE module_state;",
                    )?;
                    create_schema(&conn)?;
                }
            }
        }

        Ok(Self { inner: Arc::new(Mutex::new(conn)) })
    }

    /// Returns the persisted coordinator state blob.
    pub fn update_state(&self) -> Result<Vec<u8>, Error> {
        let conn = self.lock();
        let blob: Vec<u8> = conn.query_row(
            "SELECT update_state FROM config",
            [],
            |row| row.get(0),
        )?;
        Ok(blob)
    }

    /// Atomically replaces the coordinator state blob; durable on return.
    pub fn set_update_state(&self, blob: &[u8]) -> Result<(), Error> {
        let conn = self.lock();
        conn.execute("UPDATE config SET update_state = ?1", params![blob])?;
        Ok(())
    }

    pub fn system_version(&self) -> Result<u64, Error> {
        let conn = self.lock();
        let version: u64 = conn.query_row(
            "SELECT system_version FROM config",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    pub fn set_system_version(&self, version: u64) -> Result<(), Error> {
        let conn = self.lock();
        conn.execute(
            "UPDATE config SET system_version = ?1",
            params![version],
        )?;
        Ok(())
    }

    /// Stored Aos version of a component; 0 if never written.
    pub fn aos_version(&self, id: &str) -> Result<u64, Error> {
        let conn = self.lock();
        let version: Option<u64> = conn
            .query_row(
                "SELECT aos_version FROM components WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.unwrap_or(0))
    }

    pub fn set_aos_version(&self, id: &str, version: u64) -> Result<(), Error> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO components (id, aos_version, vendor_version)
             VALUES (?1, ?2, '')
             ON CONFLICT (id) DO UPDATE SET aos_version = excluded.aos_version",
            params![id, version],
        )?;
        Ok(())
    }

    /// Stored vendor version of a component; empty if never written.
    pub fn vendor_version(&self, id: &str) -> Result<String, Error> {
        let conn = self.lock();
        let version: Option<String> = conn
            .query_row(
                "SELECT vendor_version FROM components WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.unwrap_or_default())
    }

    pub fn set_vendor_version(
        &self,
        id: &str,
        version: &str,
    ) -> Result<(), Error> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO components (id, aos_version, vendor_version)
             VALUES (?1, 0, ?2)
             ON CONFLICT (id) DO UPDATE
                SET vendor_version = excluded.vendor_version",
            params![id, version],
        )?;
        Ok(())
    }

    /// Opaque per-module blob, owned by the module.
    pub fn module_state(&self, id: &str) -> Result<Option<Vec<u8>>, Error> {
        let conn = self.lock();
        let state: Option<Vec<u8>> = conn
            .query_row(
                "SELECT state FROM module_state WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }

    pub fn set_module_state(&self, id: &str, state: &[u8]) -> Result<(), Error> {
        let conn = self.lock();
        conn.execute(
            "REPLACE INTO module_state (id, state) VALUES (?1, ?2)",
            params![id, state],
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-statement; nothing we can
        // usefully recover at this layer.
        self.inner.lock().expect("state store mutex poisoned")
    }
}

fn create_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS config (
             version INTEGER NOT NULL,
             system_version INTEGER NOT NULL,
             update_state BLOB NOT NULL
         );
         CREATE TABLE IF NOT EXISTS components (
             id TEXT NOT NULL PRIMARY KEY,
             aos_version INTEGER NOT NULL,
             vendor_version TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS module_state (
             id TEXT NOT NULL PRIMARY KEY,
             state BLOB NOT NULL
         );",
    )?;

    let rows: u64 =
        conn.query_row("SELECT COUNT(*) FROM config", [], |row| row.get(0))?;
    if rows == 0 {
        conn.execute(
            "INSERT INTO config (version, system_version, update_state)
             VALUES (?1, 0, ?2)",
            params![SCHEMA_VERSION, b"".as_slice()],
        )?;
    }

    Ok(())
}
