//! Alias sidecar: named references resolving to completed items.
//!
//! Aliases live in an embedded SQL table next to the store tree. The row
//! key is the fingerprint of the alias *name*, so lookups are themselves
//! content-addressed; the original text is kept for listings. The
//! filesystem stays authoritative for item state; this table only maps
//! names.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::fingerprint::Fingerprint;

pub(crate) const METADATA_DB_FILENAME: &str = "metadata.db";

/// One row of the alias table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AliasEntry {
    pub name: String,
    pub dest: Fingerprint,
}

/// Handle on the sidecar database. Opened once per store; all access is
/// serialized by the store lock, and mutations additionally run inside a
/// mutation window so the rollback journal can be created next to the
/// database.
pub(crate) struct AliasDb {
    conn: Connection,
}

impl AliasDb {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open alias sidecar at {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(10))
            .context("failed to set busy timeout for alias sidecar")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS aliases (
                hash TEXT PRIMARY KEY,
                dest TEXT NOT NULL,
                name TEXT NOT NULL
            );",
        )
        .context("failed to initialize alias sidecar schema")?;
        Ok(Self { conn })
    }

    pub(crate) fn upsert(
        &self,
        hash: &Fingerprint,
        dest: &Fingerprint,
        name: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO aliases(hash, dest, name) VALUES (?1, ?2, ?3) \
             ON CONFLICT(hash) DO UPDATE SET dest=excluded.dest, name=excluded.name",
            params![hash.to_hex(), dest.to_hex(), name],
        )?;
        Ok(())
    }

    pub(crate) fn lookup(&self, hash: &Fingerprint) -> Result<Option<Fingerprint>> {
        let dest = self
            .conn
            .query_row(
                "SELECT dest FROM aliases WHERE hash = ?1",
                params![hash.to_hex()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        dest.map(|text| Fingerprint::parse(&text).map_err(Into::into))
            .transpose()
    }

    pub(crate) fn remove(&self, hash: &Fingerprint) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM aliases WHERE hash = ?1",
            params![hash.to_hex()],
        )?;
        Ok(deleted > 0)
    }

    pub(crate) fn list(&self) -> Result<Vec<AliasEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, dest FROM aliases ORDER BY name ASC")?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let dest: String = row.get(1)?;
            entries.push(AliasEntry {
                name,
                dest: Fingerprint::parse(&dest)?,
            });
        }
        Ok(entries)
    }
}
