use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::personas::PersonaId;

/// Association between a wallet address and a persona's saved transcript.
/// Last write wins; each device re-associates on save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptBinding {
    pub address: String,
    pub persona_id: u32,
    pub blob_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Record of a completed first-login transfer. Existence of a row is the
/// idempotence marker: one grant per address, ever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingGrant {
    pub id: String,
    pub address: String,
    pub tx_digest: String,
    pub granted_at: DateTime<Utc>,
}

/// SQLite store for identity bindings and funding markers. All access goes
/// through one connection behind a mutex; the handlers are async but the
/// statements here are short and synchronous.
pub struct BindingsDatabase {
    conn: Mutex<Connection>,
}

impl BindingsDatabase {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open bindings database")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_tables()?;
        Ok(db)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.lock_conn();

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS transcript_bindings (
                address TEXT NOT NULL,
                persona_id INTEGER NOT NULL,
                blob_id TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (address, persona_id)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS funding_grants (
                id TEXT PRIMARY KEY,
                address TEXT NOT NULL UNIQUE,
                tx_digest TEXT NOT NULL,
                granted_at TEXT NOT NULL
            )"#,
            [],
        )?;

        Ok(())
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Upsert the binding for (address, persona). Repeated associations from
    /// any device simply replace the blob id.
    pub fn associate(&self, address: &str, persona: PersonaId, blob_id: &str) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            r#"INSERT INTO transcript_bindings (address, persona_id, blob_id, updated_at)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT (address, persona_id)
               DO UPDATE SET blob_id = excluded.blob_id, updated_at = excluded.updated_at"#,
            params![address, persona.as_u32(), blob_id, Utc::now().to_rfc3339()],
        )
        .context("Failed to upsert transcript binding")?;
        Ok(())
    }

    pub fn lookup(&self, address: &str, persona: PersonaId) -> Result<Option<String>> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT blob_id FROM transcript_bindings WHERE address = ?1 AND persona_id = ?2",
            params![address, persona.as_u32()],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .context("Failed to look up transcript binding")
    }

    pub fn get_binding(&self, address: &str, persona: PersonaId) -> Result<Option<TranscriptBinding>> {
        let conn = self.lock_conn();
        conn.query_row(
            r#"SELECT address, persona_id, blob_id, updated_at
               FROM transcript_bindings WHERE address = ?1 AND persona_id = ?2"#,
            params![address, persona.as_u32()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()
        .context("Failed to read transcript binding")?
        .map(|(address, persona_id, blob_id, updated_at)| {
            Ok(TranscriptBinding {
                address,
                persona_id,
                blob_id,
                updated_at: parse_timestamp(&updated_at)?,
            })
        })
        .transpose()
    }

    /// Record a completed transfer for an address. Fails on a second insert
    /// for the same address; callers check `funding_grant` first.
    pub fn record_funding(&self, address: &str, tx_digest: &str) -> Result<FundingGrant> {
        let grant = FundingGrant {
            id: uuid::Uuid::new_v4().to_string(),
            address: address.to_string(),
            tx_digest: tx_digest.to_string(),
            granted_at: Utc::now(),
        };

        let conn = self.lock_conn();
        conn.execute(
            r#"INSERT INTO funding_grants (id, address, tx_digest, granted_at)
               VALUES (?1, ?2, ?3, ?4)"#,
            params![
                grant.id,
                grant.address,
                grant.tx_digest,
                grant.granted_at.to_rfc3339()
            ],
        )
        .context("Failed to record funding grant")?;
        Ok(grant)
    }

    pub fn funding_grant(&self, address: &str) -> Result<Option<FundingGrant>> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT id, address, tx_digest, granted_at FROM funding_grants WHERE address = ?1",
            params![address],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()
        .context("Failed to read funding grant")?
        .map(|(id, address, tx_digest, granted_at)| {
            Ok(FundingGrant {
                id,
                address,
                tx_digest,
                granted_at: parse_timestamp(&granted_at)?,
            })
        })
        .transpose()
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in database: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("anontherapy_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    #[test]
    fn associate_then_lookup_returns_the_blob_id() {
        let path = temp_db_path("bindings_roundtrip");
        let db = BindingsDatabase::new(&path).expect("db init");

        db.associate("0xabc", PersonaId(2), "blob-1")
            .expect("associate");
        assert_eq!(
            db.lookup("0xabc", PersonaId(2)).expect("lookup"),
            Some("blob-1".to_string())
        );
        assert_eq!(db.lookup("0xabc", PersonaId(1)).expect("lookup"), None);
        assert_eq!(db.lookup("0xother", PersonaId(2)).expect("lookup"), None);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn second_associate_overwrites_the_first() {
        let path = temp_db_path("bindings_overwrite");
        let db = BindingsDatabase::new(&path).expect("db init");

        db.associate("0xabc", PersonaId(3), "blob-old")
            .expect("first associate");
        db.associate("0xabc", PersonaId(3), "blob-new")
            .expect("second associate");

        assert_eq!(
            db.lookup("0xabc", PersonaId(3)).expect("lookup"),
            Some("blob-new".to_string())
        );
        let binding = db
            .get_binding("0xabc", PersonaId(3))
            .expect("get binding")
            .expect("binding exists");
        assert_eq!(binding.blob_id, "blob-new");
        assert!(binding.updated_at <= Utc::now());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn funding_grant_is_recorded_once_per_address() {
        let path = temp_db_path("funding_once");
        let db = BindingsDatabase::new(&path).expect("db init");

        assert!(db.funding_grant("0xabc").expect("query").is_none());
        db.record_funding("0xabc", "digest-1").expect("record");

        let grant = db
            .funding_grant("0xabc")
            .expect("query")
            .expect("grant exists");
        assert_eq!(grant.tx_digest, "digest-1");

        // A duplicate insert violates the unique address constraint.
        assert!(db.record_funding("0xabc", "digest-2").is_err());
        let grant = db
            .funding_grant("0xabc")
            .expect("query")
            .expect("grant still exists");
        assert_eq!(grant.tx_digest, "digest-1");

        let _ = std::fs::remove_file(&path);
    }
}
