//! DuckDB-backed key store.
//!
//! Records are stored as JSON text next to the columns they are looked up
//! by. Replacing a file's recipient set runs in one transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use duckdb::{Connection, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{KeyStoreError, KeyStoreResult};
use crate::records::{FileId, FileKeyMarker, PrincipalId, ShareKeyRecord, StoredKeypair, SystemState};
use crate::{KeyStore, validate_record_set};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS keypairs (
        principal VARCHAR PRIMARY KEY,
        record VARCHAR NOT NULL
    );
    CREATE TABLE IF NOT EXISTS file_markers (
        file_id VARCHAR NOT NULL,
        current_version BIGINT NOT NULL,
        record VARCHAR NOT NULL
    );
    CREATE TABLE IF NOT EXISTS share_keys (
        file_id VARCHAR NOT NULL,
        principal VARCHAR NOT NULL,
        version BIGINT NOT NULL,
        record VARCHAR NOT NULL
    );
    CREATE TABLE IF NOT EXISTS system_state (
        id INTEGER PRIMARY KEY,
        record VARCHAR NOT NULL
    );
";

/// [`KeyStore`] persisted in a DuckDB database.
pub struct DuckDbKeyStore {
    conn: Mutex<Connection>,
}

fn storage(e: impl std::fmt::Display) -> KeyStoreError {
    KeyStoreError::Storage(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> KeyStoreResult<String> {
    serde_json::to_string(value).map_err(storage)
}

fn decode<T: DeserializeOwned>(what: &str, json: &str) -> KeyStoreResult<T> {
    serde_json::from_str(json).map_err(|e| KeyStoreError::CorruptRecord(format!("{what}: {e}")))
}

/// Maps "no rows" to `NotFound`, everything else to `Storage`.
fn lookup<T>(result: duckdb::Result<T>, what: impl FnOnce() -> String) -> KeyStoreResult<T> {
    match result {
        Ok(v) => Ok(v),
        Err(duckdb::Error::QueryReturnedNoRows) => Err(KeyStoreError::NotFound(what())),
        Err(e) => Err(storage(e)),
    }
}

impl DuckDbKeyStore {
    /// Opens (or creates) a store at `path`.
    pub fn open(path: &Path) -> KeyStoreResult<Self> {
        let conn = Connection::open(path).map_err(storage)?;
        // DuckDB defaults to a large share of RAM per connection
        conn.execute_batch("PRAGMA memory_limit='64MB'; PRAGMA threads=1;")
            .map_err(storage)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> KeyStoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> KeyStoreResult<Self> {
        conn.execute_batch(SCHEMA).map_err(storage)?;
        debug!("key store schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> KeyStoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(storage)
    }

    fn stored_marker(conn: &Connection, file: &FileId) -> KeyStoreResult<Option<FileKeyMarker>> {
        let row: duckdb::Result<String> = conn.query_row(
            "SELECT record FROM file_markers WHERE file_id = ?",
            params![file.as_str()],
            |row| row.get(0),
        );
        match row {
            Ok(json) => decode("file marker", &json).map(Some),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(storage(e)),
        }
    }

    fn query_strings(
        conn: &Connection,
        sql: &str,
        param: Option<&str>,
    ) -> KeyStoreResult<Vec<String>> {
        let mut stmt = conn.prepare(sql).map_err(storage)?;
        let rows = match param {
            Some(p) => stmt
                .query_map(params![p], |row| row.get::<_, String>(0))
                .map_err(storage)?
                .collect::<Result<Vec<_>, _>>(),
            None => stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(storage)?
                .collect::<Result<Vec<_>, _>>(),
        };
        rows.map_err(storage)
    }
}

impl KeyStore for DuckDbKeyStore {
    fn get_keypair(&self, principal: &PrincipalId) -> KeyStoreResult<StoredKeypair> {
        let conn = self.lock()?;
        let json: String = lookup(
            conn.query_row(
                "SELECT record FROM keypairs WHERE principal = ?",
                params![principal.as_str()],
                |row| row.get(0),
            ),
            || format!("keypair for {principal}"),
        )?;
        decode("keypair", &json)
    }

    fn put_keypair(&self, principal: &PrincipalId, keypair: &StoredKeypair) -> KeyStoreResult<()> {
        let json = encode(keypair)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO keypairs (principal, record) VALUES (?, ?)",
            params![principal.as_str(), json],
        )
        .map_err(storage)?;
        Ok(())
    }

    fn delete_keypair(&self, principal: &PrincipalId) -> KeyStoreResult<()> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "DELETE FROM keypairs WHERE principal = ?",
                params![principal.as_str()],
            )
            .map_err(storage)?;
        if affected == 0 {
            return Err(KeyStoreError::NotFound(format!("keypair for {principal}")));
        }
        Ok(())
    }

    fn list_principals(&self) -> KeyStoreResult<Vec<PrincipalId>> {
        let conn = self.lock()?;
        let ids = Self::query_strings(
            &conn,
            "SELECT principal FROM keypairs ORDER BY principal",
            None,
        )?;
        Ok(ids.into_iter().map(PrincipalId::new).collect())
    }

    fn get_file_marker(&self, file: &FileId) -> KeyStoreResult<FileKeyMarker> {
        let conn = self.lock()?;
        Self::stored_marker(&conn, file)?
            .ok_or_else(|| KeyStoreError::NotFound(format!("file key marker for {file}")))
    }

    fn list_files(&self) -> KeyStoreResult<Vec<FileId>> {
        let conn = self.lock()?;
        let ids = Self::query_strings(
            &conn,
            "SELECT file_id FROM file_markers ORDER BY file_id",
            None,
        )?;
        Ok(ids.into_iter().map(FileId::new).collect())
    }

    fn get_file_key_record(
        &self,
        file: &FileId,
        principal: &PrincipalId,
    ) -> KeyStoreResult<ShareKeyRecord> {
        let conn = self.lock()?;
        let json: String = lookup(
            conn.query_row(
                "SELECT record FROM share_keys WHERE file_id = ? AND principal = ?",
                params![file.as_str(), principal.as_str()],
                |row| row.get(0),
            ),
            || format!("share key of {file} for {principal}"),
        )?;
        decode("share key", &json)
    }

    fn list_share_key_records(&self, file: &FileId) -> KeyStoreResult<Vec<ShareKeyRecord>> {
        let conn = self.lock()?;
        Self::query_strings(
            &conn,
            "SELECT record FROM share_keys WHERE file_id = ? ORDER BY principal",
            Some(file.as_str()),
        )?
        .iter()
        .map(|json| decode("share key", json))
        .collect()
    }

    fn put_share_key_records(
        &self,
        marker: &FileKeyMarker,
        records: &[ShareKeyRecord],
    ) -> KeyStoreResult<()> {
        let marker_json = encode(marker)?;
        let record_json = records
            .iter()
            .map(encode)
            .collect::<KeyStoreResult<Vec<_>>>()?;

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage)?;

        let stored = Self::stored_marker(&tx, &marker.file_id)?;
        validate_record_set(marker, records, stored.as_ref())?;

        let file = marker.file_id.as_str();
        tx.execute("DELETE FROM share_keys WHERE file_id = ?", params![file])
            .map_err(storage)?;
        tx.execute("DELETE FROM file_markers WHERE file_id = ?", params![file])
            .map_err(storage)?;
        tx.execute(
            "INSERT INTO file_markers (file_id, current_version, record) VALUES (?, ?, ?)",
            params![file, i64::from(marker.current_version), marker_json],
        )
        .map_err(storage)?;
        for (record, json) in records.iter().zip(&record_json) {
            tx.execute(
                "INSERT INTO share_keys (file_id, principal, version, record) VALUES (?, ?, ?, ?)",
                params![
                    file,
                    record.principal.as_str(),
                    i64::from(record.version),
                    json
                ],
            )
            .map_err(storage)?;
        }

        tx.commit().map_err(storage)?;
        debug!(
            file = %marker.file_id,
            version = marker.current_version,
            recipients = records.len(),
            "replaced share key set"
        );
        Ok(())
    }

    fn delete_share_key_record(
        &self,
        file: &FileId,
        principal: &PrincipalId,
    ) -> KeyStoreResult<()> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "DELETE FROM share_keys WHERE file_id = ? AND principal = ?",
                params![file.as_str(), principal.as_str()],
            )
            .map_err(storage)?;
        if affected == 0 {
            return Err(KeyStoreError::NotFound(format!(
                "share key of {file} for {principal}"
            )));
        }
        Ok(())
    }

    fn delete_file_records(&self, file: &FileId) -> KeyStoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage)?;
        tx.execute("DELETE FROM share_keys WHERE file_id = ?", params![file.as_str()])
            .map_err(storage)?;
        tx.execute("DELETE FROM file_markers WHERE file_id = ?", params![file.as_str()])
            .map_err(storage)?;
        tx.commit().map_err(storage)
    }

    fn get_system_state(&self) -> KeyStoreResult<SystemState> {
        let conn = self.lock()?;
        let row: duckdb::Result<String> = conn.query_row(
            "SELECT record FROM system_state WHERE id = 1",
            [],
            |row| row.get(0),
        );
        match row {
            Ok(json) => decode("system state", &json),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(SystemState::default()),
            Err(e) => Err(storage(e)),
        }
    }

    fn put_system_state(&self, state: &SystemState) -> KeyStoreResult<()> {
        let json = encode(state)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO system_state (id, record) VALUES (1, ?)",
            params![json],
        )
        .map_err(storage)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_json_is_corrupt_record() {
        let store = DuckDbKeyStore::open_in_memory().unwrap();
        {
            let conn = store.lock().unwrap();
            conn.execute(
                "INSERT INTO keypairs (principal, record) VALUES ('mallory', '{not json')",
                [],
            )
            .unwrap();
        }
        let err = store.get_keypair(&PrincipalId::from("mallory")).unwrap_err();
        assert!(matches!(err, KeyStoreError::CorruptRecord(_)));
    }
}
