mod schema;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::backend::DocumentStore;
use crate::error::{ChangeError, Result as ChangeResult};
use crate::models::*;

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: PathBuf) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Database path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "annotd")
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        Ok(dirs.data_dir().join("annotd.db"))
    }

    pub fn open_default() -> Result<Self> {
        Self::open(Self::default_path()?)
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        schema::run_migrations(&conn)
    }

    /// Run `f` inside one immediate transaction. The transaction commits if
    /// `f` succeeds and rolls back otherwise.
    pub fn transaction<T, F>(&self, f: F) -> ChangeResult<T>
    where
        F: FnOnce(&mut SqliteStore<'_>) -> ChangeResult<T>,
    {
        let conn = self.conn.lock().expect("database lock poisoned");
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let mut store = SqliteStore { conn: &conn };
        match f(&mut store) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                    tracing::error!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Run read-only `f` against the store outside an explicit transaction.
    pub fn read<T, F>(&self, f: F) -> ChangeResult<T>
    where
        F: FnOnce(&SqliteStore<'_>) -> ChangeResult<T>,
    {
        let conn = self.conn.lock().expect("database lock poisoned");
        f(&SqliteStore { conn: &conn })
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

/// The document store view of one locked connection.
pub struct SqliteStore<'c> {
    conn: &'c Connection,
}

impl SqliteStore<'_> {
    /// Append to the change log. The channel sequence is one past the
    /// assembly's latest.
    pub fn append_change(&mut self, record: NewChangeRecord) -> ChangeResult<ChangeRecord> {
        let channel_sequence = latest_channel_sequence(self.conn, record.assembly)? + 1;
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO change_records
                (channel_sequence, type_name, assembly_id, changed_ids, change, user_name, reverts, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            (
                channel_sequence,
                &record.type_name,
                record.assembly.to_string(),
                serde_json::to_string(&record.changed_ids)?,
                serde_json::to_string(&record.change)?,
                &record.user,
                record.reverts,
                now.to_rfc3339(),
            ),
        )?;
        Ok(ChangeRecord {
            sequence: self.conn.last_insert_rowid(),
            channel_sequence,
            type_name: record.type_name,
            assembly: record.assembly,
            changed_ids: record.changed_ids,
            change: record.change,
            user: record.user,
            reverts: record.reverts,
            created_at: now,
        })
    }

    pub fn find_change(&self, sequence: i64) -> ChangeResult<Option<ChangeRecord>> {
        Ok(self
            .conn
            .query_row(
                &format!("{} WHERE sequence = ?", SELECT_CHANGE),
                [sequence],
                change_from_row,
            )
            .optional()?)
    }

    /// Records of one assembly with `channel_sequence > since`, in order.
    pub fn find_changes_since(&self, assembly: Uuid, since: i64) -> ChangeResult<Vec<ChangeRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE assembly_id = ? AND channel_sequence > ? ORDER BY channel_sequence",
            SELECT_CHANGE
        ))?;
        let records = stmt
            .query_map((assembly.to_string(), since), change_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn latest_channel_sequence(&self, assembly: Uuid) -> ChangeResult<i64> {
        Ok(latest_channel_sequence(self.conn, assembly)?)
    }

    /// Whether a later record already reverts `sequence`.
    pub fn is_reverted(&self, sequence: i64) -> ChangeResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM change_records WHERE reverts = ?",
            [sequence],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn query_features(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> ChangeResult<Vec<AnnotationFeature>> {
        let mut stmt = self.conn.prepare(sql)?;
        let documents = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        documents
            .iter()
            .map(|document| Ok(serde_json::from_str(document)?))
            .collect()
    }

    fn index_feature_ids(&self, feature: &AnnotationFeature) -> ChangeResult<()> {
        let mut stmt = self
            .conn
            .prepare("INSERT INTO feature_ids (feature_id, top_level_id) VALUES (?, ?)")?;
        for id in feature.all_ids() {
            stmt.execute((id.to_string(), feature.id.to_string()))
                .map_err(|e| match e.sqlite_error_code() {
                    Some(rusqlite::ErrorCode::ConstraintViolation) => {
                        ChangeError::AlreadyExists(format!("feature {}", id))
                    }
                    _ => e.into(),
                })?;
        }
        Ok(())
    }
}

const SELECT_ASSEMBLY: &str =
    "SELECT id, name, aliases, comments, user_name, created_at FROM assemblies";
const SELECT_REF_SEQ: &str =
    "SELECT id, assembly_id, name, description, length, aliases, chunk_size FROM ref_seqs";
const SELECT_CHANGE: &str = "SELECT sequence, channel_sequence, type_name, assembly_id, changed_ids,
        change, user_name, reverts, created_at FROM change_records";

impl DocumentStore for SqliteStore<'_> {
    fn find_assembly(&self, id: Uuid) -> ChangeResult<Option<Assembly>> {
        Ok(self
            .conn
            .query_row(
                &format!("{} WHERE id = ?", SELECT_ASSEMBLY),
                [id.to_string()],
                assembly_from_row,
            )
            .optional()?)
    }

    fn find_assembly_by_name(&self, name: &str) -> ChangeResult<Option<Assembly>> {
        Ok(self
            .conn
            .query_row(
                &format!("{} WHERE name = ?", SELECT_ASSEMBLY),
                [name],
                assembly_from_row,
            )
            .optional()?)
    }

    fn find_assemblies(&self) -> ChangeResult<Vec<Assembly>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY name", SELECT_ASSEMBLY))?;
        let assemblies = stmt
            .query_map([], assembly_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(assemblies)
    }

    fn create_assembly(&mut self, assembly: &Assembly) -> ChangeResult<()> {
        self.conn.execute(
            "INSERT INTO assemblies (id, name, aliases, comments, user_name, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            (
                assembly.id.to_string(),
                &assembly.name,
                serde_json::to_string(&assembly.aliases)?,
                serde_json::to_string(&assembly.comments)?,
                &assembly.user,
                assembly.created_at.to_rfc3339(),
            ),
        )?;
        Ok(())
    }

    fn delete_assembly(&mut self, id: Uuid) -> ChangeResult<()> {
        let rows = self
            .conn
            .execute("DELETE FROM assemblies WHERE id = ?", [id.to_string()])?;
        if rows == 0 {
            return Err(ChangeError::AssemblyNotFound(id.to_string()));
        }
        Ok(())
    }

    fn find_ref_seq(&self, id: Uuid) -> ChangeResult<Option<RefSeq>> {
        Ok(self
            .conn
            .query_row(
                &format!("{} WHERE id = ?", SELECT_REF_SEQ),
                [id.to_string()],
                ref_seq_from_row,
            )
            .optional()?)
    }

    fn find_ref_seqs(&self, assembly: Uuid) -> ChangeResult<Vec<RefSeq>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE assembly_id = ? ORDER BY rowid",
            SELECT_REF_SEQ
        ))?;
        let ref_seqs = stmt
            .query_map([assembly.to_string()], ref_seq_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ref_seqs)
    }

    fn create_ref_seq(&mut self, ref_seq: &RefSeq) -> ChangeResult<()> {
        self.conn.execute(
            "INSERT INTO ref_seqs (id, assembly_id, name, description, length, aliases, chunk_size)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            (
                ref_seq.id.to_string(),
                ref_seq.assembly.to_string(),
                &ref_seq.name,
                &ref_seq.description,
                ref_seq.length as i64,
                serde_json::to_string(&ref_seq.aliases)?,
                ref_seq.chunk_size as i64,
            ),
        )?;
        Ok(())
    }

    fn update_ref_seq(&mut self, ref_seq: &RefSeq) -> ChangeResult<()> {
        let rows = self.conn.execute(
            "UPDATE ref_seqs SET name = ?, description = ?, length = ?, aliases = ? WHERE id = ?",
            (
                &ref_seq.name,
                &ref_seq.description,
                ref_seq.length as i64,
                serde_json::to_string(&ref_seq.aliases)?,
                ref_seq.id.to_string(),
            ),
        )?;
        if rows == 0 {
            return Err(ChangeError::RefSeqNotFound(ref_seq.id.to_string()));
        }
        Ok(())
    }

    fn create_chunk(&mut self, chunk: &RefSeqChunk) -> ChangeResult<()> {
        self.conn.execute(
            "INSERT INTO ref_seq_chunks (ref_seq_id, n, sequence) VALUES (?, ?, ?)",
            (chunk.ref_seq.to_string(), chunk.n as i64, &chunk.sequence),
        )?;
        Ok(())
    }

    fn find_chunks(&self, ref_seq: Uuid, first: u64, last: u64) -> ChangeResult<Vec<RefSeqChunk>> {
        let mut stmt = self.conn.prepare(
            "SELECT n, sequence FROM ref_seq_chunks
             WHERE ref_seq_id = ? AND n BETWEEN ? AND ? ORDER BY n",
        )?;
        let chunks = stmt
            .query_map((ref_seq.to_string(), first as i64, last as i64), |row| {
                Ok(RefSeqChunk {
                    ref_seq,
                    n: row.get::<_, i64>(0)? as u64,
                    sequence: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chunks)
    }

    fn find_top_level_feature(&self, feature_id: Uuid) -> ChangeResult<Option<AnnotationFeature>> {
        let document: Option<String> = self
            .conn
            .query_row(
                "SELECT f.document FROM feature_ids i
                 JOIN features f ON f.id = i.top_level_id
                 WHERE i.feature_id = ?",
                [feature_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        document
            .map(|d| serde_json::from_str(&d).map_err(ChangeError::from))
            .transpose()
    }

    fn find_features_in_range(
        &self,
        ref_seq: Uuid,
        start: u64,
        end: u64,
    ) -> ChangeResult<Vec<AnnotationFeature>> {
        self.query_features(
            "SELECT document FROM features
             WHERE ref_seq_id = ? AND min < ? AND max > ?
             ORDER BY min, rowid",
            (ref_seq.to_string(), end as i64, start as i64),
        )
    }

    fn search_features(&self, assembly: Uuid, term: &str) -> ChangeResult<Vec<AnnotationFeature>> {
        let features = self.query_features(
            "SELECT f.document FROM features f
             JOIN ref_seqs r ON r.id = f.ref_seq_id
             WHERE r.assembly_id = ?
             ORDER BY f.min, f.rowid",
            [assembly.to_string()],
        )?;
        let term = term.to_lowercase();
        Ok(features
            .into_iter()
            .filter(|feature| mentions(feature, &term))
            .collect())
    }

    fn create_feature(&mut self, feature: &AnnotationFeature) -> ChangeResult<()> {
        self.conn.execute(
            "INSERT INTO features (id, ref_seq_id, min, max, document, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            (
                feature.id.to_string(),
                feature.ref_seq.to_string(),
                feature.min as i64,
                feature.max as i64,
                serde_json::to_string(feature)?,
                Utc::now().to_rfc3339(),
            ),
        )?;
        self.index_feature_ids(feature)
    }

    fn update_feature(&mut self, feature: &AnnotationFeature) -> ChangeResult<()> {
        let rows = self.conn.execute(
            "UPDATE features SET ref_seq_id = ?, min = ?, max = ?, document = ?, updated_at = ?
             WHERE id = ?",
            (
                feature.ref_seq.to_string(),
                feature.min as i64,
                feature.max as i64,
                serde_json::to_string(feature)?,
                Utc::now().to_rfc3339(),
                feature.id.to_string(),
            ),
        )?;
        if rows == 0 {
            return Err(ChangeError::FeatureNotFound(feature.id));
        }
        self.conn.execute(
            "DELETE FROM feature_ids WHERE top_level_id = ?",
            [feature.id.to_string()],
        )?;
        self.index_feature_ids(feature)
    }

    fn delete_feature(&mut self, id: Uuid) -> ChangeResult<()> {
        self.conn
            .execute("DELETE FROM feature_ids WHERE top_level_id = ?", [id.to_string()])?;
        let rows = self
            .conn
            .execute("DELETE FROM features WHERE id = ?", [id.to_string()])?;
        if rows == 0 {
            return Err(ChangeError::FeatureNotFound(id));
        }
        Ok(())
    }

    fn checkpoint(&mut self) -> ChangeResult<()> {
        self.conn.execute_batch("COMMIT; BEGIN IMMEDIATE")?;
        Ok(())
    }
}

/// Whether the type or any attribute value in `feature`'s subtree contains
/// the already lowercased `term`.
fn mentions(feature: &AnnotationFeature, term: &str) -> bool {
    feature.feature_type.to_lowercase().contains(term)
        || feature
            .attributes
            .values()
            .flatten()
            .any(|value| value.to_lowercase().contains(term))
        || feature.children.values().any(|child| mentions(child, term))
}

fn latest_channel_sequence(conn: &Connection, assembly: Uuid) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(channel_sequence), 0) FROM change_records WHERE assembly_id = ?",
        [assembly.to_string()],
        |row| row.get(0),
    )
}

fn assembly_from_row(row: &Row<'_>) -> rusqlite::Result<Assembly> {
    Ok(Assembly {
        id: parse_uuid(row.get::<_, String>(0)?),
        name: row.get(1)?,
        aliases: parse_json(row.get::<_, String>(2)?),
        comments: parse_json(row.get::<_, String>(3)?),
        user: row.get(4)?,
        created_at: parse_datetime(row.get::<_, String>(5)?),
    })
}

fn ref_seq_from_row(row: &Row<'_>) -> rusqlite::Result<RefSeq> {
    Ok(RefSeq {
        id: parse_uuid(row.get::<_, String>(0)?),
        assembly: parse_uuid(row.get::<_, String>(1)?),
        name: row.get(2)?,
        description: row.get(3)?,
        length: row.get::<_, i64>(4)? as u64,
        aliases: parse_json(row.get::<_, String>(5)?),
        chunk_size: row.get::<_, i64>(6)? as u64,
    })
}

fn change_from_row(row: &Row<'_>) -> rusqlite::Result<ChangeRecord> {
    Ok(ChangeRecord {
        sequence: row.get(0)?,
        channel_sequence: row.get(1)?,
        type_name: row.get(2)?,
        assembly: parse_uuid(row.get::<_, String>(3)?),
        changed_ids: parse_json(row.get::<_, String>(4)?),
        change: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
        user: row.get(6)?,
        reverts: row.get(7)?,
        created_at: parse_datetime(row.get::<_, String>(8)?),
    })
}

fn parse_uuid(s: String) -> Uuid {
    Uuid::parse_str(&s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_json<T: serde::de::DeserializeOwned + Default>(s: String) -> T {
    serde_json::from_str(&s).unwrap_or_default()
}

fn parse_datetime(s: String) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
