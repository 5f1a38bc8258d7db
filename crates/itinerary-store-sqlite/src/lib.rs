use std::fs;
use std::path::Path;

use itinerary_core::{
    build_plan_days, merge_plan_days, resequence_plan, CoreError, ItemId, ItemPatch, ItemType,
    Itinerary, ItineraryId, ItineraryItem, TripSource,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS itineraries (
  itinerary_id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  title TEXT NOT NULL,
  source TEXT NOT NULL CHECK (source IN ('manual','suggested','merged')),
  source_ref TEXT,
  plan_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS itinerary_items (
  item_id TEXT PRIMARY KEY,
  itinerary_id TEXT NOT NULL,
  day_index INTEGER NOT NULL CHECK (day_index >= 1),
  position INTEGER NOT NULL CHECK (position >= 0),
  item_type TEXT NOT NULL CHECK (item_type IN ('attraction','restaurant','accommodation','transport','other')),
  title TEXT NOT NULL,
  ref_table TEXT,
  ref_id TEXT,
  notes TEXT,
  start_time TEXT,
  end_time TEXT,
  source TEXT NOT NULL CHECK (source IN ('manual','suggested','merged')),
  source_ref TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (itinerary_id) REFERENCES itineraries(itinerary_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_itineraries_owner ON itineraries(owner_id);
CREATE INDEX IF NOT EXISTS idx_items_itinerary ON itinerary_items(itinerary_id);
CREATE INDEX IF NOT EXISTS idx_items_day_position ON itinerary_items(itinerary_id, day_index, position);
";

const ITEM_COLUMNS: &str = "item_id, itinerary_id, day_index, position, item_type, title, \
                            ref_table, ref_id, notes, start_time, end_time, source, source_ref, \
                            created_at, updated_at";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The entity does not exist, or exists but is not owned by the
    /// requester. The two cases are deliberately indistinguishable.
    #[error("itinerary or item not found, or access denied")]
    NotFoundOrForbidden,
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<CoreError> for StoreError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(message) => Self::Validation(message),
            CoreError::Snapshot(message) => Self::Storage(message),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// An itinerary together with its ordered items and rollup counts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SavedTrip {
    pub itinerary: Itinerary,
    pub items: Vec<ItineraryItem>,
    pub item_count: usize,
    pub day_count: u32,
}

impl SavedTrip {
    fn new(itinerary: Itinerary, items: Vec<ItineraryItem>) -> Self {
        let day_count = items.iter().map(|item| item.day_index).max().unwrap_or(0);
        Self { item_count: items.len(), day_count, itinerary, items }
    }
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open a SQLite-backed itinerary store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when the database cannot be opened
    /// or pragmas cannot be applied.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(|err| {
            StoreError::Storage(format!("failed to open sqlite database at {}: {err}", path.display()))
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|err| StoreError::Storage(format!("failed to configure sqlite pragmas: {err}")))?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when schema metadata cannot be read.
    pub fn schema_status(&self) -> StoreResult<SchemaStatus> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest schema version.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when any migration step fails.
    pub fn migrate(&mut self) -> StoreResult<()> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL)?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(StoreError::Storage(format!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            )));
        }

        Ok(())
    }

    /// Persist a new itinerary with its packed item rows in one
    /// transaction. The `days` of the plan snapshot are derived from the
    /// given items before anything is written, so the committed snapshot
    /// agrees with the item rows from t=0 and no repair pass is needed.
    ///
    /// # Errors
    /// Returns [`StoreError::Validation`] when any item row violates the
    /// ordering invariants, or [`StoreError::Storage`] on write failure.
    pub fn create_itinerary(
        &mut self,
        itinerary: &Itinerary,
        items: &[ItineraryItem],
    ) -> StoreResult<()> {
        for item in items {
            item.validate()?;
        }

        let mut plan = itinerary.plan.clone();
        merge_plan_days(&mut plan, &build_plan_days(items), &rfc3339(itinerary.created_at)?)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO itineraries(
                itinerary_id, owner_id, title, source, source_ref, plan_json, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                itinerary.itinerary_id.to_string(),
                itinerary.owner_id,
                itinerary.title,
                itinerary.source.as_str(),
                itinerary.source_ref,
                serde_json::to_string(&plan)
                    .map_err(|err| StoreError::Storage(format!("failed to serialize plan: {err}")))?,
                rfc3339(itinerary.created_at)?,
                rfc3339(itinerary.updated_at)?,
            ],
        )?;

        for item in items {
            insert_item(&tx, item)?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Append a merge batch of item rows to an existing itinerary.
    /// Existing rows are untouched; ownership must be verified by the
    /// caller before any candidate conversion work starts.
    ///
    /// # Errors
    /// Returns [`StoreError::Validation`] or [`StoreError::Storage`].
    pub fn append_items(&mut self, items: &[ItineraryItem]) -> StoreResult<()> {
        for item in items {
            item.validate()?;
        }

        let tx = self.conn.transaction()?;
        for item in items {
            insert_item(&tx, item)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Load one itinerary with its ordered items, filtered by both id and
    /// owner in the same query.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFoundOrForbidden`] when no row matches.
    pub fn get_itinerary(&self, owner_id: &str, itinerary_id: ItineraryId) -> StoreResult<SavedTrip> {
        let itinerary = self
            .itinerary_row("WHERE itinerary_id = ?1 AND owner_id = ?2", params![
                itinerary_id.to_string(),
                owner_id
            ])?
            .ok_or(StoreError::NotFoundOrForbidden)?;

        let items = self.items_for(itinerary_id)?;
        Ok(SavedTrip::new(itinerary, items))
    }

    /// List all itineraries owned by one user, most recently updated
    /// first, each with its ordered items.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when rows cannot be read.
    pub fn list_itineraries(&self, owner_id: &str) -> StoreResult<Vec<SavedTrip>> {
        let mut stmt = self.conn.prepare(
            "SELECT itinerary_id, owner_id, title, source, source_ref, plan_json, created_at, updated_at
             FROM itineraries
             WHERE owner_id = ?1
             ORDER BY updated_at DESC, itinerary_id ASC",
        )?;

        let mut rows = stmt.query(params![owner_id])?;
        let mut trips = Vec::new();
        while let Some(row) = rows.next()? {
            let itinerary = read_itinerary_row(row)?;
            let items = self.items_for(itinerary.itinerary_id)?;
            trips.push(SavedTrip::new(itinerary, items));
        }
        Ok(trips)
    }

    /// Current maximum day index across an itinerary's items, 0 if none.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when the query fails.
    pub fn max_day_index(&self, itinerary_id: ItineraryId) -> StoreResult<u32> {
        let max: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(day_index), 0) FROM itinerary_items WHERE itinerary_id = ?1",
            params![itinerary_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(u32::try_from(max).unwrap_or(0))
    }

    /// Verify that an itinerary exists and is owned by the requester,
    /// without loading its items. Used to fail fast before merge work.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFoundOrForbidden`] when no row matches.
    pub fn assert_owner(&self, owner_id: &str, itinerary_id: ItineraryId) -> StoreResult<Itinerary> {
        self.itinerary_row("WHERE itinerary_id = ?1 AND owner_id = ?2", params![
            itinerary_id.to_string(),
            owner_id
        ])?
        .ok_or(StoreError::NotFoundOrForbidden)
    }

    /// Apply a partial patch to one item. Guard and write happen in a
    /// single statement: the UPDATE is filtered by item id and an
    /// owner-scoped subquery on the parent itinerary, so a non-owner
    /// affects zero rows and performs zero writes.
    ///
    /// # Errors
    /// Returns [`StoreError::Validation`] for malformed patch fields,
    /// [`StoreError::NotFoundOrForbidden`] when nothing matched.
    pub fn update_item(
        &mut self,
        owner_id: &str,
        item_id: ItemId,
        patch: &ItemPatch,
    ) -> StoreResult<ItineraryItem> {
        patch.validate()?;

        let now = now_rfc3339()?;
        let affected = self.conn.execute(
            "UPDATE itinerary_items SET
                day_index = COALESCE(?1, day_index),
                position = COALESCE(?2, position),
                item_type = COALESCE(?3, item_type),
                title = COALESCE(?4, title),
                ref_table = COALESCE(?5, ref_table),
                ref_id = COALESCE(?6, ref_id),
                notes = COALESCE(?7, notes),
                start_time = COALESCE(?8, start_time),
                end_time = COALESCE(?9, end_time),
                updated_at = ?10
             WHERE item_id = ?11
               AND itinerary_id IN (SELECT itinerary_id FROM itineraries WHERE owner_id = ?12)",
            params![
                patch.day_index.map(i64::from),
                patch.position.map(i64::from),
                patch.item_type.map(ItemType::as_str),
                patch.title,
                patch.ref_table,
                patch.ref_id,
                patch.notes,
                patch.start_time.map(rfc3339).transpose()?,
                patch.end_time.map(rfc3339).transpose()?,
                now,
                item_id.to_string(),
                owner_id,
            ],
        )?;

        if affected == 0 {
            return Err(StoreError::NotFoundOrForbidden);
        }

        self.item_for_owner(owner_id, item_id)
    }

    /// Load one item through an item→itinerary join filtered by both the
    /// item id and the owner id in the same query.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFoundOrForbidden`] when no row matches.
    pub fn item_for_owner(&self, owner_id: &str, item_id: ItemId) -> StoreResult<ItineraryItem> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {columns}
             FROM itinerary_items
             INNER JOIN itineraries USING (itinerary_id)
             WHERE item_id = ?1 AND itineraries.owner_id = ?2",
            columns = qualified_item_columns()
        ))?;

        let item = stmt
            .query_row(params![item_id.to_string(), owner_id], read_item_row)
            .optional()?
            .ok_or(StoreError::NotFoundOrForbidden)?;
        Ok(item)
    }

    /// Delete one item, guarded by an owner-scoped subquery in the DELETE
    /// itself. Returns the owning itinerary id so the caller can
    /// resequence that itinerary's remaining items.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFoundOrForbidden`] when nothing matched.
    pub fn delete_item(&mut self, owner_id: &str, item_id: ItemId) -> StoreResult<ItineraryId> {
        let itinerary_id = self.item_for_owner(owner_id, item_id)?.itinerary_id;

        let affected = self.conn.execute(
            "DELETE FROM itinerary_items
             WHERE item_id = ?1
               AND itinerary_id IN (SELECT itinerary_id FROM itineraries WHERE owner_id = ?2)",
            params![item_id.to_string(), owner_id],
        )?;

        if affected == 0 {
            return Err(StoreError::NotFoundOrForbidden);
        }
        Ok(itinerary_id)
    }

    /// Rename an itinerary, filtered by id and owner in one statement.
    ///
    /// # Errors
    /// Returns [`StoreError::Validation`] for a blank title,
    /// [`StoreError::NotFoundOrForbidden`] when nothing matched.
    pub fn rename_itinerary(
        &mut self,
        owner_id: &str,
        itinerary_id: ItineraryId,
        title: &str,
    ) -> StoreResult<Itinerary> {
        if title.trim().is_empty() {
            return Err(StoreError::Validation("title MUST be non-empty".to_string()));
        }

        let affected = self.conn.execute(
            "UPDATE itineraries SET title = ?1, updated_at = ?2
             WHERE itinerary_id = ?3 AND owner_id = ?4",
            params![title.trim(), now_rfc3339()?, itinerary_id.to_string(), owner_id],
        )?;

        if affected == 0 {
            return Err(StoreError::NotFoundOrForbidden);
        }
        self.assert_owner(owner_id, itinerary_id)
    }

    /// Delete an itinerary and, through the cascade, all its items.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFoundOrForbidden`] when nothing matched.
    pub fn delete_itinerary(&mut self, owner_id: &str, itinerary_id: ItineraryId) -> StoreResult<()> {
        let affected = self.conn.execute(
            "DELETE FROM itineraries WHERE itinerary_id = ?1 AND owner_id = ?2",
            params![itinerary_id.to_string(), owner_id],
        )?;

        if affected == 0 {
            return Err(StoreError::NotFoundOrForbidden);
        }
        Ok(())
    }

    /// Restore position contiguity for every day of one itinerary in a
    /// single pass, writing only the rows whose position changed. Returns
    /// the number of rewritten rows; a second call with no intervening
    /// mutation returns 0.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when reads or writes fail.
    pub fn resequence(&mut self, itinerary_id: ItineraryId) -> StoreResult<usize> {
        let items = self.items_for(itinerary_id)?;
        let fixes = resequence_plan(&items);
        if fixes.is_empty() {
            return Ok(0);
        }

        let now = now_rfc3339()?;
        let tx = self.conn.transaction()?;
        for fix in &fixes {
            tx.execute(
                "UPDATE itinerary_items SET position = ?1, updated_at = ?2 WHERE item_id = ?3",
                params![i64::from(fix.position), now, fix.item_id.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(fixes.len())
    }

    /// Regenerate the plan snapshot's `days` from the current item rows
    /// and persist it, preserving all other top-level plan keys.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFoundOrForbidden`] for an absent
    /// itinerary, [`StoreError::Storage`] on read/write failure.
    pub fn refresh_plan(&mut self, itinerary_id: ItineraryId) -> StoreResult<()> {
        let itinerary = self
            .itinerary_row("WHERE itinerary_id = ?1", params![itinerary_id.to_string()])?
            .ok_or(StoreError::NotFoundOrForbidden)?;

        let items = self.items_for(itinerary_id)?;
        let days = build_plan_days(&items);

        let mut plan = itinerary.plan;
        let now = now_rfc3339()?;
        merge_plan_days(&mut plan, &days, &now)?;

        self.conn.execute(
            "UPDATE itineraries SET plan_json = ?1, updated_at = ?2 WHERE itinerary_id = ?3",
            params![
                serde_json::to_string(&plan)
                    .map_err(|err| StoreError::Storage(format!("failed to serialize plan: {err}")))?,
                now,
                itinerary_id.to_string(),
            ],
        )?;
        Ok(())
    }

    /// All items of one itinerary ordered by the resequencing key.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when rows cannot be read.
    pub fn items_for(&self, itinerary_id: ItineraryId) -> StoreResult<Vec<ItineraryItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS}
             FROM itinerary_items
             WHERE itinerary_id = ?1
             ORDER BY day_index ASC, position ASC, created_at ASC, item_id ASC"
        ))?;

        let mut rows = stmt.query(params![itinerary_id.to_string()])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(read_item_row(row)?);
        }
        Ok(items)
    }

    /// Create a SQLite backup file of the current main database.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when directories cannot be created
    /// or the backup fails.
    pub fn backup_database(&self, out_file: &Path) -> StoreResult<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                StoreError::Storage(format!(
                    "failed to create parent directory for backup file {}: {err}",
                    out_file.display()
                ))
            })?;
        }

        self.conn.backup(DatabaseName::Main, out_file, None).map_err(|err| {
            StoreError::Storage(format!("failed to create sqlite backup at {}: {err}", out_file.display()))
        })
    }

    /// Restore this database from a SQLite backup file, then migrate.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when the file is missing or the
    /// restore or migration fails.
    pub fn restore_database(&mut self, in_file: &Path) -> StoreResult<()> {
        if !in_file.exists() {
            return Err(StoreError::Storage(format!(
                "backup file does not exist: {}",
                in_file.display()
            )));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .map_err(|err| {
                StoreError::Storage(format!(
                    "failed to restore sqlite backup from {}: {err}",
                    in_file.display()
                ))
            })?;

        self.migrate()
    }

    /// Run quick-check, foreign-key-check, and schema status probes.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when any probe query fails.
    pub fn integrity_check(&self) -> StoreResult<IntegrityReport> {
        let quick_check_message: String =
            self.conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;

        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn itinerary_row(
        &self,
        filter: &str,
        filter_params: impl rusqlite::Params,
    ) -> StoreResult<Option<Itinerary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT itinerary_id, owner_id, title, source, source_ref, plan_json, created_at, updated_at
             FROM itineraries {filter}"
        ))?;
        let itinerary = stmt.query_row(filter_params, read_itinerary_row).optional()?;
        Ok(itinerary)
    }
}

fn qualified_item_columns() -> String {
    ITEM_COLUMNS
        .split(", ")
        .map(|column| format!("itinerary_items.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_item(tx: &rusqlite::Transaction<'_>, item: &ItineraryItem) -> StoreResult<()> {
    tx.execute(
        &format!("INSERT INTO itinerary_items({ITEM_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"),
        params![
            item.item_id.to_string(),
            item.itinerary_id.to_string(),
            i64::from(item.day_index),
            i64::from(item.position),
            item.item_type.as_str(),
            item.title,
            item.ref_table,
            item.ref_id,
            item.notes,
            item.start_time.map(rfc3339).transpose()?,
            item.end_time.map(rfc3339).transpose()?,
            item.source.as_str(),
            item.source_ref,
            rfc3339(item.created_at)?,
            rfc3339(item.updated_at)?,
        ],
    )?;
    Ok(())
}

fn read_itinerary_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Itinerary> {
    let itinerary_id_raw: String = row.get(0)?;
    let source_raw: String = row.get(3)?;
    let plan_raw: String = row.get(5)?;
    let created_raw: String = row.get(6)?;
    let updated_raw: String = row.get(7)?;

    Ok(Itinerary {
        itinerary_id: ItineraryId(parse_ulid(0, &itinerary_id_raw)?),
        owner_id: row.get(1)?,
        title: row.get(2)?,
        source: TripSource::parse(&source_raw)
            .ok_or_else(|| conversion_error(3, format!("unknown source: {source_raw}")))?,
        source_ref: row.get(4)?,
        plan: serde_json::from_str(&plan_raw)
            .map_err(|err| conversion_error(5, format!("invalid plan JSON: {err}")))?,
        created_at: parse_rfc3339(6, &created_raw)?,
        updated_at: parse_rfc3339(7, &updated_raw)?,
    })
}

fn read_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItineraryItem> {
    let item_id_raw: String = row.get(0)?;
    let itinerary_id_raw: String = row.get(1)?;
    let item_type_raw: String = row.get(4)?;
    let start_raw: Option<String> = row.get(9)?;
    let end_raw: Option<String> = row.get(10)?;
    let source_raw: String = row.get(11)?;
    let created_raw: String = row.get(13)?;
    let updated_raw: String = row.get(14)?;

    Ok(ItineraryItem {
        item_id: ItemId(parse_ulid(0, &item_id_raw)?),
        itinerary_id: ItineraryId(parse_ulid(1, &itinerary_id_raw)?),
        day_index: row.get::<_, u32>(2)?,
        position: row.get::<_, u32>(3)?,
        item_type: ItemType::parse(&item_type_raw)
            .ok_or_else(|| conversion_error(4, format!("unknown item_type: {item_type_raw}")))?,
        title: row.get(5)?,
        ref_table: row.get(6)?,
        ref_id: row.get(7)?,
        notes: row.get(8)?,
        start_time: start_raw.as_deref().map(|raw| parse_rfc3339(9, raw)).transpose()?,
        end_time: end_raw.as_deref().map(|raw| parse_rfc3339(10, raw)).transpose()?,
        source: TripSource::parse(&source_raw)
            .ok_or_else(|| conversion_error(11, format!("unknown source: {source_raw}")))?,
        source_ref: row.get(12)?,
        created_at: parse_rfc3339(13, &created_raw)?,
        updated_at: parse_rfc3339(14, &updated_raw)?,
    })
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_ulid(column: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|err| conversion_error(column, format!("invalid ULID {raw}: {err}")))
}

fn parse_rfc3339(column: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .map_err(|err| conversion_error(column, format!("invalid RFC3339 timestamp {raw}: {err}")))
}

fn current_schema_version(conn: &Connection) -> StoreResult<i64> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> StoreResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )?;
    Ok(())
}

fn now_rfc3339() -> StoreResult<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> StoreResult<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Storage(format!("failed to format RFC3339 timestamp: {err}")))
}
