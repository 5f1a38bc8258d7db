use std::path::PathBuf;

use itinerary_core::{
    pack_candidates, ItemId, ItemPatch, Itinerary, ItineraryId, ItineraryItem, PlacedCandidate,
    TripSource, TripSuggestion,
};
use itinerary_store_sqlite::{IntegrityReport, SavedTrip, SchemaStatus, SqliteStore, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

pub type ApiResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SaveTripRequest {
    pub owner_id: String,
    pub suggestion: TripSuggestion,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeTripRequest {
    pub owner_id: String,
    pub itinerary_id: ItineraryId,
    pub suggestion: TripSuggestion,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateItemRequest {
    pub owner_id: String,
    pub item_id: ItemId,
    pub patch: ItemPatch,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PlanExportFormat {
    Json,
    Csv,
}

impl PlanExportFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanExport {
    pub itinerary_id: ItineraryId,
    pub title: String,
    pub format: PlanExportFormat,
    pub body: String,
    pub digest: String,
}

/// Operation facade shared by the HTTP service and the CLI. Every call
/// opens the store fresh, so a single database file can be shared by
/// both frontends without coordination.
#[derive(Debug, Clone)]
pub struct ItineraryPlannerApi {
    db_path: PathBuf,
}

impl ItineraryPlannerApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> ApiResult<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> ApiResult<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> ApiResult<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run integrity probes against the database file.
    ///
    /// # Errors
    /// Returns an error when a probe query fails.
    pub fn integrity_check(&self) -> ApiResult<IntegrityReport> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.integrity_check()
    }

    /// Persist a generated suggestion as a new itinerary. Highlights and
    /// enriched places become positioned items packed from day 1; the
    /// create transaction derives the plan snapshot from that same
    /// conversion output, so itinerary and items are consistent from
    /// creation with no repair pass.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn save_trip(&self, input: SaveTripRequest) -> ApiResult<SavedTrip> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let now = OffsetDateTime::now_utc();
        let itinerary = Itinerary {
            itinerary_id: ItineraryId::new(),
            owner_id: input.owner_id.clone(),
            title: input.suggestion.display_title(),
            source: TripSource::Suggested,
            source_ref: None,
            plan: input.suggestion.initial_plan(),
            created_at: now,
            updated_at: now,
        };

        let placements = pack_candidates(&input.suggestion.candidates(), 1);
        let items =
            items_from_placements(itinerary.itinerary_id, &placements, TripSource::Suggested, now);

        store.create_itinerary(&itinerary, &items)?;
        store.get_itinerary(&input.owner_id, itinerary.itinerary_id)
    }

    /// Merge a suggestion into an existing itinerary. New items are packed
    /// starting at the day after the current maximum, so existing rows are
    /// never repositioned. Ownership is checked before any conversion work.
    ///
    /// # Errors
    /// Returns an error when the itinerary is missing or foreign-owned, or
    /// persistence fails.
    pub fn merge_trip(&self, input: MergeTripRequest) -> ApiResult<SavedTrip> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.assert_owner(&input.owner_id, input.itinerary_id)?;

        let start_day = store.max_day_index(input.itinerary_id)? + 1;
        let now = OffsetDateTime::now_utc();
        let placements = pack_candidates(&input.suggestion.candidates(), start_day);
        let items =
            items_from_placements(input.itinerary_id, &placements, TripSource::Merged, now);

        store.append_items(&items)?;
        store.refresh_plan(input.itinerary_id)?;
        store.get_itinerary(&input.owner_id, input.itinerary_id)
    }

    /// Apply a partial patch to one item, then restore ordering and the
    /// plan snapshot for the owning itinerary. The returned item reflects
    /// its post-resequence position.
    ///
    /// # Errors
    /// Returns an error when the patch is invalid, the item is missing or
    /// foreign-owned, or persistence fails.
    pub fn update_item(&self, input: UpdateItemRequest) -> ApiResult<ItineraryItem> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let updated = store.update_item(&input.owner_id, input.item_id, &input.patch)?;
        store.resequence(updated.itinerary_id)?;
        store.refresh_plan(updated.itinerary_id)?;
        store.item_for_owner(&input.owner_id, input.item_id)
    }

    /// Delete one item, then close the position gap it left and refresh
    /// the plan snapshot. Returns the owning itinerary id.
    ///
    /// # Errors
    /// Returns an error when the item is missing or foreign-owned, or
    /// persistence fails.
    pub fn delete_item(&self, owner_id: &str, item_id: ItemId) -> ApiResult<ItineraryId> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let itinerary_id = store.delete_item(owner_id, item_id)?;
        store.resequence(itinerary_id)?;
        store.refresh_plan(itinerary_id)?;
        Ok(itinerary_id)
    }

    /// Restore position contiguity for one itinerary. Safe to re-invoke
    /// at any time; an unknown itinerary simply has zero rows to fix.
    ///
    /// # Errors
    /// Returns an error when reads or writes fail.
    pub fn resequence(&self, itinerary_id: ItineraryId) -> ApiResult<usize> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.resequence(itinerary_id)
    }

    /// Regenerate the plan snapshot from the current item rows.
    ///
    /// # Errors
    /// Returns an error when the itinerary is absent or persistence fails.
    pub fn refresh_plan(&self, itinerary_id: ItineraryId) -> ApiResult<()> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.refresh_plan(itinerary_id)
    }

    /// Rename an itinerary. The plan snapshot keeps its own title field.
    ///
    /// # Errors
    /// Returns an error for a blank title, a missing or foreign-owned
    /// itinerary, or persistence failure.
    pub fn rename_trip(
        &self,
        owner_id: &str,
        itinerary_id: ItineraryId,
        title: &str,
    ) -> ApiResult<Itinerary> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.rename_itinerary(owner_id, itinerary_id, title)
    }

    /// Delete an itinerary and all its items.
    ///
    /// # Errors
    /// Returns an error when the itinerary is missing or foreign-owned.
    pub fn delete_trip(&self, owner_id: &str, itinerary_id: ItineraryId) -> ApiResult<()> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.delete_itinerary(owner_id, itinerary_id)
    }

    /// Fetch one itinerary with its ordered items.
    ///
    /// # Errors
    /// Returns an error when it is missing or foreign-owned.
    pub fn get_trip(&self, owner_id: &str, itinerary_id: ItineraryId) -> ApiResult<SavedTrip> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.get_itinerary(owner_id, itinerary_id)
    }

    /// List all itineraries owned by one user, most recently updated first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_trips(&self, owner_id: &str) -> ApiResult<Vec<SavedTrip>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_itineraries(owner_id)
    }

    /// Render one itinerary's plan as a portable document with a content
    /// digest, for sharing outside the application.
    ///
    /// # Errors
    /// Returns an error when the itinerary is missing or foreign-owned, or
    /// serialization fails.
    pub fn export_plan(
        &self,
        owner_id: &str,
        itinerary_id: ItineraryId,
        format: PlanExportFormat,
    ) -> ApiResult<PlanExport> {
        let trip = self.get_trip(owner_id, itinerary_id)?;

        let body = match format {
            PlanExportFormat::Json => serde_json::to_string_pretty(&trip.itinerary.plan)
                .map_err(|err| StoreError::Storage(format!("failed to serialize plan: {err}")))?,
            PlanExportFormat::Csv => render_plan_csv(&trip.items)?,
        };

        Ok(PlanExport {
            itinerary_id,
            title: trip.itinerary.title,
            format,
            digest: content_digest(&body),
            body,
        })
    }
}

fn items_from_placements(
    itinerary_id: ItineraryId,
    placements: &[PlacedCandidate],
    source: TripSource,
    now: OffsetDateTime,
) -> Vec<ItineraryItem> {
    placements
        .iter()
        .map(|placed| ItineraryItem {
            item_id: ItemId::new(),
            itinerary_id,
            day_index: placed.day_index,
            position: placed.position,
            item_type: placed.item_type,
            title: placed.title.clone(),
            ref_table: placed.ref_id.as_ref().map(|_| "real_places".to_string()),
            ref_id: placed.ref_id.clone(),
            notes: None,
            start_time: None,
            end_time: None,
            source,
            source_ref: Some(placed.source_ref.clone()),
            created_at: now,
            updated_at: now,
        })
        .collect()
}

const CSV_HEADER: &str = "day_index,position,item_type,title,notes,start_time,end_time,source,source_ref";

fn render_plan_csv(items: &[ItineraryItem]) -> ApiResult<String> {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for item in items {
        let start = item.start_time.map(rfc3339).transpose()?.unwrap_or_default();
        let end = item.end_time.map(rfc3339).transpose()?.unwrap_or_default();
        let row = [
            item.day_index.to_string(),
            item.position.to_string(),
            item.item_type.as_str().to_string(),
            csv_field(&item.title),
            csv_field(item.notes.as_deref().unwrap_or_default()),
            start,
            end,
            item.source.as_str().to_string(),
            csv_field(item.source_ref.as_deref().unwrap_or_default()),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    Ok(out)
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn rfc3339(value: OffsetDateTime) -> ApiResult<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Storage(format!("failed to format RFC3339 timestamp: {err}")))
}

fn content_digest(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    let digest = hasher.finalize();
    format!("sha256:{digest:x}")
}
