use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

/// Packing density for suggestion-to-item conversion: candidates are laid
/// out three to a day, in the order given. Documented contract, not a
/// tuning knob.
pub const ITEMS_PER_DAY: u32 = 3;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("plan snapshot error: {0}")]
    Snapshot(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ItineraryId(pub Ulid);

impl ItineraryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Default for ItineraryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ItineraryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ItemId(pub Ulid);

impl ItemId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Attraction,
    Restaurant,
    Accommodation,
    Transport,
    Other,
}

impl ItemType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Attraction => "attraction",
            Self::Restaurant => "restaurant",
            Self::Accommodation => "accommodation",
            Self::Transport => "transport",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "attraction" => Some(Self::Attraction),
            "restaurant" => Some(Self::Restaurant),
            "accommodation" => Some(Self::Accommodation),
            "transport" => Some(Self::Transport),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TripSource {
    Manual,
    Suggested,
    Merged,
}

impl TripSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Suggested => "suggested",
            Self::Merged => "merged",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Self::Manual),
            "suggested" => Some(Self::Suggested),
            "merged" => Some(Self::Merged),
            _ => None,
        }
    }
}

/// Ordered keyword rules for title classification. Precedence is the rule
/// order: accommodation, then restaurant, then transport; anything
/// unmatched is an attraction (museums, parks, landmarks).
const TYPE_RULES: &[(ItemType, &[&str])] = &[
    (ItemType::Accommodation, &["hotel", "hostel", "resort", "lodge"]),
    (ItemType::Restaurant, &["restaurant", "cafe", "bar", "food"]),
    (ItemType::Transport, &["airport", "bus", "train", "transport"]),
];

/// Classify a candidate title by case-insensitive substring match against
/// the ordered rule table. First matching category wins.
#[must_use]
pub fn infer_item_type(title: &str) -> ItemType {
    let lowered = title.to_lowercase();
    for (item_type, keywords) in TYPE_RULES {
        if keywords.iter().any(|keyword| lowered.contains(keyword)) {
            return *item_type;
        }
    }
    ItemType::Attraction
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItineraryItem {
    pub item_id: ItemId,
    pub itinerary_id: ItineraryId,
    pub day_index: u32,
    pub position: u32,
    pub item_type: ItemType,
    pub title: String,
    pub ref_table: Option<String>,
    pub ref_id: Option<String>,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub source: TripSource,
    pub source_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ItineraryItem {
    /// Validate one item row against the ordering-key invariants.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the day index is not 1-based
    /// or the title is blank.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.day_index == 0 {
            return Err(CoreError::Validation("day_index MUST be >= 1".to_string()));
        }
        if self.title.trim().is_empty() {
            return Err(CoreError::Validation("title MUST be non-empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Itinerary {
    pub itinerary_id: ItineraryId,
    pub owner_id: String,
    pub title: String,
    pub source: TripSource,
    pub source_ref: Option<String>,
    /// Denormalized snapshot of the items grouped by day. Always present,
    /// always regenerable from the item rows; never a source of truth.
    pub plan: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Partial update for one item. `None` fields stay untouched.
///
/// A patch can set an optional field but cannot clear one back to empty:
/// `None` always means "leave as is", never "erase". Clearing a stored
/// value would need an explicit unset operation, which this type does not
/// carry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ItemPatch {
    pub day_index: Option<u32>,
    pub position: Option<u32>,
    pub item_type: Option<ItemType>,
    pub title: Option<String>,
    pub ref_table: Option<String>,
    pub ref_id: Option<String>,
    pub notes: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
}

impl ItemPatch {
    /// Reject malformed patch fields before any write reaches the store.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] for a zero day index or a blank
    /// title.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.day_index == Some(0) {
            return Err(CoreError::Validation("day_index MUST be >= 1".to_string()));
        }
        if let Some(title) = &self.title {
            if title.trim().is_empty() {
                return Err(CoreError::Validation("title MUST be non-empty".to_string()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EstimatedBudget {
    pub low: u32,
    pub high: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RealPlace {
    pub title: String,
    pub link: Option<String>,
    pub source: Option<String>,
    pub place_id: Option<String>,
    pub rating: Option<f32>,
    pub address: Option<String>,
    pub photo_url: Option<String>,
}

/// One generated trip suggestion: free-text highlights plus enriched
/// real-world places, as produced by the upstream suggestion generator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TripSuggestion {
    pub destination: String,
    pub country: String,
    pub description: String,
    pub best_time_to_visit: String,
    pub estimated_budget: EstimatedBudget,
    #[serde(default)]
    pub highlights: Vec<String>,
    #[serde(default)]
    pub travel_style: Vec<String>,
    pub duration: String,
    #[serde(default)]
    pub real_places: Vec<RealPlace>,
}

impl TripSuggestion {
    #[must_use]
    pub fn display_title(&self) -> String {
        format!("{}, {}", self.destination, self.country)
    }

    /// Flatten the suggestion into an ordered candidate list: highlights
    /// first, then enriched places, each carrying its provenance tag.
    #[must_use]
    pub fn candidates(&self) -> Vec<Candidate> {
        let mut candidates = Vec::with_capacity(self.highlights.len() + self.real_places.len());
        for (index, highlight) in self.highlights.iter().enumerate() {
            candidates.push(Candidate {
                title: highlight.clone(),
                ref_id: None,
                source_ref: format!("highlight_{index}"),
            });
        }
        for (index, place) in self.real_places.iter().enumerate() {
            candidates.push(Candidate {
                title: place.title.clone(),
                ref_id: place.place_id.clone(),
                source_ref: format!("real_place_{index}"),
            });
        }
        candidates
    }

    /// Build the initial plan snapshot for a fresh itinerary: suggestion
    /// metadata plus an empty `days` array. The plan is never null.
    #[must_use]
    pub fn initial_plan(&self) -> Value {
        serde_json::json!({
            "title": self.display_title(),
            "description": self.description,
            "duration": self.duration,
            "best_time_to_visit": self.best_time_to_visit,
            "estimated_budget": { "low": self.estimated_budget.low, "high": self.estimated_budget.high },
            "highlights": self.highlights,
            "travel_style": self.travel_style,
            "real_places": self.real_places,
            "days": [],
        })
    }
}

/// An unplaced suggestion entry awaiting conversion into a positioned item.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Candidate {
    pub title: String,
    pub ref_id: Option<String>,
    pub source_ref: String,
}

/// A candidate with its assigned ordering key and inferred type.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlacedCandidate {
    pub day_index: u32,
    pub position: u32,
    pub item_type: ItemType,
    pub title: String,
    pub ref_id: Option<String>,
    pub source_ref: String,
}

/// Pack candidates into days at the fixed density, starting at
/// `start_day` (1 for a fresh itinerary, `max_day + 1` for a merge).
/// Iteration order is the order given; the resulting positions are
/// contiguous per day from creation, so no resequencing pass is needed.
#[must_use]
pub fn pack_candidates(candidates: &[Candidate], start_day: u32) -> Vec<PlacedCandidate> {
    candidates
        .iter()
        .enumerate()
        .map(|(index, candidate)| {
            let index = u32::try_from(index).unwrap_or(u32::MAX);
            PlacedCandidate {
                day_index: start_day + index / ITEMS_PER_DAY,
                position: index % ITEMS_PER_DAY,
                item_type: infer_item_type(&candidate.title),
                title: candidate.title.clone(),
                ref_id: candidate.ref_id.clone(),
                source_ref: candidate.source_ref.clone(),
            }
        })
        .collect()
}

/// One minimal position write produced by resequencing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct PositionFix {
    pub item_id: ItemId,
    pub day_index: u32,
    pub position: u32,
}

fn resequence_order(lhs: &ItineraryItem, rhs: &ItineraryItem) -> Ordering {
    lhs.day_index
        .cmp(&rhs.day_index)
        .then_with(|| lhs.position.cmp(&rhs.position))
        .then_with(|| lhs.created_at.cmp(&rhs.created_at))
        .then_with(|| lhs.item_id.cmp(&rhs.item_id))
}

/// Compute the position writes that restore contiguity for every day of
/// one itinerary. Items are ordered by `(day_index, position, created_at,
/// item_id)`, so when two rows transiently share a position mid-drag the
/// older insertion keeps the earlier slot. Each day's positions are then
/// reassigned to `0..n-1`. Only rows whose stored position differs appear
/// in the output, so a second call with no intervening mutation returns
/// nothing.
#[must_use]
pub fn resequence_plan(items: &[ItineraryItem]) -> Vec<PositionFix> {
    let mut ordered: Vec<&ItineraryItem> = items.iter().collect();
    ordered.sort_by(|lhs, rhs| resequence_order(lhs, rhs));

    let mut fixes = Vec::new();
    let mut current_day: Option<u32> = None;
    let mut next_position = 0_u32;

    for item in ordered {
        if current_day != Some(item.day_index) {
            current_day = Some(item.day_index);
            next_position = 0;
        }
        if item.position != next_position {
            fixes.push(PositionFix {
                item_id: item.item_id,
                day_index: item.day_index,
                position: next_position,
            });
        }
        next_position += 1;
    }

    fixes
}

/// Fixed projection of item fields carried into the plan snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanItemSummary {
    pub id: ItemId,
    pub position: u32,
    pub item_type: ItemType,
    pub title: String,
    pub notes: Option<String>,
    pub ref_table: Option<String>,
    pub ref_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub source: TripSource,
    pub source_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanDay {
    pub day_index: u32,
    pub items: Vec<PlanItemSummary>,
}

fn summarize(item: &ItineraryItem) -> PlanItemSummary {
    PlanItemSummary {
        id: item.item_id,
        position: item.position,
        item_type: item.item_type,
        title: item.title.clone(),
        notes: item.notes.clone(),
        ref_table: item.ref_table.clone(),
        ref_id: item.ref_id.clone(),
        start_time: item.start_time,
        end_time: item.end_time,
        source: item.source,
        source_ref: item.source_ref.clone(),
    }
}

/// Project authoritative item rows into the snapshot `days` array,
/// ascending by day index, items ordered by position within each day.
/// A day with zero items is simply absent. Pure function `items -> plan`;
/// the snapshot is regenerated, never hand-patched.
#[must_use]
pub fn build_plan_days(items: &[ItineraryItem]) -> Vec<PlanDay> {
    let mut ordered: Vec<&ItineraryItem> = items.iter().collect();
    ordered.sort_by(|lhs, rhs| resequence_order(lhs, rhs));

    let mut days: Vec<PlanDay> = Vec::new();
    for item in ordered {
        match days.last_mut() {
            Some(day) if day.day_index == item.day_index => day.items.push(summarize(item)),
            _ => days.push(PlanDay { day_index: item.day_index, items: vec![summarize(item)] }),
        }
    }
    days
}

/// Merge regenerated `days` into an existing plan snapshot, replacing
/// only the `days` key and the `last_updated` timestamp. Every other
/// top-level key (suggestion metadata carried from generation time)
/// stays untouched.
///
/// # Errors
/// Returns [`CoreError::Snapshot`] when the days cannot be serialized.
pub fn merge_plan_days(plan: &mut Value, days: &[PlanDay], last_updated: &str) -> Result<(), CoreError> {
    let days_value = serde_json::to_value(days)
        .map_err(|err| CoreError::Snapshot(format!("failed to serialize plan days: {err}")))?;

    if !plan.is_object() {
        *plan = Value::Object(serde_json::Map::new());
    }
    if let Some(object) = plan.as_object_mut() {
        object.insert("days".to_string(), days_value);
        object.insert("last_updated".to_string(), Value::String(last_updated.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use time::Duration;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn mk_candidate(title: &str) -> Candidate {
        Candidate { title: title.to_string(), ref_id: None, source_ref: "fixture".to_string() }
    }

    fn mk_item(
        itinerary_id: ItineraryId,
        day_index: u32,
        position: u32,
        created_offset_secs: i64,
    ) -> ItineraryItem {
        ItineraryItem {
            item_id: ItemId::new(),
            itinerary_id,
            day_index,
            position,
            item_type: ItemType::Attraction,
            title: format!("item d{day_index} p{position}"),
            ref_table: None,
            ref_id: None,
            notes: None,
            start_time: None,
            end_time: None,
            source: TripSource::Suggested,
            source_ref: None,
            created_at: fixture_time() + Duration::seconds(created_offset_secs),
            updated_at: fixture_time() + Duration::seconds(created_offset_secs),
        }
    }

    fn mk_suggestion(highlights: &[&str]) -> TripSuggestion {
        TripSuggestion {
            destination: "Lisbon".to_string(),
            country: "Portugal".to_string(),
            description: "Coastal capital".to_string(),
            best_time_to_visit: "Spring".to_string(),
            estimated_budget: EstimatedBudget { low: 800, high: 1500 },
            highlights: highlights.iter().map(ToString::to_string).collect(),
            travel_style: vec!["city".to_string()],
            duration: "5 days".to_string(),
            real_places: Vec::new(),
        }
    }

    fn apply_fixes(items: &mut [ItineraryItem], fixes: &[PositionFix]) {
        for fix in fixes {
            for item in items.iter_mut() {
                if item.item_id == fix.item_id {
                    item.day_index = fix.day_index;
                    item.position = fix.position;
                }
            }
        }
    }

    fn assert_contiguous(items: &[ItineraryItem]) {
        let mut days: Vec<u32> = items.iter().map(|item| item.day_index).collect();
        days.sort_unstable();
        days.dedup();
        for day in days {
            let mut positions: Vec<u32> = items
                .iter()
                .filter(|item| item.day_index == day)
                .map(|item| item.position)
                .collect();
            positions.sort_unstable();
            let expected: Vec<u32> = (0..u32::try_from(positions.len()).unwrap_or(u32::MAX)).collect();
            assert_eq!(positions, expected, "day {day} positions are not contiguous");
        }
    }

    #[test]
    fn classifier_matches_fixed_keyword_order() {
        assert_eq!(infer_item_type("Airport Transfer"), ItemType::Transport);
        assert_eq!(infer_item_type("Beachside Resort"), ItemType::Accommodation);
        assert_eq!(infer_item_type("City Walking Tour"), ItemType::Attraction);
        assert_eq!(infer_item_type("Rooftop Bar"), ItemType::Restaurant);
        assert_eq!(infer_item_type("STREET FOOD MARKET"), ItemType::Restaurant);
    }

    #[test]
    fn classifier_prefers_accommodation_over_later_rules() {
        // "Hotel" and "bar" both match; rule order decides.
        assert_eq!(infer_item_type("Hotel Bar Lounge"), ItemType::Accommodation);
    }

    #[test]
    fn packing_five_candidates_fills_two_days() {
        let candidates: Vec<Candidate> =
            (0..5).map(|index| mk_candidate(&format!("Viewpoint {index}"))).collect();
        let placed = pack_candidates(&candidates, 1);

        let keys: Vec<(u32, u32)> =
            placed.iter().map(|entry| (entry.day_index, entry.position)).collect();
        assert_eq!(keys, vec![(1, 0), (1, 1), (1, 2), (2, 0), (2, 1)]);
    }

    #[test]
    fn packing_empty_candidate_list_is_legal() {
        assert!(pack_candidates(&[], 1).is_empty());
    }

    #[test]
    fn packing_for_merge_starts_after_existing_days() {
        let candidates: Vec<Candidate> =
            (0..4).map(|index| mk_candidate(&format!("Museum {index}"))).collect();
        let placed = pack_candidates(&candidates, 4);

        let keys: Vec<(u32, u32)> =
            placed.iter().map(|entry| (entry.day_index, entry.position)).collect();
        assert_eq!(keys, vec![(4, 0), (4, 1), (4, 2), (5, 0)]);
    }

    #[test]
    fn candidates_keep_highlights_before_real_places() {
        let mut suggestion = mk_suggestion(&["Alfama district"]);
        suggestion.real_places.push(RealPlace {
            title: "Time Out Market Restaurant".to_string(),
            link: None,
            source: Some("Google".to_string()),
            place_id: Some("place-1".to_string()),
            rating: Some(4.6),
            address: None,
            photo_url: None,
        });

        let candidates = suggestion.candidates();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].source_ref, "highlight_0");
        assert_eq!(candidates[1].source_ref, "real_place_0");
        assert_eq!(candidates[1].ref_id.as_deref(), Some("place-1"));
    }

    #[test]
    fn initial_plan_has_empty_days_and_suggestion_metadata() {
        let plan = mk_suggestion(&["Belem Tower"]).initial_plan();
        assert_eq!(plan.get("title").and_then(Value::as_str), Some("Lisbon, Portugal"));
        assert_eq!(plan.get("days").and_then(Value::as_array).map(Vec::len), Some(0));
        assert!(plan.get("estimated_budget").is_some());
    }

    #[test]
    fn resequence_closes_gap_left_by_deletion() {
        let itinerary_id = ItineraryId::new();
        // Day 1 lost its middle item; day 2 is untouched.
        let items = vec![
            mk_item(itinerary_id, 1, 0, 0),
            mk_item(itinerary_id, 1, 2, 2),
            mk_item(itinerary_id, 2, 0, 3),
            mk_item(itinerary_id, 2, 1, 4),
        ];

        let fixes = resequence_plan(&items);
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].item_id, items[1].item_id);
        assert_eq!(fixes[0].day_index, 1);
        assert_eq!(fixes[0].position, 1);
    }

    #[test]
    fn resequence_is_idempotent() {
        let itinerary_id = ItineraryId::new();
        let mut items = vec![
            mk_item(itinerary_id, 1, 5, 0),
            mk_item(itinerary_id, 1, 9, 1),
            mk_item(itinerary_id, 3, 2, 2),
        ];

        let first = resequence_plan(&items);
        assert!(!first.is_empty());
        apply_fixes(&mut items, &first);
        assert_contiguous(&items);

        let second = resequence_plan(&items);
        assert!(second.is_empty(), "second pass must produce zero writes");
    }

    #[test]
    fn resequence_breaks_position_collisions_by_creation_order() {
        let itinerary_id = ItineraryId::new();
        let older = mk_item(itinerary_id, 1, 0, 0);
        let newer = mk_item(itinerary_id, 1, 0, 60);
        let items = vec![newer.clone(), older.clone()];

        let fixes = resequence_plan(&items);
        // The older insertion keeps slot 0; the newer row moves to 1.
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].item_id, newer.item_id);
        assert_eq!(fixes[0].position, 1);
    }

    #[test]
    fn resequence_covers_every_day_in_one_pass() {
        let itinerary_id = ItineraryId::new();
        let mut items = vec![
            mk_item(itinerary_id, 2, 1, 0),
            mk_item(itinerary_id, 1, 4, 1),
            mk_item(itinerary_id, 2, 7, 2),
        ];

        let fixes = resequence_plan(&items);
        apply_fixes(&mut items, &fixes);
        assert_contiguous(&items);
    }

    #[test]
    fn plan_days_group_by_day_ascending() {
        let itinerary_id = ItineraryId::new();
        let items = vec![
            mk_item(itinerary_id, 2, 0, 2),
            mk_item(itinerary_id, 1, 1, 1),
            mk_item(itinerary_id, 1, 0, 0),
        ];

        let days = build_plan_days(&items);
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].day_index, 1);
        assert_eq!(days[0].items.len(), 2);
        assert_eq!(days[0].items[0].position, 0);
        assert_eq!(days[0].items[1].position, 1);
        assert_eq!(days[1].day_index, 2);
        assert_eq!(days[1].items.len(), 1);
    }

    #[test]
    fn plan_days_skip_empty_days_without_error() {
        assert!(build_plan_days(&[]).is_empty());
    }

    #[test]
    fn merge_plan_days_preserves_unrelated_metadata() {
        let mut plan = serde_json::json!({
            "title": "Lisbon, Portugal",
            "estimated_budget": { "low": 800, "high": 1500 },
            "highlights": ["Belem Tower"],
            "days": [],
        });
        let itinerary_id = ItineraryId::new();
        let items = vec![mk_item(itinerary_id, 1, 0, 0)];

        let days = build_plan_days(&items);
        match merge_plan_days(&mut plan, &days, "2026-01-01T00:00:00Z") {
            Ok(()) => {}
            Err(err) => panic!("merge should succeed: {err}"),
        }

        assert_eq!(plan.get("title").and_then(Value::as_str), Some("Lisbon, Portugal"));
        assert_eq!(
            plan.get("highlights").and_then(Value::as_array).map(Vec::len),
            Some(1)
        );
        assert_eq!(plan.get("days").and_then(Value::as_array).map(Vec::len), Some(1));
        assert_eq!(
            plan.get("last_updated").and_then(Value::as_str),
            Some("2026-01-01T00:00:00Z")
        );
    }

    #[test]
    fn merge_plan_days_is_stable_without_item_changes() {
        let itinerary_id = ItineraryId::new();
        let items = vec![mk_item(itinerary_id, 1, 0, 0), mk_item(itinerary_id, 1, 1, 1)];
        let days = build_plan_days(&items);

        let mut first = serde_json::json!({ "title": "Trip" });
        let mut second = serde_json::json!({ "title": "Trip" });
        match merge_plan_days(&mut first, &days, "t1") {
            Ok(()) => {}
            Err(err) => panic!("merge should succeed: {err}"),
        }
        match merge_plan_days(&mut second, &days, "t2") {
            Ok(()) => {}
            Err(err) => panic!("merge should succeed: {err}"),
        }

        assert_eq!(first.get("days"), second.get("days"));
    }

    #[test]
    fn item_patch_rejects_zero_day_index() {
        let patch = ItemPatch { day_index: Some(0), ..ItemPatch::default() };
        match patch.validate() {
            Ok(()) => panic!("expected validation error"),
            Err(err) => assert!(err.to_string().contains("day_index MUST be >= 1")),
        }
    }

    #[test]
    fn item_patch_rejects_blank_title() {
        let patch = ItemPatch { title: Some("   ".to_string()), ..ItemPatch::default() };
        match patch.validate() {
            Ok(()) => panic!("expected validation error"),
            Err(err) => assert!(err.to_string().contains("title MUST be non-empty")),
        }
    }

    #[test]
    fn item_validate_rejects_zero_day_index() {
        let mut item = mk_item(ItineraryId::new(), 1, 0, 0);
        item.day_index = 0;
        match item.validate() {
            Ok(()) => panic!("expected validation error"),
            Err(err) => assert!(err.to_string().contains("day_index")),
        }
    }

    proptest! {
        #[test]
        fn packing_is_always_contiguous(count in 0_usize..40, start_day in 1_u32..6) {
            let candidates: Vec<Candidate> =
                (0..count).map(|index| mk_candidate(&format!("Stop {index}"))).collect();
            let placed = pack_candidates(&candidates, start_day);

            prop_assert_eq!(placed.len(), count);
            let mut days: Vec<u32> = placed.iter().map(|entry| entry.day_index).collect();
            days.sort_unstable();
            days.dedup();
            for day in days {
                let mut positions: Vec<u32> = placed
                    .iter()
                    .filter(|entry| entry.day_index == day)
                    .map(|entry| entry.position)
                    .collect();
                positions.sort_unstable();
                let len = u32::try_from(positions.len()).unwrap_or(u32::MAX);
                prop_assert_eq!(positions, (0..len).collect::<Vec<u32>>());
            }
        }

        #[test]
        fn resequence_restores_contiguity_from_arbitrary_state(
            keys in proptest::collection::vec((1_u32..5, 0_u32..10), 0..25)
        ) {
            let itinerary_id = ItineraryId::new();
            let mut items: Vec<ItineraryItem> = keys
                .iter()
                .enumerate()
                .map(|(index, (day, position))| {
                    mk_item(itinerary_id, *day, *position, i64::try_from(index).unwrap_or(0))
                })
                .collect();

            let fixes = resequence_plan(&items);
            apply_fixes(&mut items, &fixes);

            let mut days: Vec<u32> = items.iter().map(|item| item.day_index).collect();
            days.sort_unstable();
            days.dedup();
            for day in days {
                let mut positions: Vec<u32> = items
                    .iter()
                    .filter(|item| item.day_index == day)
                    .map(|item| item.position)
                    .collect();
                positions.sort_unstable();
                let len = u32::try_from(positions.len()).unwrap_or(u32::MAX);
                prop_assert_eq!(positions, (0..len).collect::<Vec<u32>>());
            }

            let second = resequence_plan(&items);
            prop_assert!(second.is_empty());
        }
    }
}
