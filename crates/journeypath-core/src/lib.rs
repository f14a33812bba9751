use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

/// Separator between touchpoint labels in a rendered path.
pub const PATH_SEPARATOR: &str = " > ";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AttributionError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("segmentation error: {0}")]
    Segmentation(String),
    #[error("source error: {0}")]
    Source(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttributionField {
    Medium,
    Source,
    Campaign,
    ChannelGroup,
}

/// One step in a dimension's fallback chain: read a raw attribution
/// field, or substitute a fixed label.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStep {
    Field(AttributionField),
    Literal(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DimensionSpec {
    pub name: String,
    pub fallback: Vec<FallbackStep>,
}

/// Versioned attribution configuration: reporting window, journey gap
/// threshold, and the dimensions to project paths onto.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributionRuleset {
    pub ruleset_version: u32,
    pub lookback_days: u32,
    pub gap_days: u32,
    pub dimensions: Vec<DimensionSpec>,
}

impl AttributionRuleset {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            ruleset_version: 1,
            lookback_days: 5,
            gap_days: 15,
            dimensions: reference_dimensions(),
        }
    }

    /// Validates window, gap, and dimension fallback invariants.
    ///
    /// # Errors
    /// Returns [`AttributionError::Configuration`] when one or more
    /// fields are absent, non-positive, or a fallback chain cannot
    /// guarantee a label.
    pub fn validate(&self) -> Result<(), AttributionError> {
        if self.ruleset_version == 0 {
            return Err(AttributionError::Configuration(
                "ruleset_version MUST be >= 1".to_string(),
            ));
        }

        if self.lookback_days == 0 {
            return Err(AttributionError::Configuration(
                "lookback_days MUST be >= 1".to_string(),
            ));
        }

        if self.gap_days == 0 {
            return Err(AttributionError::Configuration(
                "gap_days MUST be >= 1".to_string(),
            ));
        }

        if self.dimensions.is_empty() {
            return Err(AttributionError::Configuration(
                "at least one attribution dimension MUST be configured".to_string(),
            ));
        }

        let mut seen = Vec::with_capacity(self.dimensions.len());
        for dimension in &self.dimensions {
            if dimension.name.trim().is_empty() {
                return Err(AttributionError::Configuration(
                    "dimension name MUST NOT be blank".to_string(),
                ));
            }

            if seen.contains(&dimension.name.as_str()) {
                return Err(AttributionError::Configuration(format!(
                    "duplicate dimension name: {}",
                    dimension.name
                )));
            }
            seen.push(dimension.name.as_str());

            for step in &dimension.fallback {
                if let FallbackStep::Literal(label) = step {
                    if label.trim().is_empty() {
                        return Err(AttributionError::Configuration(format!(
                            "dimension {} has a blank literal fallback",
                            dimension.name
                        )));
                    }
                }
            }

            // A terminal literal is what makes touchpoint resolution total.
            match dimension.fallback.last() {
                Some(FallbackStep::Literal(_)) => {}
                Some(FallbackStep::Field(_)) | None => {
                    return Err(AttributionError::Configuration(format!(
                        "fallback chain for dimension {} MUST end in a literal",
                        dimension.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Decodes and validates a ruleset from JSON.
    ///
    /// # Errors
    /// Returns [`AttributionError::Configuration`] when JSON decoding
    /// fails or decoded values violate ruleset constraints.
    pub fn from_json(value: &Value) -> Result<Self, AttributionError> {
        let ruleset: Self = serde_json::from_value(value.clone()).map_err(|err| {
            AttributionError::Configuration(format!("invalid ruleset JSON payload: {err}"))
        })?;
        ruleset.validate()?;
        Ok(ruleset)
    }
}

fn reference_dimensions() -> Vec<DimensionSpec> {
    vec![
        DimensionSpec {
            name: "medium".to_string(),
            fallback: vec![
                FallbackStep::Field(AttributionField::Medium),
                FallbackStep::Field(AttributionField::ChannelGroup),
                FallbackStep::Literal("Direct".to_string()),
            ],
        },
        DimensionSpec {
            name: "source".to_string(),
            fallback: vec![
                FallbackStep::Field(AttributionField::Source),
                FallbackStep::Literal("Direct".to_string()),
            ],
        },
        DimensionSpec {
            name: "campaign".to_string(),
            fallback: vec![
                FallbackStep::Field(AttributionField::Campaign),
                FallbackStep::Literal("Unspecified".to_string()),
            ],
        },
        DimensionSpec {
            name: "channel_group".to_string(),
            fallback: vec![
                FallbackStep::Field(AttributionField::ChannelGroup),
                FallbackStep::Literal("Direct".to_string()),
            ],
        },
    ]
}

/// One engaged session fact, normalized and ordered for segmentation.
///
/// `session_seq` is the ingestion sequence number and the deterministic
/// tiebreak when two sessions share `(session_date, event_time)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_seq: i64,
    pub session_id: Ulid,
    pub user_id: String,
    pub session_date: Date,
    pub event_time: OffsetDateTime,
    pub membership: bool,
    pub medium: Option<String>,
    pub source: Option<String>,
    pub campaign: Option<String>,
    pub channel_group: Option<String>,
}

impl SessionRecord {
    #[must_use]
    pub fn attribution_value(&self, field: AttributionField) -> Option<&str> {
        match field {
            AttributionField::Medium => self.medium.as_deref(),
            AttributionField::Source => self.source.as_deref(),
            AttributionField::Campaign => self.campaign.as_deref(),
            AttributionField::ChannelGroup => self.channel_group.as_deref(),
        }
    }

    fn order_key(&self) -> (Date, OffsetDateTime, i64) {
        (self.session_date, self.event_time, self.session_seq)
    }
}

/// A session annotated with its journey assignment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentedSession {
    pub session: SessionRecord,
    pub journey_index: u32,
    pub conversion_occurred: bool,
}

/// A maximal contiguous run of one user's sessions between boundary
/// events. Derived and ephemeral; only its path counts persist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Journey {
    pub user_id: String,
    pub journey_index: u32,
    pub converted: bool,
    pub sessions: Vec<SessionRecord>,
}

/// Assigns a journey index and conversion flag to every session of a
/// single user's ordered stream.
///
/// Conversion is a rising-edge detector on membership: it fires only on
/// a false-to-true transition, never while membership stays true. A new
/// journey opens at the first session, when the calendar gap reaches
/// `gap_days`, or on the session immediately after a conversion; a
/// session matching several rules still opens exactly one journey.
///
/// # Errors
/// Returns [`AttributionError::Segmentation`] when the slice mixes
/// users or is not strictly ordered by
/// `(session_date, event_time, session_seq)`.
pub fn segment_sessions(
    sessions: &[SessionRecord],
    gap_days: u32,
) -> Result<Vec<SegmentedSession>, AttributionError> {
    if gap_days == 0 {
        return Err(AttributionError::Configuration(
            "gap_days MUST be >= 1".to_string(),
        ));
    }

    let Some(first) = sessions.first() else {
        return Ok(Vec::new());
    };

    let mut segmented = Vec::with_capacity(sessions.len());
    let mut previous: Option<&SessionRecord> = None;
    let mut previous_membership = false;
    let mut previous_converted = false;
    let mut journey_index = 0_u32;

    for session in sessions {
        if session.user_id != first.user_id {
            return Err(AttributionError::Segmentation(
                "segmentation input MUST contain a single user stream".to_string(),
            ));
        }

        if let Some(prev) = previous {
            if session.order_key() <= prev.order_key() {
                return Err(AttributionError::Segmentation(format!(
                    "sessions MUST be strictly ordered by (session_date, event_time, session_seq); \
                     session {} arrived after {}",
                    session.session_id, prev.session_id
                )));
            }
        }

        let conversion_occurred = session.membership && !previous_membership;
        let new_journey = match previous {
            None => true,
            Some(prev) => {
                previous_converted
                    || gap_between(prev.session_date, session.session_date)
                        >= i64::from(gap_days)
            }
        };

        if new_journey {
            journey_index += 1;
        }

        segmented.push(SegmentedSession {
            session: session.clone(),
            journey_index,
            conversion_occurred,
        });

        previous_membership = session.membership;
        previous_converted = conversion_occurred;
        previous = Some(session);
    }

    Ok(segmented)
}

fn gap_between(earlier: Date, later: Date) -> i64 {
    (later - earlier).whole_days()
}

/// Seals segmented sessions into journeys. Input must come from
/// [`segment_sessions`], so journey indexes are contiguous runs.
#[must_use]
pub fn group_journeys(segmented: &[SegmentedSession]) -> Vec<Journey> {
    let mut journeys: Vec<Journey> = Vec::new();

    for item in segmented {
        let open_new = match journeys.last() {
            Some(journey) => journey.journey_index != item.journey_index,
            None => true,
        };
        if open_new {
            journeys.push(Journey {
                user_id: item.session.user_id.clone(),
                journey_index: item.journey_index,
                converted: false,
                sessions: Vec::new(),
            });
        }

        if let Some(journey) = journeys.last_mut() {
            journey.converted |= item.conversion_occurred;
            journey.sessions.push(item.session.clone());
        }
    }

    journeys
}

/// Resolves the touchpoint label for one session under one dimension
/// by walking the fallback chain in declared order.
///
/// # Errors
/// Returns [`AttributionError::Configuration`] when the chain resolves
/// no label; [`AttributionRuleset::validate`] rules this out for any
/// chain with a terminal literal.
pub fn resolve_touchpoint(
    dimension: &DimensionSpec,
    session: &SessionRecord,
) -> Result<String, AttributionError> {
    for step in &dimension.fallback {
        match step {
            FallbackStep::Field(field) => {
                if let Some(value) = session.attribution_value(*field) {
                    return Ok(value.to_string());
                }
            }
            FallbackStep::Literal(label) => return Ok(label.clone()),
        }
    }

    Err(AttributionError::Configuration(format!(
        "fallback chain for dimension {} resolved no label",
        dimension.name
    )))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PathKey {
    pub dimension: String,
    pub path: String,
}

impl Display for PathKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dimension, self.path)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PathCounts {
    pub conversions: u64,
    pub non_conversions: u64,
}

/// Partial aggregate keyed by `(dimension, path)`. Merging is a plain
/// sum, so partials from parallel workers combine in any order.
pub type PathTotals = BTreeMap<PathKey, PathCounts>;

/// Output row: one distinct path per dimension with its conversion and
/// non-conversion journey counts.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PathRecord {
    pub dimension: String,
    pub path: String,
    pub conversion_count: u64,
    pub non_conversion_count: u64,
}

/// Projects one user's journeys onto every configured dimension and
/// buckets each journey's path by its conversion flag.
///
/// # Errors
/// Returns [`AttributionError::Configuration`] when a fallback chain
/// resolves no label.
pub fn aggregate_user(
    journeys: &[Journey],
    dimensions: &[DimensionSpec],
) -> Result<PathTotals, AttributionError> {
    let mut totals = PathTotals::new();

    for journey in journeys {
        for dimension in dimensions {
            let mut labels = Vec::with_capacity(journey.sessions.len());
            for session in &journey.sessions {
                labels.push(resolve_touchpoint(dimension, session)?);
            }

            let key = PathKey {
                dimension: dimension.name.clone(),
                path: labels.join(PATH_SEPARATOR),
            };
            let counts = totals.entry(key).or_default();
            if journey.converted {
                counts.conversions += 1;
            } else {
                counts.non_conversions += 1;
            }
        }
    }

    Ok(totals)
}

/// Sums `from` into `into`. Commutative and associative.
pub fn merge_counts(into: &mut PathTotals, from: PathTotals) {
    for (key, counts) in from {
        let merged = into.entry(key).or_default();
        merged.conversions += counts.conversions;
        merged.non_conversions += counts.non_conversions;
    }
}

/// Renders path totals in presentation order: dimension ascending,
/// then conversion count descending, then non-conversion count
/// descending, then path ascending for a stable output.
#[must_use]
pub fn sorted_path_records(totals: &PathTotals) -> Vec<PathRecord> {
    let mut records: Vec<PathRecord> = totals
        .iter()
        .map(|(key, counts)| PathRecord {
            dimension: key.dimension.clone(),
            path: key.path.clone(),
            conversion_count: counts.conversions,
            non_conversion_count: counts.non_conversions,
        })
        .collect();

    records.sort_by(|lhs, rhs| {
        lhs.dimension
            .cmp(&rhs.dimension)
            .then_with(|| rhs.conversion_count.cmp(&lhs.conversion_count))
            .then_with(|| rhs.non_conversion_count.cmp(&lhs.non_conversion_count))
            .then_with(|| lhs.path.cmp(&rhs.path))
    });

    records
}

/// Segments, projects, and aggregates every user stream, fanning out
/// across users and reducing partial totals with [`merge_counts`].
///
/// # Errors
/// Returns [`AttributionError::Configuration`] for an invalid ruleset
/// and [`AttributionError::Segmentation`] for an unordered stream.
pub fn project_paths(
    users: &BTreeMap<String, Vec<SessionRecord>>,
    ruleset: &AttributionRuleset,
) -> Result<PathTotals, AttributionError> {
    ruleset.validate()?;

    users
        .par_iter()
        .map(|(_, sessions)| {
            let segmented = segment_sessions(sessions, ruleset.gap_days)?;
            let journeys = group_journeys(&segmented);
            aggregate_user(&journeys, &ruleset.dimensions)
        })
        .try_reduce(PathTotals::new, |mut left, right| {
            merge_counts(&mut left, right);
            Ok(left)
        })
}

/// Inclusive calendar window of session dates admitted to a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct DateWindow {
    pub start: Date,
    pub end: Date,
}

/// One windowed load of engaged session streams, grouped per user and
/// ordered by the composite key, plus the count of source rows dropped
/// for missing identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionBatch {
    pub users: BTreeMap<String, Vec<SessionRecord>>,
    pub dropped_records: usize,
}

/// Read-only seam over the session-fact source, injectable so tests
/// substitute synthetic streams for the warehouse table.
pub trait SessionSource {
    /// Loads engaged sessions whose `session_date` falls inside the
    /// window.
    ///
    /// # Errors
    /// Returns [`AttributionError::Source`] when the source cannot be
    /// read; per-record malformations are dropped and counted instead.
    fn load_engaged_sessions(&self, window: DateWindow) -> Result<SessionBatch, AttributionError>;
}

/// Fully materialized result of one attribution pass, before
/// publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributionOutcome {
    pub window: DateWindow,
    pub user_count: usize,
    pub session_count: usize,
    pub dropped_records: usize,
    pub totals: PathTotals,
}

/// Computes `[as_of - lookback_days, as_of]`.
///
/// # Errors
/// Returns [`AttributionError::Configuration`] when `lookback_days` is
/// zero or the window start underflows the calendar range.
pub fn lookback_window(as_of: Date, lookback_days: u32) -> Result<DateWindow, AttributionError> {
    if lookback_days == 0 {
        return Err(AttributionError::Configuration(
            "lookback_days MUST be >= 1".to_string(),
        ));
    }

    let start = as_of
        .checked_sub(Duration::days(i64::from(lookback_days)))
        .ok_or_else(|| {
            AttributionError::Configuration(format!(
                "lookback window underflows the calendar: {as_of} - {lookback_days} days"
            ))
        })?;

    Ok(DateWindow { start, end: as_of })
}

/// Runs the whole pipeline against a source: window, load, segment,
/// project, aggregate. Nothing is published here; a caller that
/// persists results owns the transactional replace.
///
/// # Errors
/// Propagates configuration, source, and segmentation failures; no
/// partial totals are returned on any of them.
pub fn run_attribution<S: SessionSource + ?Sized>(
    source: &S,
    as_of: Date,
    ruleset: &AttributionRuleset,
) -> Result<AttributionOutcome, AttributionError> {
    ruleset.validate()?;

    let window = lookback_window(as_of, ruleset.lookback_days)?;
    let batch = source.load_engaged_sessions(window)?;
    let session_count = batch.users.values().map(Vec::len).sum();
    let totals = project_paths(&batch.users, ruleset)?;

    Ok(AttributionOutcome {
        window,
        user_count: batch.users.len(),
        session_count,
        dropped_records: batch.dropped_records,
        totals,
    })
}

/// Collapses a raw attribution string to a present label: trimmed,
/// with empty and whitespace-only values treated as absent.
#[must_use]
pub fn normalize_label(raw: Option<&str>) -> Option<String> {
    match raw {
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        None => None,
    }
}

/// Parses a `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [`AttributionError::Validation`] when parsing fails.
pub fn parse_date(value: &str) -> Result<Date, AttributionError> {
    Date::parse(value, format_description!("[year]-[month]-[day]"))
        .map_err(|err| AttributionError::Validation(format!("invalid calendar date {value}: {err}")))
}

/// Formats a calendar date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`AttributionError::Validation`] when formatting fails.
pub fn format_date(value: Date) -> Result<String, AttributionError> {
    value
        .format(format_description!("[year]-[month]-[day]"))
        .map_err(|err| AttributionError::Validation(format!("failed to format date: {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`AttributionError::Validation`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, AttributionError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AttributionError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(AttributionError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AttributionError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, AttributionError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            AttributionError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
