//! Core domain model and field precedence rules for platform/well sync.

use std::fmt;

use chrono::{DateTime, Datelike, Timelike, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "aemsync-core";

/// `VARCHAR(255)` name columns, counted in characters.
pub const MAX_NAME_CHARS: usize = 255;

/// `NUMERIC(19, 10)` coordinate columns.
pub const COORDINATE_SCALE: u32 = 10;
const COORDINATE_INTEGER_DIGITS: u32 = 9;

/// Unrecognized upstream fields, carried along untouched.
pub type ExtraFields = serde_json::Map<String, serde_json::Value>;

/// Incoming platform as decoded from an API payload. Every field is optional.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformRecord {
    pub id: Option<i64>,
    pub unique_name: Option<String>,
    pub latitude: Option<Decimal>,
    pub longitude: Option<Decimal>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub wells: Vec<WellRecord>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: ExtraFields,
}

impl PlatformRecord {
    /// Id usable as a merge key (positive ids only).
    pub fn merge_key(&self) -> Option<i64> {
        positive_id(self.id)
    }

    /// Name used in log lines; falls back to the raw id.
    pub fn display_name(&self) -> String {
        display_label(self.unique_name.as_deref(), self.id)
    }
}

/// Incoming well nested under a platform record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WellRecord {
    pub id: Option<i64>,
    pub platform_id: Option<i64>,
    pub unique_name: Option<String>,
    pub latitude: Option<Decimal>,
    pub longitude: Option<Decimal>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: ExtraFields,
}

impl WellRecord {
    pub fn merge_key(&self) -> Option<i64> {
        positive_id(self.id)
    }

    pub fn display_name(&self) -> String {
        display_label(self.unique_name.as_deref(), self.id)
    }
}

/// Persisted platform row. `id` is assigned upstream, never generated locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub id: i64,
    pub unique_name: String,
    pub latitude: Option<Decimal>,
    pub longitude: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted well row, owned by exactly one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Well {
    pub id: i64,
    pub platform_id: i64,
    pub unique_name: String,
    pub latitude: Option<Decimal>,
    pub longitude: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Platform,
    Well,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Platform => f.write_str("platform"),
            EntityKind::Well => f.write_str("well"),
        }
    }
}

/// A record that cannot become a persisted entity. Never fatal to a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordRejected {
    #[error("{kind} record has no usable id")]
    MissingId { kind: EntityKind },
    #[error("{kind} {id} has no unique name")]
    MissingName { kind: EntityKind, id: i64 },
    #[error("well {well_id} has no resolvable platform id")]
    MissingPlatformId { well_id: i64 },
    #[error("well {well_id} references unknown platform {platform_id}")]
    UnknownPlatform { well_id: i64, platform_id: i64 },
    #[error("{kind} {id} name is {chars} characters long (limit {MAX_NAME_CHARS})")]
    NameTooLong { kind: EntityKind, id: i64, chars: usize },
    #[error("{kind} {id} {field} {value} does not fit NUMERIC(19, 10)")]
    CoordinateOutOfRange {
        kind: EntityKind,
        id: i64,
        field: &'static str,
        value: Decimal,
    },
}

/// Treats zero and negative ids as absent.
pub fn positive_id(id: Option<i64>) -> Option<i64> {
    id.filter(|id| *id > 0)
}

/// Upstream emits `0001-01-01T00:00:00` (`DateTime.MinValue` on the API side)
/// for "no value"; rows serialized from a zeroed Unix time arrive as the epoch.
/// Both count as absent.
pub fn is_unset_timestamp(ts: &DateTime<Utc>) -> bool {
    let year_one_midnight =
        ts.year() == 1 && ts.ordinal() == 1 && ts.num_seconds_from_midnight() == 0;
    year_one_midnight || ts.timestamp() == 0
}

/// Round to the stored scale the way Postgres does, so a merged value compares
/// equal to what a later load returns.
pub fn scale_coordinate(value: Option<Decimal>) -> Option<Decimal> {
    value.map(|v| v.round_dp_with_strategy(COORDINATE_SCALE, RoundingStrategy::MidpointAwayFromZero))
}

/// True when `value` is storable in a `NUMERIC(19, 10)` column unchanged.
pub fn coordinate_fits(value: &Decimal) -> bool {
    let limit = Decimal::from(10i64.pow(COORDINATE_INTEGER_DIGITS));
    value.scale() <= COORDINATE_SCALE && value.abs() < limit
}

fn check_columns(
    kind: EntityKind,
    id: i64,
    name: &str,
    latitude: Option<Decimal>,
    longitude: Option<Decimal>,
) -> Result<(), RecordRejected> {
    let chars = name.chars().count();
    if chars > MAX_NAME_CHARS {
        return Err(RecordRejected::NameTooLong { kind, id, chars });
    }
    for (field, value) in [("latitude", latitude), ("longitude", longitude)] {
        if let Some(value) = value.filter(|v| !coordinate_fits(v)) {
            return Err(RecordRejected::CoordinateOutOfRange {
                kind,
                id,
                field,
                value,
            });
        }
    }
    Ok(())
}

pub fn effective_timestamp(ts: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    ts.filter(|ts| !is_unset_timestamp(ts))
}

fn non_blank(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn display_label(name: Option<&str>, id: Option<i64>) -> String {
    match (non_blank(name), id) {
        (Some(name), _) => name,
        (None, Some(id)) => format!("#{id}"),
        (None, None) => "<unnamed>".to_string(),
    }
}

fn overwrite_if_present<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
    if let Some(value) = incoming {
        *slot = Some(value.clone());
    }
}

/// Primary updated timestamp, then the secondary last-update field, then `now`.
pub fn resolve_updated_at(
    updated_at: Option<DateTime<Utc>>,
    last_update: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    effective_timestamp(updated_at)
        .or_else(|| effective_timestamp(last_update))
        .unwrap_or(now)
}

/// Merge an incoming platform into the persisted one, or build a new platform.
///
/// Names and coordinates only overwrite when the incoming value is present, so a
/// sparse update never blanks stored data. `created_at` is fixed at creation.
/// Coordinates are rounded to the stored scale and the result must fit the
/// table's column limits.
pub fn merge_platform(
    existing: Option<&Platform>,
    incoming: &PlatformRecord,
    now: DateTime<Utc>,
) -> Result<Platform, RecordRejected> {
    let name = non_blank(incoming.unique_name.as_deref());
    let latitude = scale_coordinate(incoming.latitude);
    let longitude = scale_coordinate(incoming.longitude);
    let updated_at = resolve_updated_at(incoming.updated_at, incoming.last_update, now);

    let merged = match existing {
        Some(current) => {
            let mut merged = current.clone();
            if let Some(name) = name {
                merged.unique_name = name;
            }
            overwrite_if_present(&mut merged.latitude, &latitude);
            overwrite_if_present(&mut merged.longitude, &longitude);
            merged.updated_at = updated_at;
            merged
        }
        None => {
            let id = incoming.merge_key().ok_or(RecordRejected::MissingId {
                kind: EntityKind::Platform,
            })?;
            let unique_name = name.ok_or(RecordRejected::MissingName {
                kind: EntityKind::Platform,
                id,
            })?;
            Platform {
                id,
                unique_name,
                latitude,
                longitude,
                created_at: effective_timestamp(incoming.created_at).unwrap_or(now),
                updated_at,
            }
        }
    };

    check_columns(
        EntityKind::Platform,
        merged.id,
        &merged.unique_name,
        merged.latitude,
        merged.longitude,
    )?;
    Ok(merged)
}

/// Merge an incoming well. The owning platform resolves as: incoming
/// `platformId`, else the stored one, else (new wells only) the enclosing
/// platform's id.
pub fn merge_well(
    existing: Option<&Well>,
    incoming: &WellRecord,
    fallback_platform_id: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Well, RecordRejected> {
    let name = non_blank(incoming.unique_name.as_deref());
    let latitude = scale_coordinate(incoming.latitude);
    let longitude = scale_coordinate(incoming.longitude);
    let updated_at = resolve_updated_at(incoming.updated_at, incoming.last_update, now);
    let incoming_platform = positive_id(incoming.platform_id);

    let merged = match existing {
        Some(current) => {
            let platform_id = incoming_platform
                .or_else(|| positive_id(Some(current.platform_id)))
                .ok_or(RecordRejected::MissingPlatformId {
                    well_id: current.id,
                })?;
            let mut merged = current.clone();
            merged.platform_id = platform_id;
            if let Some(name) = name {
                merged.unique_name = name;
            }
            overwrite_if_present(&mut merged.latitude, &latitude);
            overwrite_if_present(&mut merged.longitude, &longitude);
            merged.updated_at = updated_at;
            merged
        }
        None => {
            let id = incoming.merge_key().ok_or(RecordRejected::MissingId {
                kind: EntityKind::Well,
            })?;
            let platform_id = incoming_platform
                .or_else(|| positive_id(fallback_platform_id))
                .ok_or(RecordRejected::MissingPlatformId { well_id: id })?;
            let unique_name = name.ok_or(RecordRejected::MissingName {
                kind: EntityKind::Well,
                id,
            })?;
            Well {
                id,
                platform_id,
                unique_name,
                latitude,
                longitude,
                created_at: effective_timestamp(incoming.created_at).unwrap_or(now),
                updated_at,
            }
        }
    };

    check_columns(
        EntityKind::Well,
        merged.id,
        &merged.unique_name,
        merged.latitude,
        merged.longitude,
    )?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).single().unwrap()
    }

    fn stored_platform() -> Platform {
        Platform {
            id: 1,
            unique_name: "P1".into(),
            latitude: Some(Decimal::from_str("4.1234567890").unwrap()),
            longitude: Some(Decimal::from_str("113.0000000001").unwrap()),
            created_at: ts(2024, 1, 1),
            updated_at: ts(2024, 1, 2),
        }
    }

    fn stored_well() -> Well {
        Well {
            id: 10,
            platform_id: 1,
            unique_name: "W1".into(),
            latitude: None,
            longitude: None,
            created_at: ts(2024, 1, 1),
            updated_at: ts(2024, 1, 2),
        }
    }

    #[test]
    fn blank_or_absent_name_never_overwrites() {
        let now = ts(2025, 6, 1);
        for name in [None, Some(String::new()), Some("   ".to_string())] {
            let incoming = PlatformRecord {
                id: Some(1),
                unique_name: name,
                ..Default::default()
            };
            let merged = merge_platform(Some(&stored_platform()), &incoming, now).unwrap();
            assert_eq!(merged.unique_name, "P1");
        }
    }

    #[test]
    fn present_name_and_coordinates_overwrite() {
        let incoming = PlatformRecord {
            id: Some(1),
            unique_name: Some("P1-renamed".into()),
            latitude: Some(Decimal::from_str("-0.0000000001").unwrap()),
            ..Default::default()
        };
        let merged = merge_platform(Some(&stored_platform()), &incoming, ts(2025, 6, 1)).unwrap();
        assert_eq!(merged.unique_name, "P1-renamed");
        assert_eq!(merged.latitude.unwrap().to_string(), "-0.0000000001");
        assert_eq!(merged.longitude, stored_platform().longitude);
        assert_eq!(merged.created_at, stored_platform().created_at);
    }

    #[test]
    fn new_platform_without_timestamps_uses_now() {
        let now = Utc::now();
        let incoming = PlatformRecord {
            id: Some(7),
            unique_name: Some("P7".into()),
            ..Default::default()
        };
        let merged = merge_platform(None, &incoming, now).unwrap();
        assert_eq!(merged.updated_at, now);
        assert_eq!(merged.created_at, now);
        assert!(merged.latitude.is_none());
    }

    #[test]
    fn updated_at_falls_back_to_last_update_and_skips_default_values() {
        let unset = Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap();
        let incoming = PlatformRecord {
            id: Some(1),
            updated_at: Some(unset),
            last_update: Some(ts(2025, 3, 3)),
            ..Default::default()
        };
        let merged = merge_platform(Some(&stored_platform()), &incoming, ts(2025, 6, 1)).unwrap();
        assert_eq!(merged.updated_at, ts(2025, 3, 3));

        let incoming = PlatformRecord {
            id: Some(1),
            updated_at: Some(ts(2025, 4, 4)),
            last_update: Some(ts(2025, 3, 3)),
            ..Default::default()
        };
        let merged = merge_platform(Some(&stored_platform()), &incoming, ts(2025, 6, 1)).unwrap();
        assert_eq!(merged.updated_at, ts(2025, 4, 4));
    }

    #[test]
    fn created_at_is_never_altered_on_update() {
        let incoming = PlatformRecord {
            id: Some(1),
            created_at: Some(ts(2030, 1, 1)),
            ..Default::default()
        };
        let merged = merge_platform(Some(&stored_platform()), &incoming, ts(2025, 6, 1)).unwrap();
        assert_eq!(merged.created_at, ts(2024, 1, 1));
    }

    #[test]
    fn new_platform_requires_positive_id_and_name() {
        let now = ts(2025, 6, 1);
        let no_id = PlatformRecord {
            id: Some(0),
            unique_name: Some("P0".into()),
            ..Default::default()
        };
        assert_eq!(
            merge_platform(None, &no_id, now),
            Err(RecordRejected::MissingId {
                kind: EntityKind::Platform
            })
        );
        let no_name = PlatformRecord {
            id: Some(3),
            ..Default::default()
        };
        assert_eq!(
            merge_platform(None, &no_name, now),
            Err(RecordRejected::MissingName {
                kind: EntityKind::Platform,
                id: 3
            })
        );
    }

    #[test]
    fn well_platform_id_precedence() {
        let now = ts(2025, 6, 1);
        let explicit = WellRecord {
            id: Some(10),
            platform_id: Some(2),
            ..Default::default()
        };
        assert_eq!(
            merge_well(Some(&stored_well()), &explicit, Some(5), now)
                .unwrap()
                .platform_id,
            2
        );

        let zero = WellRecord {
            id: Some(10),
            platform_id: Some(0),
            ..Default::default()
        };
        assert_eq!(
            merge_well(Some(&stored_well()), &zero, Some(5), now)
                .unwrap()
                .platform_id,
            1
        );

        let fresh = WellRecord {
            id: Some(11),
            unique_name: Some("W11".into()),
            ..Default::default()
        };
        assert_eq!(merge_well(None, &fresh, Some(5), now).unwrap().platform_id, 5);
    }

    #[test]
    fn well_without_any_platform_id_is_rejected() {
        let orphan = WellRecord {
            id: Some(12),
            unique_name: Some("W12".into()),
            ..Default::default()
        };
        assert_eq!(
            merge_well(None, &orphan, None, ts(2025, 6, 1)),
            Err(RecordRejected::MissingPlatformId { well_id: 12 })
        );
        assert_eq!(
            merge_well(None, &orphan, Some(-4), ts(2025, 6, 1)),
            Err(RecordRejected::MissingPlatformId { well_id: 12 })
        );
    }

    #[test]
    fn well_update_keeps_name_and_coordinates_when_sparse() {
        let mut stored = stored_well();
        stored.latitude = Some(Decimal::from_str("1.5").unwrap());
        let incoming = WellRecord {
            id: Some(10),
            unique_name: Some(String::new()),
            last_update: Some(ts(2025, 2, 2)),
            ..Default::default()
        };
        let merged = merge_well(Some(&stored), &incoming, None, ts(2025, 6, 1)).unwrap();
        assert_eq!(merged.unique_name, "W1");
        assert_eq!(merged.latitude, stored.latitude);
        assert_eq!(merged.updated_at, ts(2025, 2, 2));
    }

    #[test]
    fn unset_timestamps_are_detected() {
        assert!(is_unset_timestamp(&Utc.timestamp_opt(0, 0).unwrap()));
        assert!(is_unset_timestamp(
            &Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap()
        ));
        assert!(!is_unset_timestamp(&ts(2024, 1, 1)));
    }

    #[test]
    fn display_name_prefers_name_over_id() {
        let record = PlatformRecord {
            id: Some(9),
            ..Default::default()
        };
        assert_eq!(record.display_name(), "#9");
        let record = WellRecord {
            unique_name: Some(" W9 ".into()),
            ..Default::default()
        };
        assert_eq!(record.display_name(), "W9");
    }

    #[test]
    fn coordinates_are_rounded_to_stored_scale() {
        let incoming = PlatformRecord {
            id: Some(7),
            unique_name: Some("P7".into()),
            latitude: Some(Decimal::from_str("4.123456789012345").unwrap()),
            longitude: Some(Decimal::from_str("-114.00000000005").unwrap()),
            ..Default::default()
        };
        let merged = merge_platform(None, &incoming, ts(2025, 6, 1)).unwrap();
        assert_eq!(merged.latitude.unwrap().to_string(), "4.1234567890");
        assert_eq!(merged.longitude.unwrap().to_string(), "-114.0000000001");

        let again = merge_platform(Some(&merged), &incoming, ts(2025, 6, 1)).unwrap();
        assert_eq!(again, merged);
    }

    #[test]
    fn names_longer_than_the_column_are_rejected() {
        let long = "x".repeat(MAX_NAME_CHARS + 1);
        let incoming = PlatformRecord {
            id: Some(1),
            unique_name: Some(long.clone()),
            ..Default::default()
        };
        assert_eq!(
            merge_platform(Some(&stored_platform()), &incoming, ts(2025, 6, 1)),
            Err(RecordRejected::NameTooLong {
                kind: EntityKind::Platform,
                id: 1,
                chars: MAX_NAME_CHARS + 1,
            })
        );

        let at_limit = WellRecord {
            id: Some(10),
            unique_name: Some("é".repeat(MAX_NAME_CHARS)),
            ..Default::default()
        };
        assert!(merge_well(None, &at_limit, Some(1), ts(2025, 6, 1)).is_ok());
    }

    #[test]
    fn coordinates_beyond_nine_integer_digits_are_rejected() {
        let incoming = WellRecord {
            id: Some(10),
            longitude: Some(Decimal::from_str("1000000000").unwrap()),
            ..Default::default()
        };
        let err = merge_well(Some(&stored_well()), &incoming, None, ts(2025, 6, 1)).unwrap_err();
        assert!(matches!(
            err,
            RecordRejected::CoordinateOutOfRange { field: "longitude", id: 10, .. }
        ));
        assert!(coordinate_fits(&Decimal::from_str("-999999999.9999999999").unwrap()));
        assert!(!coordinate_fits(&Decimal::from_str("1.12345678901").unwrap()));
    }
}
