//! Envelope detection + permissive decoding of platform/well API payloads.
//!
//! The upstream API does not keep a stable response shape across endpoints: some
//! return a bare array, some wrap it under `data`/`result`/`items`, and some
//! return a single platform object. Everything here funnels those into a flat
//! `Vec<PlatformRecord>` so the rest of the pipeline never sees the difference.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use aemsync_core::{ExtraFields, PlatformRecord, WellRecord};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "aemsync-adapters";

/// Wrapper keys probed on a keyed envelope, highest priority first.
pub const ENVELOPE_KEYS: [&str; 3] = ["data", "result", "items"];

const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "key")]
pub enum EnvelopeShape {
    DirectArray,
    Keyed(&'static str),
    SingleRecord,
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Normalized {
    pub shape: EnvelopeShape,
    pub records: Vec<PlatformRecord>,
}

/// The payload cannot be decoded at all; the whole endpoint is skipped.
#[derive(Debug, Error)]
pub enum MalformedPayload {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("expected {expected} at `{pointer}`, found {found}")]
    UnexpectedType {
        pointer: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid value at `{pointer}`: {reason}")]
    InvalidValue { pointer: String, reason: String },
}

/// Extract the platform records from a raw payload, whatever its envelope.
pub fn normalize(raw: &[u8]) -> Result<Vec<PlatformRecord>, MalformedPayload> {
    normalize_envelope(raw).map(|n| n.records)
}

/// Same as [`normalize`] but also reports which envelope shape matched.
pub fn normalize_envelope(raw: &[u8]) -> Result<Normalized, MalformedPayload> {
    let root: JsonValue = serde_json::from_slice(raw)?;

    let normalized = match &root {
        JsonValue::Array(items) => Normalized {
            shape: EnvelopeShape::DirectArray,
            records: decode_platforms(items, "")?,
        },
        JsonValue::Object(map) => normalize_object(map)?,
        other => {
            debug!(root = type_name(other), "payload root is a scalar; nothing to sync");
            Normalized {
                shape: EnvelopeShape::Unrecognized,
                records: Vec::new(),
            }
        }
    };

    debug!(
        shape = ?normalized.shape,
        records = normalized.records.len(),
        "normalized payload"
    );
    Ok(normalized)
}

/// Read a saved payload from disk and normalize it.
pub fn load_payload_file(path: impl AsRef<Path>) -> anyhow::Result<Normalized> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    normalize_envelope(&bytes).with_context(|| format!("normalizing {}", path.display()))
}

fn normalize_object(map: &Map<String, JsonValue>) -> Result<Normalized, MalformedPayload> {
    for key in ENVELOPE_KEYS {
        let Some((actual, value)) = get_ci(map, key) else {
            continue;
        };
        let pointer = format!("/{actual}");
        let records = match value {
            JsonValue::Null => Vec::new(),
            JsonValue::Array(items) => decode_platforms(items, &pointer)?,
            other => return Err(unexpected(&pointer, "array", other)),
        };
        return Ok(Normalized {
            shape: EnvelopeShape::Keyed(key),
            records,
        });
    }

    // `name` decodes as an alias of `uniqueName`, so it identifies a record too.
    let has_identity = map
        .keys()
        .any(|k| matches!(k.to_ascii_lowercase().as_str(), "id" | "uniquename" | "name"));
    if has_identity {
        return Ok(Normalized {
            shape: EnvelopeShape::SingleRecord,
            records: vec![decode_platform(map, "")?],
        });
    }

    debug!(
        properties = ?map.iter().map(|(k, v)| format!("{k}: {}", type_name(v))).collect::<Vec<_>>(),
        "no recognizable data in keyed payload"
    );
    Ok(Normalized {
        shape: EnvelopeShape::Unrecognized,
        records: Vec::new(),
    })
}

fn get_ci<'a>(map: &'a Map<String, JsonValue>, key: &str) -> Option<(&'a str, &'a JsonValue)> {
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(k, v)| (k.as_str(), v))
}

fn decode_platforms(items: &[JsonValue], pointer: &str) -> Result<Vec<PlatformRecord>, MalformedPayload> {
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let item_pointer = format!("{pointer}/{idx}");
            match item {
                JsonValue::Object(map) => decode_platform(map, &item_pointer),
                other => Err(unexpected(&item_pointer, "object", other)),
            }
        })
        .collect()
}

fn decode_platform(map: &Map<String, JsonValue>, pointer: &str) -> Result<PlatformRecord, MalformedPayload> {
    let mut record = PlatformRecord::default();
    let mut name_alias = None;

    for (key, value) in map {
        let field_pointer = format!("{pointer}/{key}");
        match key.to_ascii_lowercase().as_str() {
            "id" if record.id.is_none() => record.id = json_id(value, &field_pointer)?,
            "uniquename" if record.unique_name.is_none() => {
                record.unique_name = json_text(value, &field_pointer)?
            }
            "name" if name_alias.is_none() => name_alias = Some((key, value)),
            "latitude" if record.latitude.is_none() => {
                record.latitude = json_decimal(value, &field_pointer)?
            }
            "longitude" if record.longitude.is_none() => {
                record.longitude = json_decimal(value, &field_pointer)?
            }
            "createdat" if record.created_at.is_none() => {
                record.created_at = json_timestamp(value, &field_pointer)?
            }
            "updatedat" if record.updated_at.is_none() => {
                record.updated_at = json_timestamp(value, &field_pointer)?
            }
            "lastupdate" if record.last_update.is_none() => {
                record.last_update = json_timestamp(value, &field_pointer)?
            }
            "well" | "wells" if record.wells.is_empty() => {
                record.wells = decode_wells(value, &field_pointer)?
            }
            _ => {
                record.extra.insert(key.clone(), value.clone());
            }
        }
    }

    resolve_name_alias(&mut record.unique_name, name_alias, &mut record.extra, pointer)?;
    Ok(record)
}

fn decode_wells(value: &JsonValue, pointer: &str) -> Result<Vec<WellRecord>, MalformedPayload> {
    match value {
        JsonValue::Null => Ok(Vec::new()),
        JsonValue::Array(items) => items
            .iter()
            .enumerate()
            .map(|(idx, item)| {
                let item_pointer = format!("{pointer}/{idx}");
                match item {
                    JsonValue::Object(map) => decode_well(map, &item_pointer),
                    other => Err(unexpected(&item_pointer, "object", other)),
                }
            })
            .collect(),
        other => Err(unexpected(pointer, "array", other)),
    }
}

fn decode_well(map: &Map<String, JsonValue>, pointer: &str) -> Result<WellRecord, MalformedPayload> {
    let mut record = WellRecord::default();
    let mut name_alias = None;

    for (key, value) in map {
        let field_pointer = format!("{pointer}/{key}");
        match key.to_ascii_lowercase().as_str() {
            "id" if record.id.is_none() => record.id = json_id(value, &field_pointer)?,
            "platformid" if record.platform_id.is_none() => {
                record.platform_id = json_id(value, &field_pointer)?
            }
            "uniquename" if record.unique_name.is_none() => {
                record.unique_name = json_text(value, &field_pointer)?
            }
            "name" if name_alias.is_none() => name_alias = Some((key, value)),
            "latitude" if record.latitude.is_none() => {
                record.latitude = json_decimal(value, &field_pointer)?
            }
            "longitude" if record.longitude.is_none() => {
                record.longitude = json_decimal(value, &field_pointer)?
            }
            "createdat" if record.created_at.is_none() => {
                record.created_at = json_timestamp(value, &field_pointer)?
            }
            "updatedat" if record.updated_at.is_none() => {
                record.updated_at = json_timestamp(value, &field_pointer)?
            }
            "lastupdate" if record.last_update.is_none() => {
                record.last_update = json_timestamp(value, &field_pointer)?
            }
            _ => {
                record.extra.insert(key.clone(), value.clone());
            }
        }
    }

    resolve_name_alias(&mut record.unique_name, name_alias, &mut record.extra, pointer)?;
    Ok(record)
}

/// `name` stands in for `uniqueName` only when the latter is missing; otherwise
/// it is kept as an extra field.
fn resolve_name_alias(
    unique_name: &mut Option<String>,
    alias: Option<(&String, &JsonValue)>,
    extra: &mut ExtraFields,
    pointer: &str,
) -> Result<(), MalformedPayload> {
    let Some((key, value)) = alias else {
        return Ok(());
    };
    if unique_name.is_none() {
        *unique_name = json_text(value, &format!("{pointer}/{key}"))?;
    } else {
        extra.insert(key.clone(), value.clone());
    }
    Ok(())
}

fn json_id(value: &JsonValue, pointer: &str) -> Result<Option<i64>, MalformedPayload> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::Number(n) => n.as_i64().map(Some).ok_or_else(|| MalformedPayload::InvalidValue {
            pointer: pointer.to_string(),
            reason: format!("`{n}` is not an integer id"),
        }),
        JsonValue::String(s) if s.trim().is_empty() => Ok(None),
        JsonValue::String(s) => s.trim().parse::<i64>().map(Some).map_err(|e| {
            MalformedPayload::InvalidValue {
                pointer: pointer.to_string(),
                reason: format!("`{s}` is not an integer id: {e}"),
            }
        }),
        other => Err(unexpected(pointer, "integer", other)),
    }
}

fn json_text(value: &JsonValue, pointer: &str) -> Result<Option<String>, MalformedPayload> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::String(s) => Ok(Some(s.clone())),
        JsonValue::Number(n) => Ok(Some(n.to_string())),
        other => Err(unexpected(pointer, "string", other)),
    }
}

/// Numbers are read from their literal text so no binary float rounding
/// happens on the way to `Decimal`.
fn json_decimal(value: &JsonValue, pointer: &str) -> Result<Option<Decimal>, MalformedPayload> {
    let text = match value {
        JsonValue::Null => return Ok(None),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) if s.trim().is_empty() => return Ok(None),
        JsonValue::String(s) => s.trim().to_string(),
        other => return Err(unexpected(pointer, "number", other)),
    };
    parse_decimal(&text)
        .map(Some)
        .ok_or_else(|| MalformedPayload::InvalidValue {
            pointer: pointer.to_string(),
            reason: format!("`{text}` is not a decimal number"),
        })
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    Decimal::from_str(text)
        .ok()
        .or_else(|| Decimal::from_scientific(text).ok())
}

fn json_timestamp(value: &JsonValue, pointer: &str) -> Result<Option<DateTime<Utc>>, MalformedPayload> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::String(s) if s.trim().is_empty() => Ok(None),
        JsonValue::String(s) => parse_timestamp(s)
            .map(Some)
            .ok_or_else(|| MalformedPayload::InvalidValue {
                pointer: pointer.to_string(),
                reason: format!("`{s}` is not a recognized timestamp"),
            }),
        other => Err(unexpected(pointer, "timestamp string", other)),
    }
}

/// RFC 3339, or an offset-less date/time which the API means as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn unexpected(pointer: &str, expected: &'static str, found: &JsonValue) -> MalformedPayload {
    MalformedPayload::UnexpectedType {
        pointer: if pointer.is_empty() { "/".to_string() } else { pointer.to_string() },
        expected,
        found: type_name(found),
    }
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(records: &[PlatformRecord]) -> Vec<Option<i64>> {
        records.iter().map(|r| r.id).collect()
    }

    #[test]
    fn direct_array_keeps_length_and_order() {
        let raw = br#"[{"id":3,"uniqueName":"C"},{"id":1,"uniqueName":"A"},{"uniqueName":"B"}]"#;
        let normalized = normalize_envelope(raw).unwrap();
        assert_eq!(normalized.shape, EnvelopeShape::DirectArray);
        assert_eq!(ids(&normalized.records), vec![Some(3), Some(1), None]);
    }

    #[test]
    fn keyed_envelope_uses_first_key_in_priority_order() {
        let raw = br#"{"items":[{"id":3}],"result":[{"id":2}],"data":[{"id":1}]}"#;
        let normalized = normalize_envelope(raw).unwrap();
        assert_eq!(normalized.shape, EnvelopeShape::Keyed("data"));
        assert_eq!(ids(&normalized.records), vec![Some(1)]);

        let raw = br#"{"items":[{"id":3}],"result":[{"id":2},{"id":4}]}"#;
        let normalized = normalize_envelope(raw).unwrap();
        assert_eq!(normalized.shape, EnvelopeShape::Keyed("result"));
        assert_eq!(ids(&normalized.records), vec![Some(2), Some(4)]);

        let raw = br#"{"success":true,"Items":[{"id":3}]}"#;
        let normalized = normalize_envelope(raw).unwrap();
        assert_eq!(normalized.shape, EnvelopeShape::Keyed("items"));
        assert_eq!(ids(&normalized.records), vec![Some(3)]);
    }

    #[test]
    fn null_envelope_value_means_nothing_to_sync() {
        let normalized = normalize_envelope(br#"{"data":null,"message":"ok"}"#).unwrap();
        assert_eq!(normalized.shape, EnvelopeShape::Keyed("data"));
        assert!(normalized.records.is_empty());
    }

    #[test]
    fn identity_bearing_object_is_a_single_record() {
        let raw = br#"{"id":5,"uniqueName":"P5","well":[{"id":50,"uniqueName":"W50"}]}"#;
        let normalized = normalize_envelope(raw).unwrap();
        assert_eq!(normalized.shape, EnvelopeShape::SingleRecord);
        assert_eq!(normalized.records.len(), 1);
        assert_eq!(normalized.records[0].wells[0].id, Some(50));
    }

    #[test]
    fn unrecognized_object_yields_empty_list() {
        let normalized = normalize_envelope(br#"{"status":"ok","count":0}"#).unwrap();
        assert_eq!(normalized.shape, EnvelopeShape::Unrecognized);
        assert!(normalized.records.is_empty());
        assert!(normalize(b"42").unwrap().is_empty());
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(matches!(
            normalize(b"{\"data\": [").unwrap_err(),
            MalformedPayload::InvalidJson(_)
        ));
        assert!(normalize(b"").is_err());
    }

    #[test]
    fn wrong_shapes_inside_payload_are_malformed() {
        let err = normalize(br#"{"data":{"id":1}}"#).unwrap_err();
        assert!(matches!(err, MalformedPayload::UnexpectedType { expected: "array", .. }));

        let err = normalize(br#"[{"id":1},"oops"]"#).unwrap_err();
        match err {
            MalformedPayload::UnexpectedType { pointer, .. } => assert_eq!(pointer, "/1"),
            other => panic!("unexpected error: {other}"),
        }

        let err = normalize(br#"[{"id":"abc"}]"#).unwrap_err();
        assert!(matches!(err, MalformedPayload::InvalidValue { .. }));
    }

    #[test]
    fn field_names_match_case_insensitively() {
        let raw = br#"[{"ID":1,"UniqueName":"P1","LATITUDE":1.25,"Wells":[{"Id":10,"PlatformID":1,"uniquename":"W1"}]}]"#;
        let records = normalize(raw).unwrap();
        let platform = &records[0];
        assert_eq!(platform.id, Some(1));
        assert_eq!(platform.unique_name.as_deref(), Some("P1"));
        assert_eq!(platform.latitude.unwrap().to_string(), "1.25");
        assert_eq!(platform.wells[0].platform_id, Some(1));
        assert_eq!(platform.wells[0].unique_name.as_deref(), Some("W1"));
        assert!(platform.extra.is_empty());
    }

    #[test]
    fn unknown_fields_are_preserved_in_extra() {
        let raw = br#"[{"id":1,"uniqueName":"P1","operator":"Acme","tags":["a"],"well":[{"id":2,"depth":1200}]}]"#;
        let records = normalize(raw).unwrap();
        assert_eq!(records[0].extra.get("operator"), Some(&JsonValue::from("Acme")));
        assert!(records[0].extra.contains_key("tags"));
        assert!(records[0].wells[0].extra.contains_key("depth"));
    }

    #[test]
    fn coordinates_keep_high_precision() {
        let raw = br#"[{"id":1,"latitude":4.123456789012345,"longitude":"-113.0000000001"}]"#;
        let records = normalize(raw).unwrap();
        assert_eq!(records[0].latitude.unwrap().to_string(), "4.123456789012345");
        assert_eq!(records[0].longitude.unwrap().to_string(), "-113.0000000001");
    }

    #[test]
    fn name_alias_only_fills_missing_unique_name() {
        let records = normalize(br#"[{"id":1,"name":"Alias"}]"#).unwrap();
        assert_eq!(records[0].unique_name.as_deref(), Some("Alias"));

        let records = normalize(br#"[{"id":1,"name":"Alias","uniqueName":"Real"}]"#).unwrap();
        assert_eq!(records[0].unique_name.as_deref(), Some("Real"));
        assert_eq!(records[0].extra.get("name"), Some(&JsonValue::from("Alias")));
    }

    #[test]
    fn timestamps_accept_api_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).single().unwrap();
        assert_eq!(parse_timestamp("2024-05-06T07:08:09Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-06T07:08:09"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-06 07:08:09"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-06T09:08:09+02:00"), Some(expected));
        assert!(parse_timestamp("2024-05-06T07:08:09.1234567").is_some());
        assert_eq!(
            parse_timestamp("2024-05-06"),
            Utc.with_ymd_and_hms(2024, 5, 6, 0, 0, 0).single()
        );
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn last_update_is_decoded_separately() {
        let raw = br#"[{"id":1,"lastUpdate":"2024-01-02T00:00:00","updatedAt":null}]"#;
        let records = normalize(raw).unwrap();
        assert!(records[0].updated_at.is_none());
        assert!(records[0].last_update.is_some());
    }
}
