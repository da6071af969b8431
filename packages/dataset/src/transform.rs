//! Schema-enforcing transform from raw API payloads to typed rows.
//!
//! Every declared field is cast to its declared type. A nullable field that
//! fails to cast becomes null; a non-nullable field that is null or fails to
//! cast drops the whole row. If too many rows are dropped the window fails
//! validation rather than loading a mostly-empty result.

use std::sync::Arc;

use grid_ingest_dataset_models::{
    DatasetSpec, FieldSpec, FieldType, FieldValue, IngestedRow, RawPayload, Window,
    content_fingerprint,
};
use serde_json::Value;

use crate::SchemaValidationError;
use crate::clock::Clock;
use crate::parsing::{from_epoch_ms, parse_date, parse_timestamp};

/// Drop fraction allowed when neither the dataset nor the configuration
/// overrides it.
pub const DEFAULT_MAX_DROP_FRACTION: f64 = 0.10;

/// Rows produced from one payload plus counters for the run log.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    /// Rows that satisfied the schema, in payload order.
    pub rows: Vec<IngestedRow>,
    /// Records present in the payload.
    pub total_records: usize,
    /// Records dropped for null or uncastable non-nullable fields.
    pub dropped: usize,
    /// Nullable values that failed to cast and were stored as null.
    pub coerced_nulls: usize,
}

/// Turns raw payloads into [`IngestedRow`]s.
#[derive(Clone)]
pub struct Transformer {
    clock: Arc<dyn Clock>,
    default_max_drop_fraction: f64,
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("default_max_drop_fraction", &self.default_max_drop_fraction)
            .finish_non_exhaustive()
    }
}

impl Transformer {
    /// Creates a transformer stamping rows with `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, default_max_drop_fraction: f64) -> Self {
        Self {
            clock,
            default_max_drop_fraction,
        }
    }

    /// Parses and validates `raw` against `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaValidationError`] if the payload is not JSON, has no
    /// record list, or drops more rows than the allowed fraction.
    pub fn transform(
        &self,
        spec: &DatasetSpec,
        window: &Window,
        raw: &RawPayload,
    ) -> Result<TransformOutput, SchemaValidationError> {
        let json: Value = serde_json::from_slice(&raw.bytes).map_err(|e| {
            SchemaValidationError::MalformedPayload {
                dataset: spec.name.clone(),
                message: e.to_string(),
            }
        })?;

        let records = extract_records(spec, &json)?;
        let total_records = records.len();
        let ingested_at = self.clock.now();

        let key_indices: Vec<usize> = spec
            .business_key
            .iter()
            .filter_map(|name| spec.field_index(name))
            .collect();
        let partition_index = spec.field_index(&spec.partition_field);

        let mut rows = Vec::with_capacity(total_records);
        let mut dropped = 0;
        let mut coerced_nulls = 0;

        for record in records {
            let Some(object) = record.as_object() else {
                dropped += 1;
                continue;
            };

            let Some(values) = cast_record(spec, object, &mut coerced_nulls) else {
                dropped += 1;
                continue;
            };

            let Some(partition_date) = partition_index.and_then(|i| values[i].as_date()) else {
                dropped += 1;
                continue;
            };

            let business_key = key_indices
                .iter()
                .map(|&i| values[i].to_key_string())
                .collect::<Vec<_>>()
                .join("|");
            let row_hash = row_hash(&values);

            rows.push(IngestedRow {
                values,
                partition_date,
                business_key,
                row_hash,
                content_fingerprint: raw.fingerprint.clone(),
                ingested_at,
                window_start: window.start,
                window_end: window.end,
            });
        }

        let max_fraction = spec
            .max_drop_fraction
            .unwrap_or(self.default_max_drop_fraction);

        #[allow(clippy::cast_precision_loss)]
        let dropped_fraction = if total_records == 0 {
            0.0
        } else {
            dropped as f64 / total_records as f64
        };
        if dropped_fraction > max_fraction {
            return Err(SchemaValidationError::TooManyDropped {
                dataset: spec.name.clone(),
                dropped,
                total: total_records,
                max_fraction,
            });
        }

        if dropped > 0 || coerced_nulls > 0 {
            log::warn!(
                "{window}: dropped {dropped}/{total_records} records, coerced {coerced_nulls} values to null"
            );
        }

        Ok(TransformOutput {
            rows,
            total_records,
            dropped,
            coerced_nulls,
        })
    }
}

/// Finds the record list: either the whole payload or the array under the
/// dataset's envelope key.
fn extract_records<'a>(
    spec: &DatasetSpec,
    json: &'a Value,
) -> Result<&'a Vec<Value>, SchemaValidationError> {
    let path = spec.records_path();
    match json {
        Value::Array(records) => Ok(records),
        Value::Object(envelope) => match envelope.get(path) {
            Some(Value::Array(records)) => Ok(records),
            _ => Err(SchemaValidationError::MissingRecords {
                dataset: spec.name.clone(),
                path: path.to_string(),
            }),
        },
        _ => Err(SchemaValidationError::MissingRecords {
            dataset: spec.name.clone(),
            path: path.to_string(),
        }),
    }
}

/// Casts every declared field. Returns `None` when a non-nullable field is
/// null or uncastable.
fn cast_record(
    spec: &DatasetSpec,
    record: &serde_json::Map<String, Value>,
    coerced_nulls: &mut usize,
) -> Option<Vec<FieldValue>> {
    let mut values = Vec::with_capacity(spec.fields.len());
    for field in &spec.fields {
        let value = match record.get(&field.name) {
            None | Some(Value::Null) => FieldValue::Null,
            Some(raw) => match cast_value(field, raw) {
                Some(value) => value,
                None if field.nullable => {
                    log::trace!("{}: cannot cast {raw} to {}", field.name, field.field_type);
                    *coerced_nulls += 1;
                    FieldValue::Null
                }
                None => return None,
            },
        };
        if value.is_null() && !field.nullable {
            return None;
        }
        values.push(value);
    }
    Some(values)
}

/// Casts one non-null JSON value to the field's declared type.
fn cast_value(field: &FieldSpec, raw: &Value) -> Option<FieldValue> {
    match field.field_type {
        FieldType::Date => raw.as_str().and_then(parse_date).map(FieldValue::Date),
        FieldType::Timestamp => match raw {
            Value::String(s) => parse_timestamp(s),
            Value::Number(n) => n.as_i64().and_then(from_epoch_ms),
            _ => None,
        }
        .map(FieldValue::Timestamp),
        FieldType::Integer => match raw {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(integral))
            }
            _ => None,
        }
        .map(FieldValue::Integer),
        FieldType::Decimal => match raw {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|f| f.is_finite())
        .map(FieldValue::Decimal),
        FieldType::String => Some(FieldValue::String(match raw {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn integral(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

/// SHA-256 hex digest over the canonical JSON encoding of the values.
fn row_hash(values: &[FieldValue]) -> String {
    // Serializing plain enums of dates, numbers and strings cannot fail.
    let bytes = serde_json::to_vec(values).unwrap_or_default();
    content_fingerprint(&bytes)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, NaiveDate, TimeDelta, Utc};

    use super::*;
    use crate::clock::FixedClock;
    use crate::registry::parse_dataset_toml;

    const SPEC: &str = r#"
name = "FUELINST"
max_window = "1d"
table = "bmrs_fuelinst"
partition_field = "settlementDate"
business_key = ["startTime", "fuelType"]

[[fields]]
name = "startTime"
type = "timestamp"
nullable = false

[[fields]]
name = "settlementDate"
type = "date"
nullable = false

[[fields]]
name = "settlementPeriod"
type = "integer"

[[fields]]
name = "fuelType"
type = "string"
nullable = false

[[fields]]
name = "generation"
type = "decimal"
"#;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn spec() -> DatasetSpec {
        parse_dataset_toml(SPEC).unwrap()
    }

    fn window() -> Window {
        Window {
            dataset: "FUELINST".to_string(),
            start: ts("2024-01-01T00:00:00Z"),
            end: ts("2024-01-02T00:00:00Z"),
        }
    }

    fn transformer() -> Transformer {
        Transformer::new(
            Arc::new(FixedClock(ts("2024-06-01T12:00:00Z"))),
            DEFAULT_MAX_DROP_FRACTION,
        )
    }

    fn payload(json: &serde_json::Value) -> RawPayload {
        RawPayload::new(
            serde_json::to_vec(json).unwrap(),
            ts("2024-06-01T11:59:00Z"),
            1,
        )
    }

    fn record(i: usize) -> serde_json::Value {
        serde_json::json!({
            "startTime": format!("2024-01-01T{:02}:{:02}:00Z", i / 60 % 24, i % 60),
            "settlementDate": "2024-01-01",
            "settlementPeriod": (i % 48) + 1,
            "fuelType": "CCGT",
            "generation": 1000.5 + i as f64,
        })
    }

    #[test]
    fn casts_declared_types() {
        let raw = payload(&serde_json::json!({
            "data": [{
                "startTime": "2024-01-01T00:30:00Z",
                "settlementDate": "2024-01-01",
                "settlementPeriod": "2",
                "fuelType": "WIND",
                "generation": "5123.25",
                "ignored": true
            }]
        }));
        let out = transformer().transform(&spec(), &window(), &raw).unwrap();

        assert_eq!(out.total_records, 1);
        assert_eq!(out.dropped, 0);
        let row = &out.rows[0];
        assert_eq!(
            row.values,
            vec![
                FieldValue::Timestamp(ts("2024-01-01T00:30:00Z")),
                FieldValue::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
                FieldValue::Integer(2),
                FieldValue::String("WIND".to_string()),
                FieldValue::Decimal(5123.25),
            ]
        );
        assert_eq!(row.partition_date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(row.business_key, "2024-01-01T00:30:00Z|WIND");
        assert_eq!(row.content_fingerprint, raw.fingerprint);
        assert_eq!(row.ingested_at, ts("2024-06-01T12:00:00Z"));
        assert_eq!(row.window_start, window().start);
        assert_eq!(row.window_end, window().end);
    }

    #[test]
    fn accepts_bare_array_payloads() {
        let raw = payload(&serde_json::json!([record(0), record(1)]));
        let out = transformer().transform(&spec(), &window(), &raw).unwrap();
        assert_eq!(out.rows.len(), 2);
    }

    #[test]
    fn accepts_epoch_millis_and_integral_floats() {
        let raw = payload(&serde_json::json!([{
            "startTime": 1_704_067_200_000_i64,
            "settlementDate": "2024-01-01T00:00:00Z",
            "settlementPeriod": 3.0,
            "fuelType": 42,
            "generation": 7
        }]));
        let out = transformer().transform(&spec(), &window(), &raw).unwrap();
        let row = &out.rows[0];
        assert_eq!(row.values[0], FieldValue::Timestamp(ts("2024-01-01T00:00:00Z")));
        assert_eq!(row.values[2], FieldValue::Integer(3));
        assert_eq!(row.values[3], FieldValue::String("42".to_string()));
        assert_eq!(row.values[4], FieldValue::Decimal(7.0));
    }

    #[test]
    fn missing_nullable_fields_become_null() {
        let raw = payload(&serde_json::json!([{
            "startTime": "2024-01-01T00:00:00Z",
            "settlementDate": "2024-01-01",
            "fuelType": "NUCLEAR"
        }]));
        let out = transformer().transform(&spec(), &window(), &raw).unwrap();
        assert_eq!(out.rows[0].values[2], FieldValue::Null);
        assert_eq!(out.rows[0].values[4], FieldValue::Null);
        assert_eq!(out.coerced_nulls, 0);
    }

    #[test]
    fn uncastable_nullable_fields_are_coerced_to_null() {
        let raw = payload(&serde_json::json!([{
            "startTime": "2024-01-01T00:00:00Z",
            "settlementDate": "2024-01-01",
            "settlementPeriod": "first",
            "fuelType": "NUCLEAR",
            "generation": {"value": 1}
        }]));
        let out = transformer().transform(&spec(), &window(), &raw).unwrap();
        assert_eq!(out.rows[0].values[2], FieldValue::Null);
        assert_eq!(out.rows[0].values[4], FieldValue::Null);
        assert_eq!(out.coerced_nulls, 2);
    }

    #[test]
    fn drops_rows_below_threshold() {
        let mut records: Vec<serde_json::Value> = (0..100).map(record).collect();
        for r in records.iter_mut().take(5) {
            r["fuelType"] = serde_json::Value::Null;
        }
        let raw = payload(&serde_json::Value::Array(records));

        let out = transformer().transform(&spec(), &window(), &raw).unwrap();

        assert_eq!(out.total_records, 100);
        assert_eq!(out.dropped, 5);
        assert_eq!(out.rows.len(), 95);
    }

    #[test]
    fn allows_exactly_the_threshold() {
        let mut records: Vec<serde_json::Value> = (0..100).map(record).collect();
        for r in records.iter_mut().take(10) {
            r["startTime"] = serde_json::json!("not a time");
        }
        let raw = payload(&serde_json::Value::Array(records));
        let out = transformer().transform(&spec(), &window(), &raw).unwrap();
        assert_eq!(out.rows.len(), 90);
    }

    #[test]
    fn fails_when_too_many_rows_drop() {
        let mut records: Vec<serde_json::Value> = (0..100).map(record).collect();
        for r in records.iter_mut().take(11) {
            r.as_object_mut().unwrap().remove("settlementDate");
        }
        let raw = payload(&serde_json::Value::Array(records));

        let err = transformer().transform(&spec(), &window(), &raw).unwrap_err();
        assert_eq!(
            err,
            SchemaValidationError::TooManyDropped {
                dataset: "FUELINST".to_string(),
                dropped: 11,
                total: 100,
                max_fraction: DEFAULT_MAX_DROP_FRACTION,
            }
        );
    }

    #[test]
    fn dataset_override_beats_default_fraction() {
        let mut spec = spec();
        spec.max_drop_fraction = Some(0.5);
        let records: Vec<serde_json::Value> = (0..4)
            .map(|i| if i < 2 { serde_json::json!("junk") } else { record(i) })
            .collect();
        let raw = payload(&serde_json::Value::Array(records));
        let out = transformer().transform(&spec, &window(), &raw).unwrap();
        assert_eq!(out.dropped, 2);
        assert_eq!(out.rows.len(), 2);
    }

    #[test]
    fn empty_payload_yields_no_rows() {
        let raw = payload(&serde_json::json!({"data": []}));
        let out = transformer().transform(&spec(), &window(), &raw).unwrap();
        assert!(out.rows.is_empty());
        assert_eq!(out.total_records, 0);
    }

    #[test]
    fn rejects_malformed_json() {
        let raw = RawPayload::new(b"{\"data\": [".to_vec(), ts("2024-06-01T00:00:00Z"), 1);
        let err = transformer().transform(&spec(), &window(), &raw).unwrap_err();
        assert!(matches!(err, SchemaValidationError::MalformedPayload { .. }));
    }

    #[test]
    fn rejects_missing_record_list() {
        let raw = payload(&serde_json::json!({"items": []}));
        let err = transformer().transform(&spec(), &window(), &raw).unwrap_err();
        assert_eq!(
            err,
            SchemaValidationError::MissingRecords {
                dataset: "FUELINST".to_string(),
                path: "data".to_string(),
            }
        );
    }

    #[test]
    fn identical_input_and_clock_yield_identical_rows() {
        let records: Vec<serde_json::Value> = (0..20).map(record).collect();
        let raw = payload(&serde_json::Value::Array(records));

        let first = transformer().transform(&spec(), &window(), &raw).unwrap();
        let second = transformer().transform(&spec(), &window(), &raw).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first.rows).unwrap(),
            serde_json::to_vec(&second.rows).unwrap()
        );
    }

    #[test]
    fn row_hash_ignores_ingest_time() {
        let raw = payload(&serde_json::json!([record(7)]));
        let early = transformer().transform(&spec(), &window(), &raw).unwrap();
        let later = Transformer::new(
            Arc::new(FixedClock(ts("2024-06-01T12:00:00Z") + TimeDelta::hours(5))),
            DEFAULT_MAX_DROP_FRACTION,
        )
        .transform(&spec(), &window(), &raw)
        .unwrap();

        assert_eq!(early.rows[0].row_hash, later.rows[0].row_hash);
        assert_ne!(early.rows[0].ingested_at, later.rows[0].ingested_at);
    }
}
