//! Wire format of `POST /api/ds/query` and `POST /api/ds/transform`.

use std::collections::HashSet;

use chrono::{DateTime, Duration, TimeZone, Utc};
use gateway_common::{DataSourceRef, GatewayError, QueryDescriptor, TimeRange};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

pub const DEFAULT_MAX_DATA_POINTS: i64 = 100;
pub const DEFAULT_INTERVAL_MS: i64 = 1000;
pub const DEFAULT_REF_ID: &str = "A";
pub const DEFAULT_FROM: &str = "now-6h";
pub const DEFAULT_TO: &str = "now";

/// A time bound as sent by clients: epoch milliseconds or a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeValue {
    Millis(i64),
    Text(String),
}

/// A datasource given either as a bare name or as a reference object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireDatasource {
    Name(String),
    Ref(DataSourceRef),
}

/// Request body shared by query and transform mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<TimeValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<TimeValue>,
    #[serde(default)]
    pub queries: Vec<MetricQuery>,
}

/// One query as sent by a client.
///
/// When `model` is absent the remaining, unrecognized fields of the query
/// object become the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricQuery {
    #[serde(default)]
    pub ref_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource: Option<WireDatasource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource_id: Option<i64>,
    #[serde(default)]
    pub query_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_data_points: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<TimeValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<TimeValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MetricQuery {
    /// The datasource reference, merging `datasource` and the legacy `datasourceId`.
    pub fn datasource_ref(&self) -> DataSourceRef {
        let mut reference = match &self.datasource {
            Some(WireDatasource::Name(name)) => DataSourceRef {
                name: Some(name.clone()),
                ..DataSourceRef::default()
            },
            Some(WireDatasource::Ref(reference)) => reference.clone(),
            None => DataSourceRef::default(),
        };
        if reference.id.is_none() {
            reference.id = self.datasource_id;
        }
        reference
    }

    /// Declared datasource name, trimmed; `None` when absent or blank.
    pub fn datasource_name(&self) -> Option<&str> {
        let name = match &self.datasource {
            Some(WireDatasource::Name(name)) => name.as_str(),
            Some(WireDatasource::Ref(reference)) => reference.name.as_deref()?,
            None => return None,
        };
        Some(name.trim()).filter(|n| !n.is_empty())
    }

    fn has_time_range(&self) -> bool {
        self.from.is_some() || self.to.is_some()
    }

    fn into_descriptor(self) -> QueryDescriptor {
        let datasource = self.datasource_ref();
        let model = match self.model {
            Some(model) => model,
            None => Value::Object(self.extra),
        };
        QueryDescriptor {
            ref_id: self.ref_id,
            datasource,
            query_type: self.query_type,
            max_data_points: self
                .max_data_points
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_MAX_DATA_POINTS),
            interval_ms: self
                .interval_ms
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_INTERVAL_MS),
            model,
        }
    }
}

/// A validated batch: descriptors with defaults applied, and the batch time range.
#[derive(Debug, Clone)]
pub struct ParsedBatch {
    pub time_range: TimeRange,
    pub queries: Vec<QueryDescriptor>,
}

impl MetricRequest {
    /// Validate the batch and apply defaults.
    ///
    /// The time range comes from the first query's own bounds when it has
    /// any, otherwise from the request; bounds on later queries are ignored.
    pub fn parse(self, now: DateTime<Utc>) -> Result<ParsedBatch, GatewayError> {
        let MetricRequest { from, to, queries } = self;
        let Some(first) = queries.first() else {
            return Err(GatewayError::BadRequest("no queries found in request".into()));
        };

        let (from, to) = if first.has_time_range() {
            (first.from.clone().or(from), first.to.clone().or(to))
        } else {
            (from, to)
        };
        let time_range = parse_time_range(from.as_ref(), to.as_ref(), now)?;

        let mut seen = HashSet::new();
        let mut descriptors = Vec::with_capacity(queries.len());
        for (index, mut query) in queries.into_iter().enumerate() {
            if query.ref_id.trim().is_empty() {
                query.ref_id = DEFAULT_REF_ID.to_string();
            }
            if !seen.insert(query.ref_id.clone()) {
                return Err(GatewayError::BadRequest(format!(
                    "duplicate refId '{}' in query batch",
                    query.ref_id
                )));
            }
            if index > 0 && query.has_time_range() {
                debug!(
                    ref_id = %query.ref_id,
                    "ignoring per-query time range after the first query"
                );
            }
            descriptors.push(query.into_descriptor());
        }

        Ok(ParsedBatch {
            time_range,
            queries: descriptors,
        })
    }
}

pub fn parse_time_range(
    from: Option<&TimeValue>,
    to: Option<&TimeValue>,
    now: DateTime<Utc>,
) -> Result<TimeRange, GatewayError> {
    let default_from = TimeValue::Text(DEFAULT_FROM.into());
    let default_to = TimeValue::Text(DEFAULT_TO.into());
    let from = parse_time(from.unwrap_or(&default_from), now)?;
    let to = parse_time(to.unwrap_or(&default_to), now)?;
    if from > to {
        return Err(GatewayError::BadRequest(
            "invalid time range: from is after to".into(),
        ));
    }
    Ok(TimeRange { from, to })
}

/// Parse epoch milliseconds, RFC 3339, `now`, or `now-<n><unit>`.
pub fn parse_time(value: &TimeValue, now: DateTime<Utc>) -> Result<DateTime<Utc>, GatewayError> {
    let invalid = || GatewayError::BadRequest(format!("invalid time value {}", display(value)));
    match value {
        TimeValue::Millis(ms) => Utc.timestamp_millis_opt(*ms).single().ok_or_else(invalid),
        TimeValue::Text(text) => {
            let text = text.trim();
            if text == "now" {
                return Ok(now);
            }
            if let Some(offset) = text.strip_prefix("now-") {
                return parse_offset(offset)
                    .and_then(|d| now.checked_sub_signed(d))
                    .ok_or_else(invalid);
            }
            if let Ok(ms) = text.parse::<i64>() {
                return Utc.timestamp_millis_opt(ms).single().ok_or_else(invalid);
            }
            DateTime::parse_from_rfc3339(text)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| invalid())
        }
    }
}

fn parse_offset(offset: &str) -> Option<Duration> {
    let split = offset.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = offset.split_at(split);
    let amount: i64 = amount.parse().ok()?;
    let seconds_per_unit = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 7 * 86_400,
        "M" => 30 * 86_400,
        "y" => 365 * 86_400,
        _ => return None,
    };
    Duration::try_seconds(amount.checked_mul(seconds_per_unit)?)
}

fn display(value: &TimeValue) -> String {
    match value {
        TimeValue::Millis(ms) => ms.to_string(),
        TimeValue::Text(text) => format!("'{}'", text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn request(value: Value) -> MetricRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn relative_times_are_resolved_against_now() {
        let t = parse_time(&TimeValue::Text("now-6h".into()), now()).unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap());
        let t = parse_time(&TimeValue::Text("now-1M".into()), now()).unwrap();
        assert_eq!(t, now() - Duration::days(30));
        assert_eq!(parse_time(&TimeValue::Text("now".into()), now()).unwrap(), now());
    }

    #[test]
    fn absolute_times_accept_millis_and_rfc3339() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let millis = expected.timestamp_millis();
        assert_eq!(parse_time(&TimeValue::Millis(millis), now()).unwrap(), expected);
        assert_eq!(
            parse_time(&TimeValue::Text(millis.to_string()), now()).unwrap(),
            expected
        );
        assert_eq!(
            parse_time(&TimeValue::Text("2024-01-01T00:00:00Z".into()), now()).unwrap(),
            expected
        );
    }

    #[test]
    fn garbage_time_is_bad_request() {
        for raw in ["yesterday", "now-5q", "now-h"] {
            let err = parse_time(&TimeValue::Text(raw.into()), now()).unwrap_err();
            assert!(matches!(err, GatewayError::BadRequest(_)), "{raw}");
        }
    }

    #[test]
    fn empty_batch_is_rejected() {
        let err = request(json!({"queries": []})).parse(now()).unwrap_err();
        assert!(err.to_string().contains("no queries"));
    }

    #[test]
    fn defaults_are_applied() {
        let batch = request(json!({
            "queries": [{"refId": "A", "datasource": {"uid": "prom"}, "expr": "up"}]
        }))
        .parse(now())
        .unwrap();

        let q = &batch.queries[0];
        assert_eq!(q.max_data_points, 100);
        assert_eq!(q.interval_ms, 1000);
        assert_eq!(q.model, json!({"expr": "up"}));
        assert_eq!(batch.time_range.from, now() - Duration::hours(6));
        assert_eq!(batch.time_range.to, now());
    }

    #[test]
    fn explicit_model_wins_over_extra_fields() {
        let batch = request(json!({
            "queries": [{
                "refId": "A",
                "datasourceId": 4,
                "model": {"q": 1},
                "ignored": true,
                "maxDataPoints": 500
            }]
        }))
        .parse(now())
        .unwrap();
        let q = &batch.queries[0];
        assert_eq!(q.model, json!({"q": 1}));
        assert_eq!(q.datasource.id, Some(4));
        assert_eq!(q.max_data_points, 500);
    }

    #[test]
    fn missing_ref_id_defaults_and_duplicates_are_rejected() {
        let batch = request(json!({"queries": [{"datasource": {"uid": "a"}}]}))
            .parse(now())
            .unwrap();
        assert_eq!(batch.queries[0].ref_id, "A");

        let err = request(json!({"queries": [{"datasource": {"uid": "a"}}, {"refId": "A"}]}))
            .parse(now())
            .unwrap_err();
        assert!(err.to_string().contains("duplicate refId 'A'"));
    }

    #[test]
    fn time_range_comes_from_first_query_only() {
        let batch = request(json!({
            "from": "now-1h",
            "to": "now",
            "queries": [
                {"refId": "A", "from": "now-2h", "to": "now-1h"},
                {"refId": "B", "from": "now-30d", "to": "now"}
            ]
        }))
        .parse(now())
        .unwrap();
        assert_eq!(batch.time_range.from, now() - Duration::hours(2));
        assert_eq!(batch.time_range.to, now() - Duration::hours(1));
    }

    #[test]
    fn request_level_range_used_when_first_query_has_none() {
        let batch = request(json!({
            "from": "now-1h",
            "queries": [{"refId": "A"}, {"refId": "B", "from": "now-2d"}]
        }))
        .parse(now())
        .unwrap();
        assert_eq!(batch.time_range.from, now() - Duration::hours(1));
    }

    #[test]
    fn datasource_name_accepts_string_or_object() {
        let by_string: MetricQuery =
            serde_json::from_value(json!({"refId": "A", "datasource": "__expr__"})).unwrap();
        let by_object: MetricQuery =
            serde_json::from_value(json!({"refId": "A", "datasource": {"name": "Loki"}})).unwrap();
        let blank: MetricQuery =
            serde_json::from_value(json!({"refId": "A", "datasource": {"name": "  "}})).unwrap();
        assert_eq!(by_string.datasource_name(), Some("__expr__"));
        assert_eq!(by_object.datasource_name(), Some("Loki"));
        assert_eq!(blank.datasource_name(), None);
    }
}
