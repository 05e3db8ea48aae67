use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::datasource::{DataSourceRef, ResolvedDataSource};
use crate::identity::CallerIdentity;

/// Absolute time window shared by every query of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// One query of a batch, with defaults already applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    pub ref_id: String,
    pub datasource: DataSourceRef,
    #[serde(default)]
    pub query_type: String,
    pub max_data_points: i64,
    pub interval_ms: i64,
    /// Opaque, datasource-defined payload.
    #[serde(default)]
    pub model: serde_json::Value,
}

/// A query paired with its resolved datasource. `datasource` is `None` for expression nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendQuery {
    pub query: QueryDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource: Option<ResolvedDataSource>,
}

/// The unit handed to a plugin backend for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendRequest {
    pub caller: CallerIdentity,
    pub time_range: TimeRange,
    pub queries: Vec<BackendQuery>,
}

impl BackendRequest {
    pub fn ref_ids(&self) -> Vec<String> {
        self.queries.iter().map(|q| q.query.ref_id.clone()).collect()
    }
}

/// The result for one refId. Frames and error may both be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl DataResponse {
    pub fn frames(frames: Vec<serde_json::Value>) -> Self {
        Self {
            frames: Some(frames),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Per-refId results as returned by a plugin backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDataResponse {
    #[serde(default)]
    pub responses: BTreeMap<String, DataResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_frames_are_omitted() {
        let json = serde_json::to_value(DataResponse::error("boom")).unwrap();
        assert_eq!(json, serde_json::json!({"error": "boom"}));
    }

    #[test]
    fn query_data_response_tolerates_missing_responses() {
        let parsed: QueryDataResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.responses.is_empty());
    }
}
