//! Merging per-refId backend results into one response envelope.

use std::collections::BTreeMap;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gateway_common::{DataResponse, QueryDataResponse};
use serde::Serialize;
use tracing::warn;

pub const MISSING_RESULT_ERROR: &str = "no response for query";

/// Results keyed by refId plus the aggregate status.
///
/// `results` is a `BTreeMap`, so refIds always serialize in sorted order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    pub results: BTreeMap<String, DataResponse>,
    #[serde(skip)]
    pub status: StatusCode,
}

impl IntoResponse for ResponseEnvelope {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

pub struct ResponseAggregator;

impl ResponseAggregator {
    /// Build the envelope for a batch.
    ///
    /// With `expected` set, the envelope has exactly one entry per expected
    /// refId: unanswered ones get an inline error and unexpected ones are
    /// dropped. Any entry carrying an error makes the aggregate status 400.
    pub fn aggregate(expected: Option<&[String]>, response: QueryDataResponse) -> ResponseEnvelope {
        let mut results = response.responses;

        if let Some(expected) = expected {
            results.retain(|ref_id, _| {
                let known = expected.contains(ref_id);
                if !known {
                    warn!(ref_id = %ref_id, "dropping result for refId that was not requested");
                }
                known
            });
            for ref_id in expected {
                results
                    .entry(ref_id.clone())
                    .or_insert_with(|| DataResponse::error(MISSING_RESULT_ERROR));
            }
        }

        let mut status = StatusCode::OK;
        for (ref_id, result) in &results {
            if let Some(error) = &result.error {
                warn!(ref_id = %ref_id, error = %error, "query returned an error");
                status = StatusCode::BAD_REQUEST;
            }
        }

        ResponseEnvelope { results, status }
    }
}
