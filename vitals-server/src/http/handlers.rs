//! HTTP API handlers.
//!
//! Handlers are plain async functions over the repository plus already
//! decoded inputs; the surrounding service (see `http::serve`) owns body
//! transport, the middleware pipeline and response encoding. Each handler
//! returns either an [`ApiResponse`] or an [`ApiError`] carrying the
//! client-facing message and the logged cause.
//!
//! Validation runs in protocol order on every update surface: non-empty
//! id (404), known kind (400), parseable payload (400), then the
//! repository call.

use crate::repo::Repository;
use hyper::StatusCode;
use std::collections::BTreeMap;
use vitals_core::error::VitalsError;
use vitals_core::metric::{
    format_counter, format_gauge, parse_counter, parse_gauge, CounterMap, GaugeMap, MetricKind,
    MetricRecord,
};

pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
pub const APPLICATION_JSON: &str = "application/json; charset=utf-8";
pub const TEXT_HTML: &str = "text/html; charset=utf-8";

#[derive(Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self { status: StatusCode::OK, content_type: TEXT_PLAIN, body: Vec::new() }
    }

    pub fn text(body: String) -> Self {
        Self { status: StatusCode::OK, content_type: TEXT_PLAIN, body: body.into_bytes() }
    }

    pub fn json(body: Vec<u8>) -> Self {
        Self { status: StatusCode::OK, content_type: APPLICATION_JSON, body }
    }

    pub fn html(body: String) -> Self {
        Self { status: StatusCode::OK, content_type: TEXT_HTML, body: body.into_bytes() }
    }
}

/// A handler error: the message is written to the client as text/plain,
/// the cause only reaches the log.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub cause: Option<VitalsError>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into(), cause: None }
    }

    pub fn with_cause(status: StatusCode, message: impl Into<String>, cause: VitalsError) -> Self {
        Self { status, message: message.into(), cause: Some(cause) }
    }
}

fn incorrect_request_type() -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "incorrect request type")
}

/// Validate and apply a single metric update, in protocol order. A raw
/// string value (from URL params) is parsed according to the kind;
/// body-based callers pass `None` and the typed payload field is used.
pub async fn apply_update(
    repo: &Repository,
    record: &MetricRecord,
    raw_value: Option<&str>,
) -> Result<(), ApiError> {
    if record.id.is_empty() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "name must contain a value"));
    }

    let kind = record.parse_kind().map_err(|_| incorrect_request_type())?;

    match kind {
        MetricKind::Gauge => {
            let value = match raw_value {
                Some(raw) => parse_gauge(raw)
                    .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid value"))?,
                None => record
                    .value
                    .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "invalid value"))?,
            };
            repo.set_gauge(&record.id, value).await.map_err(|e| {
                ApiError::with_cause(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "setting gauge value in db failed",
                    e,
                )
            })
        }
        MetricKind::Counter => {
            let delta = match raw_value {
                Some(raw) => parse_counter(raw)
                    .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid value"))?,
                None => record
                    .delta
                    .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "invalid value"))?,
            };
            repo.set_counter(&record.id, delta).await.map_err(|e| {
                ApiError::with_cause(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "setting counter value in db failed",
                    e,
                )
            })
        }
    }
}

/// POST `/update/{kind}/{id}/{value}` — single update from URL params.
pub async fn update_from_path(
    repo: &Repository,
    kind: &str,
    name: &str,
    raw_value: &str,
) -> Result<ApiResponse, ApiError> {
    let record = MetricRecord {
        id: name.to_string(),
        kind: kind.to_string(),
        value: None,
        delta: None,
    };

    apply_update(repo, &record, Some(raw_value)).await?;
    Ok(ApiResponse::ok())
}

fn require_json(content_type: Option<&str>) -> Result<(), ApiError> {
    let is_json = content_type.map(|ct| ct.contains("application/json")).unwrap_or(false);
    if is_json {
        Ok(())
    } else {
        Err(ApiError::new(StatusCode::BAD_REQUEST, "unsupported content type"))
    }
}

/// POST `/update` — single update from a JSON body.
pub async fn update_from_body(
    repo: &Repository,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<ApiResponse, ApiError> {
    require_json(content_type)?;

    let record: MetricRecord = serde_json::from_slice(body)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "unmarshaling failed"))?;

    apply_update(repo, &record, None).await?;
    Ok(ApiResponse::ok())
}

/// Collapse a batch into one gauge map (last write wins) and one counter
/// map (deltas summed per id). Records with an empty id or a missing
/// payload field are skipped; an unknown kind on any surviving record is
/// a protocol error.
pub fn collapse_batch(records: &[MetricRecord]) -> Result<(GaugeMap, CounterMap), ApiError> {
    let mut gauges = GaugeMap::new();
    let mut counters = CounterMap::new();

    for record in records {
        if record.id.is_empty() {
            continue;
        }
        match record.parse_kind().map_err(|_| incorrect_request_type())? {
            MetricKind::Gauge => {
                if let Some(value) = record.value {
                    gauges.insert(record.id.clone(), value);
                }
            }
            MetricKind::Counter => {
                if let Some(delta) = record.delta {
                    *counters.entry(record.id.clone()).or_insert(0) += delta;
                }
            }
        }
    }

    Ok((gauges, counters))
}

/// POST `/updates` — batch update from a JSON array. Counters are
/// collapsed before dispatch so delta-sum semantics survive backends that
/// accumulate server-side.
pub async fn update_batch(
    repo: &Repository,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<ApiResponse, ApiError> {
    require_json(content_type)?;

    let records: Vec<MetricRecord> = serde_json::from_slice(body)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "unmarshaling failed"))?;

    let (gauges, counters) = collapse_batch(&records)?;
    if gauges.is_empty() && counters.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "nothing to update"));
    }

    if !gauges.is_empty() {
        repo.set_gauge_all(gauges).await.map_err(|e| {
            ApiError::with_cause(
                StatusCode::INTERNAL_SERVER_ERROR,
                "gauge batch update to db failed",
                e,
            )
        })?;
    }
    if !counters.is_empty() {
        repo.set_counter_all(counters).await.map_err(|e| {
            ApiError::with_cause(
                StatusCode::INTERNAL_SERVER_ERROR,
                "counter batch update to db failed",
                e,
            )
        })?;
    }

    Ok(ApiResponse::ok())
}

/// Look up one metric and return it as a fully populated record.
pub async fn lookup(repo: &Repository, kind: &str, name: &str) -> Result<MetricRecord, ApiError> {
    if name.is_empty() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "name must contain a value"));
    }

    let kind: MetricKind = kind.parse().map_err(|_| incorrect_request_type())?;

    match kind {
        MetricKind::Gauge => {
            let value = repo.gauge(name).await.map_err(|e| {
                ApiError::with_cause(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "getting gauge value from db failed",
                    e,
                )
            })?;
            value.map(|v| MetricRecord::gauge(name, v)).ok_or_else(|| {
                ApiError::new(StatusCode::NOT_FOUND, "value doesn't exist in the storage")
            })
        }
        MetricKind::Counter => {
            let delta = repo.counter(name).await.map_err(|e| {
                ApiError::with_cause(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "getting counter value from db failed",
                    e,
                )
            })?;
            delta.map(|d| MetricRecord::counter(name, d)).ok_or_else(|| {
                ApiError::new(StatusCode::NOT_FOUND, "value doesn't exist in the storage")
            })
        }
    }
}

/// GET `/value/{kind}/{id}` — formatted value as text.
pub async fn value_text(
    repo: &Repository,
    kind: &str,
    name: &str,
) -> Result<ApiResponse, ApiError> {
    let record = lookup(repo, kind, name).await?;
    Ok(ApiResponse::text(record.format_value()))
}

/// POST `/value` — record lookup with a JSON body carrying id and kind.
pub async fn value_json(
    repo: &Repository,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<ApiResponse, ApiError> {
    require_json(content_type)?;

    let query: MetricRecord = serde_json::from_slice(body)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "unmarshaling failed"))?;

    let record = lookup(repo, &query.kind, &query.id).await?;
    let body = serde_json::to_vec(&record).map_err(|e| {
        ApiError::with_cause(
            StatusCode::INTERNAL_SERVER_ERROR,
            "marshaling failed",
            VitalsError::internal(e),
        )
    })?;
    Ok(ApiResponse::json(body))
}

const INDEX_TEMPLATE: &str = include_str!("index.html");

/// GET `/` — HTML table of everything collected so far.
pub async fn index(repo: &Repository) -> Result<ApiResponse, ApiError> {
    let gauges = repo.gauge_all().await.map_err(|e| {
        ApiError::with_cause(
            StatusCode::INTERNAL_SERVER_ERROR,
            "an error occurred while acquiring gauge values from db",
            e,
        )
    })?;
    let counters = repo.counter_all().await.map_err(|e| {
        ApiError::with_cause(
            StatusCode::INTERNAL_SERVER_ERROR,
            "an error occurred while acquiring counter values from db",
            e,
        )
    })?;

    // BTreeMap for a stable row order on the page.
    let gauge_rows: String = gauges
        .into_iter()
        .collect::<BTreeMap<_, _>>()
        .into_iter()
        .map(|(name, v)| format!("<tr><td>{name}</td><td>{}</td></tr>\n", format_gauge(v)))
        .collect();
    let counter_rows: String = counters
        .into_iter()
        .collect::<BTreeMap<_, _>>()
        .into_iter()
        .map(|(name, v)| format!("<tr><td>{name}</td><td>{}</td></tr>\n", format_counter(v)))
        .collect();

    let page = INDEX_TEMPLATE
        .replace("{{gauge_rows}}", &gauge_rows)
        .replace("{{counter_rows}}", &counter_rows);
    Ok(ApiResponse::html(page))
}

/// GET `/ping` — repository healthcheck.
pub async fn ping(repo: &Repository) -> Result<ApiResponse, ApiError> {
    repo.ping().await.map_err(|e| {
        ApiError::with_cause(
            StatusCode::INTERNAL_SERVER_ERROR,
            "connection to DB wasn't established",
            e,
        )
    })?;
    Ok(ApiResponse::ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::Backup;
    use std::path::PathBuf;

    fn repo() -> Repository {
        Repository::in_memory(Backup::new(PathBuf::from("unused.json"), 300, false))
    }

    const JSON: Option<&str> = Some("application/json");

    #[tokio::test]
    async fn counter_update_from_path_starts_at_delta() {
        let repo = repo();
        let resp = update_from_path(&repo, "counter", "PollCount", "1").await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(repo.counter("PollCount").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn counter_update_from_path_accumulates() {
        let repo = repo();
        update_from_path(&repo, "counter", "PollCount", "56").await.unwrap();
        update_from_path(&repo, "counter", "PollCount", "21").await.unwrap();
        assert_eq!(repo.counter("PollCount").await.unwrap(), Some(77));
    }

    #[tokio::test]
    async fn counter_update_from_body_accumulates() {
        let repo = repo();
        let resp = update_from_body(
            &repo,
            JSON,
            br#"{"id":"PollCount","type":"counter","delta":99}"#,
        )
        .await
        .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(repo.counter("PollCount").await.unwrap(), Some(99));

        update_from_body(&repo, JSON, br#"{"id":"PollCount","type":"counter","delta":50}"#)
            .await
            .unwrap();
        assert_eq!(repo.counter("PollCount").await.unwrap(), Some(149));
    }

    #[tokio::test]
    async fn value_json_returns_stored_counter() {
        let repo = repo();
        repo.set_counter("PollCount", 64).await.unwrap();

        let resp =
            value_json(&repo, JSON, br#"{"id":"PollCount","type":"counter"}"#).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(
            String::from_utf8(resp.body).unwrap(),
            r#"{"id":"PollCount","type":"counter","delta":64}"#
        );
    }

    #[tokio::test]
    async fn batch_collapses_counters_and_gauges() {
        let repo = repo();
        let body = br#"[
            {"id":"c","type":"counter","delta":1},
            {"id":"c","type":"counter","delta":2},
            {"id":"g","type":"gauge","value":3.5}
        ]"#;
        let resp = update_batch(&repo, JSON, body).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(repo.counter("c").await.unwrap(), Some(3));
        assert_eq!(repo.gauge("g").await.unwrap(), Some(3.5));
    }

    #[tokio::test]
    async fn batch_gauge_last_write_wins() {
        let repo = repo();
        let body = br#"[
            {"id":"g","type":"gauge","value":1},
            {"id":"g","type":"gauge","value":2}
        ]"#;
        update_batch(&repo, JSON, body).await.unwrap();
        assert_eq!(repo.gauge("g").await.unwrap(), Some(2.0));
    }

    #[tokio::test]
    async fn batch_with_nothing_usable_is_rejected() {
        let repo = repo();
        let err = update_batch(&repo, JSON, br#"[{"id":"","type":"counter","delta":1}]"#)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "nothing to update");
    }

    #[tokio::test]
    async fn plain_text_content_type_is_rejected() {
        let repo = repo();
        let err = update_from_body(&repo, Some("text/plain"), b"{}").await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "unsupported content type");

        let err = update_from_body(&repo, None, b"{}").await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_kind_in_path_is_rejected() {
        let repo = repo();
        let err = update_from_path(&repo, "bogus", "x", "1").await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "incorrect request type");
    }

    #[tokio::test]
    async fn unknown_kind_in_body_is_rejected() {
        let repo = repo();
        let err = update_from_body(&repo, JSON, br#"{"id":"x","type":"bogus","value":1}"#)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "incorrect request type");
    }

    #[tokio::test]
    async fn unknown_kind_in_batch_is_rejected() {
        let repo = repo();
        let err = update_batch(&repo, JSON, br#"[{"id":"x","type":"bogus","value":1}]"#)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "incorrect request type");
    }

    #[tokio::test]
    async fn unknown_kind_in_value_query_is_rejected() {
        let repo = repo();
        let err = value_json(&repo, JSON, br#"{"id":"x","type":"bogus"}"#).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "incorrect request type");
    }

    #[tokio::test]
    async fn empty_id_is_checked_before_kind() {
        let repo = repo();

        let err = update_from_body(&repo, JSON, br#"{"id":"","type":"bogus","value":1}"#)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "name must contain a value");

        let err = value_json(&repo, JSON, br#"{"id":"","type":"bogus"}"#).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "name must contain a value");
    }

    #[tokio::test]
    async fn empty_name_in_path_is_not_found() {
        let repo = repo();
        let err = update_from_path(&repo, "counter", "", "1").await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "name must contain a value");
    }

    #[tokio::test]
    async fn invalid_numeric_value_is_rejected() {
        let repo = repo();
        let err = update_from_path(&repo, "gauge", "g", "abc").await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "invalid value");

        // counters don't take floats
        let err = update_from_path(&repo, "counter", "c", "1.5").await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_metric_reads_as_not_found() {
        let repo = repo();
        let err = value_text(&repo, "gauge", "nope").await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "value doesn't exist in the storage");
    }

    #[tokio::test]
    async fn value_text_formats_gauges() {
        let repo = repo();
        repo.set_gauge("g", 100.0).await.unwrap();
        let resp = value_text(&repo, "gauge", "g").await.unwrap();
        assert_eq!(resp.body, b"100");
    }

    #[tokio::test]
    async fn index_lists_both_kinds() {
        let repo = repo();
        repo.set_gauge("Alloc", 3.5).await.unwrap();
        repo.set_counter("PollCount", 7).await.unwrap();

        let resp = index(&repo).await.unwrap();
        let page = String::from_utf8(resp.body).unwrap();
        assert!(page.contains("<td>Alloc</td><td>3.5</td>"));
        assert!(page.contains("<td>PollCount</td><td>7</td>"));
    }

    #[tokio::test]
    async fn ping_reports_memory_backend_as_unhealthy() {
        let repo = repo();
        let err = ping(&repo).await.unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
