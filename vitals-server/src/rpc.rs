//! gRPC mirror of the update/lookup surface.
//!
//! Structurally identical to the HTTP handlers: the same validation order,
//! the same batch collapse, with statuses mapped to `InvalidArgument` /
//! `NotFound` / `Internal`.

use crate::http::handlers::collapse_batch;
use crate::repo::Repository;
use std::sync::Arc;
use tokio::sync::broadcast;
use tonic::{Request, Response, Status};
use tracing::{info, instrument};
use vitals_core::error::{Result, VitalsError};
use vitals_core::metric::{MetricKind, MetricRecord};

use vitals_api::vitals::v1::metrics_server::{Metrics, MetricsServer};
use vitals_api::vitals::v1::{
    GetMetricRequest, GetMetricResponse, MetricRec, UpdateBatchRequest, UpdateBatchResponse,
    UpdateMetricRequest, UpdateMetricResponse,
};

pub struct MetricsService {
    repo: Arc<Repository>,
}

impl MetricsService {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }
}

#[tonic::async_trait]
impl Metrics for MetricsService {
    #[instrument(skip(self, request))]
    async fn update_metric(
        &self,
        request: Request<UpdateMetricRequest>,
    ) -> std::result::Result<Response<UpdateMetricResponse>, Status> {
        let rec = request
            .into_inner()
            .metric
            .ok_or_else(|| Status::invalid_argument("metric is required"))?;

        if rec.id.is_empty() {
            return Err(Status::invalid_argument("name must contain a value"));
        }

        let kind: MetricKind = rec
            .kind
            .parse()
            .map_err(|_| Status::invalid_argument("incorrect request type"))?;
        match kind {
            MetricKind::Gauge => {
                self.repo
                    .set_gauge(&rec.id, rec.value)
                    .await
                    .map_err(|_| Status::internal("setting gauge value in db failed"))?;
            }
            MetricKind::Counter => {
                self.repo
                    .set_counter(&rec.id, rec.delta)
                    .await
                    .map_err(|_| Status::internal("setting counter value in db failed"))?;
            }
        }

        Ok(Response::new(UpdateMetricResponse { id: rec.id }))
    }

    #[instrument(skip(self, request))]
    async fn update_batch(
        &self,
        request: Request<UpdateBatchRequest>,
    ) -> std::result::Result<Response<UpdateBatchResponse>, Status> {
        let incoming = request.into_inner().metrics;

        let mut records = Vec::with_capacity(incoming.len());
        let mut accepted: i64 = 0;
        for rec in &incoming {
            if rec.id.is_empty() {
                continue;
            }
            accepted += 1;
            records.push(MetricRecord {
                id: rec.id.clone(),
                kind: rec.kind.clone(),
                value: Some(rec.value),
                delta: Some(rec.delta),
            });
        }

        let (gauges, counters) =
            collapse_batch(&records).map_err(|e| Status::invalid_argument(e.message))?;
        if gauges.is_empty() && counters.is_empty() {
            return Err(Status::invalid_argument("nothing to update"));
        }

        if !gauges.is_empty() {
            self.repo
                .set_gauge_all(gauges)
                .await
                .map_err(|_| Status::internal("gauge batch update to db failed"))?;
        }
        if !counters.is_empty() {
            self.repo
                .set_counter_all(counters)
                .await
                .map_err(|_| Status::internal("counter batch update to db failed"))?;
        }

        Ok(Response::new(UpdateBatchResponse { size: accepted }))
    }

    #[instrument(skip(self, request))]
    async fn get_metric(
        &self,
        request: Request<GetMetricRequest>,
    ) -> std::result::Result<Response<GetMetricResponse>, Status> {
        let rec = request
            .into_inner()
            .metric
            .ok_or_else(|| Status::invalid_argument("metric is required"))?;

        if rec.id.is_empty() {
            return Err(Status::invalid_argument("name must contain a value"));
        }

        let kind: MetricKind = rec
            .kind
            .parse()
            .map_err(|_| Status::invalid_argument("incorrect request type"))?;

        let found = match kind {
            MetricKind::Gauge => self
                .repo
                .gauge(&rec.id)
                .await
                .map_err(|_| Status::internal("getting gauge value from db failed"))?
                .map(|v| MetricRec { id: rec.id.clone(), kind: rec.kind.clone(), value: v, delta: 0 }),
            MetricKind::Counter => self
                .repo
                .counter(&rec.id)
                .await
                .map_err(|_| Status::internal("getting counter value from db failed"))?
                .map(|d| MetricRec { id: rec.id.clone(), kind: rec.kind.clone(), value: 0.0, delta: d }),
        };

        match found {
            Some(metric) => Ok(Response::new(GetMetricResponse { metric: Some(metric) })),
            None => Err(Status::not_found("value doesn't exist in the storage")),
        }
    }
}

/// Serve the gRPC mirror until shutdown.
pub async fn serve(
    addr: &str,
    repo: Arc<Repository>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let socket_addr = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| VitalsError::InvalidConfig { reason: format!("bad rpc address {addr}: {e}") })?
        .next()
        .ok_or_else(|| VitalsError::InvalidConfig {
            reason: format!("rpc address {addr} did not resolve"),
        })?;

    info!(addr, "grpc server listening");

    tonic::transport::Server::builder()
        .add_service(MetricsServer::new(MetricsService::new(repo)))
        .serve_with_shutdown(socket_addr, async move {
            let _ = shutdown.recv().await;
        })
        .await
        .map_err(|e| VitalsError::Internal(format!("grpc server error: {e}")))?;

    info!("grpc server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::Backup;
    use std::path::PathBuf;

    fn service() -> MetricsService {
        let repo =
            Repository::in_memory(Backup::new(PathBuf::from("unused.json"), 300, false));
        MetricsService::new(Arc::new(repo))
    }

    fn counter_rec(id: &str, delta: i64) -> MetricRec {
        MetricRec { id: id.to_string(), kind: "counter".to_string(), value: 0.0, delta }
    }

    fn gauge_rec(id: &str, value: f64) -> MetricRec {
        MetricRec { id: id.to_string(), kind: "gauge".to_string(), value, delta: 0 }
    }

    #[tokio::test]
    async fn update_and_get_round_trip() {
        let svc = service();

        svc.update_metric(Request::new(UpdateMetricRequest {
            metric: Some(counter_rec("PollCount", 5)),
        }))
        .await
        .unwrap();

        let resp = svc
            .get_metric(Request::new(GetMetricRequest { metric: Some(counter_rec("PollCount", 0)) }))
            .await
            .unwrap();
        assert_eq!(resp.into_inner().metric.unwrap().delta, 5);
    }

    #[tokio::test]
    async fn batch_collapse_matches_http_semantics() {
        let svc = service();

        let resp = svc
            .update_batch(Request::new(UpdateBatchRequest {
                metrics: vec![counter_rec("c", 1), counter_rec("c", 2), gauge_rec("g", 3.5)],
            }))
            .await
            .unwrap();
        assert_eq!(resp.into_inner().size, 3);

        let c = svc
            .get_metric(Request::new(GetMetricRequest { metric: Some(counter_rec("c", 0)) }))
            .await
            .unwrap();
        assert_eq!(c.into_inner().metric.unwrap().delta, 3);
    }

    #[tokio::test]
    async fn unknown_kind_is_invalid_argument() {
        let svc = service();
        let err = svc
            .update_metric(Request::new(UpdateMetricRequest {
                metric: Some(MetricRec {
                    id: "x".to_string(),
                    kind: "bogus".to_string(),
                    value: 0.0,
                    delta: 0,
                }),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn missing_metric_is_not_found() {
        let svc = service();
        let err = svc
            .get_metric(Request::new(GetMetricRequest { metric: Some(gauge_rec("nope", 0.0)) }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }
}
