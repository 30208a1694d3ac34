//! Report delivery pipeline.
//!
//! A ticker fires every `report_interval` seconds; each firing gets a
//! monotonic job id and spawns a snapshot reader that clones both registers
//! and submits a [`Report`] into a bounded channel. A fixed pool of workers
//! drains the channel and posts each report as one batch with the full
//! integrity envelope. A full channel blocks the readers, which is the
//! intended backpressure on a slow network.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use vitals_core::config::{AgentConfig, DeliveryProtocol};
use vitals_core::envelope;
use vitals_core::error::{Result, VitalsError};
use vitals_core::metric::{CounterMap, GaugeMap, MetricRecord};
use vitals_core::store::MemoryStore;

use vitals_api::vitals::v1::metrics_client::MetricsClient;
use vitals_api::vitals::v1::{MetricRec, UpdateBatchRequest};

const UPDATE_BATCH_PATH: &str = "/updates";
const CHANNEL_CAPACITY: usize = 9;
const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One snapshot of both registers, destined for a single batch POST.
#[derive(Debug)]
pub struct Report {
    pub gauges: GaugeMap,
    pub counters: CounterMap,
    pub id: u64,
}

/// Flatten a report into the wire batch.
pub fn build_batch(gauges: &GaugeMap, counters: &CounterMap) -> Vec<MetricRecord> {
    let mut batch = Vec::with_capacity(gauges.len() + counters.len());
    for (id, value) in gauges {
        batch.push(MetricRecord::gauge(id.clone(), *value));
    }
    for (id, delta) in counters {
        batch.push(MetricRecord::counter(id.clone(), *delta));
    }
    batch
}

fn retry_delay(attempt: u32) -> Duration {
    // 1s, 3s, 5s
    Duration::from_secs(2 * u64::from(attempt) - 1)
}

/// Local address the server's subnet admission will see.
fn local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

pub struct HttpDelivery {
    base_url: String,
    key: Option<String>,
    public_key: Option<rsa::RsaPublicKey>,
    client: reqwest::Client,
    local_ip: String,
}

impl HttpDelivery {
    pub fn new(cfg: &AgentConfig) -> Result<Self> {
        let public_key = cfg.crypto_key.as_ref().map(envelope::read_public_key).transpose()?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| VitalsError::Internal(format!("failed to create http client: {e}")))?;

        Ok(Self {
            base_url: cfg.address.clone(),
            key: cfg.key.clone(),
            public_key,
            client,
            local_ip: local_ip(),
        })
    }

    /// Build the wire body and the detached signature: JSON, optional
    /// hybrid encryption, HMAC over the pre-compression bytes, then gzip.
    pub fn encode(&self, records: &[MetricRecord]) -> Result<(Vec<u8>, Option<String>)> {
        let mut payload = serde_json::to_vec(records)
            .map_err(|e| VitalsError::Internal(format!("marshaling batch failed: {e}")))?;

        if let Some(public_key) = &self.public_key {
            payload = envelope::seal(public_key, &payload)?;
        }

        let signature =
            self.key.as_deref().map(|key| envelope::sign(key, &payload)).transpose()?;

        let body = envelope::compress(&payload)?;
        Ok((body, signature))
    }

    async fn post(&self, path: &str, records: &[MetricRecord]) -> Result<()> {
        let (body, signature) = self.encode(records)?;
        let url = format!("{}{}", self.base_url, path);

        let mut retries = 0u32;
        loop {
            let mut request = self
                .client
                .post(&url)
                .header("Content-Type", "application/json; charset=utf-8")
                .header("Content-Encoding", "gzip")
                .header("Accept-Encoding", "gzip")
                .header("X-Real-IP", &self.local_ip)
                .body(body.clone());
            if let Some(signature) = &signature {
                request = request.header(envelope::SIGNATURE_HEADER, signature.as_str());
            }

            let failure = match request.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if resp.status().is_client_error() => {
                    // The server judged the payload malformed; retrying
                    // the same bytes cannot help.
                    return Err(VitalsError::DeliveryExhausted {
                        attempts: retries + 1,
                        reason: format!("server rejected report: {}", resp.status()),
                    });
                }
                Ok(resp) => format!("server error: {}", resp.status()),
                Err(e) => format!("transport error: {e}"),
            };

            retries += 1;
            if retries > MAX_RETRIES {
                return Err(VitalsError::DeliveryExhausted { attempts: retries, reason: failure });
            }
            let delay = retry_delay(retries);
            warn!(attempt = retries, delay_s = delay.as_secs(), reason = %failure, "retrying delivery");
            tokio::time::sleep(delay).await;
        }
    }
}

enum Transport {
    Http(HttpDelivery),
    Grpc(MetricsClient<tonic::transport::Channel>),
}

impl Transport {
    async fn deliver(&self, records: &[MetricRecord]) -> Result<()> {
        match self {
            Transport::Http(http) => http.post(UPDATE_BATCH_PATH, records).await,
            Transport::Grpc(client) => {
                let metrics = records
                    .iter()
                    .map(|r| MetricRec {
                        id: r.id.clone(),
                        kind: r.kind.clone(),
                        value: r.value.unwrap_or_default(),
                        delta: r.delta.unwrap_or_default(),
                    })
                    .collect();

                let mut client = client.clone();
                client
                    .update_batch(UpdateBatchRequest { metrics })
                    .await
                    .map(|_| ())
                    .map_err(|status| {
                        VitalsError::Internal(format!("grpc batch update failed: {status}"))
                    })
            }
        }
    }
}

pub struct Delivery {
    transport: Arc<Transport>,
    report_interval: u64,
    worker_count: u32,
}

impl Delivery {
    pub async fn from_config(cfg: &AgentConfig) -> Result<Self> {
        let transport = match cfg.protocol {
            DeliveryProtocol::Http => Transport::Http(HttpDelivery::new(cfg)?),
            DeliveryProtocol::Grpc => {
                let client = MetricsClient::connect(cfg.address.clone())
                    .await
                    .map_err(|e| VitalsError::Internal(format!("grpc connect failed: {e}")))?;
                Transport::Grpc(client)
            }
        };

        Ok(Self {
            transport: Arc::new(transport),
            report_interval: cfg.report_interval,
            worker_count: cfg.rate_limit,
        })
    }

    /// Run the pipeline until shutdown: stop the ticker, await outstanding
    /// readers, close the channel, await the worker pool, then return the
    /// graceful-shutdown sentinel.
    pub async fn run(
        self,
        store: Arc<MemoryStore>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let (report_tx, report_rx) = mpsc::channel::<Report>(CHANNEL_CAPACITY);
        let report_rx = Arc::new(Mutex::new(report_rx));

        let mut workers = JoinSet::new();
        for worker in 0..self.worker_count {
            let report_rx = report_rx.clone();
            let transport = self.transport.clone();
            workers.spawn(async move {
                loop {
                    let report = { report_rx.lock().await.recv().await };
                    let Some(report) = report else { break };

                    let records = build_batch(&report.gauges, &report.counters);
                    if records.is_empty() {
                        continue;
                    }
                    match transport.deliver(&records).await {
                        Ok(()) => {
                            metrics::counter!("vitals_agent_reports_total").increment(1);
                            debug!(worker, job = report.id, "report delivered");
                        }
                        Err(e) => {
                            metrics::counter!("vitals_agent_delivery_failures_total").increment(1);
                            error!(worker, job = report.id, error = %e, "report delivery failed");
                        }
                    }
                }
                debug!(worker, "worker drained");
            });
        }

        let mut readers = JoinSet::new();
        let mut ticker = interval(Duration::from_secs(self.report_interval.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        let mut job_id: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    job_id += 1;
                    let store = store.clone();
                    let report_tx = report_tx.clone();
                    let id = job_id;
                    readers.spawn(async move {
                        let (gauges, counters) =
                            tokio::join!(store.gauge_all(), store.counter_all());
                        // A full channel blocks here, slowing the readers.
                        let _ = report_tx.send(Report { gauges, counters, id }).await;
                    });
                    while readers.try_join_next().is_some() {}
                }
                _ = shutdown.recv() => {
                    while readers.join_next().await.is_some() {}
                    drop(report_tx);
                    while workers.join_next().await.is_some() {}
                    info!("delivery pipeline drained");
                    return Err(VitalsError::GracefulShutdown);
                }
            }
        }
    }
}
