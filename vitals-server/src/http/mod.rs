//! HTTP surface.
//!
//! A hand-rolled hyper service: each request body is buffered, pushed
//! through the middleware pipeline, dispatched by path, and the response is
//! signed/compressed on the way out. Connections are tracked so shutdown
//! can drain in-flight requests under a timeout.

use crate::repo::Repository;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONTENT_ENCODING, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use ip_network::IpNetwork;
use rsa::RsaPrivateKey;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use vitals_core::envelope;
use vitals_core::error::{Result, VitalsError};

pub mod handlers;
pub mod middleware;

use handlers::{ApiError, ApiResponse};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a request handler needs, constructed once at startup.
pub struct AppState {
    pub repo: Arc<Repository>,
    pub key: Option<String>,
    pub private_key: Option<RsaPrivateKey>,
    pub trusted_subnet: Option<IpNetwork>,
}

/// Run the HTTP server until shutdown, then drain in-flight connections.
pub async fn serve(
    addr: &str,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| VitalsError::InvalidConfig {
        reason: format!("failed to bind {addr}: {e}"),
    })?;
    info!(addr, "http server listening");

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let io = TokioIo::new(stream);
                        let state = state.clone();
                        connections.spawn(async move {
                            let service =
                                service_fn(move |req| handle(req, state.clone()));
                            if let Err(e) =
                                http1::Builder::new().serve_connection(io, service).await
                            {
                                debug!(error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept connection"),
                }
            }
        }
    }

    drop(listener);
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        warn!("timed out performing graceful shutdown");
        connections.abort_all();
    }

    info!("http server stopped");
    Ok(())
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> http::Result<Response<Full<Bytes>>> {
    let start = Instant::now();
    let (parts, body) = req.into_parts();
    let method = parts.method.clone();
    let uri = parts.uri.clone();

    let path = uri.path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let update_surface = matches!(segments.first(), Some(&"update") | Some(&"updates"));

    let outcome = process(&state, &parts, &segments, update_surface, body).await;

    let (status, content_type, mut out_body) = match outcome {
        Ok(resp) => (resp.status, resp.content_type, resp.body),
        Err(e) => {
            match &e.cause {
                Some(cause) => error!(message = %e.message, cause = %cause, "request failed"),
                None => error!(message = %e.message, "request failed"),
            }
            let mut msg = e.message.into_bytes();
            msg.push(b'\n');
            (e.status, handlers::TEXT_PLAIN, msg)
        }
    };

    let mut builder = Response::builder().status(status).header(CONTENT_TYPE, content_type);

    if middleware::should_compress_response(&parts.headers, content_type) {
        if let Ok(packed) = envelope::compress(&out_body) {
            out_body = packed;
            builder = builder.header(CONTENT_ENCODING, "gzip");
        }
    }

    // The response signature covers the bytes that go on the wire.
    if update_surface {
        if let Some(key) = &state.key {
            if let Some(signature) = middleware::sign_response(key, &out_body) {
                builder = builder.header(middleware::SIGNATURE_HEADER.clone(), signature);
            }
        }
    }

    let size = out_body.len();
    let response = builder.body(Full::new(Bytes::from(out_body)))?;

    info!(
        uri = %uri,
        method = %method,
        duration_ms = start.elapsed().as_millis() as u64,
        code = status.as_u16(),
        size,
        "request handled"
    );
    Ok(response)
}

async fn process(
    state: &AppState,
    parts: &http::request::Parts,
    segments: &[&str],
    update_surface: bool,
    body: Incoming,
) -> std::result::Result<ApiResponse, ApiError> {
    let collected = body.collect().await.map_err(|e| {
        ApiError::with_cause(
            StatusCode::INTERNAL_SERVER_ERROR,
            "working with request body failed",
            VitalsError::internal(e),
        )
    })?;
    let mut body = collected.to_bytes().to_vec();

    body = middleware::decompress_request(&parts.headers, body)?;

    if let Some(net) = &state.trusted_subnet {
        middleware::admit_subnet(net, &parts.headers)?;
    }

    if update_surface {
        if let Some(key) = &state.key {
            middleware::verify_signature(key, &parts.headers, &body)?;
        }
        if let Some(private_key) = &state.private_key {
            body = middleware::decrypt_request(private_key, &body)?;
        }
    }

    let content_type = parts.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    route(state, &parts.method, segments, content_type, &body).await
}

fn method_not_allowed() -> ApiError {
    ApiError::new(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

async fn route(
    state: &AppState,
    method: &Method,
    segments: &[&str],
    content_type: Option<&str>,
    body: &[u8],
) -> std::result::Result<ApiResponse, ApiError> {
    let repo = state.repo.as_ref();
    match segments {
        [] => match *method {
            Method::GET => handlers::index(repo).await,
            _ => Err(method_not_allowed()),
        },
        ["ping"] => match *method {
            Method::GET => handlers::ping(repo).await,
            _ => Err(method_not_allowed()),
        },
        ["value"] => match *method {
            Method::POST => handlers::value_json(repo, content_type, body).await,
            _ => Err(method_not_allowed()),
        },
        ["value", kind, name] => match *method {
            Method::GET => handlers::value_text(repo, kind, name).await,
            _ => Err(method_not_allowed()),
        },
        ["update"] => match *method {
            Method::POST => handlers::update_from_body(repo, content_type, body).await,
            _ => Err(method_not_allowed()),
        },
        ["update", kind, name, value] => match *method {
            Method::POST => handlers::update_from_path(repo, kind, name, value).await,
            _ => Err(method_not_allowed()),
        },
        ["updates"] => match *method {
            Method::POST => handlers::update_batch(repo, content_type, body).await,
            _ => Err(method_not_allowed()),
        },
        _ => Err(ApiError::new(StatusCode::NOT_FOUND, "404 page not found")),
    }
}
