// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Local HTTP endpoints exposing what this worker is doing right now.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use serde_json::json;
use std::io;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use combaine_worker::WorkerView;

const INFO_ENDPOINT_PATH: &str = "/info";
const STATS_ENDPOINT_PATH: &str = "/stats";

/// Serves `/info` and `/stats` on the given port until `shutdown` fires.
pub async fn serve(
    port: u16,
    view: WorkerView,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("status endpoints listening on port {port}");
    serve_on(listener, view, shutdown).await
}

async fn serve_on(
    listener: tokio::net::TcpListener,
    view: WorkerView,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = tokio::task::JoinSet::new();

    let service = service_fn(move |req| {
        let view = view.clone();
        async move { handle(&req, &view) }
    });

    loop {
        let conn = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("status endpoints stopping");
                return Ok(());
            }
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("status server error: {e}");
                    return Err(e.into());
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    // Don't kill the server on panic - log and continue
                    error!("status connection handler panicked: {e:?}");
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
        };
        let conn = hyper_util::rt::TokioIo::new(conn);
        let server = server.clone();
        let service = service.clone();
        joinset.spawn(async move {
            if let Err(e) = server.serve_connection(conn, service).await {
                error!("status connection error: {e}");
            }
        });
    }
}

fn handle(
    req: &Request<hyper::body::Incoming>,
    view: &WorkerView,
) -> http::Result<Response<Full<Bytes>>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, INFO_ENDPOINT_PATH) => {
            let membership = view.membership();
            let members = membership
                .members
                .iter()
                .map(|worker| worker.as_str())
                .collect::<Vec<_>>();
            let owned_groups = view
                .groups()
                .into_iter()
                .map(|(group, state)| {
                    json!({
                        "group": group.as_str(),
                        "state": state.to_string(),
                    })
                })
                .collect::<Vec<_>>();
            json_response(json!({
                "worker": view.worker().as_str(),
                "joined": membership.joined,
                "members": members,
                "owned_groups": owned_groups,
            }))
        }
        (&Method::GET, STATS_ENDPOINT_PATH) => json_response(json!(view.stats())),
        _ => {
            let mut not_found = Response::default();
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Ok(not_found)
        }
    }
}

fn json_response(body: serde_json::Value) -> http::Result<Response<Full<Bytes>>> {
    Response::builder()
        .status(200)
        .body(Full::new(Bytes::from(body.to_string())))
}
