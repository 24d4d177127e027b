//! The unprivileged API plane.
//!
//! A separate process, spawned and supervised by the control plane, that
//! exposes the operator HTTP surface.  It owns no kernel state: every
//! operation is forwarded over the control socket with the capability token
//! it was issued at spawn, and the peer address of each HTTP client rides
//! along so the control plane can judge lockout.  Sandboxing (its own
//! network namespace, its unprivileged user) is install plumbing; nothing
//! here needs or uses privileges.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::UnixStream;
use tracing::{error, info};

use zonewall_api::codec::{Decoder, Encoder};
use zonewall_api::msg::OpResult;
use zonewall_api::{ApiError, Op, Request, Response, ResponseBody};

struct Apid {
    socket_path: String,
    token: String,
    next_id: AtomicU64,
}

type Ctx = State<Arc<Apid>>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().init();

    let Ok(socket_path) = std::env::var("ZONEWALL_CONTROL_SOCKET") else {
        error!("ZONEWALL_CONTROL_SOCKET is not set");
        return ExitCode::from(2);
    };
    let Ok(token) = std::env::var("ZONEWALL_API_TOKEN") else {
        error!("ZONEWALL_API_TOKEN is not set");
        return ExitCode::from(2);
    };
    let listen: SocketAddr = match std::env::var("ZONEWALL_API_LISTEN")
        .unwrap_or_else(|_| "127.0.0.1:8443".into())
        .parse()
    {
        Ok(listen) => listen,
        Err(err) => {
            error!("ZONEWALL_API_LISTEN is invalid: {err}");
            return ExitCode::from(2);
        }
    };

    let state = Arc::new(Apid {
        socket_path,
        token,
        next_id: AtomicU64::new(1),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/config", get(config_get))
        .route("/v1/config/apply", post(config_apply))
        .route("/v1/config/safe_apply", post(config_safe_apply))
        .route("/v1/config/confirm", post(config_confirm))
        .route("/v1/config/diff", post(config_diff))
        .route("/v1/firewall", get(firewall_show))
        .route("/v1/firewall/counters", get(firewall_counters))
        .route("/v1/ipsets", get(ipset_list))
        .route("/v1/ipset/{name}", get(ipset_show))
        .route("/v1/ipset/{name}/add", post(ipset_add))
        .route("/v1/ipset/{name}/remove", post(ipset_remove))
        .route("/v1/ipset/{name}/flush", post(ipset_flush))
        .route("/v1/backups", get(backup_list))
        .route("/v1/backups/create", post(backup_create))
        .route("/v1/backups/{id}/restore", post(backup_restore))
        .route("/v1/events", get(events))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(listen).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Could not bind {listen}: {err}");
            return ExitCode::FAILURE;
        }
    };

    info!("API plane listening on {listen}");
    match axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

//--- Control-channel plumbing

impl Apid {
    /// One request over a fresh control connection.
    async fn call(&self, op: Op, client_addr: Option<SocketAddr>) -> Result<OpResult, ApiError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|err| ApiError::Internal {
                reason: format!("the control plane is unreachable: {err}"),
            })?;
        let (read, write) = tokio::io::split(stream);
        let mut reader = tokio_util::codec::FramedRead::new(read, Decoder::<Response>::default());
        let mut writer = tokio_util::codec::FramedWrite::new(write, Encoder::<Request>::default());

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        writer
            .send(&Request {
                id,
                token: Some(self.token.clone()),
                deadline_secs: Some(120),
                client_addr: client_addr.map(|addr| addr.ip()),
                op,
            })
            .await
            .map_err(|err| ApiError::Internal {
                reason: format!("could not reach the control plane: {err}"),
            })?;

        loop {
            let frame = reader.next().await.ok_or(ApiError::Internal {
                reason: "the control plane hung up".into(),
            })?;
            let response = frame.map_err(|err| ApiError::Internal {
                reason: format!("bad frame from the control plane: {err}"),
            })?;
            if response.id != id {
                continue;
            }
            if let ResponseBody::Result(result) = response.body {
                return result;
            }
        }
    }
}

/// Map an operation result (or error) onto HTTP.
fn reply(result: Result<OpResult, ApiError>) -> HttpResponse {
    match result {
        Ok(result) => Json(result).into_response(),
        Err(err) => {
            let status = match &err {
                ApiError::Parse { .. } | ApiError::Validate { .. } | ApiError::Capability { .. } => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                ApiError::Forbidden { .. } => StatusCode::FORBIDDEN,
                ApiError::Lockout { .. } | ApiError::Conflict { .. } => StatusCode::CONFLICT,
                ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(err)).into_response()
        }
    }
}

//--- Handlers

async fn health(State(apid): Ctx) -> HttpResponse {
    reply(apid.call(Op::Health, None).await)
}

async fn config_get(
    State(apid): Ctx,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> HttpResponse {
    reply(apid.call(Op::ConfigGet, Some(addr)).await)
}

#[derive(Deserialize)]
struct ApplyBody {
    document: String,
    #[serde(default)]
    override_lockout: bool,
}

async fn config_apply(
    State(apid): Ctx,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<ApplyBody>,
) -> HttpResponse {
    reply(
        apid.call(
            Op::ConfigApply {
                document: body.document,
                override_lockout: body.override_lockout,
            },
            Some(addr),
        )
        .await,
    )
}

#[derive(Deserialize)]
struct SafeApplyBody {
    document: String,
    rollback_secs: u64,
    #[serde(default)]
    override_lockout: bool,
}

async fn config_safe_apply(
    State(apid): Ctx,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<SafeApplyBody>,
) -> HttpResponse {
    reply(
        apid.call(
            Op::ConfigSafeApply {
                document: body.document,
                rollback_secs: body.rollback_secs,
                override_lockout: body.override_lockout,
            },
            Some(addr),
        )
        .await,
    )
}

async fn config_confirm(
    State(apid): Ctx,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> HttpResponse {
    reply(apid.call(Op::ConfigConfirm, Some(addr)).await)
}

#[derive(Deserialize)]
struct DiffBody {
    document: String,
}

async fn config_diff(
    State(apid): Ctx,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<DiffBody>,
) -> HttpResponse {
    reply(
        apid.call(
            Op::ConfigDiff {
                document: body.document,
            },
            Some(addr),
        )
        .await,
    )
}

async fn firewall_show(
    State(apid): Ctx,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> HttpResponse {
    reply(apid.call(Op::FirewallShow, Some(addr)).await)
}

async fn firewall_counters(
    State(apid): Ctx,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> HttpResponse {
    reply(apid.call(Op::FirewallCounters, Some(addr)).await)
}

async fn ipset_list(
    State(apid): Ctx,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> HttpResponse {
    reply(apid.call(Op::IpsetList, Some(addr)).await)
}

async fn ipset_show(
    State(apid): Ctx,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(name): Path<String>,
) -> HttpResponse {
    reply(apid.call(Op::IpsetShow { name }, Some(addr)).await)
}

#[derive(Deserialize)]
struct ElementBody {
    element: String,
}

async fn ipset_add(
    State(apid): Ctx,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(name): Path<String>,
    Json(body): Json<ElementBody>,
) -> HttpResponse {
    reply(
        apid.call(
            Op::IpsetAdd {
                name,
                element: body.element,
            },
            Some(addr),
        )
        .await,
    )
}

async fn ipset_remove(
    State(apid): Ctx,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(name): Path<String>,
    Json(body): Json<ElementBody>,
) -> HttpResponse {
    reply(
        apid.call(
            Op::IpsetRemove {
                name,
                element: body.element,
            },
            Some(addr),
        )
        .await,
    )
}

async fn ipset_flush(
    State(apid): Ctx,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(name): Path<String>,
) -> HttpResponse {
    reply(apid.call(Op::IpsetFlush { name }, Some(addr)).await)
}

async fn backup_list(
    State(apid): Ctx,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> HttpResponse {
    reply(apid.call(Op::BackupList, Some(addr)).await)
}

#[derive(Deserialize, Default)]
struct BackupBody {
    label: Option<String>,
}

async fn backup_create(
    State(apid): Ctx,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<BackupBody>,
) -> HttpResponse {
    reply(
        apid.call(Op::BackupCreate { label: body.label }, Some(addr))
            .await,
    )
}

async fn backup_restore(
    State(apid): Ctx,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
) -> HttpResponse {
    reply(apid.call(Op::BackupRestore { id }, Some(addr)).await)
}

/// Stream events as newline-delimited JSON.
///
/// The subscription rides its own control connection, which lives as long
/// as the HTTP response body does.
async fn events(State(apid): Ctx, ConnectInfo(addr): ConnectInfo<SocketAddr>) -> HttpResponse {
    let stream = match UnixStream::connect(&apid.socket_path).await {
        Ok(stream) => stream,
        Err(err) => {
            return reply(Err(ApiError::Internal {
                reason: format!("the control plane is unreachable: {err}"),
            }))
        }
    };
    let (read, write) = tokio::io::split(stream);
    let mut reader = tokio_util::codec::FramedRead::new(read, Decoder::<Response>::default());
    let mut writer = tokio_util::codec::FramedWrite::new(write, Encoder::<Request>::default());

    let id = apid.next_id.fetch_add(1, Ordering::Relaxed);
    let subscribed = writer
        .send(&Request {
            id,
            token: Some(apid.token.clone()),
            deadline_secs: None,
            client_addr: Some(addr.ip()),
            op: Op::EventsSubscribe,
        })
        .await;
    if subscribed.is_err() {
        return reply(Err(ApiError::Internal {
            reason: "could not subscribe".into(),
        }));
    }

    let body = async_stream_body(reader, writer);
    HttpResponse::builder()
        .header("content-type", "application/x-ndjson")
        .body(body)
        .expect("a valid response")
}

fn async_stream_body(
    mut reader: tokio_util::codec::FramedRead<
        tokio::io::ReadHalf<UnixStream>,
        Decoder<Response>,
    >,
    writer: tokio_util::codec::FramedWrite<
        tokio::io::WriteHalf<UnixStream>,
        Encoder<Request>,
    >,
) -> Body {
    let stream = futures::stream::poll_fn(move |cx| {
        // The writer must live as long as the subscription.
        let _ = &writer;
        reader.poll_next_unpin(cx)
    })
    .filter_map(|frame| async move {
        let response = frame.ok()?;
        match response.body {
            ResponseBody::Event(event) => {
                let mut line = serde_json::to_vec(&event).ok()?;
                line.push(b'\n');
                Some(Ok::<_, std::io::Error>(line))
            }
            ResponseBody::Result(_) => None,
        }
    });
    Body::from_stream(stream)
}
