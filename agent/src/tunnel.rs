use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use axum::Router;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

use crate::args::TunnelArgs;
use crate::health::{ComponentState, HealthState};

/// Keepalive cadence and how long a pong may lag before the channel is
/// considered half-open and torn down.
const PING_INTERVAL: Duration = Duration::from_secs(25);
const PONG_DEADLINE: Duration = Duration::from_secs(10);

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Largest response body relayed through the tunnel.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// One JSON object per WebSocket text frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelMessage {
    #[serde(rename_all = "camelCase")]
    HttpRequest {
        request_id: String,
        method: String,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body_base64: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    HttpResponse {
        request_id: String,
        status_code: u16,
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body_base64: Option<String>,
    },
}

pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_CAP)
}

/// Execute a tunnelled request against the local HTTP dispatcher without
/// touching the network socket, and shape the reply frame. Local execution
/// errors become a 500 with a JSON error body.
pub async fn execute_local(
    router: Router,
    request_id: String,
    method: String,
    url: String,
    headers: HashMap<String, String>,
    body_base64: Option<String>,
) -> TunnelMessage {
    match run_local(router, &method, &url, headers, body_base64).await {
        Ok((status_code, headers, body_base64)) => TunnelMessage::HttpResponse {
            request_id,
            status_code,
            headers,
            body_base64,
        },
        Err(e) => {
            let body = serde_json::json!({ "error": format!("{e:#}") }).to_string();
            TunnelMessage::HttpResponse {
                request_id,
                status_code: 500,
                headers: HashMap::from([(
                    "content-type".to_string(),
                    "application/json".to_string(),
                )]),
                body_base64: Some(BASE64.encode(body)),
            }
        }
    }
}

async fn run_local(
    router: Router,
    method: &str,
    url: &str,
    headers: HashMap<String, String>,
    body_base64: Option<String>,
) -> Result<(u16, HashMap<String, String>, Option<String>)> {
    let method: axum::http::Method = method.parse().context("invalid method")?;
    let body = match body_base64 {
        Some(encoded) => BASE64.decode(encoded).context("invalid request body")?,
        None => Vec::new(),
    };

    let mut builder = axum::http::Request::builder().method(method).uri(url);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    let request = builder
        .body(axum::body::Body::from(body))
        .context("failed to build local request")?;

    let response = router
        .oneshot(request)
        .await
        .context("local dispatch failed")?;

    let status_code = response.status().as_u16();
    let mut response_headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            response_headers.insert(name.to_string(), value.to_string());
        }
    }

    let bytes = axum::body::to_bytes(response.into_body(), MAX_BODY_BYTES)
        .await
        .context("failed to collect response body")?;
    let body_base64 = if bytes.is_empty() {
        None
    } else {
        Some(BASE64.encode(&bytes))
    };

    Ok((status_code, response_headers, body_base64))
}

/// Long-lived reverse tunnel: connect out to the control plane, execute
/// incoming `http_request` frames against the local dispatcher and stream
/// replies back. Reconnects with exponential backoff; absent configuration
/// leaves the tunnel disabled without error.
pub async fn run_tunnel(
    args: TunnelArgs,
    router: Router,
    health: Arc<HealthState>,
    cancel: CancellationToken,
) -> Result<()> {
    let (Some(url), Some(token)) = (args.tunnel_url.clone(), args.tunnel_token.clone()) else {
        tracing::info!("tunnel not configured, staying disabled");
        health.set_tunnel(ComponentState::Disabled);
        return Ok(());
    };

    let mut backoff = BACKOFF_INITIAL;
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        health.set_tunnel(ComponentState::Starting);

        match run_connection(&url, &token, &args.tunnel_agent_id, &router, &health, &cancel).await {
            Ok(()) => {
                // Clean shutdown
                health.set_tunnel(ComponentState::Disabled);
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(error = %e, backoff_secs = backoff.as_secs(), "tunnel dropped, reconnecting");
                health.set_tunnel(ComponentState::Error(format!("{e:#}")));
            }
        }

        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = next_backoff(backoff);
    }
}

async fn run_connection(
    url: &str,
    token: &str,
    agent_id: &str,
    router: &Router,
    health: &Arc<HealthState>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut request = url
        .into_client_request()
        .context("invalid tunnel url")?;
    request.headers_mut().insert(
        "authorization",
        format!("Bearer {token}")
            .parse()
            .context("invalid tunnel token")?,
    );
    request.headers_mut().insert(
        "x-agent-id",
        agent_id.parse().context("invalid agent id")?,
    );

    let (ws, _) = connect_async(request)
        .await
        .context("tunnel connect failed")?;
    tracing::info!(url = %url, "tunnel connected");
    health.set_tunnel(ComponentState::Running);

    let (mut sink, mut stream) = ws.split();

    // Response frames from in-flight request tasks
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.tick().await; // the first tick fires immediately
    let mut pong_check = tokio::time::interval(Duration::from_secs(1));
    let mut awaiting_pong: Option<Instant> = None;
    let mut ping_seq: u64 = 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "agent shutting down".into(),
                    })))
                    .await;
                return Ok(());
            }

            _ = ping_timer.tick() => {
                ping_seq += 1;
                sink.send(Message::Ping(ping_seq.to_be_bytes().to_vec().into()))
                    .await
                    .context("failed to send ping")?;
                awaiting_pong = Some(Instant::now());
            }

            _ = pong_check.tick() => {
                if let Some(sent) = awaiting_pong
                    && sent.elapsed() > PONG_DEADLINE
                {
                    // Half-open socket: tear down and let the caller reconnect
                    bail!("pong not received within {}s", PONG_DEADLINE.as_secs());
                }
            }

            outgoing = out_rx.recv() => {
                let Some(message) = outgoing else { bail!("response channel closed") };
                sink.send(message).await.context("failed to send response frame")?;
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = None;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        sink.send(Message::Pong(payload))
                            .await
                            .context("failed to answer ping")?;
                    }
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(text.as_str(), router, &out_tx);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        bail!("tunnel closed by remote: {:?}", frame);
                    }
                    Some(Ok(_)) => {} // binary frames are not part of the protocol
                    Some(Err(e)) => return Err(e).context("tunnel read failed"),
                    None => bail!("tunnel stream ended"),
                }
            }
        }
    }
}

fn handle_frame(text: &str, router: &Router, out_tx: &mpsc::Sender<Message>) {
    let frame: TunnelMessage = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable tunnel frame");
            return;
        }
    };

    let TunnelMessage::HttpRequest {
        request_id,
        method,
        url,
        headers,
        body_base64,
    } = frame
    else {
        tracing::warn!("unexpected http_response frame from remote");
        return;
    };

    let router = router.clone();
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        tracing::debug!(request_id = %request_id, method = %method, url = %url, "tunnel request");
        let response =
            execute_local(router, request_id, method, url, headers, body_base64).await;
        match serde_json::to_string(&response) {
            Ok(json) => {
                if out_tx.send(Message::Text(json.into())).await.is_err() {
                    tracing::warn!("tunnel closed before response could be sent");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize tunnel response"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[test]
    fn frames_use_the_wire_field_names() {
        let frame = TunnelMessage::HttpResponse {
            request_id: "r-1".into(),
            status_code: 200,
            headers: HashMap::new(),
            body_base64: Some("aGk=".into()),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "http_response");
        assert_eq!(json["requestId"], "r-1");
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["bodyBase64"], "aGk=");

        let incoming = r#"{
            "type": "http_request",
            "requestId": "r-2",
            "method": "GET",
            "url": "/healthz",
            "headers": {"accept": "application/json"}
        }"#;
        let parsed: TunnelMessage = serde_json::from_str(incoming).unwrap();
        match parsed {
            TunnelMessage::HttpRequest {
                request_id,
                method,
                url,
                headers,
                body_base64,
            } => {
                assert_eq!(request_id, "r-2");
                assert_eq!(method, "GET");
                assert_eq!(url, "/healthz");
                assert_eq!(headers.get("accept").unwrap(), "application/json");
                assert!(body_base64.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = BACKOFF_INITIAL;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(backoff.as_secs());
            backoff = next_backoff(backoff);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30]);
        assert_eq!(next_backoff(backoff).as_secs(), 30);
    }

    fn test_router() -> Router {
        Router::new()
            .route(
                "/v1/ping",
                get(|| async { axum::Json(serde_json::json!({ "pong": true })) }),
            )
            .route(
                "/v1/echo",
                axum::routing::post(|body: axum::body::Bytes| async move { body }),
            )
    }

    #[tokio::test]
    async fn executes_requests_against_the_local_dispatcher() {
        let response = execute_local(
            test_router(),
            "r-1".into(),
            "GET".into(),
            "/v1/ping".into(),
            HashMap::new(),
            None,
        )
        .await;

        let TunnelMessage::HttpResponse {
            request_id,
            status_code,
            body_base64,
            ..
        } = response
        else {
            panic!("wrong variant");
        };
        assert_eq!(request_id, "r-1");
        assert_eq!(status_code, 200);
        let body = BASE64.decode(body_base64.unwrap()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["pong"], true);
    }

    #[tokio::test]
    async fn request_bodies_ride_through_base64() {
        let response = execute_local(
            test_router(),
            "r-4".into(),
            "POST".into(),
            "/v1/echo".into(),
            HashMap::new(),
            Some(BASE64.encode(b"tunnelled payload")),
        )
        .await;
        let TunnelMessage::HttpResponse {
            status_code,
            body_base64,
            ..
        } = response
        else {
            panic!("wrong variant");
        };
        assert_eq!(status_code, 200);
        assert_eq!(
            BASE64.decode(body_base64.unwrap()).unwrap(),
            b"tunnelled payload"
        );
    }

    #[tokio::test]
    async fn unknown_route_passes_through_as_404() {
        let response = execute_local(
            test_router(),
            "r-2".into(),
            "GET".into(),
            "/nope".into(),
            HashMap::new(),
            None,
        )
        .await;
        let TunnelMessage::HttpResponse { status_code, .. } = response else {
            panic!("wrong variant");
        };
        assert_eq!(status_code, 404);
    }

    #[tokio::test]
    async fn local_execution_errors_become_500_with_json_body() {
        let response = execute_local(
            test_router(),
            "r-3".into(),
            "NOT A METHOD".into(),
            "/v1/ping".into(),
            HashMap::new(),
            None,
        )
        .await;
        let TunnelMessage::HttpResponse {
            status_code,
            headers,
            body_base64,
            ..
        } = response
        else {
            panic!("wrong variant");
        };
        assert_eq!(status_code, 500);
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        let body = BASE64.decode(body_base64.unwrap()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(value["error"].as_str().unwrap().contains("method"));
    }
}
