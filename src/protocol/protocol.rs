// author: kodeholic (powered by Claude)
//
// 시그널링 릴레이: SessionStore 를 WebSocket 게이트웨이로 노출
//
// 연결 1개 = 참여자 클라이언트 1개
//   tx_loop : WS 수신 → op 핸들러 dispatch (요청 s 를 응답에 그대로 반영)
//   rx_loop : egress 큐 → WS 송신 (ACK / ERROR / watch 이벤트 공용)
//   watch   : 구독마다 forward 태스크 1개, UNWATCH 또는 연결 종료 시 abort

use axum::{
    extract::{ws::{Message, WebSocket, WebSocketUpgrade}, State},
    response::Response,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config;
use crate::core::{SessionKey, SessionStore};
use crate::error::{CallError, CallResult};
use crate::protocol::{
    error_code::to_error_code,
    message::{
        AckPayload, CandidateAppendPayload, CandidateEventPayload, CandidateWatchPayload,
        DescriptionPayload, ErrorPayload, GatewayPacket, HelloPayload, IdentifyPayload,
        ReadyPayload, SessionClaimPayload, SessionEventPayload, SessionKeyPayload,
        SessionNoncePayload, UnwatchPayload, WatchEndPayload,
    },
    opcode::{client, server},
};
use crate::signaling::{LocalChannel, SignalingChannel};
use crate::trace::{TraceDir, TraceEvent, TraceHub};
use crate::utils::current_timestamp;

// ----------------------------------------------------------------------------
// [공유 상태]
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub store:     Arc<SessionStore>,
    pub trace_hub: Arc<TraceHub>,
}

// ----------------------------------------------------------------------------
// [WS 진입점]
// ----------------------------------------------------------------------------

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

// ----------------------------------------------------------------------------
// [연결 상태]: 개별 WS 연결마다 보유
// ----------------------------------------------------------------------------

struct Connection {
    user_id: Option<String>,
    watches: HashMap<u64, JoinHandle<()>>,
}

impl Connection {
    fn new() -> Self {
        Self { user_id: None, watches: HashMap::new() }
    }

    fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    fn user(&self) -> &str {
        self.user_id.as_deref().unwrap_or("-")
    }

    fn track_watch(&mut self, watch_id: u64, handle: JoinHandle<()>) {
        // 이미 끝난 forward 태스크 정리 (WATCH_END 로 종료된 것들)
        self.watches.retain(|_, h| !h.is_finished());
        if let Some(old) = self.watches.insert(watch_id, handle) {
            old.abort();
        }
    }
}

/// 핸들러 공통 컨텍스트
struct Ctx<'a> {
    tx:      &'a mpsc::Sender<String>,
    state:   &'a AppState,
    channel: &'a LocalChannel,
    seq:     Option<u64>,
}

// ----------------------------------------------------------------------------
// [핵심] 개별 클라이언트 WS 생명주기
// ----------------------------------------------------------------------------

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(config::EGRESS_QUEUE_SIZE);

    let mut conn    = Connection::new();
    let channel     = LocalChannel::new(Arc::clone(&state.store));

    // HELLO 전송
    let hello = make_packet(server::HELLO, HelloPayload {
        heartbeat_interval: config::HEARTBEAT_INTERVAL_MS,
    });
    if ws_tx.send(Message::Text(hello.into())).await.is_err() {
        return;
    }

    // [rx_loop] egress 큐 → WS 송신
    let rx_loop = tokio::spawn(async move {
        while let Some(json) = out_rx.recv().await {
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // [tx_loop] WS 수신 → 핸들러 dispatch
    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(t))  => t,
            Ok(Message::Close(_)) => break,
            Err(e) => { warn!("[relay] WS 에러: {}", e); break; }
            _ => continue,
        };

        let packet: GatewayPacket = match serde_json::from_str(&text) {
            Ok(p)  => p,
            Err(e) => {
                warn!("[relay] 잘못된 패킷 포맷: {}", e);
                let _ = out_tx.send(error_packet(&CallError::InvalidPayload(e.to_string()), None)).await;
                continue;
            }
        };

        let ctx = Ctx { tx: &out_tx, state: &state, channel: &channel, seq: packet.s };

        // IDENTIFY / HEARTBEAT 외에는 인증 필요
        if packet.op != client::IDENTIFY && packet.op != client::HEARTBEAT && !conn.is_authenticated() {
            let _ = out_tx.send(error_packet(&CallError::NotAuthenticated, packet.s)).await;
            continue;
        }

        let result = match packet.op {
            client::HEARTBEAT        => handle_heartbeat(&ctx).await,
            client::IDENTIFY         => handle_identify(&ctx, &mut conn, packet.d).await,
            client::SESSION_CLAIM    => handle_claim(&ctx, &conn, packet.d).await,
            client::SESSION_PURGE    => handle_delete_if(&ctx, &conn, packet.op, packet.d).await,
            client::SESSION_ABANDON  => handle_delete_if(&ctx, &conn, packet.op, packet.d).await,
            client::OFFER_PUBLISH    => handle_publish(&ctx, &conn, packet.op, packet.d).await,
            client::ANSWER_PUBLISH   => handle_publish(&ctx, &conn, packet.op, packet.d).await,
            client::CANDIDATE_APPEND => handle_candidate_append(&ctx, &conn, packet.d).await,
            client::SESSION_DELETE   => handle_session_delete(&ctx, &conn, packet.d).await,
            client::SESSION_WATCH    => handle_session_watch(&ctx, &mut conn, packet.d).await,
            client::CANDIDATE_WATCH  => handle_candidate_watch(&ctx, &mut conn, packet.d).await,
            client::UNWATCH          => handle_unwatch(&ctx, &mut conn, packet.d).await,
            unknown => {
                warn!("[relay] 알 수 없는 opcode: {}", unknown);
                Err(CallError::InvalidOpcode(unknown))
            }
        };

        if let Err(e) = result {
            // SessionGone 은 상대측 정리와의 경합: 정상 흐름
            if e.is_benign() {
                debug!("[relay] op={} user={} {}", client::name(packet.op), conn.user(), e);
            } else {
                warn!("[relay] op={} user={} {}", client::name(packet.op), conn.user(), e);
            }
            let _ = out_tx.send(error_packet(&e, packet.s)).await;
        }
    }

    cleanup(&mut conn);
    rx_loop.abort();
}

// ----------------------------------------------------------------------------
// [op 핸들러들]
// ----------------------------------------------------------------------------

async fn handle_heartbeat(ctx: &Ctx<'_>) -> CallResult<()> {
    trace!("HEARTBEAT 수신");
    send(ctx.tx, make_no_data(server::HEARTBEAT_ACK)).await
}

async fn handle_identify(
    ctx:  &Ctx<'_>,
    conn: &mut Connection,
    d:    Option<serde_json::Value>,
) -> CallResult<()> {
    let payload = parse_payload::<IdentifyPayload>(d)?;
    trace!("IDENTIFY - user_id: {}", payload.user_id);

    // Secret Key 검증 (환경변수 TELEVISIT_SECRET 우선, 없으면 DEFAULT_SECRET_KEY)
    let expected = std::env::var(config::SECRET_ENV)
        .unwrap_or_else(|_| config::DEFAULT_SECRET_KEY.to_string());
    if payload.token != expected {
        warn!("[relay] IDENTIFY 토큰 불일치 - user_id: {}", payload.user_id);
        return Err(CallError::InvalidToken);
    }

    conn.user_id = Some(payload.user_id.clone());
    ctx.state.trace_hub.publish(TraceEvent::new(
        TraceDir::In, None, Some(&payload.user_id), client::IDENTIFY, "IDENTIFY", "identified",
    ));

    send(ctx.tx, make_reply(server::READY, ReadyPayload {
        session_id: format!("sess_{}", current_timestamp()),
        user_id:    payload.user_id,
    }, ctx.seq)).await
}

async fn handle_claim(
    ctx:  &Ctx<'_>,
    conn: &Connection,
    d:    Option<serde_json::Value>,
) -> CallResult<()> {
    let payload = parse_payload::<SessionClaimPayload>(d)?;
    trace!("SESSION_CLAIM - user:{} session:{}", conn.user(), payload.key);

    // 인증된 user_id 로만 claim 가능 (역할 위조 방지)
    if payload.initiator_id != conn.user() {
        return Err(CallError::Authorization(format!(
            "claim as {} on a connection identified as {}", payload.initiator_id, conn.user()
        )));
    }

    let claim = ctx.channel.claim_session(&payload.key, &payload.initiator_id).await?;
    let outcome = match &claim {
        crate::core::Claim::Created(_)  => "created",
        crate::core::Claim::Joined(_)   => "joined",
        crate::core::Claim::Occupied(_) => "occupied",
    };
    trace_in(ctx.state, &payload.key, conn, client::SESSION_CLAIM, outcome);

    ack(ctx, client::SESSION_CLAIM, serde_json::to_value(&claim).unwrap_or_default()).await
}

async fn handle_delete_if(
    ctx:  &Ctx<'_>,
    conn: &Connection,
    op:   u8,
    d:    Option<serde_json::Value>,
) -> CallResult<()> {
    let payload = parse_payload::<SessionNoncePayload>(d)?;
    trace!("{} - user:{} session:{}", client::name(op), conn.user(), payload.key);

    let deleted = if op == client::SESSION_PURGE {
        ctx.channel.purge_stale(&payload.key, &payload.nonce).await?
    } else {
        ctx.channel.abandon_session(&payload.key, &payload.nonce).await?
    };
    trace_in(ctx.state, &payload.key, conn, op, format!("deleted={}", deleted));

    ack(ctx, op, serde_json::json!({ "deleted": deleted })).await
}

async fn handle_publish(
    ctx:  &Ctx<'_>,
    conn: &Connection,
    op:   u8,
    d:    Option<serde_json::Value>,
) -> CallResult<()> {
    let payload = parse_payload::<DescriptionPayload>(d)?;
    trace!("{} - user:{} session:{}", client::name(op), conn.user(), payload.key);

    let sdp_len = payload.description.sdp.len();
    if op == client::OFFER_PUBLISH {
        ctx.channel.publish_offer(&payload.key, payload.description).await?;
    } else {
        ctx.channel.publish_answer(&payload.key, payload.description).await?;
    }
    trace_in(ctx.state, &payload.key, conn, op, format!("sdp {} bytes", sdp_len));

    ack(ctx, op, serde_json::json!({})).await
}

async fn handle_candidate_append(
    ctx:  &Ctx<'_>,
    conn: &Connection,
    d:    Option<serde_json::Value>,
) -> CallResult<()> {
    let payload = parse_payload::<CandidateAppendPayload>(d)?;
    trace!("CANDIDATE_APPEND - user:{} session:{} side:{}", conn.user(), payload.key, payload.side);

    ctx.channel.append_candidate(&payload.key, payload.side, payload.candidate).await?;
    trace_in(ctx.state, &payload.key, conn, client::CANDIDATE_APPEND, payload.side.collection());

    ack(ctx, client::CANDIDATE_APPEND, serde_json::json!({})).await
}

async fn handle_session_delete(
    ctx:  &Ctx<'_>,
    conn: &Connection,
    d:    Option<serde_json::Value>,
) -> CallResult<()> {
    let payload = parse_payload::<SessionKeyPayload>(d)?;
    trace!("SESSION_DELETE - user:{} session:{}", conn.user(), payload.key);

    let deleted = ctx.channel.delete_session(&payload.key).await?;
    trace_in(ctx.state, &payload.key, conn, client::SESSION_DELETE, format!("deleted={}", deleted));

    ack(ctx, client::SESSION_DELETE, serde_json::json!({ "deleted": deleted })).await
}

async fn handle_session_watch(
    ctx:  &Ctx<'_>,
    conn: &mut Connection,
    d:    Option<serde_json::Value>,
) -> CallResult<()> {
    let payload  = parse_payload::<SessionKeyPayload>(d)?;
    let watch_id = require_seq(ctx.seq)?;
    trace!("SESSION_WATCH - user:{} session:{} watch:{}", conn.user(), payload.key, watch_id);

    let mut stream = ctx.channel.watch_session(&payload.key).await?;

    // ACK 가 이벤트보다 먼저 큐에 들어가야 클라이언트가 순서를 보장받음
    ack(ctx, client::SESSION_WATCH, serde_json::json!({ "watch_id": watch_id })).await?;

    let tx = ctx.tx.clone();
    let handle = tokio::spawn(async move {
        while let Some(record) = stream.next().await {
            let json = make_packet(server::SESSION_EVENT, SessionEventPayload { watch_id, record });
            if tx.send(json).await.is_err() {
                return;
            }
        }
        let _ = tx.send(make_packet(server::WATCH_END, WatchEndPayload { watch_id })).await;
    });
    conn.track_watch(watch_id, handle);
    Ok(())
}

async fn handle_candidate_watch(
    ctx:  &Ctx<'_>,
    conn: &mut Connection,
    d:    Option<serde_json::Value>,
) -> CallResult<()> {
    let payload  = parse_payload::<CandidateWatchPayload>(d)?;
    let watch_id = require_seq(ctx.seq)?;
    trace!("CANDIDATE_WATCH - user:{} session:{} side:{} watch:{}",
        conn.user(), payload.key, payload.side, watch_id);

    let mut stream = ctx.channel.watch_candidates(&payload.key, payload.side).await?;
    ack(ctx, client::CANDIDATE_WATCH, serde_json::json!({ "watch_id": watch_id })).await?;

    let tx = ctx.tx.clone();
    let handle = tokio::spawn(async move {
        while let Some(candidate) = stream.next().await {
            let json = make_packet(server::CANDIDATE_EVENT, CandidateEventPayload { watch_id, candidate });
            if tx.send(json).await.is_err() {
                return;
            }
        }
        let _ = tx.send(make_packet(server::WATCH_END, WatchEndPayload { watch_id })).await;
    });
    conn.track_watch(watch_id, handle);
    Ok(())
}

async fn handle_unwatch(
    ctx:  &Ctx<'_>,
    conn: &mut Connection,
    d:    Option<serde_json::Value>,
) -> CallResult<()> {
    let payload = parse_payload::<UnwatchPayload>(d)?;
    trace!("UNWATCH - user:{} watch:{}", conn.user(), payload.watch_id);

    let found = match conn.watches.remove(&payload.watch_id) {
        Some(handle) => { handle.abort(); true }
        None         => false,
    };

    ack(ctx, client::UNWATCH, serde_json::json!({ "watch_id": payload.watch_id, "found": found })).await
}

// ----------------------------------------------------------------------------
// [내부 유틸]
// ----------------------------------------------------------------------------

fn parse_payload<T: serde::de::DeserializeOwned>(
    d: Option<serde_json::Value>,
) -> CallResult<T> {
    let value = d.ok_or_else(|| CallError::InvalidPayload("missing payload".to_string()))?;
    serde_json::from_value(value).map_err(|e| CallError::InvalidPayload(e.to_string()))
}

fn require_seq(seq: Option<u64>) -> CallResult<u64> {
    seq.ok_or_else(|| CallError::InvalidPayload("watch request requires s".to_string()))
}

fn make_packet(op: u8, payload: impl serde::Serialize) -> String {
    make_reply(op, payload, None)
}

/// 요청 s 를 그대로 반영한 응답 패킷
fn make_reply(op: u8, payload: impl serde::Serialize, seq: Option<u64>) -> String {
    serde_json::to_string(&GatewayPacket::new(op, payload).with_seq(seq)).unwrap_or_default()
}

fn make_no_data(op: u8) -> String {
    serde_json::to_string(&GatewayPacket::no_data(op)).unwrap_or_default()
}

fn error_packet(err: &CallError, seq: Option<u64>) -> String {
    make_reply(server::ERROR, ErrorPayload {
        code:   to_error_code(err),
        reason: err.to_string(),
        detail: err.detail(),
    }, seq)
}

async fn ack(ctx: &Ctx<'_>, op: u8, data: serde_json::Value) -> CallResult<()> {
    send(ctx.tx, make_reply(server::ACK, AckPayload { op, data }, ctx.seq)).await
}

async fn send(tx: &mpsc::Sender<String>, json: String) -> CallResult<()> {
    tx.send(json).await.map_err(|e| CallError::InternalError(e.to_string()))
}

fn trace_in(state: &AppState, key: &SessionKey, conn: &Connection, op: u8, summary: impl Into<String>) {
    state.trace_hub.publish(TraceEvent::new(
        TraceDir::In, Some(key), conn.user_id.as_deref(), op, client::name(op), summary,
    ));
}

/// WS 종료 시 클린업: 남은 구독 forward 태스크 전부 중단
/// 세션 레코드는 건드리지 않음 (정리 권한은 참여자 측 Cleanup Coordinator)
fn cleanup(conn: &mut Connection) {
    let watches = conn.watches.len();
    for (_, handle) in conn.watches.drain() {
        handle.abort();
    }
    if let Some(user_id) = conn.user_id.take() {
        trace!("cleanup - user:{} watches:{}", user_id, watches);
    }
}
