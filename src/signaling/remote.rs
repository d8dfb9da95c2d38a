// author: kodeholic (powered by Claude)
//
// WsChannel: 릴레이 서버(protocol.rs)에 WebSocket 으로 접속하는 SignalingChannel
//
// 연결 1개에 태스크 3개:
//   writer    : out 큐 → WS 송신
//   reader    : WS 수신 → s 로 대기 요청 매칭 / watch_id 로 구독 스트림 분배
//   heartbeat : HELLO 에서 받은 주기로 HEARTBEAT
//
// 연결이 끊기면 대기 중 요청은 Signaling 에러, 구독 스트림은 모두 종료

use async_trait::async_trait;
use futures_util::{
    sink::SinkExt,
    stream::{self, BoxStream, StreamExt},
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};

use crate::config;
use crate::core::{Candidate, Claim, Role, SessionDescription, SessionKey};
use crate::error::{CallError, CallResult};
use crate::protocol::{
    error_code::from_error_code,
    message::{
        CandidateAppendPayload, CandidateEventPayload, CandidateWatchPayload, DescriptionPayload,
        ErrorPayload, GatewayPacket, HelloPayload, IdentifyPayload, SessionClaimPayload,
        SessionEventPayload, SessionKeyPayload, SessionNoncePayload, UnwatchPayload,
    },
    opcode::{client, server},
};

use super::{CandidateWatch, SessionWatch, SignalingChannel};

enum Outbound {
    Text(String),
    Close,
}

struct WsInner {
    out_tx:   mpsc::UnboundedSender<Outbound>,
    next_seq: AtomicU64,
    pending:  Mutex<HashMap<u64, oneshot::Sender<CallResult<Value>>>>,
    watches:  Mutex<HashMap<u64, mpsc::UnboundedSender<Value>>>,
    closed:   AtomicBool,
}

impl WsInner {
    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send_packet(&self, packet: GatewayPacket) -> CallResult<()> {
        let json = serde_json::to_string(&packet)
            .map_err(|e| CallError::InternalError(e.to_string()))?;
        self.out_tx
            .send(Outbound::Text(json))
            .map_err(|_| CallError::Signaling("connection closed".to_string()))
    }

    /// 요청 전송 후 같은 s 의 ACK/READY/ERROR 대기
    async fn call(&self, seq: u64, op: u8, payload: impl serde::Serialize) -> CallResult<Value> {
        if self.is_closed() {
            return Err(CallError::Signaling("connection closed".to_string()));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(seq, tx);

        // reader 종료와 경합: 등록 후 다시 확인
        if self.is_closed() {
            self.pending.lock().unwrap().remove(&seq);
            return Err(CallError::Signaling("connection closed".to_string()));
        }

        if let Err(e) = self.send_packet(GatewayPacket::new(op, payload).with_seq(Some(seq))) {
            self.pending.lock().unwrap().remove(&seq);
            return Err(e);
        }

        let limit = Duration::from_millis(config::SIGNALING_REQUEST_TIMEOUT_MS);
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_))     => Err(CallError::Signaling("connection closed".to_string())),
            Err(_) => {
                self.pending.lock().unwrap().remove(&seq);
                Err(CallError::Signaling(format!("{} timed out", client::name(op))))
            }
        }
    }

    /// 연결 종료 처리: 대기 요청 실패 통지, 구독 스트림 종료
    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pending: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(CallError::Signaling("connection closed".to_string())));
        }
        self.watches.lock().unwrap().clear();
    }
}

impl Drop for WsInner {
    fn drop(&mut self) {
        let _ = self.out_tx.send(Outbound::Close);
    }
}

/// 구독 스트림이 drop 되면 서버 측 forward 태스크도 정리
struct WatchGuard {
    inner:    Arc<WsInner>,
    watch_id: u64,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        let removed = self.inner.watches.lock().unwrap().remove(&self.watch_id).is_some();
        if removed && !self.inner.is_closed() {
            let _ = self.inner.send_packet(GatewayPacket::new(
                client::UNWATCH,
                UnwatchPayload { watch_id: self.watch_id },
            ));
        }
    }
}

// ----------------------------------------------------------------------------
// [WsChannel]
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct WsChannel {
    inner:   Arc<WsInner>,
    user_id: String,
}

impl WsChannel {
    /// 접속 → HELLO 수신 → IDENTIFY → READY
    pub async fn connect(url: &str, user_id: &str, token: &str) -> CallResult<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| CallError::Signaling(format!("connect {}: {}", url, e)))?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        // HELLO
        let hello = loop {
            match ws_rx.next().await {
                Some(Ok(Message::Text(t))) => {
                    let packet: GatewayPacket = serde_json::from_str(&t)
                        .map_err(|e| CallError::InvalidPayload(e.to_string()))?;
                    if packet.op != server::HELLO {
                        return Err(CallError::Signaling(format!(
                            "expected HELLO, got {}", server::name(packet.op)
                        )));
                    }
                    let payload: HelloPayload = packet.d
                        .map(serde_json::from_value)
                        .transpose()
                        .map_err(|e| CallError::InvalidPayload(e.to_string()))?
                        .ok_or_else(|| CallError::InvalidPayload("HELLO without payload".to_string()))?;
                    break payload;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(CallError::Signaling(e.to_string())),
                None => return Err(CallError::Signaling("closed before HELLO".to_string())),
            }
        };

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let inner = Arc::new(WsInner {
            out_tx,
            next_seq: AtomicU64::new(1),
            pending:  Mutex::new(HashMap::new()),
            watches:  Mutex::new(HashMap::new()),
            closed:   AtomicBool::new(false),
        });

        // [writer]
        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                match out {
                    Outbound::Text(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // [reader]: Weak: 채널 핸들이 모두 drop 되면 종료
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                let text = match msg {
                    Ok(Message::Text(t))  => t,
                    Ok(Message::Close(_)) => break,
                    Err(e) => { debug!("[ws-channel] 수신 에러: {}", e); break; }
                    _ => continue,
                };
                let Some(inner) = weak.upgrade() else { return };
                match serde_json::from_str::<GatewayPacket>(&text) {
                    Ok(packet) => dispatch(&inner, packet),
                    Err(e)     => warn!("[ws-channel] 잘못된 패킷: {}", e),
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.shutdown();
            }
        });

        // [heartbeat]
        let weak = Arc::downgrade(&inner);
        let period = Duration::from_millis(hello.heartbeat_interval.max(1_000));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                if inner.is_closed() || inner.send_packet(GatewayPacket::no_data(client::HEARTBEAT)).is_err() {
                    return;
                }
            }
        });

        let seq = inner.next_seq();
        inner.call(seq, client::IDENTIFY, IdentifyPayload {
            user_id: user_id.to_string(),
            token:   token.to_string(),
        }).await?;
        debug!("[ws-channel] READY user={} url={}", user_id, url);

        Ok(Self { inner, user_id: user_id.to_string() })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// 연결 종료: 이후 모든 요청은 Signaling 에러
    pub fn close(&self) {
        let _ = self.inner.out_tx.send(Outbound::Close);
        self.inner.shutdown();
    }

    async fn request(&self, op: u8, payload: impl serde::Serialize) -> CallResult<Value> {
        let seq = self.inner.next_seq();
        self.inner.call(seq, op, payload).await
    }

    /// 구독 등록: 요청 전에 watch_id(=s) 를 등록해 ACK 직후 이벤트도 놓치지 않음
    async fn subscribe(
        &self,
        op:      u8,
        payload: impl serde::Serialize,
    ) -> CallResult<(mpsc::UnboundedReceiver<Value>, WatchGuard)> {
        let seq = self.inner.next_seq();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.watches.lock().unwrap().insert(seq, tx);
        let guard = WatchGuard { inner: Arc::clone(&self.inner), watch_id: seq };

        // 실패 시 guard drop 이 등록 해제
        self.inner.call(seq, op, payload).await?;
        Ok((rx, guard))
    }
}

/// 수신 패킷 분배
fn dispatch(inner: &WsInner, packet: GatewayPacket) {
    match packet.op {
        server::ACK | server::READY => {
            let data = match (packet.op, packet.d) {
                (server::ACK, Some(d)) => d.get("data").cloned().unwrap_or(Value::Null),
                (_, d)                 => d.unwrap_or(Value::Null),
            };
            resolve(inner, packet.s, Ok(data));
        }
        server::ERROR => {
            let err = match packet.d.map(serde_json::from_value::<ErrorPayload>) {
                Some(Ok(p)) => from_error_code(p.code, p.detail),
                _           => CallError::Signaling("malformed ERROR packet".to_string()),
            };
            if packet.s.is_none() {
                warn!("[ws-channel] 요청과 무관한 ERROR: {}", err);
            }
            resolve(inner, packet.s, Err(err));
        }
        server::SESSION_EVENT | server::CANDIDATE_EVENT => {
            let Some(d) = packet.d else { return };
            let Some(watch_id) = d.get("watch_id").and_then(Value::as_u64) else { return };
            let mut watches = inner.watches.lock().unwrap();
            if let Some(tx) = watches.get(&watch_id) {
                if tx.send(d).is_err() {
                    watches.remove(&watch_id);
                }
            }
        }
        server::WATCH_END => {
            let watch_id = packet.d
                .as_ref()
                .and_then(|d| d.get("watch_id"))
                .and_then(Value::as_u64);
            if let Some(watch_id) = watch_id {
                // sender drop → 스트림 종료
                inner.watches.lock().unwrap().remove(&watch_id);
            }
        }
        server::HEARTBEAT_ACK => trace!("[ws-channel] HEARTBEAT_ACK"),
        other => debug!("[ws-channel] 처리하지 않는 op: {}", other),
    }
}

fn resolve(inner: &WsInner, seq: Option<u64>, result: CallResult<Value>) {
    let Some(seq) = seq else { return };
    if let Some(tx) = inner.pending.lock().unwrap().remove(&seq) {
        let _ = tx.send(result);
    }
}

/// 구독 이벤트 → 타입 스트림. guard 는 스트림과 수명을 같이함
fn event_stream<T, F>(
    rx:      mpsc::UnboundedReceiver<Value>,
    guard:   WatchGuard,
    extract: F,
) -> BoxStream<'static, T>
where
    T: Send + 'static,
    F: Fn(Value) -> Option<T> + Send + 'static,
{
    Box::pin(stream::unfold((rx, guard, extract), |(mut rx, guard, extract)| async move {
        loop {
            let value = rx.recv().await?;
            if let Some(item) = extract(value) {
                return Some((item, (rx, guard, extract)));
            }
        }
    }))
}

#[async_trait]
impl SignalingChannel for WsChannel {
    async fn claim_session(&self, key: &SessionKey, identity: &str) -> CallResult<Claim> {
        let data = self.request(client::SESSION_CLAIM, SessionClaimPayload {
            key:          key.clone(),
            initiator_id: identity.to_string(),
        }).await?;
        serde_json::from_value(data).map_err(|e| CallError::InvalidPayload(e.to_string()))
    }

    async fn purge_stale(&self, key: &SessionKey, nonce: &str) -> CallResult<bool> {
        let data = self.request(client::SESSION_PURGE, SessionNoncePayload {
            key:   key.clone(),
            nonce: nonce.to_string(),
        }).await?;
        Ok(data["deleted"].as_bool().unwrap_or(false))
    }

    async fn abandon_session(&self, key: &SessionKey, nonce: &str) -> CallResult<bool> {
        let data = self.request(client::SESSION_ABANDON, SessionNoncePayload {
            key:   key.clone(),
            nonce: nonce.to_string(),
        }).await?;
        Ok(data["deleted"].as_bool().unwrap_or(false))
    }

    async fn publish_offer(&self, key: &SessionKey, description: SessionDescription) -> CallResult<()> {
        self.request(client::OFFER_PUBLISH, DescriptionPayload { key: key.clone(), description }).await?;
        Ok(())
    }

    async fn publish_answer(&self, key: &SessionKey, description: SessionDescription) -> CallResult<()> {
        self.request(client::ANSWER_PUBLISH, DescriptionPayload { key: key.clone(), description }).await?;
        Ok(())
    }

    async fn watch_session(&self, key: &SessionKey) -> CallResult<SessionWatch> {
        let (rx, guard) = self.subscribe(client::SESSION_WATCH, SessionKeyPayload { key: key.clone() }).await?;
        Ok(event_stream(rx, guard, |v| {
            serde_json::from_value::<SessionEventPayload>(v).ok().map(|p| p.record)
        }))
    }

    async fn append_candidate(&self, key: &SessionKey, side: Role, candidate: Candidate) -> CallResult<()> {
        self.request(client::CANDIDATE_APPEND, CandidateAppendPayload {
            key: key.clone(),
            side,
            candidate,
        }).await?;
        Ok(())
    }

    async fn watch_candidates(&self, key: &SessionKey, side: Role) -> CallResult<CandidateWatch> {
        let (rx, guard) = self.subscribe(client::CANDIDATE_WATCH, CandidateWatchPayload {
            key: key.clone(),
            side,
        }).await?;
        Ok(event_stream(rx, guard, |v| {
            serde_json::from_value::<CandidateEventPayload>(v).ok().map(|p| p.candidate)
        }))
    }

    async fn delete_session(&self, key: &SessionKey) -> CallResult<bool> {
        let data = self.request(client::SESSION_DELETE, SessionKeyPayload { key: key.clone() }).await?;
        Ok(data["deleted"].as_bool().unwrap_or(false))
    }
}
