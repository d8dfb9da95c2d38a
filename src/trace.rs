// author: kodeholic (powered by Claude)
//
// 시그널링 관찰: 릴레이/reaper/admin 이 남긴 이벤트를 SSE 구독자(tvtrace)에게 흘림
// 구독자가 없거나 느려도 릴레이 경로는 막히지 않는다 (느린 쪽은 lagged 로 건너뜀)

use std::sync::Arc;
use tokio::sync::broadcast;
use serde::Serialize;

use crate::config;
use crate::core::SessionKey;
use crate::utils::current_timestamp;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TraceDir {
    In,
    Out,
    /// reaper, admin purge
    Sys,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub ts:      u64,
    pub dir:     TraceDir,
    /// IDENTIFY 처럼 세션과 무관한 이벤트는 None
    pub room_id: Option<String>,
    pub call_id: Option<String>,
    pub user_id: Option<String>,
    pub op:      u8,
    pub op_name: String,
    pub summary: String,
}

impl TraceEvent {
    pub fn new(
        dir:     TraceDir,
        key:     Option<&SessionKey>,
        user_id: Option<&str>,
        op:      u8,
        op_name: &str,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            ts:      current_timestamp(),
            dir,
            room_id: key.map(|k| k.room_id.clone()),
            call_id: key.map(|k| k.call_id.clone()),
            user_id: user_id.map(str::to_string),
            op,
            op_name: op_name.to_string(),
            summary: summary.into(),
        }
    }
}

/// 구독 범위: 전체 / 병원 하나 / 진료 하나
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceFilter {
    pub room_id: Option<String>,
    pub call_id: Option<String>,
}

impl TraceFilter {
    pub fn room(room_id: impl Into<String>) -> Self {
        Self { room_id: Some(room_id.into()), call_id: None }
    }

    pub fn session(key: &SessionKey) -> Self {
        Self { room_id: Some(key.room_id.clone()), call_id: Some(key.call_id.clone()) }
    }

    /// 범위가 지정되면 세션 없는 이벤트는 제외
    pub fn admits(&self, event: &TraceEvent) -> bool {
        let scoped = |want: &Option<String>, got: &Option<String>| match want {
            None       => true,
            Some(want) => got.as_deref() == Some(want.as_str()),
        };
        scoped(&self.room_id, &event.room_id) && scoped(&self.call_id, &event.call_id)
    }
}

pub struct TraceHub {
    tx: broadcast::Sender<TraceEvent>,
}

impl TraceHub {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(config::TRACE_BUF);
        Arc::new(Self { tx })
    }

    pub fn publish(&self, event: TraceEvent) {
        // 구독자 없음 = 정상
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        self.tx.subscribe()
    }

    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}
