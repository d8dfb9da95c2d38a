// author: kodeholic (powered by Claude)
// HTTP 응답 DTO: Admin 조회용

use serde::Serialize;

use crate::core::{Candidate, SessionDescription};

/// GET /admin/status
#[derive(Serialize)]
pub struct ServerStatus {
    pub uptime_secs:    u64,
    pub session_count:  usize,
    pub answered_count: usize, // answer 까지 교환된 세션 수
    pub watcher_count:  usize, // 세션 구독 중인 스트림 수 (양쪽 참여자 합)
    pub trace_clients:  usize,
}

/// GET /admin/sessions 아이템
#[derive(Serialize)]
pub struct AdminSessionSummary {
    pub room_id:             String,
    pub call_id:             String,
    pub initiator_id:        String,
    pub answerer_id:         Option<String>,
    pub state:               String, // "waiting" | "offered" | "answered"
    pub age_secs:            u64,
    pub offerer_candidates:  usize,
    pub answerer_candidates: usize,
    pub watchers:            usize,
}

/// GET /admin/sessions/{room_id}/{call_id}
#[derive(Serialize)]
pub struct AdminSessionDetail {
    pub room_id:             String,
    pub call_id:             String,
    pub initiator_id:        String,
    pub answerer_id:         Option<String>,
    pub nonce:               String,
    pub created_at:          u64,
    pub age_secs:            u64,
    pub state:               String,
    pub offer:               Option<SessionDescription>,
    pub answer:              Option<SessionDescription>,
    pub offerer_candidates:  Vec<Candidate>,
    pub answerer_candidates: Vec<Candidate>,
    pub watchers:            usize,
}
