// author: kodeholic (powered by Claude)
// Admin REST API 핸들러
//
// 조회
//   GET /admin/status                       → 서버 상태 요약
//   GET /admin/sessions                     → 세션 전체 목록
//   GET /admin/sessions/{room_id}/{call_id} → 세션 상세
//
// 조작
//   POST /admin/purge/{room_id}/{call_id}   → 세션 강제 삭제 (참여자 구독은 RemoteEnded 로 종료)

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::core::{SessionKey, SessionRecord};
use crate::trace::{TraceDir, TraceEvent};
use crate::utils::current_timestamp;

use super::dto::*;
use super::state::HttpState;

// ----------------------------------------------------------------------------
// [유틸]
// ----------------------------------------------------------------------------

fn session_state_str(record: &SessionRecord) -> String {
    match (&record.offer, &record.answer) {
        (_, Some(_))    => "answered".to_string(),
        (Some(_), None) => "offered".to_string(),
        (None, None)    => "waiting".to_string(),
    }
}

fn not_found(key: &SessionKey) -> axum::response::Response {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({
        "error": format!("Session not found: {}", key)
    }))).into_response()
}

// ----------------------------------------------------------------------------
// [핸들러]
// ----------------------------------------------------------------------------

/// GET /admin/status
pub async fn admin_status(State(state): State<HttpState>) -> impl IntoResponse {
    let now_ms      = current_timestamp();
    let uptime_secs = now_ms.saturating_sub(state.start_time_ms) / 1000;

    let sessions       = state.store.all();
    let session_count  = sessions.len();
    let answered_count = sessions.iter().filter(|(_, doc, _)| doc.record.answer.is_some()).count();
    let watcher_count  = sessions.iter().map(|(_, _, watchers)| *watchers).sum();

    let trace_clients  = state.trace_hub.subscribers();

    Json(ServerStatus { uptime_secs, session_count, answered_count, watcher_count, trace_clients })
}

/// GET /admin/sessions
pub async fn admin_list_sessions(State(state): State<HttpState>) -> impl IntoResponse {
    let now = current_timestamp();
    let mut list: Vec<AdminSessionSummary> = state.store
        .all()
        .into_iter()
        .map(|(key, doc, watchers)| AdminSessionSummary {
            room_id:             key.room_id,
            call_id:             key.call_id,
            state:               session_state_str(&doc.record),
            age_secs:            doc.record.age_ms(now) / 1000,
            initiator_id:        doc.record.initiator_id,
            answerer_id:         doc.record.answerer_id,
            offerer_candidates:  doc.offerer_candidates.len(),
            answerer_candidates: doc.answerer_candidates.len(),
            watchers,
        })
        .collect();
    list.sort_by(|a, b| (&a.room_id, &a.call_id).cmp(&(&b.room_id, &b.call_id)));
    Json(list)
}

/// GET /admin/sessions/{room_id}/{call_id}
pub async fn admin_get_session(
    State(state): State<HttpState>,
    Path((room_id, call_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let key = SessionKey::new(room_id, call_id);
    let (doc, watchers) = match state.store.inspect(&key) {
        Some(found) => found,
        None        => return not_found(&key),
    };

    let now    = current_timestamp();
    let record = doc.record;
    Json(AdminSessionDetail {
        state:               session_state_str(&record),
        age_secs:            record.age_ms(now) / 1000,
        room_id:             key.room_id,
        call_id:             key.call_id,
        initiator_id:        record.initiator_id,
        answerer_id:         record.answerer_id,
        nonce:               record.nonce,
        created_at:          record.created_at,
        offer:               record.offer,
        answer:              record.answer,
        offerer_candidates:  doc.offerer_candidates,
        answerer_candidates: doc.answerer_candidates,
        watchers,
    }).into_response()
}

/// POST /admin/purge/{room_id}/{call_id}
pub async fn admin_purge_session(
    State(state): State<HttpState>,
    Path((room_id, call_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let key = SessionKey::new(room_id, call_id);
    if !state.store.delete(&key) {
        return not_found(&key);
    }

    tracing::warn!("[admin] purge session={}", key);
    state.trace_hub.publish(TraceEvent::new(
        TraceDir::Sys, Some(&key), None, 0, "ADMIN_PURGE", "purged by admin",
    ));

    Json(serde_json::json!({
        "ok": true,
        "room_id": key.room_id,
        "call_id": key.call_id,
    })).into_response()
}
