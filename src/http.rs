// author: kodeholic (powered by Claude)
//
// HTTP REST API: 운영 조회/조작 + Trace SSE
//
// GET  /admin/status                       → 서버 상태 요약
// GET  /admin/sessions                     → 세션 전체 목록
// GET  /admin/sessions/{room_id}/{call_id} → 세션 상세 (description, candidate 포함)
// POST /admin/purge/{room_id}/{call_id}    → 세션 강제 삭제
// GET  /trace[/{room_id}[/{call_id}]]      → 시그널링 이벤트 SSE

pub mod admin;
pub mod dto;
pub mod state;
pub mod trace;

pub use admin::{admin_get_session, admin_list_sessions, admin_purge_session, admin_status};
pub use state::HttpState;
pub use trace::{trace_all, trace_room, trace_session};
