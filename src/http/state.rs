// author: kodeholic (powered by Claude)
// HttpState: HTTP 핸들러 공유 상태

use std::sync::Arc;

use crate::core::SessionStore;
use crate::trace::TraceHub;
use crate::utils::current_timestamp;

#[derive(Clone)]
pub struct HttpState {
    pub store:         Arc<SessionStore>,
    pub trace_hub:     Arc<TraceHub>,
    /// 서버 프로세스 시작 시각 (Unix millis): uptime 계산용
    pub start_time_ms: u64,
}

impl HttpState {
    pub fn new(store: Arc<SessionStore>, trace_hub: Arc<TraceHub>) -> Self {
        Self { store, trace_hub, start_time_ms: current_timestamp() }
    }
}
