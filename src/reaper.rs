// author: kodeholic (powered by Claude)
// 오래된 세션 자동 정리 태스크
//
// 정리 권한 측이 돌아오지 않은 통화(브라우저 강제 종료 등)의 안전망.
// 생성 후 SESSION_TTL_MS 가 지난 세션 레코드 + candidate 컬렉션을 일괄 삭제.
// 삭제 시 구독 중인 참여자의 세션 스트림이 끝나 RemoteEnded 로 종료된다.

use std::sync::Arc;
use tracing::info;

use crate::config;
use crate::core::SessionStore;
use crate::trace::{TraceDir, TraceEvent, TraceHub};

pub async fn run_stale_reaper(store: Arc<SessionStore>, trace_hub: Arc<TraceHub>) {
    let interval  = tokio::time::Duration::from_millis(config::REAPER_INTERVAL_MS);
    let mut timer = tokio::time::interval(interval);
    timer.tick().await; // 첫 틱 skip (startup 시 즉시 실행 방지)

    info!("[stale-reaper] Started (interval={}ms, ttl={}ms)",
        config::REAPER_INTERVAL_MS, config::SESSION_TTL_MS);

    loop {
        timer.tick().await;
        reap_once(&store, &trace_hub, config::SESSION_TTL_MS);
    }
}

/// 1회 정리: 삭제한 세션 수 반환
pub fn reap_once(store: &SessionStore, trace_hub: &TraceHub, ttl_ms: u64) -> usize {
    let mut removed = 0;
    for key in store.find_stale(ttl_ms) {
        if store.delete(&key) {
            removed += 1;
            info!("[stale-reaper] session={} removed (ttl exceeded)", key);
            trace_hub.publish(TraceEvent::new(
                TraceDir::Sys, Some(&key), None, 0, "REAP", "ttl exceeded",
            ));
        }
    }
    if removed > 0 {
        info!("[stale-reaper] Cleaned {} session(s)", removed);
    }
    removed
}
