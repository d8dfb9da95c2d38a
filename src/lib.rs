// author: kodeholic (powered by Claude)

pub mod call;
pub mod config;
pub mod core;
pub mod error;
pub mod http;
pub mod media;
pub mod protocol;
pub mod reaper;
pub mod signaling;
pub mod trace;
pub mod utils;

use axum::{routing::{get, post}, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::core::SessionStore;
use crate::http::HttpState;
use crate::protocol::{ws_handler, AppState};
use crate::trace::TraceHub;

/// CLI에서 주입되는 런타임 설정
/// - 기본값은 config.rs 상수
/// - 비밀값(SECRET)은 환경변수로 별도 관리
pub struct ServerArgs {
    pub port: u16,
}

/// 릴레이 라우터: WS 게이트웨이 + Admin + Trace
/// 통합 테스트에서도 같은 라우터를 임의 포트에 띄운다
pub fn app(store: Arc<SessionStore>, trace_hub: Arc<TraceHub>) -> Router {
    let app_state = AppState {
        store:     Arc::clone(&store),
        trace_hub: Arc::clone(&trace_hub),
    };

    let http_state = HttpState::new(store, trace_hub);

    let admin_router = Router::new()
        .route("/admin/status",                      get(http::admin_status))
        .route("/admin/sessions",                    get(http::admin_list_sessions))
        .route("/admin/sessions/{room_id}/{call_id}", get(http::admin_get_session))
        .route("/admin/purge/{room_id}/{call_id}",    post(http::admin_purge_session))
        .route("/trace",                     get(http::trace_all))
        .route("/trace/{room_id}",           get(http::trace_room))
        .route("/trace/{room_id}/{call_id}", get(http::trace_session))
        .with_state(http_state);

    // CORS: 개발/운영 모두 전체 허용 (Admin 대시보드, 브라우저 클라이언트 로컬 접속)
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(app_state)
        .merge(admin_router)
        .layer(cors)
}

pub async fn run_server(args: ServerArgs) {
    let store     = Arc::new(SessionStore::new());
    let trace_hub = TraceHub::new();

    // 오래된 세션 자동 정리 태스크
    tokio::spawn(reaper::run_stale_reaper(
        Arc::clone(&store),
        Arc::clone(&trace_hub),
    ));

    let app = app(store, trace_hub);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l)  => l,
        Err(e) => {
            error!("[televisit-signal] bind {} failed: {}", addr, e);
            return;
        }
    };

    info!("[televisit-signal] Signaling Relay on ws://{}/ws", addr);
    info!("[televisit-signal] Admin API on http://{}/admin", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("[televisit-signal] server error: {}", e);
    }
}
