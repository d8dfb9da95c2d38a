// author: kodeholic (powered by Claude)
// 시그널링 이벤트 SSE: /trace, /trace/{room_id}, /trace/{room_id}/{call_id}

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tracing::debug;

use crate::core::SessionKey;
use crate::trace::TraceFilter;

use super::state::HttpState;

pub async fn trace_all(State(state): State<HttpState>) -> impl IntoResponse {
    sse(state, TraceFilter::default())
}

pub async fn trace_room(
    State(state):  State<HttpState>,
    Path(room_id): Path<String>,
) -> impl IntoResponse {
    sse(state, TraceFilter::room(room_id))
}

pub async fn trace_session(
    State(state):             State<HttpState>,
    Path((room_id, call_id)): Path<(String, String)>,
) -> impl IntoResponse {
    sse(state, TraceFilter::session(&SessionKey::new(room_id, call_id)))
}

fn sse(state: HttpState, filter: TraceFilter) -> impl IntoResponse {
    debug!("[trace] subscriber attached {:?}", filter);

    let stream = BroadcastStream::new(state.trace_hub.subscribe()).filter_map(move |received| {
        // lagged: 밀린 이벤트는 건너뛰고 계속
        let event = received.ok()?;
        if !filter.admits(&event) {
            return None;
        }
        let json = serde_json::to_string(&event).ok()?;
        Some(Ok::<_, Infallible>(Event::default().data(json)))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"))
}
