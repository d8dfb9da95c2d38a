// author: kodeholic (powered by Claude)
//
// SignalingChannel: 공유 문서 저장소를 메시지 버스로 쓰는 시그널링 추상화
//
// 메시지는 세 종류뿐: session-offer / session-answer / connectivity-candidate
//
// 보장:
//   watch_session    : 커밋마다 "최소 최신 상태" 전달 (중간 상태는 생략될 수 있음)
//   watch_candidates : 같은 side 안에서는 append 순서대로, 최소 1회 전달
//                      side 간 순서는 보장하지 않음
//   삭제된 세션에 대한 모든 쓰기 → SessionGone
//
// 구현체:
//   LocalChannel: 같은 프로세스의 SessionStore 직접 사용 (테스트/릴레이 서버 내부)
//   WsChannel   : 릴레이 서버에 WebSocket 으로 접속

pub mod local;
pub mod remote;

pub use local::LocalChannel;
pub use remote::WsChannel;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use std::collections::VecDeque;
use tokio::sync::watch;

use crate::core::{Candidate, Claim, DocSnapshot, Role, SessionDescription, SessionKey, SessionRecord};
use crate::error::CallResult;

/// 세션 스냅샷 스트림: drop 하면 구독 해제, 세션 삭제 시 종료
pub type SessionWatch = BoxStream<'static, SessionRecord>;

/// 한쪽 side 의 candidate 스트림: 컬렉션 처음부터, 이후 추가분 순서대로
pub type CandidateWatch = BoxStream<'static, Candidate>;

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// 원자적 check-and-set (역할 협상 전용)
    async fn claim_session(&self, key: &SessionKey, identity: &str) -> CallResult<Claim>;

    /// nonce 가 일치하는 이전 세대 레코드 삭제
    async fn purge_stale(&self, key: &SessionKey, nonce: &str) -> CallResult<bool>;

    /// 아무도 answerer 로 참여하지 않은 레코드 회수
    async fn abandon_session(&self, key: &SessionKey, nonce: &str) -> CallResult<bool>;

    async fn publish_offer(&self, key: &SessionKey, description: SessionDescription) -> CallResult<()>;

    async fn publish_answer(&self, key: &SessionKey, description: SessionDescription) -> CallResult<()>;

    async fn watch_session(&self, key: &SessionKey) -> CallResult<SessionWatch>;

    async fn append_candidate(&self, key: &SessionKey, side: Role, candidate: Candidate) -> CallResult<()>;

    async fn watch_candidates(&self, key: &SessionKey, side: Role) -> CallResult<CandidateWatch>;

    /// 레코드 + 양쪽 컬렉션 일괄 삭제. 이미 없으면 false
    async fn delete_session(&self, key: &SessionKey) -> CallResult<bool>;

    /// 내가 협상한 세대(nonce)의 세션만 삭제. 같은 키에 새로 생긴 세션은 건드리지 않음
    async fn end_session(&self, key: &SessionKey, nonce: &str) -> CallResult<bool> {
        self.purge_stale(key, nonce).await
    }
}

// ----------------------------------------------------------------------------
// [watch → stream 어댑터] SessionStore 구독을 스트림으로 변환
// ----------------------------------------------------------------------------

/// 최신 레코드 스냅샷 스트림. 첫 항목은 구독 시점 상태
pub fn session_stream(rx: watch::Receiver<DocSnapshot>) -> SessionWatch {
    Box::pin(stream::unfold((rx, true), |(mut rx, first)| async move {
        if !first && rx.changed().await.is_err() {
            return None;
        }
        let snapshot = rx.borrow_and_update().clone();
        snapshot.map(|doc| (doc.record.clone(), (rx, false)))
    }))
}

/// 한쪽 side 의 candidate 를 커서 기반으로 빠짐없이 전달
/// watch 는 중간 스냅샷을 건너뛸 수 있지만 컬렉션은 append-only 라서
/// 커서 이후 구간만 꺼내면 누락이 없음
pub fn candidate_stream(rx: watch::Receiver<DocSnapshot>, side: Role) -> CandidateWatch {
    struct Cursor {
        rx:      watch::Receiver<DocSnapshot>,
        side:    Role,
        seen:    usize,
        pending: VecDeque<Candidate>,
        first:   bool,
    }

    let cursor = Cursor { rx, side, seen: 0, pending: VecDeque::new(), first: true };

    Box::pin(stream::unfold(cursor, |mut cur| async move {
        loop {
            if let Some(candidate) = cur.pending.pop_front() {
                return Some((candidate, cur));
            }
            if !cur.first && cur.rx.changed().await.is_err() {
                return None;
            }
            cur.first = false;

            let doc = cur.rx.borrow_and_update().clone()?;
            let list = doc.candidates(cur.side);
            if list.len() > cur.seen {
                cur.pending.extend(list[cur.seen..].iter().cloned());
                cur.seen = list.len();
            }
        }
    }))
}
