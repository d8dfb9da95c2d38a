// author: kodeholic (powered by Claude)
// LocalChannel: 같은 프로세스 안의 SessionStore 를 직접 쓰는 SignalingChannel

use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

use crate::core::{Candidate, Claim, Role, SessionDescription, SessionKey, SessionStore};
use crate::error::CallResult;

use super::{candidate_stream, session_stream, CandidateWatch, SessionWatch, SignalingChannel};

#[derive(Clone)]
pub struct LocalChannel {
    store: Arc<SessionStore>,
}

impl LocalChannel {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }
}

#[async_trait]
impl SignalingChannel for LocalChannel {
    async fn claim_session(&self, key: &SessionKey, identity: &str) -> CallResult<Claim> {
        trace!("[local] claim {} by {}", key, identity);
        Ok(self.store.claim(key, identity))
    }

    async fn purge_stale(&self, key: &SessionKey, nonce: &str) -> CallResult<bool> {
        Ok(self.store.delete_if(key, nonce, false))
    }

    async fn abandon_session(&self, key: &SessionKey, nonce: &str) -> CallResult<bool> {
        Ok(self.store.delete_if(key, nonce, true))
    }

    async fn publish_offer(&self, key: &SessionKey, description: SessionDescription) -> CallResult<()> {
        self.store.set_offer(key, description)
    }

    async fn publish_answer(&self, key: &SessionKey, description: SessionDescription) -> CallResult<()> {
        self.store.set_answer(key, description)
    }

    async fn watch_session(&self, key: &SessionKey) -> CallResult<SessionWatch> {
        Ok(session_stream(self.store.subscribe(key)?))
    }

    async fn append_candidate(&self, key: &SessionKey, side: Role, candidate: Candidate) -> CallResult<()> {
        self.store.append_candidate(key, side, candidate)
    }

    async fn watch_candidates(&self, key: &SessionKey, side: Role) -> CallResult<CandidateWatch> {
        Ok(candidate_stream(self.store.subscribe(key)?, side))
    }

    async fn delete_session(&self, key: &SessionKey) -> CallResult<bool> {
        Ok(self.store.delete(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallError;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    fn key() -> SessionKey {
        SessionKey::new("H01", "APT1")
    }

    fn channel() -> LocalChannel {
        LocalChannel::new(Arc::new(SessionStore::new()))
    }

    #[tokio::test]
    async fn watch_session_delivers_current_then_updates() {
        let ch = channel();
        ch.claim_session(&key(), "dr").await.unwrap();
        let mut watch = ch.watch_session(&key()).await.unwrap();

        let first = watch.next().await.unwrap();
        assert!(first.offer.is_none());

        ch.publish_offer(&key(), SessionDescription::offer("v=0...A")).await.unwrap();
        let next = timeout(Duration::from_secs(1), watch.next()).await.unwrap().unwrap();
        assert_eq!(next.offer.unwrap().sdp, "v=0...A");
    }

    #[tokio::test]
    async fn watch_session_ends_on_delete() {
        let ch = channel();
        ch.claim_session(&key(), "dr").await.unwrap();
        let mut watch = ch.watch_session(&key()).await.unwrap();
        watch.next().await.unwrap();

        assert!(ch.delete_session(&key()).await.unwrap());
        let end = timeout(Duration::from_secs(1), watch.next()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn watch_candidates_replays_history_in_order() {
        let ch = channel();
        ch.claim_session(&key(), "dr").await.unwrap();
        ch.append_candidate(&key(), Role::Offerer, Candidate::new("c0")).await.unwrap();
        ch.append_candidate(&key(), Role::Offerer, Candidate::new("c1")).await.unwrap();

        let mut watch = ch.watch_candidates(&key(), Role::Offerer).await.unwrap();
        ch.append_candidate(&key(), Role::Answerer, Candidate::new("other-side")).await.unwrap();
        ch.append_candidate(&key(), Role::Offerer, Candidate::new("c2")).await.unwrap();

        let mut got = Vec::new();
        for _ in 0..3 {
            let c = timeout(Duration::from_secs(1), watch.next()).await.unwrap().unwrap();
            got.push(c.candidate);
        }
        assert_eq!(got, vec!["c0", "c1", "c2"]);
    }

    #[tokio::test]
    async fn burst_appends_are_not_lost() {
        let ch = channel();
        ch.claim_session(&key(), "dr").await.unwrap();
        let mut watch = ch.watch_candidates(&key(), Role::Answerer).await.unwrap();

        // 구독자가 읽기 전에 여러 번 커밋 → watch 는 중간 스냅샷을 건너뜀
        for i in 0..50 {
            ch.append_candidate(&key(), Role::Answerer, Candidate::new(format!("c{}", i))).await.unwrap();
        }

        for i in 0..50 {
            let c = timeout(Duration::from_secs(1), watch.next()).await.unwrap().unwrap();
            assert_eq!(c.candidate, format!("c{}", i));
        }
    }

    #[tokio::test]
    async fn watch_on_missing_session_is_gone() {
        let ch = channel();
        assert!(matches!(ch.watch_session(&key()).await, Err(CallError::SessionGone(_))));
        assert!(matches!(
            ch.watch_candidates(&key(), Role::Offerer).await,
            Err(CallError::SessionGone(_))
        ));
    }

    #[tokio::test]
    async fn watch_is_restartable() {
        let ch = channel();
        ch.claim_session(&key(), "dr").await.unwrap();
        ch.publish_offer(&key(), SessionDescription::offer("v=0")).await.unwrap();

        let mut first = ch.watch_session(&key()).await.unwrap();
        assert!(first.next().await.unwrap().offer.is_some());
        drop(first);

        let mut again = ch.watch_session(&key()).await.unwrap();
        assert!(again.next().await.unwrap().offer.is_some());
    }
}
