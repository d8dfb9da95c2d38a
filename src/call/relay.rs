// author: kodeholic (powered by Claude)
// Candidate Relay Buffer
//
// 송신: 로컬에서 발견한 candidate 를 자기 side 컬렉션에 정확히 1회 append (재시도 없음)
// 수신: 상대 side candidate 를 도착 순서대로 적용
//       remote description 적용 전에 온 것은 큐에 보관했다가 적용 직후 순서대로 재생
//
// [lock 원칙] ready 플래그와 큐는 같은 tokio Mutex 아래: 재생 중 새 도착분이
//             끼어들어 순서가 뒤바뀌지 않음. 적용이 await 이므로 std Mutex 불가

use futures_util::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::core::{Candidate, Role, SessionKey};
use crate::media::PeerConnection;
use crate::signaling::{CandidateWatch, SignalingChannel};

#[derive(Default)]
struct Inbound {
    ready: bool,
    queue: Vec<Candidate>,
}

pub struct CandidateRelay {
    channel:   Arc<dyn SignalingChannel>,
    key:       SessionKey,
    side:      Role,
    peer:      Arc<dyn PeerConnection>,
    inbound:   Mutex<Inbound>,
    forwarded: AtomicUsize,
    applied:   AtomicUsize,
}

impl CandidateRelay {
    /// side: 자기 역할 (append 대상 컬렉션)
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
        key:     SessionKey,
        side:    Role,
        peer:    Arc<dyn PeerConnection>,
    ) -> Self {
        Self {
            channel,
            key,
            side,
            peer,
            inbound:   Mutex::new(Inbound::default()),
            forwarded: AtomicUsize::new(0),
            applied:   AtomicUsize::new(0),
        }
    }

    pub fn side(&self) -> Role { self.side }

    /// 로컬 candidate 1개 전달. 실패는 로그만
    pub async fn forward_local(&self, candidate: Candidate) {
        match self.channel.append_candidate(&self.key, self.side, candidate).await {
            Ok(()) => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_benign() => {
                debug!("[relay] {} append skipped, session gone", self.key);
            }
            Err(e) => {
                warn!("[relay] {} append failed side={}: {}", self.key, self.side, e);
            }
        }
    }

    /// 상대 candidate 수신
    pub async fn accept_remote(&self, candidate: Candidate) {
        let mut inbound = self.inbound.lock().await;
        if !inbound.ready {
            inbound.queue.push(candidate);
            trace!("[relay] {} buffered (queue={})", self.key, inbound.queue.len());
            return;
        }
        self.apply(candidate).await;
    }

    /// remote description 적용 완료: 큐 재생 후 이후 도착분은 즉시 적용
    pub async fn remote_description_applied(&self) {
        let mut inbound = self.inbound.lock().await;
        if inbound.ready {
            return;
        }
        inbound.ready = true;
        let queued = std::mem::take(&mut inbound.queue);
        if !queued.is_empty() {
            debug!("[relay] {} replaying {} buffered candidates", self.key, queued.len());
        }
        for candidate in queued {
            self.apply(candidate).await;
        }
    }

    /// 상대 side 구독 스트림 소진: 세션 삭제로 스트림이 끝나면 리턴
    pub async fn pump_remote(&self, mut watch: CandidateWatch) {
        while let Some(candidate) = watch.next().await {
            self.accept_remote(candidate).await;
        }
        trace!("[relay] {} remote candidate watch ended", self.key);
    }

    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn applied(&self) -> usize {
        self.applied.load(Ordering::Relaxed)
    }

    pub async fn buffered(&self) -> usize {
        self.inbound.lock().await.queue.len()
    }

    async fn apply(&self, candidate: Candidate) {
        match self.peer.add_ice_candidate(candidate).await {
            Ok(()) => {
                self.applied.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("[relay] {} candidate apply failed: {}", self.key, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SessionDescription, SessionStore};
    use crate::media::{LoopbackFactory, PeerFactory};
    use crate::signaling::LocalChannel;

    fn key() -> SessionKey {
        SessionKey::new("H01", "APT1")
    }

    #[tokio::test]
    async fn early_candidates_wait_for_remote_description() {
        let factory = LoopbackFactory::new();
        let (peer, _events) = factory.create().unwrap();
        let channel: Arc<dyn SignalingChannel> = Arc::new(LocalChannel::new(Arc::new(SessionStore::new())));
        let relay = CandidateRelay::new(channel, key(), Role::Answerer, Arc::clone(&peer));

        for i in 0..3 {
            relay.accept_remote(Candidate::new(format!("c{}", i))).await;
        }
        assert_eq!(relay.buffered().await, 3);
        assert_eq!(relay.applied(), 0);

        peer.set_remote_description(SessionDescription::offer("v=0...A")).await.unwrap();
        relay.remote_description_applied().await;
        relay.accept_remote(Candidate::new("c3")).await;

        let loopback = factory.last_peer().unwrap();
        assert_eq!(loopback.early_candidates(), 0);
        let order: Vec<_> = loopback.applied_candidates().into_iter().map(|c| c.candidate).collect();
        assert_eq!(order, vec!["c0", "c1", "c2", "c3"]);
        assert_eq!(relay.buffered().await, 0);
    }

    #[tokio::test]
    async fn forward_to_deleted_session_is_swallowed() {
        let store = Arc::new(SessionStore::new());
        let channel: Arc<dyn SignalingChannel> = Arc::new(LocalChannel::new(Arc::clone(&store)));
        let (peer, _events) = LoopbackFactory::new().create().unwrap();
        let relay = CandidateRelay::new(channel, key(), Role::Offerer, peer);

        store.claim(&key(), "dr_kim");
        relay.forward_local(Candidate::new("c0")).await;
        store.delete(&key());
        relay.forward_local(Candidate::new("c1")).await;

        assert_eq!(relay.forwarded(), 1);
    }
}
