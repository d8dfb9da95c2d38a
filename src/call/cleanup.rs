// author: kodeholic (powered by Claude)
// Cleanup Coordinator: 통화 종료 시 자원 회수를 정확히 1회
//
// 1) 로컬 트랙 정지  2) 피어 연결 close  3) 정책에 따른 공유 상태 회수
//
// 공유 상태 회수 정책:
//   AuthorityOnly(party) : 권한 당사자만 자기가 협상한 세션 삭제
//                          비권한 offerer 는 아무도 참여 안 한 자기 레코드만 회수 (abandon)
//   EitherSide           : 양쪽 모두 delete-if-exists
//
// 삭제는 항상 협상 당시 nonce 로 한정: 같은 키에 재접속으로 생긴 새 세션은 보존
//
// 회수 중 에러는 로그만 남기고 삼킨다 (사용자 입장에서 통화는 이미 끝남)

use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::core::{Role, SessionKey};
use crate::error::CallResult;
use crate::media::{LocalMedia, PeerConnection};
use crate::signaling::SignalingChannel;

use super::identity::Party;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    AuthorityOnly(Party),
    EitherSide,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        CleanupPolicy::AuthorityOnly(Party::Clinician)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// 이번 호출에서 정지한 로컬 트랙 수
    pub released_local: usize,
    pub closed_peer:    bool,
    /// 이번 호출이 공유 세션을 실제로 지웠는지
    pub deleted_shared: bool,
}

#[derive(Default)]
struct Resources {
    done:       bool,
    media:      Option<LocalMedia>,
    peer:       Option<Arc<dyn PeerConnection>>,
    negotiated: Option<(Role, String)>,
}

pub struct CleanupCoordinator {
    channel:   Arc<dyn SignalingChannel>,
    key:       SessionKey,
    party:     Party,
    policy:    CleanupPolicy,
    resources: Mutex<Resources>,
}

impl CleanupCoordinator {
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
        key:     SessionKey,
        party:   Party,
        policy:  CleanupPolicy,
    ) -> Self {
        Self { channel, key, party, policy, resources: Mutex::new(Resources::default()) }
    }

    pub fn policy(&self) -> CleanupPolicy { self.policy }

    pub fn is_done(&self) -> bool {
        self.resources.lock().unwrap().done
    }

    /// 획득 완료된 미디어 등록. 이미 teardown 됐으면 즉시 정지하고 false
    pub fn attach_media(&self, media: LocalMedia) -> bool {
        let mut res = self.resources.lock().unwrap();
        if res.done {
            drop(res);
            let stopped = media.stop_all();
            debug!("[cleanup] {} late media released ({} tracks)", self.key, stopped);
            return false;
        }
        res.media = Some(media);
        true
    }

    /// 이미 teardown 됐으면 false: 호출자가 직접 close
    pub fn attach_peer(&self, peer: Arc<dyn PeerConnection>) -> bool {
        let mut res = self.resources.lock().unwrap();
        if res.done {
            return false;
        }
        res.peer = Some(peer);
        true
    }

    /// 협상 결과 등록. 이미 teardown 됐으면 false: 호출자가 reclaim_shared 로 직접 회수
    pub fn set_negotiated(&self, role: Role, nonce: &str) -> bool {
        let mut res = self.resources.lock().unwrap();
        if res.done {
            return false;
        }
        res.negotiated = Some((role, nonce.to_string()));
        true
    }

    /// 두 번째 호출부터는 빈 리포트
    pub async fn teardown(&self) -> TeardownReport {
        let (media, peer, negotiated) = {
            let mut res = self.resources.lock().unwrap();
            if res.done {
                return TeardownReport::default();
            }
            res.done = true;
            (res.media.take(), res.peer.take(), res.negotiated.take())
        };

        let mut report = TeardownReport::default();
        if let Some(media) = media {
            report.released_local = media.stop_all();
        }
        if let Some(peer) = peer {
            peer.close().await;
            report.closed_peer = true;
        }
        if let Some((role, nonce)) = negotiated {
            report.deleted_shared = self.reclaim_shared(role, &nonce).await;
        }

        info!(
            "[cleanup] {} {} teardown: tracks={} peer_closed={} deleted_shared={}",
            self.key, self.party, report.released_local, report.closed_peer, report.deleted_shared
        );
        report
    }

    /// 정책에 따른 공유 상태 회수. 이미 없거나 권한 없음 → false
    pub async fn reclaim_shared(&self, role: Role, nonce: &str) -> bool {
        let result: CallResult<bool> = match self.policy {
            CleanupPolicy::EitherSide => self.channel.end_session(&self.key, nonce).await,
            CleanupPolicy::AuthorityOnly(authority) if authority == self.party => {
                self.channel.end_session(&self.key, nonce).await
            }
            CleanupPolicy::AuthorityOnly(_) if role == Role::Offerer => {
                self.channel.abandon_session(&self.key, nonce).await
            }
            CleanupPolicy::AuthorityOnly(_) => Ok(false),
        };

        match result {
            Ok(deleted) => deleted,
            Err(e) if e.is_benign() => {
                debug!("[cleanup] {} already gone", self.key);
                false
            }
            Err(e) => {
                warn!("[cleanup] {} shared state reclaim failed: {}", self.key, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SessionStore;
    use crate::media::{LocalTrack, LoopbackFactory, PeerFactory, TrackKind};
    use crate::signaling::LocalChannel;

    fn key() -> SessionKey {
        SessionKey::new("H01", "APT1")
    }

    fn setup() -> (Arc<SessionStore>, Arc<dyn SignalingChannel>) {
        let store = Arc::new(SessionStore::new());
        let channel: Arc<dyn SignalingChannel> = Arc::new(LocalChannel::new(Arc::clone(&store)));
        (store, channel)
    }

    fn media() -> LocalMedia {
        LocalMedia::new(vec![
            Arc::new(LocalTrack::new("a", TrackKind::Audio)),
            Arc::new(LocalTrack::new("v", TrackKind::Video)),
        ])
    }

    #[tokio::test]
    async fn second_teardown_is_empty() {
        let (store, channel) = setup();
        let nonce = store.claim(&key(), "pt_lee").record().nonce.clone();
        store.claim(&key(), "dr_kim");

        let coord = CleanupCoordinator::new(channel, key(), Party::Clinician, CleanupPolicy::default());
        let (peer, _rx) = LoopbackFactory::new().create().unwrap();
        assert!(coord.attach_media(media()));
        assert!(coord.attach_peer(peer));
        assert!(coord.set_negotiated(Role::Answerer, &nonce));

        let first = coord.teardown().await;
        assert_eq!(first, TeardownReport { released_local: 2, closed_peer: true, deleted_shared: true });
        assert_eq!(coord.teardown().await, TeardownReport::default());
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn non_authority_leaves_joined_session_alone() {
        let (store, channel) = setup();
        let nonce = store.claim(&key(), "pt_lee").record().nonce.clone();
        store.claim(&key(), "dr_kim");

        let coord = CleanupCoordinator::new(channel, key(), Party::Patient, CleanupPolicy::default());
        coord.set_negotiated(Role::Offerer, &nonce);

        assert!(!coord.teardown().await.deleted_shared);
        assert_eq!(store.count(), 1);
    }

    #[tokio::test]
    async fn non_authority_offerer_abandons_unjoined_session() {
        let (store, channel) = setup();
        let nonce = store.claim(&key(), "pt_lee").record().nonce.clone();

        let coord = CleanupCoordinator::new(channel, key(), Party::Patient, CleanupPolicy::default());
        coord.set_negotiated(Role::Offerer, &nonce);

        assert!(coord.teardown().await.deleted_shared);
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn either_side_deletes_once_across_two_coordinators() {
        let (store, channel) = setup();
        let nonce = store.claim(&key(), "dr_kim").record().nonce.clone();
        store.claim(&key(), "pt_lee");

        let a = CleanupCoordinator::new(Arc::clone(&channel), key(), Party::Clinician, CleanupPolicy::EitherSide);
        let b = CleanupCoordinator::new(channel, key(), Party::Patient, CleanupPolicy::EitherSide);
        a.set_negotiated(Role::Offerer, &nonce);
        b.set_negotiated(Role::Answerer, &nonce);

        let (ra, rb) = tokio::join!(a.teardown(), b.teardown());
        assert_eq!([ra.deleted_shared, rb.deleted_shared].iter().filter(|d| **d).count(), 1);
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn authority_spares_newer_session_under_same_key() {
        let (store, channel) = setup();
        let old = store.claim(&key(), "dr_kim").record().nonce.clone();
        store.claim(&key(), "pt_lee");

        // 환자가 재접속하면서 이전 레코드를 치우고 새 세션을 만든 상태
        assert!(store.delete_if(&key(), &old, false));
        let fresh = store.claim(&key(), "pt_lee").record().nonce.clone();

        let coord = CleanupCoordinator::new(channel, key(), Party::Clinician, CleanupPolicy::default());
        coord.set_negotiated(Role::Offerer, &old);

        assert!(!coord.teardown().await.deleted_shared);
        assert_eq!(store.get(&key()).unwrap().nonce, fresh);
    }

    #[tokio::test]
    async fn either_side_spares_newer_session_under_same_key() {
        let (store, channel) = setup();
        let old = store.claim(&key(), "dr_kim").record().nonce.clone();
        store.delete(&key());
        store.claim(&key(), "dr_kim");

        let coord = CleanupCoordinator::new(channel, key(), Party::Patient, CleanupPolicy::EitherSide);
        coord.set_negotiated(Role::Answerer, &old);

        assert!(!coord.teardown().await.deleted_shared);
        assert_eq!(store.count(), 1);
    }

    #[tokio::test]
    async fn media_attached_after_teardown_is_stopped() {
        let (_store, channel) = setup();
        let coord = CleanupCoordinator::new(channel, key(), Party::Patient, CleanupPolicy::default());
        coord.teardown().await;

        let late = media();
        assert!(!coord.attach_media(late.clone()));
        assert!(late.tracks().iter().all(|t| t.is_stopped()));
    }
}
