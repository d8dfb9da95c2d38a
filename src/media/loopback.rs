// author: kodeholic (powered by Claude)
//
// Loopback 미디어: 실제 장치/ICE 없이 상태 머신을 끝까지 돌리기 위한 시뮬레이션
//
// LoopbackPeer 규칙:
//   set_local_description → LocalCandidate N개 발생
//   remote description 전 add_ice_candidate → 에러 + early 카운트 증가
//   같은 candidate 재적용 → no-op
//   local + remote + 적용된 remote candidate 1개 이상 → RemoteTrack(audio, video) 1회
//   같은 LoopbackNetwork 위에서는 remote description 으로 상대 peer 를 찾아 연결,
//   한쪽이 close 하면 상대에게 RemoteClosed

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

use crate::core::{Candidate, SdpType, SessionDescription};
use crate::error::{CallError, CallResult, DeviceFault};
use crate::utils::random_token;

use super::{
    LocalMedia, LocalTrack, MediaConstraints, MediaDevices, PeerConnection, PeerEvent,
    PeerFactory, TrackKind,
};

// ----------------------------------------------------------------------------
// [LoopbackDevices]
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct LoopbackDevices {
    fault:        Option<DeviceFault>,
    insecure:     bool,
    delay:        Duration,
    acquisitions: AtomicUsize,
    issued:       Mutex<Vec<Arc<LocalTrack>>>,
}

impl LoopbackDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// 항상 해당 fault 로 실패
    pub fn failing(fault: DeviceFault) -> Self {
        Self { fault: Some(fault), ..Self::default() }
    }

    /// 보안 컨텍스트가 아닌 실행 환경
    pub fn insecure() -> Self {
        Self { insecure: true, ..Self::default() }
    }

    /// 권한 프롬프트 대기 흉내
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// acquire 호출 횟수
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// 지금까지 내준 모든 트랙
    pub fn issued(&self) -> Vec<Arc<LocalTrack>> {
        self.issued.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> CallResult<LocalMedia> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.insecure {
            return Err(CallError::InsecureContext);
        }
        if let Some(fault) = self.fault {
            return Err(CallError::DeviceAcquisition(fault));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(LocalTrack::new(format!("mic-{}", random_token(6)), TrackKind::Audio)));
        }
        if constraints.video {
            tracks.push(Arc::new(LocalTrack::new(format!("cam-{}", random_token(6)), TrackKind::Video)));
        }
        self.issued.lock().unwrap().extend(tracks.iter().cloned());
        Ok(LocalMedia::new(tracks))
    }
}

// ----------------------------------------------------------------------------
// [LoopbackNetwork]
// ----------------------------------------------------------------------------

/// 참여자별 factory 를 하나의 가상 네트워크로 묶음
/// local description 을 게시해 두고, remote description 의 sdp 로 상대를 찾는다
#[derive(Default)]
pub struct LoopbackNetwork {
    published: Mutex<Vec<(String, Weak<LoopbackPeer>)>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn publish(&self, sdp: &str, peer: Weak<LoopbackPeer>) {
        self.published.lock().unwrap().push((sdp.to_string(), peer));
    }

    /// 해당 sdp 를 가장 최근에 게시한, 아직 열려 있는 다른 peer
    fn locate(&self, sdp: &str, asking: &LoopbackPeer) -> Option<Arc<LoopbackPeer>> {
        // peer state 는 네트워크 잠금을 푼 뒤에 확인
        let matching: Vec<Arc<LoopbackPeer>> = {
            let published = self.published.lock().unwrap();
            published.iter().rev()
                .filter(|(s, _)| s == sdp)
                .filter_map(|(_, w)| w.upgrade())
                .collect()
        };
        matching.into_iter()
            .find(|p| !std::ptr::eq(p.as_ref(), asking) && !p.is_closed())
    }
}

// ----------------------------------------------------------------------------
// [LoopbackPeer]
// ----------------------------------------------------------------------------

#[derive(Default)]
struct PeerState {
    local:         Option<SessionDescription>,
    remote:        Option<SessionDescription>,
    applied:       Vec<Candidate>,
    seen:          HashSet<Candidate>,
    tracks:        Vec<Arc<LocalTrack>>,
    early:         usize,
    closed:        bool,
    remote_tracks: bool,
}

pub struct LoopbackPeer {
    label:           String,
    sdp:             Option<String>,
    candidate_count: usize,
    events:          mpsc::UnboundedSender<PeerEvent>,
    state:           Mutex<PeerState>,
    me:              Weak<LoopbackPeer>,
    network:         Option<Arc<LoopbackNetwork>>,
    link:            Mutex<Option<Weak<LoopbackPeer>>>,
}

impl LoopbackPeer {
    fn new(
        label:           String,
        sdp:             Option<String>,
        candidate_count: usize,
        network:         Option<Arc<LoopbackNetwork>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let peer = Arc::new_cyclic(|me| Self {
            label,
            sdp,
            candidate_count,
            events,
            state: Mutex::new(PeerState::default()),
            me: me.clone(),
            network,
            link: Mutex::new(None),
        });
        (peer, rx)
    }

    pub fn label(&self) -> &str { &self.label }

    /// 적용된 remote candidate (적용 순서)
    pub fn applied_candidates(&self) -> Vec<Candidate> {
        self.state.lock().unwrap().applied.clone()
    }

    /// remote description 전에 들어온 candidate 수: 0 이어야 정상
    pub fn early_candidates(&self) -> usize {
        self.state.lock().unwrap().early
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }

    pub fn track_count(&self) -> usize {
        self.state.lock().unwrap().tracks.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// 네트워크상 연결된 상대가 있는가
    pub fn is_linked(&self) -> bool {
        self.link.lock().unwrap().as_ref().is_some_and(|w| w.strong_count() > 0)
    }

    /// 연결 실패 주입
    pub fn fail(&self, reason: &str) {
        let _ = self.events.send(PeerEvent::Failed(reason.to_string()));
    }

    fn make_sdp(&self, kind: &str) -> String {
        self.sdp.clone().unwrap_or_else(|| {
            format!("v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns={} {}\r\n", random_token(10), kind, self.label)
        })
    }

    fn ensure_open(state: &PeerState) -> CallResult<()> {
        if state.closed {
            return Err(CallError::Media("peer connection closed".to_string()));
        }
        Ok(())
    }

    fn link_remote(&self, remote_sdp: &str) {
        let Some(network) = &self.network else { return };
        let Some(remote) = network.locate(remote_sdp, self) else {
            trace!("[loopback] {} no peer on network for remote description", self.label);
            return;
        };
        *self.link.lock().unwrap() = Some(Arc::downgrade(&remote));
        *remote.link.lock().unwrap() = Some(self.me.clone());
        trace!("[loopback] {} linked with {}", self.label, remote.label);
    }

    fn remote_closed(&self) {
        if self.is_closed() {
            return;
        }
        self.link.lock().unwrap().take();
        trace!("[loopback] {} remote side closed", self.label);
        let _ = self.events.send(PeerEvent::RemoteClosed);
    }

    fn maybe_remote_tracks(&self, state: &mut PeerState) {
        if state.remote_tracks || state.local.is_none() || state.remote.is_none() || state.applied.is_empty() {
            return;
        }
        state.remote_tracks = true;
        trace!("[loopback] {} remote tracks up", self.label);
        let _ = self.events.send(PeerEvent::RemoteTrack { kind: TrackKind::Audio });
        let _ = self.events.send(PeerEvent::RemoteTrack { kind: TrackKind::Video });
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn add_track(&self, track: Arc<LocalTrack>) -> CallResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::ensure_open(&state)?;
        state.tracks.push(track);
        Ok(())
    }

    async fn create_offer(&self) -> CallResult<SessionDescription> {
        Self::ensure_open(&self.state.lock().unwrap())?;
        Ok(SessionDescription::offer(self.make_sdp("offer")))
    }

    async fn create_answer(&self) -> CallResult<SessionDescription> {
        let state = self.state.lock().unwrap();
        Self::ensure_open(&state)?;
        match &state.remote {
            Some(d) if d.sdp_type == SdpType::Offer => Ok(SessionDescription::answer(self.make_sdp("answer"))),
            _ => Err(CallError::InvalidState("create_answer without remote offer".to_string())),
        }
    }

    async fn set_local_description(&self, description: SessionDescription) -> CallResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::ensure_open(&state)?;
        if state.local.is_some() {
            return Err(CallError::InvalidState("local description already set".to_string()));
        }
        if let Some(network) = &self.network {
            network.publish(&description.sdp, self.me.clone());
        }
        state.local = Some(description);

        let mut rng = rand::thread_rng();
        for i in 0..self.candidate_count {
            let port: u16 = rng.gen_range(40_000..60_000);
            let candidate = Candidate {
                candidate:       format!("candidate:{} 1 udp {} 10.0.0.{} {} typ host", i + 1, 2_130_706_431 - i, i + 2, port),
                sdp_mid:         Some("0".to_string()),
                sdp_mline_index: Some(0),
            };
            let _ = self.events.send(PeerEvent::LocalCandidate(candidate));
        }

        self.maybe_remote_tracks(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> CallResult<()> {
        let sdp = description.sdp.clone();
        {
            let mut state = self.state.lock().unwrap();
            Self::ensure_open(&state)?;
            if state.remote.is_some() {
                return Err(CallError::InvalidState("remote description already set".to_string()));
            }
            state.remote = Some(description);
            self.maybe_remote_tracks(&mut state);
        }
        // 상대 state 잠금과 겹치지 않도록 내 잠금을 푼 뒤 연결
        self.link_remote(&sdp);
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.state.lock().unwrap().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> CallResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::ensure_open(&state)?;
        if state.remote.is_none() {
            state.early += 1;
            return Err(CallError::InvalidState("candidate before remote description".to_string()));
        }
        if !state.seen.insert(candidate.clone()) {
            return Ok(());
        }
        state.applied.push(candidate);
        self.maybe_remote_tracks(&mut state);
        Ok(())
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        let remote = self.link.lock().unwrap().take().and_then(|w| w.upgrade());
        if let Some(remote) = remote {
            remote.remote_closed();
        }
    }
}

// ----------------------------------------------------------------------------
// [LoopbackFactory]
// ----------------------------------------------------------------------------

pub struct LoopbackFactory {
    sdp:             Option<String>,
    candidate_count: usize,
    network:         Option<Arc<LoopbackNetwork>>,
    peers:           Mutex<Vec<Arc<LoopbackPeer>>>,
}

impl Default for LoopbackFactory {
    fn default() -> Self {
        Self { sdp: None, candidate_count: 2, network: None, peers: Mutex::new(Vec::new()) }
    }
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 생성하는 모든 description 의 sdp 고정
    pub fn with_sdp(mut self, sdp: impl Into<String>) -> Self {
        self.sdp = Some(sdp.into());
        self
    }

    pub fn with_candidates(mut self, count: usize) -> Self {
        self.candidate_count = count;
        self
    }

    /// 상대 참여자의 factory 와 같은 네트워크에 연결
    pub fn on_network(mut self, network: &Arc<LoopbackNetwork>) -> Self {
        self.network = Some(Arc::clone(network));
        self
    }

    pub fn peers(&self) -> Vec<Arc<LoopbackPeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub fn last_peer(&self) -> Option<Arc<LoopbackPeer>> {
        self.peers.lock().unwrap().last().cloned()
    }
}

impl PeerFactory for LoopbackFactory {
    fn create(&self) -> CallResult<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>)> {
        let mut peers = self.peers.lock().unwrap();
        let label = format!("peer-{}", peers.len() + 1);
        let (peer, rx) = LoopbackPeer::new(label, self.sdp.clone(), self.candidate_count, self.network.clone());
        peers.push(Arc::clone(&peer));
        Ok((peer, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<PeerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn denied_devices_report_fault() {
        let devices = LoopbackDevices::failing(DeviceFault::PermissionDenied);
        let err = devices.acquire(MediaConstraints::default()).await.unwrap_err();
        assert_eq!(err, CallError::DeviceAcquisition(DeviceFault::PermissionDenied));
        assert_eq!(devices.acquisitions(), 1);
        assert!(devices.issued().is_empty());
    }

    #[tokio::test]
    async fn acquire_honors_constraints() {
        let devices = LoopbackDevices::new();
        let media = devices
            .acquire(MediaConstraints { audio: true, video: false })
            .await
            .unwrap();
        assert_eq!(media.tracks().len(), 1);
        assert!(media.track(TrackKind::Audio).is_some());
    }

    #[tokio::test]
    async fn candidate_before_remote_description_is_rejected() {
        let factory = LoopbackFactory::new();
        let (peer, _rx) = factory.create().unwrap();
        let err = peer.add_ice_candidate(Candidate::new("c1")).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState(_)));
        assert_eq!(factory.last_peer().unwrap().early_candidates(), 1);
    }

    #[tokio::test]
    async fn local_description_emits_candidates() {
        let factory = LoopbackFactory::new().with_candidates(3);
        let (peer, mut rx) = factory.create().unwrap();
        let offer = peer.create_offer().await.unwrap();
        peer.set_local_description(offer).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| matches!(e, PeerEvent::LocalCandidate(_))));
    }

    #[tokio::test]
    async fn remote_tracks_after_description_and_candidate() {
        let factory = LoopbackFactory::new().with_sdp("v=0...A").with_candidates(0);
        let (peer, mut rx) = factory.create().unwrap();

        peer.set_remote_description(SessionDescription::offer("v=0...B")).await.unwrap();
        let answer = peer.create_answer().await.unwrap();
        assert_eq!(answer.sdp, "v=0...A");
        peer.set_local_description(answer).await.unwrap();
        assert!(drain(&mut rx).is_empty());

        peer.add_ice_candidate(Candidate::new("c1")).await.unwrap();
        peer.add_ice_candidate(Candidate::new("c1")).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events, vec![
            PeerEvent::RemoteTrack { kind: TrackKind::Audio },
            PeerEvent::RemoteTrack { kind: TrackKind::Video },
        ]);
        assert_eq!(factory.last_peer().unwrap().applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn closing_one_side_notifies_the_other_on_same_network() {
        let network = LoopbackNetwork::new();
        let a = LoopbackFactory::new().with_sdp("v=0...A").with_candidates(0).on_network(&network);
        let b = LoopbackFactory::new().with_sdp("v=0...B").with_candidates(0).on_network(&network);
        let (offerer, mut offerer_rx) = a.create().unwrap();
        let (answerer, mut answerer_rx) = b.create().unwrap();

        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();
        assert!(a.last_peer().unwrap().is_linked());
        assert!(b.last_peer().unwrap().is_linked());

        answerer.close().await;
        answerer.close().await;

        assert_eq!(drain(&mut offerer_rx), vec![PeerEvent::RemoteClosed]);
        assert!(drain(&mut answerer_rx).is_empty());
        assert!(!a.last_peer().unwrap().is_linked());
    }

    #[tokio::test]
    async fn without_network_close_is_silent() {
        let a = LoopbackFactory::new().with_sdp("v=0...A").with_candidates(0);
        let b = LoopbackFactory::new().with_sdp("v=0...B").with_candidates(0);
        let (offerer, mut offerer_rx) = a.create().unwrap();
        let (answerer, _answerer_rx) = b.create().unwrap();

        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        answerer.close().await;

        assert!(drain(&mut offerer_rx).is_empty());
    }

    #[tokio::test]
    async fn answer_requires_remote_offer() {
        let factory = LoopbackFactory::new();
        let (peer, _rx) = factory.create().unwrap();
        assert!(peer.create_answer().await.is_err());
        peer.close().await;
        assert!(peer.create_offer().await.is_err());
    }
}
