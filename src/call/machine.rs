// author: kodeholic (powered by Claude)
//
// Connection State Machine: 참여자 1명의 통화 수명
//
//   Lobby ──join_call──▶ Negotiating ──첫 remote track──▶ Connected
//     │                      │                              │
//     └──────────────────────┴──────── leave / 실패 ────────┴──▶ Terminated(reason)
//
// 태스크 구성 (모두 tasks 에 등록, 종료 시 teardown 전에 abort = 구독 해제):
//   acquire  : join_session 시점부터 장치 획득
//   candidate: 상대 side candidate 구독 → relay
//   events   : PeerEvent 수신 (로컬 candidate 전달, remote track, 상대 연결 종료, 실패)
//   monitor  : 세션 구독: 스트림이 끝나면 상대가 통화를 정리한 것
//
// 태스크 안에서 종료를 일으킬 때는 새 태스크에서 terminate 를 돈다
// (자기 자신을 abort 하면서 teardown 이 끊기지 않도록)

use futures_util::StreamExt;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::{Role, SessionDescription, SessionKey, SessionRecord};
use crate::error::{CallError, CallResult, DeviceFault};
use crate::media::{
    LocalMedia, MediaConstraints, MediaDevices, PeerEvent, PeerFactory, TrackKind,
};
use crate::signaling::{SessionWatch, SignalingChannel};

use super::cleanup::{CleanupCoordinator, CleanupPolicy, TeardownReport};
use super::identity::SessionContext;
use super::negotiator::{negotiate_role, NegotiationPolicy};
use super::relay::CandidateRelay;

// ----------------------------------------------------------------------------
// [Phase]
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    LocalLeave,
    /// 상대(또는 reaper)가 세션을 정리함
    RemoteEnded,
    DeviceFailure(DeviceFault),
    InsecureContext,
    NegotiationFailed(String),
    MediaFailure(String),
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::LocalLeave             => write!(f, "left"),
            EndReason::RemoteEnded            => write!(f, "remote ended"),
            EndReason::DeviceFailure(fault)   => write!(f, "device failure: {}", fault),
            EndReason::InsecureContext        => write!(f, "insecure context"),
            EndReason::NegotiationFailed(msg) => write!(f, "negotiation failed: {}", msg),
            EndReason::MediaFailure(msg)      => write!(f, "media failure: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallPhase {
    Lobby,
    Negotiating,
    Connected,
    Terminated(EndReason),
}

impl CallPhase {
    pub fn is_terminated(&self) -> bool {
        matches!(self, CallPhase::Terminated(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallPhase::Lobby         => "lobby",
            CallPhase::Negotiating   => "negotiating",
            CallPhase::Connected     => "connected",
            CallPhase::Terminated(_) => "terminated",
        }
    }

    fn can_move_to(&self, next: &CallPhase) -> bool {
        matches!(
            (self, next),
            (CallPhase::Lobby, CallPhase::Negotiating)
                | (CallPhase::Negotiating, CallPhase::Connected)
                | (CallPhase::Lobby | CallPhase::Negotiating | CallPhase::Connected, CallPhase::Terminated(_))
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LocalMediaState {
    pub mic_enabled:    bool,
    pub camera_enabled: bool,
}

// ----------------------------------------------------------------------------
// [구성/의존성]
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct CallConfig {
    pub negotiation: NegotiationPolicy,
    pub cleanup:     CleanupPolicy,
    pub constraints: MediaConstraints,
}

#[derive(Clone)]
pub struct CallDeps {
    pub channel: Arc<dyn SignalingChannel>,
    pub devices: Arc<dyn MediaDevices>,
    pub peers:   Arc<dyn PeerFactory>,
    pub config:  CallConfig,
}

impl CallDeps {
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
        devices: Arc<dyn MediaDevices>,
        peers:   Arc<dyn PeerFactory>,
    ) -> Self {
        Self { channel, devices, peers, config: CallConfig::default() }
    }

    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Clone)]
enum MediaStatus {
    Pending,
    Ready(LocalMedia),
    Failed(CallError),
}

// ----------------------------------------------------------------------------
// [ParticipantSession]
// ----------------------------------------------------------------------------

struct Inner {
    ctx:            SessionContext,
    deps:           CallDeps,
    phase_tx:       watch::Sender<CallPhase>,
    media_rx:       watch::Receiver<MediaStatus>,
    role:           OnceLock<Role>,
    remote_present: AtomicBool,
    mic_enabled:    AtomicBool,
    camera_enabled: AtomicBool,
    join_requested: AtomicBool,
    coordinator:    CleanupCoordinator,
    tasks:          Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn phase(&self) -> CallPhase {
        self.phase_tx.borrow().clone()
    }

    /// 허용된 전이만 반영. Terminated 이후는 모두 무시
    fn transition(&self, next: CallPhase) -> bool {
        let moved = self.phase_tx.send_if_modified(|phase| {
            if !phase.can_move_to(&next) {
                return false;
            }
            *phase = next.clone();
            true
        });
        if moved {
            info!("[call] {} {} -> {}", self.ctx.key, self.ctx.identity, describe(&next));
        }
        moved
    }

    /// 종료 이후 등록되는 태스크는 바로 abort
    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap();
        if self.phase().is_terminated() {
            handle.abort();
            return;
        }
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn current_media(&self) -> Option<LocalMedia> {
        match &*self.media_rx.borrow() {
            MediaStatus::Ready(media) => Some(media.clone()),
            _ => None,
        }
    }

    fn apply_media_flags(&self, media: &LocalMedia) {
        if let Some(track) = media.track(TrackKind::Audio) {
            track.set_enabled(self.mic_enabled.load(Ordering::SeqCst));
        }
        if let Some(track) = media.track(TrackKind::Video) {
            track.set_enabled(self.camera_enabled.load(Ordering::SeqCst));
        }
    }
}

fn describe(phase: &CallPhase) -> String {
    match phase {
        CallPhase::Terminated(reason) => format!("terminated ({})", reason),
        other => other.name().to_string(),
    }
}

/// phase 전이 → 태스크 abort → teardown
async fn terminate(inner: &Arc<Inner>, reason: EndReason) -> TeardownReport {
    inner.transition(CallPhase::Terminated(reason));

    let tasks: Vec<_> = inner.tasks.lock().unwrap().drain(..).collect();
    for task in tasks {
        task.abort();
    }
    inner.coordinator.teardown().await
}

fn spawn_terminate(weak: Weak<Inner>, reason: EndReason) {
    tokio::spawn(async move {
        if let Some(inner) = weak.upgrade() {
            terminate(&inner, reason).await;
        }
    });
}

/// 로비 진입: 장치 획득은 백그라운드에서 바로 시작
pub fn join_session(ctx: SessionContext, deps: CallDeps) -> ParticipantSession {
    let (phase_tx, _) = watch::channel(CallPhase::Lobby);
    let (media_tx, media_rx) = watch::channel(MediaStatus::Pending);

    let coordinator = CleanupCoordinator::new(
        Arc::clone(&deps.channel),
        ctx.key.clone(),
        ctx.party,
        deps.config.cleanup,
    );

    info!("[call] {} {} ({}) entered lobby", ctx.key, ctx.identity, ctx.party);

    let inner = Arc::new(Inner {
        ctx,
        deps,
        phase_tx,
        media_rx,
        role:           OnceLock::new(),
        remote_present: AtomicBool::new(false),
        mic_enabled:    AtomicBool::new(true),
        camera_enabled: AtomicBool::new(true),
        join_requested: AtomicBool::new(false),
        coordinator,
        tasks:          Mutex::new(Vec::new()),
    });

    let weak = Arc::downgrade(&inner);
    let devices = Arc::clone(&inner.deps.devices);
    let constraints = inner.deps.config.constraints;
    let handle = tokio::spawn(async move {
        let result = devices.acquire(constraints).await;
        let Some(inner) = weak.upgrade() else {
            if let Ok(media) = result {
                media.stop_all();
            }
            return;
        };
        match result {
            Ok(media) => {
                if !inner.coordinator.attach_media(media.clone()) {
                    media_tx.send_replace(MediaStatus::Failed(CallError::InvalidState(
                        "left before media was ready".to_string(),
                    )));
                    return;
                }
                media_tx.send_replace(MediaStatus::Ready(media.clone()));
                inner.apply_media_flags(&media);
                debug!("[call] {} media ready ({} tracks)", inner.ctx.key, media.tracks().len());
            }
            Err(e) => {
                warn!("[call] {} media acquisition failed: {}", inner.ctx.key, e);
                media_tx.send_replace(MediaStatus::Failed(e));
            }
        }
    });
    inner.track(handle);

    ParticipantSession { inner }
}

/// 외부 협력자용 종료 진입점
pub async fn leave_session(session: &ParticipantSession) -> TeardownReport {
    session.leave().await
}

#[derive(Clone)]
pub struct ParticipantSession {
    inner: Arc<Inner>,
}

impl ParticipantSession {
    pub fn context(&self) -> &SessionContext {
        &self.inner.ctx
    }

    pub fn key(&self) -> &SessionKey {
        &self.inner.ctx.key
    }

    pub fn phase(&self) -> CallPhase {
        self.inner.phase()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<CallPhase> {
        self.inner.phase_tx.subscribe()
    }

    /// 조건을 만족하거나 종료될 때까지 대기: 그 시점의 phase 반환
    pub async fn wait_for_phase(&self, pred: impl Fn(&CallPhase) -> bool) -> CallPhase {
        let mut rx = self.subscribe_phase();
        let reached = rx
            .wait_for(|p| pred(p) || p.is_terminated())
            .await
            .map(|p| (*p).clone());
        reached.unwrap_or_else(|_| self.phase())
    }

    pub fn role(&self) -> Option<Role> {
        self.inner.role.get().copied()
    }

    pub fn remote_present(&self) -> bool {
        self.inner.remote_present.load(Ordering::SeqCst)
    }

    pub fn local_media_state(&self) -> LocalMediaState {
        LocalMediaState {
            mic_enabled:    self.inner.mic_enabled.load(Ordering::SeqCst),
            camera_enabled: self.inner.camera_enabled.load(Ordering::SeqCst),
        }
    }

    /// 로비 미리보기용: 획득이 끝날 때까지 대기
    pub async fn local_media(&self) -> CallResult<LocalMedia> {
        let mut rx = self.inner.media_rx.clone();
        let status = rx
            .wait_for(|s| !matches!(s, MediaStatus::Pending))
            .await
            .map(|s| (*s).clone());
        match status {
            Ok(MediaStatus::Ready(media))  => Ok(media),
            Ok(MediaStatus::Failed(e))     => Err(e),
            Ok(MediaStatus::Pending) | Err(_) => Err(CallError::InvalidState(
                "media acquisition cancelled".to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------------
    // 로컬 미디어 토글: phase 불변, 장치 재획득 없음
    // ------------------------------------------------------------------------

    pub fn set_mic_enabled(&self, enabled: bool) {
        self.inner.mic_enabled.store(enabled, Ordering::SeqCst);
        if let Some(track) = self.inner.current_media().as_ref().and_then(|m| m.track(TrackKind::Audio)) {
            track.set_enabled(enabled);
        }
    }

    pub fn set_camera_enabled(&self, enabled: bool) {
        self.inner.camera_enabled.store(enabled, Ordering::SeqCst);
        if let Some(track) = self.inner.current_media().as_ref().and_then(|m| m.track(TrackKind::Video)) {
            track.set_enabled(enabled);
        }
    }

    /// 토글 후 상태 반환
    pub fn toggle_mic(&self) -> bool {
        let next = !self.inner.mic_enabled.load(Ordering::SeqCst);
        self.set_mic_enabled(next);
        next
    }

    pub fn toggle_camera(&self) -> bool {
        let next = !self.inner.camera_enabled.load(Ordering::SeqCst);
        self.set_camera_enabled(next);
        next
    }

    // ------------------------------------------------------------------------
    // join / leave
    // ------------------------------------------------------------------------

    /// 사용자 "참여": Lobby → Negotiating → (비동기) Connected
    /// 협상이 끝나 상대 트랙을 기다리는 시점에 리턴
    pub async fn join_call(&self) -> CallResult<()> {
        if self.inner.join_requested.swap(true, Ordering::SeqCst) {
            return Err(CallError::InvalidState("join already requested".to_string()));
        }
        if self.phase() != CallPhase::Lobby {
            return Err(CallError::InvalidState(format!("cannot join from {}", self.phase().name())));
        }

        let media = match self.local_media().await {
            Ok(media) => media,
            Err(e) => {
                let reason = match &e {
                    CallError::DeviceAcquisition(fault) => Some(EndReason::DeviceFailure(*fault)),
                    CallError::InsecureContext          => Some(EndReason::InsecureContext),
                    _ => None,
                };
                if let Some(reason) = reason {
                    terminate(&self.inner, reason).await;
                }
                return Err(e);
            }
        };

        if !self.inner.transition(CallPhase::Negotiating) {
            return Err(CallError::InvalidState("call already ended".to_string()));
        }

        match self.negotiate(media).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let reason = if e.is_benign() {
                    EndReason::RemoteEnded
                } else {
                    EndReason::NegotiationFailed(e.to_string())
                };
                terminate(&self.inner, reason).await;
                Err(e)
            }
        }
    }

    /// 멱등. 첫 호출만 실제 teardown 리포트를 돌려줌
    pub async fn leave(&self) -> TeardownReport {
        terminate(&self.inner, EndReason::LocalLeave).await
    }

    async fn negotiate(&self, media: LocalMedia) -> CallResult<()> {
        let inner = &self.inner;
        let key = &inner.ctx.key;
        let channel = Arc::clone(&inner.deps.channel);

        let (peer, events) = inner.deps.peers.create()?;
        if !inner.coordinator.attach_peer(Arc::clone(&peer)) {
            peer.close().await;
            return Err(CallError::InvalidState("left during negotiation".to_string()));
        }
        for track in media.tracks() {
            peer.add_track(Arc::clone(track)).await?;
        }

        let negotiated = negotiate_role(&*channel, key, &inner.ctx.identity, &inner.deps.config.negotiation).await?;
        let role = negotiated.role;
        let nonce = negotiated.record.nonce.clone();
        if !inner.coordinator.set_negotiated(role, &nonce) {
            inner.coordinator.reclaim_shared(role, &nonce).await;
            return Err(CallError::InvalidState("left during negotiation".to_string()));
        }
        if inner.role.set(role).is_err() {
            debug!("[call] {} role already recorded, keeping first", key);
        }

        let relay = Arc::new(CandidateRelay::new(Arc::clone(&channel), key.clone(), role, Arc::clone(&peer)));

        // 상대 side candidate 구독
        let remote = channel.watch_candidates(key, role.opposite()).await?;
        let pump = Arc::clone(&relay);
        self.spawn(async move { pump.pump_remote(remote).await });

        // PeerEvent
        self.spawn(pump_events(Arc::downgrade(inner), Arc::clone(&relay), events));

        let mut session = channel.watch_session(key).await?;

        match role {
            Role::Offerer => {
                let offer = peer.create_offer().await?;
                peer.set_local_description(offer.clone()).await?;
                channel.publish_offer(key, offer).await?;

                let answer = self.await_description(&mut session, |r| r.answer).await?;
                peer.set_remote_description(answer).await?;
                relay.remote_description_applied().await;
            }
            Role::Answerer => {
                let offer = self.await_description(&mut session, |r| r.offer).await?;
                peer.set_remote_description(offer).await?;
                relay.remote_description_applied().await;

                let answer = peer.create_answer().await?;
                peer.set_local_description(answer.clone()).await?;
                channel.publish_answer(key, answer).await?;
            }
        }
        info!("[call] {} {} descriptions exchanged as {}", key, inner.ctx.identity, role);

        // 세션 구독이 끝나면 상대가 통화를 정리한 것
        let weak = Arc::downgrade(inner);
        self.spawn(async move {
            while session.next().await.is_some() {}
            spawn_terminate(weak, EndReason::RemoteEnded);
        });
        Ok(())
    }

    /// 세션 스냅샷에서 원하는 description 이 처음 보일 때까지 대기
    /// 도중 종료되면 중단, 세션이 사라지면 SessionGone
    async fn await_description(
        &self,
        session: &mut SessionWatch,
        pick:    impl Fn(SessionRecord) -> Option<SessionDescription>,
    ) -> CallResult<SessionDescription> {
        let ended = ended(self.subscribe_phase());
        tokio::pin!(ended);

        loop {
            tokio::select! {
                next = session.next() => match next {
                    Some(record) => {
                        if let Some(description) = pick(record) {
                            return Ok(description);
                        }
                    }
                    None => return Err(CallError::SessionGone(self.key().to_string())),
                },
                _ = &mut ended => {
                    return Err(CallError::InvalidState("call ended during negotiation".to_string()));
                }
            }
        }
    }

    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.track(tokio::spawn(fut));
    }
}

async fn ended(mut rx: watch::Receiver<CallPhase>) {
    let _ = rx.wait_for(CallPhase::is_terminated).await.map(|_| ());
}

async fn pump_events(
    weak:   Weak<Inner>,
    relay:  Arc<CandidateRelay>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::LocalCandidate(candidate) => relay.forward_local(candidate).await,
            PeerEvent::RemoteTrack { kind } => {
                let Some(inner) = weak.upgrade() else { return };
                debug!("[call] {} remote {} track", inner.ctx.key, kind);
                inner.remote_present.store(true, Ordering::SeqCst);
                inner.transition(CallPhase::Connected);
            }
            // 공유 상태를 지울 권한이 없는 쪽이 나가도 통화는 끝남
            PeerEvent::RemoteClosed => {
                spawn_terminate(weak, EndReason::RemoteEnded);
                return;
            }
            PeerEvent::Failed(reason) => {
                spawn_terminate(weak, EndReason::MediaFailure(reason));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::identity::Party;
    use crate::core::SessionStore;
    use crate::media::{LoopbackDevices, LoopbackFactory};
    use crate::signaling::LocalChannel;

    fn ctx(identity: &str, party: Party) -> SessionContext {
        SessionContext {
            key:           SessionKey::new("H01", "APT1"),
            identity:      identity.to_string(),
            party,
            peer_identity: "peer".to_string(),
        }
    }

    fn deps(store: &Arc<SessionStore>, devices: Arc<LoopbackDevices>) -> CallDeps {
        CallDeps::new(
            Arc::new(LocalChannel::new(Arc::clone(store))),
            devices,
            Arc::new(LoopbackFactory::new()),
        )
    }

    #[test]
    fn phase_transitions_are_one_way() {
        assert!(CallPhase::Lobby.can_move_to(&CallPhase::Negotiating));
        assert!(!CallPhase::Lobby.can_move_to(&CallPhase::Connected));
        assert!(CallPhase::Connected.can_move_to(&CallPhase::Terminated(EndReason::LocalLeave)));
        assert!(!CallPhase::Terminated(EndReason::LocalLeave).can_move_to(&CallPhase::Terminated(EndReason::RemoteEnded)));
        assert!(!CallPhase::Connected.can_move_to(&CallPhase::Negotiating));
    }

    #[tokio::test]
    async fn toggles_flip_tracks_in_place() {
        let store = Arc::new(SessionStore::new());
        let devices = Arc::new(LoopbackDevices::new());
        let session = join_session(ctx("dr_kim", Party::Clinician), deps(&store, Arc::clone(&devices)));

        let media = session.local_media().await.unwrap();
        assert!(!session.toggle_mic());
        assert!(!session.toggle_camera());
        assert!(session.toggle_camera());

        assert!(!media.track(TrackKind::Audio).unwrap().is_enabled());
        assert!(media.track(TrackKind::Video).unwrap().is_enabled());
        assert_eq!(session.local_media_state(), LocalMediaState { mic_enabled: false, camera_enabled: true });
        assert_eq!(session.phase(), CallPhase::Lobby);
        assert_eq!(devices.acquisitions(), 1);
    }

    #[tokio::test]
    async fn leave_is_idempotent_in_lobby() {
        let store = Arc::new(SessionStore::new());
        let session = join_session(ctx("dr_kim", Party::Clinician), deps(&store, Arc::new(LoopbackDevices::new())));
        session.local_media().await.unwrap();

        let first = leave_session(&session).await;
        assert_eq!(first.released_local, 2);
        assert_eq!(session.leave().await, TeardownReport::default());
        assert_eq!(session.phase(), CallPhase::Terminated(EndReason::LocalLeave));
        assert!(session.join_call().await.is_err());
    }

    #[tokio::test]
    async fn insecure_context_never_negotiates() {
        let store = Arc::new(SessionStore::new());
        let session = join_session(ctx("pt_lee", Party::Patient), deps(&store, Arc::new(LoopbackDevices::insecure())));

        let err = session.join_call().await.unwrap_err();
        assert_eq!(err, CallError::InsecureContext);
        assert_eq!(session.phase(), CallPhase::Terminated(EndReason::InsecureContext));
        assert!(session.role().is_none());
        assert_eq!(store.count(), 0);
    }
}
