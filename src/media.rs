// author: kodeholic (powered by Claude)
//
// 미디어 계층 경계: 장치 획득과 피어 연결 객체
//
// 실제 캡처/코덱/ICE 스택은 이 크레이트 밖의 일이고, 여기서는
// 상태 머신이 의존하는 표면만 trait 으로 정의한다.
//   MediaDevices   : 카메라/마이크 획득 (Lobby 단계에서 1회)
//   PeerConnection : description 생성/적용, candidate 적용, 트랙 부착
//   PeerFactory    : 통화마다 새 PeerConnection + 이벤트 수신기 생성
//
// loopback 은 테스트/데모용 시뮬레이션 구현

pub mod loopback;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::{Candidate, SessionDescription};
use crate::error::CallResult;

pub use loopback::{LoopbackDevices, LoopbackFactory, LoopbackNetwork, LoopbackPeer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

// ----------------------------------------------------------------------------
// [LocalTrack] 획득한 로컬 트랙: enabled 토글은 하드웨어 재획득 없이 제자리에서
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct LocalTrack {
    id:      String,
    kind:    TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id:      id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str { &self.id }

    pub fn kind(&self) -> TrackKind { self.kind }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// 장치 해제. 이미 멈춘 트랙이면 false
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::Relaxed)
    }
}

/// 한 번의 획득 결과 (오디오 + 비디오)
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// 모든 트랙 정지, 실제로 멈춘 개수 반환
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self { audio: true, video: true }
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// 실패: DeviceAcquisition(fault) 또는 InsecureContext
    async fn acquire(&self, constraints: MediaConstraints) -> CallResult<LocalMedia>;
}

// ----------------------------------------------------------------------------
// [PeerConnection]
// ----------------------------------------------------------------------------

/// 피어 연결이 비동기로 올려보내는 사건
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// 로컬 description 적용 후 수집된 candidate: 시그널링으로 전달해야 함
    LocalCandidate(Candidate),
    /// 상대 트랙 수신 시작
    RemoteTrack { kind: TrackKind },
    /// 상대가 연결을 닫음
    RemoteClosed,
    /// 연결/트랙 실패
    Failed(String),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<LocalTrack>) -> CallResult<()>;

    async fn create_offer(&self) -> CallResult<SessionDescription>;

    async fn create_answer(&self) -> CallResult<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> CallResult<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> CallResult<()>;

    fn has_remote_description(&self) -> bool;

    /// remote description 적용 전 호출은 에러
    async fn add_ice_candidate(&self, candidate: Candidate) -> CallResult<()>;

    async fn close(&self);
}

pub trait PeerFactory: Send + Sync {
    fn create(&self) -> CallResult<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>)>;
}
