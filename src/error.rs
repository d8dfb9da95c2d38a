// author: kodeholic (powered by Claude)

use std::fmt;

/// 카메라/마이크 획득 실패 원인: 사용자 안내 문구 분기용
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    /// 사용자 또는 OS가 권한 거부
    PermissionDenied,
    /// 다른 프로세스가 장치 점유 중
    InUse,
    /// 장치 없음
    NotFound,
    /// 미디어 캡처를 지원하지 않는 실행 환경
    Unsupported,
}

impl DeviceFault {
    /// 화면에 그대로 노출하는 조치 안내
    pub fn remediation(&self) -> &'static str {
        match self {
            DeviceFault::PermissionDenied => "Allow camera and microphone access in the browser or OS settings, then retry.",
            DeviceFault::InUse            => "Close other applications that are using the camera or microphone, then retry.",
            DeviceFault::NotFound         => "Connect a camera and microphone, then retry.",
            DeviceFault::Unsupported      => "This environment cannot capture media. Use a supported browser or device.",
        }
    }
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFault::PermissionDenied => write!(f, "permission denied"),
            DeviceFault::InUse            => write!(f, "device in use"),
            DeviceFault::NotFound         => write!(f, "device not found"),
            DeviceFault::Unsupported      => write!(f, "unsupported environment"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    // --- 미디어 장치 (Lobby 진입 단계, 협상 전) ---
    DeviceAcquisition(DeviceFault),
    InsecureContext,

    // --- 협상/시그널링 ---
    RoleConflict(String),
    SessionGone(String),
    Authorization(String),
    InvalidState(String),

    // --- 릴레이 게이트웨이 ---
    NotAuthenticated,
    InvalidToken,
    InvalidOpcode(u8),
    InvalidPayload(String),

    // --- 하위 계층 ---
    Signaling(String),
    Media(String),
    InternalError(String),
}

impl CallError {
    /// 같은 요청을 다시 시도해볼 만한 에러인지
    pub fn is_retryable(&self) -> bool {
        matches!(self, CallError::RoleConflict(_) | CallError::Signaling(_))
    }

    /// 사용자에게 노출할 필요 없는 종료 신호인지 (상대가 이미 통화를 정리함)
    pub fn is_benign(&self) -> bool {
        matches!(self, CallError::SessionGone(_))
    }

    /// 장치/환경 계열: 협상 단계에 진입하지 않고 로컬에서 처리
    pub fn is_device_error(&self) -> bool {
        matches!(self, CallError::DeviceAcquisition(_) | CallError::InsecureContext)
    }

    /// 변형 내부의 상세 문자열 (게이트웨이 ERROR 패킷 detail 필드)
    pub fn detail(&self) -> String {
        match self {
            CallError::RoleConflict(s)
            | CallError::SessionGone(s)
            | CallError::Authorization(s)
            | CallError::InvalidState(s)
            | CallError::InvalidPayload(s)
            | CallError::Signaling(s)
            | CallError::Media(s)
            | CallError::InternalError(s) => s.clone(),
            CallError::DeviceAcquisition(fault) => fault.to_string(),
            CallError::InvalidOpcode(op)        => op.to_string(),
            CallError::InsecureContext
            | CallError::NotAuthenticated
            | CallError::InvalidToken           => String::new(),
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::DeviceAcquisition(fault) => write!(f, "Media device acquisition failed: {}", fault),
            CallError::InsecureContext          => write!(f, "Media capture requires a secure context"),
            CallError::RoleConflict(msg)        => write!(f, "Role negotiation conflict: {}", msg),
            CallError::SessionGone(key)         => write!(f, "Session already torn down: {}", key),
            CallError::Authorization(msg)       => write!(f, "Not authorized for session: {}", msg),
            CallError::InvalidState(msg)        => write!(f, "Invalid state: {}", msg),
            CallError::NotAuthenticated         => write!(f, "Not authenticated"),
            CallError::InvalidToken             => write!(f, "Invalid token"),
            CallError::InvalidOpcode(op)        => write!(f, "Invalid opcode: {}", op),
            CallError::InvalidPayload(msg)      => write!(f, "Invalid payload: {}", msg),
            CallError::Signaling(msg)           => write!(f, "Signaling transport error: {}", msg),
            CallError::Media(msg)               => write!(f, "Peer connection error: {}", msg),
            CallError::InternalError(msg)       => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for CallError {}

pub type CallResult<T> = Result<T, CallError>;
