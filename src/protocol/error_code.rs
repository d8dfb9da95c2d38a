// author: kodeholic (powered by Claude)

use crate::error::CallError;

/// 1xxx: 연결/인증
pub const NOT_AUTHENTICATED:  u16 = 1000;
pub const INVALID_TOKEN:      u16 = 1001;
pub const INVALID_OPCODE:     u16 = 1003;
pub const INVALID_PAYLOAD:    u16 = 1004;

/// 2xxx: 세션/협상
pub const SESSION_GONE:       u16 = 2000;
pub const ROLE_CONFLICT:      u16 = 2001;
pub const INVALID_STATE:      u16 = 2002;
pub const AUTHORIZATION:      u16 = 2003;

/// 9xxx: 서버 내부
pub const INTERNAL_ERROR:     u16 = 9000;
pub const SIGNALING_ERROR:    u16 = 9001;

/// CallError → 에러 코드 변환
/// 에러 응답 패킷 생성 시 사용
pub fn to_error_code(err: &CallError) -> u16 {
    match err {
        CallError::NotAuthenticated       => NOT_AUTHENTICATED,
        CallError::InvalidToken           => INVALID_TOKEN,
        CallError::InvalidOpcode(_)       => INVALID_OPCODE,
        CallError::InvalidPayload(_)      => INVALID_PAYLOAD,

        CallError::SessionGone(_)         => SESSION_GONE,
        CallError::RoleConflict(_)        => ROLE_CONFLICT,
        CallError::InvalidState(_)        => INVALID_STATE,
        CallError::Authorization(_)       => AUTHORIZATION,

        CallError::Signaling(_)           => SIGNALING_ERROR,

        // 장치/미디어 계층은 릴레이를 통과하지 않음
        CallError::DeviceAcquisition(_)
        | CallError::InsecureContext
        | CallError::Media(_)
        | CallError::InternalError(_)     => INTERNAL_ERROR,
    }
}

/// ERROR 패킷 → CallError 복원 (WsChannel 클라이언트 측)
pub fn from_error_code(code: u16, detail: String) -> CallError {
    match code {
        NOT_AUTHENTICATED => CallError::NotAuthenticated,
        INVALID_TOKEN     => CallError::InvalidToken,
        INVALID_OPCODE    => CallError::InvalidOpcode(detail.parse().unwrap_or(0)),
        INVALID_PAYLOAD   => CallError::InvalidPayload(detail),
        SESSION_GONE      => CallError::SessionGone(detail),
        ROLE_CONFLICT     => CallError::RoleConflict(detail),
        INVALID_STATE     => CallError::InvalidState(detail),
        AUTHORIZATION     => CallError::Authorization(detail),
        SIGNALING_ERROR   => CallError::Signaling(detail),
        _                 => CallError::InternalError(detail),
    }
}
