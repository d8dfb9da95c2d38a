// author: kodeholic (powered by Claude)

use serde::{Deserialize, Serialize};

use crate::core::{Candidate, Role, SessionDescription, SessionKey, SessionRecord};

// ----------------------------------------------------------------------------
// [공통] Gateway 패킷 봉투 (Envelope)
// ----------------------------------------------------------------------------

/// 모든 WebSocket 메시지의 최상위 구조체
/// 수신/송신 공통으로 사용하며, payload는 op에 따라 해석합니다.
///
/// 예시:
///   { "op": 13, "s": 7, "d": { "room_id": "H01", "call_id": "APT1", "description": {...} } }
///
/// s: 요청 시퀀스. READY/ACK/ERROR 는 요청의 s 를 그대로 돌려줌
#[derive(Serialize, Deserialize, Debug)]
pub struct GatewayPacket {
    /// opcode (protocol::opcode 참조)
    pub op: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    /// payload. op에 따라 구조가 달라지므로 raw JSON으로 보관
    #[serde(default)]
    pub d: Option<serde_json::Value>,
}

// ----------------------------------------------------------------------------
// [C→S] 클라이언트 요청 payload 타입들
// ----------------------------------------------------------------------------

/// op: IDENTIFY (3)
#[derive(Serialize, Deserialize, Debug)]
pub struct IdentifyPayload {
    pub user_id: String,
    pub token:   String,
}

/// op: SESSION_CLAIM (10)
#[derive(Serialize, Deserialize, Debug)]
pub struct SessionClaimPayload {
    #[serde(flatten)]
    pub key:          SessionKey,
    pub initiator_id: String,
}

/// op: SESSION_PURGE (11) / SESSION_ABANDON (12)
#[derive(Serialize, Deserialize, Debug)]
pub struct SessionNoncePayload {
    #[serde(flatten)]
    pub key:   SessionKey,
    pub nonce: String,
}

/// op: OFFER_PUBLISH (13) / ANSWER_PUBLISH (14)
#[derive(Serialize, Deserialize, Debug)]
pub struct DescriptionPayload {
    #[serde(flatten)]
    pub key:         SessionKey,
    pub description: SessionDescription,
}

/// op: CANDIDATE_APPEND (15)
#[derive(Serialize, Deserialize, Debug)]
pub struct CandidateAppendPayload {
    #[serde(flatten)]
    pub key:       SessionKey,
    pub side:      Role,
    pub candidate: Candidate,
}

/// op: SESSION_DELETE (16) / SESSION_WATCH (20)
#[derive(Serialize, Deserialize, Debug)]
pub struct SessionKeyPayload {
    #[serde(flatten)]
    pub key: SessionKey,
}

/// op: CANDIDATE_WATCH (21)
#[derive(Serialize, Deserialize, Debug)]
pub struct CandidateWatchPayload {
    #[serde(flatten)]
    pub key:  SessionKey,
    pub side: Role,
}

/// op: UNWATCH (22)
#[derive(Serialize, Deserialize, Debug)]
pub struct UnwatchPayload {
    pub watch_id: u64,
}

// ----------------------------------------------------------------------------
// [S→C] 서버 응답 payload 타입들
// ----------------------------------------------------------------------------

/// op: HELLO (0): 연결 직후 heartbeat 주기 안내
#[derive(Serialize, Deserialize, Debug)]
pub struct HelloPayload {
    pub heartbeat_interval: u64,
}

/// op: READY (4): IDENTIFY 성공 응답
#[derive(Serialize, Deserialize, Debug)]
pub struct ReadyPayload {
    pub session_id: String,
    pub user_id:    String,
}

/// op: ACK (200): 요청 성공 응답
/// data는 op마다 다르므로 raw Value 사용
#[derive(Serialize, Deserialize, Debug)]
pub struct AckPayload {
    pub op:   u8,
    pub data: serde_json::Value,
}

/// op: SESSION_EVENT (100)
#[derive(Serialize, Deserialize, Debug)]
pub struct SessionEventPayload {
    pub watch_id: u64,
    pub record:   SessionRecord,
}

/// op: CANDIDATE_EVENT (101)
#[derive(Serialize, Deserialize, Debug)]
pub struct CandidateEventPayload {
    pub watch_id:  u64,
    pub candidate: Candidate,
}

/// op: WATCH_END (102)
#[derive(Serialize, Deserialize, Debug)]
pub struct WatchEndPayload {
    pub watch_id: u64,
}

/// op: ERROR (201)
#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorPayload {
    pub code:   u16,
    pub reason: String,
    /// 에러 변형 내부 문자열: 클라이언트가 같은 CallError 로 복원할 때 사용
    #[serde(default)]
    pub detail: String,
}

// ----------------------------------------------------------------------------
// [헬퍼] 패킷 생성 함수
// ----------------------------------------------------------------------------

impl GatewayPacket {
    pub fn new(op: u8, payload: impl Serialize) -> Self {
        Self {
            op,
            s: None,
            d: Some(serde_json::to_value(payload).unwrap_or(serde_json::Value::Null)),
        }
    }

    pub fn no_data(op: u8) -> Self {
        Self { op, s: None, d: None }
    }

    pub fn with_seq(mut self, s: Option<u64>) -> Self {
        self.s = s;
        self
    }
}
