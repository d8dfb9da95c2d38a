// author: kodeholic (powered by Claude)
// 세션 레코드 + 후보(candidate) 데이터 모델
//
// 와이어 형태 (camelCase):
//   { "initiatorId": "...", "answererId": "...", "nonce": "...", "createdAt": 0,
//     "offer":  { "type": "offer",  "sdp": "..." },
//     "answer": { "type": "answer", "sdp": "..." } }

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config;
use crate::utils::{current_timestamp, random_token};

// ----------------------------------------------------------------------------
// [SessionKey] 병원(room) + 진료예약(call) 복합 키
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub room_id: String,
    pub call_id: String,
}

impl SessionKey {
    pub fn new(room_id: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self { room_id: room_id.into(), call_id: call_id.into() }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.room_id, self.call_id)
    }
}

// ----------------------------------------------------------------------------
// [Role] 협상 역할: candidate 컬렉션 구분(side)에도 그대로 사용
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Offerer,
    Answerer,
}

impl Role {
    pub fn opposite(&self) -> Role {
        match self {
            Role::Offerer  => Role::Answerer,
            Role::Answerer => Role::Offerer,
        }
    }

    /// 세션 하위 컬렉션 이름
    pub fn collection(&self) -> &'static str {
        match self {
            Role::Offerer  => "offererCandidates",
            Role::Answerer => "answererCandidates",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offerer  => write!(f, "offerer"),
            Role::Answerer => write!(f, "answerer"),
        }
    }
}

// ----------------------------------------------------------------------------
// [SessionDescription]
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp:      String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

// ----------------------------------------------------------------------------
// [Candidate] 불투명 연결 경로 기술자
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl Candidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self { candidate: candidate.into(), sdp_mid: None, sdp_mline_index: None }
    }
}

// ----------------------------------------------------------------------------
// [SessionRecord] 공유 세션 문서
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// 레코드를 생성한 참여자: 생성 후 불변
    pub initiator_id: String,
    /// 두 번째로 claim한 참여자: 1회만 세팅
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answerer_id:  Option<String>,
    /// 레코드 세대 식별용 nonce: 이전 통화 잔재 판별 + compare-and-delete
    pub nonce:        String,
    pub created_at:   u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer:        Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer:       Option<SessionDescription>,
}

impl SessionRecord {
    pub fn new(initiator_id: &str) -> Self {
        Self {
            initiator_id: initiator_id.to_string(),
            answerer_id:  None,
            nonce:        random_token(config::SESSION_NONCE_LEN),
            created_at:   current_timestamp(),
            offer:        None,
            answer:       None,
        }
    }

    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }

    /// identity 가 이 세션에서 맡은 역할 (참여자가 아니면 None)
    pub fn role_of(&self, identity: &str) -> Option<Role> {
        if self.initiator_id == identity {
            Some(Role::Offerer)
        } else if self.answerer_id.as_deref() == Some(identity) {
            Some(Role::Answerer)
        } else {
            None
        }
    }
}

// ----------------------------------------------------------------------------
// [Claim] 원자적 claim 결과
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "record", rename_all = "lowercase")]
pub enum Claim {
    /// 레코드가 없어서 새로 만들었음 (호출자 = initiator)
    Created(SessionRecord),
    /// 기존 레코드의 answerer 자리를 차지했음 (또는 이미 본인)
    Joined(SessionRecord),
    /// 두 자리 모두 다른 참여자 몫 (또는 본인이 만든 레코드)
    Occupied(SessionRecord),
}

impl Claim {
    pub fn record(&self) -> &SessionRecord {
        match self {
            Claim::Created(r) | Claim::Joined(r) | Claim::Occupied(r) => r,
        }
    }
}
