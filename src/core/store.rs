// author: kodeholic (powered by Claude)
// SessionStore: 공유 문서 저장소 (시그널링 메시지 버스로 사용)
//
// 세션당 보관:
//   record              : SessionRecord (offer/answer 단일 할당)
//   offerer_candidates  : append-only
//   answerer_candidates : append-only
//
// 변경 통지는 세션당 watch 채널 1개.
//   - 모든 커밋 후 최신 스냅샷을 send_replace → 구독자는 "최소 최신 상태" 보장
//   - 삭제 시 None 전송 후 엔트리 제거 → 구독 스트림 종료
//   - 같은 키로 재생성되면 새 watch 채널: 이전 세대 구독자는 섞이지 않음
//
// [lock 원칙] std::sync::Mutex는 동기 구간에서만 잡고 .await 를 넘기지 않음

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::{CallError, CallResult};
use crate::utils::current_timestamp;

use super::session::{Candidate, Claim, Role, SdpType, SessionDescription, SessionKey, SessionRecord};

/// 세션 1개의 전체 문서 (레코드 + 양쪽 candidate 컬렉션)
#[derive(Debug, Clone)]
pub struct SessionDoc {
    pub record:              SessionRecord,
    pub offerer_candidates:  Vec<Candidate>,
    pub answerer_candidates: Vec<Candidate>,
}

impl SessionDoc {
    fn new(record: SessionRecord) -> Self {
        Self { record, offerer_candidates: Vec::new(), answerer_candidates: Vec::new() }
    }

    pub fn candidates(&self, side: Role) -> &[Candidate] {
        match side {
            Role::Offerer  => &self.offerer_candidates,
            Role::Answerer => &self.answerer_candidates,
        }
    }

    fn candidates_mut(&mut self, side: Role) -> &mut Vec<Candidate> {
        match side {
            Role::Offerer  => &mut self.offerer_candidates,
            Role::Answerer => &mut self.answerer_candidates,
        }
    }
}

/// watch 채널로 흐르는 값: None 이면 세션 삭제됨
pub type DocSnapshot = Option<Arc<SessionDoc>>;

struct Entry {
    doc: SessionDoc,
    tx:  watch::Sender<DocSnapshot>,
}

impl Entry {
    fn new(doc: SessionDoc) -> Self {
        let (tx, _) = watch::channel(Some(Arc::new(doc.clone())));
        Self { doc, tx }
    }

    fn publish(&self) {
        self.tx.send_replace(Some(Arc::new(self.doc.clone())));
    }
}

pub struct SessionStore {
    sessions: Mutex<HashMap<SessionKey, Entry>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        trace!("Initializing SessionStore");
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    /// 원자적 read-modify-write: 역할 협상의 유일한 동기화 지점
    pub fn claim(&self, key: &SessionKey, identity: &str) -> Claim {
        let mut sessions = self.sessions.lock().unwrap();

        let entry = match sessions.get_mut(key) {
            Some(entry) => entry,
            None => {
                let record = SessionRecord::new(identity);
                sessions.insert(key.clone(), Entry::new(SessionDoc::new(record.clone())));
                debug!("[store] session created {} initiator={}", key, identity);
                return Claim::Created(record);
            }
        };

        let record = &mut entry.doc.record;
        if record.answerer_id.as_deref() == Some(identity) {
            return Claim::Joined(record.clone());
        }
        if record.answerer_id.is_none() && record.initiator_id != identity {
            record.answerer_id = Some(identity.to_string());
            let joined = record.clone();
            entry.publish();
            debug!("[store] session joined {} answerer={}", key, identity);
            return Claim::Joined(joined);
        }
        Claim::Occupied(record.clone())
    }

    pub fn get(&self, key: &SessionKey) -> Option<SessionRecord> {
        self.sessions.lock().unwrap().get(key).map(|e| e.doc.record.clone())
    }

    pub fn snapshot(&self, key: &SessionKey) -> Option<Arc<SessionDoc>> {
        self.sessions.lock().unwrap().get(key).map(|e| Arc::new(e.doc.clone()))
    }

    pub fn set_offer(&self, key: &SessionKey, desc: SessionDescription) -> CallResult<()> {
        self.set_description(key, desc, SdpType::Offer)
    }

    pub fn set_answer(&self, key: &SessionKey, desc: SessionDescription) -> CallResult<()> {
        self.set_description(key, desc, SdpType::Answer)
    }

    fn set_description(&self, key: &SessionKey, desc: SessionDescription, expected: SdpType) -> CallResult<()> {
        if desc.sdp_type != expected {
            return Err(CallError::InvalidPayload(format!(
                "expected {:?} description, got {:?}", expected, desc.sdp_type
            )));
        }

        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions.get_mut(key)
            .ok_or_else(|| CallError::SessionGone(key.to_string()))?;

        let record = &mut entry.doc.record;
        if expected == SdpType::Answer && record.offer.is_none() {
            return Err(CallError::InvalidState(format!("answer before offer on {}", key)));
        }

        let slot = match expected {
            SdpType::Offer  => &mut record.offer,
            SdpType::Answer => &mut record.answer,
        };
        match slot {
            // 같은 내용 재발행은 no-op (at-least-once 재전송 허용)
            Some(existing) if *existing == desc => return Ok(()),
            Some(_) => {
                return Err(CallError::InvalidState(format!(
                    "{:?} already published on {}", expected, key
                )));
            }
            None => *slot = Some(desc),
        }

        entry.publish();
        trace!("[store] {:?} published on {}", expected, key);
        Ok(())
    }

    pub fn append_candidate(&self, key: &SessionKey, side: Role, candidate: Candidate) -> CallResult<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions.get_mut(key)
            .ok_or_else(|| CallError::SessionGone(key.to_string()))?;
        entry.doc.candidates_mut(side).push(candidate);
        entry.publish();
        trace!("[store] candidate appended {} side={} total={}",
            key, side, entry.doc.candidates(side).len());
        Ok(())
    }

    /// 레코드 + 양쪽 컬렉션 일괄 삭제. 이미 없으면 false
    pub fn delete(&self, key: &SessionKey) -> bool {
        let removed = self.sessions.lock().unwrap().remove(key);
        match removed {
            Some(entry) => {
                entry.tx.send_replace(None);
                debug!("[store] session deleted {}", key);
                true
            }
            None => false,
        }
    }

    /// compare-and-delete: nonce 가 일치할 때만 삭제
    /// require_unjoined: answerer 가 아직 없을 때만 삭제 (한쪽만 참여한 통화 회수)
    pub fn delete_if(&self, key: &SessionKey, nonce: &str, require_unjoined: bool) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        let matches = match sessions.get(key) {
            Some(entry) => {
                entry.doc.record.nonce == nonce
                    && (!require_unjoined || entry.doc.record.answerer_id.is_none())
            }
            None => false,
        };
        if !matches {
            return false;
        }
        if let Some(entry) = sessions.remove(key) {
            entry.tx.send_replace(None);
        }
        debug!("[store] session deleted {} (nonce={}, unjoined_only={})", key, nonce, require_unjoined);
        true
    }

    /// 변경 구독: 현재 스냅샷이 초기값으로 들어있음
    pub fn subscribe(&self, key: &SessionKey) -> CallResult<watch::Receiver<DocSnapshot>> {
        self.sessions.lock().unwrap()
            .get(key)
            .map(|e| e.tx.subscribe())
            .ok_or_else(|| CallError::SessionGone(key.to_string()))
    }

    /// 전체 세션 스냅샷 + 현재 구독자 수 (admin 조회용)
    pub fn all(&self) -> Vec<(SessionKey, SessionDoc, usize)> {
        self.sessions.lock().unwrap()
            .iter()
            .map(|(k, e)| (k.clone(), e.doc.clone(), e.tx.receiver_count()))
            .collect()
    }

    /// 세션 1개 스냅샷 + 구독자 수 (admin 상세 조회용)
    pub fn inspect(&self, key: &SessionKey) -> Option<(SessionDoc, usize)> {
        self.sessions.lock().unwrap()
            .get(key)
            .map(|e| (e.doc.clone(), e.tx.receiver_count()))
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// 생성 후 ttl_ms 이상 지난 세션 목록 (reaper 용)
    pub fn find_stale(&self, ttl_ms: u64) -> Vec<SessionKey> {
        let now = current_timestamp();
        self.sessions.lock().unwrap()
            .iter()
            .filter(|(_, e)| e.doc.record.age_ms(now) >= ttl_ms)
            .map(|(k, _)| k.clone())
            .collect()
    }
}
