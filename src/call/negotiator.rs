// author: kodeholic (powered by Claude)
// Role Negotiator: 원자적 claim 으로 offerer/answerer 를 정확히 하나씩 결정
//
// 승자 결정은 저장소의 check-and-set 원자성만으로 한다 (타임스탬프 비교 없음)
// 이전 통화의 잔재 레코드는 nonce compare-and-delete 로 치우고 다시 claim

use std::time::Duration;
use tracing::{debug, info};

use crate::config;
use crate::core::{Claim, Role, SessionKey, SessionRecord};
use crate::error::{CallError, CallResult};
use crate::signaling::SignalingChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationPolicy {
    pub max_attempts:     u32,
    pub retry_backoff_ms: u64,
}

impl Default for NegotiationPolicy {
    fn default() -> Self {
        Self {
            max_attempts:     config::NEGOTIATION_MAX_ATTEMPTS,
            retry_backoff_ms: config::NEGOTIATION_RETRY_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Negotiated {
    pub role:   Role,
    pub record: SessionRecord,
}

/// 이전 통화의 잔재인가
///   - 이미 answer 까지 끝난 교환
///   - 내가 만들었던 레코드 (재접속 전 시도의 잔재)
///
/// 나이는 보지 않는다. 상대가 오래 기다리는 중일 수 있고, 방치된 레코드는 reaper 가 TTL 로 치운다
fn is_stale(record: &SessionRecord, identity: &str) -> bool {
    record.answer.is_some() || record.initiator_id == identity
}

pub async fn negotiate_role(
    channel:  &dyn SignalingChannel,
    key:      &SessionKey,
    identity: &str,
    policy:   &NegotiationPolicy,
) -> CallResult<Negotiated> {
    for attempt in 1..=policy.max_attempts {
        let claim = channel.claim_session(key, identity).await?;

        match claim {
            Claim::Created(record) => {
                info!("[negotiator] {} offerer on {} (attempt {})", identity, key, attempt);
                return Ok(Negotiated { role: Role::Offerer, record });
            }
            Claim::Joined(record) | Claim::Occupied(record)
                if is_stale(&record, identity) =>
            {
                let purged = channel.purge_stale(key, &record.nonce).await?;
                info!(
                    "[negotiator] stale record on {} (initiator={}, nonce={}) purged={}",
                    key, record.initiator_id, record.nonce, purged
                );
            }
            Claim::Joined(record) => {
                info!("[negotiator] {} answerer on {} (attempt {})", identity, key, attempt);
                return Ok(Negotiated { role: Role::Answerer, record });
            }
            Claim::Occupied(record) => {
                debug!(
                    "[negotiator] {} occupied (initiator={}, answerer={:?}) attempt {}/{}",
                    key, record.initiator_id, record.answerer_id, attempt, policy.max_attempts
                );
                if attempt < policy.max_attempts {
                    tokio::time::sleep(Duration::from_millis(policy.retry_backoff_ms)).await;
                }
            }
        }
    }

    Err(CallError::RoleConflict(format!(
        "{} still contended after {} attempts", key, policy.max_attempts
    )))
}
