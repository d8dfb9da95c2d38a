// author: kodeholic (powered by Claude)

/// Client → Server opcodes
pub mod client {
    /// 클라이언트가 살아있음을 알림
    pub const HEARTBEAT:        u8 = 1;
    /// 연결 직후 인증 (user_id, token)
    pub const IDENTIFY:         u8 = 3;

    /// 원자적 세션 claim: 역할 협상
    pub const SESSION_CLAIM:    u8 = 10;
    /// 이전 세대 세션 삭제 (nonce 일치 시)
    pub const SESSION_PURGE:    u8 = 11;
    /// answerer 미참여 세션 회수 (nonce 일치 시)
    pub const SESSION_ABANDON:  u8 = 12;
    /// session-offer 발행
    pub const OFFER_PUBLISH:    u8 = 13;
    /// session-answer 발행
    pub const ANSWER_PUBLISH:   u8 = 14;
    /// connectivity-candidate 추가
    pub const CANDIDATE_APPEND: u8 = 15;
    /// 세션 일괄 삭제
    pub const SESSION_DELETE:   u8 = 16;

    /// 세션 스냅샷 구독
    pub const SESSION_WATCH:    u8 = 20;
    /// 한쪽 side candidate 구독
    pub const CANDIDATE_WATCH:  u8 = 21;
    /// 구독 해제
    pub const UNWATCH:          u8 = 22;

    pub fn name(op: u8) -> &'static str {
        match op {
            HEARTBEAT        => "HEARTBEAT",
            IDENTIFY         => "IDENTIFY",
            SESSION_CLAIM    => "SESSION_CLAIM",
            SESSION_PURGE    => "SESSION_PURGE",
            SESSION_ABANDON  => "SESSION_ABANDON",
            OFFER_PUBLISH    => "OFFER_PUBLISH",
            ANSWER_PUBLISH   => "ANSWER_PUBLISH",
            CANDIDATE_APPEND => "CANDIDATE_APPEND",
            SESSION_DELETE   => "SESSION_DELETE",
            SESSION_WATCH    => "SESSION_WATCH",
            CANDIDATE_WATCH  => "CANDIDATE_WATCH",
            UNWATCH          => "UNWATCH",
            _                => "UNKNOWN",
        }
    }
}

/// Server → Client opcodes
pub mod server {
    /// 연결 직후 서버가 heartbeat 주기를 알려줌
    pub const HELLO:           u8 = 0;
    /// HEARTBEAT 수신 확인
    pub const HEARTBEAT_ACK:   u8 = 2;
    /// IDENTIFY 성공
    pub const READY:           u8 = 4;

    /// 세션 스냅샷 push (watch_id 별)
    pub const SESSION_EVENT:   u8 = 100;
    /// candidate push (watch_id 별)
    pub const CANDIDATE_EVENT: u8 = 101;
    /// 구독 종료: 세션 삭제됨
    pub const WATCH_END:       u8 = 102;

    /// 요청 성공 응답
    pub const ACK:             u8 = 200;
    /// 에러 응답
    pub const ERROR:           u8 = 201;

    pub fn name(op: u8) -> &'static str {
        match op {
            HELLO           => "HELLO",
            HEARTBEAT_ACK   => "HEARTBEAT_ACK",
            READY           => "READY",
            SESSION_EVENT   => "SESSION_EVENT",
            CANDIDATE_EVENT => "CANDIDATE_EVENT",
            WATCH_END       => "WATCH_END",
            ACK             => "ACK",
            ERROR           => "ERROR",
            _               => "UNKNOWN",
        }
    }
}
