// author: kodeholic (powered by Claude)
// 매직 넘버를 배제하고 시스템 전체의 성능과 한계를 제어하는 상수 모음입니다.

/// 웹소켓 시그널링 릴레이 서버 TCP 포트 (WS/HTTP 공용)
pub const SIGNALING_PORT: u16 = 8080;

/// 연결당 송신(Egress) 큐 사이즈: watch 이벤트 폭주 시 backpressure
pub const EGRESS_QUEUE_SIZE: usize = 2048;

/// 클라이언트가 HEARTBEAT를 보내야 하는 주기 (밀리초)
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// IDENTIFY 토큰 검증용 Secret Key
/// 운영 환경에서는 환경변수 TELEVISIT_SECRET 으로 오버라이드 할 것
pub const DEFAULT_SECRET_KEY: &str = "changeme-secret";

/// 시크릿 오버라이드 환경변수 이름
pub const SECRET_ENV: &str = "TELEVISIT_SECRET";

/// WsChannel 요청 → ACK 대기 한도 (밀리초)
pub const SIGNALING_REQUEST_TIMEOUT_MS: u64 = 10_000;

// ----------------------------------------------------------------------------
// 세션 수명
// ----------------------------------------------------------------------------

/// 오래된 세션 reaper 실행 주기 (60초)
pub const REAPER_INTERVAL_MS: u64 = 60_000;

/// 세션 레코드 최대 보존 시간: 권한 측이 정리하지 못한 세션의 안전망 (4시간)
pub const SESSION_TTL_MS: u64 = 4 * 60 * 60 * 1000;

// ----------------------------------------------------------------------------
// 역할 협상 (Role Negotiator)
// ----------------------------------------------------------------------------

/// claim 재시도 최대 횟수: 초과 시 RoleConflict
pub const NEGOTIATION_MAX_ATTEMPTS: u32 = 5;

/// Occupied 응답 후 재시도 전 대기 (밀리초)
pub const NEGOTIATION_RETRY_BACKOFF_MS: u64 = 200;

/// 세션 nonce 길이
pub const SESSION_NONCE_LEN: usize = 16;

// ----------------------------------------------------------------------------
// 트레이스
// ----------------------------------------------------------------------------

/// 브로드캐스트 채널 버퍼 크기
/// 구독자가 느릴 때 최대 보유 이벤트 수: 초과 시 오래된 이벤트 drop
pub const TRACE_BUF: usize = 512;
