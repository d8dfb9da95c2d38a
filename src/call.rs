// author: kodeholic (powered by Claude)
//
// 참여자 측 통화 엔진
//
//   identity   → 누가 어느 세션에 참여할 수 있는가
//   negotiator → offerer / answerer 결정
//   machine    → Lobby → Negotiating → Connected → Terminated
//   relay      → candidate 송수신 + remote description 전 버퍼링
//   cleanup    → 종료 시 자원/공유 상태 회수 (1회)

pub mod cleanup;
pub mod identity;
pub mod machine;
pub mod negotiator;
pub mod relay;

pub use cleanup::{CleanupCoordinator, CleanupPolicy, TeardownReport};
pub use identity::{resolve, Appointment, AppointmentDirectory, Party, SessionContext, StaticDirectory};
pub use machine::{
    join_session, leave_session, CallConfig, CallDeps, CallPhase, EndReason, LocalMediaState,
    ParticipantSession,
};
pub use negotiator::{negotiate_role, Negotiated, NegotiationPolicy};
pub use relay::CandidateRelay;
