// author: kodeholic (powered by Claude)
// 네트워크 로직과 철저히 분리된, 순수 세션 상태 관리 모듈입니다.

pub mod session;
pub mod store;

pub use session::{Candidate, Claim, Role, SdpType, SessionDescription, SessionKey, SessionRecord};
pub use store::{DocSnapshot, SessionDoc, SessionStore};
