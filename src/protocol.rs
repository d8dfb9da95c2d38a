// author: kodeholic (powered by Claude)

pub mod error_code;
pub mod message;
pub mod opcode;
pub mod protocol;

pub use protocol::{ws_handler, AppState};
