//! OCPP 1.6 protocol layer
//!
//! - `frame`: OCPP-J CALL/CALLRESULT/CALLERROR framing
//! - `types`: message payload types

pub mod frame;
pub mod types;

pub use frame::{Action, Call, CallError, CallResult, ErrorCode, OcppError, OcppMessage};
pub use types::*;
