#![forbid(unsafe_code)]

// roomcast - SFU signaling and orchestration core

pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;
