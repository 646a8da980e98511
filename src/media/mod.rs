#![forbid(unsafe_code)]

// Media module - mediasoup worker pool, configuration and shared types

pub mod config;
pub mod types;
pub mod worker_pool;

pub use config::{MediaConfig, RouterConfig, WebRtcTransportConfig, WorkerConfig};
pub use types::{MediaError, MediaResult};
pub use worker_pool::WorkerPool;
