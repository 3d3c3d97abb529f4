#![forbid(unsafe_code)]

// Media module - engine adapter, worker pool and shared media types

pub mod config;
pub mod engine;
pub mod types;
pub mod worker_manager;

#[cfg(feature = "mediasoup")]
pub mod mediasoup_engine;

#[cfg(test)]
pub mod fake;

pub use config::{MediaConfig, TransportConfig, WorkerConfig};
pub use engine::{MediaEngine, Subscription};
pub use types::{
    ConsumerInfo, Direction, ErrorKind, MediaError, MediaKind, MediaResult, ProducerSummary,
    TransportInfo,
};
pub use worker_manager::{FatalHandler, WorkerDeath, WorkerPool};

#[cfg(feature = "mediasoup")]
pub use mediasoup_engine::MediasoupEngine;
