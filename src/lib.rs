#![forbid(unsafe_code)]

// mediaroom library - room/peer signaling server for an SFU media engine

pub mod config;
pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;
