#![forbid(unsafe_code)]

// Configuration for media workers and WebRTC transports

use std::net::{IpAddr, Ipv4Addr};

/// Main media configuration
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub transport_config: TransportConfig,
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub num_workers: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            rtc_min_port: 10000,
            rtc_max_port: 10100,
        }
    }
}

/// WebRTC transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub listen_ip: IpAddr,
    pub announced_ip: Option<IpAddr>,
    pub initial_available_outgoing_bitrate: u32,
    /// Applied after creation; failure to apply is logged, not fatal
    pub max_incoming_bitrate: Option<u32>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            initial_available_outgoing_bitrate: 1_000_000,
            max_incoming_bitrate: Some(1_500_000),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}
