#![forbid(unsafe_code)]

// Configuration for mediasoup workers, routers, and transports

use mediasoup::prelude::*;
use mediasoup::worker::{WorkerDtlsFiles, WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Top-level media configuration: worker pool, router codecs, transports.
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker: WorkerConfig,
    pub router: RouterConfig,
    pub webrtc_transport: WebRtcTransportConfig,
}

impl MediaConfig {
    /// Loads configuration from the environment on top of code defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = env_parse::<usize>("WORKER_POOL_SIZE") {
            if size > 0 {
                config.worker.pool_size = size;
            }
        }
        if let Some(port) = env_parse::<u16>("RTC_MIN_PORT") {
            config.worker.rtc_min_port = port;
        }
        if let Some(port) = env_parse::<u16>("RTC_MAX_PORT") {
            config.worker.rtc_max_port = port;
        }
        config.worker.dtls_certificate_file = std::env::var("DTLS_CERT_FILE").ok();
        config.worker.dtls_private_key_file = std::env::var("DTLS_PRIVATE_KEY_FILE").ok();

        if let Some(ip) = env_parse::<IpAddr>("ANNOUNCE_IP") {
            config.webrtc_transport = config.webrtc_transport.with_announced_ip(ip);
        }
        if let Some(bitrate) = env_parse::<u32>("MAX_INCOMING_BITRATE") {
            config.webrtc_transport.max_incoming_bitrate = Some(bitrate);
        }

        config
    }
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub dtls_certificate_file: Option<String>,
    pub dtls_private_key_file: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: num_cpus::get(),
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
                WorkerLogTag::Rtcp,
            ],
            rtc_min_port: 10000,
            rtc_max_port: 59999,
            dtls_certificate_file: None,
            dtls_private_key_file: None,
        }
    }
}

impl WorkerConfig {
    /// Converts to mediasoup WorkerSettings
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();

        settings.log_level = self.log_level;
        settings.log_tags = self.log_tags.clone();
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;

        if let (Some(cert), Some(key)) = (&self.dtls_certificate_file, &self.dtls_private_key_file) {
            settings.dtls_files = Some(WorkerDtlsFiles {
                certificate: cert.clone().into(),
                private_key: key.clone().into(),
            });
        }

        settings
    }
}

/// Router configuration with codec capabilities
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    /// Returns default codec capabilities for audio, camera video and screen video
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: Some(111),
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::from([
                    ("minptime", 10_u32.into()),
                    ("useinbandfec", 1_u32.into()),
                ]),
                rtcp_feedback: vec![RtcpFeedback::TransportCc],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: Some(96),
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![
                    RtcpFeedback::Nack,
                    RtcpFeedback::NackPli,
                    RtcpFeedback::CcmFir,
                    RtcpFeedback::GoogRemb,
                    RtcpFeedback::TransportCc,
                ],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp9,
                preferred_payload_type: Some(98),
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![
                    RtcpFeedback::Nack,
                    RtcpFeedback::NackPli,
                    RtcpFeedback::CcmFir,
                    RtcpFeedback::GoogRemb,
                    RtcpFeedback::TransportCc,
                ],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::H264,
                preferred_payload_type: Some(102),
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::from([
                    ("level-asymmetry-allowed", 1_u32.into()),
                    ("packetization-mode", 1_u32.into()),
                    ("profile-level-id", "42e01f".into()),
                ]),
                rtcp_feedback: vec![
                    RtcpFeedback::Nack,
                    RtcpFeedback::NackPli,
                    RtcpFeedback::CcmFir,
                    RtcpFeedback::GoogRemb,
                    RtcpFeedback::TransportCc,
                ],
            },
        ]
    }

    /// Converts to RouterOptions for mediasoup
    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(self.media_codecs.clone())
    }
}

/// WebRTC transport configuration and bitrate governance knobs.
///
/// `factor_incoming_bitrate` spreads the outgoing budget across producers:
/// the room applies `max / ((producers - 1) * factor)` clamped to
/// `[minimum, maximum]`, with small rooms (fewer than three producers) kept
/// at the maximum.
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub listen_ips: Vec<ListenInfo>,
    pub initial_available_outgoing_bitrate: u32,
    pub minimum_available_outgoing_bitrate: u32,
    pub maximum_available_outgoing_bitrate: u32,
    pub factor_incoming_bitrate: f64,
    pub max_sctp_message_size: u32,
    pub max_incoming_bitrate: Option<u32>,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ips: vec![ListenInfo {
                protocol: Protocol::Udp,
                ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
                announced_address: None,
                port: None,
                port_range: None,
                flags: None,
                send_buffer_size: None,
                recv_buffer_size: None,
                expose_internal_ip: false,
            }],
            initial_available_outgoing_bitrate: 600_000,
            minimum_available_outgoing_bitrate: 100_000,
            maximum_available_outgoing_bitrate: 3_000_000,
            factor_incoming_bitrate: 0.75,
            max_sctp_message_size: 262_144,
            max_incoming_bitrate: None,
        }
    }
}

impl WebRtcTransportConfig {
    /// Sets the announced address clients will receive in ICE candidates
    pub fn with_announced_ip(mut self, ip: IpAddr) -> Self {
        if let Some(listen_ip) = self.listen_ips.first_mut() {
            listen_ip.announced_address = Some(ip.to_string());
        }
        self
    }

    /// Converts to WebRtcTransportOptions. UDP and TCP are both enabled with
    /// UDP preferred; SCTP is on for data channels.
    pub fn to_transport_options(&self) -> WebRtcTransportOptions {
        let mut listen_infos = None::<WebRtcTransportListenInfos>;
        for info in &self.listen_ips {
            listen_infos = Some(match listen_infos {
                Some(infos) => infos.insert(info.clone()),
                None => WebRtcTransportListenInfos::new(info.clone()),
            });
        }
        let listen_infos = listen_infos.unwrap_or_else(|| {
            WebRtcTransportListenInfos::new(ListenInfo {
                protocol: Protocol::Udp,
                ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
                announced_address: None,
                port: None,
                port_range: None,
                flags: None,
                send_buffer_size: None,
                recv_buffer_size: None,
                expose_internal_ip: false,
            })
        });

        let mut options = WebRtcTransportOptions::new(listen_infos);
        options.enable_udp = true;
        options.enable_tcp = true;
        options.prefer_udp = true;
        options.enable_sctp = true;
        options.max_sctp_message_size = self.max_sctp_message_size;
        options.initial_available_outgoing_bitrate = self.initial_available_outgoing_bitrate;
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_codecs_cover_audio_and_video() {
        let codecs = RouterConfig::default_codecs();
        assert!(codecs.iter().any(|c| matches!(c, RtpCodecCapability::Audio { .. })));
        assert!(codecs.iter().any(|c| matches!(c, RtpCodecCapability::Video { .. })));
    }

    #[test]
    fn announced_ip_lands_on_first_listen_info() {
        let config = WebRtcTransportConfig::default()
            .with_announced_ip("203.0.113.7".parse().unwrap());
        assert_eq!(
            config.listen_ips[0].announced_address.as_deref(),
            Some("203.0.113.7")
        );
    }
}
