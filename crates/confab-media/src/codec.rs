//! Router codec list
//!
//! The codecs are registered the way a webrtc `MediaEngine` registers them and
//! then translated into protocol capabilities handed to every router.

use confab_protocol::{MediaKind, RtpCapabilities, RtpCodecCapability, RtpCodecParameters};
use serde_json::{Map, Value};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

/// Opus sample rate (48kHz)
pub const OPUS_CLOCK_RATE: u32 = 48000;

/// Opus channels (stereo)
pub const OPUS_CHANNELS: u16 = 2;

/// Video RTP clock rate
pub const VIDEO_CLOCK_RATE: u32 = 90000;

fn registered_codecs() -> Vec<(RTPCodecType, RTCRtpCodecParameters)> {
    vec![
        (
            RTPCodecType::Audio,
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: OPUS_CLOCK_RATE,
                    channels: OPUS_CHANNELS,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
        ),
        (
            RTPCodecType::Video,
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: VIDEO_CLOCK_RATE,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                payload_type: 96,
                ..Default::default()
            },
        ),
        (
            RTPCodecType::Video,
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: VIDEO_CLOCK_RATE,
                    channels: 0,
                    // Baseline profile, level 3.1 (720p30), non-interleaved packetization
                    sdp_fmtp_line:
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                            .to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 102,
                ..Default::default()
            },
        ),
    ]
}

/// The process-wide codec list every router is created with
pub fn router_codecs() -> Vec<RtpCodecCapability> {
    registered_codecs()
        .iter()
        .filter_map(|(kind, params)| to_capability(*kind, params))
        .collect()
}

/// Translate a webrtc codec registration into a protocol capability
pub fn to_capability(kind: RTPCodecType, params: &RTCRtpCodecParameters) -> Option<RtpCodecCapability> {
    let kind = match kind {
        RTPCodecType::Audio => MediaKind::Audio,
        RTPCodecType::Video => MediaKind::Video,
        _ => return None,
    };

    let capability = &params.capability;
    Some(RtpCodecCapability {
        kind,
        mime_type: capability.mime_type.clone(),
        preferred_payload_type: Some(params.payload_type),
        clock_rate: capability.clock_rate,
        channels: (capability.channels > 0).then_some(capability.channels),
        parameters: parse_fmtp(&capability.sdp_fmtp_line),
    })
}

/// Parse an SDP fmtp line (`a=1;b=x`) into a parameter map. Numeric values stay numbers.
pub fn parse_fmtp(line: &str) -> Map<String, Value> {
    line.split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            let value = value.trim();
            let value = value
                .parse::<u64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::from(value));
            Some((key.to_string(), value))
        })
        .collect()
}

/// MIME types compare case-insensitively (`video/VP8` == `video/vp8`)
pub fn mime_matches(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Whether a negotiated codec is covered by a capability set
pub fn supports(capabilities: &[RtpCodecCapability], codec: &RtpCodecParameters) -> bool {
    capabilities.iter().any(|cap| {
        mime_matches(&cap.mime_type, &codec.mime_type) && cap.clock_rate == codec.clock_rate
    })
}

/// Router capabilities as advertised to clients
pub fn capabilities_of(codecs: &[RtpCodecCapability]) -> RtpCapabilities {
    RtpCapabilities {
        codecs: codecs.to_vec(),
    }
}
