//! SDP glue between parameter-based signaling and webrtc-rs
//!
//! The relay server speaks in ICE/DTLS/RTP parameter objects while webrtc-rs
//! only understands session descriptions. The local side always offers; the
//! server's side of the exchange is synthesized here as an answer.

use huddle_protocol::{
    DtlsFingerprint, DtlsRole, IceCandidate, MediaKind, RtcpFeedback, RtpCodecParameters,
    TransportParams,
};
use serde_json::{Map, Value};
use std::fmt::Write;

use crate::error::{MediaError, Result};

pub const MID_EXTENSION_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";

/// One audio/video m-section of a local offer
#[derive(Debug, Clone, PartialEq)]
pub struct LocalSection {
    pub kind: MediaKind,
    pub mid: String,
    pub codecs: Vec<RtpCodecParameters>,
    pub ssrc: Option<u32>,
    pub cname: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }
}

/// Stream announced by the server inside an answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSsrc {
    pub ssrc: u32,
    pub cname: String,
    pub stream_id: String,
    pub track_id: String,
}

/// Server side of one m-section
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerSection {
    pub kind: MediaKind,
    pub mid: String,
    pub direction: Direction,
    pub codecs: Vec<RtpCodecParameters>,
    pub mid_extension_id: Option<u16>,
    pub ssrcs: Vec<RemoteSsrc>,
}

impl AnswerSection {
    /// Mirror a local section with the given direction and the local codecs
    pub fn mirror(section: &LocalSection, direction: Direction) -> Self {
        Self {
            kind: section.kind,
            mid: section.mid.clone(),
            direction,
            codecs: section.codecs.clone(),
            mid_extension_id: None,
            ssrcs: Vec::new(),
        }
    }
}

/// Collect the distinct fingerprints of a session description
pub fn extract_fingerprints(sdp: &str) -> Result<Vec<DtlsFingerprint>> {
    let mut fingerprints: Vec<DtlsFingerprint> = Vec::new();
    for line in sdp.lines() {
        let Some(rest) = line.trim().strip_prefix("a=fingerprint:") else {
            continue;
        };
        let Some((algorithm, value)) = rest.split_once(' ') else {
            continue;
        };
        let fingerprint = DtlsFingerprint {
            algorithm: algorithm.to_ascii_lowercase(),
            value: value.trim().to_string(),
        };
        if !fingerprints.contains(&fingerprint) {
            fingerprints.push(fingerprint);
        }
    }

    if fingerprints.is_empty() {
        return Err(MediaError::Sdp("no fingerprint found".to_string()));
    }
    Ok(fingerprints)
}

/// Parse the audio and video m-sections of a local description
pub fn parse_local_sections(sdp: &str) -> Vec<LocalSection> {
    let mut sections: Vec<LocalSection> = Vec::new();
    let mut in_media = false;

    for line in sdp.lines().map(str::trim) {
        if let Some(media) = line.strip_prefix("m=") {
            let kind = match media.split_whitespace().next() {
                Some("audio") => Some(MediaKind::Audio),
                Some("video") => Some(MediaKind::Video),
                _ => None,
            };
            in_media = kind.is_some();
            if let Some(kind) = kind {
                sections.push(LocalSection {
                    kind,
                    mid: String::new(),
                    codecs: Vec::new(),
                    ssrc: None,
                    cname: None,
                });
            }
            continue;
        }

        if !in_media {
            continue;
        }
        let Some(section) = sections.last_mut() else {
            continue;
        };

        if let Some(mid) = line.strip_prefix("a=mid:") {
            section.mid = mid.to_string();
        } else if let Some(rtpmap) = line.strip_prefix("a=rtpmap:") {
            if let Some(codec) = parse_rtpmap(section.kind, rtpmap) {
                section.codecs.push(codec);
            }
        } else if let Some(fmtp) = line.strip_prefix("a=fmtp:") {
            if let Some((pt, params)) = split_payload_attribute(fmtp) {
                if let Some(codec) = section.codecs.iter_mut().find(|c| c.payload_type == pt) {
                    codec.parameters = parse_fmtp(params);
                }
            }
        } else if let Some(feedback) = line.strip_prefix("a=rtcp-fb:") {
            if let Some((pt, value)) = split_payload_attribute(feedback) {
                if let Some(codec) = section.codecs.iter_mut().find(|c| c.payload_type == pt) {
                    let (kind, parameter) = value.split_once(' ').unwrap_or((value, ""));
                    codec.rtcp_feedback.push(RtcpFeedback {
                        kind: kind.to_string(),
                        parameter: parameter.to_string(),
                    });
                }
            }
        } else if let Some(ssrc_line) = line.strip_prefix("a=ssrc:") {
            let mut parts = ssrc_line.splitn(2, ' ');
            let ssrc = parts.next().and_then(|s| s.parse::<u32>().ok());
            let attribute = parts.next().unwrap_or_default();
            if section.ssrc.is_none() {
                section.ssrc = ssrc;
            }
            if section.ssrc == ssrc && section.cname.is_none() {
                if let Some(cname) = attribute.strip_prefix("cname:") {
                    section.cname = Some(cname.to_string());
                }
            }
        }
    }

    sections
}

fn split_payload_attribute(value: &str) -> Option<(u8, &str)> {
    let (pt, rest) = value.split_once(' ')?;
    Some((pt.parse().ok()?, rest.trim()))
}

fn parse_rtpmap(kind: MediaKind, rtpmap: &str) -> Option<RtpCodecParameters> {
    let (pt, encoding) = split_payload_attribute(rtpmap)?;
    let mut parts = encoding.split('/');
    let name = parts.next()?;
    let clock_rate = parts.next()?.parse().ok()?;
    let channels = parts.next().and_then(|c| c.parse().ok());

    Some(RtpCodecParameters {
        mime_type: format!("{}/{}", kind, name),
        payload_type: pt,
        clock_rate,
        channels,
        parameters: Map::new(),
        rtcp_feedback: Vec::new(),
    })
}

/// `key=value;key=value` into a parameter map. Numeric values become numbers.
pub fn parse_fmtp(line: &str) -> Map<String, Value> {
    line.split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .map(|(key, value)| {
            let value = value
                .parse::<u64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::from(value));
            (key.to_string(), value)
        })
        .collect()
}

/// Parameter map back into an fmtp line
pub fn fmtp_line(parameters: &Map<String, Value>) -> String {
    parameters
        .iter()
        .map(|(key, value)| match value {
            Value::String(text) => format!("{}={}", key, text),
            other => format!("{}={}", key, other),
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// ICE candidate in SDP attribute form, without the `a=` prefix
pub fn candidate_line(candidate: &IceCandidate) -> String {
    let mut line = format!(
        "candidate:{} 1 {} {} {} {} typ {}",
        candidate.foundation,
        candidate.protocol,
        candidate.priority,
        candidate.ip,
        candidate.port,
        candidate.candidate_type,
    );
    if let Some(tcp_type) = &candidate.tcp_type {
        line.push_str(" tcptype ");
        line.push_str(tcp_type);
    }
    line
}

/// Synthesize the server's answer for a local offer
pub fn build_remote_answer(params: &TransportParams, sections: &[AnswerSection]) -> Result<String> {
    // webrtc-rs only verifies SHA-256 fingerprints
    let fingerprint = params
        .dtls_parameters
        .fingerprints
        .iter()
        .find(|fp| fp.algorithm.eq_ignore_ascii_case("sha-256"))
        .ok_or_else(|| MediaError::Sdp("no sha-256 fingerprint from server".to_string()))?;

    let setup = match params.dtls_parameters.role {
        DtlsRole::Client => "active",
        DtlsRole::Server | DtlsRole::Auto => "passive",
    };

    let mids: Vec<&str> = sections.iter().map(|s| s.mid.as_str()).collect();

    let mut sdp = String::new();
    sdp.push_str("v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n");
    if params.ice_parameters.ice_lite {
        sdp.push_str("a=ice-lite\r\n");
    }
    let _ = write!(sdp, "a=group:BUNDLE {}\r\n", mids.join(" "));
    let _ = write!(
        sdp,
        "a=ice-ufrag:{}\r\na=ice-pwd:{}\r\n",
        params.ice_parameters.username_fragment, params.ice_parameters.password
    );

    for section in sections {
        if section.codecs.is_empty() {
            return Err(MediaError::Sdp(format!(
                "section {} has no codecs",
                section.mid
            )));
        }

        let payloads: Vec<String> = section
            .codecs
            .iter()
            .map(|c| c.payload_type.to_string())
            .collect();

        let _ = write!(
            sdp,
            "m={} 9 UDP/TLS/RTP/SAVPF {}\r\n\
             c=IN IP4 0.0.0.0\r\n\
             a=rtcp:9 IN IP4 0.0.0.0\r\n\
             a=rtcp-mux\r\n\
             a=mid:{}\r\n\
             a={}\r\n\
             a=fingerprint:{} {}\r\n\
             a=setup:{}\r\n",
            section.kind,
            payloads.join(" "),
            section.mid,
            section.direction.as_str(),
            fingerprint.algorithm,
            fingerprint.value,
            setup,
        );

        if let Some(id) = section.mid_extension_id {
            let _ = write!(sdp, "a=extmap:{} {}\r\n", id, MID_EXTENSION_URI);
        }

        for codec in &section.codecs {
            let name = codec
                .mime_type
                .split_once('/')
                .map(|(_, name)| name)
                .unwrap_or(codec.mime_type.as_str());
            let _ = write!(sdp, "a=rtpmap:{} {}/{}", codec.payload_type, name, codec.clock_rate);
            if let Some(channels) = codec.channels.filter(|c| *c > 1) {
                let _ = write!(sdp, "/{}", channels);
            }
            sdp.push_str("\r\n");

            if !codec.parameters.is_empty() {
                let _ = write!(
                    sdp,
                    "a=fmtp:{} {}\r\n",
                    codec.payload_type,
                    fmtp_line(&codec.parameters)
                );
            }
            for feedback in &codec.rtcp_feedback {
                let _ = write!(sdp, "a=rtcp-fb:{} {}", codec.payload_type, feedback.kind);
                if !feedback.parameter.is_empty() {
                    let _ = write!(sdp, " {}", feedback.parameter);
                }
                sdp.push_str("\r\n");
            }
        }

        for ssrc in &section.ssrcs {
            let _ = write!(
                sdp,
                "a=ssrc:{} cname:{}\r\na=ssrc:{} msid:{} {}\r\n",
                ssrc.ssrc, ssrc.cname, ssrc.ssrc, ssrc.stream_id, ssrc.track_id
            );
        }
    }

    Ok(sdp)
}

/// Header extension id the server assigned to the mid extension, if any
pub fn mid_extension_id(header_extensions: &[Value]) -> Option<u16> {
    header_extensions.iter().find_map(|extension| {
        if extension.get("uri")?.as_str()? != MID_EXTENSION_URI {
            return None;
        }
        extension.get("id")?.as_u64().and_then(|id| u16::try_from(id).ok())
    })
}
