//! SDP (Session Description Protocol) generation (RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                              ← session name
//! c=IN IP4 <addr>                               ← connection address
//! t=0 0                                         ← timing (live stream)
//! a=tool:hls2rtsp                               ← server software
//! a=sendonly                                    ← direction
//! m=video 0 RTP/AVP 96                          ← media description
//! a=rtpmap:96 H264/90000                        ← codec/clock rate
//! a=fmtp:96 packetization-mode=1;...            ← codec parameters
//! a=control:track1                              ← track control URL
//! ```
//!
//! Origin and session fields come from [`ServerConfig`]; the media section
//! comes from the mount's negotiated [`CodecDescriptor`](crate::codec::CodecDescriptor).

use crate::media::h264;
use crate::mount::Mount;
use crate::server::ServerConfig;

/// Generate an SDP session description for the given mount.
pub fn generate_sdp(mount: &Mount, ip: &str, config: &ServerConfig) -> String {
    let descriptor = mount.descriptor();
    let mut sdp: Vec<String> = vec![
        "v=0".to_string(),
        format!(
            "o={} {} {} IN IP4 {}",
            config.sdp_username, config.sdp_session_id, config.sdp_session_version, ip
        ),
        format!("s={}", config.sdp_session_name),
        format!("c=IN IP4 {}", ip),
        "t=0 0".to_string(),
        "a=tool:hls2rtsp".to_string(),
        "a=sendonly".to_string(),
        format!("m=video 0 RTP/AVP {}", descriptor.payload_type),
    ];
    sdp.extend(h264::sdp_attributes(descriptor));

    tracing::debug!(mount = %mount.path(), "SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}
