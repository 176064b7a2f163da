//! Media codecs and RTP packetization.
//!
//! This module provides the [`Packetizer`] trait and the H.264 implementation
//! that converts demuxed access units into RTP packets.
//!
//! ## RTP overview (RFC 3550)
//!
//! Each access unit is split into one or more RTP packets. Every RTP packet
//! carries a 12-byte fixed header ([`rtp::RtpHeader`]) containing:
//!
//! - **Sequence number** (16-bit, wrapping): for reordering and loss detection.
//! - **Timestamp** (32-bit): the source presentation timestamp at 90 kHz.
//! - **SSRC** (32-bit): randomly chosen to identify the sender.
//! - **Marker bit**: set on the last packet of an access unit (frame).
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC |
//! |-------|--------|-----|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |

pub mod h264;
pub mod rtp;

use crate::error::Result;

/// Codec-specific RTP packetizer.
///
/// Implementations carry state across calls (sequence numbers), so a single
/// instance must never be driven from two threads at once.
pub trait Packetizer: Send {
    /// Packetize one access unit (a list of NAL units without start codes).
    ///
    /// Each returned `Vec<u8>` is a complete RTP packet stamped with
    /// `timestamp`. Returns an error when the access unit cannot be encoded;
    /// the caller drops that unit and carries on.
    fn packetize(&mut self, access_unit: &[Vec<u8>], timestamp: u32) -> Result<Vec<Vec<u8>>>;

    /// Codec name for the SDP `a=rtpmap` attribute (e.g. `"H264"`).
    fn codec_name(&self) -> &'static str;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32;

    /// RTP payload type number (RFC 3551).
    fn payload_type(&self) -> u8;
}
