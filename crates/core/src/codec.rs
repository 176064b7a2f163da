//! H.264 codec negotiation.
//!
//! A live HLS source carries no out-of-band codec description, so the
//! parameter sets needed for the SDP `sprop-parameter-sets` attribute are
//! taken from the bitstream itself: the first access unit that contains both
//! an SPS (NAL type 7) and a PPS (NAL type 8) yields a [`CodecDescriptor`].

/// Dynamic RTP payload type used for the published H.264 track (RFC 3551 §6).
pub const H264_PAYLOAD_TYPE: u8 = 96;

/// Non-interleaved mode (RFC 6184 §6.3): single NAL, STAP-A and FU-A packets.
pub const PACKETIZATION_MODE: u8 = 1;

/// RTP clock rate for H.264 (RFC 6184 §8.2.1).
pub const H264_CLOCK_RATE: u32 = 90_000;

const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;

/// Immutable description of a negotiated H.264 track.
///
/// Built once per connection and replaced, never mutated, on reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecDescriptor {
    /// RTP payload type (always [`H264_PAYLOAD_TYPE`]).
    pub payload_type: u8,
    /// RFC 6184 packetization mode (always [`PACKETIZATION_MODE`]).
    pub packetization_mode: u8,
    /// Sequence parameter set NAL unit, including its header byte.
    pub sps: Vec<u8>,
    /// Picture parameter set NAL unit, including its header byte.
    pub pps: Vec<u8>,
}

impl CodecDescriptor {
    pub fn new(sps: Vec<u8>, pps: Vec<u8>) -> Self {
        Self {
            payload_type: H264_PAYLOAD_TYPE,
            packetization_mode: PACKETIZATION_MODE,
            sps,
            pps,
        }
    }

    /// `profile-level-id` (RFC 6184 §8.1): SPS bytes 1–3 as hex.
    pub fn profile_level_id(&self) -> Option<String> {
        match self.sps.get(1..4) {
            Some([profile, constraints, level]) => Some(format!(
                "{:02x}{:02x}{:02x}",
                profile, constraints, level
            )),
            _ => None,
        }
    }
}

/// NAL unit type: the low 5 bits of the header byte.
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|header| header & 0x1f)
}

/// Copy out the first SPS and first PPS found in an access unit.
///
/// Either side is `None` when the access unit does not carry it.
pub fn extract_parameter_sets<T: AsRef<[u8]>>(au: &[T]) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
    let mut sps = None;
    let mut pps = None;

    for nal in au.iter().map(AsRef::as_ref) {
        match nal_type(nal) {
            Some(NAL_TYPE_SPS) if sps.is_none() => sps = Some(nal.to_vec()),
            Some(NAL_TYPE_PPS) if pps.is_none() => pps = Some(nal.to_vec()),
            _ => {}
        }
        if sps.is_some() && pps.is_some() {
            break;
        }
    }

    (sps, pps)
}

/// Build a descriptor from an access unit, or `None` if it lacks SPS or PPS.
///
/// `None` is not an error: encoders repeat parameter sets periodically, so the
/// caller keeps waiting for a later access unit.
pub fn negotiate<T: AsRef<[u8]>>(au: &[T]) -> Option<CodecDescriptor> {
    match extract_parameter_sets(au) {
        (Some(sps), Some(pps)) => Some(CodecDescriptor::new(sps, pps)),
        _ => None,
    }
}
