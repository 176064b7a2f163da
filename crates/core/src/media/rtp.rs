/// RTP fixed header writer (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Owns the per-stream sequence counter and SSRC. The timestamp is not
/// generated here: it comes from the source presentation timestamp of each
/// access unit, so every call to [`write`](Self::write) takes it explicitly.
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
}

/// Size of the fixed header in bytes.
pub const RTP_HEADER_LEN: usize = 12;

impl RtpHeader {
    /// Create header state with explicit SSRC and initial sequence number.
    pub fn new(pt: u8, ssrc: u32, initial_sequence: u16) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            initial_sequence,
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            sequence: initial_sequence,
        }
    }

    /// Create with a random SSRC and random initial sequence number
    /// (RFC 3550 §5.1, §8.1).
    pub fn with_random_ssrc(pt: u8) -> Self {
        Self::new(pt, rand::random::<u32>(), rand::random::<u16>())
    }

    /// Sequence number the next [`write`](Self::write) call will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Serialize a 12-byte RTP fixed header and advance the sequence number.
    ///
    /// The `marker` bit signals the last packet of an access unit
    /// (RFC 6184 §5.1).
    pub fn write(&mut self, marker: bool, timestamp: u32) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = 2 << 6;
        header[1] = ((marker as u8) << 7) | (self.pt & 0x7f);
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }
}

/// Read `(sequence, timestamp)` back out of a serialized RTP packet.
pub fn parse_sequence_and_timestamp(packet: &[u8]) -> Option<(u16, u32)> {
    let seq = packet.get(2..4)?;
    let ts = packet.get(4..8)?;
    Some((
        u16::from_be_bytes([seq[0], seq[1]]),
        u32::from_be_bytes([ts[0], ts[1], ts[2], ts[3]]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header() -> RtpHeader {
        RtpHeader::new(96, 0xAABBCCDD, 0)
    }

    #[test]
    fn version_is_2() {
        let mut h = make_header();
        let buf = h.write(false, 0);
        assert_eq!(buf[0] >> 6, 2);
    }

    #[test]
    fn marker_bit() {
        let mut h = make_header();
        let no_marker = h.write(false, 0);
        assert_eq!(no_marker[1] & 0x80, 0);

        let with_marker = h.write(true, 0);
        assert_eq!(with_marker[1] & 0x80, 0x80);
    }

    #[test]
    fn payload_type() {
        let mut h = make_header();
        let buf = h.write(false, 0);
        assert_eq!(buf[1] & 0x7f, 96);
    }

    #[test]
    fn sequence_wraps() {
        let mut h = RtpHeader::new(96, 1, u16::MAX);
        let buf = h.write(false, 0);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), u16::MAX);
        assert_eq!(h.sequence(), 0);
    }

    #[test]
    fn timestamp_and_ssrc_written() {
        let mut h = make_header();
        let buf = h.write(false, 180_000);
        assert_eq!(parse_sequence_and_timestamp(&buf), Some((0, 180_000)));
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        assert_eq!(ssrc, 0xAABBCCDD);
    }

    #[test]
    fn parse_rejects_short_packet() {
        assert!(parse_sequence_and_timestamp(&[0x80, 96, 0]).is_none());
    }
}
