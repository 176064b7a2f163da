use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::Packetizer;
use super::rtp::{RTP_HEADER_LEN, RtpHeader};
use crate::codec::{CodecDescriptor, H264_CLOCK_RATE};
use crate::error::{Error, Result};

/// Maximum RTP payload size in bytes.
pub const DEFAULT_MTU: usize = 1400;

const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;

/// H.264 RTP packetizer (RFC 6184, packetization mode 1).
///
/// Each access unit is encoded with three packet types:
///
/// - **Single NAL Unit** (§5.6): a NAL that fits the MTU and has no small
///   neighbour to share a packet with is sent as-is.
///
/// - **STAP-A** (§5.7.1): consecutive small NALs (typically SPS, PPS and SEI
///   ahead of an IDR slice) are aggregated into one packet:
///
///   ```text
///   STAP-A header: [F|NRI|Type=24]   (1 byte)
///   NALU 1 size:   u16 big-endian    (2 bytes)
///   NALU 1 data:   [...]
///   NALU 2 size:   ...
///   ```
///
/// - **FU-A** (§5.8): NALs exceeding the MTU are split across packets, each
///   fragment carrying a 2-byte FU indicator + FU header:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to MTU - 2 bytes)
///   ```
///
/// Every packet of an access unit carries the same RTP timestamp; the marker
/// bit is set on the last one (§5.1).
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    mtu: usize,
}

impl H264Packetizer {
    /// Create with explicit payload type, SSRC and initial sequence number.
    pub fn new(pt: u8, ssrc: u32, initial_sequence: u16) -> Self {
        Self {
            header: RtpHeader::new(pt, ssrc, initial_sequence),
            mtu: DEFAULT_MTU,
        }
    }

    /// Create a packetizer for a negotiated track, with random SSRC and
    /// initial sequence number (RFC 3550 §8.1).
    pub fn for_descriptor(descriptor: &CodecDescriptor) -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(descriptor.payload_type),
            mtu: DEFAULT_MTU,
        }
    }

    /// Override the maximum payload size.
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        // FU-A needs room for its two header bytes plus at least one data byte.
        self.mtu = mtu.max(3);
        self
    }

    /// Build the RTP payloads (without fixed header) for one access unit.
    fn payloads(&self, access_unit: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut payloads = Vec::new();
        let mut batch: Vec<&[u8]> = Vec::new();
        // STAP-A header byte plus a 2-byte size per aggregated NAL.
        let mut batch_size = 1usize;

        for nal in access_unit.iter().filter(|n| !n.is_empty()) {
            if nal.len() > self.mtu {
                self.flush_batch(&mut batch, &mut payloads);
                batch_size = 1;
                self.fragment(nal, &mut payloads);
                continue;
            }

            if !batch.is_empty() && batch_size + 2 + nal.len() > self.mtu {
                self.flush_batch(&mut batch, &mut payloads);
                batch_size = 1;
            }
            batch_size += 2 + nal.len();
            batch.push(nal);
        }
        self.flush_batch(&mut batch, &mut payloads);

        payloads
    }

    fn flush_batch(&self, batch: &mut Vec<&[u8]>, payloads: &mut Vec<Vec<u8>>) {
        match batch.as_slice() {
            [] => {}
            [single] => payloads.push(single.to_vec()),
            nals => {
                let forbidden = nals.iter().fold(0u8, |acc, n| acc | (n[0] & 0x80));
                let nri = nals.iter().map(|n| n[0] & 0x60).max().unwrap_or(0);
                let size = 1 + nals.iter().map(|n| 2 + n.len()).sum::<usize>();

                let mut payload = Vec::with_capacity(size);
                payload.push(forbidden | nri | NAL_TYPE_STAP_A);
                for nal in nals {
                    payload.extend_from_slice(&(nal.len() as u16).to_be_bytes());
                    payload.extend_from_slice(nal);
                }
                tracing::trace!(nal_count = nals.len(), size, "STAP-A aggregated NAL units");
                payloads.push(payload);
            }
        }
        batch.clear();
    }

    fn fragment(&self, nal: &[u8], payloads: &mut Vec<Vec<u8>>) {
        let nal_header = nal[0];
        let nal_type = nal_header & 0x1f;
        let fu_indicator = (nal_header & 0xe0) | NAL_TYPE_FU_A;
        let max_fragment = self.mtu - 2;

        let body = &nal[1..];
        let count = body.len().div_ceil(max_fragment);
        for (i, chunk) in body.chunks(max_fragment).enumerate() {
            let start_bit = if i == 0 { 0x80 } else { 0x00 };
            let end_bit = if i + 1 == count { 0x40 } else { 0x00 };

            let mut payload = Vec::with_capacity(2 + chunk.len());
            payload.push(fu_indicator);
            payload.push(start_bit | end_bit | nal_type);
            payload.extend_from_slice(chunk);
            payloads.push(payload);
        }

        tracing::trace!(
            nal_type,
            nal_size = nal.len(),
            fragments = count,
            "FU-A fragmented NAL unit"
        );
    }

    /// Extract NAL units from an H.264 Annex B bitstream.
    ///
    /// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte
    /// `00 00 01`) and returns the NAL data between them, excluding
    /// the start codes themselves.
    ///
    /// The start code length is tracked per-NAL to ensure boundaries
    /// between adjacent NALs are computed correctly when mixed 3-byte
    /// and 4-byte start codes appear.
    pub fn extract_nal_units(data: &[u8]) -> Vec<Vec<u8>> {
        let mut nal_units = Vec::new();
        let mut i = 0usize;

        // (nal_data_start_index, start_code_length)
        let mut start_entries: Vec<(usize, usize)> = Vec::new();

        while i < data.len() {
            if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
                start_entries.push((i + 4, 4));
                i += 4;
            } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
                start_entries.push((i + 3, 3));
                i += 3;
            } else {
                i += 1;
            }
        }

        for (idx, &(start, _)) in start_entries.iter().enumerate() {
            let end = match start_entries.get(idx + 1) {
                Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
                None => data.len(),
            };

            if start < end {
                nal_units.push(data[start..end].to_vec());
            }
        }

        nal_units
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, access_unit: &[Vec<u8>], timestamp: u32) -> Result<Vec<Vec<u8>>> {
        let payloads = self.payloads(access_unit);
        if payloads.is_empty() {
            return Err(Error::EmptyAccessUnit);
        }

        let last = payloads.len() - 1;
        let packets: Vec<Vec<u8>> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                let hdr = self.header.write(i == last, timestamp);
                let mut packet = Vec::with_capacity(RTP_HEADER_LEN + payload.len());
                packet.extend_from_slice(&hdr);
                packet.extend_from_slice(&payload);
                packet
            })
            .collect();

        tracing::trace!(
            nal_count = access_unit.len(),
            rtp_packets = packets.len(),
            seq = self.header.sequence(),
            ts = timestamp,
            "access unit packetized"
        );

        Ok(packets)
    }

    fn codec_name(&self) -> &'static str {
        "H264"
    }

    fn clock_rate(&self) -> u32 {
        H264_CLOCK_RATE
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }
}

/// SDP media attributes for a negotiated track (RFC 6184 §8.2.1).
///
/// Order matters: `a=rtpmap` defines the payload type and MUST precede
/// `a=fmtp` which references it. ffplay and other clients parse attributes
/// sequentially and expect this ordering.
///
/// - `a=rtpmap:<pt> H264/90000`
/// - `a=fmtp:<pt> packetization-mode=1;profile-level-id=...;sprop-parameter-sets=...`
/// - `a=control:track1`
pub fn sdp_attributes(descriptor: &CodecDescriptor) -> Vec<String> {
    let pt = descriptor.payload_type;
    let mut fmtp = format!(
        "a=fmtp:{} packetization-mode={}",
        pt, descriptor.packetization_mode
    );
    if let Some(pl) = descriptor.profile_level_id() {
        fmtp.push_str(&format!(";profile-level-id={}", pl));
    }
    fmtp.push_str(&format!(
        ";sprop-parameter-sets={},{}",
        BASE64_STANDARD.encode(&descriptor.sps),
        BASE64_STANDARD.encode(&descriptor.pps)
    ));

    vec![
        format!("a=rtpmap:{} H264/{}", pt, H264_CLOCK_RATE),
        fmtp,
        "a=control:track1".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packetizer() -> H264Packetizer {
        H264Packetizer::new(96, 0xAABBCCDD, 0)
    }

    fn descriptor() -> CodecDescriptor {
        CodecDescriptor::new(vec![0x67, 0x42, 0x00, 0x1e], vec![0x68, 0xce, 0x38, 0x80])
    }

    fn timestamp_of(packet: &[u8]) -> u32 {
        u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]])
    }

    // --- NAL extraction ---

    #[test]
    fn extract_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let nals = H264Packetizer::extract_nal_units(&data);
        assert_eq!(nals, vec![vec![0x65, 0xAA, 0xBB]]);
    }

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = H264Packetizer::extract_nal_units(&data);
        assert_eq!(nals, vec![vec![0x67, 0x42], vec![0x68, 0xCE]]);
    }

    #[test]
    fn extract_no_start_code() {
        assert!(H264Packetizer::extract_nal_units(&[]).is_empty());
        assert!(H264Packetizer::extract_nal_units(&[0xFF, 0xFE]).is_empty());
    }

    // --- Packetization ---

    #[test]
    fn small_nal_single_packet() {
        let mut p = make_packetizer();
        let packets = p.packetize(&[vec![0x65, 0xAA, 0xBB, 0xCC]], 3000).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 12 + 4);
        assert_eq!(&packets[0][12..], &[0x65, 0xAA, 0xBB, 0xCC]);
        assert_eq!(packets[0][1] & 0x80, 0x80);
        assert_eq!(timestamp_of(&packets[0]), 3000);
    }

    #[test]
    fn small_nals_aggregated_into_stap_a() {
        let mut p = make_packetizer();
        let au = vec![
            vec![0x67, 0x42, 0x00, 0x1e],
            vec![0x68, 0xce, 0x38, 0x80],
            vec![0x65, 0x88],
        ];
        let packets = p.packetize(&au, 0).unwrap();
        assert_eq!(packets.len(), 1);

        let payload = &packets[0][12..];
        assert_eq!(payload[0] & 0x1f, 24);
        assert_eq!(payload[0] & 0x60, 0x60);
        assert_eq!(&payload[1..3], &[0, 4]);
        assert_eq!(&payload[3..7], &au[0][..]);
        assert_eq!(&payload[7..9], &[0, 4]);
        assert_eq!(&payload[13..15], &[0, 2]);
        assert_eq!(payload.len(), 1 + 3 * 2 + 4 + 4 + 2);
    }

    #[test]
    fn large_nal_fragmented() {
        let mut p = make_packetizer();
        let mut nal = vec![0x65];
        nal.extend(vec![0xAA; DEFAULT_MTU + 500]);
        let packets = p.packetize(&[nal.clone()], 90_000).unwrap();
        assert_eq!(packets.len(), 2);

        assert_eq!(packets[0][12] & 0x1f, 28);
        assert_eq!(packets[0][12] & 0x60, 0x60);
        assert_eq!(packets[0][13], 0x80 | 5);
        assert_eq!(packets[0][1] & 0x80, 0);

        let last = packets.last().unwrap();
        assert_eq!(last[13], 0x40 | 5);
        assert_eq!(last[1] & 0x80, 0x80);

        let reassembled: Vec<u8> = packets.iter().flat_map(|p| p[14..].to_vec()).collect();
        assert_eq!(reassembled, nal[1..]);
        assert!(packets.iter().all(|p| timestamp_of(p) == 90_000));
    }

    #[test]
    fn mixed_access_unit_keeps_order_and_single_marker() {
        let mut p = make_packetizer();
        let mut idr = vec![0x65];
        idr.extend(vec![0x11; 3000]);
        let au = vec![vec![0x67, 0x42, 0x00, 0x1e], vec![0x68, 0xce], idr];
        let packets = p.packetize(&au, 42).unwrap();

        // STAP-A(SPS, PPS) + 3 FU-A fragments
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[0][12] & 0x1f, 24);
        assert!(packets[1..].iter().all(|p| p[12] & 0x1f == 28));

        let markers: Vec<bool> = packets.iter().map(|p| p[1] & 0x80 != 0).collect();
        assert_eq!(markers, vec![false, false, false, true]);

        let seqs: Vec<u16> = packets
            .iter()
            .map(|p| u16::from_be_bytes([p[2], p[3]]))
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn stap_a_respects_mtu() {
        let mut p = make_packetizer().with_mtu(10);
        let au = vec![vec![0x61, 1, 2], vec![0x61, 3, 4], vec![0x61, 5, 6]];
        let packets = p.packetize(&au, 0).unwrap();
        // 1 + (2+3) + (2+3) = 11 > 10, so nothing aggregates
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.len() == 12 + 3));
    }

    #[test]
    fn empty_access_unit_is_an_error() {
        let mut p = make_packetizer();
        assert!(matches!(p.packetize(&[], 0), Err(Error::EmptyAccessUnit)));
        assert!(matches!(
            p.packetize(&[vec![], vec![]], 0),
            Err(Error::EmptyAccessUnit)
        ));
        assert_eq!(p.header.sequence(), 0);
    }

    #[test]
    fn codec_metadata() {
        let p = H264Packetizer::for_descriptor(&descriptor());
        assert_eq!(p.codec_name(), "H264");
        assert_eq!(p.clock_rate(), 90000);
        assert_eq!(p.payload_type(), 96);
    }

    #[test]
    fn sdp_attributes_from_descriptor() {
        let attrs = sdp_attributes(&descriptor());
        assert_eq!(attrs[0], "a=rtpmap:96 H264/90000");
        assert_eq!(
            attrs[1],
            "a=fmtp:96 packetization-mode=1;profile-level-id=42001e;sprop-parameter-sets=Z0IAHg==,aM44gA=="
        );
        assert_eq!(attrs[2], "a=control:track1");
    }
}
