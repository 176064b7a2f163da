//! MPEG-TS demuxing (ISO/IEC 13818-1) for HLS segments.
//!
//! Packets are 188 bytes and start with sync byte `0x47`. The PAT (PID 0)
//! names the PMT PID, the PMT lists elementary streams, and each stream's
//! PES packets are reassembled between payload-unit-start indicators.

use std::collections::HashMap;

use crate::codec;
use crate::error::{Error, Result};
use crate::ingest::{Codec, Track};
use crate::media::h264::H264Packetizer;

pub const PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;
const PAT_PID: u16 = 0;
const NAL_TYPE_AUD: u8 = 9;

/// Output of the demuxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TsEvent {
    /// Elementary streams from the first PMT.
    Tracks(Vec<Track>),
    /// One complete PES packet.
    Frame(PesFrame),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PesFrame {
    pub pid: u16,
    pub codec: Codec,
    pub pts: i64,
    pub dts: i64,
    pub payload: Vec<u8>,
}

impl PesFrame {
    /// Split an H.264 payload into NAL units, dropping access unit delimiters.
    pub fn h264_nal_units(&self) -> Vec<Vec<u8>> {
        H264Packetizer::extract_nal_units(&self.payload)
            .into_iter()
            .filter(|nal| codec::nal_type(nal) != Some(NAL_TYPE_AUD))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct TsDemuxer {
    pmt_pid: Option<u16>,
    streams: HashMap<u16, Codec>,
    pending: HashMap<u16, Vec<u8>>,
    tracks_announced: bool,
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Demux a whole segment, then flush streams still being reassembled.
    ///
    /// Bad packets are skipped and returned as errors next to the events
    /// that could be recovered.
    pub fn push_segment(&mut self, data: &[u8]) -> (Vec<TsEvent>, Vec<Error>) {
        let mut events = Vec::new();
        let mut errors = Vec::new();

        let mut chunks = data.chunks_exact(PACKET_SIZE);
        for packet in &mut chunks {
            match self.push_packet(packet) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }
        if !chunks.remainder().is_empty() {
            errors.push(Error::Demux(format!(
                "{} trailing bytes after last packet",
                chunks.remainder().len()
            )));
        }

        match self.flush() {
            Ok(frames) => events.extend(frames.into_iter().map(TsEvent::Frame)),
            Err(e) => errors.push(e),
        }

        (events, errors)
    }

    /// Feed one 188-byte packet.
    pub fn push_packet(&mut self, packet: &[u8]) -> Result<Option<TsEvent>> {
        if packet.len() != PACKET_SIZE || packet[0] != SYNC_BYTE {
            return Err(Error::Demux("lost sync".to_string()));
        }

        let unit_start = packet[1] & 0x40 != 0;
        let pid = (u16::from(packet[1] & 0x1f) << 8) | u16::from(packet[2]);
        let adaptation = (packet[3] >> 4) & 0x03;

        let mut offset = 4;
        if adaptation & 0x02 != 0 {
            offset += 1 + usize::from(packet[4]);
        }
        if adaptation & 0x01 == 0 || offset > PACKET_SIZE {
            return Ok(None);
        }
        let payload = &packet[offset..];

        if pid == PAT_PID {
            self.parse_pat(section(payload, unit_start)?)?;
            return Ok(None);
        }
        if Some(pid) == self.pmt_pid {
            return self.parse_pmt(section(payload, unit_start)?);
        }

        let Some(&codec) = self.streams.get(&pid) else {
            return Ok(None);
        };

        if unit_start {
            let finished = self.pending.insert(pid, payload.to_vec());
            if let Some(data) = finished {
                return parse_pes(pid, codec, &data).map(|f| Some(TsEvent::Frame(f)));
            }
        } else if let Some(buf) = self.pending.get_mut(&pid) {
            buf.extend_from_slice(payload);
        }
        Ok(None)
    }

    /// Emit every partially reassembled PES packet.
    pub fn flush(&mut self) -> Result<Vec<PesFrame>> {
        let mut pids: Vec<u16> = self.pending.keys().copied().collect();
        pids.sort_unstable();

        let mut frames = Vec::with_capacity(pids.len());
        for pid in pids {
            let (Some(data), Some(&codec)) = (self.pending.remove(&pid), self.streams.get(&pid))
            else {
                continue;
            };
            frames.push(parse_pes(pid, codec, &data)?);
        }
        Ok(frames)
    }

    fn parse_pat(&mut self, section: &[u8]) -> Result<()> {
        let body = section_body(section, 0x00, 8)?;
        for entry in body.chunks_exact(4) {
            let program = u16::from_be_bytes([entry[0], entry[1]]);
            if program != 0 {
                self.pmt_pid = Some((u16::from(entry[2] & 0x1f) << 8) | u16::from(entry[3]));
                break;
            }
        }
        Ok(())
    }

    fn parse_pmt(&mut self, section: &[u8]) -> Result<Option<TsEvent>> {
        if section.len() < 12 {
            return Err(Error::Demux("short PMT".to_string()));
        }
        let program_info_len = (usize::from(section[10] & 0x0f) << 8) | usize::from(section[11]);
        let body = section_body(section, 0x02, 12 + program_info_len)?;

        let mut tracks = Vec::new();
        let mut i = 0;
        while i + 5 <= body.len() {
            let stream_type = body[i];
            let pid = (u16::from(body[i + 1] & 0x1f) << 8) | u16::from(body[i + 2]);
            let es_info_len = (usize::from(body[i + 3] & 0x0f) << 8) | usize::from(body[i + 4]);
            let codec = Codec::from_stream_type(stream_type);
            self.streams.insert(pid, codec);
            tracks.push(Track { id: pid, codec });
            i += 5 + es_info_len;
        }

        if self.tracks_announced {
            return Ok(None);
        }
        self.tracks_announced = true;
        Ok(Some(TsEvent::Tracks(tracks)))
    }
}

/// Strip the pointer field from a PSI payload.
fn section(payload: &[u8], unit_start: bool) -> Result<&[u8]> {
    if !unit_start {
        return Ok(payload);
    }
    let pointer = usize::from(*payload.first().ok_or_else(|| short("PSI"))?);
    payload.get(1 + pointer..).ok_or_else(|| short("PSI"))
}

/// Bytes of a PSI section between its `header_len`-byte header and CRC.
fn section_body(section: &[u8], table_id: u8, header_len: usize) -> Result<&[u8]> {
    if section.len() < 3 || section[0] != table_id {
        return Err(Error::Demux(format!("expected table 0x{:02x}", table_id)));
    }
    let section_len = (usize::from(section[1] & 0x0f) << 8) | usize::from(section[2]);
    let end = (3 + section_len).checked_sub(4).ok_or_else(|| short("section"))?;
    section.get(header_len..end).ok_or_else(|| short("section"))
}

fn parse_pes(pid: u16, codec: Codec, data: &[u8]) -> Result<PesFrame> {
    if data.len() < 9 || data[..3] != [0, 0, 1] {
        return Err(Error::Demux(format!("PID {}: missing PES start code", pid)));
    }
    let flags = data[7] >> 6;
    let header_len = usize::from(data[8]);
    let payload = data
        .get(9 + header_len..)
        .ok_or_else(|| short("PES header"))?;

    let pts = match flags {
        0b10 | 0b11 => timestamp(data.get(9..14).ok_or_else(|| short("PTS"))?),
        _ => return Err(Error::Demux(format!("PID {}: PES without PTS", pid))),
    };
    let dts = if flags == 0b11 {
        timestamp(data.get(14..19).ok_or_else(|| short("DTS"))?)
    } else {
        pts
    };

    Ok(PesFrame {
        pid,
        codec,
        pts,
        dts,
        payload: payload.to_vec(),
    })
}

/// Decode a 33-bit PES timestamp from its 5-byte marker-bit layout.
fn timestamp(b: &[u8]) -> i64 {
    (i64::from(b[0] >> 1) & 0x07) << 30
        | i64::from(b[1]) << 22
        | i64::from(b[2] >> 1) << 15
        | i64::from(b[3]) << 7
        | i64::from(b[4] >> 1)
}

fn short(what: &str) -> Error {
    Error::Demux(format!("truncated {}", what))
}

/// Builders for synthetic transport streams.
#[cfg(test)]
pub(crate) mod test_support {
    use super::PACKET_SIZE;

    pub const PMT_PID: u16 = 0x1000;
    pub const VIDEO_PID: u16 = 0x100;
    pub const AUDIO_PID: u16 = 0x101;

    fn header(pid: u16, unit_start: bool, counter: u8) -> [u8; 4] {
        [
            0x47,
            (if unit_start { 0x40 } else { 0 }) | (pid >> 8) as u8,
            pid as u8,
            0x10 | (counter & 0x0f),
        ]
    }

    /// Packet with payload, padded with an adaptation field when short.
    fn packet(pid: u16, unit_start: bool, counter: u8, payload: &[u8]) -> Vec<u8> {
        let mut pkt = header(pid, unit_start, counter).to_vec();
        let room = PACKET_SIZE - 4;
        if payload.len() < room {
            pkt[3] |= 0x20;
            let stuffing = room - payload.len() - 1;
            pkt.push(stuffing as u8);
            if stuffing > 0 {
                pkt.push(0x00);
                pkt.extend(std::iter::repeat_n(0xff, stuffing - 1));
            }
        }
        pkt.extend_from_slice(payload);
        assert_eq!(pkt.len(), PACKET_SIZE);
        pkt
    }

    fn psi(pid: u16, section: Vec<u8>) -> Vec<u8> {
        let mut payload = vec![0x00];
        payload.extend(section);
        payload.resize(PACKET_SIZE - 4, 0xff);
        packet(pid, true, 0, &payload)
    }

    pub fn pat() -> Vec<u8> {
        // section_length = 5 (header) + 4 (program) + 4 (CRC)
        psi(
            0,
            vec![
                0x00, 0xb0, 13, 0x00, 0x01, 0xc1, 0x00, 0x00,
                0x00, 0x01, 0xe0 | (PMT_PID >> 8) as u8, PMT_PID as u8,
                0, 0, 0, 0,
            ],
        )
    }

    pub fn pmt(streams: &[(u8, u16)]) -> Vec<u8> {
        let mut body = Vec::new();
        for &(stream_type, pid) in streams {
            body.extend([stream_type, 0xe0 | (pid >> 8) as u8, pid as u8, 0xf0, 0x00]);
        }
        let section_len = 9 + body.len() + 4;
        let mut section = vec![
            0x02,
            0xb0 | (section_len >> 8) as u8,
            section_len as u8,
            0x00, 0x01, 0xc1, 0x00, 0x00,
            0xe0 | (VIDEO_PID >> 8) as u8, VIDEO_PID as u8,
            0xf0, 0x00,
        ];
        section.extend(body);
        section.extend([0, 0, 0, 0]);
        psi(PMT_PID, section)
    }

    fn encode_ts(prefix: u8, ts: i64) -> [u8; 5] {
        [
            (prefix << 4) | (((ts >> 30) as u8 & 0x07) << 1) | 1,
            (ts >> 22) as u8,
            (((ts >> 15) as u8) << 1) | 1,
            (ts >> 7) as u8,
            ((ts as u8) << 1) | 1,
        ]
    }

    /// PES packets carrying `es` with the given PTS (and optional DTS).
    pub fn pes(pid: u16, pts: i64, dts: Option<i64>, es: &[u8]) -> Vec<u8> {
        let mut pes = vec![0x00, 0x00, 0x01, 0xe0, 0x00, 0x00, 0x80];
        match dts {
            Some(dts) => {
                pes.extend([0xc0, 10]);
                pes.extend(encode_ts(0x3, pts));
                pes.extend(encode_ts(0x1, dts));
            }
            None => {
                pes.extend([0x80, 5]);
                pes.extend(encode_ts(0x2, pts));
            }
        }
        pes.extend_from_slice(es);

        let mut out = Vec::new();
        for (i, chunk) in pes.chunks(PACKET_SIZE - 4).enumerate() {
            out.extend(packet(pid, i == 0, i as u8, chunk));
        }
        out
    }

    /// A segment with PAT, PMT (H.264 + AAC) and one video PES.
    pub fn segment(pts: i64, es: &[u8]) -> Vec<u8> {
        let mut data = pat();
        data.extend(pmt(&[(0x1b, VIDEO_PID), (0x0f, AUDIO_PID)]));
        data.extend(pes(VIDEO_PID, pts, None, es));
        data
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    const AUD: [u8; 2] = [0x09, 0xf0];
    const SPS: [u8; 4] = [0x67, 0x42, 0x00, 0x1e];
    const PPS: [u8; 2] = [0x68, 0xce];

    fn annex_b(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend([0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn pmt_announces_tracks_once() {
        let mut demuxer = TsDemuxer::new();
        assert_eq!(demuxer.push_packet(&pat()).unwrap(), None);

        let pmt = pmt(&[(0x1b, VIDEO_PID), (0x0f, AUDIO_PID)]);
        let event = demuxer.push_packet(&pmt).unwrap();
        assert_eq!(
            event,
            Some(TsEvent::Tracks(vec![
                Track { id: VIDEO_PID, codec: Codec::H264 },
                Track { id: AUDIO_PID, codec: Codec::Aac },
            ]))
        );
        assert_eq!(demuxer.push_packet(&pmt).unwrap(), None);
    }

    #[test]
    fn segment_yields_frame_with_pts() {
        let idr = [0x65u8; 40];
        let es = annex_b(&[&AUD, &SPS, &PPS, &idr]);
        let (events, errors) = TsDemuxer::new().push_segment(&segment(900_000, &es));

        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(events.len(), 2);
        let TsEvent::Frame(frame) = &events[1] else {
            panic!("expected frame, got {:?}", events[1]);
        };
        assert_eq!(frame.pid, VIDEO_PID);
        assert_eq!(frame.codec, Codec::H264);
        assert_eq!(frame.pts, 900_000);
        assert_eq!(frame.dts, 900_000);
        assert_eq!(frame.h264_nal_units(), vec![SPS.to_vec(), PPS.to_vec(), idr.to_vec()]);
    }

    #[test]
    fn large_pes_spans_packets_and_keeps_dts() {
        let big = vec![0x41u8; 1000];
        let es = annex_b(&[&big]);
        let mut data = pat();
        data.extend(pmt(&[(0x1b, VIDEO_PID)]));
        data.extend(pes(VIDEO_PID, 3_003, Some(0), &es));
        data.extend(pes(VIDEO_PID, 6_006, Some(3_003), &es));

        let (events, errors) = TsDemuxer::new().push_segment(&data);
        assert!(errors.is_empty(), "{errors:?}");

        let frames: Vec<&PesFrame> = events
            .iter()
            .filter_map(|e| match e {
                TsEvent::Frame(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!((frames[0].pts, frames[0].dts), (3_003, 0));
        assert_eq!((frames[1].pts, frames[1].dts), (6_006, 3_003));
        assert_eq!(frames[0].h264_nal_units(), vec![big]);
    }

    #[test]
    fn timestamp_uses_all_33_bits() {
        let pts = (1i64 << 32) + 12_345;
        let data = segment(pts, &annex_b(&[&[0x41, 1, 2]]));
        let (events, _) = TsDemuxer::new().push_segment(&data);
        assert!(matches!(&events[1], TsEvent::Frame(f) if f.pts == pts));
    }

    #[test]
    fn bad_sync_and_trailing_bytes_reported() {
        let mut data = segment(0, &annex_b(&[&[0x41, 1]]));
        data[PACKET_SIZE] = 0x00;
        data.extend([0x47, 0x00]);

        let (events, errors) = TsDemuxer::new().push_segment(&data);
        assert_eq!(errors.len(), 2);
        // PMT was lost with its packet, so no tracks and no frames.
        assert!(events.is_empty());
    }

    #[test]
    fn packets_for_unknown_pids_ignored() {
        let mut demuxer = TsDemuxer::new();
        let stray = pes(0x1ff, 0, None, &[0, 0, 1, 0x41]);
        assert_eq!(demuxer.push_packet(&stray[..PACKET_SIZE]).unwrap(), None);
        assert!(demuxer.flush().unwrap().is_empty());
    }
}
