//! HLS playlist parsing (RFC 8216).
//!
//! Only the tags needed to follow a live stream are interpreted:
//! `#EXT-X-STREAM-INF` in master playlists, and `#EXT-X-TARGETDURATION`,
//! `#EXT-X-MEDIA-SEQUENCE`, `#EXTINF` and `#EXT-X-ENDLIST` in media
//! playlists. Everything else is ignored.

use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Playlist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MasterPlaylist {
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub uri: String,
    pub bandwidth: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub target_duration: Duration,
    pub media_sequence: u64,
    pub segments: Vec<Segment>,
    /// `#EXT-X-ENDLIST` seen: no segments will be added.
    pub ended: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub uri: String,
    /// Media sequence number of this segment.
    pub sequence: u64,
    pub duration: Duration,
}

impl MasterPlaylist {
    /// Variant with the highest advertised bandwidth.
    pub fn best_variant(&self) -> Option<&Variant> {
        self.variants.iter().max_by_key(|v| v.bandwidth)
    }
}

impl MediaPlaylist {
    /// Segments to fetch after having fetched `last` (a media sequence).
    ///
    /// Without a previous position only the last `initial` segments are
    /// returned, so a live stream starts near its edge.
    pub fn segments_after(&self, last: Option<u64>, initial: usize) -> &[Segment] {
        match last {
            Some(last) => {
                let start = self
                    .segments
                    .iter()
                    .position(|s| s.sequence > last)
                    .unwrap_or(self.segments.len());
                &self.segments[start..]
            }
            None => &self.segments[self.segments.len().saturating_sub(initial)..],
        }
    }

    /// Whether the newest segment is older than `last`, which happens when
    /// the origin restarts and numbers segments from scratch.
    pub fn restarted(&self, last: Option<u64>) -> bool {
        match (last, self.segments.last()) {
            (Some(last), Some(newest)) => newest.sequence < last,
            _ => false,
        }
    }
}

/// Parse a playlist, detecting master vs. media by its tags.
pub fn parse(text: &str) -> Result<Playlist> {
    let text = text.trim_start_matches('\u{feff}');
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    if lines.next() != Some("#EXTM3U") {
        return Err(Error::Playlist("missing #EXTM3U header".to_string()));
    }

    if text.contains("#EXT-X-STREAM-INF") {
        parse_master(lines).map(Playlist::Master)
    } else {
        parse_media(lines).map(Playlist::Media)
    }
}

fn parse_master<'a>(lines: impl Iterator<Item = &'a str>) -> Result<MasterPlaylist> {
    let mut playlist = MasterPlaylist::default();
    let mut pending: Option<u64> = None;

    for line in lines {
        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            let bandwidth = attribute(attrs, "BANDWIDTH")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            pending = Some(bandwidth);
        } else if line.starts_with('#') {
            continue;
        } else if let Some(bandwidth) = pending.take() {
            playlist.variants.push(Variant {
                uri: line.to_string(),
                bandwidth,
            });
        }
    }

    if playlist.variants.is_empty() {
        return Err(Error::Playlist("master playlist has no variants".to_string()));
    }
    Ok(playlist)
}

fn parse_media<'a>(lines: impl Iterator<Item = &'a str>) -> Result<MediaPlaylist> {
    let mut target_duration = None;
    let mut media_sequence = 0;
    let mut ended = false;
    let mut segments = Vec::new();
    let mut pending: Option<Duration> = None;

    for line in lines {
        if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            let secs: u64 = value
                .trim()
                .parse()
                .map_err(|_| Error::Playlist(format!("invalid target duration {:?}", value)))?;
            target_duration = Some(Duration::from_secs(secs));
        } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            media_sequence = value
                .trim()
                .parse()
                .map_err(|_| Error::Playlist(format!("invalid media sequence {:?}", value)))?;
        } else if let Some(value) = line.strip_prefix("#EXTINF:") {
            let secs = value.split(',').next().unwrap_or("").trim();
            let secs: f64 = secs
                .parse()
                .map_err(|_| Error::Playlist(format!("invalid EXTINF {:?}", value)))?;
            let duration = Duration::try_from_secs_f64(secs.max(0.0))
                .map_err(|_| Error::Playlist(format!("EXTINF out of range {:?}", value)))?;
            pending = Some(duration);
        } else if line == "#EXT-X-ENDLIST" {
            ended = true;
        } else if line.starts_with('#') {
            continue;
        } else if let Some(duration) = pending.take() {
            segments.push(Segment {
                uri: line.to_string(),
                sequence: media_sequence + segments.len() as u64,
                duration,
            });
        }
    }

    let target_duration = target_duration
        .ok_or_else(|| Error::Playlist("missing #EXT-X-TARGETDURATION".to_string()))?;

    Ok(MediaPlaylist {
        target_duration,
        media_sequence,
        segments,
        ended,
    })
}

/// Value of `name` in an attribute list, with surrounding quotes removed.
fn attribute<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    let mut rest = attrs;
    while !rest.is_empty() {
        let (key, after) = rest.split_once('=')?;
        let (value, tail) = if let Some(quoted) = after.strip_prefix('"') {
            let end = quoted.find('"')?;
            let tail = quoted[end + 1..].trim_start_matches(',');
            (&quoted[..end], tail)
        } else {
            match after.split_once(',') {
                Some((value, tail)) => (value, tail),
                None => (after, ""),
            }
        };
        if key.trim() == name {
            return Some(value);
        }
        rest = tail;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360,CODECS=\"avc1.4d401e,mp4a.40.2\"
low/index.m3u8
#EXT-X-STREAM-INF:CODECS=\"avc1.640028,mp4a.40.2\",BANDWIDTH=2500000
high/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=1200000
mid/index.m3u8
";

    const LIVE: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:4
#EXT-X-MEDIA-SEQUENCE:120
#EXTINF:4.000,
seg120.ts
#EXTINF:4.000,
seg121.ts
#EXTINF:3.960,live
seg122.ts
#EXTINF:4.004,
seg123.ts
";

    fn media(text: &str) -> MediaPlaylist {
        match parse(text).unwrap() {
            Playlist::Media(m) => m,
            other => panic!("expected media playlist, got {other:?}"),
        }
    }

    #[test]
    fn master_picks_highest_bandwidth() {
        let Playlist::Master(master) = parse(MASTER).unwrap() else {
            panic!("expected master playlist");
        };
        assert_eq!(master.variants.len(), 3);
        assert_eq!(master.best_variant().unwrap().uri, "high/index.m3u8");
        assert_eq!(master.best_variant().unwrap().bandwidth, 2_500_000);
    }

    #[test]
    fn media_playlist_sequences() {
        let playlist = media(LIVE);
        assert_eq!(playlist.target_duration, Duration::from_secs(4));
        assert_eq!(playlist.media_sequence, 120);
        assert!(!playlist.ended);
        let seqs: Vec<u64> = playlist.segments.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![120, 121, 122, 123]);
        assert_eq!(playlist.segments[2].uri, "seg122.ts");
        assert_eq!(playlist.segments[2].duration, Duration::from_millis(3960));
    }

    #[test]
    fn first_load_starts_near_live_edge() {
        let playlist = media(LIVE);
        let uris: Vec<&str> = playlist
            .segments_after(None, 3)
            .iter()
            .map(|s| s.uri.as_str())
            .collect();
        assert_eq!(uris, vec!["seg121.ts", "seg122.ts", "seg123.ts"]);
    }

    #[test]
    fn refresh_returns_only_newer_segments() {
        let playlist = media(LIVE);
        assert_eq!(playlist.segments_after(Some(121), 3).len(), 2);
        assert!(playlist.segments_after(Some(123), 3).is_empty());
        assert_eq!(playlist.segments_after(Some(10), 3).len(), 4);
    }

    #[test]
    fn sequence_reset_is_a_restart() {
        let playlist = media(LIVE);
        assert!(!playlist.restarted(None));
        assert!(!playlist.restarted(Some(121)));
        assert!(!playlist.restarted(Some(123)));
        assert!(playlist.restarted(Some(5000)));

        let reset = media("#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2,\n0.ts\n#EXTINF:2,\n1.ts\n");
        assert!(reset.restarted(Some(5000)));
        assert!(reset.segments_after(Some(5000), 3).is_empty());
    }

    #[test]
    fn out_of_range_extinf_is_an_error() {
        for value in ["inf", "1e300"] {
            let text = format!("#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:{value},\nseg.ts\n");
            assert!(matches!(parse(&text), Err(Error::Playlist(_))), "{value}");
        }
        let negative = media("#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:-inf,\nseg.ts\n");
        assert_eq!(negative.segments[0].duration, Duration::ZERO);
    }

    #[test]
    fn endlist_marks_ended() {
        let playlist = media(
            "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2,\na.ts\n#EXT-X-ENDLIST\n",
        );
        assert!(playlist.ended);
        assert_eq!(playlist.media_sequence, 0);
        assert_eq!(playlist.segments.len(), 1);
    }

    #[test]
    fn rejects_non_playlists() {
        assert!(parse("<html></html>").is_err());
        assert!(parse("").is_err());
        assert!(parse("#EXTM3U\n#EXTINF:2,\na.ts\n").is_err());
        assert!(parse("#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\n").is_err());
    }

    #[test]
    fn quoted_attributes_may_contain_commas() {
        let attrs = "CODECS=\"avc1.640028,mp4a.40.2\",BANDWIDTH=10";
        assert_eq!(attribute(attrs, "BANDWIDTH"), Some("10"));
        assert_eq!(attribute(attrs, "CODECS"), Some("avc1.640028,mp4a.40.2"));
        assert_eq!(attribute(attrs, "RESOLUTION"), None);
    }
}
