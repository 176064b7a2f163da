//! HTTP Live Streaming ingestion.
//!
//! Follows one media playlist (picking the highest-bandwidth variant of a
//! master playlist), downloads new MPEG-TS segments as they appear and
//! turns their H.264 PES packets into [`IngestEvent::AccessUnit`]s.

use std::time::Duration;

use reqwest::Client;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};
use crate::ingest::playlist::{self, MediaPlaylist, Playlist};
use crate::ingest::ts::{TsDemuxer, TsEvent};
use crate::ingest::{AccessUnit, Codec, Ingest, IngestEvent, IngestSession};

/// Segments fetched on the first load of a live playlist.
pub const LIVE_EDGE_SEGMENTS: usize = 3;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Target durations a live playlist may go without a new segment.
const STALL_TARGET_DURATIONS: u32 = 3;

/// [`Ingest`] implementation for HLS over HTTP(S).
#[derive(Clone)]
pub struct HlsIngest {
    client: Client,
}

impl HlsIngest {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("hls2rtsp/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl Ingest for HlsIngest {
    fn open(&self, url: &str, cancel: CancellationToken) -> Result<IngestSession> {
        let url = Url::parse(url)?;
        let client = self.client.clone();
        Ok(IngestSession::spawn(cancel, move |events| {
            Follower::new(client, events).run(url)
        }))
    }
}

/// State of one playlist-following task.
struct Follower {
    client: Client,
    events: mpsc::Sender<IngestEvent>,
    demuxer: TsDemuxer,
    last_sequence: Option<u64>,
}

impl Follower {
    fn new(client: Client, events: mpsc::Sender<IngestEvent>) -> Self {
        Self {
            client,
            events,
            demuxer: TsDemuxer::new(),
            last_sequence: None,
        }
    }

    async fn run(mut self, url: Url) -> Result<()> {
        let (media_url, mut playlist) = self.resolve(url).await?;
        tracing::debug!(url = %media_url, "following media playlist");

        let mut progressed_at = Instant::now();
        loop {
            if playlist.restarted(self.last_sequence) {
                return Err(Error::Playlist(format!(
                    "media sequence went back from {} to {}",
                    self.last_sequence.unwrap_or_default(),
                    playlist.media_sequence
                )));
            }

            let fresh: Vec<_> = playlist
                .segments_after(self.last_sequence, LIVE_EDGE_SEGMENTS)
                .to_vec();

            for segment in &fresh {
                let segment_url = media_url.join(&segment.uri)?;
                let data = self.fetch_bytes(&segment_url).await?;
                tracing::trace!(
                    url = %segment_url,
                    sequence = segment.sequence,
                    bytes = data.len(),
                    "segment downloaded"
                );
                self.demux(&data).await?;
                self.last_sequence = Some(segment.sequence);
            }

            if playlist.ended {
                return Ok(());
            }

            if !fresh.is_empty() {
                progressed_at = Instant::now();
            } else if progressed_at.elapsed() >= stall_timeout(&playlist) {
                return Err(Error::Playlist(format!(
                    "no new segment for {:?}",
                    progressed_at.elapsed()
                )));
            }

            tokio::time::sleep(refresh_delay(&playlist, !fresh.is_empty())).await;
            playlist = self.fetch_media(&media_url).await?;
        }
    }

    /// Fetch `url`, descending into the best variant of a master playlist.
    async fn resolve(&self, url: Url) -> Result<(Url, MediaPlaylist)> {
        match playlist::parse(&self.fetch_text(&url).await?)? {
            Playlist::Media(media) => Ok((url, media)),
            Playlist::Master(master) => {
                let variant = master
                    .best_variant()
                    .ok_or_else(|| Error::Playlist("no variants".to_string()))?;
                tracing::debug!(uri = %variant.uri, bandwidth = variant.bandwidth, "selected variant");
                let media_url = url.join(&variant.uri)?;
                let media = self.fetch_media(&media_url).await?;
                Ok((media_url, media))
            }
        }
    }

    async fn fetch_media(&self, url: &Url) -> Result<MediaPlaylist> {
        match playlist::parse(&self.fetch_text(url).await?)? {
            Playlist::Media(media) => Ok(media),
            Playlist::Master(_) => Err(Error::Playlist(format!("{} is a master playlist", url))),
        }
    }

    async fn fetch_text(&self, url: &Url) -> Result<String> {
        let response = self.client.get(url.clone()).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }

    async fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>> {
        let response = self.client.get(url.clone()).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn demux(&mut self, data: &[u8]) -> Result<()> {
        let (events, errors) = self.demuxer.push_segment(data);

        for error in errors {
            self.send(IngestEvent::DecodeError(error.to_string())).await?;
        }

        for event in events {
            let event = match event {
                TsEvent::Tracks(tracks) => IngestEvent::Tracks(tracks),
                TsEvent::Frame(frame) if frame.codec == Codec::H264 => {
                    let nalus = frame.h264_nal_units();
                    if nalus.is_empty() {
                        continue;
                    }
                    IngestEvent::AccessUnit(AccessUnit {
                        track: frame.pid,
                        pts: frame.pts,
                        dts: frame.dts,
                        nalus,
                    })
                }
                TsEvent::Frame(_) => continue,
            };
            self.send(event).await?;
        }
        Ok(())
    }

    async fn send(&self, event: IngestEvent) -> Result<()> {
        self.events.send(event).await.map_err(|_| Error::Cancelled)
    }
}

/// Wait before reloading: the target duration, or half of it when the
/// last reload brought nothing new (RFC 8216 §6.3.4).
fn refresh_delay(playlist: &MediaPlaylist, changed: bool) -> Duration {
    let target = playlist.target_duration.max(Duration::from_millis(500));
    if changed { target } else { target / 2 }
}

/// How long a live playlist may stay unchanged before the session ends.
fn stall_timeout(playlist: &MediaPlaylist) -> Duration {
    playlist
        .target_duration
        .max(Duration::from_millis(500))
        .saturating_mul(STALL_TARGET_DURATIONS)
}
