//! Source side of a bridge: turns a playlist URL into ordered media events.
//!
//! An [`Ingest`] implementation opens an [`IngestSession`] whose background
//! task pushes [`IngestEvent`]s onto a bounded channel. The consumer reads
//! them in order with [`IngestSession::next_event`]; once the channel is
//! drained, [`IngestSession::finish`] yields the task's terminal result.
//!
//! | Module | Role |
//! |--------|------|
//! | [`playlist`] | M3U8 master/media playlist parsing |
//! | [`ts`] | MPEG-TS demuxing into PES frames |
//! | [`hls`] | HTTP live ingestion built on both |

pub mod hls;
pub mod playlist;
pub mod ts;

use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub use hls::HlsIngest;

/// Events buffered between the ingestion task and its consumer.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Codec identity of an elementary track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    H265,
    Aac,
    /// Any other MPEG-TS stream type.
    Other(u8),
}

impl Codec {
    /// Map an MPEG-TS PMT `stream_type` to a codec.
    pub fn from_stream_type(stream_type: u8) -> Self {
        match stream_type {
            0x1b => Self::H264,
            0x24 => Self::H265,
            0x0f => Self::Aac,
            other => Self::Other(other),
        }
    }
}

/// One elementary track advertised by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    /// Stable identifier within the session (the TS PID for HLS).
    pub id: u16,
    pub codec: Codec,
}

/// A decoded access unit for one track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    pub track: u16,
    /// Presentation timestamp at 90 kHz.
    pub pts: i64,
    /// Decode timestamp at 90 kHz.
    pub dts: i64,
    /// NAL units without start codes.
    pub nalus: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestEvent {
    /// Tracks discovered; sent once per session before any access unit.
    Tracks(Vec<Track>),
    AccessUnit(AccessUnit),
    /// Non-fatal decode problem; the session continues.
    DecodeError(String),
}

/// Opens ingestion sessions against a source URL.
pub trait Ingest: Send + Sync {
    /// Start ingesting `url` in the background.
    ///
    /// Must be called from within a tokio runtime. Connection failures are
    /// reported through [`IngestSession::finish`], not here; an `Err` means
    /// the session could not be started at all (e.g. a malformed URL).
    fn open(&self, url: &str, cancel: CancellationToken) -> Result<IngestSession>;
}

/// A running ingestion task and its event stream.
pub struct IngestSession {
    events: mpsc::Receiver<IngestEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl IngestSession {
    /// Spawn `run` with a sender for events.
    ///
    /// `run` is raced against `cancel`: cancelling drops the future
    /// wherever it is suspended and the session ends with
    /// [`Error::Cancelled`].
    pub fn spawn<F, Fut>(cancel: CancellationToken, run: F) -> Self
    where
        F: FnOnce(mpsc::Sender<IngestEvent>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let fut = run(tx);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => Err(Error::Cancelled),
                result = fut => result,
            }
        });

        Self {
            events: rx,
            cancel,
            task: Some(task),
        }
    }

    /// Next event in production order, or `None` once the task has ended
    /// and every buffered event has been consumed.
    pub async fn next_event(&mut self) -> Option<IngestEvent> {
        self.events.recv().await
    }

    /// Wait for the task to end and return its result.
    ///
    /// A task that returns `Ok(())` ran to completion (e.g. an ended
    /// playlist). Calling `finish` again returns [`Error::IngestEnded`].
    pub async fn finish(&mut self) -> Result<()> {
        self.events.close();
        let Some(task) = self.task.take() else {
            return Err(Error::IngestEnded);
        };
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::Cancelled),
            Err(e) => Err(Error::TaskFailed(e.to_string())),
        }
    }

    /// Cancel the task and wait for it to exit.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Err(e) = self.finish().await
            && !matches!(e, Error::Cancelled | Error::IngestEnded)
        {
            tracing::debug!(error = %e, "ingest session closed with error");
        }
    }
}

impl Drop for IngestSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
