//! Per-stream supervisor: HLS source in, RTSP mount out.
//!
//! A [`Bridge`] owns one source URL and one publish path. Its run loop opens
//! an ingestion session, waits for an H.264 track, negotiates SPS/PPS from
//! the first access unit that carries both, publishes a mount and forwards
//! every following access unit as RTP. When the session ends it retires the
//! mount, waits the reconnect delay and starts over, until closed.
//!
//! ```text
//! Idle ─► Connecting ─► Negotiating ─► Publishing
//!             ▲                │            │
//!             └── Disconnected ◄────────────┘
//!
//! any state ─► Closed (on close)
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, CodecDescriptor};
use crate::error::{Error, Result};
use crate::ingest::{AccessUnit, Codec, Ingest, IngestEvent, IngestSession};
use crate::media::Packetizer;
use crate::media::h264::H264Packetizer;
use crate::metrics::{FrameMetrics, MetricsReporter};
use crate::mount::{Mount, MountRegistry};

/// Lifecycle of a [`Bridge`], observable through [`Bridge::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Connecting,
    /// H.264 track found, waiting for an access unit with SPS and PPS.
    Negotiating,
    Publishing,
    /// Session ended; waiting out the reconnect delay.
    Disconnected,
    Closed,
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub reconnect_delay: Duration,
    /// Statistics report period; `None` disables drift/jitter tracking.
    pub metrics_interval: Option<Duration>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            metrics_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Negotiated output of the current connection.
///
/// Descriptor, packetizer and mount exist together or not at all.
enum Publication {
    Uninitialized,
    Ready {
        descriptor: Arc<CodecDescriptor>,
        packetizer: Box<dyn Packetizer>,
        mount: Arc<Mount>,
    },
}

/// State shared between the [`Bridge`] handle and its run loop.
struct Shared {
    name: String,
    url: String,
    mounts: MountRegistry,
    ingest: Arc<dyn Ingest>,
    options: BridgeOptions,
    publication: Mutex<Publication>,
    metrics: Option<Arc<FrameMetrics>>,
    state: watch::Sender<BridgeState>,
}

enum Lifecycle {
    NotStarted,
    Running {
        task: JoinHandle<()>,
        reporter: Option<MetricsReporter>,
    },
    Closed,
}

/// Supervises one HLS source published at `/<name>`.
pub struct Bridge {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    lifecycle: Lifecycle,
}

impl Bridge {
    pub fn new(
        name: &str,
        url: &str,
        mounts: MountRegistry,
        ingest: Arc<dyn Ingest>,
        options: BridgeOptions,
    ) -> Self {
        let metrics = options
            .metrics_interval
            .map(|_| Arc::new(FrameMetrics::new(name)));
        let (state, _) = watch::channel(BridgeState::Idle);

        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                url: url.to_string(),
                mounts,
                ingest,
                options,
                publication: Mutex::new(Publication::Uninitialized),
                metrics,
                state,
            }),
            cancel: CancellationToken::new(),
            lifecycle: Lifecycle::NotStarted,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> BridgeState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.shared.state.subscribe()
    }

    /// Descriptor negotiated on the current connection, if any.
    pub fn descriptor(&self) -> Option<Arc<CodecDescriptor>> {
        match &*self.shared.publication.lock() {
            Publication::Ready { descriptor, .. } => Some(descriptor.clone()),
            Publication::Uninitialized => None,
        }
    }

    /// Mount currently published by this bridge, if any.
    pub fn mount(&self) -> Option<Arc<Mount>> {
        match &*self.shared.publication.lock() {
            Publication::Ready { mount, .. } => Some(mount.clone()),
            Publication::Uninitialized => None,
        }
    }

    pub fn metrics(&self) -> Option<Arc<FrameMetrics>> {
        self.shared.metrics.clone()
    }

    /// Spawn the run loop on the current tokio runtime.
    ///
    /// No-op when already started or closed.
    pub fn start(&mut self) {
        if !matches!(self.lifecycle, Lifecycle::NotStarted) {
            return;
        }

        let reporter = match (&self.shared.metrics, self.shared.options.metrics_interval) {
            (Some(metrics), Some(interval)) => Some(MetricsReporter::spawn(metrics.clone(), interval)),
            _ => None,
        };
        let task = tokio::spawn(run_loop(self.shared.clone(), self.cancel.clone()));
        self.lifecycle = Lifecycle::Running { task, reporter };
    }

    /// Stop the bridge and wait until nothing more can be forwarded.
    ///
    /// Returns after the run loop and the statistics reporter have exited
    /// and the mount has been unpublished. Safe to call repeatedly or
    /// without [`start`](Self::start).
    pub async fn close(&mut self) {
        self.cancel.cancel();

        match std::mem::replace(&mut self.lifecycle, Lifecycle::Closed) {
            Lifecycle::Running { task, reporter } => {
                if let Err(e) = task.await {
                    tracing::warn!(stream = %self.shared.name, error = %e, "run loop failed");
                }
                if let Some(mut reporter) = reporter {
                    reporter.stop().await;
                }
            }
            Lifecycle::NotStarted => {}
            Lifecycle::Closed => return,
        }

        self.shared.retire();
        self.shared.set_state(BridgeState::Closed);
        tracing::info!(stream = %self.shared.name, "closed");
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let delay = shared.options.reconnect_delay;

    loop {
        shared.set_state(BridgeState::Connecting);
        tracing::info!(stream = %shared.name, url = %shared.url, "connecting to HLS");

        let outcome = shared.connect(&cancel).await;
        shared.retire();

        if cancel.is_cancelled() {
            break;
        }

        let reason = match outcome {
            Ok(()) => Error::IngestEnded,
            Err(e) => e,
        };
        shared.set_state(BridgeState::Disconnected);
        tracing::warn!(
            stream = %shared.name,
            reason = %reason,
            delay_secs = delay.as_secs_f64(),
            "HLS disconnected, reconnecting"
        );

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!(stream = %shared.name, "run loop exited");
}

impl Shared {
    fn set_state(&self, state: BridgeState) {
        self.state.send_replace(state);
    }

    /// One connection attempt, from open to session end.
    async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        let mut session = self.ingest.open(&self.url, cancel.child_token())?;
        match self.pump(&mut session, cancel).await {
            Ok(()) => session.finish().await,
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    /// Consume events until the session's channel closes.
    async fn pump(&self, session: &mut IngestSession, cancel: &CancellationToken) -> Result<()> {
        let mut video_track = None;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                event = session.next_event() => event,
            };
            let Some(event) = event else {
                return Ok(());
            };

            match event {
                IngestEvent::Tracks(tracks) => {
                    if video_track.is_some() {
                        continue;
                    }
                    let track = tracks
                        .iter()
                        .find(|t| t.codec == Codec::H264)
                        .ok_or(Error::NoVideoTrack)?;
                    video_track = Some(track.id);
                    self.set_state(BridgeState::Negotiating);
                    tracing::info!(stream = %self.name, track = track.id, "found H264 track, waiting for SPS/PPS");
                }
                IngestEvent::AccessUnit(au) if Some(au.track) == video_track => {
                    self.on_access_unit(&au);
                }
                IngestEvent::AccessUnit(_) => {}
                IngestEvent::DecodeError(message) => {
                    tracing::warn!(stream = %self.name, error = %message, "decode error");
                }
            }
        }
    }

    fn on_access_unit(&self, au: &AccessUnit) {
        if !self.ensure_published(&au.nalus) {
            return;
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_frame(au.pts);
        }
        self.forward(au);
    }

    /// Negotiate and publish on the first access unit carrying SPS and PPS.
    ///
    /// Returns whether a publication is installed.
    fn ensure_published(&self, nalus: &[Vec<u8>]) -> bool {
        let mut publication = self.publication.lock();
        if matches!(*publication, Publication::Ready { .. }) {
            return true;
        }

        let Some(descriptor) = codec::negotiate(nalus) else {
            return false;
        };
        tracing::info!(
            stream = %self.name,
            sps_bytes = descriptor.sps.len(),
            pps_bytes = descriptor.pps.len(),
            "got SPS and PPS"
        );

        let descriptor = Arc::new(descriptor);
        let packetizer = Box::new(H264Packetizer::for_descriptor(&descriptor));
        let mount = self.mounts.publish(&self.name, descriptor.clone());
        tracing::info!(stream = %self.name, path = %mount.path(), "RTSP stream ready");

        *publication = Publication::Ready {
            descriptor,
            packetizer,
            mount,
        };
        self.set_state(BridgeState::Publishing);
        true
    }

    /// Packetize and write one access unit. Drops it without a publication.
    fn forward(&self, au: &AccessUnit) {
        let mut publication = self.publication.lock();
        let Publication::Ready {
            packetizer, mount, ..
        } = &mut *publication
        else {
            return;
        };

        // RTP timestamps are the low 32 bits of the 90 kHz PTS.
        let packets = match packetizer.packetize(&au.nalus, au.pts as u32) {
            Ok(packets) => packets,
            Err(e) => {
                tracing::debug!(stream = %self.name, error = %e, "access unit dropped");
                return;
            }
        };

        for packet in &packets {
            if let Err(e) = mount.write_packet(packet) {
                tracing::debug!(stream = %self.name, error = %e, "forward abandoned");
                return;
            }
        }
    }

    /// Drop the current publication and unpublish its mount.
    fn retire(&self) {
        let previous = std::mem::replace(&mut *self.publication.lock(), Publication::Uninitialized);
        if let Publication::Ready { mount, .. } = previous {
            self.mounts.unpublish(&mount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 4] = [0x67, 0x42, 0x00, 0x1e];
    const PPS: [u8; 2] = [0x68, 0xce];

    /// Ingest whose connections always fail.
    struct Unreachable;

    impl Ingest for Unreachable {
        fn open(&self, _url: &str, _cancel: CancellationToken) -> Result<IngestSession> {
            Err(Error::Playlist("unreachable".into()))
        }
    }

    fn unit(pts: i64, nalus: &[&[u8]]) -> AccessUnit {
        AccessUnit {
            track: 256,
            pts,
            dts: pts,
            nalus: nalus.iter().map(|n| n.to_vec()).collect(),
        }
    }

    fn bridge(mounts: MountRegistry, ingest: Arc<dyn Ingest>) -> Bridge {
        Bridge::new(
            "cam1",
            "http://origin/cam1.m3u8",
            mounts,
            ingest,
            BridgeOptions {
                reconnect_delay: Duration::from_secs(5),
                metrics_interval: None,
            },
        )
    }

    fn shared() -> Arc<Shared> {
        bridge(MountRegistry::new(), Arc::new(Unreachable)).shared.clone()
    }

    #[test]
    fn access_units_without_parameter_sets_are_dropped() {
        let shared = shared();
        shared.on_access_unit(&unit(0, &[&[0x65, 1, 2]]));
        shared.on_access_unit(&unit(3000, &[&SPS, &[0x65, 1, 2]]));

        assert!(matches!(*shared.publication.lock(), Publication::Uninitialized));
        assert!(shared.mounts.is_empty());
    }

    #[test]
    fn negotiates_once_with_first_parameter_sets() {
        let shared = shared();
        shared.on_access_unit(&unit(0, &[&SPS, &PPS, &[0x67, 0x4d], &[0x65, 1]]));

        let mount = shared.mounts.get("cam1").unwrap();
        assert_eq!(mount.descriptor().sps, SPS.to_vec());
        assert_eq!(mount.descriptor().pps, PPS.to_vec());
        assert!(mount.packets_written() > 0);

        shared.on_access_unit(&unit(3000, &[&[0x67, 0x64, 0, 0x28], &[0x68, 0xee], &[0x41, 1]]));
        let same = shared.mounts.get("cam1").unwrap();
        assert!(Arc::ptr_eq(&mount, &same));
        assert_eq!(same.descriptor().sps, SPS.to_vec());
    }

    #[test]
    fn encode_failure_drops_only_that_unit() {
        let shared = shared();
        shared.on_access_unit(&unit(0, &[&SPS, &PPS]));
        let mount = shared.mounts.get("cam1").unwrap();
        let written = mount.packets_written();

        let empty: &[u8] = &[];
        shared.forward(&unit(3000, &[empty]));
        assert_eq!(mount.packets_written(), written);

        shared.forward(&unit(6000, &[&[0x41, 1]]));
        assert_eq!(mount.packets_written(), written + 1);
        assert_eq!(mount.last_rtp().map(|(_, ts)| ts), Some(6000));
    }

    #[test]
    fn forward_without_publication_is_noop() {
        let shared = shared();
        shared.forward(&unit(0, &[&[0x65, 1]]));
        assert!(shared.mounts.is_empty());
    }

    #[test]
    fn forward_to_closed_mount_is_silent() {
        let shared = shared();
        shared.on_access_unit(&unit(0, &[&SPS, &PPS]));
        let mount = shared.mounts.get("cam1").unwrap();
        shared.mounts.close_all();

        let big = vec![0x65; 4000];
        shared.forward(&unit(3000, &[&big]));
        assert!(mount.is_closed());
        assert_eq!(mount.packets_written(), 1);
    }

    #[test]
    fn retire_unpublishes() {
        let shared = shared();
        shared.on_access_unit(&unit(0, &[&SPS, &PPS]));
        let mount = shared.mounts.get("cam1").unwrap();

        shared.retire();
        assert!(mount.is_closed());
        assert!(shared.mounts.get("cam1").is_none());
        assert!(matches!(*shared.publication.lock(), Publication::Uninitialized));
        shared.retire();
    }
}
