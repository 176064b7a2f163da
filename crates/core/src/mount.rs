use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::codec::CodecDescriptor;
use crate::error::{Error, Result};
use crate::media::rtp;
use crate::session::SessionManager;
use crate::transport::UdpTransport;

/// Outbound path for RTP packets: the session table plus the UDP socket.
///
/// A registry without delivery (unit tests, or before the server starts)
/// still accepts packets but sends them nowhere.
#[derive(Clone)]
pub struct Delivery {
    pub sessions: SessionManager,
    pub udp: Arc<UdpTransport>,
}

/// A published stream endpoint (e.g. `/cam1`).
///
/// Created by [`MountRegistry::publish`] from a negotiated
/// [`CodecDescriptor`]; the returned `Arc<Mount>` is the handle the bridge
/// forwards packets through. Once closed, a mount rejects every write.
pub struct Mount {
    path: String,
    descriptor: Arc<CodecDescriptor>,
    session_ids: RwLock<Vec<String>>,
    closed: AtomicBool,
    packets_written: AtomicU64,
    /// `(sequence, timestamp)` of the last packet written, for `RTP-Info`.
    last_rtp: Mutex<Option<(u16, u32)>>,
    delivery: Option<Delivery>,
}

impl Mount {
    fn new(path: &str, descriptor: Arc<CodecDescriptor>, delivery: Option<Delivery>) -> Self {
        Self {
            path: path.to_string(),
            descriptor,
            session_ids: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            packets_written: AtomicU64::new(0),
            last_rtp: Mutex::new(None),
            delivery,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Codec parameters this mount was published with.
    pub fn descriptor(&self) -> &CodecDescriptor {
        &self.descriptor
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of packets accepted since publication.
    pub fn packets_written(&self) -> u64 {
        self.packets_written.load(Ordering::Relaxed)
    }

    /// `(sequence, timestamp)` of the most recent packet, if any.
    pub fn last_rtp(&self) -> Option<(u16, u32)> {
        *self.last_rtp.lock()
    }

    /// Forward one RTP packet to every subscribed session in PLAY state.
    ///
    /// Fails only when the mount has been closed. Per-client send errors are
    /// logged and skipped: one unreachable viewer must not stall the others.
    pub fn write_packet(&self, packet: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::MountClosed(self.path.clone()));
        }

        self.packets_written.fetch_add(1, Ordering::Relaxed);
        if let Some(seq_ts) = rtp::parse_sequence_and_timestamp(packet) {
            *self.last_rtp.lock() = Some(seq_ts);
        }

        let Some(delivery) = &self.delivery else {
            return Ok(());
        };

        for id in self.session_ids.read().iter() {
            let Some(session) = delivery.sessions.get_session(id) else {
                continue;
            };
            if !session.is_playing() {
                continue;
            }
            if let Some(transport) = session.get_transport()
                && let Err(e) = delivery.udp.send_to(packet, transport.client_addr)
            {
                tracing::trace!(mount = %self.path, session_id = %id, error = %e, "RTP send failed");
            }
        }

        Ok(())
    }

    /// Subscribe a session to this mount (called during SETUP).
    pub fn subscribe(&self, session_id: &str) {
        let mut ids = self.session_ids.write();
        if !ids.iter().any(|id| id == session_id) {
            ids.push(session_id.to_string());
            tracing::debug!(mount = %self.path, session_id, "session subscribed");
        }
    }

    /// Unsubscribe a session from this mount (called during TEARDOWN or disconnect).
    pub fn unsubscribe(&self, session_id: &str) {
        let mut ids = self.session_ids.write();
        if let Some(pos) = ids.iter().position(|id| id == session_id) {
            ids.swap_remove(pos);
            tracing::debug!(mount = %self.path, session_id, "session unsubscribed");
        }
    }

    /// Returns the list of subscribed session IDs.
    pub fn subscribed_session_ids(&self) -> Vec<String> {
        self.session_ids.read().clone()
    }

    /// Mark closed and drop the RTSP sessions watching it. Idempotent.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids = std::mem::take(&mut *self.session_ids.write());
        if let Some(delivery) = &self.delivery
            && !ids.is_empty()
        {
            let removed = delivery.sessions.remove_sessions(&ids);
            tracing::debug!(mount = %self.path, removed, "sessions dropped with mount");
        }
        tracing::info!(path = %self.path, "mount closed");
    }
}

/// Registry of published mounts, keyed by path.
///
/// Holds at most one live mount per path: [`publish`](Self::publish) closes
/// the previous mount before installing the new one, under the same write
/// lock, so two publishers racing on one path can never both be live.
#[derive(Clone)]
pub struct MountRegistry {
    mounts: Arc<RwLock<HashMap<String, Arc<Mount>>>>,
    delivery: Arc<RwLock<Option<Delivery>>>,
}

impl MountRegistry {
    /// A registry whose mounts deliver nowhere until
    /// [`attach_delivery`](Self::attach_delivery) is called.
    pub fn new() -> Self {
        Self {
            mounts: Arc::new(RwLock::new(HashMap::new())),
            delivery: Arc::new(RwLock::new(None)),
        }
    }

    /// Route packets of mounts published from now on to RTSP sessions.
    pub fn attach_delivery(&self, delivery: Delivery) {
        *self.delivery.write() = Some(delivery);
    }

    /// Register a mount for `path`, closing any mount already there.
    ///
    /// `path` is a stream name (`cam1`) or a path (`/cam1`); both refer to
    /// the same mount.
    pub fn publish(&self, path: &str, descriptor: Arc<CodecDescriptor>) -> Arc<Mount> {
        let key = normalize_path(path);
        let mount = Arc::new(Mount::new(&key, descriptor, self.delivery.read().clone()));

        let mut mounts = self.mounts.write();
        if let Some(old) = mounts.remove(&key) {
            old.close();
            tracing::info!(path = %key, "replaced existing stream");
        }
        mounts.insert(key.clone(), mount.clone());
        tracing::info!(path = %key, "stream registered");

        mount
    }

    /// Close and remove `mount` if it is still the live mount at its path.
    ///
    /// Returns `false` when the path has since been republished (the newer
    /// mount is left untouched) or was never registered. The given handle is
    /// closed either way.
    pub fn unpublish(&self, mount: &Arc<Mount>) -> bool {
        let mut mounts = self.mounts.write();
        let current = mounts
            .get(mount.path())
            .is_some_and(|m| Arc::ptr_eq(m, mount));
        if current {
            mounts.remove(mount.path());
        }
        drop(mounts);

        mount.close();
        current
    }

    /// Look up a live mount by path (leading `/` optional).
    pub fn get(&self, path: &str) -> Option<Arc<Mount>> {
        self.mounts.read().get(&normalize_path(path)).cloned()
    }

    /// Resolve a mount from an RTSP request URI.
    pub fn resolve_from_uri(&self, uri: &str) -> Option<Arc<Mount>> {
        extract_mount_path(uri).and_then(|path| self.get(path))
    }

    /// Paths of every live mount.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.mounts.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.mounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.read().is_empty()
    }

    /// Unsubscribe a session from all mounts (used during disconnect cleanup).
    pub fn unsubscribe_all(&self, session_id: &str) {
        let mounts = self.mounts.read();
        for mount in mounts.values() {
            mount.unsubscribe(session_id);
        }
    }

    /// Close and remove every mount (server shutdown).
    pub fn close_all(&self) {
        let drained: Vec<Arc<Mount>> = self.mounts.write().drain().map(|(_, m)| m).collect();
        for mount in drained {
            mount.close();
        }
    }
}

impl Default for MountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}

/// Extract the mount path from an RTSP URI.
///
/// `rtsp://host:8554/cam1/track1` → `/cam1`
/// `rtsp://host:8554/cam1`        → `/cam1`
/// `rtsp://host:8554/`            → `/`
/// `rtsp://host:8554`             → `None`
/// `*`                            → `None`
pub fn extract_mount_path(uri: &str) -> Option<&str> {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        &after[after.find('/')?..]
    } else if uri.starts_with('/') {
        uri
    } else {
        return None;
    };

    // Drop any query string, then the track suffix: /cam1/track1 → /cam1
    let path = path.split('?').next().unwrap_or(path);
    let path = match path.rfind("/track") {
        Some(pos) if pos > 0 => &path[..pos],
        _ => path,
    };
    Some(path.trim_end_matches('/')).map(|p| if p.is_empty() { "/" } else { p })
}
