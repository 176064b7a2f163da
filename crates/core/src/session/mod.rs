//! RTSP client sessions (RFC 2326 §3, §12.37).
//!
//! A session is created by SETUP on a published mount and destroyed by
//! TEARDOWN, by the client's TCP connection dropping, or by the mount it
//! watches being closed (the bridge reconnecting to its source). It tracks:
//!
//! - A unique session ID (hex string, returned in the `Session` header).
//! - The mount path it was set up against.
//! - The playback state: Ready -> Playing <-> Paused.
//! - Transport parameters (client/server UDP ports) negotiated during SETUP.
//!
//! ```text
//! SETUP          -> Ready
//! PLAY           -> Playing
//! PAUSE          -> Paused   (from Playing)
//! PLAY           -> Playing  (from Paused)
//! TEARDOWN       -> (removed)
//! TCP disconnect -> (removed, via cleanup)
//! mount closed   -> (removed)
//! ```

pub mod transport;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
pub use transport::Transport;

const SERVER_PORT_MIN: u64 = 5000;
const SERVER_PORT_MAX: u64 = 65534;

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// Client playback state (RFC 2326 §A.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session created via SETUP, not yet playing.
    Ready,
    /// RTP packets written to the mount are sent to this client.
    Playing,
    /// Delivery suspended; can resume via PLAY.
    Paused,
}

/// A single RTSP client session.
#[derive(Debug)]
pub struct Session {
    /// Unique session identifier (16-char hex string).
    pub id: String,
    /// The RTSP URI this session was created for (from the SETUP request).
    pub uri: String,
    /// Path of the mount this session receives packets from.
    pub mount_path: String,
    transport: RwLock<Option<Transport>>,
    state: RwLock<SessionState>,
    /// Session timeout in seconds (included in the `Session` response header).
    pub timeout_secs: u64,
}

impl Session {
    /// Create a new session with a random ID.
    pub fn new(uri: &str, mount_path: &str) -> Self {
        Session {
            id: format!("{:016X}", rand::random::<u64>()),
            uri: uri.to_string(),
            mount_path: mount_path.to_string(),
            transport: RwLock::new(None),
            state: RwLock::new(SessionState::Ready),
            timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
        }
    }

    /// Set the transport parameters (called during SETUP).
    pub fn set_transport(&self, transport: Transport) {
        tracing::debug!(session_id = %self.id, client_addr = %transport.client_addr, "transport configured");
        *self.transport.write() = Some(transport);
    }

    /// Returns a clone of the transport parameters, if configured.
    pub fn get_transport(&self) -> Option<Transport> {
        self.transport.read().clone()
    }

    /// Transition to a new playback state.
    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        tracing::debug!(session_id = %self.id, old_state = ?*current, new_state = ?state, "state transition");
        *current = state;
    }

    /// Returns the current playback state.
    pub fn get_state(&self) -> SessionState {
        *self.state.read()
    }

    /// Whether this session is actively receiving media.
    pub fn is_playing(&self) -> bool {
        *self.state.read() == SessionState::Playing
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"3F2A9C0D11E4B7A1;timeout=60"`
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }
}

/// Thread-safe registry of active sessions.
///
/// Looked up on every packet fan-out, so it is backed by a `RwLock` for
/// cheap concurrent reads.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    next_server_port: Arc<AtomicU64>,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_server_port: Arc::new(AtomicU64::new(SERVER_PORT_MIN)),
        }
    }

    /// Create a new session for the given URI and mount and register it.
    pub fn create_session(&self, uri: &str, mount_path: &str) -> Arc<Session> {
        let session = Arc::new(Session::new(uri, mount_path));
        let mut sessions = self.sessions.write();
        sessions.insert(session.id.clone(), session.clone());
        tracing::debug!(session_id = %session.id, uri, total_sessions = sessions.len(), "session created");
        session
    }

    /// Look up a session by ID.
    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Look up a session by ID, failing with [`Error::SessionNotFound`].
    pub fn require_session(&self, id: &str) -> Result<Arc<Session>> {
        self.get_session(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Remove and return a session by ID (used by TEARDOWN).
    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session removed");
        }
        removed
    }

    /// Remove multiple sessions at once (disconnect cleanup, mount close).
    pub fn remove_sessions(&self, ids: &[String]) -> usize {
        let mut sessions = self.sessions.write();
        let removed = ids.iter().filter(|id| sessions.remove(*id).is_some()).count();
        if removed > 0 {
            tracing::debug!(removed, remaining = sessions.len(), "batch session cleanup");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Allocate a pair of (RTP, RTCP) server ports.
    ///
    /// Ports are allocated from a monotonic counter starting at 5000 and
    /// wrap back to 5000 past 65534. Per RFC 3550 §11, RTP ports are even
    /// and RTCP = RTP + 1.
    pub fn allocate_server_ports(&self) -> Result<(u16, u16)> {
        let mut rtp = self.next_server_port.fetch_add(2, Ordering::SeqCst);

        if rtp > SERVER_PORT_MAX {
            tracing::warn!(rtp, "port range exhausted, wrapping to {SERVER_PORT_MIN}");
            self.next_server_port.store(SERVER_PORT_MIN + 2, Ordering::SeqCst);
            rtp = SERVER_PORT_MIN;
        }

        let rtp = u16::try_from(rtp).map_err(|_| Error::PortRangeExhausted)?;
        tracing::trace!(rtp_port = rtp, rtcp_port = rtp + 1, "allocated server ports");
        Ok((rtp, rtp + 1))
    }

    /// Returns all sessions currently in the [`SessionState::Playing`] state.
    pub fn get_playing_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_playing())
            .cloned()
            .collect()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
