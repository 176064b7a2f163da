use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::auth::Credentials;
use crate::error::{Error, Result};
use crate::mount::{Delivery, MountRegistry};
use crate::session::SessionManager;
use crate::transport::UdpTransport;
use crate::transport::tcp;

/// Server-level configuration used by protocol handlers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, host is inferred from request URI/client address.
    pub public_host: Option<String>,
    /// Credentials required for DESCRIBE and SETUP; `None` disables auth.
    pub auth: Option<Credentials>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_host: None,
            auth: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "hls2rtsp".to_string(),
        }
    }
}

/// The RTSP publish endpoint.
///
/// Owns the mount registry bridges publish into, the RTSP session table,
/// the outbound RTP socket and the TCP accept thread. Clients can only
/// DESCRIBE/SETUP paths that currently have a live mount.
pub struct Server {
    session_manager: SessionManager,
    mounts: MountRegistry,
    running: Arc<AtomicBool>,
    bind_addr: String,
    local_addr: Option<SocketAddr>,
    accept_thread: Option<JoinHandle<()>>,
    config: Arc<ServerConfig>,
}

impl Server {
    pub fn new(bind_addr: &str) -> Self {
        Self::with_config(bind_addr, ServerConfig::default())
    }

    /// Create a server with custom auth/SDP configuration.
    pub fn with_config(bind_addr: &str, config: ServerConfig) -> Self {
        Self {
            session_manager: SessionManager::new(),
            mounts: MountRegistry::new(),
            running: Arc::new(AtomicBool::new(false)),
            bind_addr: bind_addr.to_string(),
            local_addr: None,
            accept_thread: None,
            config: Arc::new(config),
        }
    }

    /// Bind the RTSP listener and RTP socket and start accepting clients.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let udp = UdpTransport::bind()?;
        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;
        self.local_addr = Some(listener.local_addr()?);

        self.mounts.attach_delivery(Delivery {
            sessions: self.session_manager.clone(),
            udp: Arc::new(udp),
        });
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let session_manager = self.session_manager.clone();
        let mounts = self.mounts.clone();
        let config = self.config.clone();

        tracing::info!(addr = %self.bind_addr, "RTSP server listening");
        if let Some(creds) = &self.config.auth {
            tracing::info!(username = %creds.username, "authentication enabled");
        }

        self.accept_thread = Some(thread::spawn(move || {
            tcp::accept_loop(listener, session_manager, mounts, config, running);
        }));

        Ok(())
    }

    /// Close every mount and stop accepting connections.
    ///
    /// Waits for the accept loop to exit. Connection threads notice the
    /// flag on their next read poll.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("server stopping");
        self.mounts.close_all();
        if let Some(handle) = self.accept_thread.take()
            && handle.join().is_err()
        {
            tracing::warn!("accept loop panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the RTSP listener is bound to (resolves port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr.ok_or(Error::NotStarted)
    }

    /// Registry bridges publish their tracks into.
    pub fn mounts(&self) -> MountRegistry {
        self.mounts.clone()
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.session_manager
    }

    /// Returns the server's protocol configuration.
    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }

    /// Clients currently in PLAY state.
    pub fn get_viewers(&self) -> Vec<Viewer> {
        self.session_manager
            .get_playing_sessions()
            .iter()
            .filter_map(|session| {
                session.get_transport().map(|transport| Viewer {
                    session_id: session.id.clone(),
                    mount_path: session.mount_path.clone(),
                    client_addr: transport.client_addr.to_string(),
                    client_rtp_port: transport.client_rtp_port,
                })
            })
            .collect()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Information about a connected viewer (client in PLAY state).
#[derive(Debug, Clone)]
pub struct Viewer {
    pub session_id: String,
    pub mount_path: String,
    pub client_addr: String,
    pub client_rtp_port: u16,
}
