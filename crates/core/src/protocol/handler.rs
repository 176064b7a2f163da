use crate::mount::MountRegistry;
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::server::ServerConfig;
use crate::session::transport::TransportHeader;
use crate::session::{SessionManager, SessionState, Transport};
use std::net::SocketAddr;
use std::sync::Arc;

/// Handles RTSP method requests for a single TCP connection.
///
/// Tracks which sessions were created on this connection so they
/// can be cleaned up when the connection drops.
pub struct MethodHandler {
    session_manager: SessionManager,
    mounts: MountRegistry,
    client_addr: SocketAddr,
    config: Arc<ServerConfig>,
    /// Session IDs created during this connection, for cleanup on disconnect.
    session_ids: Vec<String>,
}

impl MethodHandler {
    pub fn new(
        session_manager: SessionManager,
        client_addr: SocketAddr,
        mounts: MountRegistry,
        config: Arc<ServerConfig>,
    ) -> Self {
        MethodHandler {
            session_manager,
            mounts,
            client_addr,
            config,
            session_ids: Vec::new(),
        }
    }

    /// Returns session IDs owned by this connection (for cleanup on disconnect).
    pub fn session_ids(&self) -> &[String] {
        &self.session_ids
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        match request.method.as_str() {
            "OPTIONS" => self.handle_options(cseq),
            "DESCRIBE" => self.handle_describe(cseq, request),
            "SETUP" => self.handle_setup(cseq, request),
            "PLAY" => self.handle_play(cseq, request),
            "PAUSE" => self.handle_pause(cseq, request),
            "TEARDOWN" => self.handle_teardown(cseq, request),
            "GET_PARAMETER" => self.handle_get_parameter(cseq, request),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::new(501, "Not Implemented").add_header("CSeq", cseq)
            }
        }
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        RtspResponse::ok().add_header("CSeq", cseq).add_header(
            "Public",
            "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER",
        )
    }

    /// `true` when auth is disabled or the request carries valid credentials.
    fn authorized(&self, request: &RtspRequest) -> bool {
        match &self.config.auth {
            None => true,
            Some(creds) => creds.verify(request.authorization()),
        }
    }

    /// Parses host from an RTSP URI (e.g. rtsp://host:8554/path -> host). Falls back to client IP if invalid.
    fn host_from_uri_or_client(&self, uri: &str) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
        {
            let host = after_scheme
                .split('/')
                .next()
                .and_then(|host_port| host_port.rsplit('@').next())
                .and_then(|host_port| host_port.split(':').next())
                .unwrap_or("")
                .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.client_addr.ip().to_string()
    }

    fn handle_describe(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let uri = request.uri.as_str();
        tracing::debug!(%cseq, uri, "DESCRIBE");

        if !self.authorized(request) {
            tracing::warn!(uri, peer = %self.client_addr, "DESCRIBE rejected: bad credentials");
            return RtspResponse::unauthorized().add_header("CSeq", cseq);
        }

        let Some(mount) = self.mounts.resolve_from_uri(uri) else {
            tracing::warn!(uri, "DESCRIBE for unknown mount");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        };

        let host = self.host_from_uri_or_client(uri);
        let sdp = sdp::generate_sdp(&mount, &host, &self.config);

        let base = if uri.ends_with('/') {
            uri.to_string()
        } else {
            format!("{}/", uri)
        };

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &base)
            .with_body(sdp)
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        if !self.authorized(request) {
            tracing::warn!(uri = %request.uri, peer = %self.client_addr, "SETUP rejected: bad credentials");
            return RtspResponse::unauthorized().add_header("CSeq", cseq);
        }

        let Some(mount) = self.mounts.resolve_from_uri(&request.uri) else {
            tracing::warn!(uri = %request.uri, "SETUP for unknown mount");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        };

        let Some(transport_header) = request.get_header("Transport") else {
            tracing::warn!(%cseq, "SETUP missing Transport header");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };

        // Only RTP/AVP over UDP is served (RFC 2326 §10.12 interleaving is not).
        if TransportHeader::is_interleaved(transport_header) {
            tracing::warn!(%cseq, transport = %transport_header, "client requested TCP transport (not implemented)");
            return RtspResponse::unsupported_transport()
                .add_header("CSeq", cseq)
                .add_header(
                    "Unsupported",
                    "RTP/AVP/TCP (interleaved) not supported; use RTP/AVP (UDP), e.g. ffplay -rtsp_transport udp <url>",
                );
        }

        let Some(client_transport) = TransportHeader::parse(transport_header) else {
            tracing::warn!(%cseq, transport_header, "SETUP invalid Transport header");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };

        let (server_rtp_port, server_rtcp_port) = match self.session_manager.allocate_server_ports()
        {
            Ok(ports) => ports,
            Err(e) => {
                tracing::error!(error = %e, "failed to allocate server ports");
                return RtspResponse::internal_error().add_header("CSeq", cseq);
            }
        };

        let session = self
            .session_manager
            .create_session(&request.uri, mount.path());
        let session_id = session.id.clone();
        let client_rtp_addr =
            SocketAddr::new(self.client_addr.ip(), client_transport.client_rtp_port);

        let transport = Transport {
            client_rtp_port: client_transport.client_rtp_port,
            client_rtcp_port: client_transport.client_rtcp_port,
            server_rtp_port,
            server_rtcp_port,
            client_addr: client_rtp_addr,
        };
        let transport_response = transport.response_header();
        session.set_transport(transport);

        mount.subscribe(&session_id);
        self.session_ids.push(session_id.clone());

        tracing::info!(
            session_id,
            mount = %mount.path(),
            uri = %request.uri,
            client_rtp = %client_rtp_addr,
            server_rtp_port,
            "session created via SETUP"
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &transport_response)
            .add_header("Session", &session.session_header_value())
    }

    fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session_id) = request.session_id() else {
            tracing::warn!(%cseq, "PLAY missing Session header");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        let session = match self.session_manager.require_session(session_id) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "PLAY for unknown session");
                return RtspResponse::session_not_found().add_header("CSeq", cseq);
            }
        };

        session.set_state(SessionState::Playing);
        tracing::info!(session_id, mount = %session.mount_path, "playback started");

        let mut resp = RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
            .add_header("Range", "npt=0.000-");

        if let Some((seq, rtptime)) = self
            .mounts
            .get(&session.mount_path)
            .and_then(|mount| mount.last_rtp())
        {
            let rtp_info = format!(
                "url={};seq={};rtptime={}",
                session.uri,
                seq.wrapping_add(1),
                rtptime
            );
            resp = resp.add_header("RTP-Info", &rtp_info);
        }

        resp
    }

    fn handle_pause(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session_id) = request.session_id() else {
            tracing::warn!(%cseq, "PAUSE missing Session header");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        match self.session_manager.get_session(session_id) {
            Some(session) => {
                session.set_state(SessionState::Paused);
                tracing::info!(session_id, "session paused");
                RtspResponse::ok()
                    .add_header("CSeq", cseq)
                    .add_header("Session", &session.session_header_value())
            }
            None => {
                tracing::warn!(session_id, "PAUSE for unknown session");
                RtspResponse::session_not_found().add_header("CSeq", cseq)
            }
        }
    }

    fn handle_teardown(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session_id) = request.session_id() else {
            tracing::warn!(%cseq, "TEARDOWN missing Session header");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        match self.session_manager.remove_session(session_id) {
            Some(_) => {
                self.mounts.unsubscribe_all(session_id);
                self.session_ids.retain(|id| id != session_id);
                tracing::info!(session_id, "session terminated via TEARDOWN");
                RtspResponse::ok().add_header("CSeq", cseq)
            }
            None => {
                tracing::warn!(session_id, "TEARDOWN for unknown session");
                RtspResponse::session_not_found().add_header("CSeq", cseq)
            }
        }
    }

    /// GET_PARAMETER is used by clients (e.g. VLC) as a keepalive (RFC 2326 §10.8).
    fn handle_get_parameter(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(%cseq, "GET_PARAMETER keepalive");

        let mut resp = RtspResponse::ok().add_header("CSeq", cseq);

        if let Some(id) = request.session_id()
            && self.session_manager.get_session(id).is_some()
        {
            resp = resp.add_header("Session", id);
        }

        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::codec::CodecDescriptor;

    fn handler(auth: Option<Credentials>) -> (MethodHandler, MountRegistry, SessionManager) {
        let mounts = MountRegistry::new();
        let sessions = SessionManager::new();
        let config = ServerConfig {
            auth,
            ..ServerConfig::default()
        };
        let handler = MethodHandler::new(
            sessions.clone(),
            "10.0.0.5:40000".parse().unwrap(),
            mounts.clone(),
            Arc::new(config),
        );
        (handler, mounts, sessions)
    }

    fn publish(mounts: &MountRegistry, name: &str) {
        mounts.publish(
            name,
            Arc::new(CodecDescriptor::new(vec![0x67, 0x42, 0, 0x1e], vec![0x68, 0xce])),
        );
    }

    fn request(raw: &str) -> RtspRequest {
        RtspRequest::parse(raw).unwrap()
    }

    #[test]
    fn describe_unknown_path_is_not_found() {
        let (mut h, _, _) = handler(None);
        let resp = h.handle(&request("DESCRIBE rtsp://h:8554/missing RTSP/1.0\r\nCSeq: 2\r\n\r\n"));
        assert_eq!(resp.status_code, 404);
    }

    #[test]
    fn describe_published_path_returns_sdp() {
        let (mut h, mounts, _) = handler(None);
        publish(&mounts, "cam1");
        let resp = h.handle(&request("DESCRIBE rtsp://h:8554/cam1 RTSP/1.0\r\nCSeq: 2\r\n\r\n"));
        assert_eq!(resp.status_code, 200);
        let body = resp.body.unwrap();
        assert!(body.contains("c=IN IP4 h\r\n"));
        assert!(body.contains("a=rtpmap:96 H264/90000"));
    }

    #[test]
    fn describe_requires_credentials_when_enabled() {
        let creds = Credentials::new("user", "pass");
        let (mut h, mounts, _) = handler(Some(creds.clone()));
        publish(&mounts, "cam1");

        let resp = h.handle(&request("DESCRIBE rtsp://h/cam1 RTSP/1.0\r\nCSeq: 2\r\n\r\n"));
        assert_eq!(resp.status_code, 401);

        let raw = format!(
            "DESCRIBE rtsp://h/cam1 RTSP/1.0\r\nCSeq: 3\r\nAuthorization: {}\r\n\r\n",
            creds.header_value()
        );
        assert_eq!(h.handle(&request(&raw)).status_code, 200);
    }

    #[test]
    fn auth_is_checked_before_path_lookup() {
        let (mut h, _, _) = handler(Some(Credentials::new("user", "pass")));
        let resp = h.handle(&request("DESCRIBE rtsp://h/missing RTSP/1.0\r\nCSeq: 2\r\n\r\n"));
        assert_eq!(resp.status_code, 401);
    }

    #[test]
    fn setup_then_play_and_teardown() {
        let (mut h, mounts, sessions) = handler(None);
        publish(&mounts, "cam1");

        let resp = h.handle(&request(
            "SETUP rtsp://h/cam1/track1 RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP;unicast;client_port=6000-6001\r\n\r\n",
        ));
        assert_eq!(resp.status_code, 200);
        assert_eq!(h.session_ids().len(), 1);
        let id = h.session_ids()[0].clone();
        assert_eq!(mounts.get("cam1").unwrap().subscribed_session_ids(), vec![id.clone()]);

        let play = format!("PLAY rtsp://h/cam1 RTSP/1.0\r\nCSeq: 4\r\nSession: {}\r\n\r\n", id);
        assert_eq!(h.handle(&request(&play)).status_code, 200);
        assert!(sessions.get_session(&id).unwrap().is_playing());

        let teardown = format!("TEARDOWN rtsp://h/cam1 RTSP/1.0\r\nCSeq: 5\r\nSession: {}\r\n\r\n", id);
        assert_eq!(h.handle(&request(&teardown)).status_code, 200);
        assert!(sessions.is_empty());
        assert!(h.session_ids().is_empty());
    }

    #[test]
    fn setup_rejects_interleaved_transport() {
        let (mut h, mounts, _) = handler(None);
        publish(&mounts, "cam1");
        let resp = h.handle(&request(
            "SETUP rtsp://h/cam1/track1 RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
        ));
        assert_eq!(resp.status_code, 461);
    }

    #[test]
    fn play_unknown_session() {
        let (mut h, _, _) = handler(None);
        let resp = h.handle(&request("PLAY rtsp://h/cam1 RTSP/1.0\r\nCSeq: 4\r\nSession: NOPE\r\n\r\n"));
        assert_eq!(resp.status_code, 454);
    }
}
