use std::net::SocketAddr;

/// Negotiated RTP/RTCP transport parameters for a session (RFC 2326 §12.39).
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP;unicast;client_port=8000-8001
///
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001
/// ```
///
/// The bridge sends RTP to `client_addr` (`client_ip:client_rtp_port`).
#[derive(Debug, Clone)]
pub struct Transport {
    /// Client's RTP receive port.
    pub client_rtp_port: u16,
    /// Client's RTCP receive port (typically `client_rtp_port + 1`).
    pub client_rtcp_port: u16,
    /// Server's RTP port advertised to the client.
    pub server_rtp_port: u16,
    /// Server's RTCP port advertised to the client.
    pub server_rtcp_port: u16,
    /// Full socket address for RTP delivery.
    pub client_addr: SocketAddr,
}

impl Transport {
    /// Value of the `Transport` header in the SETUP response.
    pub fn response_header(&self) -> String {
        format!(
            "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
            self.client_rtp_port, self.client_rtcp_port, self.server_rtp_port, self.server_rtcp_port
        )
    }
}

/// Client-side transport request parsed from the RTSP `Transport` header.
///
/// Only `RTP/AVP` over UDP unicast is served; an interleaved TCP request is
/// recognised so the handler can answer 461 instead of 400.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    /// Client's requested RTP port.
    pub client_rtp_port: u16,
    /// Client's requested RTCP port.
    pub client_rtcp_port: u16,
}

impl TransportHeader {
    /// Parse the `Transport` header value (RFC 2326 §12.39).
    ///
    /// Takes the first transport spec of a comma-separated list and looks
    /// for `client_port=RTP[-RTCP]` among its parameters. A missing RTCP
    /// port defaults to RTP + 1.
    ///
    /// ```
    /// use hls2rtsp::session::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(th.client_rtp_port, 8000);
    /// assert_eq!(th.client_rtcp_port, 8001);
    ///
    /// assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        let spec = header.split(',').next()?;
        let ports = spec
            .split(';')
            .map(str::trim)
            .find_map(|part| part.strip_prefix("client_port="))?;

        let (rtp, rtcp) = match ports.split_once('-') {
            Some((rtp, rtcp)) => {
                let rtp: u16 = rtp.trim().parse().ok()?;
                (rtp, rtcp.trim().parse().ok()?)
            }
            None => {
                let rtp: u16 = ports.trim().parse().ok()?;
                (rtp, rtp.checked_add(1)?)
            }
        };

        Some(TransportHeader {
            client_rtp_port: rtp,
            client_rtcp_port: rtcp,
        })
    }

    /// Whether the client asked for RTP interleaved on the RTSP connection.
    pub fn is_interleaved(header: &str) -> bool {
        header.contains("RTP/AVP/TCP") || header.contains("interleaved=")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_transport() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        assert_eq!(th.client_rtp_port, 5000);
        assert_eq!(th.client_rtcp_port, 5001);
    }

    #[test]
    fn parse_single_port() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=6970").unwrap();
        assert_eq!((th.client_rtp_port, th.client_rtcp_port), (6970, 6971));
    }

    #[test]
    fn parse_first_of_several_specs() {
        let th = TransportHeader::parse(
            "RTP/AVP;unicast;client_port=7000-7001,RTP/AVP/TCP;interleaved=0-1",
        )
        .unwrap();
        assert_eq!(th.client_rtp_port, 7000);
    }

    #[test]
    fn parse_no_client_port() {
        assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
        assert!(TransportHeader::parse("RTP/AVP;client_port=abc-def").is_none());
    }

    #[test]
    fn detects_interleaved() {
        assert!(TransportHeader::is_interleaved("RTP/AVP/TCP;unicast;interleaved=0-1"));
        assert!(!TransportHeader::is_interleaved("RTP/AVP;unicast;client_port=5000-5001"));
    }
}
