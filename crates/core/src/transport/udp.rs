use std::net::{SocketAddr, UdpSocket};

use crate::error::Result;

/// UDP transport for outbound RTP packet delivery.
///
/// Binds a single ephemeral socket and sends RTP packets to client
/// addresses resolved by a [`Mount`](crate::mount::Mount).
///
/// This layer is address-only: it does not know about sessions or mounts.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind an ephemeral UDP socket for outbound RTP on all interfaces.
    pub fn bind() -> Result<Self> {
        Self::bind_addr("0.0.0.0:0")
    }

    /// Bind the outbound RTP socket to a specific local address.
    pub fn bind_addr(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        // Fan-out runs under the bridge's publication lock: never block on a full buffer.
        socket.set_nonblocking(true)?;
        tracing::debug!(local = ?socket.local_addr().ok(), "RTP socket bound");
        Ok(Self { socket })
    }

    /// Send raw bytes to a specific socket address.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(payload, addr)?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sends_datagram_to_peer() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let transport = UdpTransport::bind_addr("127.0.0.1:0").unwrap();

        let sent = transport
            .send_to(&[0x80, 0x60, 0, 1], receiver.local_addr().unwrap())
            .unwrap();
        assert_eq!(sent, 4);

        let mut buf = [0u8; 16];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x80, 0x60, 0, 1]);
        assert_eq!(from, transport.local_addr().unwrap());
    }
}
