use super::Transport;
use crate::{config::DatagramSettings, error::TelemetryError, events::Record};
use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    sync::atomic::{AtomicBool, Ordering},
};

/// Fire-and-forget transport: one UDP packet per record.
///
/// The socket is bound and set non-blocking at construction, so
/// [`Transport::connect`] has nothing to do and a send is a single
/// `sendto` that never waits for the collector. Payloads are always the
/// `{"kind": ..., "record": ...}` envelope so the collector can tell metric
/// records from log records.
#[derive(Debug)]
pub struct UnreliableDatagramTransport {
    socket: UdpSocket,
    destination: SocketAddr,
    server_name: String,
    closed: AtomicBool,
}

impl UnreliableDatagramTransport {
    /// Resolves the collector address and binds a local socket of the same family.
    ///
    /// IPv4 addresses are preferred when the host resolves to both families.
    ///
    /// # Errors
    /// Returns an error if the host does not resolve or the socket cannot be bound.
    pub fn new(settings: &DatagramSettings) -> Result<Self, TelemetryError> {
        let destination = resolve(&settings.host, settings.port)?;
        let local: SocketAddr = if destination.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            destination,
            server_name: settings.server_name.clone(),
            closed: AtomicBool::new(false),
        })
    }

    pub const fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// # Errors
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, TelemetryError> {
        self.socket.local_addr().map_err(Into::into)
    }

    fn send_packet(&self, payload: &[u8]) -> Result<(), TelemetryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TelemetryError::Closed);
        }
        self.socket
            .send_to(payload, self.destination)
            .map(|_| ())
            .map_err(|e| {
                log::debug!("datagram to {} dropped: {e}", self.destination);
                TelemetryError::from(e)
            })
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, TelemetryError> {
    let candidates: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    candidates
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| {
            TelemetryError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address found for {host}:{port}"),
            ))
        })
}

impl Transport for UnreliableDatagramTransport {
    fn name(&self) -> &'static str {
        "datagram"
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn connect(&self) -> Result<(), TelemetryError> {
        Ok(())
    }

    fn frame(&self, record: &Record) -> Result<Vec<u8>, TelemetryError> {
        record.to_envelope()
    }

    fn send(&self, payload: &[u8]) -> Result<(), TelemetryError> {
        self.send_packet(payload)
    }

    fn close(&self) -> Result<(), TelemetryError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(feature = "tokio")]
#[async_trait::async_trait]
impl super::AsyncTransport for UnreliableDatagramTransport {
    fn name(&self) -> &'static str {
        "datagram"
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }

    async fn connect(&self) -> Result<(), TelemetryError> {
        Ok(())
    }

    fn frame(&self, record: &Record) -> Result<Vec<u8>, TelemetryError> {
        record.to_envelope()
    }

    // The socket is non-blocking, so this never suspends.
    async fn send(&self, payload: &[u8]) -> Result<(), TelemetryError> {
        self.send_packet(payload)
    }

    async fn close(&self) -> Result<(), TelemetryError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
