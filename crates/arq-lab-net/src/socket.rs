//! Async UDP socket for protocol datagrams.
//!
//! [`DatagramSocket`] is a thin wrapper around `tokio::net::UdpSocket`. It
//! moves raw datagrams only; decoding and validation belong to the endpoints,
//! so a malformed datagram reaches the protocol instead of failing here.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::net::UdpSocket;

/// Largest datagram accepted from the network.
pub const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind UDP socket on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("socket I/O error")]
    Io(#[from] std::io::Error),
    #[error("endpoint task failed")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug)]
pub struct DatagramSocket {
    /// Address this socket is bound to (filled in after the OS assigns a port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl DatagramSocket {
    /// Bind to `addr`; port 0 lets the OS choose.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let inner = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    pub async fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> Result<(), TransportError> {
        self.inner.send_to(datagram, dest).await?;
        Ok(())
    }

    /// Wait for the next datagram. Returns `(bytes, source_address)`.
    pub async fn recv_from(&self) -> Result<(Bytes, SocketAddr), TransportError> {
        let mut buf = BytesMut::zeroed(MAX_DATAGRAM);
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((buf.freeze(), addr))
    }
}
