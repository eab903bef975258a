//! Datagram listener.

use std::{io, net::SocketAddr};

use bytes::Bytes;
use pulse_error::{ErrorContext as _, GenericError};
use tokio::net::UdpSocket;
use tracing::debug;

/// A UDP listener that yields one packet per datagram.
pub struct UdpListener {
    socket: UdpSocket,
    buffer: Vec<u8>,
}

impl UdpListener {
    /// Binds a new listener to `address`.
    ///
    /// Datagrams larger than `buffer_size` bytes are truncated.
    ///
    /// # Errors
    ///
    /// If the socket cannot be bound, an error is returned.
    pub async fn bind(address: SocketAddr, buffer_size: usize) -> Result<Self, GenericError> {
        let socket = UdpSocket::bind(address)
            .await
            .with_error_context(|| format!("Failed to bind UDP listener to {}.", address))?;
        debug!(%address, buffer_size, "Bound UDP listener.");

        Ok(Self {
            socket,
            buffer: vec![0; buffer_size.max(1)],
        })
    }

    /// Returns the local address the listener is bound to.
    ///
    /// # Errors
    ///
    /// If the local address cannot be queried, an error is returned.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives the next packet.
    ///
    /// Cancel-safe: if the future is dropped before completion, no datagram is lost.
    ///
    /// # Errors
    ///
    /// If the socket returns an error, it is returned.
    pub async fn receive(&mut self) -> io::Result<(Bytes, SocketAddr)> {
        let (len, peer) = self.socket.recv_from(&mut self.buffer).await?;
        Ok((Bytes::copy_from_slice(&self.buffer[..len]), peer))
    }
}
