use crate::net::address::Address;
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use crate::net::transport::Transport;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Datagram transport over a non-blocking UDP socket. Broadcasts go to the limited broadcast
/// address on the configured port.
pub struct UdpTransport {
    bind: SocketAddr,
    broadcast_port: u16,
    socket: Option<UdpSocket>,
    poll: Poll,
    events: Events,
}

impl UdpTransport {
    const SOCKET_TOKEN: Token = Token(0);

    #[inline]
    pub fn new(bind: SocketAddr, broadcast_port: u16) -> NetworkResult<UdpTransport> {
        Ok(UdpTransport {
            bind,
            broadcast_port,
            socket: None,
            poll: Poll::new()?,
            events: Events::with_capacity(64),
        })
    }

    /// Blocks for at most `timeout` until a datagram is ready to be received. Meant to be used by
    /// the outer loop in place of sleeping between ticks.
    #[inline]
    pub fn wait(&mut self, timeout: Duration) -> NetworkResult<bool> {
        self.poll.poll(&mut self.events, Some(timeout))?;
        Ok(!self.events.is_empty())
    }

    #[inline]
    fn socket(&self) -> NetworkResult<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or(NetworkError::Fatal(ErrorType::NotOpen))
    }
}

impl Transport for UdpTransport {
    fn open(&mut self) -> NetworkResult<()> {
        if self.socket.is_some() {
            return Err(NetworkError::Fatal(ErrorType::AlreadyConnected));
        }

        let mut socket = UdpSocket::bind(self.bind)?;
        socket.set_broadcast(true)?;

        self.poll
            .registry()
            .register(&mut socket, Self::SOCKET_TOKEN, Interest::READABLE)?;

        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            // The socket is going away either way
            drop(self.poll.registry().deregister(&mut socket));
        }
    }

    #[inline]
    fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    #[inline]
    fn local_address(&self) -> Address {
        self.socket
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
            .unwrap_or(self.bind)
            .into()
    }

    fn send_to(&mut self, address: &Address, data: &[u8]) -> NetworkResult<()> {
        match address {
            Address::Socket(addr) => {
                self.socket()?.send_to(data, *addr)?;
                Ok(())
            }
            Address::Broadcast => self.broadcast(data),
            Address::Node(_) => Err(NetworkError::Fatal(ErrorType::UnsupportedAddress)),
        }
    }

    fn broadcast(&mut self, data: &[u8]) -> NetworkResult<()> {
        let target = SocketAddr::new(Ipv4Addr::BROADCAST.into(), self.broadcast_port);
        self.socket()?.send_to(data, target)?;
        Ok(())
    }

    fn recv(&mut self, buffer: &mut [u8]) -> NetworkResult<(Address, usize)> {
        let (size, source) = self.socket()?.recv_from(buffer)?;
        Ok((source.into(), size))
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
