//! UDP multicast transport.
//!
//! Every node binds the group port on all interfaces and joins the group;
//! frames are sent as single datagrams to the group address. Multicast
//! loopback stays on, so a node hears its own frames and the channel filters
//! them by sender.

use super::{Result, Transport, TransportError};
use crate::message::MAX_FRAME_SIZE;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;

/// Default multicast group and port.
pub const DEFAULT_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(239, 255, 0, 1), 7400);

pub struct UdpTransport {
    socket: UdpSocket,
    group: SocketAddrV4,
    /// Receive buffer sized for the largest frame, reused across datagrams
    scratch: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl UdpTransport {
    /// Bind the group port and join the multicast group.
    pub async fn bind(group: SocketAddrV4) -> Result<Self> {
        if !group.ip().is_multicast() {
            return Err(TransportError::BindFailed(format!(
                "{} is not a multicast address",
                group.ip()
            )));
        }

        let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, group.port()))
            .map_err(|e| TransportError::BindFailed(format!("port {}: {}", group.port(), e)))?;
        socket
            .join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| TransportError::BindFailed(format!("join {}: {}", group.ip(), e)))?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket)?;
        tracing::debug!("Joined multicast group {}", group);

        Ok(Self {
            socket,
            group,
            scratch: Mutex::new(vec![0u8; MAX_FRAME_SIZE]),
            closed: AtomicBool::new(false),
        })
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    /// Copy out one datagram if the socket has one queued.
    fn read_ready(&self) -> Result<Option<Vec<u8>>> {
        let mut scratch = self.scratch.lock().unwrap_or_else(|e| e.into_inner());
        match self.socket.try_recv_from(&mut scratch) {
            Ok((len, _src)) => Ok(Some(scratch[..len].to_vec())),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(TransportError::ReceiveFailed(e.to_string())),
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn describe(&self) -> String {
        format!("udp multicast {}", self.group)
    }

    async fn broadcast(&self, frame: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::SendFailed(format!(
                "frame of {} bytes exceeds {} byte limit",
                frame.len(),
                MAX_FRAME_SIZE
            )));
        }
        self.socket
            .send_to(frame, self.group)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            self.socket
                .readable()
                .await
                .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
            // Readiness can be spurious; try_recv_from then clears it
            if let Some(frame) = self.read_ready()? {
                return Ok(frame);
            }
        }
    }

    fn try_recv(&self) -> Result<Option<Vec<u8>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.read_ready()
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Best effort; the socket itself is released on drop
            if let Err(e) = self.socket.leave_multicast_v4(*self.group.ip(), Ipv4Addr::UNSPECIFIED) {
                tracing::debug!("Failed to leave multicast group {}: {}", self.group, e);
            }
        }
        Ok(())
    }
}
