//! Socket setup, reader tasks and stream framing
//!
//! Datagram transports share one UDP socket for all traffic. Stream transports
//! (`tcp`, `ws`, `wss`) carry each message as a frame prefixed with its length
//! as a 4-byte big-endian integer.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsFd;
use std::sync::Arc;

use nix::sys::socket::{SockType, getsockopt, sockopt};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::messages::LinkEvent;
use crate::error::{CommError, CommResult};
use crate::net::communicator::Role;
use crate::net::uri::{Endpoint, Scheme};

/// Largest datagram we expect to receive
const MAX_DATAGRAM_SIZE: usize = 65_536;

/// The kind of socket a transport was built on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Datagram,
    Stream,
}

/// Check that a socket kind suits a scheme: datagram for `udp`, stream otherwise
pub fn check_transport(scheme: Scheme, kind: SocketKind) -> CommResult<()> {
    let expected = if scheme.is_datagram() {
        SocketKind::Datagram
    } else {
        SocketKind::Stream
    };
    if kind == expected {
        Ok(())
    } else {
        Err(CommError::transport(
            scheme.as_str(),
            format!("Unexpected socket kind {kind:?} for scheme {scheme}, expected {expected:?}"),
        ))
    }
}

/// Ask the operating system what kind of socket this is
pub fn socket_kind<S: AsFd>(socket: &S) -> io::Result<SocketKind> {
    match getsockopt(socket, sockopt::SockType)? {
        SockType::Datagram => Ok(SocketKind::Datagram),
        SockType::Stream => Ok(SocketKind::Stream),
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("Unsupported socket type {other:?}"),
        )),
    }
}

/// Write half of an open transport, owned by the communicator task
#[derive(Debug)]
pub enum Transport {
    Datagram {
        socket: Arc<UdpSocket>,
        /// Remote address of a client; packets from other hosts are dropped
        remote: Option<SocketAddr>,
    },
    Stream {
        writers: HashMap<SocketAddr, OwnedWriteHalf>,
        max_frame_size: usize,
    },
    Closed,
}

impl Transport {
    pub async fn send(&mut self, addr: SocketAddr, bytes: &[u8]) -> io::Result<()> {
        match self {
            Transport::Datagram { socket, .. } => {
                socket.send_to(bytes, addr).await?;
                Ok(())
            }
            Transport::Stream {
                writers,
                max_frame_size,
            } => {
                let writer = writers
                    .get_mut(&addr)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, format!("No connection to {addr}")))?;
                write_frame(writer, bytes, *max_frame_size).await
            }
            Transport::Closed => Err(io::Error::new(io::ErrorKind::NotConnected, "Transport is closed")),
        }
    }

    /// True if a datagram from `addr` should be processed
    pub fn accepts(&self, addr: SocketAddr) -> bool {
        match self {
            Transport::Datagram {
                remote: Some(remote), ..
            } => remote.ip() == addr.ip(),
            _ => true,
        }
    }

    /// Register an accepted connection and start reading from it
    pub fn add_peer(
        &mut self,
        addr: SocketAddr,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        link_tx: mpsc::Sender<LinkEvent>,
    ) -> Option<JoinHandle<()>> {
        match self {
            Transport::Stream {
                writers,
                max_frame_size,
            } => {
                writers.insert(addr, writer);
                Some(tokio::spawn(read_frames(addr, reader, *max_frame_size, link_tx)))
            }
            _ => None,
        }
    }

    pub fn remove_peer(&mut self, addr: SocketAddr) {
        if let Transport::Stream { writers, .. } = self {
            writers.remove(&addr);
        }
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        match self {
            Transport::Stream { writers, .. } => {
                let mut peers: Vec<SocketAddr> = writers.keys().copied().collect();
                peers.sort();
                peers
            }
            _ => Vec::new(),
        }
    }

    pub fn close(&mut self) {
        *self = Transport::Closed;
    }
}

/// An open transport plus the tasks feeding it
#[derive(Debug)]
pub struct Link {
    pub transport: Transport,
    pub local_addr: SocketAddr,
    /// Remote address for a client
    pub remote: Option<SocketAddr>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Bind (server) or connect (client) the socket an endpoint calls for
pub async fn open(
    role: Role,
    endpoint: &Endpoint,
    max_frame_size: usize,
    link_tx: mpsc::Sender<LinkEvent>,
) -> CommResult<Link> {
    let target = endpoint.socket_addr()?;
    let peer = endpoint.to_string();
    let io_err = |e: io::Error| CommError::transport(peer.clone(), e.to_string());

    if endpoint.scheme.is_datagram() {
        let (bind_addr, remote) = match role {
            Role::Server => (target, None),
            Role::Client => (unspecified_for(target), Some(target)),
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await.map_err(io_err)?);
        check_transport(endpoint.scheme, socket_kind(&*socket).map_err(io_err)?)?;
        let local_addr = socket.local_addr().map_err(io_err)?;
        info!(%endpoint, %local_addr, %role, "Datagram socket bound");

        let reader = tokio::spawn(read_datagrams(socket.clone(), link_tx));
        return Ok(Link {
            transport: Transport::Datagram { socket, remote },
            local_addr,
            remote,
            tasks: vec![reader],
        });
    }

    match role {
        Role::Server => {
            let listener = TcpListener::bind(target).await.map_err(io_err)?;
            check_transport(endpoint.scheme, socket_kind(&listener).map_err(io_err)?)?;
            let local_addr = listener.local_addr().map_err(io_err)?;
            info!(%endpoint, %local_addr, "Listening for stream connections");

            let acceptor = tokio::spawn(accept_connections(listener, link_tx));
            Ok(Link {
                transport: Transport::Stream {
                    writers: HashMap::new(),
                    max_frame_size,
                },
                local_addr,
                remote: None,
                tasks: vec![acceptor],
            })
        }
        Role::Client => {
            let stream = TcpStream::connect(target).await.map_err(io_err)?;
            check_transport(endpoint.scheme, socket_kind(&stream).map_err(io_err)?)?;
            let local_addr = stream.local_addr().map_err(io_err)?;
            info!(%endpoint, %local_addr, "Stream connection established");

            let (read_half, write_half) = stream.into_split();
            let reader = tokio::spawn(read_frames(target, read_half, max_frame_size, link_tx));
            Ok(Link {
                transport: Transport::Stream {
                    writers: HashMap::from([(target, write_half)]),
                    max_frame_size,
                },
                local_addr,
                remote: Some(target),
                tasks: vec![reader],
            })
        }
    }
}

fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

async fn read_datagrams(socket: Arc<UdpSocket>, link_tx: mpsc::Sender<LinkEvent>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, addr)) => {
                let event = LinkEvent::Data {
                    addr,
                    bytes: buf[..len].to_vec(),
                };
                if link_tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Datagram receive failed");
                let _ = link_tx
                    .send(LinkEvent::Error {
                        addr: None,
                        message: e.to_string(),
                    })
                    .await;
                break;
            }
        }
    }
    debug!("read_datagrams: exiting");
}

async fn accept_connections(listener: TcpListener, link_tx: mpsc::Sender<LinkEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!(%addr, "Accepted stream connection");
                let (reader, writer) = stream.into_split();
                if link_tx.send(LinkEvent::Connected { addr, reader, writer }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                let _ = link_tx
                    .send(LinkEvent::Error {
                        addr: None,
                        message: e.to_string(),
                    })
                    .await;
                break;
            }
        }
    }
    debug!("accept_connections: exiting");
}

async fn read_frames(
    addr: SocketAddr,
    mut reader: OwnedReadHalf,
    max_frame_size: usize,
    link_tx: mpsc::Sender<LinkEvent>,
) {
    loop {
        let event = match read_frame(&mut reader, max_frame_size).await {
            Ok(Some(bytes)) => LinkEvent::Data { addr, bytes },
            Ok(None) => {
                let _ = link_tx.send(LinkEvent::Eof { addr }).await;
                break;
            }
            Err(e) => {
                let _ = link_tx
                    .send(LinkEvent::Error {
                        addr: Some(addr),
                        message: e.to_string(),
                    })
                    .await;
                break;
            }
        };
        if link_tx.send(event).await.is_err() {
            break;
        }
    }
    debug!(%addr, "read_frames: exiting");
}

/// Read one length-prefixed frame; `None` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > max_frame_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame of {len} bytes exceeds limit of {max_frame_size}"),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, bytes: &[u8], max_frame_size: usize) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if bytes.len() > max_frame_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Frame of {} bytes exceeds limit of {max_frame_size}", bytes.len()),
        ));
    }
    let len = u32::try_from(bytes.len()).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Frame too large"))?;
    writer.write_u32(len).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_transport() {
        assert!(check_transport(Scheme::Udp, SocketKind::Datagram).is_ok());
        assert!(check_transport(Scheme::Tcp, SocketKind::Stream).is_ok());
        assert!(check_transport(Scheme::Ws, SocketKind::Stream).is_ok());

        let err = check_transport(Scheme::Udp, SocketKind::Stream).unwrap_err();
        assert!(matches!(err, CommError::Transport { .. }));
        assert!(check_transport(Scheme::Wss, SocketKind::Datagram).is_err());
    }

    #[tokio::test]
    async fn test_socket_kind_comes_from_the_socket() {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(socket_kind(&udp).unwrap(), SocketKind::Datagram);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(socket_kind(&listener).unwrap(), SocketKind::Stream);

        // A datagram socket opened for a stream scheme is refused
        let err = check_transport(Scheme::Tcp, socket_kind(&udp).unwrap()).unwrap_err();
        assert!(matches!(err, CommError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, br#"[20,"ref"]"#, 1024).await.unwrap();
        write_frame(&mut a, b"", 1024).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b, 1024).await.unwrap().unwrap(), br#"[20,"ref"]"#);
        assert_eq!(read_frame(&mut b, 1024).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut b, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        assert!(write_frame(&mut a, &[0u8; 64], 16).await.is_err());

        a.write_u32(4096).await.unwrap();
        let err = read_frame(&mut b, 1024).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_datagram_client_guard() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let transport = Transport::Datagram {
            socket,
            remote: Some("127.0.0.1:9000".parse().unwrap()),
        };
        assert!(transport.accepts("127.0.0.1:4242".parse().unwrap()));
        assert!(!transport.accepts("10.0.0.1:9000".parse().unwrap()));
    }
}
