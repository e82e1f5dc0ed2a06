//! Best-effort TCP transport module implementation. Every message travels
//! over a fresh connection (connect, write one frame, close); sends may be
//! dropped on purpose to simulate a lossy network.

use std::fmt;
use std::net::SocketAddr;

use crate::client::ClientId;
use crate::cluster::ClusterConfig;
use crate::server::ReplicaId;
use crate::utils::{Bitmap, ReplogError};

use async_trait::async_trait;

use bytes::BytesMut;

use rand::prelude::*;

use serde::{de::DeserializeOwned, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Largest frame accepted from the wire; anything longer is garbage.
const MAX_FRAME_LEN: u64 = 16 << 20;

/// Timeout for establishing an outbound connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for reading the single frame of an inbound connection.
const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Destination of a point-to-point send.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Target {
    Replica(ReplicaId),
    Client(ClientId),
}

/// Message transport capability used by the protocol core. Sending is
/// fire-and-forget; no delivery confirmation is ever given.
#[async_trait]
pub trait Transport<Msg>: Send
where
    Msg: Clone + Send + 'static,
{
    /// Sends a message to a single destination, best-effort.
    fn send_msg(&mut self, msg: Msg, target: Target) -> Result<(), ReplogError>;

    /// Sends a message to every replica whose bit is set in `targets`. A
    /// failure towards one peer never aborts the fan-out to the rest.
    fn bcast_msg(
        &mut self,
        msg: Msg,
        targets: &Bitmap,
    ) -> Result<(), ReplogError> {
        for (peer, flag) in targets.iter() {
            if !flag {
                continue;
            }
            if let Err(e) = self.send_msg(msg.clone(), Target::Replica(peer)) {
                pf_debug!("error sending to replica {}: {}", peer, e);
            }
        }
        Ok(())
    }

    /// Waits for the next inbound message.
    async fn recv_msg(&mut self) -> Result<Msg, ReplogError>;
}

/// Writes a length-prefixed message frame to given connection.
pub(crate) async fn write_msg<Msg, Conn>(
    conn_write: &mut Conn,
    msg: &Msg,
) -> Result<(), ReplogError>
where
    Msg: Serialize,
    Conn: AsyncWrite + Unpin,
{
    let msg_bytes = encode_to_vec(msg)?;
    conn_write.write_u64(msg_bytes.len() as u64).await?; // send length first
    conn_write.write_all(&msg_bytes[..]).await?;
    Ok(())
}

/// Reads a length-prefixed message frame from given connection.
pub(crate) async fn read_msg<Msg, Conn>(
    conn_read: &mut Conn,
) -> Result<Msg, ReplogError>
where
    Msg: DeserializeOwned,
    Conn: AsyncRead + Unpin,
{
    let msg_len = conn_read.read_u64().await?; // receive length first
    if msg_len > MAX_FRAME_LEN {
        return Err(ReplogError::msg(format!(
            "frame length {} exceeds limit",
            msg_len
        )));
    }
    let mut msg_buf = BytesMut::zeroed(msg_len as usize);
    conn_read.read_exact(&mut msg_buf[..]).await?;
    let msg = decode_from_slice(&msg_buf)?;
    Ok(msg)
}

/// TCP transport hub shared by replicas and clients.
pub struct TransportHub<Msg> {
    /// Replica listen addresses, indexed by replica ID.
    replicas: Vec<SocketAddr>,

    /// Client listen addresses, indexed by client ID.
    clients: Vec<SocketAddr>,

    /// Probability of silently dropping a send.
    loss_rate: f64,

    /// Sender side of the send channel.
    tx_send: mpsc::UnboundedSender<(SocketAddr, Msg)>,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<Msg>,

    /// Join handle of the connection acceptor thread.
    acceptor_handle: JoinHandle<()>,

    /// Join handle of the message sender thread.
    sender_handle: JoinHandle<()>,
}

// TransportHub public API implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Creates a new transport hub listening on `bind_addr`. Spawns the
    /// acceptor thread and the sender thread.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
        config: &ClusterConfig,
    ) -> Result<Self, ReplogError> {
        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(bind_addr)?;
        let listener = socket.listen(1024)?;
        pf_debug!("transport listening on '{}'", bind_addr);

        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let (tx_recv, rx_recv) = mpsc::unbounded_channel();

        let acceptor_handle =
            tokio::spawn(Self::acceptor_thread(listener, tx_recv));
        let sender_handle = tokio::spawn(Self::sender_thread(rx_send));

        Ok(TransportHub {
            replicas: config.replicas.clone(),
            clients: config.clients.clone(),
            loss_rate: config.loss_rate,
            tx_send,
            rx_recv,
            acceptor_handle,
            sender_handle,
        })
    }

    /// Resolves a target to its listen address.
    fn target_addr(&self, target: Target) -> Option<SocketAddr> {
        match target {
            Target::Replica(id) => self.replicas.get(id as usize).copied(),
            Target::Client(id) => usize::try_from(id)
                .ok()
                .and_then(|idx| self.clients.get(idx).copied()),
        }
    }
}

#[async_trait]
impl<Msg> Transport<Msg> for TransportHub<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    fn send_msg(&mut self, msg: Msg, target: Target) -> Result<(), ReplogError> {
        let addr = match self.target_addr(target) {
            Some(addr) => addr,
            None => return logged_err!("unknown send target {:?}", target),
        };

        if self.loss_rate > 0.0 && thread_rng().gen::<f64>() < self.loss_rate
        {
            pf_trace!("dropped -> {:?} msg {:?}", target, msg);
            return Ok(());
        }

        self.tx_send.send((addr, msg))?;
        Ok(())
    }

    async fn recv_msg(&mut self) -> Result<Msg, ReplogError> {
        match self.rx_recv.recv().await {
            Some(msg) => Ok(msg),
            None => logged_err!("recv channel has been closed"),
        }
    }
}

// TransportHub acceptor & sender thread implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Connection acceptor thread function. Each accepted connection carries
    /// exactly one message frame.
    async fn acceptor_thread(
        listener: TcpListener,
        tx_recv: mpsc::UnboundedSender<Msg>,
    ) {
        pf_debug!("acceptor thread spawned");

        while !tx_recv.is_closed() {
            let (mut stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    pf_warn!("error accepting connection: {}", e);
                    continue;
                }
            };

            let tx_recv = tx_recv.clone();
            tokio::spawn(async move {
                match time::timeout(READ_TIMEOUT, read_msg::<Msg, _>(&mut stream))
                    .await
                {
                    Ok(Ok(msg)) => {
                        pf_trace!("recv <- {} msg {:?}", addr, msg);
                        if let Err(e) = tx_recv.send(msg) {
                            pf_error!("error sending to tx_recv: {}", e);
                        }
                    }
                    Ok(Err(e)) => {
                        pf_debug!("dropped connection from {}: {}", addr, e);
                    }
                    Err(_) => {
                        pf_debug!("read from {} timed out", addr);
                    }
                }
            });
        }

        pf_debug!("acceptor thread exitted");
    }

    /// Delivers one message over a fresh connection.
    async fn deliver(addr: SocketAddr, msg: &Msg) -> Result<(), ReplogError> {
        let mut stream =
            time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await??;
        write_msg(&mut stream, msg).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Message sender thread function. Every send runs in its own task so
    /// that an unreachable peer never stalls the others.
    async fn sender_thread(
        mut rx_send: mpsc::UnboundedReceiver<(SocketAddr, Msg)>,
    ) {
        pf_debug!("sender thread spawned");

        while let Some((addr, msg)) = rx_send.recv().await {
            tokio::spawn(async move {
                match Self::deliver(addr, &msg).await {
                    Ok(()) => pf_trace!("sent -> {} msg {:?}", addr, msg),
                    Err(e) => pf_debug!("error sending to {}: {}", addr, e),
                }
            });
        }

        // channel gets closed and no messages remain
        pf_debug!("sender thread exitted");
    }
}

impl<Msg> Drop for TransportHub<Msg> {
    fn drop(&mut self) {
        self.acceptor_handle.abort();
        self.sender_handle.abort();
    }
}
