//! Delegator-to-delegator typed-message transport.
//!
//! Conceptually every peer message travels a reliable typed channel keyed
//! by delegator rank; TCP provides the reliable byte stream underneath. A
//! peer acceptor task owns the listener and spawns one messenger task per
//! peer connection; messenger reads are cancellation-safe and writes avoid
//! the circular-blocking deadlock of two full TCP buffers. Sending is
//! possible from any task through a cloneable `TransportSender`; receiving
//! is drained from one channel by the delegator event loop.

use std::fmt;
use std::net::SocketAddr;

use bytes::BytesMut;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::common::ServerRank;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry,
    tcp_connect_with_retry, StagefsError,
};

/// Cloneable sending half of the transport; routes a message onto the
/// per-peer send channel.
pub(crate) struct TransportSender<Msg> {
    me: ServerRank,
    tx_sends: flashmap::ReadHandle<ServerRank, mpsc::UnboundedSender<Msg>>,
}

impl<Msg> Clone for TransportSender<Msg> {
    fn clone(&self) -> Self {
        TransportSender {
            me: self.me,
            tx_sends: self.tx_sends.clone(),
        }
    }
}

impl<Msg> TransportSender<Msg>
where
    Msg: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    /// Sends a message to a specified peer by sending to the send channel.
    pub(crate) fn send_msg(
        &self,
        msg: Msg,
        peer: ServerRank,
    ) -> Result<(), StagefsError> {
        let tx_sends_guard = self.tx_sends.guard();
        match tx_sends_guard.get(&peer) {
            Some(tx_send) => {
                tx_send.send(msg).map_err(StagefsError::msg)?;
                Ok(())
            }
            None => {
                logged_err!(self.me; "peer {} not connected", peer)
            }
        }
    }

    /// Number of currently connected peers.
    pub(crate) fn num_peers(&self) -> usize {
        self.tx_sends.guard().keys().count()
    }
}

/// Delegator internal transport module.
pub(crate) struct TransportHub<Msg> {
    /// My delegator rank.
    me: ServerRank,

    /// Total number of delegators in the job.
    population: u32,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<(ServerRank, Msg)>,

    /// Cloneable sending half.
    sender: TransportSender<Msg>,

    /// Join handle of the peer acceptor task.
    _peer_acceptor_handle: JoinHandle<()>,

    /// Sender side of the connect channel, used when proactively connecting
    /// to some peer.
    tx_connect: mpsc::UnboundedSender<(ServerRank, SocketAddr)>,

    /// Receiver side of the connack channel.
    rx_connack: mpsc::UnboundedReceiver<ServerRank>,
}

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
    /// Creates a new transport hub. Spawns the peer acceptor task and
    /// creates a recv channel for listening on peers' messages.
    pub(crate) async fn new_and_setup(
        me: ServerRank,
        population: u32,
        p2p_addr: SocketAddr,
    ) -> Result<Self, StagefsError> {
        if population <= me {
            return logged_err!(me; "invalid population {}", population);
        }

        let (tx_recv, rx_recv) = mpsc::unbounded_channel::<(ServerRank, Msg)>();

        let (tx_sends_write, tx_sends_read) =
            flashmap::new::<ServerRank, mpsc::UnboundedSender<Msg>>();

        // the connect & connack channels are used to ask the peer acceptor
        // task to proactively connect to some peer
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();
        let (tx_connack, rx_connack) = mpsc::unbounded_channel();

        let peer_listener = tcp_bind_with_retry(p2p_addr, 10).await?;
        let mut acceptor = AcceptorTask::new(
            me,
            tx_recv,
            peer_listener,
            tx_sends_write,
            rx_connect,
            tx_connack,
        );
        let peer_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        Ok(TransportHub {
            me,
            population,
            rx_recv,
            sender: TransportSender {
                me,
                tx_sends: tx_sends_read,
            },
            _peer_acceptor_handle: peer_acceptor_handle,
            tx_connect,
            rx_connack,
        })
    }

    /// Returns a cloneable sending half of this hub.
    pub(crate) fn sender(&self) -> TransportSender<Msg> {
        self.sender.clone()
    }

    /// Connects to a peer delegator proactively; the acceptor task spawns
    /// the corresponding messenger task.
    pub(crate) async fn connect_to_peer(
        &mut self,
        id: ServerRank,
        peer_addr: SocketAddr,
    ) -> Result<(), StagefsError> {
        self.tx_connect.send((id, peer_addr))?;
        match self.rx_connack.recv().await {
            Some(ack_id) => {
                if ack_id != id {
                    logged_err!(
                        self.me;
                        "peer rank mismatch: expected {}, got {}",
                        id,
                        ack_id
                    )
                } else {
                    Ok(())
                }
            }
            None => logged_err!(self.me; "connack channel closed"),
        }
    }

    /// Waits until every other delegator of the job is connected.
    pub(crate) async fn wait_for_group(&self) -> Result<(), StagefsError> {
        while self.sender.num_peers() + 1 < self.population as usize {
            time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    /// Sends a message to a specified peer.
    #[allow(dead_code)]
    pub(crate) fn send_msg(
        &self,
        msg: Msg,
        peer: ServerRank,
    ) -> Result<(), StagefsError> {
        self.sender.send_msg(msg, peer)
    }

    /// Receives a message from some peer by receiving from the recv channel.
    /// Returns a pair of `(peer_rank, msg)` on success.
    pub(crate) async fn recv_msg(
        &mut self,
    ) -> Result<(ServerRank, Msg), StagefsError> {
        match self.rx_recv.recv().await {
            Some((id, msg)) => Ok((id, msg)),
            None => logged_err!(self.me; "recv channel has been closed"),
        }
    }
}

/// Transport peer acceptor task.
struct AcceptorTask<Msg> {
    me: ServerRank,

    tx_recv: mpsc::UnboundedSender<(ServerRank, Msg)>,
    tx_sends: flashmap::WriteHandle<ServerRank, mpsc::UnboundedSender<Msg>>,

    peer_listener: TcpListener,

    rx_connect: mpsc::UnboundedReceiver<(ServerRank, SocketAddr)>,
    tx_connack: mpsc::UnboundedSender<ServerRank>,

    tx_exit: mpsc::UnboundedSender<ServerRank>,
    rx_exit: mpsc::UnboundedReceiver<ServerRank>,
}

impl<Msg> AcceptorTask<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    fn new(
        me: ServerRank,
        tx_recv: mpsc::UnboundedSender<(ServerRank, Msg)>,
        peer_listener: TcpListener,
        tx_sends: flashmap::WriteHandle<
            ServerRank,
            mpsc::UnboundedSender<Msg>,
        >,
        rx_connect: mpsc::UnboundedReceiver<(ServerRank, SocketAddr)>,
        tx_connack: mpsc::UnboundedSender<ServerRank>,
    ) -> Self {
        // exit channel notifies about termination of messenger tasks
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        AcceptorTask {
            me,
            tx_recv,
            tx_sends,
            peer_listener,
            rx_connect,
            tx_connack,
            tx_exit,
            rx_exit,
        }
    }

    /// Registers a messenger task for a newly established peer connection.
    fn spawn_messenger(&mut self, id: ServerRank, stream: TcpStream) {
        let mut tx_sends_guard = self.tx_sends.guard();
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        tx_sends_guard.insert(id, tx_send);
        tx_sends_guard.publish();

        let mut messenger = MessengerTask::new(
            self.me,
            id,
            stream,
            rx_send,
            self.tx_recv.clone(),
            self.tx_exit.clone(),
        );
        tokio::spawn(async move { messenger.run().await });
    }

    /// Connects to a peer proactively.
    async fn connect_new_peer(
        &mut self,
        id: ServerRank,
        conn_addr: SocketAddr,
    ) -> Result<(), StagefsError> {
        pf_debug!(self.me; "connecting to peer {} '{}'...", id, conn_addr);
        let mut stream = tcp_connect_with_retry(conn_addr, 10).await?;
        stream.write_u32(self.me).await?; // send my rank

        if self.tx_sends.guard().contains_key(&id) {
            return logged_err!(self.me; "duplicate peer rank to connect: {}",
                               id);
        }
        self.spawn_messenger(id, stream);

        pf_debug!(self.me; "connected to peer {}", id);
        Ok(())
    }

    /// Accepts a new peer connection.
    async fn accept_new_peer(
        &mut self,
        mut stream: TcpStream,
    ) -> Result<(), StagefsError> {
        let id = match stream.read_u32().await {
            Ok(id) => id,
            Err(e) => {
                return logged_err!(self.me; "error receiving peer rank: {}",
                                   e);
            }
        };

        if self.tx_sends.guard().contains_key(&id) {
            return logged_err!(self.me; "duplicate peer rank listened: {}",
                               id);
        }
        self.spawn_messenger(id, stream);

        pf_debug!(self.me; "waited on peer {}", id);
        Ok(())
    }

    /// Removes handles of a disconnected peer.
    fn remove_left_peer(&mut self, id: ServerRank) {
        let mut tx_sends_guard = self.tx_sends.guard();
        if tx_sends_guard.contains_key(&id) {
            tx_sends_guard.remove(id);
            tx_sends_guard.publish();
        }
    }

    /// Starts the peer acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "peer acceptor task spawned");

        loop {
            tokio::select! {
                // proactive connection request
                to_connect = self.rx_connect.recv() => {
                    let Some((peer, conn_addr)) = to_connect else {
                        break; // hub dropped, no messages remain
                    };
                    if let Err(e) = self.connect_new_peer(
                        peer,
                        conn_addr,
                    ).await {
                        pf_error!(self.me; "error connecting to peer: {}", e);
                    } else if let Err(e) = self.tx_connack.send(peer) {
                        pf_error!(self.me; "error sending to tx_connack: {}",
                                  e);
                    }
                },

                // new peer connection accepted
                accepted = self.peer_listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _addr)) => stream,
                        Err(e) => {
                            pf_warn!(self.me;
                                     "error accepting peer connection: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = self.accept_new_peer(stream).await {
                        pf_error!(self.me; "error accepting new peer: {}", e);
                    }
                },

                // a peer messenger task exits
                id = self.rx_exit.recv() => {
                    let Some(id) = id else {
                        break;
                    };
                    self.remove_left_peer(id);
                },
            }
        }

        pf_debug!(self.me; "peer acceptor task exited");
    }
}

/// Transport per-peer messenger task.
struct MessengerTask<Msg> {
    me: ServerRank,
    /// Corresponding peer's rank.
    id: ServerRank,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    rx_send: mpsc::UnboundedReceiver<Msg>,
    read_buf: BytesMut,

    tx_recv: mpsc::UnboundedSender<(ServerRank, Msg)>,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<ServerRank>,
}

impl<Msg> MessengerTask<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    fn new(
        me: ServerRank,
        id: ServerRank,
        conn: TcpStream,
        rx_send: mpsc::UnboundedReceiver<Msg>,
        tx_recv: mpsc::UnboundedSender<(ServerRank, Msg)>,
        tx_exit: mpsc::UnboundedSender<ServerRank>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();

        MessengerTask {
            me,
            id,
            conn_read,
            conn_write,
            rx_send,
            read_buf: BytesMut::with_capacity(8 + 1024),
            tx_recv,
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
            retrying: false,
            tx_exit,
        }
    }

    /// Attempts one (possibly partial) message write; a `WouldBlock`
    /// outcome leaves the bytes buffered until the socket drains.
    fn write_msg(&mut self, msg: Option<&Msg>) {
        match safe_tcp_write(
            &mut self.write_buf,
            &mut self.write_buf_cursor,
            &self.conn_write,
            msg,
        ) {
            Ok(true) => {
                self.retrying = false;
            }
            Ok(false) => {
                pf_debug!(self.me; "should retry msg send -> {}", self.id);
                self.retrying = true;
            }
            Err(e) => {
                pf_error!(self.me; "error sending -> {}: {}", self.id, e);
                self.retrying = false;
            }
        }
    }

    /// Starts the per-peer messenger task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "messenger task for peer {} spawned", self.id);

        loop {
            tokio::select! {
                // gets a message to send out
                msg = self.rx_send.recv(), if !self.retrying => {
                    match msg {
                        Some(msg) => self.write_msg(Some(&msg)),
                        None => break, // hub dropped, no messages remain
                    }
                },

                // receives a message from this peer
                msg = safe_tcp_read(&mut self.read_buf,
                                    &mut self.conn_read) => {
                    match msg {
                        Ok(msg) => {
                            if let Err(e) =
                                self.tx_recv.send((self.id, msg)) {
                                pf_error!(self.me;
                                          "error sending to tx_recv: {}", e);
                            }
                        },
                        Err(_) => {
                            // connection gone; let the acceptor forget us
                            pf_debug!(self.me;
                                      "connection to peer {} closed", self.id);
                            break;
                        }
                    }
                },

                // retry a pending partial write once writable
                _ = self.conn_write.writable(), if self.retrying => {
                    self.write_msg(None);
                },
            }
        }

        let _ = self.tx_exit.send(self.id);
        pf_debug!(self.me; "messenger task for peer {} exited", self.id);
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestMsg(String, u64);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_peer_exchange() -> Result<(), StagefsError> {
        let addr0: SocketAddr = "127.0.0.1:41700".parse()?;
        let addr1: SocketAddr = "127.0.0.1:41701".parse()?;

        let hub1_task = tokio::spawn(async move {
            let mut hub1 =
                TransportHub::<TestMsg>::new_and_setup(1, 2, addr1).await?;
            // higher rank dials the lower rank
            hub1.connect_to_peer(0, addr0).await?;
            hub1.wait_for_group().await?;

            let (peer, msg) = hub1.recv_msg().await?;
            assert_eq!(peer, 0);
            assert_eq!(msg, TestMsg("ping".into(), 7));
            hub1.send_msg(TestMsg("pong".into(), 8), 0)?;
            Ok::<(), StagefsError>(())
        });

        let mut hub0 =
            TransportHub::<TestMsg>::new_and_setup(0, 2, addr0).await?;
        hub0.wait_for_group().await?;
        hub0.send_msg(TestMsg("ping".into(), 7), 1)?;
        let (peer, msg) = hub0.recv_msg().await?;
        assert_eq!(peer, 1);
        assert_eq!(msg, TestMsg("pong".into(), 8));

        hub1_task.await.map_err(StagefsError::msg)??;
        Ok(())
    }
}
