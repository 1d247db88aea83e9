//! Delegator client-facing API module.
//!
//! Accepts one TCP connection per client process; a servant task per
//! connection forwards requests into a single channel drained by the
//! delegator event loop and writes back replies from a per-connection
//! channel. Connections identify themselves with a connection id derived
//! from `(app_id, client_id)` right after connecting.

use std::net::SocketAddr;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::common::{
    AppId, ClientId, FileAttr, Gfid, ServerRank,
};
use crate::server::appconfig::MountInfo;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, StagefsError,
};

/// Client connection id: `(app_id << 32) | client_id`.
pub type ConnId = u64;

/// Packs an `(app_id, client_id)` pair into a connection id.
pub fn conn_id(app_id: AppId, client_id: ClientId) -> ConnId {
    ((app_id as u64) << 32) | client_id as u64
}

/// Request received from a client process.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Attach this client's superblock, buffers, and spill files.
    Mount { info: MountInfo },

    /// Promote the client's buffered index and attribute records into the
    /// distributed indexes.
    Fsync {
        app_id: AppId,
        client_id: ClientId,
    },

    /// Resolve and fetch the `req_cnt` read requests staged in the
    /// client's request region; data lands in the reply region.
    Read {
        app_id: AppId,
        client_id: ClientId,
        req_cnt: u32,
    },

    /// Fetch the attribute record of one gfid.
    GetAttr { gfid: Gfid },

    /// Detach this client.
    Unmount {
        app_id: AppId,
        client_id: ClientId,
    },
}

/// Reply back to a client process.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    MountAck {
        errcode: i32,
        rank: ServerRank,
        num_delegators: u32,
    },
    Fsync {
        errcode: i32,
    },
    /// Completion of a read; reply data was deposited into the client's
    /// reply region, `bytes_ok` of it from successful fetches.
    ReadDone {
        errcode: i32,
        bytes_ok: u64,
    },
    Attr {
        errcode: i32,
        attr: Option<FileAttr>,
    },
    UnmountAck {
        errcode: i32,
    },
}

/// The client-facing API module.
pub(crate) struct ClientApi {
    /// My delegator rank.
    me: ServerRank,

    /// Receiver side of the req channel.
    rx_req: mpsc::UnboundedReceiver<(ConnId, ApiRequest)>,

    /// Map from conn id -> sender side of its reply channel, shared with
    /// the client acceptor task.
    tx_replies:
        flashmap::ReadHandle<ConnId, mpsc::UnboundedSender<ApiReply>>,

    /// Join handle of the client acceptor task.
    _client_acceptor_handle: JoinHandle<()>,
}

impl ClientApi {
    /// Creates the client API module: binds the listener and spawns the
    /// acceptor task.
    pub(crate) async fn new_and_setup(
        me: ServerRank,
        api_addr: SocketAddr,
    ) -> Result<Self, StagefsError> {
        let (tx_req, rx_req) = mpsc::unbounded_channel();
        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<ConnId, mpsc::UnboundedSender<ApiReply>>();

        let client_listener = tcp_bind_with_retry(api_addr, 10).await?;
        let client_acceptor_handle = tokio::spawn(Self::acceptor_task(
            me,
            client_listener,
            tx_req,
            tx_replies_write,
        ));

        Ok(ClientApi {
            me,
            rx_req,
            tx_replies: tx_replies_read,
            _client_acceptor_handle: client_acceptor_handle,
        })
    }

    /// Waits for the next client request.
    pub(crate) async fn get_req(
        &mut self,
    ) -> Result<(ConnId, ApiRequest), StagefsError> {
        match self.rx_req.recv().await {
            Some((conn, req)) => Ok((conn, req)),
            None => logged_err!(self.me; "req channel has been closed"),
        }
    }

    /// Sends a reply back to a client by sending to its reply channel.
    pub(crate) fn send_reply(
        &self,
        reply: ApiReply,
        conn: ConnId,
    ) -> Result<(), StagefsError> {
        let tx_replies_guard = self.tx_replies.guard();
        match tx_replies_guard.get(&conn) {
            Some(tx_reply) => {
                tx_reply.send(reply).map_err(StagefsError::msg)?;
                Ok(())
            }
            None => {
                logged_err!(self.me;
                            "conn {:#x} not found among active clients", conn)
            }
        }
    }

    /// Client acceptor task function.
    async fn acceptor_task(
        me: ServerRank,
        client_listener: TcpListener,
        tx_req: mpsc::UnboundedSender<(ConnId, ApiRequest)>,
        tx_replies: flashmap::WriteHandle<
            ConnId,
            mpsc::UnboundedSender<ApiReply>,
        >,
    ) {
        pf_debug!(me; "client acceptor task spawned");

        let mut tx_replies = tx_replies;
        let (tx_exit, mut rx_exit) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                accepted = client_listener.accept() => {
                    let mut stream = match accepted {
                        Ok((stream, _addr)) => stream,
                        Err(e) => {
                            pf_warn!(me;
                                     "error accepting client connection: {}",
                                     e);
                            continue;
                        }
                    };

                    let conn = match stream.read_u64().await {
                        Ok(conn) => conn,
                        Err(e) => {
                            pf_error!(me;
                                      "error receiving new conn id: {}", e);
                            continue;
                        }
                    };

                    let mut tx_replies_guard = tx_replies.guard();
                    if tx_replies_guard.contains_key(&conn) {
                        pf_error!(me; "duplicate conn id listened: {:#x}",
                                  conn);
                        continue;
                    }
                    pf_info!(me; "accepted new client conn {:#x}", conn);

                    let (tx_reply, rx_reply) = mpsc::unbounded_channel();
                    tx_replies_guard.insert(conn, tx_reply);
                    tx_replies_guard.publish();

                    tokio::spawn(Self::servant_task(
                        me,
                        conn,
                        stream,
                        tx_req.clone(),
                        rx_reply,
                        tx_exit.clone(),
                    ));
                },

                // a client servant exited; forget its reply channel
                conn = rx_exit.recv() => {
                    let Some(conn) = conn else { break };
                    let mut tx_replies_guard = tx_replies.guard();
                    if tx_replies_guard.contains_key(&conn) {
                        tx_replies_guard.remove(conn);
                        tx_replies_guard.publish();
                    }
                },
            }
        }

        pf_debug!(me; "client acceptor task exited");
    }

    /// Client request listener and reply sender task function, one per
    /// client connection.
    async fn servant_task(
        me: ServerRank,
        conn: ConnId,
        stream: TcpStream,
        tx_req: mpsc::UnboundedSender<(ConnId, ApiRequest)>,
        mut rx_reply: mpsc::UnboundedReceiver<ApiReply>,
        tx_exit: mpsc::UnboundedSender<ConnId>,
    ) {
        pf_debug!(me; "client servant for {:#x} spawned", conn);

        let (mut conn_read, conn_write): (OwnedReadHalf, OwnedWriteHalf) =
            stream.into_split();
        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        let mut write_buf = BytesMut::with_capacity(8 + 1024);
        let mut write_buf_cursor = 0;
        let mut retrying = false;

        loop {
            tokio::select! {
                // gets a reply to send back
                reply = rx_reply.recv(), if !retrying => {
                    let Some(reply) = reply else { break };
                    match safe_tcp_write(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        Some(&reply),
                    ) {
                        Ok(true) => {
                            pf_trace!(me; "replied -> {:#x} {:?}", conn,
                                      reply);
                        }
                        Ok(false) => {
                            retrying = true;
                        }
                        Err(e) => {
                            pf_error!(me; "error replying to {:#x}: {}",
                                      conn, e);
                        }
                    }
                },

                // retry a pending partial reply write
                _ = conn_write.writable(), if retrying => {
                    match safe_tcp_write::<ApiReply, _>(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        None,
                    ) {
                        Ok(true) => retrying = false,
                        Ok(false) => {},
                        Err(e) => {
                            pf_error!(me; "error replying to {:#x}: {}",
                                      conn, e);
                            retrying = false;
                        }
                    }
                },

                // receives client request
                req = safe_tcp_read(&mut read_buf, &mut conn_read) => {
                    match req {
                        Ok(req) => {
                            pf_trace!(me; "request from {:#x} {:?}", conn,
                                      req);
                            if let Err(e) = tx_req.send((conn, req)) {
                                pf_error!(me;
                                    "error sending to tx_req for {:#x}: {}",
                                    conn, e);
                            }
                        },
                        Err(_) => {
                            // connection closed by the client process
                            pf_debug!(me; "client conn {:#x} closed", conn);
                            break;
                        }
                    }
                },
            }
        }

        let _ = tx_exit.send(conn);
        pf_debug!(me; "client servant for {:#x} exited", conn);
    }
}
