//! Client API communication stub.
//!
//! One TCP connection per client process to its node-local delegator.
//! Client calls are lockstep (one request, one reply), but replies to a
//! read arrive only after the delegator finished depositing data into the
//! reply region, so the receive path stays fully asynchronous.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::server::{ApiReply, ApiRequest, ConnId};
use crate::utils::{safe_tcp_read, safe_tcp_write, StagefsError};

/// Client API connection stub.
pub struct ClientApiStub {
    /// My connection id, `(app_id << 32) | client_id`.
    conn: ConnId,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    /// Read buffer for cancellation-safe reply reception.
    read_buf: BytesMut,

    /// Write buffer for deadlock-avoiding request transmission.
    write_buf: BytesMut,
    write_buf_cursor: usize,
}

impl ClientApiStub {
    /// Connects to the given delegator address, sending my connection id
    /// first.
    pub async fn connect(
        conn: ConnId,
        addr: SocketAddr,
    ) -> Result<Self, StagefsError> {
        pf_debug!(conn; "connecting to delegator '{}'...", addr);
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        stream.write_u64(conn).await?; // send my conn id

        let (conn_read, conn_write) = stream.into_split();
        Ok(ClientApiStub {
            conn,
            conn_read,
            conn_write,
            read_buf: BytesMut::with_capacity(8 + 1024),
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
        })
    }

    /// Sends a request, retrying when the socket would block.
    pub async fn send_req(
        &mut self,
        req: &ApiRequest,
    ) -> Result<(), StagefsError> {
        let mut sent = safe_tcp_write(
            &mut self.write_buf,
            &mut self.write_buf_cursor,
            &self.conn_write,
            Some(req),
        )?;
        while !sent {
            self.conn_write.writable().await?;
            sent = safe_tcp_write::<ApiRequest, _>(
                &mut self.write_buf,
                &mut self.write_buf_cursor,
                &self.conn_write,
                None,
            )?;
        }
        Ok(())
    }

    /// Receives the next reply from the delegator.
    pub async fn recv_reply(&mut self) -> Result<ApiReply, StagefsError> {
        safe_tcp_read(&mut self.read_buf, &mut self.conn_read).await
    }

    /// Lockstep request-response round trip.
    pub async fn call(
        &mut self,
        req: &ApiRequest,
    ) -> Result<ApiReply, StagefsError> {
        self.send_req(req).await?;
        let reply = self.recv_reply().await?;
        pf_trace!(self.conn; "call {:?} -> {:?}", req, reply);
        Ok(reply)
    }
}
