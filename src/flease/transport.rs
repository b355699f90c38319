//! TCP transport carrying Flease messages between lease stages.
//!
//! Every connection is one-directional: the dialing side sends a hello frame
//! with its listen address followed by message frames, and the accepting
//! side stamps that address as the sender of every message it reads.
//! Broken connections are dropped and re-dialled on the next send; lost
//! messages are left to the protocol timers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::flease::{FleaseMessage, MessageInlet, MessageSender};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_retry,
    FleaseError,
};

use bytes::BytesMut;

use serde::Serialize;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// `MessageSender` over TCP, also feeding received messages into a stage.
pub struct TcpCommunicator {
    /// My listen address, announced to peers.
    me: SocketAddr,

    /// Sender side of the outbound channel.
    tx_send: mpsc::UnboundedSender<(FleaseMessage, SocketAddr)>,

    /// Listener waiting for `start_receiving`.
    listener: Mutex<Option<TcpListener>>,

    /// Join handles of the dispatcher and the connection acceptor tasks.
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpCommunicator {
    /// Binds the listen address and spawns the outbound dispatcher task.
    /// Inbound connections are accepted only after `start_receiving`.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
    ) -> Result<Self, FleaseError> {
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let me = listener.local_addr()?;
        pf_info!("transport listening on {}", me);

        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let dispatcher_handle =
            tokio::spawn(Self::dispatcher_task(me, rx_send));

        Ok(TcpCommunicator {
            me,
            tx_send,
            listener: Mutex::new(Some(listener)),
            handles: Mutex::new(vec![dispatcher_handle]),
        })
    }

    /// Actual listen address (useful when bound to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.me
    }

    /// Starts accepting peer connections, delivering their messages to
    /// `inlet`.
    pub fn start_receiving(&self, inlet: MessageInlet) -> Result<(), FleaseError> {
        let listener = match self.listener.lock() {
            Ok(mut listener) => listener.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(listener) = listener else {
            return logged_err!("transport already receiving");
        };
        let acceptor_handle =
            tokio::spawn(Self::conn_acceptor_task(listener, inlet));
        self.lock_handles().push(acceptor_handle);
        Ok(())
    }

    /// Stops all transport tasks.
    pub fn shutdown(&self) {
        for handle in self.lock_handles().drain(..) {
            handle.abort();
        }
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.handles.lock() {
            Ok(handles) => handles,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl MessageSender for TcpCommunicator {
    fn send_message(&self, msg: FleaseMessage, receiver: SocketAddr) {
        if let Err(e) = self.tx_send.send((msg, receiver)) {
            pf_warn!("transport stopped, message to {} dropped: {}", receiver, e);
        }
    }
}

impl Drop for TcpCommunicator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// TcpCommunicator task functions
impl TcpCommunicator {
    /// Routes outbound messages to per-peer writer tasks, spawning them on
    /// first use.
    async fn dispatcher_task(
        me: SocketAddr,
        mut rx_send: mpsc::UnboundedReceiver<(FleaseMessage, SocketAddr)>,
    ) {
        pf_debug!("transport dispatcher task spawned");

        let mut writers: HashMap<
            SocketAddr,
            (mpsc::UnboundedSender<FleaseMessage>, JoinHandle<()>),
        > = HashMap::new();
        while let Some((msg, peer)) = rx_send.recv().await {
            let (tx_peer, _) = writers.entry(peer).or_insert_with(|| {
                let (tx_peer, rx_peer) = mpsc::unbounded_channel();
                let handle =
                    tokio::spawn(Self::peer_writer_task(me, peer, rx_peer));
                (tx_peer, handle)
            });
            if let Err(e) = tx_peer.send(msg) {
                pf_error!("writer for {} gone: {}", peer, e);
                writers.remove(&peer);
            }
        }

        for (_, (_, handle)) in writers {
            handle.abort();
        }
        pf_debug!("transport dispatcher task exited");
    }

    /// Writes one object, waiting for writability while the socket is full.
    async fn write_frame<T: Serialize>(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        obj: &T,
    ) -> Result<(), FleaseError> {
        let mut done =
            safe_tcp_write(write_buf, write_buf_cursor, conn_write, Some(obj))?;
        while !done {
            conn_write.writable().await?;
            done =
                safe_tcp_write::<T, _>(write_buf, write_buf_cursor, conn_write, None)?;
        }
        Ok(())
    }

    async fn connect_peer(
        me: SocketAddr,
        peer: SocketAddr,
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
    ) -> Result<OwnedWriteHalf, FleaseError> {
        let conn = tcp_connect_with_retry(peer, 0).await?;
        let (_, conn_write) = conn.into_split();
        Self::write_frame(write_buf, write_buf_cursor, &conn_write, &me).await?;
        pf_debug!("connected to peer {}", peer);
        Ok(conn_write)
    }

    /// Writer task of one peer.
    async fn peer_writer_task(
        me: SocketAddr,
        peer: SocketAddr,
        mut rx_peer: mpsc::UnboundedReceiver<FleaseMessage>,
    ) {
        let mut conn_write: Option<OwnedWriteHalf> = None;
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        while let Some(msg) = rx_peer.recv().await {
            if conn_write.is_none() {
                match Self::connect_peer(
                    me,
                    peer,
                    &mut write_buf,
                    &mut write_buf_cursor,
                )
                .await
                {
                    Ok(conn) => conn_write = Some(conn),
                    Err(e) => {
                        pf_debug!("cannot reach {}, message dropped: {}", peer, e);
                        write_buf.clear();
                        write_buf_cursor = 0;
                        continue;
                    }
                }
            }

            if let Some(conn) = &conn_write {
                if let Err(e) = Self::write_frame(
                    &mut write_buf,
                    &mut write_buf_cursor,
                    conn,
                    &msg,
                )
                .await
                {
                    pf_debug!("error writing to {}, reconnecting later: {}", peer, e);
                    conn_write = None;
                    write_buf.clear();
                    write_buf_cursor = 0;
                }
            }
        }
    }

    /// Accepts inbound connections, one reader task each.
    async fn conn_acceptor_task(listener: TcpListener, inlet: MessageInlet) {
        pf_debug!("transport acceptor task spawned");

        loop {
            match listener.accept().await {
                Ok((conn, addr)) => {
                    pf_trace!("accepted connection from {}", addr);
                    tokio::spawn(Self::conn_reader_task(conn, inlet.clone()));
                }
                Err(e) => {
                    pf_error!("error accepting connection: {}", e);
                }
            }
        }
    }

    /// Reader task of one inbound connection.
    async fn conn_reader_task(mut conn: TcpStream, inlet: MessageInlet) {
        let mut read_buf = BytesMut::new();
        let peer: SocketAddr = match safe_tcp_read(&mut read_buf, &mut conn).await
        {
            Ok(peer) => peer,
            Err(e) => {
                pf_debug!("connection closed before hello: {}", e);
                return;
            }
        };

        loop {
            match safe_tcp_read::<FleaseMessage, _>(&mut read_buf, &mut conn)
                .await
            {
                Ok(mut msg) => {
                    msg.sender = Some(peer);
                    if let Err(e) = inlet.receive_message(msg) {
                        pf_debug!("stage gone, closing connection: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    pf_debug!("connection from {} ended: {}", peer, e);
                    break;
                }
            }
        }
    }
}
