//! Safe TCP bind/connect/read/write helper functions, framing every object
//! as an 8-byte big-endian length followed by its `rmp-serde` encoding.

use std::io::ErrorKind;
use std::marker::Unpin;
use std::net::SocketAddr;

use crate::utils::FleaseError;

use bytes::{Bytes, BytesMut};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::de::DeserializeOwned;
use serde::Serialize;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

/// Largest object length accepted from a length header.
pub(crate) const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Receives an object of type `T` from TCP readable connection `conn_read`,
/// using `read_buf` as buffer storage for partial reads. Returns:
///   - `Ok(obj)` if successful; upon returning, the consumed bytes are
///     removed from the read buffer
///   - `Err(err)` if the peer closed the connection or any unexpected
///     error occurs
///
/// CANCELLATION SAFETY: bytes already read before a cancellation at an
/// `.await` point stay in the read buffer and are continued from by the
/// next invocation.
pub(crate) async fn safe_tcp_read<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, FleaseError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // read length of obj first
    if read_buf.capacity() < 8 {
        read_buf.reserve(8 - read_buf.capacity());
    }
    while read_buf.len() < 8 {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(FleaseError::msg("connection closed by peer"));
        }
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&read_buf[..8]);
    let obj_len = u64::from_be_bytes(len_bytes);
    if obj_len > MAX_FRAME_LEN as u64 {
        return Err(FleaseError::msg(format!(
            "frame length {} exceeds limit {}",
            obj_len, MAX_FRAME_LEN
        )));
    }

    // then read the obj itself
    let obj_end = 8 + obj_len as usize;
    if read_buf.capacity() < obj_end {
        // capacity not big enough, reserve more space
        read_buf.reserve(obj_end - read_buf.capacity());
    }
    while read_buf.len() < obj_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(FleaseError::msg("connection closed by peer"));
        }
    }
    let obj = decode_from_slice(&read_buf[8..obj_end])?;

    // if reached this point, no further cancellation to this call is
    // possible (because there are no more awaits ahead); discard bytes
    // used in this call
    if read_buf.len() > obj_end {
        let buf_tail = Bytes::copy_from_slice(&read_buf[obj_end..]);
        read_buf.clear();
        read_buf.extend_from_slice(&buf_tail);
    } else {
        read_buf.clear();
    }

    Ok(obj)
}

/// Sends an object of type `T` to TCP writable connection `conn_write`, using
/// `write_buf` as buffer storage for partial writes. Returns:
///   - `Ok(true)` if successful
///   - `Ok(false)` if socket full and may block; in this case, bytes of the
///     input object are saved in the write buffer, and the next calls
///     must give arg `obj == None` to indicate retrying (typically after
///     awaiting writability), until the function returns success
///   - `Err(err)` if any unexpected error occurs
pub(crate) fn safe_tcp_write<T, Conn>(
    write_buf: &mut BytesMut,
    write_buf_cursor: &mut usize,
    conn_write: &Conn,
    obj: Option<&T>,
) -> Result<bool, FleaseError>
where
    T: Serialize,
    Conn: AsRef<TcpStream>,
{
    // if last write was not successful, cannot send a new object
    if obj.is_some() && !write_buf.is_empty() {
        return Err(FleaseError::msg(
            "attempting new object while should retry",
        ));
    } else if obj.is_none() && write_buf.is_empty() {
        return Err(FleaseError::msg(
            "attempting to retry while buffer is empty",
        ));
    } else if let Some(obj) = obj {
        // sending a new object, fill write_buf
        debug_assert_eq!(*write_buf_cursor, 0);
        let write_bytes = encode_to_vec(obj)?;
        let write_len = write_bytes.len() as u64;
        write_buf.extend_from_slice(&write_len.to_be_bytes());
        debug_assert_eq!(write_buf.len(), 8);
        write_buf.extend_from_slice(write_bytes.as_slice());
    } else {
        // retrying last unsuccessful write
        debug_assert!(*write_buf_cursor < write_buf.len());
    }

    // try until the length + the object are all written
    while *write_buf_cursor < write_buf.len() {
        match conn_write
            .as_ref()
            .try_write(&write_buf[*write_buf_cursor..])
        {
            Ok(n) => {
                *write_buf_cursor += n;
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }
    }

    // everything written, clear write_buf
    write_buf.clear();
    *write_buf_cursor = 0;

    Ok(true)
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, FleaseError> {
    loop {
        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(bind_addr)?;

        match socket.listen(1024) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, FleaseError> {
    loop {
        let socket = if conn_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_nodelay(true)?;

        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Frame {
        cell: String,
        ballot: u64,
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_then_read_frames() -> Result<(), FleaseError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:0".parse()?, 0).await?;
        let addr = listener.local_addr()?;

        let reader = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            let mut read_buf = BytesMut::new();
            let a: Frame = safe_tcp_read(&mut read_buf, &mut stream).await?;
            let b: Frame = safe_tcp_read(&mut read_buf, &mut stream).await?;
            Ok::<_, FleaseError>((a, b))
        });

        let stream = tcp_connect_with_retry(addr, 3).await?;
        let (_conn_read, conn_write) = stream.into_split();
        let mut write_buf = BytesMut::new();
        let mut cursor = 0;
        for ballot in [7, 8] {
            let frame = Frame {
                cell: "c0".into(),
                ballot,
            };
            let mut done = safe_tcp_write(
                &mut write_buf,
                &mut cursor,
                &conn_write,
                Some(&frame),
            )?;
            while !done {
                conn_write.writable().await?;
                done = safe_tcp_write::<Frame, _>(
                    &mut write_buf,
                    &mut cursor,
                    &conn_write,
                    None,
                )?;
            }
        }

        let (a, b) = reader.await??;
        assert_eq!(a.ballot, 7);
        assert_eq!(b.ballot, 8);
        assert_eq!(b.cell, "c0");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn read_detects_close() -> Result<(), FleaseError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:0".parse()?, 0).await?;
        let addr = listener.local_addr()?;
        let stream = tcp_connect_with_retry(addr, 3).await?;
        let (mut accepted, _) = listener.accept().await?;
        drop(stream);
        let mut read_buf = BytesMut::new();
        let res: Result<Frame, _> =
            safe_tcp_read(&mut read_buf, &mut accepted).await;
        assert!(res.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn read_rejects_oversized_length() -> Result<(), FleaseError> {
        use tokio::io::AsyncWriteExt;
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(1u64 << 46).to_be_bytes()).await?;
        let mut read_buf = BytesMut::new();
        let res: Result<u64, _> =
            safe_tcp_read(&mut read_buf, &mut server).await;
        assert!(res.is_err());
        assert!(read_buf.capacity() < MAX_FRAME_LEN);
        Ok(())
    }
}
