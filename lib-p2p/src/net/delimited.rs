//! Length-delimited frame codec.
//!
//! Each frame on the wire is `varint(length) || bytes[length]` with the
//! length encoded as an unsigned LEB128 varint. The inbound side
//! distinguishes a clean end of stream (EOF at a frame boundary) from a
//! truncated frame.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame's payload. Frames advertising more are
/// rejected before any payload allocation.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Write one frame: varint length prefix followed by the payload.
pub async fn write_frame<S>(stream: &mut S, data: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    if data.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit {}", data.len(), MAX_FRAME_SIZE),
        ));
    }
    let mut prefix = [0u8; 10];
    let prefix_len = encode_varint(data.len() as u64, &mut prefix);
    stream.write_all(&prefix[..prefix_len]).await?;
    stream.write_all(data).await?;
    stream.flush().await
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream (EOF before
/// the first length byte); EOF inside a length prefix or payload is an
/// `UnexpectedEof` error.
pub async fn read_frame<S>(stream: &mut S) -> io::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let len = match read_varint(stream).await? {
        Some(len) => len,
        None => return Ok(None),
    };
    if len as usize > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit {}", len, MAX_FRAME_SIZE),
        ));
    }
    let mut data = vec![0u8; len as usize];
    stream.read_exact(&mut data).await?;
    Ok(Some(data))
}

/// Encode `value` as LEB128 into `buf`, returning the encoded length.
fn encode_varint(mut value: u64, buf: &mut [u8; 10]) -> usize {
    let mut i = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[i] = byte;
            return i + 1;
        }
        buf[i] = byte | 0x80;
        i += 1;
    }
}

/// Decode one LEB128 varint. `Ok(None)` when the stream ends before the
/// first byte.
async fn read_varint<S>(stream: &mut S) -> io::Result<Option<u64>>
where
    S: AsyncRead + Unpin,
{
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    let mut first = true;
    loop {
        let mut byte = [0u8; 1];
        match stream.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && first => return Ok(None),
            Err(e) => return Err(e),
        }
        first = false;
        let b = byte[0];
        if shift >= 63 && b > 1 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflows u64"));
        }
        value |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
        if shift > 63 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "varint longer than 10 bytes"));
        }
    }
}
