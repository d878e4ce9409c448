//! Length-prefixed frames with a correlation id.
//!
//! Frame layout: u32 big-endian length, then a u64 big-endian correlation
//! id, then the bincode payload (length covers id + payload). The id lets
//! one socket carry many in-flight requests: the server copies it onto the
//! reply, and replies may arrive in any order.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const ID_BYTES: u32 = 8;

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    id: u64,
    payload: &[u8],
) -> io::Result<()> {
    let len = payload.len() as u32 + ID_BYTES;
    writer.write_u32(len).await?;
    writer.write_u64(id).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(u64, Vec<u8>)> {
    let len = reader.read_u32().await?;
    if len < ID_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame shorter than its correlation id",
        ));
    }
    let id = reader.read_u64().await?;
    let mut payload = vec![0u8; (len - ID_BYTES) as usize];
    reader.read_exact(&mut payload).await?;
    Ok((id, payload))
}
