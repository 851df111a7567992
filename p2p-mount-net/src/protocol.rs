//! Protocol selection on overlay streams.
//!
//! All mount traffic between two peers shares one connection (one ALPN) and
//! each tunneled TCP connection gets its own bidirectional stream, so the
//! stream has to say which protocol it is for:
//!
//! ```text
//! opener                                  acceptor
//!   │ {"protocol":"demo"}\n  ─────────────►  │ look up handler for "demo"
//!   │                        ◄─────────────  │ ack\n   (or a rejection reason)
//!   │ opaque payload bytes   ◄────────────►  │
//! ```
//!
//! Both lines are newline terminated and bounded by [`MAX_LINE`]. Lines are
//! read one byte at a time so no payload byte is consumed by the framing.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reply sent by the acceptor when it serves the requested protocol.
pub const ACK: &str = "ack";

/// Upper bound on a header or reply line, newline excluded.
pub const MAX_LINE: usize = 4096;

/// First line on every stream.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StreamHeader {
    pub protocol: String,
}

/// The acceptor's answer to a [`StreamHeader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream ended before a complete line")]
    UnexpectedEof,

    #[error("line longer than {MAX_LINE} bytes")]
    LineTooLong,

    #[error("line is not utf-8")]
    NotUtf8,

    #[error("malformed stream header: {0}")]
    Header(#[from] serde_json::Error),
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_line<R>(reader: &mut R) -> Result<String, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(FramingError::UnexpectedEof);
            }
            Err(e) => return Err(e.into()),
        };
        if byte == b'\n' {
            break;
        }
        if line.len() == MAX_LINE {
            return Err(FramingError::LineTooLong);
        }
        line.push(byte);
    }
    String::from_utf8(line).map_err(|_| FramingError::NotUtf8)
}

/// Opener side: announce the protocol.
pub async fn send_header<W>(writer: &mut W, protocol: &str) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let header = serde_json::to_string(&StreamHeader {
        protocol: protocol.to_string(),
    })?;
    tracing::trace!(protocol, "sending stream header");
    write_line(writer, &header).await
}

/// Acceptor side: read the protocol announcement.
pub async fn read_header<R>(reader: &mut R) -> Result<StreamHeader, FramingError>
where
    R: AsyncRead + Unpin,
{
    let line = read_line(reader).await?;
    Ok(serde_json::from_str(&line)?)
}

/// Acceptor side: answer a header.
pub async fn send_reply<W>(writer: &mut W, reply: &Reply) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    match reply {
        Reply::Ack => write_line(writer, ACK).await,
        // a reason must fit on one line and must not read as an ACK
        Reply::Rejected(reason) => {
            let reason = reason.replace('\n', " ");
            let reason = if reason == ACK {
                "rejected".to_string()
            } else {
                reason
            };
            write_line(writer, &reason).await
        }
    }
}

/// Opener side: wait for the acceptor's answer.
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply, FramingError>
where
    R: AsyncRead + Unpin,
{
    let line = read_line(reader).await?;
    if line == ACK {
        Ok(Reply::Ack)
    } else {
        Ok(Reply::Rejected(line))
    }
}
