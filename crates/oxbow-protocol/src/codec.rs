use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Frame, ProtocolError};

/// Upper bound on a single frame body. Results are opaque user data and can
/// be large, but a length prefix beyond this is treated as stream corruption.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Reads one frame from the stream.
///
/// Returns `Ok(None)` on a clean end of stream (the peer closed between
/// frames). An EOF in the middle of a frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Writes one length-prefixed frame and flushes the stream.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(frame)?;
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// A bidirectional frame channel over any async stream.
///
/// The protocol allows at most one outstanding request per connection, so a
/// single owner sending and then receiving on the same stream is all that is
/// ever needed; peers that must read and write concurrently split the stream
/// and use [`read_frame`]/[`write_frame`] directly.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        write_frame(&mut self.stream, frame).await
    }

    pub async fn recv(&mut self) -> Result<Option<Frame>, ProtocolError> {
        read_frame(&mut self.stream).await
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_a_duplex_stream() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = Connection::new(client);
        let mut server = Connection::new(server);

        let request = Frame::Execute {
            module_path: "m.py".to_string(),
            function: "s".to_string(),
            args: vec![json!([1, 2, 3])],
            kwargs: serde_json::Map::new(),
        };
        client.send(&request).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Some(request));

        let reply = Frame::ExecutionFinished {
            result: json!(6),
            message: Some("done".to_string()),
        };
        server.send(&reply).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), Some(reply));
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut server = Connection::new(server);
        assert!(server.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&100u32.to_be_bytes()).await.unwrap();
        client.write_all(b"{\"action\"").await.unwrap();
        drop(client);

        let mut server = Connection::new(server);
        let err = server.recv().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32) + 1;
        client.write_all(&len.to_be_bytes()).await.unwrap();

        let mut server = Connection::new(server);
        let err = server.recv().await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn garbage_body_is_a_json_error_not_a_disconnect() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&4u32.to_be_bytes()).await.unwrap();
        client.write_all(b"nope").await.unwrap();

        let mut server = Connection::new(server);
        let err = server.recv().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
        assert!(!err.is_disconnect());
    }
}
