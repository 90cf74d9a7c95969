//! Local IPC between the monitor and the renderer agent.
//!
//! One endpoint per node, named with the node ID: a Unix domain socket on
//! POSIX, a named pipe on Windows. Framing is a 4-byte little-endian length
//! followed by that many bytes of UTF-8 JSON; a length over 16 MiB is a
//! protocol violation and closes the connection.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes"),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(unix)]
pub use unix::{endpoint_name, AgentListener, AgentStream};

#[cfg(unix)]
mod unix {
    use std::io;
    use std::path::PathBuf;

    use tokio::net::{UnixListener, UnixStream};

    pub type AgentStream = UnixStream;

    pub fn endpoint_name(node_id: &str) -> PathBuf {
        std::env::temp_dir().join(format!("smallrender-agent-{node_id}.sock"))
    }

    /// Single-client listener on the node's agent socket.
    pub struct AgentListener {
        path: PathBuf,
        listener: UnixListener,
    }

    impl AgentListener {
        pub fn bind(node_id: &str) -> io::Result<Self> {
            let path = endpoint_name(node_id);
            // A previous run may have left the socket file behind.
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path)?;
            Ok(Self { path, listener })
        }

        pub async fn accept(&mut self) -> io::Result<AgentStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(stream)
        }
    }

    impl Drop for AgentListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(windows)]
pub use windows::{endpoint_name, AgentListener, AgentStream};

#[cfg(windows)]
mod windows {
    use std::io;

    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

    pub type AgentStream = NamedPipeServer;

    pub fn endpoint_name(node_id: &str) -> String {
        format!(r"\\.\pipe\smallrender-agent-{node_id}")
    }

    /// Single-client listener on the node's agent pipe.
    pub struct AgentListener {
        name: String,
        server: Option<NamedPipeServer>,
    }

    impl AgentListener {
        pub fn bind(node_id: &str) -> io::Result<Self> {
            let name = endpoint_name(node_id);
            let server = ServerOptions::new().first_pipe_instance(true).create(&name)?;
            Ok(Self {
                name,
                server: Some(server),
            })
        }

        pub async fn accept(&mut self) -> io::Result<AgentStream> {
            // Each accepted client consumes the pending server instance; a
            // fresh one is created for the next connection.
            let server = match self.server.take() {
                Some(server) => server,
                None => ServerOptions::new().create(&self.name)?,
            };
            server.connect().await?;
            self.server = Some(ServerOptions::new().create(&self.name)?);
            Ok(server)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, br#"{"type":"ping"}"#).await.unwrap();
        let frame = read_frame(&mut b).await.unwrap();
        assert_eq!(frame, br#"{"type":"ping"}"#);
    }

    #[tokio::test]
    async fn oversize_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &len).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn sequential_frames_preserve_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"second").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"first");
        assert_eq!(read_frame(&mut b).await.unwrap(), b"second");
    }
}
