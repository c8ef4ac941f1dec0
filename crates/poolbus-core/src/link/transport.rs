//! Byte transports
//!
//! The link talks to the bus through a [`Channel`]: a local serial device,
//! a TCP bridge (e.g. socat on the machine that owns the adapter), or an
//! in-memory pipe for tests and replay.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::net::TcpStream;
use tokio_serial::SerialStream;

use super::serial::open_serial;
use super::LinkError;
use crate::config::{PortSettings, TransportKind};

/// Abstraction over the byte streams the link can run on
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin {
    /// Transport behind this channel
    fn kind(&self) -> TransportKind;

    /// Whether a write can be drained to the device before it is reported done
    fn has_drain(&self) -> bool {
        true
    }
}

impl Channel for SerialStream {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }
}

impl Channel for TcpStream {
    fn kind(&self) -> TransportKind {
        TransportKind::Net
    }

    fn has_drain(&self) -> bool {
        false
    }
}

impl Channel for DuplexStream {
    fn kind(&self) -> TransportKind {
        TransportKind::Mock
    }
}

/// Where a session connects to
#[derive(Debug)]
pub enum Endpoint {
    /// Serial device with line settings
    Serial {
        /// Device path
        path: String,
        /// Line settings
        settings: PortSettings,
    },
    /// TCP `host:port`
    Net(String),
    /// In-memory pipe
    Mock(DuplexStream),
}

impl Endpoint {
    /// Open the channel
    pub async fn open(self) -> Result<Box<dyn Channel>, LinkError> {
        match self {
            Endpoint::Serial { path, settings } => {
                let port = open_serial(&path, &settings)?;
                Ok(Box::new(port))
            }
            Endpoint::Net(address) => {
                let stream = TcpStream::connect(&address).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Endpoint::Mock(stream) => Ok(Box::new(stream)),
        }
    }
}

/// Write one packet, draining it to the device when the channel supports it
pub async fn write_packet(
    writer: &mut WriteHalf<Box<dyn Channel>>,
    bytes: &[u8],
    drain: bool,
) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    if drain {
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_mock_endpoint_round_trip() {
        let (local, mut remote) = tokio::io::duplex(64);
        let channel = Endpoint::Mock(local).open().await.unwrap();
        assert_eq!(channel.kind(), TransportKind::Mock);
        assert!(channel.has_drain());

        let (_reader, mut writer) = tokio::io::split(channel);
        write_packet(&mut writer, &[16, 2, 80, 0, 98, 16, 3], true)
            .await
            .unwrap();

        let mut buf = [0u8; 7];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [16, 2, 80, 0, 98, 16, 3]);
    }

    #[tokio::test]
    async fn test_net_endpoint_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(matches!(
            Endpoint::Net(address).open().await,
            Err(LinkError::Io(_))
        ));
    }
}
