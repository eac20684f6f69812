//! Line transport for stratum sessions.
//!
//! Sessions talk to a [`Transport`] rather than a socket so protocol tests
//! can drive them through an in-memory pair.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::error::{Error, Result};

/// Hard ceiling on a single request line. Anything longer is a protocol
/// violation and drops the connection.
pub const MAX_LINE_BYTES: usize = 16 * 1024;

#[async_trait]
pub trait Transport: Send {
    /// Next complete line from the peer, `None` on clean EOF.
    async fn read_line(&mut self) -> Result<Option<String>>;

    /// Write a batch of lines and flush once. Each line goes out with a
    /// trailing newline.
    async fn send_lines(&mut self, lines: &[String]) -> Result<()>;
}

pub struct TcpTransport {
    framed: Framed<TcpStream, LinesCodec>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
        }
    }
}

fn map_codec_error(e: LinesCodecError) -> Error {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            Error::Protocol(format!("line exceeds {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(e) => Error::Io(e),
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn read_line(&mut self) -> Result<Option<String>> {
        match self.framed.next().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(e)) => Err(map_codec_error(e)),
            None => Ok(None),
        }
    }

    async fn send_lines(&mut self, lines: &[String]) -> Result<()> {
        for line in lines {
            SinkExt::<&str>::feed(&mut self.framed, line.as_str())
                .await
                .map_err(map_codec_error)?;
        }
        SinkExt::<&str>::flush(&mut self.framed)
            .await
            .map_err(map_codec_error)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use tokio::sync::mpsc;

    /// In-memory transport; the paired [`MockRemote`] plays the miner.
    pub struct MockTransport {
        incoming: mpsc::UnboundedReceiver<String>,
        outgoing: mpsc::UnboundedSender<String>,
        /// When set, writes never complete, simulating a peer that has
        /// stopped draining its socket.
        pub wedged: bool,
    }

    pub struct MockRemote {
        to_server: mpsc::UnboundedSender<String>,
        from_server: mpsc::UnboundedReceiver<String>,
    }

    pub fn pair() -> (MockTransport, MockRemote) {
        let (to_server, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_server) = mpsc::unbounded_channel();
        (
            MockTransport {
                incoming,
                outgoing,
                wedged: false,
            },
            MockRemote {
                to_server,
                from_server,
            },
        )
    }

    impl MockRemote {
        pub fn send_line(&self, line: &str) {
            self.to_server
                .send(line.to_string())
                .unwrap_or_else(|_| panic!("session dropped its transport"));
        }

        pub fn hang_up(self) {
            drop(self.to_server);
        }

        pub async fn recv_line(&mut self) -> String {
            self.from_server.recv().await.unwrap()
        }

        pub fn try_recv_line(&mut self) -> Option<String> {
            self.from_server.try_recv().ok()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn read_line(&mut self) -> Result<Option<String>> {
            Ok(self.incoming.recv().await)
        }

        async fn send_lines(&mut self, lines: &[String]) -> Result<()> {
            if self.wedged {
                futures::future::pending::<()>().await;
            }
            for line in lines {
                self.outgoing
                    .send(line.clone())
                    .map_err(|_| Error::Protocol("peer closed".into()))?;
            }
            Ok(())
        }
    }
}
