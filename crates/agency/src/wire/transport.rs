//! Connection transport between an agency and the central.
//!
//! - **Connector**: how a fresh stream to the central is obtained
//! - **Connection**: a framed stream carrying one request/reply at a time

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::codec::{AgencyCodec, CodecError};
use super::protocol::{Reply, ReplyKind, Request};

/// Extension point for different ways of reaching the central.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    async fn connect(&self) -> io::Result<Self::Stream>;

    /// Where this connector points, for logs and errors.
    fn target(&self) -> String;
}

/// Plain TCP to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        tracing::trace!(address = %self.address, "Connecting");
        let connect = TcpStream::connect(self.address.as_str());
        let stream = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", self.address, limit),
                )
            })??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn target(&self) -> String {
        self.address.clone()
    }
}

/// A framed connection owned by exactly one session.
///
/// `send` returns once the whole envelope has been written and flushed;
/// `receive` returns once the whole reply has been read.
pub struct Connection<S> {
    framed: Framed<S, AgencyCodec>,
    reply_timeout: Option<Duration>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, AgencyCodec::new()),
            reply_timeout: None,
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub async fn send(&mut self, request: Request<'_>) -> Result<(), CodecError> {
        self.framed.send(request).await
    }

    /// Wait for the next reply, decoded as `kind`.
    pub async fn receive(&mut self, kind: ReplyKind) -> Result<Reply, CodecError> {
        self.framed.codec_mut().expect(kind);
        let next = match self.reply_timeout {
            Some(limit) => tokio::time::timeout(limit, self.framed.next())
                .await
                .map_err(|_| {
                    CodecError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no reply within {:?}", limit),
                    ))
                })?,
            None => self.framed.next().await,
        };
        next.unwrap_or(Err(CodecError::Disconnected))
    }

    /// Shut down the write half. The stream itself is released on drop.
    pub async fn close(mut self) -> Result<(), CodecError> {
        self.framed.get_mut().shutdown().await?;
        Ok(())
    }
}
