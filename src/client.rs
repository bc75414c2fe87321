//! Client for the length-prefixed protocol.
//!
//! Holds one connection and performs strictly sequential request/response
//! cycles over it.

use crate::endpoint::Endpoint;
use crate::protocol::{self, FrameError, HEADER_LEN};
use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

/// Client errors
#[derive(Debug)]
pub enum ClientError {
    /// Failed to connect
    Connect(Endpoint, io::Error),
    /// Socket error during a request
    Io(io::Error),
    /// Response frame was malformed or too large
    Protocol(FrameError),
    /// Server closed the connection instead of responding
    Closed,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Connect(endpoint, e) => {
                write!(f, "Failed to connect to {}: {}", endpoint, e)
            }
            ClientError::Io(e) => write!(f, "I/O error: {}", e),
            ClientError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ClientError::Closed => write!(f, "Connection closed by server"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

impl From<FrameError> for ClientError {
    fn from(e: FrameError) -> Self {
        ClientError::Protocol(e)
    }
}

pub struct Client {
    stream: TcpStream,
    max_response_bytes: usize,
}

impl Client {
    /// Connect to `endpoint`. Responses larger than `max_response_bytes`
    /// are rejected.
    pub async fn connect(endpoint: &Endpoint, max_response_bytes: usize) -> Result<Self, ClientError> {
        let stream = TcpStream::connect((endpoint.host(), endpoint.port()))
            .await
            .map_err(|e| ClientError::Connect(endpoint.clone(), e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ClientError::Connect(endpoint.clone(), e))?;

        Ok(Self {
            stream,
            max_response_bytes,
        })
    }

    /// Send one request and wait for its response.
    pub async fn request(&mut self, payload: &[u8]) -> Result<Bytes, ClientError> {
        let frame = protocol::encode(payload)?;
        self.stream.write_all(&frame).await?;
        trace!(length = payload.len(), "Request sent");

        let mut header = [0u8; HEADER_LEN];
        match self.stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(ClientError::Closed),
            Err(e) => return Err(e.into()),
        }

        let length = protocol::decode_length(header, self.max_response_bytes)?;
        let mut response = BytesMut::zeroed(length);
        let mut filled = 0;
        while filled < length {
            let n = self.stream.read(&mut response[filled..]).await?;
            if n == 0 {
                return Err(FrameError::Truncated {
                    expected: length,
                    received: filled,
                }
                .into());
            }
            filled += n;
        }
        trace!(length, "Response received");

        Ok(response.freeze())
    }

    /// Close the connection at a message boundary.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
