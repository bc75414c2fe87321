//! Per-connection request/response loop.
//!
//! Each cycle reads one frame, dispatches its payload to the application,
//! and writes one response frame before reading the next request. There is
//! no pipelining: request N+1 is not read until response N is written.

use crate::apps::Application;
use crate::protocol::{self, FrameError, HEADER_LEN};
use crate::server::connection::{ConnState, Connection, ConnectionError};
use crate::server::shutdown::Phase;
use bytes::BytesMut;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::trace;

/// Serve `conn` until the peer closes, an error occurs, or draining begins.
///
/// `Ok(())` means the peer closed the connection at a message boundary.
/// Draining ends the loop with [`ConnectionError::Cancelled`]. The connection
/// is in the `Closed` state when this returns.
pub async fn handle_connection<S>(
    conn: &mut Connection<S>,
    app: &dyn Application,
    max_message_bytes: usize,
    phase: &mut watch::Receiver<Phase>,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = serve(conn, app, max_message_bytes, phase).await;
    if result.is_ok() || matches!(result, Err(ConnectionError::Cancelled)) {
        // Best-effort FIN; the socket is released when `conn` drops.
        let _ = conn.stream_mut().shutdown().await;
    }
    conn.close();
    trace!(
        conn = %conn.id(),
        peer = %conn.remote(),
        age_ms = (Utc::now() - conn.created_at()).num_milliseconds(),
        "Connection finished"
    );
    result
}

async fn serve<S>(
    conn: &mut Connection<S>,
    app: &dyn Application,
    max_message_bytes: usize,
    phase: &mut watch::Receiver<Phase>,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        conn.transition(ConnState::ReadingLength);

        // Wait for the first bytes of the next frame. This is the only point
        // where draining is observed; once a frame has started it is served.
        let mut header = [0u8; HEADER_LEN];
        let n = tokio::select! {
            biased;
            _ = drain_requested(phase) => {
                trace!(conn = %conn.id(), "Drain observed at message boundary");
                return Err(ConnectionError::Cancelled);
            }
            n = conn.stream_mut().read(&mut header) => n?,
        };
        if n == 0 {
            trace!(conn = %conn.id(), peer = %conn.remote(), "Connection closed by peer");
            return Ok(());
        }
        read_full(conn.stream_mut(), &mut header, n).await?;

        let length = protocol::decode_length(header, max_message_bytes)?;

        conn.transition(ConnState::ReadingPayload);
        let mut payload = BytesMut::zeroed(length);
        read_full(conn.stream_mut(), &mut payload, 0).await?;
        trace!(conn = %conn.id(), length, "Request received");

        conn.transition(ConnState::Dispatching);
        let response = app
            .call(payload.freeze())
            .map_err(ConnectionError::Application)?;
        if response.len() > max_message_bytes {
            return Err(ConnectionError::Application(Box::new(
                FrameError::Oversized {
                    length: response.len(),
                    max: max_message_bytes,
                },
            )));
        }

        conn.transition(ConnState::WritingResponse);
        let frame = protocol::encode(&response)?;
        let stream = conn.stream_mut();
        stream.write_all(&frame).await?;
        stream.flush().await?;
        trace!(conn = %conn.id(), length = response.len(), "Response sent");
    }
}

/// Fill `buf[filled..]`, treating EOF as a truncated frame.
async fn read_full<S>(stream: &mut S, buf: &mut [u8], mut filled: usize) -> Result<(), ConnectionError>
where
    S: AsyncRead + Unpin,
{
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(FrameError::Truncated {
                expected: buf.len(),
                received: filled,
            }
            .into());
        }
        filled += n;
    }
    Ok(())
}

async fn drain_requested(phase: &mut watch::Receiver<Phase>) {
    // A dropped coordinator is treated as a drain request
    let _ = phase.wait_for(|phase| *phase != Phase::Running).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::{echo::Echo, AppError};
    use crate::server::registry::ConnectionRegistry;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio_test::io::Builder;

    const MAX: usize = 1024;

    fn frame(payload: &[u8]) -> Vec<u8> {
        protocol::encode(payload).unwrap().to_vec()
    }

    async fn run<S>(stream: S, app: &dyn Application) -> (Result<(), ConnectionError>, Arc<ConnectionRegistry>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_tx, mut phase) = watch::channel(Phase::Running);
        let mut conn = Connection::open(stream, "127.0.0.1:4000".parse().unwrap(), Arc::clone(&registry));

        let result = handle_connection(&mut conn, app, MAX, &mut phase).await;
        assert_eq!(conn.state(), ConnState::Closed);
        drop(conn);
        (result, registry)
    }

    #[tokio::test]
    async fn test_single_request() {
        let mock = Builder::new()
            .read(&frame(b"hello"))
            .write(&frame(b"hello"))
            .build();

        let (result, registry) = run(mock, &Echo).await;
        assert!(result.is_ok());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_partial_reads() {
        let request = frame(b"split across reads");
        let mock = Builder::new()
            .read(&request[..2])
            .read(&request[2..7])
            .read(&request[7..])
            .write(&frame(b"split across reads"))
            .build();

        let (result, _) = run(mock, &Echo).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_sequential_requests() {
        let upper = |req: Bytes| -> Result<Bytes, AppError> {
            Ok(Bytes::from(req.to_ascii_uppercase()))
        };
        let mock = Builder::new()
            .read(&frame(b"one"))
            .write(&frame(b"ONE"))
            .read(&frame(b"two"))
            .write(&frame(b"TWO"))
            .read(&frame(b""))
            .write(&frame(b""))
            .build();

        let (result, _) = run(mock, &upper).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_oversized_length_closes_without_response() {
        let header = ((MAX + 1) as u32).to_be_bytes();
        let mock = Builder::new().read(&header).build();

        match run(mock, &Echo).await.0 {
            Err(ConnectionError::Protocol(FrameError::Oversized { length, max })) => {
                assert_eq!(length, MAX + 1);
                assert_eq!(max, MAX);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let mock = Builder::new().read(&[0, 0]).build();

        match run(mock, &Echo).await.0 {
            Err(ConnectionError::Protocol(FrameError::Truncated { expected, received })) => {
                assert_eq!(expected, HEADER_LEN);
                assert_eq!(received, 2);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let mock = Builder::new().read(&[0, 0, 0, 10]).read(b"abc").build();

        match run(mock, &Echo).await.0 {
            Err(ConnectionError::Protocol(FrameError::Truncated { expected, received })) => {
                assert_eq!(expected, 10);
                assert_eq!(received, 3);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_application_error_sends_nothing() {
        let failing = |_: Bytes| -> Result<Bytes, AppError> { Err("boom".into()) };
        let mock = Builder::new().read(&frame(b"x")).build();

        match run(mock, &failing).await.0 {
            Err(ConnectionError::Application(e)) => assert_eq!(e.to_string(), "boom"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_response_is_application_error() {
        let big = |_: Bytes| -> Result<Bytes, AppError> { Ok(Bytes::from(vec![0u8; MAX + 1])) };
        let mock = Builder::new().read(&frame(b"x")).build();

        let (result, _) = run(mock, &big).await;
        assert!(matches!(result, Err(ConnectionError::Application(_))));
    }

    #[tokio::test]
    async fn test_io_error() {
        let mock = Builder::new()
            .read_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let (result, _) = run(mock, &Echo).await;
        assert!(matches!(result, Err(ConnectionError::Io(_))));
    }

    #[tokio::test]
    async fn test_draining_closes_idle_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut phase) = watch::channel(Phase::Running);
        tx.send_replace(Phase::Draining);

        let (client, server) = tokio::io::duplex(64);
        let mut conn = Connection::open(server, "127.0.0.1:4000".parse().unwrap(), Arc::clone(&registry));

        let result = handle_connection(&mut conn, &Echo, MAX, &mut phase).await;
        assert!(matches!(result, Err(ConnectionError::Cancelled)));
        assert_eq!(conn.state(), ConnState::Closed);
        drop(client);
    }

    #[tokio::test]
    async fn test_draining_finishes_current_cycle() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut phase) = watch::channel(Phase::Running);

        let (mut client, server) = tokio::io::duplex(64);
        let mut conn = Connection::open(server, "127.0.0.1:4000".parse().unwrap(), Arc::clone(&registry));

        let handler = tokio::spawn(async move {
            let result = handle_connection(&mut conn, &Echo, MAX, &mut phase).await;
            (result, conn.state())
        });

        // Start a frame, then begin draining before it is complete
        let request = frame(b"in flight");
        client.write_all(&request[..6]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send_replace(Phase::Draining);
        client.write_all(&request[6..]).await.unwrap();

        let mut response = vec![0u8; request.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response, request);

        let (result, state) = handler.await.unwrap();
        assert!(matches!(result, Err(ConnectionError::Cancelled)));
        assert_eq!(state, ConnState::Closed);

        // Server side shut down after the response
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
