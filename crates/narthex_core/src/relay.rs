//! Bidirectional byte relay for upgraded (tunneled) connections.
//!
//! After a `101 Switching Protocols` the gateway stops parsing HTTP and
//! pumps raw bytes both ways. The two directions are independent copy
//! loops; when one side's read ends (EOF or error) its peer's write half is
//! shut down, and the relay retires when both loops have finished.

use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

use narthex_net::BoxedStream;

const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// Pump bytes between the client and origin streams until both directions
/// have closed. `client_pending` / `origin_pending` are bytes already read
/// past the upgrade response on either side; they are flushed to the peer
/// before the loops start. Returns the transferred byte counts
/// `(client_to_origin, origin_to_client)`.
pub(crate) async fn run(
    client: BoxedStream,
    client_pending: &[u8],
    origin: BoxedStream,
    origin_pending: &[u8],
) -> (u64, u64) {
    let (client_read, mut client_write) = split(client);
    let (origin_read, mut origin_write) = split(origin);

    if !client_pending.is_empty() && origin_write.write_all(client_pending).await.is_err() {
        debug!(target: "narthex::relay", "Origin rejected buffered client bytes");
    }
    if !origin_pending.is_empty() && client_write.write_all(origin_pending).await.is_err() {
        debug!(target: "narthex::relay", "Client rejected buffered origin bytes");
    }

    let upstream = tokio::spawn(copy_half(client_read, origin_write));
    let downstream = tokio::spawn(copy_half(origin_read, client_write));

    let (sent, received) = tokio::join!(upstream, downstream);
    let sent = client_pending.len() as u64 + sent.unwrap_or(0);
    let received = origin_pending.len() as u64 + received.unwrap_or(0);

    debug!(
        target: "narthex::relay",
        client_to_origin = sent,
        origin_to_client = received,
        "Relay finished"
    );

    (sent, received)
}

async fn copy_half(mut source: ReadHalf<BoxedStream>, mut sink: WriteHalf<BoxedStream>) -> u64 {
    let mut buf = [0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if sink.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                total += n as u64;
            }
        }
    }

    // Half-close the peer so its read loop observes EOF.
    let _ = sink.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use narthex_net::BoxedStream;

    #[tokio::test]
    async fn relays_bytes_both_ways_until_close() {
        let (client_near, mut client_far) = tokio::io::duplex(1024);
        let (origin_near, mut origin_far) = tokio::io::duplex(1024);

        let relay = tokio::spawn(async move {
            super::run(
                Box::new(client_near) as BoxedStream,
                b"",
                Box::new(origin_near) as BoxedStream,
                b"",
            )
            .await
        });

        client_far.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        origin_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        origin_far.write_all(b"pong").await.unwrap();
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Client hangup half-closes the origin side; the origin hangs up in
        // turn and the relay retires.
        drop(client_far);
        let mut rest = Vec::new();
        origin_far.read_to_end(&mut rest).await.unwrap();
        drop(origin_far);
        let (sent, received) = relay.await.unwrap();
        assert_eq!(sent, 4);
        assert_eq!(received, 4);
    }

    #[tokio::test]
    async fn pending_bytes_are_flushed_first() {
        let (client_near, mut client_far) = tokio::io::duplex(1024);
        let (origin_near, mut origin_far) = tokio::io::duplex(1024);

        let relay = tokio::spawn(async move {
            super::run(
                Box::new(client_near) as BoxedStream,
                b"hello-",
                Box::new(origin_near) as BoxedStream,
                b"early",
            )
            .await
        });

        let mut buf = [0u8; 6];
        origin_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello-");

        let mut buf = [0u8; 5];
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");

        drop(client_far);
        drop(origin_far);
        let _ = relay.await.unwrap();
    }
}
