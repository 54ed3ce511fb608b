//! Message delivery to a session's wrapper process.
//!
//! Each wrapper listens on its own Unix socket. Delivery is one-shot:
//! connect, write the raw payload, close. The wrapper feeds what it reads
//! into the session's input as if typed.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

use tlink_core::IpcEndpoint;

/// Default bound on a whole delivery (connect plus write).
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the liveness probe used before superseding a routing key holder.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Why a payload did not reach the endpoint.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Endpoint {endpoint} unreachable: {source}")]
    Unreachable {
        endpoint: IpcEndpoint,
        #[source]
        source: io::Error,
    },

    #[error("Delivery to {endpoint} timed out after {timeout:?}")]
    Timeout {
        endpoint: IpcEndpoint,
        timeout: Duration,
    },
}

/// Writes `payload` to the endpoint's socket and closes the connection.
///
/// There is no acknowledgement from the wrapper; a successful return means
/// the bytes were handed to the socket.
pub async fn deliver(
    endpoint: &IpcEndpoint,
    payload: &str,
    limit: Duration,
) -> Result<(), DeliveryError> {
    let attempt = async {
        let mut stream = UnixStream::connect(endpoint.path()).await?;
        stream.write_all(payload.as_bytes()).await?;
        stream.shutdown().await?;
        Ok::<_, io::Error>(())
    };

    match timeout(limit, attempt).await {
        Ok(Ok(())) => {
            debug!(endpoint = %endpoint, bytes = payload.len(), "Payload delivered");
            Ok(())
        }
        Ok(Err(source)) => Err(DeliveryError::Unreachable {
            endpoint: endpoint.clone(),
            source,
        }),
        Err(_) => Err(DeliveryError::Timeout {
            endpoint: endpoint.clone(),
            timeout: limit,
        }),
    }
}

/// Returns true if something accepts connections on the endpoint.
pub async fn probe_endpoint(endpoint: &IpcEndpoint, limit: Duration) -> bool {
    matches!(
        timeout(limit, UnixStream::connect(endpoint.path())).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_deliver_writes_raw_payload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wrapper.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let reader = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = String::new();
            stream.read_to_string(&mut buf).await.unwrap();
            buf
        });

        deliver(&IpcEndpoint::new(&path), "1", DELIVERY_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(reader.await.unwrap(), "1");
    }

    #[tokio::test]
    async fn test_deliver_to_missing_socket_fails() {
        let dir = TempDir::new().unwrap();
        let endpoint = IpcEndpoint::new(dir.path().join("gone.sock"));

        let err = deliver(&endpoint, "hello", DELIVERY_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_endpoint_liveness() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("live.sock");
        let endpoint = IpcEndpoint::new(&path);

        assert!(!probe_endpoint(&endpoint, PROBE_TIMEOUT).await);

        let _listener = UnixListener::bind(&path).unwrap();
        assert!(probe_endpoint(&endpoint, PROBE_TIMEOUT).await);
    }
}
