//! HTTPS virtual-host routing by SNI.
//!
//! Works entirely at L4: the TLS session terminates at the tunnel client,
//! never here. We only peek the ClientHello for the server name, then
//! splice bytes.

use crate::sni;
use crate::table::{RouteTable, VhostError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Default deadline for the client to present its ClientHello.
pub const DEFAULT_SNI_TIMEOUT: Duration = Duration::from_secs(30);

const TLS_RECORD_HANDSHAKE: u8 = 0x16;
const MAX_RECORD_LEN: usize = 16 * 1024 + 256;

/// Serve one inbound TLS connection: read the first handshake record,
/// extract the SNI, route, and splice.
pub async fn handle_https_connection<S>(
    table: &RouteTable,
    mut conn: S,
    sni_timeout: Duration,
) -> Result<(), VhostError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let record = tokio::time::timeout(sni_timeout, read_handshake_record(&mut conn))
        .await
        .map_err(|_| VhostError::Timeout)??;

    let host = sni::extract_sni(&record[5..])
        .map(|h| h.to_ascii_lowercase())
        .ok_or(VhostError::SniExtraction)?;

    let matched = match table.lookup(&host, "") {
        Some(m) => m,
        None => {
            debug!("no https route for sni {}", host);
            return Err(VhostError::NoRoute(host));
        }
    };

    trace!("routing tls connection for {} to {}", host, matched.name);
    let mut backend = matched.target.open().await?;
    backend.write_all(&record).await?;
    backend.flush().await?;

    let (up, down) = tokio::io::copy_bidirectional(&mut conn, &mut backend).await?;
    trace!("tls splice for {} done ({} up, {} down)", host, up, down);
    Ok(())
}

/// Read one complete TLS record (header + body) and return the raw bytes so
/// they can be replayed to the backend.
async fn read_handshake_record<S>(conn: &mut S) -> Result<Vec<u8>, VhostError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    conn.read_exact(&mut header).await?;

    if header[0] != TLS_RECORD_HANDSHAKE {
        return Err(VhostError::InvalidRequest(format!(
            "not a tls handshake record (type {:#04x})",
            header[0]
        )));
    }

    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if len == 0 || len > MAX_RECORD_LEN {
        return Err(VhostError::InvalidRequest(format!(
            "implausible tls record length {}",
            len
        )));
    }

    let mut record = vec![0u8; 5 + len];
    record[..5].copy_from_slice(&header);
    conn.read_exact(&mut record[5..]).await?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sni::client_hello_with_sni;
    use crate::table::{BoxedStream, RouteTarget, VhostRoute};
    use async_trait::async_trait;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tokio::io::DuplexStream;

    struct QueueTarget {
        backends: Mutex<Vec<DuplexStream>>,
    }

    #[async_trait]
    impl RouteTarget for QueueTarget {
        async fn open(&self) -> io::Result<BoxedStream> {
            let mut backends = self.backends.lock().unwrap();
            backends
                .pop()
                .map(|s| Box::new(s) as BoxedStream)
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no backend available"))
        }
    }

    fn tls_record(handshake: &[u8]) -> Vec<u8> {
        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(handshake);
        record
    }

    fn table_with_backend(host: &str) -> (Arc<RouteTable>, DuplexStream) {
        let (server_side, backend_side) = tokio::io::duplex(32 * 1024);
        let table = Arc::new(RouteTable::new());
        table
            .register(
                VhostRoute {
                    host: host.to_string(),
                    location: String::new(),
                    name: "tls".to_string(),
                    rewrite_host: None,
                },
                Arc::new(QueueTarget {
                    backends: Mutex::new(vec![server_side]),
                }),
            )
            .unwrap();
        (table, backend_side)
    }

    #[tokio::test]
    async fn test_routes_by_sni_and_replays_client_hello() {
        let (table, mut backend) = table_with_backend("secure.example");
        let (mut client, server_conn) = tokio::io::duplex(32 * 1024);

        tokio::spawn(async move {
            let _ = handle_https_connection(&table, server_conn, DEFAULT_SNI_TIMEOUT).await;
        });

        let record = tls_record(&client_hello_with_sni("secure.example"));
        client.write_all(&record).await.unwrap();

        let mut got = vec![0u8; record.len()];
        backend.read_exact(&mut got).await.unwrap();
        assert_eq!(got, record);
    }

    #[tokio::test]
    async fn test_unknown_sni_is_rejected() {
        let (table, _backend) = table_with_backend("secure.example");
        let (mut client, server_conn) = tokio::io::duplex(32 * 1024);

        let handler = tokio::spawn(async move {
            handle_https_connection(&table, server_conn, DEFAULT_SNI_TIMEOUT).await
        });

        let record = tls_record(&client_hello_with_sni("other.example"));
        client.write_all(&record).await.unwrap();

        assert!(matches!(
            handler.await.unwrap(),
            Err(VhostError::NoRoute(_))
        ));
    }

    #[tokio::test]
    async fn test_non_tls_bytes_are_rejected() {
        let (table, _backend) = table_with_backend("secure.example");
        let (mut client, server_conn) = tokio::io::duplex(32 * 1024);

        let handler = tokio::spawn(async move {
            handle_https_connection(&table, server_conn, DEFAULT_SNI_TIMEOUT).await
        });

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        assert!(matches!(
            handler.await.unwrap(),
            Err(VhostError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_client_hello_times_out() {
        let (table, _backend) = table_with_backend("secure.example");
        let (_client, server_conn) = tokio::io::duplex(32 * 1024);

        let result =
            handle_https_connection(&table, server_conn, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(VhostError::Timeout)));
    }
}
