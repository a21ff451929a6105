use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use bytes::BytesMut;
use connectless::config::ConnectlessConfig;
use connectless::connection::ConnectionState;
use connectless::end_point::{ConnectionHandle, EndPoint};
use connectless::error::ConnectlessError;
use connectless::transform::StreamTransform;
use tokio::time::timeout;
use tracing::Level;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

fn localhost() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

async fn connected_pair(config: ConnectlessConfig) -> (EndPoint, EndPoint, ConnectionHandle, ConnectionHandle) {
    let server = EndPoint::bind(localhost(), config.clone()).await.unwrap();
    let client = EndPoint::bind(localhost(), config).await.unwrap();

    let client_conn = client.connect(server.local_addr().unwrap()).unwrap();
    let server_conn = timeout(Duration::from_secs(5), server.accept()).await
        .unwrap()
        .unwrap();
    assert_eq!(server_conn.peer_addr(), client.local_addr().unwrap());

    (server, client, server_conn, client_conn)
}

async fn read_exactly(conn: &ConnectionHandle, len: usize) -> Vec<u8> {
    let mut result = Vec::new();
    while result.len() < len {
        let chunk = timeout(Duration::from_secs(10), conn.read()).await
            .unwrap()
            .unwrap();
        result.extend_from_slice(&chunk);
    }
    result
}

#[tokio::test]
async fn test_reliable_transfer() {
    let mut config = ConnectlessConfig::default_ipv4();
    config.send_window_capacity = 32 * 1024;
    let (_server, _client, server_conn, client_conn) = connected_pair(config).await;

    let data: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();

    let writer = {
        let data = data.clone();
        tokio::spawn(async move {
            for chunk in data.chunks(10_000) {
                client_conn.write(chunk).await.unwrap();
            }
            client_conn
        })
    };

    let received = read_exactly(&server_conn, data.len()).await;
    assert_eq!(received, data);

    let client_conn = writer.await.unwrap();
    assert_eq!(client_conn.state(), ConnectionState::Active);
    assert_eq!(server_conn.state(), ConnectionState::Active);
}

#[tokio::test]
async fn test_both_directions() {
    let (_server, _client, server_conn, client_conn) = connected_pair(ConnectlessConfig::default_ipv4()).await;

    client_conn.write(b"ping").await.unwrap();
    assert_eq!(read_exactly(&server_conn, 4).await, b"ping");

    server_conn.write(b"pong").await.unwrap();
    assert_eq!(read_exactly(&client_conn, 4).await, b"pong");
}

#[tokio::test]
async fn test_unreliable_delivery() {
    let (_server, _client, server_conn, client_conn) = connected_pair(ConnectlessConfig::default_ipv4()).await;

    client_conn.write(b"state").await.unwrap();
    client_conn.write_unreliable(17, b"delta").await.unwrap();

    assert_eq!(read_exactly(&server_conn, 5).await, b"state");
    let (opcode, payload) = timeout(Duration::from_secs(5), server_conn.recv_unreliable()).await
        .unwrap()
        .unwrap();
    assert_eq!(opcode, 17);
    assert_eq!(payload.as_ref(), b"delta");

    let too_large = vec![0u8; 2000];
    assert!(matches!(client_conn.write_unreliable(1, &too_large).await, Err(ConnectlessError::DatagramTooLarge { .. })));
}

#[tokio::test]
async fn test_close() {
    let (server, _client, server_conn, client_conn) = connected_pair(ConnectlessConfig::default_ipv4()).await;

    client_conn.write(b"last words").await.unwrap();
    client_conn.close();

    assert_eq!(read_exactly(&server_conn, 10).await, b"last words");

    timeout(Duration::from_secs(5), client_conn.closed()).await.unwrap();
    timeout(Duration::from_secs(5), server_conn.closed()).await.unwrap();
    assert_eq!(client_conn.write(b"x").await, Err(ConnectlessError::Closed));

    // everything was read, so the stream ends
    assert!(timeout(Duration::from_secs(5), server_conn.read()).await.unwrap().is_none());

    for _ in 0..100 {
        if server.num_connections() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server connection was not detached");
}

/// XORs every byte with a fixed key
struct Xor(u8);
impl StreamTransform for Xor {
    fn encode(&mut self, input: &[u8], out: &mut BytesMut) -> anyhow::Result<()> {
        out.extend(input.iter().map(|b| b ^ self.0));
        Ok(())
    }

    fn decode(&mut self, input: &[u8], out: &mut BytesMut) -> anyhow::Result<()> {
        out.extend(input.iter().map(|b| b ^ self.0));
        Ok(())
    }
}

#[tokio::test]
async fn test_transform() {
    let factory = || Arc::new(|| Box::new(Xor(0x5a)) as Box<dyn StreamTransform>);
    let server = EndPoint::bind_with_transform(localhost(), ConnectlessConfig::default_ipv4(), factory()).await.unwrap();
    let client = EndPoint::bind_with_transform(localhost(), ConnectlessConfig::default_ipv4(), factory()).await.unwrap();

    let client_conn = client.connect(server.local_addr().unwrap()).unwrap();
    client_conn.write(b"transformed").await.unwrap();

    let server_conn = timeout(Duration::from_secs(5), server.accept()).await
        .unwrap()
        .unwrap();
    assert_eq!(read_exactly(&server_conn, 11).await, b"transformed");
}
