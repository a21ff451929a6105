use std::net::SocketAddr;
use std::time::Duration;
use clap::Parser;
use clap_derive::Parser;
use connectless::config::ConnectlessConfig;
use connectless::end_point::{ConnectionHandle, EndPoint};
use tokio::select;
use tracing::{info, warn, Level};

/// Echo server / client: the server sends every reliable chunk and every unreliable datagram
///  back to where it came from.
#[derive(Parser)]
struct Args {
    /// address to bind to
    bind_address: String,

    /// runs as a client sending to this server instead of running as a server
    #[clap(long)]
    server: Option<String>,

    /// number of messages the client sends
    #[clap(long, default_value_t = 10)]
    count: u32,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let bind_addr: SocketAddr = args.bind_address.parse()?;
    let end_point = EndPoint::bind(bind_addr, ConnectlessConfig::default_ipv4()).await?;
    info!("listening on {:?}", end_point.local_addr()?);

    match args.server {
        None => run_server(end_point).await,
        Some(server) => run_client(end_point, server.parse()?, args.count).await,
    }
}

async fn run_server(end_point: EndPoint) -> anyhow::Result<()> {
    while let Some(connection) = end_point.accept().await {
        info!("accepted connection from {:?}", connection.peer_addr());
        tokio::spawn(echo(connection));
    }
    Ok(())
}

async fn echo(connection: ConnectionHandle) {
    loop {
        select! {
            chunk = connection.read() => match chunk {
                Some(chunk) => {
                    if let Err(e) = connection.write(&chunk).await {
                        warn!("echoing to {:?} failed: {}", connection.peer_addr(), e);
                        return;
                    }
                }
                None => break,
            },
            datagram = connection.recv_unreliable() => match datagram {
                Some((opcode, payload)) => {
                    // stale echoes are dropped by the client, that is fine for an echo
                    let _ = connection.write_unreliable(opcode, &payload).await;
                }
                None => break,
            },
        }
    }
    info!("connection from {:?} terminated", connection.peer_addr());
}

async fn run_client(end_point: EndPoint, server: SocketAddr, count: u32) -> anyhow::Result<()> {
    let connection = end_point.connect(server)?;

    let mut expected = 0;
    for i in 0..count {
        let msg = format!("message #{}\n", i);
        expected += msg.len();
        connection.write(msg.as_bytes()).await?;
        connection.write_unreliable(1, &i.to_be_bytes()).await?;
    }

    let mut received = Vec::new();
    while received.len() < expected {
        select! {
            chunk = connection.read() => match chunk {
                Some(chunk) => received.extend_from_slice(&chunk),
                None => anyhow::bail!("connection terminated after {} of {} bytes", received.len(), expected),
            },
            Some((opcode, payload)) = connection.recv_unreliable() => {
                info!("unreliable echo: opcode {}, {:?}", opcode, payload);
            }
            _ = tokio::time::sleep(Duration::from_secs(10)) => {
                anyhow::bail!("timeout waiting for echo");
            }
        }
    }
    print!("{}", String::from_utf8_lossy(&received));

    connection.close();
    connection.closed().await;
    info!("connection closed: {:?}", connection.state());
    Ok(())
}
