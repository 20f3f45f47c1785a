//! Connection pooling over plain TCP.
//!
//! This example implements a minimal TCP [`ConnectionFactory`], points the
//! pool at a local listener standing in for a Gremlin server, and walks
//! through borrowing, backpressure and reconnection.
//!
//! # Running
//!
//! ```bash
//! cargo run --example connection_pool
//! ```

// Allow common patterns in example code
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use gremlin_driver_pool::{
    Backoff, Channel, ConnectionFactory, Endpoint, Pool, PoolError, PoolSettings,
    TransportError,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

struct TcpChannel {
    stream: Mutex<TcpStream>,
    open: AtomicBool,
}

#[async_trait]
impl Channel for TcpChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
        let _ = self.stream.lock().await.shutdown().await;
    }
}

struct TcpFactory;

#[async_trait]
impl ConnectionFactory for TcpFactory {
    type Channel = TcpChannel;

    async fn connect(&self, endpoint: &Endpoint) -> Result<TcpChannel, TransportError> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;
        Ok(TcpChannel {
            stream: Mutex::new(stream),
            open: AtomicBool::new(true),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Stand-in server that accepts and holds connections
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    println!("=== Connection Pool Example ===\n");

    let mut settings = PoolSettings::new().with_reconnect_backoff(Backoff::Exponential {
        initial: Duration::from_millis(50),
        max: Duration::from_secs(1),
    });
    settings.set_pool_size(2)?;
    settings.set_max_in_process_per_connection(2)?;
    settings.set_nr_reconnect_retries(3)?;

    let endpoint = Endpoint::new("127.0.0.1").port(port);
    println!("Connecting to {endpoint}");

    let pool = Pool::builder(TcpFactory)
        .endpoint(endpoint)
        .settings(settings)
        .build()
        .await?;

    let mut events = pool.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("  [event] {event:?}");
        }
    });

    print_pool_status(&pool);

    // Example 1: Borrow until the pool pushes back
    println!("\n1. Borrowing connections:");
    let mut held = Vec::new();
    loop {
        match pool.get() {
            Ok(conn) => {
                println!("  borrowed connection {} from slot {}", conn.id(), conn.slot());
                held.push(conn);
            }
            Err(e @ PoolError::PoolBusy { .. }) => {
                println!("  {e}");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    print_pool_status(&pool);
    held.clear();

    // Example 2: Report a transport failure
    println!("\n2. Reporting a failed connection:");
    let conn = pool.get()?;
    let old_id = conn.id();
    conn.fail().await?;
    let conn = pool.get()?;
    println!("  connection {old_id} replaced by {}", conn.id());
    drop(conn);

    // Example 3: Dispose
    println!("\n3. Disposing the pool:");
    pool.dispose().await;
    match pool.get() {
        Err(e) => println!("  get after dispose: {e}"),
        Ok(_) => unreachable!("pool is disposed"),
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("\n=== Example Complete ===");
    Ok(())
}

fn print_pool_status<F: ConnectionFactory>(pool: &Pool<F>) {
    let status = pool.status();
    println!("Pool status:");
    println!("  Open: {}/{}", status.open, status.pool_size);
    println!("  Dead: {}", status.dead);
    println!("  Reconnecting: {}", status.reconnecting);
    println!("  In flight: {}", status.in_flight);
    println!("  Available capacity: {}", status.available);
}
