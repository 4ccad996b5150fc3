//! Connection pooling example.
//!
//! Builds a pool from a URL, runs concurrent requests through it and prints
//! the pool status along the way.
//!
//! # Running
//!
//! ```bash
//! export KV_URL="redis://localhost:6379/0?max_connections=4&timeout=5&max_idle_time=2&idle_check_interval=0.5"
//!
//! cargo run --example connection_pool
//! ```

// Allow common patterns in example code
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use kv_pool::{Pool, PoolError, PoolStatus};
use tokio::time::Instant;

const PING: &[u8] = b"*1\r\n$4\r\nPING\r\n";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let url = std::env::var("KV_URL").unwrap_or_else(|_| {
        "redis://localhost:6379/0?max_connections=4&timeout=5&max_idle_time=2&idle_check_interval=0.5"
            .into()
    });

    println!("=== Connection Pool Example ===\n");

    let pool = Arc::new(Pool::from_url(&url)?);
    println!("Pool: {}", pool.describe());
    println!("  Max connections: {:?}", pool.config().max_connections);
    println!("  Acquire timeout: {:?}", pool.config().timeout);
    println!("  Idle reaping: {:?}", pool.config().idle_reaping());
    println!();

    // Example 1: Basic pool usage
    println!("1. Basic pool usage:");
    {
        let conn = pool.get().await?;
        let reply = conn.request(PING).await?;
        println!("  Reply: {:?}", String::from_utf8_lossy(&reply));
        // Connection is automatically returned to pool when dropped
    }
    print_pool_status(&pool.status());

    // Example 2: Concurrent usage
    println!("\n2. Concurrent pool usage (16 parallel requests):");
    let start = Instant::now();
    let mut handles = vec![];

    for i in 0..16 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            let conn = pool.get().await?;
            conn.request(PING).await?;
            Ok::<_, PoolError>(i)
        }));
    }

    let mut completed = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => completed += 1,
            Err(e) => println!("  Request failed: {e}"),
        }
    }
    println!("  Completed {} requests in {:?}", completed, start.elapsed());
    print_pool_status(&pool.status());

    // Example 3: Idle reaping
    if let Some((max_idle_time, _)) = pool.config().idle_reaping() {
        println!("\n3. Waiting {:?} for idle connections to be reaped:", max_idle_time);
        tokio::time::sleep(max_idle_time + Duration::from_secs(1)).await;
        print_pool_status(&pool.status());
    }

    pool.close().await;
    println!("\nPool closed.");

    Ok(())
}

fn print_pool_status(status: &PoolStatus) {
    println!(
        "  Status: {} available, {} in use, {} total",
        status.available, status.in_use, status.total
    );
    if let Some(utilization) = status.utilization() {
        println!("  Utilization: {utilization:.1}%");
    }
}
