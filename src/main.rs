// EsoxSolutions.ServicePool
// Keyed, reference-counted service pool with sliding TTL expiry

// Small demo of the pool lifecycle. Run with RUST_LOG=debug to watch the
// monitors renew and evict.

use esox_servicepool::{PoolConfiguration, ServicePool, StatefulService};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

struct Connection {
    addr: String,
}

impl StatefulService for Connection {
    fn close(&self) {
        println!("  Closed connection to {}", self.addr);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== EsoxSolutions.ServicePool ===");
    println!();

    let config = PoolConfiguration::new().with_ttl(Duration::from_millis(400));
    let pool: ServicePool<str, Connection> = match ServicePool::new(
        |addr: &str| {
            println!("  Connecting to {}", addr);
            Connection {
                addr: addr.to_string(),
            }
        },
        config,
    ) {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Error: {}", e);
            return;
        }
    };

    let first = pool.get("db-primary:5432").expect("pool is running");
    let second = pool.get("db-primary:5432").expect("pool is running");
    println!("  Shared instance: {}", std::sync::Arc::ptr_eq(&first, &second));
    println!("  References: {:?}", pool.ref_count("db-primary:5432"));

    let _replica = pool.get("db-replica:5432").expect("pool is running");

    pool.put("db-primary:5432", first).expect("balanced release");
    pool.put("db-primary:5432", second).expect("balanced release");
    println!("  Released primary, waiting for expiry...");

    tokio::time::sleep(Duration::from_secs(1)).await;
    println!("  Resident after idle period: {}", pool.len());

    pool.shutdown().await;
    println!("  Resident after shutdown: {}", pool.len());
}
