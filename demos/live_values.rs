//! Live values demo: several consumers sharing one ticking source
//!
//! Run with: cargo run --example live_values [GRACE_MS]
//!
//! Two consumers attach to the same key and receive the same ticks from a
//! single subscription. After both detach, the entry lingers for the grace
//! period (default 500ms) and then evicts itself.
//!
//! Set RUST_LOG=stream_cache=trace to see every emission.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, Stream, StreamExt};
use stream_cache::{BoxError, CacheKey, RegistryConfig, SubscriptionRegistry, Update};

/// A source that ticks every `period`, counting how often it is started
fn ticker(
    period: Duration,
    starts: Arc<AtomicUsize>,
) -> impl Stream<Item = Result<u64, BoxError>> + Send + 'static {
    stream::unfold((0u64, starts), move |(n, starts)| async move {
        if n == 0 {
            starts.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(period).await;
        Some((Ok(n), (n + 1, starts)))
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let grace_ms = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<u64>()?,
        None => 500,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stream_cache=debug".parse()?)
                .add_directive("live_values=info".parse()?),
        )
        .init();

    let config = RegistryConfig::default().grace_period(Duration::from_millis(grace_ms));
    let registry = SubscriptionRegistry::with_config(config);
    let starts = Arc::new(AtomicUsize::new(0));

    let key = CacheKey::new("ticker").part("demo").option("periodMs", 100);
    let factory = || ticker(Duration::from_millis(100), Arc::clone(&starts));

    let mut first = registry.attach(key.clone(), factory)?;
    let mut second = registry.attach(key.clone(), factory)?;

    match first.read() {
        Ok(value) => println!("first read: {}", value),
        Err(e) if e.is_not_ready() => println!("first read: not ready yet"),
        Err(e) => println!("first read failed: {}", e),
    }

    let initial = first.entry().wait_first().await?;
    println!("initial value: {}", initial);

    for _ in 0..3 {
        tokio::select! {
            Some(Update::Value(v)) = first.next() => println!("consumer 1 <- {}", v),
            Some(Update::Value(v)) = second.next() => println!("consumer 2 <- {}", v),
        }
    }

    println!(
        "subscribers: {}, source started {} time(s)",
        first.entry().subscriber_count(),
        starts.load(Ordering::SeqCst)
    );

    let entry = Arc::clone(first.entry());
    first.detach();
    second.detach();
    println!("both detached, entry state: {:?}", entry.state());

    tokio::time::sleep(Duration::from_millis(grace_ms + 50)).await;
    println!(
        "after grace period: state {:?}, registry holds {} entr(ies), last value {:?}",
        entry.state(),
        registry.len(),
        entry.current_value()
    );

    Ok(())
}
