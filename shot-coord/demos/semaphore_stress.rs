use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use clap::Parser;
use hdrhistogram::Histogram;
use rand::Rng;
use shot_coord::LockOutcome;
use shot_coord::Semaphore;
use shot_coord::Store;
use shot_coord::store::MemoryStore;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

/// Hammer a shared semaphore, then show a crashed holder's token coming back.
#[derive(Parser, Debug)]
struct Args {
    /// Concurrent workers competing for the pool
    #[arg(long, default_value_t = 200)]
    workers: usize,

    /// Tokens in the pool
    #[arg(long, default_value = "8")]
    resources: NonZeroUsize,

    /// How long each worker holds its token, before jitter
    #[arg(long, value_parser = humantime::parse_duration, default_value = "20ms")]
    hold: Duration,

    /// How long a worker waits for a token before giving up
    #[arg(long, value_parser = humantime::parse_duration, default_value = "500ms")]
    wait: Duration,

    /// Lease age after which a holder is presumed dead
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    stale_timeout: Duration,

    /// Use the Redis server at this url instead of an in-process store
    #[cfg(feature = "redis")]
    #[arg(long)]
    redis_url: Option<String>,
}

async fn open_store(args: &Args) -> shot_coord::Result<Arc<dyn Store>> {
    #[cfg(feature = "redis")]
    if let Some(url) = &args.redis_url {
        return Ok(Arc::new(shot_coord::store::RedisStore::open(url).await?));
    }
    let _ = args;
    Ok(Arc::new(MemoryStore::new()))
}

async fn run_contention(args: &Args, store: Arc<dyn Store>) -> shot_coord::Result<()> {
    let semaphore = Semaphore::new(store, "stress", args.resources, Duration::from_secs(60));
    semaphore.delete().await?;

    let mut hist_wait = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut tasks = JoinSet::new();

    let start = Instant::now();
    for _ in 0..args.workers {
        let semaphore = semaphore.clone();
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        let jitter = rand::rng().random_range(0..=args.hold.as_millis() as u64);
        let hold = args.hold + Duration::from_millis(jitter);
        let wait = args.wait;

        tasks.spawn(async move {
            // Keep trying until this worker has held a token once
            let requested = Instant::now();
            let mut attempts = 0;
            loop {
                attempts += 1;
                let outcome = semaphore
                    .lock(Some(wait), |_| {
                        let active = Arc::clone(&active);
                        let peak = Arc::clone(&peak);
                        async move {
                            let waited = requested.elapsed();
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            sleep(hold).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            waited
                        }
                    })
                    .await?;
                if let LockOutcome::Acquired(waited) = outcome {
                    return Ok::<_, shot_coord::CoordError>((waited, attempts));
                }
            }
        });
    }

    let mut retries = 0;
    while let Some(task) = tasks.join_next().await {
        let (waited, attempts) = task.expect("Task panicked")?;
        retries += attempts - 1;
        hist_wait.record(waited.as_micros() as u64).unwrap();
    }

    println!("--- Contention ---");
    println!("Total Duration:  {:.2?}", start.elapsed());
    println!("Workers:         {}", args.workers);
    println!("Timed out waits: {}", retries);
    println!(
        "Peak holders:    {} (pool of {})",
        peak.load(Ordering::SeqCst),
        args.resources
    );
    println!("P50 (Wait):      {}µs", hist_wait.value_at_quantile(0.5));
    println!("P99 (Wait):      {}µs", hist_wait.value_at_quantile(0.99));
    println!("Available after: {}", semaphore.available_count().await?);
    println!();
    Ok(())
}

async fn run_crashed_holder(args: &Args, store: Arc<dyn Store>) -> shot_coord::Result<()> {
    let semaphore = Semaphore::new(
        store,
        "stress-crash",
        NonZeroUsize::MIN,
        Duration::from_secs(60),
    )
    .with_stale_client_timeout(args.stale_timeout)
    .with_stale_check_interval(args.stale_timeout);
    semaphore.delete().await?;

    // Take the only token and vanish without running any cleanup
    let (taken_tx, taken_rx) = oneshot::channel();
    let mut holder = Box::pin(semaphore.lock(None, move |_| async move {
        let _ = taken_tx.send(());
        futures::future::pending::<()>().await
    }));
    tokio::select! {
        outcome = &mut holder => {
            println!("Could not take the token to abandon: {:?}", outcome?);
            return Ok(());
        }
        _ = taken_rx => {}
    }
    std::mem::forget(holder);

    println!("--- Crashed Holder ---");
    let outcome = semaphore.lock(None, |_| async {}).await?;
    println!("Immediately:     acquired = {}", outcome.is_acquired());

    let start = Instant::now();
    loop {
        sleep(args.stale_timeout / 4).await;
        if semaphore.lock(None, |_| async {}).await?.is_acquired() {
            break;
        }
    }
    println!("Reclaimed after: {:.2?}", start.elapsed());
    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> shot_coord::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let store = open_store(&args).await?;

    run_contention(&args, Arc::clone(&store)).await?;
    run_crashed_holder(&args, store).await?;

    Ok(())
}
