use crate::config::{Command, Config, FlightConfig, StoreConfig};
use anyhow::{Context, bail};
use core::{convert::Infallible, time::Duration};
use keyflight::{
    FlightScope, IdIssuer, LockStore, MemoryStore, RedisStore, SharedStore, StampedeSafeLookup,
    SystemClock,
};
use std::{
    collections::HashSet,
    io::{BufWriter, Write},
    sync::Arc,
    time::Instant,
};
use tokio::task::JoinSet;

pub async fn run(config: Config) -> anyhow::Result<()> {
    match &config.store {
        StoreConfig::Memory => dispatch(MemoryStore::new(), &config).await,
        StoreConfig::Redis { url } => {
            let store = RedisStore::connect(url)
                .await
                .with_context(|| format!("failed to connect to {url}"))?;
            tracing::info!(url, "connected to redis");
            dispatch(store, &config).await
        }
    }
}

async fn dispatch<S>(store: S, config: &Config) -> anyhow::Result<()>
where
    S: LockStore + Clone + 'static,
{
    match &config.command {
        Command::Ids {
            business_type,
            count,
            concurrency,
            quiet,
        } => {
            let issuer = IdIssuer::with_epoch(store, SystemClock, config.epoch)?;
            issue_ids(Arc::new(issuer), business_type, *count, *concurrency, *quiet).await
        }
        Command::Lookup {
            key,
            concurrency,
            load_delay_ms,
        } => {
            let delay = Duration::from_millis(*load_delay_ms);
            match config.flight {
                FlightConfig::Process => {
                    let lookup = StampedeSafeLookup::new(store);
                    stampede(Arc::new(lookup), key, *concurrency, delay).await
                }
                FlightConfig::Store(scope) => {
                    let lookup = StampedeSafeLookup::with_scope(store, scope);
                    stampede(Arc::new(lookup), key, *concurrency, delay).await
                }
            }
        }
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Splits `count` as evenly as possible across `callers`.
fn shares(count: usize, callers: usize) -> impl Iterator<Item = usize> {
    let base = count / callers;
    let extra = count % callers;
    (0..callers).map(move |i| base + usize::from(i < extra))
}

async fn issue_ids<S>(
    issuer: Arc<IdIssuer<S>>,
    business_type: &str,
    count: usize,
    concurrency: usize,
    quiet: bool,
) -> anyhow::Result<()>
where
    S: SharedStore + 'static,
{
    tracing::info!(business_type, count, concurrency, "issuing ids");
    let start = Instant::now();

    let mut callers = JoinSet::new();
    for share in shares(count, concurrency) {
        let issuer = Arc::clone(&issuer);
        let business_type = business_type.to_owned();
        callers.spawn(async move { issuer.next_ids(&business_type, share).await });
    }

    let mut ids = Vec::new();
    while let Some(joined) = callers.join_next().await {
        ids.extend(joined??);
    }
    let elapsed = start.elapsed();

    let distinct = ids.iter().collect::<HashSet<_>>().len();
    if distinct != ids.len() {
        bail!(
            "issued {} ids but only {} are distinct; the counter may have wrapped",
            ids.len(),
            distinct
        );
    }

    if !quiet {
        ids.sort_unstable();
        let mut out = BufWriter::new(std::io::stdout().lock());
        for id in &ids {
            writeln!(out, "{id}")?;
        }
        out.flush()?;
    }

    tracing::info!(
        issued = ids.len(),
        elapsed_ms = millis(elapsed),
        "all ids distinct"
    );
    Ok(())
}

async fn simulated_load(key: String, delay: Duration) -> Result<Vec<String>, Infallible> {
    tracing::info!(key, delay_ms = millis(delay), "running slow load");
    tokio::time::sleep(delay).await;
    Ok(vec!["aaa".to_owned(), "bbbb".to_owned()])
}

async fn stampede<S, F>(
    lookup: Arc<StampedeSafeLookup<S, F>>,
    key: &str,
    concurrency: usize,
    delay: Duration,
) -> anyhow::Result<()>
where
    S: SharedStore + 'static,
    F: FlightScope<S> + 'static,
{
    tracing::info!(key, concurrency, "starting concurrent reads");
    let start = Instant::now();

    let mut readers = JoinSet::new();
    for _ in 0..concurrency {
        let lookup = Arc::clone(&lookup);
        let key = key.to_owned();
        readers.spawn(async move {
            lookup
                .get(&key, move |key| simulated_load(key, delay))
                .await
        });
    }

    let mut served = 0_usize;
    let mut failed = 0_usize;
    let mut value = None;
    while let Some(joined) = readers.join_next().await {
        match joined? {
            Ok(v) => {
                served += 1;
                value.get_or_insert(v);
            }
            Err(e) => {
                failed += 1;
                tracing::warn!(error = %e, "read failed");
            }
        }
    }
    let elapsed = start.elapsed();
    let stats = lookup.stats();

    let report = serde_json::json!({
        "key": key,
        "readers": concurrency,
        "served": served,
        "failed": failed,
        "value": value,
        "loads": stats.loads,
        "hits": stats.hits,
        "coalesced": stats.coalesced,
        "elapsed_ms": millis(elapsed),
    });
    println!("{report}");

    tracing::info!(
        loads = stats.loads,
        elapsed_ms = millis(elapsed),
        in_flight_keys = lookup.in_flight_keys(),
        "reads finished"
    );
    if failed > 0 {
        bail!("{failed} of {concurrency} reads failed");
    }
    Ok(())
}
