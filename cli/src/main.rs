//! Demo pipeline over an in-memory store
//!
//! Seeds a store with tweets, scans them once, and feeds two consumers from
//! a multiplexer: one writes text lengths through the bulk queue, the other
//! writes language flags through the throttled queue.
//!
//! Usage: `docstream-cli [config.json]`

use std::sync::Arc;

use docstream::decode::{self, Decoder};
use docstream::{
    BulkWriteQueue, Connection, DecodeError, Error, MemStore, Multiplexer, PagedFetcher, Query,
    RawRecord, StreamConfig, Tap, ThrottledWriteQueue, UpdateQueue,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

const INDEX: &str = "tweets";
const SEED: usize = 250;

#[derive(Debug, Clone, Deserialize)]
struct TweetBody {
    text: String,
    lang: String,
}

#[derive(Debug, Clone)]
struct Tweet {
    id: String,
    body: TweetBody,
}

fn tweet_decoder() -> Decoder<Tweet> {
    decode::with(|record: RawRecord| {
        let body = serde_json::from_value(record.source)
            .map_err(|e| DecodeError::new(record.id.clone(), e.to_string()))?;
        Ok(Tweet {
            id: record.id,
            body,
        })
    })
}

fn seed_store() -> MemStore {
    let langs = ["en", "de", "fr"];
    MemStore::with_records(
        INDEX,
        (0..SEED).map(|i| {
            RawRecord::new(
                format!("t{i}"),
                json!({
                    "text": "lorem ipsum ".repeat(i % 7 + 1),
                    "lang": langs[i % langs.len()],
                }),
            )
        }),
    )
}

fn load_config() -> Result<StreamConfig, Error> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(StreamConfig::default());
    };
    let text = std::fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("cannot read {path}: {e}")))?;
    StreamConfig::from_json_str(&text)
}

type TweetTap = Tap<PagedFetcher<MemStore, Tweet>>;

async fn write_lengths(tap: TweetTap, queue: Arc<BulkWriteQueue>) -> Result<usize, Error> {
    let mut count = 0;
    while tap.has_next().await? {
        let tweet = tap.next().await?;
        queue
            .update_field(&tweet.id, "length", json!(tweet.body.text.len()))
            .await;
        count += 1;
    }
    Ok(count)
}

async fn write_languages(
    tap: TweetTap,
    queue: ThrottledWriteQueue<MemStore>,
) -> Result<usize, Error> {
    let mut count = 0;
    while tap.has_next().await? {
        let tweet = tap.next().await?;
        queue
            .update_field(&tweet.id, "is_english", json!(tweet.body.lang == "en"))
            .await;
        count += 1;
    }
    Ok(count)
}

async fn run() -> Result<(), Error> {
    let config = load_config()?;
    info!(?config, "starting");

    let store = Arc::new(seed_store());
    let connection = Arc::new(Connection::from_store(Arc::clone(&store)));

    let fetcher = PagedFetcher::new(
        Arc::clone(&connection),
        Query::all(INDEX),
        config.fetch.clone(),
        tweet_decoder(),
    )?;
    info!(total_hits = fetcher.total_hits().await?, "query opened");

    let mux = Multiplexer::new(fetcher, ["length", "language"])?;
    let bulk = Arc::new(BulkWriteQueue::new(
        Arc::clone(&connection),
        INDEX,
        config.bulk.clone(),
    )?);
    let throttled =
        ThrottledWriteQueue::new(Arc::clone(&connection), INDEX, config.throttled.clone())?;

    let lengths = tokio::spawn(write_lengths(mux.tap("length")?, Arc::clone(&bulk)));
    let languages = tokio::spawn(write_languages(mux.tap("language")?, throttled.clone()));

    for (name, handle) in [("length", lengths), ("language", languages)] {
        match handle.await {
            Ok(Ok(count)) => info!(tap = name, records = count, "consumer finished"),
            Ok(Err(e)) => error!(tap = name, error = %e, "consumer failed"),
            Err(e) => error!(tap = name, error = %e, "consumer panicked"),
        }
    }

    let bulk_result = bulk.close().await;
    throttled.drain(config.bulk.close_timeout()).await?;
    throttled.close().await?;

    let bulk_stats = bulk.stats();
    let throttled_stats = throttled.stats();
    info!(
        acknowledged = bulk_stats.acknowledged,
        rejected = bulk_stats.rejected,
        resubmitted = bulk_stats.resubmitted,
        dropped = bulk_stats.dropped,
        "bulk queue"
    );
    info!(
        acknowledged = throttled_stats.acknowledged,
        throttled = throttled_stats.throttled,
        max_in_flight = throttled.max_in_flight(),
        "throttled queue"
    );
    info!(sample = ?store.get(INDEX, "t1"), "sample document");

    connection.shutdown();
    bulk_result
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "pipeline failed");
        std::process::exit(1);
    }
    info!("Program completed");
}
