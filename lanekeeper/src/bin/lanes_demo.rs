//! Show lanes at work on a file store.
//!
//! Usage: `lanes_demo [DATA_DIR]`. The directory defaults to
//! `$TMPDIR/lanes_demo` and is wiped first. Timeouts come from the
//! `LANEKEEPER_*` environment variables.

use futures::future::join_all;
use lanekeeper::{Coordinator, Document, Error, FileStore, QueueConfig, ResourceKey, Store};
use serde_json::json;
use std::time::Duration;
use tracing::info;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn score(doc: &Document) -> i64 {
    doc.as_value()["score"].as_i64().unwrap_or(0)
}

/// Read the score, think for `delay`, write it back plus `add`
async fn bump(
    coord: &Coordinator<FileStore>,
    key: &ResourceKey,
    add: i64,
    delay: Duration,
) -> Result<(), Error> {
    let key = key.clone();
    coord
        .run_one(key.clone(), |txn| async move {
            let current = score(&txn.load(&key).await?);
            tokio::time::sleep(delay).await;
            txn.stage(&key, Document::new(json!({ "score": current + add })))?;
            Ok::<_, Error>(())
        })
        .await
}

/// Move `amount` points between two keys; both are held together
async fn transfer(
    coord: &Coordinator<FileStore>,
    from: &ResourceKey,
    to: &ResourceKey,
    amount: i64,
) -> Result<(), Error> {
    let (from, to) = (from.clone(), to.clone());
    coord
        .run([from.clone(), to.clone()], |txn| async move {
            let a = score(&txn.load(&from).await?);
            let b = score(&txn.load(&to).await?);
            txn.stage(&from, Document::new(json!({ "score": a - amount })))?;
            txn.stage(&to, Document::new(json!({ "score": b + amount })))?;
            Ok::<_, Error>(())
        })
        .await
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let dir = std::env::args()
        .nth(1)
        .map_or_else(|| std::env::temp_dir().join("lanes_demo"), Into::into);
    let _ = std::fs::remove_dir_all(&dir);
    let config = QueueConfig::from_env();
    info!("data in {}, {config:?}", dir.display());

    let coord = Coordinator::new(FileStore::new(&dir)?, config);
    let alice = ResourceKey::user("alice")?;
    let bob = ResourceKey::user("bob")?;

    // Two overlapping read-modify-write operations on one key
    coord
        .store()
        .save(&alice, &Document::new(json!({ "score": 10 })))
        .await?;
    let (slow, fast) = tokio::join!(
        bump(&coord, &alice, 10, Duration::from_millis(50)),
        bump(&coord, &alice, 5, Duration::ZERO),
    );
    slow?;
    fast?;
    let after = score(&coord.store().load(&alice).await?);
    info!("alice after +10 and +5: {after}");

    // Transfers in both directions at once
    let moves = (0..20).map(|i| {
        if i % 2 == 0 {
            transfer(&coord, &alice, &bob, 1)
        } else {
            transfer(&coord, &bob, &alice, 2)
        }
    });
    for result in join_all(moves).await {
        result?;
    }

    let a = score(&coord.store().load(&alice).await?);
    let b = score(&coord.store().load(&bob).await?);
    info!("after transfers: alice={a} bob={b} total={}", a + b);
    info!("{} lane(s) in use", coord.queue().lane_count());
    Ok(())
}
