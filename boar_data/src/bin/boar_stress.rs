//! Fire concurrent interactions at a file store and check nothing was lost.
//!
//! Usage: `boar_stress [USERS] [ROUNDS]`

use boar_data::{BoarData, HandlerError};
use futures::future::join_all;
use lanekeeper::{Coordinator, FileStore, QueueConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const ITEM: &str = "normal";

fn arg(n: usize, default: usize) -> Result<usize, BoxError> {
    match std::env::args().nth(n) {
        Some(raw) => Ok(raw.parse()?),
        None => Ok(default),
    }
}

/// One user's interaction: collect, gift one to a neighbour, refresh boards
async fn interact(
    data: BoarData<FileStore>,
    user: usize,
    users: usize,
    granted: Arc<AtomicU64>,
    refused: Arc<AtomicU64>,
) -> Result<(), HandlerError> {
    let id = format!("u{user}");
    let neighbour = format!("u{}", (user + 1) % users);

    data.grant_item(&id, ITEM, 1, 10).await?;
    granted.fetch_add(1, Ordering::Relaxed);

    match data.transfer_item(&id, &neighbour, ITEM, 2).await {
        Ok(()) => {}
        Err(HandlerError::InsufficientItems { .. }) => {
            refused.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => return Err(e),
    }
    data.update_leaderboards(&id, &id).await
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let users = arg(1, 8)?.max(2);
    let rounds = arg(2, 50)?;
    let dir = std::env::temp_dir().join(format!("boar_stress_{}", std::process::id()));
    let config = QueueConfig::from_env();
    info!("{users} users x {rounds} rounds in {}", dir.display());

    let data = BoarData::new(Coordinator::new(FileStore::new(&dir)?, config));
    let granted = Arc::new(AtomicU64::new(0));
    let refused = Arc::new(AtomicU64::new(0));

    let tasks = (0..rounds).flat_map(|_| 0..users).map(|user| {
        tokio::spawn(interact(
            data.clone(),
            user,
            users,
            Arc::clone(&granted),
            Arc::clone(&refused),
        ))
    });

    let mut failed = 0;
    for joined in join_all(tasks).await {
        if let Err(e) = joined? {
            warn!("interaction failed: {e}");
            failed += 1;
        }
    }

    let mut held = 0;
    let mut score = 0;
    for user in 0..users {
        let record = data.peek_user(&format!("u{user}")).await?;
        held += record.count_of(ITEM);
        score += record.score;
    }
    let granted = granted.load(Ordering::Relaxed);
    info!(
        "granted={granted} held={held} bucks={score} refused transfers={} failed={failed}",
        refused.load(Ordering::Relaxed)
    );

    let _ = std::fs::remove_dir_all(&dir);
    if held != granted || score != 10 * i64::try_from(granted)? {
        return Err(format!("lost updates: granted {granted} but {held} held").into());
    }
    info!("no lost updates");
    Ok(())
}
