//! Integration tests for the data handlers

use boar_data::{
    BanList, BoarData, Board, GuildRecord, HandlerError, ItemLedger, Leaderboard, Order,
    UserRecord,
};
use futures::future::join_all;
use lanekeeper::{
    Coordinator, Document, Error, FileStore, GlobalPartition, MemStore, QueueConfig,
    ResourceKey, Store,
};
use std::time::Duration;

fn data() -> BoarData<MemStore> {
    BoarData::new(Coordinator::new(MemStore::new(), QueueConfig::default()))
}

async fn seed<S: Store + 'static, T: serde::Serialize>(data: &BoarData<S>, key: &ResourceKey, value: &T) {
    let doc = Document::from_typed(value).unwrap();
    data.coordinator().store().save(key, &doc).await.unwrap();
}

async fn read<S: Store + 'static, T: serde::de::DeserializeOwned + Default>(
    data: &BoarData<S>,
    key: &ResourceKey,
) -> T {
    match data.coordinator().store().fetch(key).await.unwrap() {
        Some(doc) => doc.to_typed().unwrap(),
        None => T::default(),
    }
}

fn user(id: &str) -> ResourceKey {
    ResourceKey::user(id).unwrap()
}

// ============================================================================
// Collection
// ============================================================================

#[tokio::test]
async fn test_grant_then_transfer() {
    let data = data();
    data.grant_item("1", "gift", 3, 30).await.unwrap();

    data.transfer_item("1", "2", "gift", 2).await.unwrap();

    let from = data.peek_user("1").await.unwrap();
    let to = data.peek_user("2").await.unwrap();
    assert_eq!((from.count_of("gift"), from.total_items, from.score), (1, 1, 30));
    assert_eq!((to.count_of("gift"), to.total_items), (2, 2));
}

#[tokio::test]
async fn test_transfer_without_enough_items_writes_nothing() {
    let data = data();
    data.grant_item("1", "gift", 1, 0).await.unwrap();

    let err = data.transfer_item("1", "2", "gift", 2).await.unwrap_err();
    match err {
        HandlerError::InsufficientItems { have, need, .. } => assert_eq!((have, need), (1, 2)),
        other => panic!("Expected insufficient items, got {other:?}"),
    }
    assert!(!err.is_retryable());
    assert_eq!(data.peek_user("1").await.unwrap().count_of("gift"), 1);
    assert!(data.coordinator().store().fetch(&user("2")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_huge_grants_saturate_instead_of_failing() {
    let data = data();
    data.grant_item("1", "gift", u64::MAX, i64::MAX).await.unwrap();
    let user = data.grant_item("1", "gift", 1, 1).await.unwrap();
    assert_eq!(user.count_of("gift"), u64::MAX);
    assert_eq!(user.score, i64::MAX);
}

#[tokio::test]
async fn test_transfer_to_self_is_refused() {
    let data = data();
    let err = data.transfer_item("1", "1", "gift", 1).await.unwrap_err();
    assert!(matches!(err, HandlerError::SelfTransfer));
}

#[tokio::test]
async fn test_invalid_ids_are_rejected_before_locking() {
    let data = data();
    let err = data.grant_item("../etc", "gift", 1, 0).await.unwrap_err();
    assert!(matches!(err, HandlerError::InvalidId(_)));
    assert_eq!(data.coordinator().queue().lane_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transfers_conserve_items() {
    let data = data();
    let users = ["a", "b", "c", "d"];
    for id in users {
        data.grant_item(id, "gift", 10, 0).await.unwrap();
    }

    let tasks = (0..40).map(|i| {
        let data = data.clone();
        let from = users[i % 4];
        let to = users[(i + 1 + i / 4) % 4];
        tokio::spawn(async move {
            if from != to {
                let _ = data.transfer_item(from, to, "gift", 1).await;
            }
        })
    });
    for result in join_all(tasks).await {
        result.unwrap();
    }

    let mut total = 0;
    for id in users {
        let record = data.peek_user(id).await.unwrap();
        assert_eq!(record.total_items, record.count_of("gift"));
        total += record.count_of("gift");
    }
    assert_eq!(total, 40);
}

// ============================================================================
// Market
// ============================================================================

#[tokio::test]
async fn test_buy_fills_cheapest_order() {
    let data = data();
    let market = ResourceKey::market("gift").unwrap();
    data.grant_item("seller", "gift", 3, 0).await.unwrap();
    data.grant_item("buyer", "coin", 0, 20).await.unwrap();

    data.list_sell("seller", "gift", 5, 2, 100).await.unwrap();
    assert_eq!(data.peek_user("seller").await.unwrap().count_of("gift"), 1);

    let trade = data.buy_from_market("buyer", "gift", 200).await.unwrap();
    assert_eq!((trade.0, trade.1, trade.2.as_str()), (5, 200, "buyer"));

    let ledger: ItemLedger = read(&data, &market).await;
    assert_eq!(ledger.sellers.len(), 1);
    assert_eq!(ledger.sellers[0].filled_amount, 1);

    data.buy_from_market("buyer", "gift", 300).await.unwrap();
    let ledger: ItemLedger = read(&data, &market).await;
    assert!(ledger.sellers.is_empty());

    let buyer = data.peek_user("buyer").await.unwrap();
    let seller = data.peek_user("seller").await.unwrap();
    assert_eq!((buyer.score, buyer.count_of("gift")), (10, 2));
    assert_eq!(seller.score, 10);

    let err = data.buy_from_market("buyer", "gift", 400).await.unwrap_err();
    assert!(matches!(err, HandlerError::NoSellOrder { .. }));
}

#[tokio::test]
async fn test_buy_without_funds_writes_nothing() {
    let data = data();
    let market = ResourceKey::market("gift").unwrap();
    data.grant_item("seller", "gift", 1, 0).await.unwrap();
    data.list_sell("seller", "gift", 50, 1, 0).await.unwrap();
    let before: ItemLedger = read(&data, &market).await;

    let err = data.buy_from_market("buyer", "gift", 1).await.unwrap_err();
    assert!(matches!(err, HandlerError::InsufficientFunds { need: 50, .. }));

    let after: ItemLedger = read(&data, &market).await;
    assert_eq!(before, after);
    assert!(data.coordinator().store().fetch(&user("buyer")).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_buy_resubmits_when_seller_changes() {
    let data = data();
    let market = ResourceKey::market("gift").unwrap();
    data.grant_item("buyer", "coin", 0, 100).await.unwrap();
    let order = |seller: &str, price| Order {
        user_id: seller.to_string(),
        price,
        num: 1,
        ..Order::default()
    };
    seed(
        &data,
        &market,
        &ItemLedger {
            sellers: vec![order("a", 5)],
            ..ItemLedger::default()
        },
    )
    .await;

    // Hold the market lane; swap the cheapest order to seller b once the
    // purchase has peeked and is waiting.
    let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
    let holder = {
        let coord = data.coordinator().clone();
        let market = market.clone();
        tokio::spawn(async move {
            coord
                .run_one(market.clone(), |txn| async move {
                    go_rx.await.unwrap();
                    let ledger = ItemLedger {
                        sellers: vec![order("b", 3)],
                        ..ItemLedger::default()
                    };
                    txn.stage_as(&market, &ledger)?;
                    Ok::<_, Error>(())
                })
                .await
        })
    };
    while data.coordinator().queue().pending(&market) != 1 {
        tokio::task::yield_now().await;
    }

    let buy = {
        let data = data.clone();
        tokio::spawn(async move { data.buy_from_market("buyer", "gift", 0).await })
    };
    while data.coordinator().queue().pending(&market) != 2 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    go_tx.send(()).unwrap();

    holder.await.unwrap().unwrap();
    let trade = buy.await.unwrap().unwrap();
    assert_eq!(trade.0, 3);
    assert_eq!(data.peek_user("b").await.unwrap().score, 3);
    assert!(data.coordinator().store().fetch(&user("a")).await.unwrap().is_none());
    assert_eq!(data.peek_user("buyer").await.unwrap().score, 97);
}

// ============================================================================
// Leaderboards
// ============================================================================

#[tokio::test]
async fn test_leaderboards_follow_user_record() {
    let data = data();
    let mut record = UserRecord::default();
    record.score = 40;
    record.streak = 3;
    record.items.insert("gift".to_string(), 2);
    record.items.insert("boar".to_string(), 1);
    record.total_items = 3;
    seed(&data, &user("7"), &record).await;

    data.update_leaderboards("7", "boarfan").await.unwrap();

    let board = |b: Board| ResourceKey::leaderboard(b.name()).unwrap();
    let bucks: Leaderboard = read(&data, &board(Board::Bucks)).await;
    assert_eq!(bucks.user_data["7"], ("boarfan".to_string(), 40));
    assert_eq!(bucks.top_user.as_deref(), Some("7"));
    let uniques: Leaderboard = read(&data, &board(Board::Uniques)).await;
    assert_eq!(uniques.user_data["7"].1, 2);
    let gifts: Leaderboard = read(&data, &board(Board::GiftsUsed)).await;
    assert!(gifts.user_data.is_empty());

    data.remove_leaderboard_user("7").await.unwrap();
    for b in Board::ALL {
        let lb: Leaderboard = read(&data, &board(b)).await;
        assert!(!lb.user_data.contains_key("7"), "{} still lists user", b.name());
        assert_eq!(lb.top_user, None);
    }
}

// ============================================================================
// Guilds and bans
// ============================================================================

#[tokio::test]
async fn test_only_unconfigured_guilds_are_removed() {
    let data = data();
    let key = ResourceKey::guild("9").unwrap();

    assert!(!data.remove_guild_if_unconfigured("9").await.unwrap());

    seed(&data, &key, &GuildRecord::default()).await;
    assert!(data.remove_guild_if_unconfigured("9").await.unwrap());
    assert!(data.coordinator().store().fetch(&key).await.unwrap().is_none());

    let guild = data
        .setup_guild("9", "trade", vec!["boars".to_string()])
        .await
        .unwrap();
    assert!(guild.fully_setup);
    assert!(!data.remove_guild_if_unconfigured("9").await.unwrap());
    let stored: GuildRecord = read(&data, &key).await;
    assert_eq!(stored, guild);
}

#[tokio::test]
async fn test_ban_expires_and_is_lifted() {
    let data = data();
    let bans = ResourceKey::global(GlobalPartition::BannedUsers);

    let until = data.ban_user("5", 2, 1_000).await.unwrap();
    assert_eq!(until, 1_000 + 2 * 60 * 60 * 1000);

    assert!(data.is_banned("5", 2_000).await.unwrap());
    assert!(!data.is_banned("6", 2_000).await.unwrap());
    assert_eq!(data.check_ban("5", 2_000).await.unwrap(), Some(until));

    assert_eq!(data.check_ban("5", until).await.unwrap(), None);
    let list: BanList = read(&data, &bans).await;
    assert!(list.0.is_empty());
    assert!(!data.is_banned("5", 2_000).await.unwrap());
}

// ============================================================================
// Errors and file store
// ============================================================================

#[test]
fn test_layer_failures_are_retryable() {
    let timeout: HandlerError = Error::<HandlerError>::LaneTimeout { key: user("1") }.into();
    assert!(timeout.is_retryable());
    assert!(timeout.to_string().contains("try again"));

    let own: HandlerError = Error::Caller(HandlerError::SelfTransfer).into();
    assert!(matches!(own, HandlerError::SelfTransfer));
    assert!(!own.is_retryable());

    let panicked: HandlerError = Error::<HandlerError>::Panicked("bug".to_string()).into();
    assert!(!panicked.is_retryable());
}

#[tokio::test]
async fn test_handlers_on_file_store() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = FileStore::new(dir.path()).unwrap();
    let data = BoarData::new(Coordinator::new(store, QueueConfig::default()));

    data.grant_item("1", "gift", 2, 5).await.unwrap();
    data.transfer_item("1", "2", "gift", 1).await.unwrap();
    data.update_leaderboards("1", "one").await.unwrap();

    let reopened = FileStore::new(dir.path()).unwrap();
    let doc = reopened.load(&user("2")).await.unwrap();
    let to: UserRecord = doc.to_typed().unwrap();
    assert_eq!(to.count_of("gift"), 1);
    assert!(dir.path().join("global/leaderboard/bucks.json").is_file());
}
