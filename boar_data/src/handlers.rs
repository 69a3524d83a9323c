//! Mutating handlers of the bot's data layer
//!
//! Every handler that changes documents goes through the `Coordinator` and
//! declares its whole key set before touching anything. Read-only peeks
//! (`peek_user`, `is_banned`) read the store directly and take no lane.

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use lanekeeper::{Coordinator, Error, GlobalPartition, ResourceKey, Store};

use crate::error::HandlerError;
use crate::records::{
    BanList, Board, GuildRecord, ItemLedger, Leaderboard, Order, Trade, UserRecord,
};

/// Result of an operation body
type Body<T> = Result<T, Error<HandlerError>>;

/// How often a market purchase is resubmitted when the cheapest order
/// changed sellers between peeking and acquiring
const MAX_BUY_ATTEMPTS: usize = 3;

const HOUR_MS: u64 = 60 * 60 * 1000;

fn board_keys() -> Result<Vec<(Board, ResourceKey)>, HandlerError> {
    Board::ALL
        .iter()
        .map(|board| Ok((*board, ResourceKey::leaderboard(board.name())?)))
        .collect()
}

fn caller<T>(err: HandlerError) -> Body<T> {
    Err(Error::Caller(err))
}

/// The bot's data handlers over one store
pub struct BoarData<S: Store> {
    coord: Coordinator<S>,
}

impl<S: Store> Clone for BoarData<S> {
    fn clone(&self) -> Self {
        Self {
            coord: self.coord.clone(),
        }
    }
}

impl<S: Store + 'static> BoarData<S> {
    #[must_use]
    pub fn new(coord: Coordinator<S>) -> Self {
        Self { coord }
    }

    #[must_use]
    pub fn coordinator(&self) -> &Coordinator<S> {
        &self.coord
    }

    async fn peek<T: DeserializeOwned + Default>(
        &self,
        key: &ResourceKey,
    ) -> Result<T, HandlerError> {
        let doc = self
            .coord
            .store()
            .fetch(key)
            .await
            .map_err(|e| HandlerError::Data(Error::StoreRead(e)))?;
        match doc {
            Some(doc) => doc
                .to_typed()
                .map_err(|e| HandlerError::Data(Error::StoreRead(e))),
            None => Ok(T::default()),
        }
    }

    /// Current record of a user, without taking its lane
    ///
    /// # Errors
    /// `InvalidId`, or `Data` if the store cannot be read.
    pub async fn peek_user(&self, user_id: &str) -> Result<UserRecord, HandlerError> {
        self.peek(&ResourceKey::user(user_id)?).await
    }

    // ========================================================================
    // Collection
    // ========================================================================

    /// Give a user `count` of an item and `score` bucks
    ///
    /// # Errors
    /// `InvalidId` or `Data`.
    pub async fn grant_item(
        &self,
        user_id: &str,
        item_id: &str,
        count: u64,
        score: i64,
    ) -> Result<UserRecord, HandlerError> {
        let key = ResourceKey::user(user_id)?;
        let item_id = item_id.to_string();

        let user = self
            .coord
            .run_one(key.clone(), |txn| async move {
                let mut user: UserRecord = txn.load_as(&key).await?;
                user.add_items(&item_id, count);
                user.score = user.score.saturating_add(score);
                txn.stage_as(&key, &user)?;
                Ok::<_, Error<HandlerError>>(user)
            })
            .await?;
        debug!("grant_item: user {user_id} now has {} item(s)", user.total_items);
        Ok(user)
    }

    /// Move `count` of an item from one user to another
    ///
    /// # Errors
    /// `SelfTransfer`, `InsufficientItems` (nothing written), `InvalidId` or
    /// `Data`.
    pub async fn transfer_item(
        &self,
        from_id: &str,
        to_id: &str,
        item_id: &str,
        count: u64,
    ) -> Result<(), HandlerError> {
        if from_id == to_id {
            return Err(HandlerError::SelfTransfer);
        }
        let from_key = ResourceKey::user(from_id)?;
        let to_key = ResourceKey::user(to_id)?;
        let (from_id, item_id) = (from_id.to_string(), item_id.to_string());

        self.coord
            .run([from_key.clone(), to_key.clone()], |txn| async move {
                let mut from: UserRecord = txn.load_as(&from_key).await?;
                let mut to: UserRecord = txn.load_as(&to_key).await?;

                let have = from.count_of(&item_id);
                if !from.take_items(&item_id, count) {
                    return caller(HandlerError::InsufficientItems {
                        user_id: from_id,
                        item_id,
                        have,
                        need: count,
                    });
                }
                to.add_items(&item_id, count);

                txn.stage_as(&from_key, &from)?;
                txn.stage_as(&to_key, &to)?;
                Ok::<_, Error<HandlerError>>(())
            })
            .await?;
        Ok(())
    }

    // ========================================================================
    // Market
    // ========================================================================

    /// Put `num` of an item up for sale at `price` bucks each
    ///
    /// # Errors
    /// `InsufficientItems` (nothing written), `InvalidId` or `Data`.
    pub async fn list_sell(
        &self,
        seller_id: &str,
        item_id: &str,
        price: i64,
        num: u64,
        now_ms: u64,
    ) -> Result<(), HandlerError> {
        let seller_key = ResourceKey::user(seller_id)?;
        let market = ResourceKey::market(item_id)?;
        let (seller_id, item_id) = (seller_id.to_string(), item_id.to_string());

        self.coord
            .run([seller_key.clone(), market.clone()], |txn| async move {
                let mut seller: UserRecord = txn.load_as(&seller_key).await?;
                let mut ledger: ItemLedger = txn.load_as(&market).await?;

                let have = seller.count_of(&item_id);
                if !seller.take_items(&item_id, num) {
                    return caller(HandlerError::InsufficientItems {
                        user_id: seller_id,
                        item_id,
                        have,
                        need: num,
                    });
                }
                ledger.sellers.push(Order {
                    user_id: seller_id,
                    price,
                    num,
                    list_time: now_ms,
                    ..Order::default()
                });

                txn.stage_as(&seller_key, &seller)?;
                txn.stage_as(&market, &ledger)?;
                Ok::<_, Error<HandlerError>>(())
            })
            .await?;
        Ok(())
    }

    /// Buy one of an item from the cheapest sell order
    ///
    /// The seller is only known after reading the ledger, so the ledger is
    /// peeked first to pick the key set. If the cheapest order belongs to
    /// someone else by the time the lanes are held, the body fails with
    /// `UndeclaredKey` and the purchase is resubmitted.
    ///
    /// # Errors
    /// `NoSellOrder`, `InsufficientFunds` (nothing written), `InvalidId` or
    /// `Data`.
    pub async fn buy_from_market(
        &self,
        buyer_id: &str,
        item_id: &str,
        now_ms: u64,
    ) -> Result<Trade, HandlerError> {
        let buyer_key = ResourceKey::user(buyer_id)?;
        let market = ResourceKey::market(item_id)?;

        let mut attempt = 0;
        loop {
            attempt += 1;

            let ledger: ItemLedger = self.peek(&market).await?;
            let Some(idx) = ledger.cheapest_sell(buyer_id) else {
                return Err(HandlerError::NoSellOrder {
                    item_id: item_id.to_string(),
                });
            };
            let seller_key = ResourceKey::user(&ledger.sellers[idx].user_id)?;

            let keys = [buyer_key.clone(), seller_key, market.clone()];
            let captured = (
                buyer_key.clone(),
                market.clone(),
                buyer_id.to_string(),
                item_id.to_string(),
            );
            let result = self
                .coord
                .run(keys, |txn| async move {
                    let (buyer_key, market, buyer_id, item_id) = captured;
                    let mut ledger: ItemLedger = txn.load_as(&market).await?;
                    let Some(idx) = ledger.cheapest_sell(&buyer_id) else {
                        return caller(HandlerError::NoSellOrder { item_id });
                    };
                    let seller_key = ResourceKey::user(&ledger.sellers[idx].user_id)
                        .map_err(|e| Error::Caller(HandlerError::from(e)))?;
                    let mut seller: UserRecord = txn.load_as(&seller_key).await?;
                    let mut buyer: UserRecord = txn.load_as(&buyer_key).await?;

                    let price = ledger.sellers[idx].price;
                    if buyer.score < price {
                        return caller(HandlerError::InsufficientFunds {
                            user_id: buyer_id,
                            have: buyer.score,
                            need: price,
                        });
                    }
                    buyer.score -= price;
                    buyer.add_items(&item_id, 1);
                    seller.score = seller.score.saturating_add(price);

                    let order = &mut ledger.sellers[idx];
                    order.filled_amount += 1;
                    order.claimed_amount += 1;
                    if order.remaining() == 0 {
                        ledger.sellers.remove(idx);
                    }
                    ledger.last_buys = Trade(price, now_ms, buyer_id);

                    txn.stage_as(&buyer_key, &buyer)?;
                    txn.stage_as(&seller_key, &seller)?;
                    txn.stage_as(&market, &ledger)?;
                    Ok::<_, Error<HandlerError>>(ledger.last_buys)
                })
                .await;

            match result {
                Err(Error::UndeclaredKey(key)) if attempt < MAX_BUY_ATTEMPTS => {
                    debug!("buy_from_market: cheapest '{item_id}' order moved to '{key}', resubmitting");
                }
                other => return other.map_err(HandlerError::from),
            }
        }
    }

    // ========================================================================
    // Leaderboards
    // ========================================================================

    /// Write the user's current standing to every leaderboard
    ///
    /// # Errors
    /// `InvalidId` or `Data`.
    pub async fn update_leaderboards(
        &self,
        user_id: &str,
        username: &str,
    ) -> Result<(), HandlerError> {
        let user_key = ResourceKey::user(user_id)?;
        let boards = board_keys()?;
        let mut keys: Vec<ResourceKey> = boards.iter().map(|(_, key)| key.clone()).collect();
        keys.push(user_key.clone());
        let (user_id, username) = (user_id.to_string(), username.to_string());

        self.coord
            .run(keys, |txn| async move {
                let user: UserRecord = txn.load_as(&user_key).await?;
                for (board, key) in &boards {
                    let mut data: Leaderboard = txn.load_as(key).await?;
                    data.set(&user_id, &username, board.value_of(&user));
                    txn.stage_as(key, &data)?;
                }
                Ok::<_, Error<HandlerError>>(())
            })
            .await?;
        Ok(())
    }

    /// Drop a user from every leaderboard
    ///
    /// # Errors
    /// `Data`.
    pub async fn remove_leaderboard_user(&self, user_id: &str) -> Result<(), HandlerError> {
        let boards = board_keys()?;
        let keys: Vec<ResourceKey> = boards.iter().map(|(_, key)| key.clone()).collect();
        let user_id = user_id.to_string();

        self.coord
            .run(keys, |txn| async move {
                for (_, key) in &boards {
                    let mut data: Leaderboard = txn.load_as(key).await?;
                    data.remove(&user_id);
                    txn.stage_as(key, &data)?;
                }
                Ok::<_, Error<HandlerError>>(())
            })
            .await?;
        Ok(())
    }

    // ========================================================================
    // Guilds
    // ========================================================================

    /// Mark a guild as configured
    ///
    /// # Errors
    /// `InvalidId` or `Data`.
    pub async fn setup_guild(
        &self,
        guild_id: &str,
        trade_channel: &str,
        channels: Vec<String>,
    ) -> Result<GuildRecord, HandlerError> {
        let key = ResourceKey::guild(guild_id)?;
        let trade_channel = trade_channel.to_string();

        let guild = self
            .coord
            .run_one(key.clone(), |txn| async move {
                let mut guild: GuildRecord = txn.load_as(&key).await?;
                guild.trade_channel = trade_channel;
                guild.channels = channels;
                guild.fully_setup = true;
                txn.stage_as(&key, &guild)?;
                Ok::<_, Error<HandlerError>>(guild)
            })
            .await?;
        info!("guild {guild_id} configured");
        Ok(guild)
    }

    /// Delete the guild's document unless setup was completed.
    /// Returns whether a document was removed.
    ///
    /// # Errors
    /// `InvalidId` or `Data`.
    pub async fn remove_guild_if_unconfigured(&self, guild_id: &str) -> Result<bool, HandlerError> {
        let key = ResourceKey::guild(guild_id)?;

        let removed = self
            .coord
            .run_one(key.clone(), |txn| async move {
                let Some(doc) = txn.fetch(&key).await? else {
                    return Ok(false);
                };
                let guild: GuildRecord = doc.to_typed().map_err(Error::<HandlerError>::StoreRead)?;
                if guild.fully_setup {
                    return Ok(false);
                }
                txn.delete(&key)?;
                Ok::<_, Error<HandlerError>>(true)
            })
            .await?;
        if removed {
            info!("guild {guild_id} removed before finishing setup");
        }
        Ok(removed)
    }

    // ========================================================================
    // Bans
    // ========================================================================

    /// Ban a user for `hours`; returns the unban time
    ///
    /// # Errors
    /// `InvalidId` or `Data`.
    pub async fn ban_user(&self, user_id: &str, hours: u64, now_ms: u64) -> Result<u64, HandlerError> {
        // Validates the id
        ResourceKey::user(user_id)?;
        let bans = ResourceKey::global(GlobalPartition::BannedUsers);
        let until = now_ms.saturating_add(hours.saturating_mul(HOUR_MS));
        let user_id = user_id.to_string();

        self.coord
            .run_one(bans.clone(), |txn| async move {
                let mut list: BanList = txn.load_as(&bans).await?;
                list.0.insert(user_id, until);
                txn.stage_as(&bans, &list)?;
                Ok::<_, Error<HandlerError>>(())
            })
            .await?;
        Ok(until)
    }

    /// Unban time if the user is still banned; an expired ban is lifted
    ///
    /// # Errors
    /// `Data`.
    pub async fn check_ban(&self, user_id: &str, now_ms: u64) -> Result<Option<u64>, HandlerError> {
        let bans = ResourceKey::global(GlobalPartition::BannedUsers);
        let user_id = user_id.to_string();

        let remaining = self
            .coord
            .run_one(bans.clone(), |txn| async move {
                let mut list: BanList = txn.load_as(&bans).await?;
                match list.0.get(&user_id).copied() {
                    Some(until) if until > now_ms => Ok(Some(until)),
                    Some(_) => {
                        list.0.remove(&user_id);
                        txn.stage_as(&bans, &list)?;
                        debug!("check_ban: lifted expired ban of {user_id}");
                        Ok(None)
                    }
                    None => Ok::<_, Error<HandlerError>>(None),
                }
            })
            .await?;
        Ok(remaining)
    }

    /// Whether the user is banned at `now_ms`, without taking the lane
    ///
    /// # Errors
    /// `Data`.
    pub async fn is_banned(&self, user_id: &str, now_ms: u64) -> Result<bool, HandlerError> {
        let list: BanList = self
            .peek(&ResourceKey::global(GlobalPartition::BannedUsers))
            .await?;
        Ok(list.0.get(user_id).is_some_and(|until| *until > now_ms))
    }
}
