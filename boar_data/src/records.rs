//! Typed documents of the bot's data layer
//!
//! Field names follow the bot's JSON files (camelCase). Every field has a
//! default, so documents written by older versions, or the empty document
//! of a key never saved, decode cleanly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-user collection and stats, stored at `user:<id>`
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct UserRecord {
    /// Bucks
    pub score: i64,
    pub total_items: u64,
    /// Item id to number owned
    pub items: BTreeMap<String, u64>,
    pub streak: u64,
    pub attempts: u64,
    pub top_attempts: u64,
    /// Unopened gifts
    pub gifts: u64,
    pub gifts_used: u64,
    pub multiplier: u64,
}

impl UserRecord {
    #[must_use]
    pub fn count_of(&self, item_id: &str) -> u64 {
        self.items.get(item_id).copied().unwrap_or(0)
    }

    /// Distinct items currently owned
    #[must_use]
    pub fn uniques(&self) -> u64 {
        self.items.values().filter(|n| **n > 0).count() as u64
    }

    pub(crate) fn add_items(&mut self, item_id: &str, count: u64) {
        let owned = self.items.entry(item_id.to_string()).or_insert(0);
        *owned = owned.saturating_add(count);
        self.total_items = self.total_items.saturating_add(count);
    }

    /// Take `count` of an item; `false` (and no change) if there are fewer
    pub(crate) fn take_items(&mut self, item_id: &str, count: u64) -> bool {
        let have = self.count_of(item_id);
        if have < count {
            return false;
        }
        if have == count {
            self.items.remove(item_id);
        } else {
            self.items.insert(item_id.to_string(), have - count);
        }
        self.total_items = self.total_items.saturating_sub(count);
        true
    }
}

/// Per-guild configuration, stored at `guild:<id>`
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct GuildRecord {
    pub fully_setup: bool,
    pub is_sb_server: bool,
    pub trade_channel: String,
    pub channels: Vec<String>,
}

/// User id to unban time (milliseconds since the epoch)
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct BanList(pub BTreeMap<String, u64>);

// ============================================================================
// Leaderboards
// ============================================================================

/// The leaderboards kept by the bot, one document each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Board {
    Bucks,
    Total,
    Uniques,
    Streak,
    Attempts,
    TopAttempts,
    GiftsUsed,
    Multiplier,
}

impl Board {
    pub const ALL: [Board; 8] = [
        Board::Bucks,
        Board::Total,
        Board::Uniques,
        Board::Streak,
        Board::Attempts,
        Board::TopAttempts,
        Board::GiftsUsed,
        Board::Multiplier,
    ];

    /// Key segment of the board's document
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Board::Bucks => "bucks",
            Board::Total => "total",
            Board::Uniques => "uniques",
            Board::Streak => "streak",
            Board::Attempts => "attempts",
            Board::TopAttempts => "topAttempts",
            Board::GiftsUsed => "giftsUsed",
            Board::Multiplier => "multiplier",
        }
    }

    /// The user's standing on this board
    #[must_use]
    pub fn value_of(self, user: &UserRecord) -> i64 {
        let unsigned = match self {
            Board::Bucks => return user.score,
            Board::Total => user.total_items,
            Board::Uniques => user.uniques(),
            Board::Streak => user.streak,
            Board::Attempts => user.attempts,
            Board::TopAttempts => user.top_attempts,
            Board::GiftsUsed => user.gifts_used,
            Board::Multiplier => user.multiplier,
        };
        i64::try_from(unsigned).unwrap_or(i64::MAX)
    }
}

/// One leaderboard
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct Leaderboard {
    pub top_user: Option<String>,
    /// User id to (username, value)
    pub user_data: BTreeMap<String, (String, i64)>,
}

impl Leaderboard {
    /// Record `value` for a user; non-positive values drop the user
    pub fn set(&mut self, user_id: &str, username: &str, value: i64) {
        if value > 0 {
            self.user_data
                .insert(user_id.to_string(), (username.to_string(), value));
        } else {
            self.user_data.remove(user_id);
        }
        self.refresh_top();
    }

    pub fn remove(&mut self, user_id: &str) {
        self.user_data.remove(user_id);
        self.refresh_top();
    }

    /// Highest value wins; ties go to the lowest user id
    fn refresh_top(&mut self) {
        self.top_user = self
            .user_data
            .iter()
            .max_by(|(id_a, (_, a)), (id_b, (_, b))| a.cmp(b).then_with(|| id_b.cmp(id_a)))
            .map(|(id, _)| id.clone());
    }
}

// ============================================================================
// Market
// ============================================================================

/// One buy or sell order on the market
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct Order {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub price: i64,
    pub num: u64,
    pub list_time: u64,
    pub filled_amount: u64,
    pub claimed_amount: u64,
}

impl Order {
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.num.saturating_sub(self.filled_amount)
    }
}

/// Price, time and user of the latest trade
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Trade(pub i64, pub u64, pub String);

/// Market state of one item, stored at `global:market:<item>`
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ItemLedger {
    pub buyers: Vec<Order>,
    pub sellers: Vec<Order>,
    pub last_buys: Trade,
    pub last_sells: Trade,
}

impl ItemLedger {
    /// Index of the cheapest open sell order not placed by `buyer_id`.
    /// Earlier listings win price ties.
    #[must_use]
    pub fn cheapest_sell(&self, buyer_id: &str) -> Option<usize> {
        self.sellers
            .iter()
            .enumerate()
            .filter(|(_, o)| o.remaining() > 0 && o.user_id != buyer_id)
            .min_by_key(|(i, o)| (o.price, *i))
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_record_decodes_partial_json() {
        let user: UserRecord =
            serde_json::from_str(r#"{"score": 12, "items": {"gift": 2}}"#).unwrap();
        assert_eq!(user.score, 12);
        assert_eq!(user.count_of("gift"), 2);
        assert_eq!(user.streak, 0);
    }

    #[test]
    fn test_take_items_is_all_or_nothing() {
        let mut user = UserRecord::default();
        user.add_items("boar", 3);

        assert!(!user.take_items("boar", 4));
        assert_eq!(user.count_of("boar"), 3);

        assert!(user.take_items("boar", 3));
        assert_eq!(user.uniques(), 0);
        assert_eq!(user.total_items, 0);
    }

    #[test]
    fn test_add_items_saturates() {
        let mut user = UserRecord::default();
        user.add_items("boar", u64::MAX - 1);
        user.add_items("boar", 5);
        user.add_items("gift", 1);
        assert_eq!(user.count_of("boar"), u64::MAX);
        assert_eq!(user.total_items, u64::MAX);
    }

    #[test]
    fn test_leaderboard_top_user() {
        let mut board = Leaderboard::default();
        board.set("2", "bea", 5);
        board.set("1", "al", 5);
        assert_eq!(board.top_user.as_deref(), Some("1"));

        board.set("3", "cy", 9);
        assert_eq!(board.top_user.as_deref(), Some("3"));

        board.set("3", "cy", 0);
        assert!(!board.user_data.contains_key("3"));
        assert_eq!(board.top_user.as_deref(), Some("1"));

        board.remove("1");
        board.remove("2");
        assert_eq!(board.top_user, None);
    }

    #[test]
    fn test_leaderboard_json_shape() {
        let mut board = Leaderboard::default();
        board.set("7", "boar", 42);
        assert_eq!(
            serde_json::to_value(&board).unwrap(),
            serde_json::json!({ "topUser": "7", "userData": { "7": ["boar", 42] } })
        );
    }

    #[test]
    fn test_cheapest_sell_skips_own_and_filled_orders() {
        let order = |user: &str, price, num, filled| Order {
            user_id: user.to_string(),
            price,
            num,
            filled_amount: filled,
            ..Order::default()
        };
        let ledger = ItemLedger {
            sellers: vec![
                order("me", 1, 1, 0),
                order("a", 3, 1, 1),
                order("b", 5, 2, 0),
                order("c", 5, 1, 0),
            ],
            ..ItemLedger::default()
        };
        assert_eq!(ledger.cheapest_sell("me"), Some(2));
        assert_eq!(ledger.cheapest_sell("x"), Some(0));
    }
}
