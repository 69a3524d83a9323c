//! Data layer of the boar bot on top of `lanekeeper`
//!
//! ```text
//! command handler ──► BoarData::<handler> ──► Coordinator::run(keys, body)
//!                                                  │
//!                           user:<id>, guild:<id>, global:* lanes
//!                                                  │
//!                                               Store
//! ```

pub mod error;
pub mod handlers;
pub mod records;

pub use error::HandlerError;
pub use handlers::BoarData;
pub use records::{
    BanList, Board, GuildRecord, ItemLedger, Leaderboard, Order, Trade, UserRecord,
};
