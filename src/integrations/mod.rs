// External integrations
pub mod price_feeds;

pub use price_feeds::{default_feeds, PriceProvider};
