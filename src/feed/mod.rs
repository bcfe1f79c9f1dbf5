pub mod aggregator;
pub mod buffer;
pub mod supervisor;

pub use aggregator::{CandleAggregator, RawFeedEvent, TradeTick};
pub use buffer::CandleBuffer;
pub use supervisor::{FeedState, FeedSupervisor};
