//! Shared vocabulary of the canopy commit core.
//!
//! Identifiers, the injectable tick clock, compacted range sets and tree
//! paths are used by every other crate in the workspace.

pub mod identifiers;
pub mod path;
pub mod ranges;
pub mod ticks;

pub use identifiers::{ClientId, FrontendId, LocalHistoryId, TransactionId, STANDALONE_HISTORY};
pub use path::{TreePath, WILDCARD_SEGMENT};
pub use ranges::RangeSet;
pub use ticks::{ManualTicker, SystemTicker, Ticker};
