//! The persistent hop-scotch index: strings, buckets, segments and the
//! table itself.

pub mod bucket;
pub mod hop_map;
pub mod pstr;
pub mod segment;

pub use hop_map::{HopMap, InsertOutcome, MapError, NEIGHBORHOOD};
pub use pstr::{PstrSlot, INLINE_CAP};
pub use segment::PersistData;
