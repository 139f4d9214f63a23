//! Cache entries and download accounting

mod counter;
mod entries;

pub use counter::DownloadCounter;
pub use entries::{CacheEntryPayload, CacheEntryService};
