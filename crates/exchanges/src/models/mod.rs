//! Data shapes passed between adapters, the pager and the normalizer.

mod record;
mod window;

pub use record::{Kline, Page, RawRecord, RecordFields};
pub use window::TimeWindow;
