//! Exchange adapters and the contract they implement.

pub mod binance;
pub mod bybit;
pub mod capabilities;
pub mod traits;
pub mod wire;

pub use binance::{BinanceAdapter, BINANCE_ID};
pub use bybit::{BybitAdapter, BYBIT_ID};
pub use capabilities::{AdapterCapabilities, ChunkLimits, RateLimit};
pub use traits::{fetch_capability, ExchangeAdapter};
