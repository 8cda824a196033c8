pub mod http;
pub mod registry;
pub mod traits;

// Upstream adapters
pub mod coingecko;
pub mod tase_primary;
pub mod tase_reference;
pub mod tase_secondary;
pub mod tase_text;
pub mod yahoo;
