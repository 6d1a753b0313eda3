#![allow(clippy::module_inception)]

pub mod address;
pub mod amount;
pub mod backoff;
pub mod context;
pub mod duration;
pub mod error;
pub mod id;
pub mod time;

pub use address::{AddressError, AgentAddr};
pub use amount::{Amount, AmountError, AMOUNT_DECIMALS, AMOUNT_SCALE};
pub use context::{Actor, CallContext, CancelHandle, Cancelled};
pub use error::StorageError;
pub use time::{now_millis, TimestampMillis};
