//! Wire-agnostic value types shared by the engine and bus crates.

mod error;
mod target;

pub use error::{DeliveryFailureKind, DriverError};
pub use target::{Address, DeliveryState, Service, Target};
