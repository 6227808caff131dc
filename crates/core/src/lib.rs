// crates/core/src/lib.rs
pub mod anomaly;
pub mod decoder;
pub mod enhance;
pub mod entries;
pub mod error;
pub mod types;

pub use anomaly::*;
pub use decoder::*;
pub use enhance::*;
pub use entries::*;
pub use error::*;
pub use types::*;
