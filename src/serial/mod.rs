//! Serial link handling
//!
//! This module provides:
//! - A line/payload channel usable over any port with read timeouts
//! - Serial port opening and discovery (requires the `serial` feature)

pub mod link;
#[cfg(feature = "serial")]
pub mod port;

pub use link::Link;
#[cfg(feature = "serial")]
pub use port::PortConfig;
