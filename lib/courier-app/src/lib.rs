//! Application bootstrapping.
//!
//! Everything a binary needs to set up before it starts processing, which for now is logging.
#![deny(missing_docs)]

pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::logging::{fatal_and_exit, initialize_logging};
}
