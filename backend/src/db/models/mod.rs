//! Local database models.

pub mod preference;

pub use self::preference::*;
