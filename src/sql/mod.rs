//! Safe SQL builder: identifiers validated and quoted, values always bound as parameters.

mod builder;
mod filter;
pub mod params;
pub use builder::*;
pub use filter::*;
pub use params::*;
