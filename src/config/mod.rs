pub mod cache;
pub mod decode;
pub mod loader;
pub mod types;

pub use cache::*;
pub use decode::*;
pub use loader::*;
pub use types::*;
