//! Permission checks and row-level security.

mod permission;
mod rls;

pub use permission::*;
pub use rls::*;
