//! Database query functions.
//!
//! Organized by table:
//! - `credential`: long-lived credential CRUD
//! - `token`: access token pool operations
//! - `usage`: append-only usage log
//! - `lease`: coordination lease rows

mod credential;
mod lease;
mod token;
mod usage;

pub use credential::*;
pub use lease::*;
pub use token::*;
pub use usage::*;
