//! # Realtime Core
//!
//! Core modules for the realtime fleet platform: the change-feed event model,
//! the provider traits external collaborators implement, and the shared error
//! type.

mod error;
mod feed;
mod provider;

pub use crate::error::*;
pub use crate::feed::*;
pub use crate::provider::*;
