//! LP (intermediary) HTTP API: wire types and client.

pub mod client;
pub mod types;

pub use client::{HttpIntermediaryApi, IntermediaryApi};
pub use types::*;
