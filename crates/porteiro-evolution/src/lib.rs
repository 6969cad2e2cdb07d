pub mod client;
pub mod event;

pub use client::EvolutionClient;
pub use event::{extract_inbound, Extracted};
