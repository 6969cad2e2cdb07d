pub mod controller;
pub mod turn_id;

pub use controller::{TurnController, TurnStatus};
pub use turn_id::make_turn_id;
