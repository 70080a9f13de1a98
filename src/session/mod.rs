//! Session state module

pub mod player;
pub mod room;

pub use player::*;
pub use room::*;
