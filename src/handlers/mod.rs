//! Handler modules

pub mod admin;
pub mod connection;
pub mod game;
pub mod room_loop;
pub mod submission;

pub use connection::*;
pub use room_loop::*;
