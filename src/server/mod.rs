//! WebSocket broadcast server
//!
//! The listener accepts viewers and hands each one to a [`Connection`]
//! task; the scheduler it spawns owns the [`ViewerSet`] and pushes frames
//! into each viewer's queue.

pub mod config;
pub mod connection;
pub mod listener;
pub mod viewer;

pub use config::ServerConfig;
pub use connection::Connection;
pub use listener::BroadcastServer;
pub use viewer::{SendReport, Viewer, ViewerId, ViewerSet, ViewerState, ViewerStatus};
