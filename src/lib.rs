//! testdeck: a control plane for scripted browser test runs.
//!
//! The server owns a catalog of runs, each with a fixed ordered step list.
//! Starting a run spawns a runner subprocess whose stdout carries
//! sentinel-framed JSON progress events; the server decodes them, updates
//! the persisted run record, and fans every event out to WebSocket viewers.

pub mod api;
pub mod db;
pub mod errors;
pub mod models;
pub mod runner;
pub mod server;
pub mod ws;
