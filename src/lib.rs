//! Core library for the trawl_daq acquisition coordinator.
//!
//! trawl_daq drives a fixed set of cameras and serial sensors from one trigger
//! clock, writes every image with a synchronized record of sensor readings,
//! and answers remote queries over a length-prefixed TCP protocol. The
//! binary in `main.rs` is a thin shell around [`app::App`].

pub mod app;
pub mod camera;
pub mod collection;
pub mod config;
pub mod controller;
pub mod core;
pub mod error;
pub mod events;
pub mod metadata;
pub mod parameter;
pub mod scheduler;
pub mod sensor_bus;
pub mod server;
pub mod session;
pub mod state;
pub mod watchdog;
