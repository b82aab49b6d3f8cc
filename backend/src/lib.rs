//! # tropx-backend
//!
//! Motion-capture hub: coordinates a fleet of wearable IMU sensors over a
//! pluggable transport, aligns their clocks to the master timeline, derives
//! joint angles at a fixed target rate, and streams both a throttled UI feed
//! and a lossless recording to subscribers.
//!
//! Data flow: transport → registry → motion pipeline → (UI stream | recording
//! chunker) → streaming server / blob sink. Control flows the other way
//! through the [`coordinator::Coordinator`].

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod persistence;
pub mod pipeline;
pub mod recorder;
pub mod registry;
pub mod server;
pub mod timesync;
