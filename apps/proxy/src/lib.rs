// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! StreamScribe server library: configuration, the session multiplexer,
//! per-participant pipelines and the WebSocket boundary. The binary in
//! `main.rs` is a thin CLI wrapper around [`server::start_server`].

pub mod config;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;
pub mod telemetry;

pub use config::Config;
