// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! CLI module for txcoord
//!
//! Offline inspection and repair of a coordinator's transaction log, plus a
//! demo workload against in-memory resources.

pub mod commands;
pub mod handlers;
pub mod output;

pub use commands::{Cli, Commands};
pub use handlers::{handle_checkpoint, handle_demo, handle_forget, handle_in_doubt, handle_inspect};
