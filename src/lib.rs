// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

pub mod blob_store;
pub mod config;
pub mod error;
pub mod events;
pub mod fs_store;
pub mod http;
pub mod metrics;
pub mod projection;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod turn_store;
