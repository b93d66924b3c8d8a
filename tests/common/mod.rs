// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for topic, chaos and integration tests.
//!
//! This module provides:
//! - Redis testcontainer setup and raw key inspection
//! - The `OrderEvent` payload fixture
//! - Listener sinks and polling helpers

#![allow(dead_code)]

pub mod containers;
pub mod fixtures;

pub use containers::*;
pub use fixtures::*;
