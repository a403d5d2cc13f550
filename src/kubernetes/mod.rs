// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes API helpers.

pub mod patcher;

pub use patcher::ServicePatcher;
