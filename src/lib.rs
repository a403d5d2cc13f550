// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
pub mod agent;
pub mod cloud;
pub mod config;
pub mod constants;
pub mod error;
pub mod kubernetes;
pub mod loadbalancer;
pub mod reconcilers;

#[cfg(test)]
pub mod test_utils;
