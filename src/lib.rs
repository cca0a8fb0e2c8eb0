// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
#[cfg(test)]
mod testing;

pub mod broker;
pub mod channel;
pub mod config;
pub mod connector;
pub mod consumer;
pub mod control;
pub mod errors;
pub mod forwarder;
pub mod publisher;
pub mod tag;
