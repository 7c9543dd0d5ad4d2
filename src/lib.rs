// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient AMQP 0-9-1 publishing and consuming on top of `lapin`.
//!
//! A [`supervisor::ConnectionSupervisor`] owns the connection of the process. The
//! [`publisher::Publisher`] and the [`consumer::ConsumerLoop`] borrow channels from it,
//! declare the [`topology::Topology`] lazily through a [`declaration::DeclarationCache`],
//! and settle deliveries with a [`dispatcher::ResultDispatcher`].

mod otel;

pub mod channel;
pub mod commands;
pub mod config;
pub mod consumer;
pub mod declaration;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod store;
pub mod supervisor;
pub mod topology;
