//! Client-side cache coherence engine.
//!
//! Keeps an in-memory reactive query cache and a durable mirror consistent
//! under concurrent reads, optimistic writes, background refetches and
//! server-pushed change notifications. [`application::engine::CoherenceEngine`]
//! is the entry point.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
