//! Postgres-backed storage for the conductor orchestration engine.
//!
//! Row types and enums live in [`models`]; per-table query functions live
//! under [`queries`]; connection pooling and migration runtime support live
//! in [`pool`]; [`config`] resolves the database URL.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
