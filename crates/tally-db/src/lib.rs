//! Tally persistence layer
//!
//! Repository traits for every durable table, implemented for Postgres (`sqlx`) and
//! for an in-process [`db::MemoryStore`] used on single nodes and in tests.

pub mod db;

pub use db::*;
