//! Core types and traits for the Vistra engine.
//!
//! This crate provides the foundational types used throughout the engine:
//! - Resource lifecycle status tracking
//! - Generational slot arenas and typed handles

pub mod arena;
pub mod lifecycle;

pub use arena::{Arena, Handle};
pub use lifecycle::{Lifecycle, ObjectStatus};
