//! Coordination subsystems.
//!
//! Each module exposes free functions taking `&Store`. Mutations return
//! [`archive::Committed`], carrying the index result and the archive
//! [`archive::Durability`].

pub mod archive;
pub mod contacts;
pub mod delivery;
pub mod index;
pub mod registry;
pub mod reservations;
