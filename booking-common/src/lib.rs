//! # Booking Common Library
//!
//! Shared code for the booking ledger and anything that talks to it:
//! - Booking record model and provenance metadata
//! - Change events (LedgerEvent enum) and the ChangeBus
//! - Classroom / time-slot catalog with its default dataset
//! - Configuration loading and data directory resolution
//! - Error type and timestamp helpers

pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
#[cfg(feature = "sse")]
pub mod sse;
pub mod time;

pub use error::{Error, Result};
pub use models::{BookingKind, BookingRecord};
