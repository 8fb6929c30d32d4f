//! Protocol module for parsing LT Thermometer notification frames.
//!
//! This module contains the implementations for:
//! - Frame validation and decoding
//! - Checksum calculation

pub mod checksum;
pub mod frame;

pub use checksum::{calculate_checksum, verify_checksum};
pub use frame::{decode, decode_with, Decoded, FrameType, RejectReason};
