//! Fotadelta: block-based firmware delta updates in Rust.
//!
//! Reconstructs a new firmware image from an old image and a patch stream
//! that arrives in fixed-size download packets. The patch holds one record
//! per block (skip, bsdiff-style modify, add or remove) with gzip-compressed
//! sections and a CRC32 of the reconstructed block.
//!
//! The crate provides:
//! - Wire format parsing (`format`)
//! - Bounded section decompression (`compress`)
//! - Record reassembly and block patching (`patch`)
//! - The update session tying them together (`engine`)
//! - Packet source and image traits with std-backed implementations (`io`)
//! - An optional CLI (`cli` feature)
//!
//! # Quick Start
//!
//! ```no_run
//! use fotadelta::engine::{self, UpdateConfig};
//!
//! let old = std::fs::read("old.bin").unwrap();
//! let patch = std::fs::read("update.patch").unwrap();
//!
//! let (new, stats) = engine::apply_update(&old, &patch, UpdateConfig::default()).unwrap();
//! println!("{} blocks, {} bytes", stats.blocks, new.len());
//! ```

pub mod compress;
pub mod engine;
pub mod format;
pub mod io;
pub mod patch;

#[cfg(feature = "cli")]
pub mod cli;
