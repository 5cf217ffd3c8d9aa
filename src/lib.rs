//! FDC-Live - Floppy disk controller core in Rust
//!
//! Bit-level floppy controller emulation:
//! - PLL bit-cell recovery (analog and WD177x digital models)
//! - GCR (Victor 9000), MFM and FM decoding on a live state machine
//! - Checkpoint/rollback speculative execution synchronized to register accesses
//! - Thin register front-end with seek, sync timeout and host scheduling

pub mod time;
pub mod error;
pub mod gcr;
pub mod mfm;
pub mod variant;
pub mod medium;
pub mod pll;
pub mod live;
pub mod live_log;
pub mod fdc;
pub mod config;
pub mod savestate;
