// Denied rather than forbidden: the credential capture in `creds` makes
// raw libc syscalls behind safe wrappers.
#![deny(unsafe_code)]
//! The shallfs journal engine.
//!
//! A ring-buffered, self-describing, checksummed log kept on a dedicated
//! block device, shared between producers appending modification records
//! and consumers draining them. The engine owns the on-device layout
//! (through `shall-ondisk`), the in-memory commit buffer and its flush
//! pipeline, overflow back-pressure, crash recovery across the replicated
//! superblocks, and the admin control surface.

pub mod creds;
pub mod engine;
mod interrupt;
pub mod options;
pub mod overflow;
pub mod reader;
pub mod registry;
pub mod ring;
pub mod sbio;

pub use creds::current_credentials;
pub use engine::{FlushReason, InfoSnapshot, Journal};
pub use interrupt::Interrupt;
pub use options::{DataMode, LogTiming, MountOptions, OverflowPolicy, TooBigPolicy};
pub use overflow::OverflowCounters;
pub use reader::{ControlChannel, LogReader};
