//! `panappticon` - an encrypted background capture agent
//!
//! This library records keystrokes, now-playing media changes and periodic
//! screenshots into an encrypted database and an encrypted disk image. OS
//! access goes through the traits in [`platform`], [`keystroke`],
//! [`screenshot`] and [`volume`]; the macOS implementations live in the
//! `panappticon-mac` crate.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod app;
pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod hotkey;
pub mod keystroke;
pub mod logging;
pub mod media;
pub mod platform;
pub mod screenshot;
pub mod shortcut;
pub mod shutdown;
pub mod storage;
pub mod volume;

pub use app::{AppContext, Collector, ControlCommand};
pub use capture::{CaptureKind, CaptureSource, Record, RecordSink};
pub use config::{Config, ConfigStore};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use shortcut::{KeyEvent, KeyboardShortcut, Modifiers};
pub use storage::EncryptedStore;
pub use volume::EncryptedVolume;
