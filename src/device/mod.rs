//! Physical and virtual input devices.
//!
//! This module owns everything that touches a device node: the keyboard and
//! mouse readers over raw evdev nodes, the uinput-backed virtual touchpad,
//! discovery of attached devices under `/dev/input/by-id`, and the hot-plug
//! monitor that keeps that picture current while the service runs.

pub mod keyboard;
pub mod monitor;
pub mod mouse;
pub mod scan;
pub mod touchpad;

use std::path::PathBuf;

use thiserror::Error;

pub use keyboard::KeyboardReader;
pub use monitor::{DeviceEvent, DeviceEventKind, DeviceMonitor, MonitorError};
pub use mouse::MouseReader;
pub use scan::{scan_devices, select_device};
pub use touchpad::{ProvisioningError, VirtualTouchpad};

/// What role a discovered device node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Keyboard,
    Mouse,
}

/// A discovered input device.
///
/// `path` (the resolved `/dev/input/eventN` node) is the primary identity;
/// `name` (the `by-id` entry) is stable across unplug/replug cycles even
/// when the kernel hands out a different event node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub path: PathBuf,
    pub kind: DeviceKind,
}

/// Errors from opening or polling a physical input device.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("failed to open input device {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
}
