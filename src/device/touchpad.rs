//! Virtual multi-touch clickpad backed by uinput.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::{
    self, DeviceSetup, InputEvent, ABS_MT_POSITION_X, ABS_MT_POSITION_Y, ABS_MT_PRESSURE,
    ABS_MT_SLOT, ABS_MT_TOUCH_MAJOR, ABS_MT_TRACKING_ID, ABS_X, ABS_Y, BTN_LEFT, BTN_RIGHT,
    BTN_TOOL_FINGER, BTN_TOUCH, BUS_USB, EV_ABS, EV_KEY, EV_SYN, SYN_REPORT, UI_DEV_CREATE,
    UI_DEV_DESTROY, UI_SET_ABSBIT, UI_SET_EVBIT, UI_SET_KEYBIT, UI_SET_PROPBIT,
};
use crate::config::TouchpadConfig;

const VENDOR_ID: u16 = 0x4711;
const PRODUCT_ID: u16 = 0x0817;

/// Highest multi-touch slot advertised to the kernel.
const MAX_SLOT: i32 = 9;
/// Contact size reported while a finger is down.
const TOUCH_MAJOR: i32 = 50;
/// Contact pressure reported on touch-down.
const TOUCH_PRESSURE: i32 = 30;

/// A uinput provisioning step failed.
///
/// Each variant names the step so a start failure reads as "which ioctl
/// rejected us", not just "uinput broke".
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("could not open uinput node {path}: {source}")]
    Open {
        path: std::path::PathBuf,
        source: io::Error,
    },

    #[error("failed to enable event type {kind:#x}: {source}")]
    EventType { kind: u16, source: io::Error },

    #[error("failed to enable key code {code:#x}: {source}")]
    KeyCode { code: u16, source: io::Error },

    #[error("failed to set device property {prop:#x}: {source}")]
    Property { prop: u16, source: io::Error },

    #[error("failed to enable absolute axis {axis:#x}: {source}")]
    AbsAxis { axis: u16, source: io::Error },

    #[error("failed to write device setup record: {0}")]
    WriteSetup(io::Error),

    #[error("failed to create uinput device: {0}")]
    Create(io::Error),
}

/// The virtual clickpad device.
///
/// Presents as a USB touchpad with the buttonpad property set, so libinput
/// classifies it as a clickpad and compositors apply touchpad gesture
/// policies to the events it emits.
#[derive(Debug)]
pub struct VirtualTouchpad {
    file: File,
    name: String,
}

impl VirtualTouchpad {
    /// Provisions a new uinput clickpad.
    ///
    /// Setup order matters to the kernel: event types before their codes,
    /// all bits before the setup record, the record before `UI_DEV_CREATE`.
    /// The fd is closed (dropping the half-built device) on any failure.
    pub fn create(
        path: &Path,
        name: &str,
        range: TouchpadConfig,
    ) -> Result<Self, ProvisioningError> {
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| ProvisioningError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        for kind in [EV_KEY, EV_ABS] {
            codec::ioctl(&file, UI_SET_EVBIT, kind as libc::c_ulong)
                .map_err(|source| ProvisioningError::EventType { kind, source })?;
        }

        for code in [BTN_LEFT, BTN_RIGHT, BTN_TOUCH, BTN_TOOL_FINGER] {
            codec::ioctl(&file, UI_SET_KEYBIT, code as libc::c_ulong)
                .map_err(|source| ProvisioningError::KeyCode { code, source })?;
        }

        for prop in [codec::INPUT_PROP_POINTER, codec::INPUT_PROP_BUTTONPAD] {
            codec::ioctl(&file, UI_SET_PROPBIT, prop as libc::c_ulong)
                .map_err(|source| ProvisioningError::Property { prop, source })?;
        }

        for axis in [
            ABS_X,
            ABS_Y,
            ABS_MT_SLOT,
            ABS_MT_POSITION_X,
            ABS_MT_POSITION_Y,
            ABS_MT_TRACKING_ID,
            ABS_MT_TOUCH_MAJOR,
            ABS_MT_PRESSURE,
        ] {
            codec::ioctl(&file, UI_SET_ABSBIT, axis as libc::c_ulong)
                .map_err(|source| ProvisioningError::AbsAxis { axis, source })?;
        }

        let setup = build_setup(name, range);
        let encoded = setup.encode();
        let written = unsafe {
            libc::write(
                file.as_raw_fd(),
                encoded.as_ptr() as *const libc::c_void,
                encoded.len(),
            )
        };
        if written != encoded.len() as isize {
            return Err(ProvisioningError::WriteSetup(io::Error::last_os_error()));
        }

        codec::ioctl(&file, UI_DEV_CREATE, 0).map_err(ProvisioningError::Create)?;

        info!("created virtual touchpad \"{}\"", name);
        Ok(Self {
            file,
            name: name.to_string(),
        })
    }

    /// Puts a finger down in `slot` at `(x, y)`.
    pub fn touch_down(&self, slot: i32, tracking_id: i32, x: i32, y: i32) -> io::Result<()> {
        self.write_events(&down_events(slot, tracking_id, x, y))
    }

    /// Moves the finger in `slot` to `(x, y)`.
    pub fn touch_move(&self, slot: i32, x: i32, y: i32) -> io::Result<()> {
        self.write_events(&move_events(slot, x, y))
    }

    /// Lifts the finger in `slot`.
    pub fn touch_up(&self, slot: i32) -> io::Result<()> {
        self.write_events(&up_events(slot))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes a whole event sequence as one buffer so the report is not
    /// interleaved with anything else on the node.
    fn write_events(&self, events: &[InputEvent]) -> io::Result<()> {
        let mut buf = Vec::with_capacity(events.len() * codec::EVENT_SIZE);
        for event in events {
            buf.extend_from_slice(&event.encode());
        }
        let written = unsafe {
            libc::write(
                self.file.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if written != buf.len() as isize {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for VirtualTouchpad {
    fn drop(&mut self) {
        if let Err(err) = codec::ioctl(&self.file, UI_DEV_DESTROY, 0) {
            warn!("failed to destroy virtual touchpad \"{}\": {}", self.name, err);
        } else {
            debug!("destroyed virtual touchpad \"{}\"", self.name);
        }
    }
}

fn build_setup(name: &str, range: TouchpadConfig) -> DeviceSetup {
    let mut setup = DeviceSetup::new(name);
    setup.bus_type = BUS_USB;
    setup.vendor = VENDOR_ID;
    setup.product = PRODUCT_ID;
    setup.version = 1;
    setup.set_abs_range(ABS_X, range.min_x, range.max_x);
    setup.set_abs_range(ABS_Y, range.min_y, range.max_y);
    setup.set_abs_range(ABS_MT_POSITION_X, range.min_x, range.max_x);
    setup.set_abs_range(ABS_MT_POSITION_Y, range.min_y, range.max_y);
    setup.set_abs_range(ABS_MT_SLOT, 0, MAX_SLOT);
    setup.set_abs_range(ABS_MT_TOUCH_MAJOR, 0, 255);
    setup.set_abs_range(ABS_MT_PRESSURE, 0, 255);
    setup
}

fn down_events(slot: i32, tracking_id: i32, x: i32, y: i32) -> [InputEvent; 8] {
    [
        InputEvent::new(EV_ABS, ABS_MT_SLOT, slot),
        InputEvent::new(EV_ABS, ABS_MT_TRACKING_ID, tracking_id),
        InputEvent::new(EV_ABS, ABS_MT_POSITION_X, x),
        InputEvent::new(EV_ABS, ABS_MT_POSITION_Y, y),
        InputEvent::new(EV_ABS, ABS_MT_TOUCH_MAJOR, TOUCH_MAJOR),
        InputEvent::new(EV_ABS, ABS_MT_PRESSURE, TOUCH_PRESSURE),
        InputEvent::new(EV_KEY, BTN_TOUCH, 1),
        InputEvent::new(EV_SYN, SYN_REPORT, 0),
    ]
}

fn move_events(slot: i32, x: i32, y: i32) -> [InputEvent; 5] {
    [
        InputEvent::new(EV_ABS, ABS_MT_SLOT, slot),
        InputEvent::new(EV_ABS, ABS_MT_POSITION_X, x),
        InputEvent::new(EV_ABS, ABS_MT_POSITION_Y, y),
        InputEvent::new(EV_ABS, ABS_MT_TOUCH_MAJOR, TOUCH_MAJOR),
        InputEvent::new(EV_SYN, SYN_REPORT, 0),
    ]
}

fn up_events(slot: i32) -> [InputEvent; 5] {
    [
        InputEvent::new(EV_ABS, ABS_MT_SLOT, slot),
        InputEvent::new(EV_ABS, ABS_MT_TRACKING_ID, -1),
        InputEvent::new(EV_ABS, ABS_MT_TOUCH_MAJOR, 0),
        InputEvent::new(EV_KEY, BTN_TOUCH, 0),
        InputEvent::new(EV_SYN, SYN_REPORT, 0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple(event: &InputEvent) -> (u16, u16, i32) {
        (event.kind, event.code, event.value)
    }

    #[test]
    fn down_sequence_matches_wire_protocol() {
        let events = down_events(1, 7, 100, 200);
        let expected = [
            (EV_ABS, ABS_MT_SLOT, 1),
            (EV_ABS, ABS_MT_TRACKING_ID, 7),
            (EV_ABS, ABS_MT_POSITION_X, 100),
            (EV_ABS, ABS_MT_POSITION_Y, 200),
            (EV_ABS, ABS_MT_TOUCH_MAJOR, 50),
            (EV_ABS, ABS_MT_PRESSURE, 30),
            (EV_KEY, BTN_TOUCH, 1),
            (EV_SYN, SYN_REPORT, 0),
        ];
        let got: Vec<_> = events.iter().map(triple).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn move_sequence_matches_wire_protocol() {
        let events = move_events(0, 16483, 16423);
        let expected = [
            (EV_ABS, ABS_MT_SLOT, 0),
            (EV_ABS, ABS_MT_POSITION_X, 16483),
            (EV_ABS, ABS_MT_POSITION_Y, 16423),
            (EV_ABS, ABS_MT_TOUCH_MAJOR, 50),
            (EV_SYN, SYN_REPORT, 0),
        ];
        let got: Vec<_> = events.iter().map(triple).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn up_sequence_releases_tracking_id_and_touch() {
        let events = up_events(3);
        let expected = [
            (EV_ABS, ABS_MT_SLOT, 3),
            (EV_ABS, ABS_MT_TRACKING_ID, -1),
            (EV_ABS, ABS_MT_TOUCH_MAJOR, 0),
            (EV_KEY, BTN_TOUCH, 0),
            (EV_SYN, SYN_REPORT, 0),
        ];
        let got: Vec<_> = events.iter().map(triple).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn every_sequence_ends_with_a_sync_report() {
        assert_eq!(
            triple(down_events(0, 0, 0, 0).last().unwrap()),
            (EV_SYN, SYN_REPORT, 0)
        );
        assert_eq!(
            triple(move_events(0, 0, 0).last().unwrap()),
            (EV_SYN, SYN_REPORT, 0)
        );
        assert_eq!(
            triple(up_events(0).last().unwrap()),
            (EV_SYN, SYN_REPORT, 0)
        );
    }

    #[test]
    fn setup_advertises_clickpad_axes() {
        let range = TouchpadConfig {
            min_x: 0,
            max_x: 1000,
            min_y: 0,
            max_y: 2000,
        };
        let setup = build_setup("pad", range);
        assert_eq!(setup.abs_max[ABS_X as usize], 1000);
        assert_eq!(setup.abs_max[ABS_MT_POSITION_Y as usize], 2000);
        assert_eq!(setup.abs_max[ABS_MT_SLOT as usize], MAX_SLOT);
        assert_eq!(setup.abs_max[ABS_MT_TOUCH_MAJOR as usize], 255);
        assert_eq!(setup.abs_max[ABS_MT_PRESSURE as usize], 255);
        assert_eq!(setup.vendor, 0x4711);
        assert_eq!(setup.product, 0x0817);
        assert_eq!(setup.bus_type, BUS_USB);
    }
}
