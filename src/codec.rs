//! Wire formats and ioctl numbers for the Linux input subsystem.
//!
//! Everything that knows byte offsets lives here: the 24-byte input event
//! record read from `/dev/input/eventN` and written to `/dev/uinput`, the
//! uinput device-setup record, and the ioctl request numbers used to
//! provision and control devices. The rest of the crate talks in terms of
//! [`InputEvent`] and [`DeviceSetup`] and never touches raw buffers.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

use thiserror::Error;

// Event types (linux/input-event-codes.h)
pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_ABS: u16 = 0x03;

pub const SYN_REPORT: u16 = 0x00;

pub const REL_X: u16 = 0x00;
pub const REL_Y: u16 = 0x01;

pub const BTN_LEFT: u16 = 0x110;
pub const BTN_RIGHT: u16 = 0x111;
pub const BTN_TOOL_FINGER: u16 = 0x145;
pub const BTN_TOUCH: u16 = 0x14a;

pub const ABS_X: u16 = 0x00;
pub const ABS_Y: u16 = 0x01;
pub const ABS_MT_SLOT: u16 = 0x2f;
pub const ABS_MT_TOUCH_MAJOR: u16 = 0x30;
pub const ABS_MT_POSITION_X: u16 = 0x35;
pub const ABS_MT_POSITION_Y: u16 = 0x36;
pub const ABS_MT_TRACKING_ID: u16 = 0x39;
pub const ABS_MT_PRESSURE: u16 = 0x3a;

pub const INPUT_PROP_POINTER: u16 = 0x00;
pub const INPUT_PROP_BUTTONPAD: u16 = 0x02;

/// Highest key code reported through the `EVIOCGKEY` bitmap.
pub const KEY_MAX: usize = 0x2ff;
/// Byte length of the key-state bitmap, one bit per key code.
pub const KEY_BITMAP_LEN: usize = (KEY_MAX + 1) / 8;

// uinput ioctls (linux/uinput.h)
pub const UI_DEV_CREATE: libc::c_ulong = 0x5501;
pub const UI_DEV_DESTROY: libc::c_ulong = 0x5502;
pub const UI_SET_EVBIT: libc::c_ulong = 0x4004_5564;
pub const UI_SET_KEYBIT: libc::c_ulong = 0x4004_5565;
pub const UI_SET_ABSBIT: libc::c_ulong = 0x4004_5567;
pub const UI_SET_PROPBIT: libc::c_ulong = 0x4004_556a;

// evdev ioctls (linux/input.h)
pub const EVIOCGRAB: libc::c_ulong = 0x4004_4590;

/// `EVIOCGKEY(len)`: read the key-state bitmap into a `len`-byte buffer.
///
/// `_IOC(_IOC_READ, 'E', 0x18, len)` with the buffer length encoded in the
/// size field, so the number depends on how large a bitmap the caller asks
/// for.
pub const fn eviocgkey(len: usize) -> libc::c_ulong {
    ((2 as libc::c_ulong) << 30) | ((len as libc::c_ulong) << 16) | (0x45 << 8) | 0x18
}

pub const BUS_USB: u16 = 0x03;
/// Fixed name buffer length in the uinput setup record.
pub const DEVICE_NAME_LEN: usize = 80;
/// Number of absolute axes described by the setup record arrays.
pub const ABS_AXES: usize = 64;

/// Size in bytes of one encoded input event record.
pub const EVENT_SIZE: usize = 24;

#[derive(Debug, Error)]
pub enum CodecError {
    /// A read yielded fewer bytes than one event record.
    #[error("short read: got {0} bytes, expected {EVENT_SIZE}")]
    ShortRead(usize),
}

/// One Linux input event as it appears on the wire.
///
/// Layout (little-endian): seconds `u64`, microseconds `u64`, type `u16`,
/// code `u16`, value `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub time_sec: u64,
    pub time_usec: u64,
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl InputEvent {
    /// Event with a zeroed timestamp; the kernel stamps uinput writes itself.
    pub const fn new(kind: u16, code: u16, value: i32) -> Self {
        Self {
            time_sec: 0,
            time_usec: 0,
            kind,
            code,
            value,
        }
    }

    pub fn encode(&self) -> [u8; EVENT_SIZE] {
        let mut buf = [0u8; EVENT_SIZE];
        buf[0..8].copy_from_slice(&self.time_sec.to_le_bytes());
        buf[8..16].copy_from_slice(&self.time_usec.to_le_bytes());
        buf[16..18].copy_from_slice(&self.kind.to_le_bytes());
        buf[18..20].copy_from_slice(&self.code.to_le_bytes());
        buf[20..24].copy_from_slice(&self.value.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < EVENT_SIZE {
            return Err(CodecError::ShortRead(buf.len()));
        }
        Ok(Self {
            time_sec: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            time_usec: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            kind: u16::from_le_bytes(buf[16..18].try_into().unwrap()),
            code: u16::from_le_bytes(buf[18..20].try_into().unwrap()),
            value: i32::from_le_bytes(buf[20..24].try_into().unwrap()),
        })
    }
}

/// The uinput `user_dev` setup record written before `UI_DEV_CREATE`.
///
/// Field order follows the kernel struct: name, bus/vendor/product/version,
/// ff_effects_max, then the four per-axis arrays (max, min, fuzz, flat).
#[derive(Debug, Clone)]
pub struct DeviceSetup {
    pub name: [u8; DEVICE_NAME_LEN],
    pub bus_type: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
    pub effects_max: u32,
    pub abs_max: [i32; ABS_AXES],
    pub abs_min: [i32; ABS_AXES],
    pub abs_fuzz: [i32; ABS_AXES],
    pub abs_flat: [i32; ABS_AXES],
}

/// Encoded size of [`DeviceSetup`].
pub const DEVICE_SETUP_SIZE: usize = DEVICE_NAME_LEN + 8 + 4 + 4 * 4 * ABS_AXES;

impl DeviceSetup {
    /// Setup record with the given device name, truncated to the fixed
    /// buffer if longer, and all axis ranges zeroed.
    pub fn new(name: &str) -> Self {
        let mut buf = [0u8; DEVICE_NAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(DEVICE_NAME_LEN);
        buf[..len].copy_from_slice(&bytes[..len]);
        Self {
            name: buf,
            bus_type: 0,
            vendor: 0,
            product: 0,
            version: 0,
            effects_max: 0,
            abs_max: [0; ABS_AXES],
            abs_min: [0; ABS_AXES],
            abs_fuzz: [0; ABS_AXES],
            abs_flat: [0; ABS_AXES],
        }
    }

    /// Sets the min/max range advertised for one absolute axis.
    pub fn set_abs_range(&mut self, axis: u16, min: i32, max: i32) {
        let idx = axis as usize;
        self.abs_min[idx] = min;
        self.abs_max[idx] = max;
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DEVICE_SETUP_SIZE);
        buf.extend_from_slice(&self.name);
        buf.extend_from_slice(&self.bus_type.to_le_bytes());
        buf.extend_from_slice(&self.vendor.to_le_bytes());
        buf.extend_from_slice(&self.product.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.effects_max.to_le_bytes());
        for array in [&self.abs_max, &self.abs_min, &self.abs_fuzz, &self.abs_flat] {
            for value in array {
                buf.extend_from_slice(&value.to_le_bytes());
            }
        }
        buf
    }
}

/// Issues an ioctl carrying an integer argument.
pub fn ioctl(file: &File, request: libc::c_ulong, arg: libc::c_ulong) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), request, arg) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Issues an ioctl that fills the supplied buffer.
pub fn ioctl_read(file: &File, request: libc::c_ulong, buf: &mut [u8]) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), request, buf.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trips_through_encoding() {
        let cases = [
            InputEvent::new(EV_REL, REL_X, -12),
            InputEvent::new(EV_ABS, ABS_MT_TRACKING_ID, -1),
            InputEvent::new(EV_KEY, BTN_TOUCH, 1),
            InputEvent::new(EV_SYN, SYN_REPORT, 0),
            InputEvent {
                time_sec: u64::MAX,
                time_usec: 123_456,
                kind: u16::MAX,
                code: u16::MAX,
                value: i32::MIN,
            },
        ];
        for event in cases {
            assert_eq!(InputEvent::decode(&event.encode()).unwrap(), event);
        }
    }

    #[test]
    fn decode_rejects_short_buffers() {
        let err = InputEvent::decode(&[0u8; 23]).unwrap_err();
        assert!(matches!(err, CodecError::ShortRead(23)));
        assert!(matches!(
            InputEvent::decode(&[]).unwrap_err(),
            CodecError::ShortRead(0)
        ));
    }

    #[test]
    fn eviocgkey_encodes_buffer_length() {
        // read direction, 'E' type, nr 0x18, 96-byte key bitmap
        assert_eq!(eviocgkey(KEY_BITMAP_LEN), 0x8060_4518);
    }

    #[test]
    fn setup_record_has_kernel_layout() {
        let mut setup = DeviceSetup::new("pad");
        setup.bus_type = BUS_USB;
        setup.vendor = 0x4711;
        setup.set_abs_range(ABS_X, 0, 32767);
        let encoded = setup.encode();

        assert_eq!(encoded.len(), DEVICE_SETUP_SIZE);
        assert_eq!(&encoded[..3], b"pad");
        assert_eq!(encoded[3], 0);
        // id block sits right after the name buffer
        assert_eq!(encoded[80..82], BUS_USB.to_le_bytes());
        assert_eq!(encoded[82..84], 0x4711u16.to_le_bytes());
        // abs_max precedes abs_min
        let abs_max_start = 80 + 8 + 4;
        assert_eq!(
            encoded[abs_max_start..abs_max_start + 4],
            32767i32.to_le_bytes()
        );
        let abs_min_start = abs_max_start + 4 * ABS_AXES;
        assert_eq!(encoded[abs_min_start..abs_min_start + 4], 0i32.to_le_bytes());
    }

    #[test]
    fn long_device_names_are_truncated() {
        let setup = DeviceSetup::new(&"x".repeat(200));
        assert_eq!(setup.name.len(), DEVICE_NAME_LEN);
        assert!(setup.name.iter().all(|&b| b == b'x'));
    }
}
