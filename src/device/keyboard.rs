//! Key-state reader over a raw evdev keyboard node.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::codec::{self, KEY_BITMAP_LEN};
use crate::device::ReaderError;

/// Polls which key a keyboard currently holds down.
///
/// The reader asks the kernel for the instantaneous key-state bitmap instead
/// of consuming events, so nobody has to drain the device's event queue and
/// a key held before the reader opened is still observed.
#[derive(Debug)]
pub struct KeyboardReader {
    file: File,
    path: PathBuf,
}

impl KeyboardReader {
    /// Opens the device node read-only and non-blocking.
    pub fn open(path: &Path) -> Result<Self, ReaderError> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| ReaderError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("opened keyboard device {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Returns the lowest key code currently held, or -1 when no key is
    /// down or the device did not answer.
    pub fn held_key(&self) -> i32 {
        match self.pressed_keys() {
            Ok(keys) => keys.first().copied().unwrap_or(-1),
            Err(_) => -1,
        }
    }

    /// All key codes currently held, in ascending order.
    pub fn pressed_keys(&self) -> std::io::Result<Vec<i32>> {
        let mut bitmap = [0u8; KEY_BITMAP_LEN];
        codec::ioctl_read(&self.file, codec::eviocgkey(KEY_BITMAP_LEN), &mut bitmap)?;

        let mut pressed = Vec::new();
        for (byte_index, byte) in bitmap.iter().enumerate() {
            let mut bits = *byte;
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                pressed.push((byte_index * 8 + bit) as i32);
                bits &= bits - 1;
            }
        }
        Ok(pressed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
