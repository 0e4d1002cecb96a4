//! Relative-motion reader over a raw evdev mouse node.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::codec::{self, InputEvent, EVENT_SIZE, EVIOCGRAB, EV_REL, REL_X, REL_Y};
use crate::device::ReaderError;

/// Reads pointer deltas from a mouse node and can hold it exclusively.
///
/// While grabbed the kernel stops routing this device's events to other
/// clients, which is what keeps the physical cursor frozen while its motion
/// is being replayed as touchpad fingers.
#[derive(Debug)]
pub struct MouseReader {
    file: File,
    path: PathBuf,
    grabbed: AtomicBool,
}

impl MouseReader {
    /// Opens the device node read-write and non-blocking.
    pub fn open(path: &Path) -> Result<Self, ReaderError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| ReaderError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("opened mouse device {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
            grabbed: AtomicBool::new(false),
        })
    }

    /// Reads at most one event and maps it to a pointer delta.
    ///
    /// Anything that is not a relative-motion event (an empty queue, a
    /// short read, an I/O error) yields `(0, 0)`: a missing sample is
    /// indistinguishable from a still mouse here.
    pub fn poll_delta(&self) -> (i32, i32) {
        let mut buf = [0u8; EVENT_SIZE];
        let n = unsafe {
            libc::read(
                self.file.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                EVENT_SIZE,
            )
        };
        if n < EVENT_SIZE as isize {
            return (0, 0);
        }

        let event = match InputEvent::decode(&buf) {
            Ok(event) => event,
            Err(_) => return (0, 0),
        };
        if event.kind != EV_REL {
            return (0, 0);
        }
        match event.code {
            REL_X => (event.value, 0),
            REL_Y => (0, event.value),
            _ => (0, 0),
        }
    }

    /// Takes exclusive possession of the device. Idempotent.
    pub fn grab(&self) -> io::Result<()> {
        if self.grabbed.load(Ordering::Acquire) {
            return Ok(());
        }
        codec::ioctl(&self.file, EVIOCGRAB, 1)?;
        self.grabbed.store(true, Ordering::Release);
        debug!("grabbed mouse device {}", self.path.display());
        Ok(())
    }

    /// Releases exclusive possession. Idempotent.
    pub fn release(&self) -> io::Result<()> {
        if !self.grabbed.load(Ordering::Acquire) {
            return Ok(());
        }
        codec::ioctl(&self.file, EVIOCGRAB, 0)?;
        self.grabbed.store(false, Ordering::Release);
        debug!("released mouse device {}", self.path.display());
        Ok(())
    }

    pub fn is_grabbed(&self) -> bool {
        self.grabbed.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MouseReader {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(
                "failed to release mouse grab on {}: {}",
                self.path.display(),
                err
            );
        }
    }
}
