//! Discovery of attached keyboards and mice.
//!
//! Devices are found through `/dev/input/by-id`, whose entry names are
//! stable identifiers assigned by udev. Classification is by name: udev
//! tags keyboard interfaces with `kbd` and pointer interfaces with `mouse`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::device::{Device, DeviceKind};

/// Directory of stable device symlinks maintained by udev.
pub const BY_ID_DIR: &str = "/dev/input/by-id";

/// Where relative symlink targets resolve to.
const DEV_INPUT_DIR: &str = "/dev/input";

/// Enumerates the currently attached input devices.
pub fn scan_devices() -> io::Result<Vec<Device>> {
    scan_dir(Path::new(BY_ID_DIR))
}

/// Enumerates device symlinks under `dir`.
///
/// Entries are visited in name order (matching what `ls` shows), so "first
/// device of a kind" is deterministic across scans.
pub fn scan_dir(dir: &Path) -> io::Result<Vec<Device>> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| Some(entry.ok()?.file_name().to_string_lossy().into_owned()))
        .collect();
    names.sort();

    let mut devices = Vec::new();
    for name in names {
        if !name.contains("event") {
            continue;
        }
        let target = match fs::read_link(dir.join(&name)) {
            Ok(target) => target,
            Err(err) => {
                debug!("skipping {}: not a readable symlink ({})", name, err);
                continue;
            }
        };
        let path = resolve_target(&target);

        // a name can match both classifications; such an entry contributes
        // one descriptor per kind
        for kind in classify(&name) {
            devices.push(Device {
                name: name.clone(),
                path: path.clone(),
                kind,
            });
        }
    }
    Ok(devices)
}

/// Resolves a `by-id` symlink target to an absolute event-node path.
fn resolve_target(target: &Path) -> PathBuf {
    if target.is_absolute() {
        target.to_path_buf()
    } else {
        let base = target.file_name().unwrap_or(target.as_os_str());
        Path::new(DEV_INPUT_DIR).join(base)
    }
}

/// Classifies a `by-id` entry name, keyboard first.
fn classify(name: &str) -> Vec<DeviceKind> {
    let mut kinds = Vec::new();
    if name.contains("kbd") {
        kinds.push(DeviceKind::Keyboard);
    }
    if name.contains("mouse") {
        kinds.push(DeviceKind::Mouse);
    }
    kinds
}

/// Picks the device to use for `kind`.
///
/// A non-empty preference selects the first device whose name contains it;
/// otherwise (or when nothing matches) the first device of the kind wins.
pub fn select_device<'a>(
    devices: &'a [Device],
    kind: DeviceKind,
    preferred: &str,
) -> Option<&'a Device> {
    if !preferred.is_empty() {
        if let Some(device) = devices
            .iter()
            .find(|d| d.kind == kind && d.name.contains(preferred))
        {
            return Some(device);
        }
        debug!(
            "no {:?} device matches preference \"{}\", falling back to first",
            kind, preferred
        );
    }
    devices.iter().find(|d| d.kind == kind)
}
