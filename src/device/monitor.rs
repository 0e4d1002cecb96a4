//! Hot-plug monitoring of input devices.
//!
//! Three sources can request a rescan: filesystem notifications on the
//! `/dev/input` directories, a short polling ticker, and a slower
//! unconditional ticker. Notifications alone miss udev-mediated churn on
//! some kernels, which is why the polling stays on as insurance. All three
//! feed one channel consumed by a single task, so overlapping triggers
//! collapse into one scan; filesystem bursts are additionally absorbed by a
//! quiet-window debounce before the scan runs.
//!
//! A scan diffs against the previous device set. Paths are the primary
//! identity; names bridge unplug/replug cycles where the kernel hands the
//! same hardware a different event node (reported as `Changed`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::device::{scan, Device};

/// Quiet window applied to filesystem notification bursts.
const FS_DEBOUNCE: Duration = Duration::from_millis(500);
/// How often the polling ticker requests a rescan.
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// How often the unconditional ticker requests a rescan.
const PERIODIC_INTERVAL: Duration = Duration::from_secs(5);

/// Directories whose churn indicates device changes.
const WATCH_DIRS: [&str; 3] = ["/dev/input", "/dev/input/by-id", "/dev/input/by-path"];

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to create filesystem watcher: {0}")]
    Watcher(#[from] notify::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    Added,
    Removed,
    Changed,
}

/// A change in the attached device set.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub device: Device,
}

/// Callback invoked (on its own task) for every device event.
pub type DeviceCallback = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RescanReason {
    FsChange,
    Poll,
    Periodic,
}

/// Watches the system's input devices and publishes add/remove/change
/// events to registered callbacks.
#[derive(Clone)]
pub struct DeviceMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    maps: Mutex<DeviceMaps>,
    callbacks: Mutex<Vec<DeviceCallback>>,
    running: AtomicBool,
    // per-start plumbing, replaced on every start()
    rescan_tx: Mutex<Option<mpsc::UnboundedSender<RescanReason>>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl DeviceMonitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                maps: Mutex::new(DeviceMaps::default()),
                callbacks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                rescan_tx: Mutex::new(None),
                stop_tx: Mutex::new(None),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Starts the watcher and the rescan tasks. Calling on a running
    /// monitor is a no-op.
    pub fn start(&self) -> Result<(), MonitorError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            warn!("device monitor already running");
            return Ok(());
        }
        info!("starting device monitor");

        let (rescan_tx, rescan_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);

        // seed the maps so the first callbacks only see real changes
        self.inner.rescan();

        let fs_tx = rescan_tx.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(_)
                    ) {
                        debug!("filesystem change: {:?} {:?}", event.kind, event.paths);
                        let _ = fs_tx.send(RescanReason::FsChange);
                    }
                }
                Err(err) => warn!("filesystem watch error: {}", err),
            }
        })?;

        for dir in WATCH_DIRS {
            let path = Path::new(dir);
            if !path.exists() {
                continue;
            }
            match watcher.watch(path, RecursiveMode::NonRecursive) {
                Ok(()) => debug!("watching {}", dir),
                Err(err) => warn!("could not watch {}: {}", dir, err),
            }
        }
        *self.inner.watcher.lock().unwrap() = Some(watcher);

        tokio::spawn(run_rescans(
            self.inner.clone(),
            rescan_rx,
            stop_tx.subscribe(),
        ));
        tokio::spawn(run_ticker(
            rescan_tx.clone(),
            stop_tx.subscribe(),
            POLL_INTERVAL,
            RescanReason::Poll,
        ));
        tokio::spawn(run_ticker(
            rescan_tx.clone(),
            stop_tx.subscribe(),
            PERIODIC_INTERVAL,
            RescanReason::Periodic,
        ));

        *self.inner.rescan_tx.lock().unwrap() = Some(rescan_tx);
        *self.inner.stop_tx.lock().unwrap() = Some(stop_tx);

        Ok(())
    }

    /// Stops the internal tasks and drops the filesystem watcher.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("stopping device monitor");
        if let Some(stop_tx) = self.inner.stop_tx.lock().unwrap().take() {
            let _ = stop_tx.send(true);
        }
        self.inner.rescan_tx.lock().unwrap().take();
        self.inner.watcher.lock().unwrap().take();
    }

    /// Registers a callback for future device events.
    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(DeviceEvent) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().unwrap().push(Arc::new(callback));
    }

    /// Snapshot of the devices seen by the last scan.
    pub fn connected_devices(&self) -> Vec<Device> {
        self.inner
            .maps
            .lock()
            .unwrap()
            .by_path
            .values()
            .cloned()
            .collect()
    }

    /// Runs a scan immediately, bypassing the debounce.
    pub fn rescan_now(&self) {
        self.inner.rescan();
    }
}

impl Default for DeviceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorInner {
    /// Scans, diffs against the previous picture, and fans events out.
    fn rescan(&self) {
        let devices = match scan::scan_devices() {
            Ok(devices) => devices,
            Err(err) => {
                error!("device scan failed: {}", err);
                return;
            }
        };

        let events = self.maps.lock().unwrap().apply_scan(devices);
        if events.is_empty() {
            return;
        }
        info!("device set changed: {} event(s)", events.len());
        self.notify(events);
    }

    /// Invokes every callback on a detached task per event. Ordering across
    /// callbacks is not guaranteed; within one callback invocation events
    /// arrive in occurrence order because each gets its own task and event.
    fn notify(&self, events: Vec<DeviceEvent>) {
        let callbacks = self.callbacks.lock().unwrap().clone();
        for event in events {
            debug!(
                "device {:?}: {} ({})",
                event.kind,
                event.device.name,
                event.device.path.display()
            );
            for callback in &callbacks {
                let callback = callback.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    callback(event);
                });
            }
        }
    }
}

/// The single consumer of rescan requests.
async fn run_rescans(
    inner: Arc<MonitorInner>,
    mut rescan_rx: mpsc::UnboundedReceiver<RescanReason>,
    mut stop_rx: watch::Receiver<bool>,
) {
    debug!("rescan task started");

    loop {
        let reason = tokio::select! {
            _ = stop_rx.changed() => break,
            received = rescan_rx.recv() => match received {
                Some(reason) => reason,
                None => break,
            },
        };

        if reason == RescanReason::FsChange {
            // absorb the rest of the burst until it goes quiet
            loop {
                match tokio::time::timeout(FS_DEBOUNCE, rescan_rx.recv()).await {
                    Ok(Some(_)) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }
        }

        inner.rescan();

        // requests queued while scanning are satisfied by the scan above
        while rescan_rx.try_recv().is_ok() {}
    }
    debug!("rescan task stopped");
}

/// Sends one rescan request per interval until stopped.
async fn run_ticker(
    rescan_tx: mpsc::UnboundedSender<RescanReason>,
    mut stop_rx: watch::Receiver<bool>,
    period: Duration,
    reason: RescanReason,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {
                if rescan_tx.send(reason).is_err() {
                    break;
                }
            }
        }
    }
}

/// The monitor's authoritative picture of attached devices.
#[derive(Debug, Default)]
struct DeviceMaps {
    by_path: HashMap<PathBuf, Device>,
    by_name: HashMap<String, Device>,
}

impl DeviceMaps {
    /// Merges a scan result, returning the observed differences.
    fn apply_scan(&mut self, new_devices: Vec<Device>) -> Vec<DeviceEvent> {
        let mut events = Vec::new();

        for device in &new_devices {
            match self.by_path.get(&device.path) {
                Some(existing) if existing.name == device.name => {}
                Some(_) => {
                    // a different device took over this event node
                    events.push(DeviceEvent {
                        kind: DeviceEventKind::Changed,
                        device: device.clone(),
                    });
                    self.insert(device.clone());
                }
                None => {
                    let moved_from = self
                        .by_name
                        .get(&device.name)
                        .filter(|old| old.path != device.path)
                        .map(|old| old.path.clone());
                    if let Some(old_path) = moved_from {
                        // same hardware, new event node after a replug
                        self.by_path.remove(&old_path);
                        events.push(DeviceEvent {
                            kind: DeviceEventKind::Changed,
                            device: device.clone(),
                        });
                    } else {
                        events.push(DeviceEvent {
                            kind: DeviceEventKind::Added,
                            device: device.clone(),
                        });
                    }
                    self.insert(device.clone());
                }
            }
        }

        let gone: Vec<PathBuf> = self
            .by_path
            .keys()
            .filter(|path| !new_devices.iter().any(|d| &d.path == *path))
            .cloned()
            .collect();
        for path in gone {
            let device = self.by_path.remove(&path).unwrap();
            // a name still present at another path was handled as Changed
            if new_devices.iter().any(|d| d.name == device.name) {
                continue;
            }
            self.by_name.remove(&device.name);
            events.push(DeviceEvent {
                kind: DeviceEventKind::Removed,
                device,
            });
        }

        events
    }

    fn insert(&mut self, device: Device) {
        self.by_name.insert(device.name.clone(), device.clone());
        self.by_path.insert(device.path.clone(), device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;

    fn device(name: &str, path: &str, kind: DeviceKind) -> Device {
        Device {
            name: name.to_string(),
            path: PathBuf::from(path),
            kind,
        }
    }

    fn kinds(events: &[DeviceEvent]) -> Vec<DeviceEventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn first_scan_adds_everything() {
        let mut maps = DeviceMaps::default();
        let events = maps.apply_scan(vec![
            device("kbd", "/dev/input/event1", DeviceKind::Keyboard),
            device("mouse", "/dev/input/event2", DeviceKind::Mouse),
        ]);
        assert_eq!(
            kinds(&events),
            vec![DeviceEventKind::Added, DeviceEventKind::Added]
        );
    }

    #[test]
    fn unchanged_scans_are_silent() {
        let mut maps = DeviceMaps::default();
        let devices = vec![device("kbd", "/dev/input/event1", DeviceKind::Keyboard)];
        maps.apply_scan(devices.clone());
        assert!(maps.apply_scan(devices).is_empty());
    }

    #[test]
    fn vanished_devices_are_removed() {
        let mut maps = DeviceMaps::default();
        maps.apply_scan(vec![
            device("kbd", "/dev/input/event1", DeviceKind::Keyboard),
            device("mouse", "/dev/input/event2", DeviceKind::Mouse),
        ]);

        let events = maps.apply_scan(vec![device(
            "kbd",
            "/dev/input/event1",
            DeviceKind::Keyboard,
        )]);
        assert_eq!(kinds(&events), vec![DeviceEventKind::Removed]);
        assert_eq!(events[0].device.name, "mouse");
    }

    #[test]
    fn replug_with_new_node_is_a_change_not_add_remove() {
        let mut maps = DeviceMaps::default();
        maps.apply_scan(vec![device("mouse", "/dev/input/event2", DeviceKind::Mouse)]);

        let events = maps.apply_scan(vec![device(
            "mouse",
            "/dev/input/event7",
            DeviceKind::Mouse,
        )]);
        assert_eq!(kinds(&events), vec![DeviceEventKind::Changed]);
        assert_eq!(events[0].device.path, PathBuf::from("/dev/input/event7"));

        // the old path no longer counts as connected
        assert_eq!(maps.by_path.len(), 1);
        assert!(maps.by_path.contains_key(Path::new("/dev/input/event7")));
    }

    #[test]
    fn node_taken_over_by_different_device_is_a_change() {
        let mut maps = DeviceMaps::default();
        maps.apply_scan(vec![device("old", "/dev/input/event3", DeviceKind::Mouse)]);

        let events = maps.apply_scan(vec![device("new", "/dev/input/event3", DeviceKind::Mouse)]);
        assert!(kinds(&events).contains(&DeviceEventKind::Changed));
        assert_eq!(maps.by_path[Path::new("/dev/input/event3")].name, "new");
    }
}
