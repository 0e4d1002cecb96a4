//! The gesture service: owns the devices and the pipeline lifecycle.
//!
//! Start provisions the virtual touchpad, binds the physical readers, and
//! spawns the pipeline and a health-check task. A disconnect, noticed by
//! the health check or reported by the device monitor, unbinds the readers
//! and kicks off a reconnect that rebinds them to whatever nodes the
//! hardware reappears on. The pipeline keeps running through all of this;
//! it simply idles while the readers are unbound.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::device::monitor::DeviceEventKind;
use crate::device::{
    scan, Device, DeviceEvent, DeviceKind, DeviceMonitor, KeyboardReader, MouseReader,
    ProvisioningError, ReaderError, VirtualTouchpad,
};
use crate::gesture::pipeline::GesturePipeline;

const UINPUT_PATH: &str = "/dev/uinput";
const TOUCHPAD_NAME: &str = "gesturepad virtual touchpad";

/// How often the health check verifies the bound devices.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Grace period before a reconnect, giving udev time to settle.
const RECONNECT_SETTLE: Duration = Duration::from_secs(3);
/// Reconnect attempts before giving up until the next disconnect event.
const RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service is already running")]
    AlreadyRunning,

    #[error("service is not running")]
    NotRunning,

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error("device scan failed: {0}")]
    Scan(std::io::Error),

    #[error("no {0} device found")]
    NoDevice(&'static str),

    #[error(transparent)]
    ReaderOpen(#[from] ReaderError),
}

/// Device handles shared between the service and the pipeline.
///
/// The pipeline snapshots the `Arc`s under a read hold each tick; rebinding
/// happens under the write hold. A handle's file descriptor closes when the
/// last clone drops, so a reader swapped out mid-tick stays valid for the
/// tick that snapshotted it.
#[derive(Default)]
pub struct DeviceSet {
    pub touchpad: Option<Arc<VirtualTouchpad>>,
    pub keyboard: Option<Arc<KeyboardReader>>,
    pub mouse: Option<Arc<MouseReader>>,
    pub keyboard_device: Option<Device>,
    pub mouse_device: Option<Device>,
}

pub type SharedDevices = Arc<RwLock<DeviceSet>>;

struct ServiceInner {
    devices: SharedDevices,
    monitor: DeviceMonitor,
    config_tx: watch::Sender<Config>,
    stop_tx: RwLock<Option<watch::Sender<bool>>>,
    running: AtomicBool,
    reconnect_on_disconnect: AtomicBool,
    reconnect_in_flight: AtomicBool,
    callback_installed: AtomicBool,
}

/// Public handle for the gesture service.
#[derive(Clone)]
pub struct GestureService {
    inner: Arc<ServiceInner>,
}

impl GestureService {
    /// Creates a stopped service around an externally owned device monitor.
    pub fn new(config: Config, monitor: DeviceMonitor) -> Self {
        let (config_tx, _) = watch::channel(config);
        Self {
            inner: Arc::new(ServiceInner {
                devices: Arc::new(RwLock::new(DeviceSet::default())),
                monitor,
                config_tx,
                stop_tx: RwLock::new(None),
                running: AtomicBool::new(false),
                reconnect_on_disconnect: AtomicBool::new(true),
                reconnect_in_flight: AtomicBool::new(false),
                callback_installed: AtomicBool::new(false),
            }),
        }
    }

    /// Provisions the touchpad, binds the devices, and spawns the workers.
    pub async fn start(&self) -> Result<(), ServiceError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(ServiceError::AlreadyRunning);
        }
        match self.try_start().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.running.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    async fn try_start(&self) -> Result<(), ServiceError> {
        let inner = &self.inner;
        let config = inner.config_tx.borrow().clone();

        info!("creating virtual touchpad");
        let touchpad = Arc::new(VirtualTouchpad::create(
            UINPUT_PATH.as_ref(),
            TOUCHPAD_NAME,
            config.touchpad,
        )?);

        // any failure from here on drops the touchpad Arc, destroying the
        // half-started uinput device
        let (keyboard_device, mouse_device) = select_devices(&config)?;
        info!(
            "using keyboard \"{}\" and mouse \"{}\"",
            keyboard_device.name, mouse_device.name
        );

        let keyboard = Arc::new(KeyboardReader::open(&keyboard_device.path)?);
        let mouse = Arc::new(MouseReader::open(&mouse_device.path)?);

        {
            let mut devices = inner.devices.write().await;
            devices.touchpad = Some(touchpad);
            devices.keyboard = Some(keyboard);
            devices.mouse = Some(mouse);
            devices.keyboard_device = Some(keyboard_device);
            devices.mouse_device = Some(mouse_device);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        *inner.stop_tx.write().await = Some(stop_tx);

        self.install_device_callback();

        let pipeline = GesturePipeline::create(
            inner.devices.clone(),
            inner.config_tx.subscribe(),
            stop_rx.clone(),
        )
        .initialize();
        tokio::spawn(pipeline.run());

        tokio::spawn(run_health_check(Arc::downgrade(inner), stop_rx));

        info!("gesture service started");
        Ok(())
    }

    /// Signals the workers to stop; the pipeline closes the devices.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::AcqRel) {
            return Err(ServiceError::NotRunning);
        }
        inner.reconnect_on_disconnect.store(false, Ordering::Release);

        if let Some(stop_tx) = inner.stop_tx.write().await.take() {
            let _ = stop_tx.send(true);
        }

        info!("gesture service stopping");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Enables or disables automatic rebinding after a disconnect.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner
            .reconnect_on_disconnect
            .store(enabled, Ordering::Release);
        info!("auto reconnect {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Publishes a config replacement; the pipeline adopts it at its next
    /// tick. A newer update overwrites an unconsumed older one.
    pub fn update_config(&self, config: Config) {
        self.inner.config_tx.send_replace(config);
        debug!("config update published");
    }

    /// Routes monitor events into reconnects. Installed once; the callback
    /// holds only a weak reference so a dropped service does not linger in
    /// the monitor.
    fn install_device_callback(&self) {
        if self.inner.callback_installed.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner.monitor.register_callback(move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                handle_device_event(inner, event).await;
            });
        });
    }
}

/// Scans and picks the keyboard and mouse to bind.
fn select_devices(config: &Config) -> Result<(Device, Device), ServiceError> {
    let devices = scan::scan_devices().map_err(ServiceError::Scan)?;
    debug!("scan found {} device entries", devices.len());

    let keyboard = scan::select_device(
        &devices,
        DeviceKind::Keyboard,
        &config.device_prefs.preferred_keyboard,
    )
    .ok_or(ServiceError::NoDevice("keyboard"))?;
    let mouse = scan::select_device(
        &devices,
        DeviceKind::Mouse,
        &config.device_prefs.preferred_mouse,
    )
    .ok_or(ServiceError::NoDevice("mouse"))?;

    Ok((keyboard.clone(), mouse.clone()))
}

/// Reacts to a monitor event: a removal of a bound device unbinds the
/// readers and starts a reconnect.
async fn handle_device_event(inner: Arc<ServiceInner>, event: DeviceEvent) {
    if event.kind != DeviceEventKind::Removed {
        return;
    }
    if !inner.running.load(Ordering::Acquire)
        || !inner.reconnect_on_disconnect.load(Ordering::Acquire)
    {
        return;
    }

    let affected = {
        let devices = inner.devices.read().await;
        let is_bound = |bound: &Option<Device>| {
            bound
                .as_ref()
                .is_some_and(|d| d.path == event.device.path)
        };
        is_bound(&devices.keyboard_device) || is_bound(&devices.mouse_device)
    };
    if !affected {
        debug!(
            "ignoring disconnect of unbound device {}",
            event.device.path.display()
        );
        return;
    }

    warn!(
        "bound device disconnected: {} ({})",
        event.device.name,
        event.device.path.display()
    );
    spawn_reconnect(inner);
}

/// Starts a reconnect task unless one is already in flight.
fn spawn_reconnect(inner: Arc<ServiceInner>) {
    if inner.reconnect_in_flight.swap(true, Ordering::AcqRel) {
        debug!("reconnect already in flight");
        return;
    }
    tokio::spawn(async move {
        attempt_reconnect(&inner).await;
        inner.reconnect_in_flight.store(false, Ordering::Release);
    });
}

/// Unbinds the readers, waits for udev, and tries to rebind.
///
/// On exhaustion the service stays running with unbound readers; the
/// pipeline idles until the next disconnect event or health-check failure
/// triggers another attempt.
async fn attempt_reconnect(inner: &Arc<ServiceInner>) {
    info!("reconnecting input devices");

    {
        let mut devices = inner.devices.write().await;
        devices.keyboard.take();
        devices.mouse.take();
    }

    debug!("waiting {:?} for udev to settle", RECONNECT_SETTLE);
    sleep(RECONNECT_SETTLE).await;

    for attempt in 1..=RECONNECT_ATTEMPTS {
        if !inner.running.load(Ordering::Acquire)
            || !inner.reconnect_on_disconnect.load(Ordering::Acquire)
        {
            info!("reconnect aborted, service stopping");
            return;
        }
        info!("reconnect attempt {}/{}", attempt, RECONNECT_ATTEMPTS);

        inner.monitor.rescan_now();

        let config = inner.config_tx.borrow().clone();
        let (keyboard_device, mouse_device) = match select_devices(&config) {
            Ok(found) => found,
            Err(err) => {
                warn!("reconnect selection failed: {}", err);
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        let keyboard = match KeyboardReader::open(&keyboard_device.path) {
            Ok(reader) => Arc::new(reader),
            Err(err) => {
                warn!("reconnect keyboard open failed: {}", err);
                sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        let mouse = match MouseReader::open(&mouse_device.path) {
            Ok(reader) => Arc::new(reader),
            Err(err) => {
                warn!("reconnect mouse open failed: {}", err);
                sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let mut devices = inner.devices.write().await;
        devices.keyboard = Some(keyboard);
        devices.mouse = Some(mouse);
        info!(
            "reconnected to keyboard \"{}\" and mouse \"{}\"",
            keyboard_device.name, mouse_device.name
        );
        devices.keyboard_device = Some(keyboard_device);
        devices.mouse_device = Some(mouse_device);
        return;
    }

    error!(
        "device reconnect failed after {} attempts; waiting for the next device event",
        RECONNECT_ATTEMPTS
    );
}

/// Periodically verifies the bound devices still exist.
///
/// Path existence is a cheap liveness proxy for the real health signal (the
/// syscalls inside the readers); the keyboard is also poked once per check
/// so an undetected dead fd surfaces in the logs.
async fn run_health_check(weak: Weak<ServiceInner>, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    debug!("health check started");

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = weak.upgrade() else { break };
        if !inner.running.load(Ordering::Acquire) {
            break;
        }

        let healthy = {
            let devices = inner.devices.read().await;
            if let Some(keyboard) = &devices.keyboard {
                let _ = keyboard.held_key();
            }
            let path_alive = |bound: &Option<Device>| {
                bound.as_ref().is_some_and(|d| d.path.exists())
            };
            let rebinding = devices.keyboard.is_none() && devices.mouse.is_none();
            rebinding || (path_alive(&devices.keyboard_device) && path_alive(&devices.mouse_device))
        };

        if !healthy {
            warn!("health check failed, triggering reconnect");
            spawn_reconnect(inner);
        } else {
            debug!("health check passed");
        }
    }
    debug!("health check stopped");
}
