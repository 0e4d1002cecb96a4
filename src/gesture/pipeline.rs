//! The gesture tick loop.
//!
//! A single task polls the keyboard and mouse, smooths the motion, advances
//! the finger state machine, and plays the resulting actions onto the
//! virtual touchpad. The loop never blocks on a channel; config updates are
//! picked up opportunistically at the top of a tick and the stop signal is
//! observed at iteration boundaries.

use std::time::{Duration, Instant};

use statum::{machine, state};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::device::{MouseReader, VirtualTouchpad};
use crate::gesture::state::{GestureAction, GestureParams, GestureState};
use crate::gesture::MotionFilter;
use crate::service::SharedDevices;

/// Delay between ticks; a busy-ish loop trading CPU for input latency.
const TICK_INTERVAL: Duration = Duration::from_micros(100);

/// How long to back off when the readers are unbound mid-reconnect.
const UNBOUND_BACKOFF: Duration = Duration::from_millis(500);

/// Interval between tick-rate debug reports.
const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[state]
#[derive(Debug, Clone)]
pub enum PipelineState {
    Initializing,
    Running,
}

#[machine]
pub struct GesturePipeline<S: PipelineState> {
    /// Device handles shared with the service; snapshotted each tick.
    shared: SharedDevices,

    /// Coalescing config updates; at most one pending replacement.
    config_rx: watch::Receiver<Config>,

    /// Flips to true exactly once, when the service stops.
    stop_rx: watch::Receiver<bool>,

    /// Config adopted for the current tick.
    config: Config,

    /// Transition parameters derived from `config`.
    params: GestureParams,

    filter: MotionFilter,

    gesture: GestureState,

    /// When nonzero motion was last observed.
    last_activity: Instant,
}

impl GesturePipeline<Initializing> {
    pub fn create(
        shared: SharedDevices,
        config_rx: watch::Receiver<Config>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        let config = config_rx.borrow().clone();
        let params = GestureParams::from_config(&config);
        let filter = MotionFilter::new(
            config.motion.smoothing_factor,
            config.motion.warm_up_count,
        );

        Self::new(
            shared,
            config_rx,
            stop_rx,
            config,
            params,
            filter,
            GestureState::new(),
            Instant::now(),
        )
    }

    pub fn initialize(self) -> GesturePipeline<Running> {
        info!("gesture pipeline initialized, entering tick loop");
        self.transition()
    }
}

impl GesturePipeline<Running> {
    /// Runs ticks until the stop signal fires, then closes the devices.
    pub async fn run(mut self) {
        let mut actions: Vec<GestureAction> = Vec::new();
        let mut ticks: u64 = 0;
        let mut last_stats = Instant::now();

        loop {
            if *self.stop_rx.borrow() {
                break;
            }

            self.adopt_config_update();
            self.tick(&mut actions).await;

            ticks += 1;
            if last_stats.elapsed() >= STATS_INTERVAL {
                debug!(
                    "pipeline ran {} ticks in the last {}s",
                    ticks,
                    STATS_INTERVAL.as_secs()
                );
                ticks = 0;
                last_stats = Instant::now();
            }

            sleep(TICK_INTERVAL).await;
        }

        self.shutdown().await;
    }

    /// Adopts at most one pending config replacement.
    fn adopt_config_update(&mut self) {
        if self.config_rx.has_changed().unwrap_or(false) {
            self.config = self.config_rx.borrow_and_update().clone();
            self.params = GestureParams::from_config(&self.config);
            self.filter.reconfigure(
                self.config.motion.smoothing_factor,
                self.config.motion.warm_up_count,
            );
            info!("pipeline adopted updated config");
        }
    }

    async fn tick(&mut self, actions: &mut Vec<GestureAction>) {
        let (keyboard, mouse, touchpad) = {
            let devices = self.shared.read().await;
            (
                devices.keyboard.clone(),
                devices.mouse.clone(),
                devices.touchpad.clone(),
            )
        };
        // readers are unbound while a reconnect is in flight
        let (Some(keyboard), Some(mouse), Some(touchpad)) = (keyboard, mouse, touchpad) else {
            sleep(UNBOUND_BACKOFF).await;
            return;
        };

        let pressed_key = keyboard.held_key();
        let (dx_raw, dy_raw) = mouse.poll_delta();

        let factor = self.config.motion.delta_factor;
        let (dx, dy) = self
            .filter
            .filter(dx_raw.saturating_mul(factor), dy_raw.saturating_mul(factor));

        // pausing mid-gesture recenters the fingers so the next motion has
        // headroom again
        let now = Instant::now();
        if self.gesture.active_fingers() > 0
            && now.duration_since(self.last_activity) > self.config.reset_threshold()
        {
            actions.clear();
            self.gesture.recenter(&self.params, actions);
            self.apply(&touchpad, &mouse, actions);
            self.last_activity = now;
        }
        if dx_raw != 0 || dy_raw != 0 {
            self.last_activity = now;
        }

        let fingers_before = self.gesture.active_fingers();
        actions.clear();
        self.gesture.advance(&self.params, pressed_key, dx, dy, actions);
        self.apply(&touchpad, &mouse, actions);

        // a fresh gesture counts as activity, otherwise a held-but-unmoved
        // trigger key would recenter immediately after placing the fingers
        if fingers_before == 0 && self.gesture.active_fingers() > 0 {
            self.last_activity = now;
        }
    }

    /// Plays a batch of actions onto the devices.
    ///
    /// Emission failures are logged and skipped; a transient write error
    /// must not take the loop down.
    fn apply(
        &mut self,
        touchpad: &VirtualTouchpad,
        mouse: &MouseReader,
        actions: &[GestureAction],
    ) {
        for action in actions {
            match *action {
                GestureAction::Grab => {
                    info!("gesture started, grabbing mouse");
                    if let Err(err) = mouse.grab() {
                        warn!("failed to grab mouse: {}", err);
                    }
                }
                GestureAction::Release => {
                    info!("gesture ended, releasing mouse");
                    if let Err(err) = mouse.release() {
                        warn!("failed to release mouse: {}", err);
                    }
                }
                GestureAction::Down {
                    slot,
                    tracking_id,
                    x,
                    y,
                } => {
                    if let Err(err) = touchpad.touch_down(slot as i32, tracking_id, x, y) {
                        warn!("touch down on slot {} failed: {}", slot, err);
                    }
                }
                GestureAction::Move { slot, x, y } => {
                    if let Err(err) = touchpad.touch_move(slot as i32, x, y) {
                        warn!("touch move on slot {} failed: {}", slot, err);
                    }
                }
                GestureAction::Up { slot } => {
                    if let Err(err) = touchpad.touch_up(slot as i32) {
                        warn!("touch up on slot {} failed: {}", slot, err);
                    }
                }
                GestureAction::ResetFilter => self.filter.reset(),
            }
        }
    }

    /// Closes the devices on the way out; the service only flips the stop
    /// signal and leaves teardown to the task that owns the tick loop.
    async fn shutdown(self) {
        let mut devices = self.shared.write().await;
        devices.touchpad.take();
        devices.mouse.take();
        devices.keyboard.take();
        info!("gesture pipeline stopped, devices closed");
    }
}

// The filter and state machine are pure, so whole swipe arcs can run as
// tests with recorded actions standing in for the devices.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::gesture::state::GestureAction::*;

    const TWO_FINGER_KEY: i32 = 184;
    const FOUR_FINGER_KEY: i32 = 183;

    struct Harness {
        filter: MotionFilter,
        state: GestureState,
        params: GestureParams,
    }

    impl Harness {
        /// An unsmoothed setup, so expected positions are exact.
        fn new() -> Self {
            Self {
                filter: MotionFilter::new(0.0, 0),
                state: GestureState::new(),
                params: GestureParams {
                    two_finger_key: TWO_FINGER_KEY,
                    four_finger_key: FOUR_FINGER_KEY,
                    min_x: 0,
                    max_x: 32767,
                    min_y: 0,
                    max_y: 32767,
                },
            }
        }

        /// One tick's worth of decisions: filter the raw delta, advance.
        fn tick(&mut self, pressed_key: i32, dx_raw: i32, dy_raw: i32) -> Vec<GestureAction> {
            let (dx, dy) = self.filter.filter(dx_raw, dy_raw);
            let mut actions = Vec::new();
            self.state
                .advance(&self.params, pressed_key, dx, dy, &mut actions);
            for action in &actions {
                if *action == ResetFilter {
                    self.filter.reset();
                }
            }
            actions
        }

        fn idle_reset(&mut self) -> Vec<GestureAction> {
            let mut actions = Vec::new();
            self.state.recenter(&self.params, &mut actions);
            for action in &actions {
                if *action == ResetFilter {
                    self.filter.reset();
                }
            }
            actions
        }
    }

    #[test]
    fn swipe_arc_from_press_to_release() {
        let mut harness = Harness::new();

        // press: grab and two fingers straddling the center
        let actions = harness.tick(TWO_FINGER_KEY, 0, 0);
        assert_eq!(
            actions,
            vec![
                Grab,
                Down {
                    slot: 0,
                    tracking_id: 0,
                    x: 16383,
                    y: 16373
                },
                Down {
                    slot: 1,
                    tracking_id: 1,
                    x: 16383,
                    y: 16393
                },
            ]
        );

        // motion: both fingers track the delta
        let actions = harness.tick(TWO_FINGER_KEY, 100, 50);
        assert_eq!(
            actions,
            vec![
                Move {
                    slot: 0,
                    x: 16483,
                    y: 16423
                },
                Move {
                    slot: 1,
                    x: 16483,
                    y: 16443
                },
            ]
        );

        // release: ungrab and lift
        let actions = harness.tick(0, 0, 0);
        assert_eq!(actions, vec![Release, Up { slot: 0 }, Up { slot: 1 }]);
        assert_eq!(harness.state.active_fingers(), 0);
    }

    #[test]
    fn key_switch_restarts_with_the_other_finger_count() {
        let mut harness = Harness::new();
        harness.tick(TWO_FINGER_KEY, 0, 0);
        harness.tick(TWO_FINGER_KEY, 10, 10);

        let actions = harness.tick(FOUR_FINGER_KEY, 0, 0);
        assert_eq!(actions, vec![Up { slot: 0 }, Up { slot: 1 }, ResetFilter]);

        let actions = harness.tick(FOUR_FINGER_KEY, 0, 0);
        let downs = actions.iter().filter(|a| matches!(a, Down { .. })).count();
        assert_eq!(downs, 4);
        assert_eq!(harness.state.active_fingers(), 4);
    }

    #[test]
    fn idle_reset_recenters_and_restores_filter_warm_up() {
        let mut harness = Harness::new();
        // a smoothing setup, so the filter reset is observable
        harness.filter = MotionFilter::new(0.5, 0);

        harness.tick(TWO_FINGER_KEY, 0, 0);
        harness.tick(TWO_FINGER_KEY, 100, 100);

        let actions = harness.idle_reset();
        assert_eq!(
            actions,
            vec![
                Up { slot: 0 },
                Up { slot: 1 },
                ResetFilter,
                Down {
                    slot: 0,
                    tracking_id: 0,
                    x: 16383,
                    y: 16373
                },
                Down {
                    slot: 1,
                    tracking_id: 1,
                    x: 16383,
                    y: 16393
                },
            ]
        );

        // the reset filter passes the next sample through unsmoothed
        let actions = harness.tick(TWO_FINGER_KEY, 40, 0);
        assert_eq!(
            actions,
            vec![
                Move {
                    slot: 0,
                    x: 16423,
                    y: 16373
                },
                Move {
                    slot: 1,
                    x: 16423,
                    y: 16393
                },
            ]
        );
    }

    #[test]
    fn smoothed_motion_still_lands_on_filtered_positions() {
        let mut harness = Harness::new();
        harness.filter = MotionFilter::new(0.5, 2);

        harness.tick(TWO_FINGER_KEY, 0, 0);
        // still in warm-up, passes through
        harness.tick(TWO_FINGER_KEY, 10, 0);
        // 20 * 0.5 + 10 * 0.5 = 15
        let actions = harness.tick(TWO_FINGER_KEY, 20, 0);
        assert_eq!(
            actions[0],
            Move {
                slot: 0,
                x: 16383 + 10 + 15,
                y: 16373
            }
        );
    }
}
