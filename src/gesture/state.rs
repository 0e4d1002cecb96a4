//! The finger state machine.
//!
//! [`GestureState::advance`] is a pure transition function: it inspects the
//! currently held key and the smoothed delta, mutates the tracked finger
//! positions, and returns the device actions the caller should perform. No
//! I/O happens here.

use crate::config::Config;

/// Most fingers a gesture can put down.
pub const MAX_FINGERS: usize = 4;

/// Vertical distance between neighboring fingers at initialization.
const FINGER_SPACING: i32 = 20;

/// One tracked finger position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FingerSlot {
    pub x: i32,
    pub y: i32,
}

/// Everything the transition function needs from the config.
#[derive(Debug, Clone, Copy)]
pub struct GestureParams {
    pub two_finger_key: i32,
    pub four_finger_key: i32,
    pub min_x: i32,
    pub max_x: i32,
    pub min_y: i32,
    pub max_y: i32,
}

impl GestureParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            two_finger_key: config.input.two_finger_key,
            four_finger_key: config.input.four_finger_key,
            min_x: config.touchpad.min_x,
            max_x: config.touchpad.max_x,
            min_y: config.touchpad.min_y,
            max_y: config.touchpad.max_y,
        }
    }

    /// Where fingers are (re)initialized.
    pub fn center(&self) -> (i32, i32) {
        (self.max_x / 2, self.max_y / 2)
    }
}

/// A device operation requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureAction {
    /// Take exclusive possession of the mouse.
    Grab,
    /// Give the mouse back to the rest of the system.
    Release,
    /// Put a finger down.
    Down {
        slot: usize,
        tracking_id: i32,
        x: i32,
        y: i32,
    },
    /// Move a finger.
    Move { slot: usize, x: i32, y: i32 },
    /// Lift a finger.
    Up { slot: usize },
    /// Clear the motion filter's history.
    ResetFilter,
}

/// Tracked gesture state across ticks.
#[derive(Debug, Clone, Default)]
pub struct GestureState {
    fingers: [FingerSlot; MAX_FINGERS],
    active_fingers: usize,
    prev_key: i32,
    grabbed: bool,
}

impl GestureState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_fingers(&self) -> usize {
        self.active_fingers
    }

    pub fn is_grabbed(&self) -> bool {
        self.grabbed
    }

    /// Runs one transition.
    ///
    /// Requested actions are appended to `actions` in the order the device
    /// must perform them.
    pub fn advance(
        &mut self,
        params: &GestureParams,
        pressed_key: i32,
        dx: i32,
        dy: i32,
        actions: &mut Vec<GestureAction>,
    ) {
        let is_trigger =
            pressed_key == params.two_finger_key || pressed_key == params.four_finger_key;

        if pressed_key == params.two_finger_key && self.active_fingers == 0 {
            self.begin(params, 2, actions);
            self.prev_key = pressed_key;
        } else if pressed_key == params.four_finger_key && self.active_fingers == 0 {
            self.begin(params, 4, actions);
            self.prev_key = pressed_key;
        } else if is_trigger && self.active_fingers > 0 {
            if pressed_key == self.prev_key {
                self.move_fingers(params, dx, dy, actions);
            } else {
                // switching trigger keys mid-gesture: drop the old gesture,
                // the next tick starts the new one
                self.lift_all(actions);
                actions.push(GestureAction::ResetFilter);
            }
            self.prev_key = pressed_key;
        } else {
            if self.grabbed {
                actions.push(GestureAction::Release);
                self.grabbed = false;
            }
            if self.active_fingers > 0 {
                self.lift_all(actions);
            }
            self.prev_key = pressed_key;
        }
    }

    /// Lifts all fingers, clears the filter, and puts the same number of
    /// fingers back down at the center.
    ///
    /// Called when motion pauses long enough mid-gesture; recentering gives
    /// the next movement fresh headroom, which is what makes scrolling feel
    /// unbounded on a bounded coordinate space.
    pub fn recenter(&mut self, params: &GestureParams, actions: &mut Vec<GestureAction>) {
        let count = self.active_fingers;
        if count == 0 {
            return;
        }
        for slot in 0..count {
            actions.push(GestureAction::Up { slot });
        }
        actions.push(GestureAction::ResetFilter);
        self.place_fingers(params, count, actions);
    }

    fn begin(&mut self, params: &GestureParams, count: usize, actions: &mut Vec<GestureAction>) {
        if !self.grabbed {
            actions.push(GestureAction::Grab);
            self.grabbed = true;
        }
        self.place_fingers(params, count, actions);
    }

    fn place_fingers(
        &mut self,
        params: &GestureParams,
        count: usize,
        actions: &mut Vec<GestureAction>,
    ) {
        let (cx, cy) = params.center();
        let start_y = cy - FINGER_SPACING * (count as i32 - 1) / 2;

        for slot in 0..count {
            let x = cx;
            let y = start_y + FINGER_SPACING * slot as i32;
            self.fingers[slot] = FingerSlot { x, y };
            actions.push(GestureAction::Down {
                slot,
                tracking_id: slot as i32,
                x,
                y,
            });
        }
        self.active_fingers = count;
    }

    fn move_fingers(
        &mut self,
        params: &GestureParams,
        dx: i32,
        dy: i32,
        actions: &mut Vec<GestureAction>,
    ) {
        for slot in 0..self.active_fingers {
            let finger = &mut self.fingers[slot];
            finger.x = clamp(finger.x.saturating_add(dx), params.min_x, params.max_x);
            finger.y = clamp(finger.y.saturating_add(dy), params.min_y, params.max_y);
            actions.push(GestureAction::Move {
                slot,
                x: finger.x,
                y: finger.y,
            });
        }
    }

    fn lift_all(&mut self, actions: &mut Vec<GestureAction>) {
        for slot in 0..self.active_fingers {
            actions.push(GestureAction::Up { slot });
        }
        self.active_fingers = 0;
    }
}

fn clamp(value: i32, min: i32, max: i32) -> i32 {
    value.min(max).max(min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::GestureAction::*;

    fn params() -> GestureParams {
        GestureParams {
            two_finger_key: 184,
            four_finger_key: 183,
            min_x: 0,
            max_x: 32767,
            min_y: 0,
            max_y: 32767,
        }
    }

    fn advance(state: &mut GestureState, key: i32, dx: i32, dy: i32) -> Vec<GestureAction> {
        let mut actions = Vec::new();
        state.advance(&params(), key, dx, dy, &mut actions);
        actions
    }

    #[test]
    fn two_finger_start_grabs_and_places_fingers_around_center() {
        let mut state = GestureState::new();
        let actions = advance(&mut state, 184, 0, 0);

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
        assert_eq!(state.active_fingers(), 2);
        assert!(state.is_grabbed());
    }

    #[test]
    fn four_finger_start_spreads_four_fingers() {
        let mut state = GestureState::new();
        let actions = advance(&mut state, 183, 0, 0);

        let ys: Vec<i32> = actions
            .iter()
            .filter_map(|a| match a {
                Down { y, .. } => Some(*y),
                _ => None,
            })
            .collect();
        assert_eq!(ys, vec![16353, 16373, 16393, 16413]);
        assert_eq!(state.active_fingers(), 4);
    }

    #[test]
    fn continuing_motion_moves_every_finger_by_the_delta() {
        let mut state = GestureState::new();
        advance(&mut state, 184, 0, 0);
        let actions = advance(&mut state, 184, 100, 50);

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
    }

    #[test]
    fn key_release_releases_grab_and_lifts_fingers() {
        let mut state = GestureState::new();
        advance(&mut state, 184, 0, 0);
        advance(&mut state, 184, 100, 50);
        let actions = advance(&mut state, 0, 0, 0);

        assert_eq!(
            actions,
            vec![Release, Up { slot: 0 }, Up { slot: 1 }]
        );
        assert_eq!(state.active_fingers(), 0);
        assert!(!state.is_grabbed());
    }

    #[test]
    fn switching_trigger_keys_drops_the_gesture_then_starts_fresh() {
        let mut state = GestureState::new();
        advance(&mut state, 184, 0, 0);

        let actions = advance(&mut state, 183, 0, 0);
        assert_eq!(actions, vec![Up { slot: 0 }, Up { slot: 1 }, ResetFilter]);
        assert_eq!(state.active_fingers(), 0);
        // the grab is kept across the switch
        assert!(state.is_grabbed());

        let actions = advance(&mut state, 183, 0, 0);
        let downs = actions
            .iter()
            .filter(|a| matches!(a, Down { .. }))
            .count();
        assert_eq!(downs, 4);
        assert!(!actions.contains(&Grab));
        assert_eq!(state.active_fingers(), 4);
    }

    #[test]
    fn recenter_lifts_resets_and_places_fingers_back_at_center() {
        let mut state = GestureState::new();
        advance(&mut state, 184, 0, 0);
        advance(&mut state, 184, 500, 500);

        let mut actions = Vec::new();
        state.recenter(&params(), &mut actions);
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
        assert_eq!(state.active_fingers(), 2);
    }

    #[test]
    fn recenter_without_active_fingers_is_a_no_op() {
        let mut state = GestureState::new();
        let mut actions = Vec::new();
        state.recenter(&params(), &mut actions);
        assert!(actions.is_empty());
    }

    #[test]
    fn moves_clamp_at_the_touchpad_edges() {
        let mut state = GestureState::new();
        advance(&mut state, 184, 0, 0);

        let actions = advance(&mut state, 184, 32767, -32767);
        assert_eq!(
            actions,
            vec![
                Move {
                    slot: 0,
                    x: 32767,
                    y: 0
                },
                Move {
                    slot: 1,
                    x: 32767,
                    y: 0
                },
            ]
        );

        // pinned at the edge, another push changes nothing
        let actions = advance(&mut state, 184, 1, -1);
        assert_eq!(
            actions,
            vec![
                Move {
                    slot: 0,
                    x: 32767,
                    y: 0
                },
                Move {
                    slot: 1,
                    x: 32767,
                    y: 0
                },
            ]
        );
    }

    #[test]
    fn unrelated_keys_do_not_start_gestures() {
        let mut state = GestureState::new();
        assert!(advance(&mut state, 30, 5, 5).is_empty());
        assert_eq!(state.active_fingers(), 0);
        assert!(!state.is_grabbed());
    }

    #[test]
    fn every_down_is_matched_by_one_up_before_the_slot_is_reused() {
        let mut state = GestureState::new();
        let mut log = Vec::new();
        let p = params();

        state.advance(&p, 184, 0, 0, &mut log);
        state.advance(&p, 184, 10, 10, &mut log);
        state.recenter(&p, &mut log);
        state.advance(&p, 183, 0, 0, &mut log);
        state.advance(&p, 183, 0, 0, &mut log);
        state.advance(&p, 0, 0, 0, &mut log);

        let mut down = [false; MAX_FINGERS];
        for action in &log {
            match action {
                Down { slot, .. } => {
                    assert!(!down[*slot], "slot {slot} went down twice without an up");
                    down[*slot] = true;
                }
                Up { slot } => {
                    assert!(down[*slot], "slot {slot} lifted while not down");
                    down[*slot] = false;
                }
                _ => {}
            }
        }
        assert!(down.iter().all(|d| !d), "gesture ended with fingers down");
    }
}
