//! Exponential smoothing for pointer deltas.

/// Warm-up-gated exponential moving average over `(dx, dy)`.
///
/// The first `warm_up_count` samples after construction or [`reset`] pass
/// through unchanged while seeding the average, so the smoothed track never
/// drags toward an arbitrary initial state. After warm-up each output is
/// `raw * (1 - f) + last * f`.
///
/// [`reset`]: MotionFilter::reset
#[derive(Debug, Clone)]
pub struct MotionFilter {
    smoothing_factor: f64,
    warm_up_count: u32,
    last_dx: f64,
    last_dy: f64,
    samples_seen: u32,
    initialized: bool,
}

impl MotionFilter {
    pub fn new(smoothing_factor: f64, warm_up_count: u32) -> Self {
        Self {
            smoothing_factor,
            warm_up_count,
            last_dx: 0.0,
            last_dy: 0.0,
            samples_seen: 0,
            initialized: false,
        }
    }

    /// Adopts new factors without disturbing the running average, so a
    /// config replacement mid-gesture does not cause a jump.
    pub fn reconfigure(&mut self, smoothing_factor: f64, warm_up_count: u32) {
        self.smoothing_factor = smoothing_factor;
        self.warm_up_count = warm_up_count;
    }

    /// Smooths one delta sample.
    pub fn filter(&mut self, dx_raw: i32, dy_raw: i32) -> (i32, i32) {
        if !self.initialized || self.samples_seen < self.warm_up_count {
            self.samples_seen += 1;
            self.last_dx = dx_raw as f64;
            self.last_dy = dy_raw as f64;
            self.initialized = true;
            return (dx_raw, dy_raw);
        }

        let f = self.smoothing_factor;
        let new_dx = dx_raw as f64 * (1.0 - f) + self.last_dx * f;
        let new_dy = dy_raw as f64 * (1.0 - f) + self.last_dy * f;
        self.last_dx = new_dx;
        self.last_dy = new_dy;

        (round_half_up(new_dx), round_half_up(new_dy))
    }

    /// Returns to the pass-through phase with a cleared average.
    pub fn reset(&mut self) {
        self.last_dx = 0.0;
        self.last_dy = 0.0;
        self.samples_seen = 0;
        self.initialized = false;
    }
}

/// `(v + 0.5) as i32`: truncation after adding half, matching the rounding
/// the emitted event stream has always used. Note this rounds -0.5..0.0 up
/// to 0 rather than away from zero.
fn round_half_up(v: f64) -> i32 {
    (v + 0.5) as i32
}
