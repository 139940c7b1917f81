use crate::config::ClockConfig;

pub const AMBIENT_WINDOW_CAPACITY: usize = 50;

/// Upper bounds (exclusive) of the rolling mean and the level each maps to.
/// Anything at or above the last bound is full brightness.
pub const BRIGHTNESS_STEPS: [(f32, f32); 6] = [
    (320.0, 0.05),
    (480.0, 0.10),
    (1_600.0, 0.20),
    (6_400.0, 0.30),
    (16_000.0, 0.50),
    (24_000.0, 0.70),
];

pub const FULL_BRIGHTNESS: f32 = 1.0;

/// Fixed-size ring of raw light readings. Starts zero-filled, so the mean
/// ramps up over the first readings after boot.
#[derive(Debug, Clone)]
pub struct AmbientWindow {
    samples: [u32; AMBIENT_WINDOW_CAPACITY],
    next: usize,
}

impl Default for AmbientWindow {
    fn default() -> Self {
        Self {
            samples: [0; AMBIENT_WINDOW_CAPACITY],
            next: 0,
        }
    }
}

impl AmbientWindow {
    pub fn push(&mut self, raw: u32) {
        self.samples[self.next] = raw;
        self.next = (self.next + 1) % AMBIENT_WINDOW_CAPACITY;
    }

    pub fn mean(&self) -> f32 {
        let total: u64 = self.samples.iter().map(|sample| u64::from(*sample)).sum();
        total as f32 / AMBIENT_WINDOW_CAPACITY as f32
    }
}

pub fn level_for_mean(mean: f32) -> f32 {
    BRIGHTNESS_STEPS
        .iter()
        .find(|(bound, _)| mean < *bound)
        .map(|(_, level)| *level)
        .unwrap_or(FULL_BRIGHTNESS)
}

#[derive(Debug, Clone, Default)]
pub struct BrightnessController {
    window: AmbientWindow,
}

impl BrightnessController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, raw: u32) -> f32 {
        self.window.push(raw);
        level_for_mean(self.window.mean())
    }

    /// The level to show this tick. With auto brightness off the sensor is
    /// never read and the window is left alone.
    pub fn current_level(&mut self, config: &ClockConfig, read_raw: impl FnOnce() -> u32) -> f32 {
        if config.auto_brightness {
            self.update(read_raw())
        } else {
            config.brightness
        }
    }

    pub fn mean(&self) -> f32 {
        self.window.mean()
    }
}
