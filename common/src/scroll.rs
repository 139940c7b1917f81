//! Boot-time scroller that shows the device address across the letter grid.

use core::convert::Infallible;

use embedded_graphics::{
    draw_target::DrawTarget,
    geometry::{OriginDimensions, Point, Size},
    mono_font::{ascii::FONT_5X7, MonoTextStyle},
    pixelcolor::BinaryColor,
    text::{Baseline, Text},
    Drawable, Pixel,
};

use crate::render::LitSet;

pub const GRID_WIDTH: i32 = 11;
pub const GRID_HEIGHT: i32 = 10;
pub const STEP_INTERVAL_MS: u64 = 100;
pub const SCROLL_REPEATS: u32 = 2;

const TEXT_TOP: i32 = 2;

/// Rows run left to right on even lines and right to left on odd ones.
pub fn grid_index(x: i32, y: i32) -> Option<u8> {
    if !(0..GRID_WIDTH).contains(&x) || !(0..GRID_HEIGHT).contains(&y) {
        return None;
    }
    let column = if y % 2 == 0 { x } else { GRID_WIDTH - 1 - x };
    u8::try_from(y * GRID_WIDTH + column).ok()
}

/// The letter area as a monochrome display. Off-grid pixels are dropped.
struct GridCanvas {
    lit: LitSet,
}

impl OriginDimensions for GridCanvas {
    fn size(&self) -> Size {
        Size::new(GRID_WIDTH as u32, GRID_HEIGHT as u32)
    }
}

impl DrawTarget for GridCanvas {
    type Color = BinaryColor;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            if !color.is_on() {
                continue;
            }
            if let Some(index) = grid_index(point.x, point.y) {
                self.lit.insert(index);
            }
        }
        Ok(())
    }
}

pub fn text_width(text: &str) -> i32 {
    let advance = FONT_5X7.character_size.width + FONT_5X7.character_spacing;
    text.chars().count() as i32 * advance as i32
}

/// Lit grid pixels for `text` with its left edge at column `x_offset`.
pub fn draw_text(text: &str, x_offset: i32) -> LitSet {
    let mut canvas = GridCanvas {
        lit: LitSet::empty(),
    };
    let style = MonoTextStyle::new(&FONT_5X7, BinaryColor::On);
    let drawn = Text::with_baseline(text, Point::new(x_offset, TEXT_TOP), style, Baseline::Top)
        .draw(&mut canvas);
    if let Err(never) = drawn {
        match never {}
    }
    canvas.lit
}

#[derive(Debug, Clone)]
pub struct ScrollText {
    offset: i32,
    repeats: u32,
    last_step_ms: Option<u64>,
    finished: bool,
}

impl Default for ScrollText {
    fn default() -> Self {
        Self {
            offset: GRID_WIDTH,
            repeats: 0,
            last_step_ms: None,
            finished: false,
        }
    }
}

impl ScrollText {
    pub fn is_active(&self) -> bool {
        !self.finished
    }

    pub fn repeats(&self) -> u32 {
        self.repeats
    }

    /// Advances one column when the step interval has passed and returns the
    /// pixels to show. With `may_finish` false (provisioning) it never ends.
    pub fn step(&mut self, now_ms: u64, text: &str, may_finish: bool) -> Option<LitSet> {
        if self.finished {
            return None;
        }
        if let Some(last) = self.last_step_ms {
            if now_ms.saturating_sub(last) < STEP_INTERVAL_MS {
                return None;
            }
        }

        let lit = draw_text(text, self.offset);
        self.offset -= 1;
        if self.offset < -(text_width(text) + GRID_WIDTH) {
            self.offset = GRID_WIDTH;
            self.repeats += 1;
        }
        self.last_step_ms = Some(now_ms);

        if may_finish && self.repeats >= SCROLL_REPEATS {
            self.finished = true;
        }
        Some(lit)
    }
}
