//! Time-to-word rendering for the German front plate.
//!
//! The plate is an 11×10 serpentine matrix (indices 0..110) followed by seven
//! status pixels; the four even ones (110, 112, 114, 116) are the minute
//! filler dots. Everything here is pure: the orchestrator decides when a
//! frame actually reaches the strip.

use crate::{config::Phrasing, types::Rgb};

pub const LED_COUNT: usize = 117;

/// A contiguous run of pixels forming one word on the plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Word {
    pub first: u8,
    pub last: u8,
}

const fn word(first: u8, last: u8) -> Word {
    Word { first, last }
}

pub const ES: Word = word(0, 1);
pub const IST: Word = word(3, 5);
pub const FUENF_MIN: Word = word(7, 10);
pub const ZWANZIG: Word = word(11, 17);
pub const ZEHN_MIN: Word = word(18, 21);
pub const DREI_MIN: Word = word(22, 25);
pub const VIERTEL: Word = word(26, 32);
pub const VOR: Word = word(35, 37);
pub const NACH: Word = word(38, 41);
pub const HALB: Word = word(44, 47);
pub const UHR: Word = word(99, 101);

/// The trailing "s" that turns "ein" into "eins".
pub const EINS_S: u8 = 60;

pub const FILLER_DOTS: [u8; 4] = [110, 112, 114, 116];

/// Indexed by displayed hour, 0 meaning twelve.
pub const HOUR_WORDS: [Word; 12] = [
    word(72, 76),   // zwölf
    word(61, 63),   // ein
    word(62, 65),   // zwei
    word(67, 70),   // drei
    word(77, 80),   // vier
    word(51, 54),   // fünf
    word(104, 108), // sechs
    word(55, 60),   // sieben
    word(89, 92),   // acht
    word(81, 84),   // neun
    word(93, 96),   // zehn
    word(85, 87),   // elf
];

/// One minute wording: the twelve five-minute buckets and the minute from
/// which the plate names the upcoming hour.
#[derive(Debug, Clone, Copy)]
pub struct MinuteTable {
    pub buckets: [&'static [Word]; 12],
    pub carry_from_minute: u8,
}

pub const REGIONAL: MinuteTable = MinuteTable {
    buckets: [
        &[],
        &[FUENF_MIN, NACH],
        &[ZEHN_MIN, NACH],
        &[VIERTEL],
        &[ZEHN_MIN, VOR, HALB],
        &[FUENF_MIN, VOR, HALB],
        &[HALB],
        &[FUENF_MIN, NACH, HALB],
        &[ZEHN_MIN, NACH, HALB],
        &[DREI_MIN, VIERTEL],
        &[ZEHN_MIN, VOR],
        &[FUENF_MIN, VOR],
    ],
    carry_from_minute: 15,
};

/// Alternative wording where the hour only carries over from minute 25.
pub const STANDARD: MinuteTable = MinuteTable {
    buckets: [
        &[],
        &[FUENF_MIN, NACH],
        &[ZEHN_MIN, NACH],
        &[VIERTEL, NACH],
        &[ZWANZIG, NACH],
        &[FUENF_MIN, VOR, HALB],
        &[HALB],
        &[FUENF_MIN, NACH, HALB],
        &[ZWANZIG, VOR],
        &[VIERTEL, VOR],
        &[ZEHN_MIN, VOR],
        &[FUENF_MIN, VOR],
    ],
    carry_from_minute: 25,
};

impl Phrasing {
    pub fn table(self) -> &'static MinuteTable {
        match self {
            Self::Regional => &REGIONAL,
            Self::Standard => &STANDARD,
        }
    }
}

/// Set of lit pixel indices. `LED_COUNT` fits in one `u128`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct LitSet(u128);

impl LitSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, index: u8) {
        debug_assert!((index as usize) < LED_COUNT);
        self.0 |= 1u128 << index;
    }

    pub fn insert_word(&mut self, word: Word) {
        for index in word.first..=word.last {
            self.insert(index);
        }
    }

    pub fn contains(&self, index: u8) -> bool {
        index < 128 && self.0 & (1u128 << index) != 0
    }

    pub fn contains_word(&self, word: Word) -> bool {
        (word.first..=word.last).all(|index| self.contains(index))
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..LED_COUNT as u8).filter(|index| self.contains(*index))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub lit: LitSet,
    pub color: Rgb,
}

/// Which bucket, dots and hour a given time resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWords {
    pub bucket: u8,
    pub filler_dots: u8,
    pub displayed_hour: u8,
    pub oclock: bool,
}

pub fn time_words(hour: u8, minute: u8, table: &MinuteTable) -> TimeWords {
    let minute = minute % 60;
    let hour = hour % 12;
    let displayed_hour = if minute >= table.carry_from_minute {
        (hour + 1) % 12
    } else {
        hour
    };

    TimeWords {
        bucket: minute / 5,
        filler_dots: minute % 5,
        displayed_hour,
        oclock: minute < 5,
    }
}

pub fn render(hour: u8, minute: u8, color: Rgb, phrasing: Phrasing) -> Frame {
    let table = phrasing.table();
    let words = time_words(hour, minute, table);
    let mut lit = LitSet::empty();

    lit.insert_word(ES);
    lit.insert_word(IST);

    for dot in FILLER_DOTS.iter().take(words.filler_dots as usize) {
        lit.insert(*dot);
    }

    for minute_word in table.buckets[words.bucket as usize] {
        lit.insert_word(*minute_word);
    }

    lit.insert_word(HOUR_WORDS[words.displayed_hour as usize]);
    if words.displayed_hour == 1 && minute % 60 >= 5 {
        lit.insert(EINS_S);
    }

    if words.oclock {
        lit.insert_word(UHR);
    }

    Frame { lit, color }
}
