use serde::{Deserialize, Deserializer, Serialize};

use crate::types::Rgb;

pub const DEFAULT_TZ_HOURS: i32 = 1;
pub const SUMMER_TZ_HOURS: i32 = 2;
pub const WINTER_TZ_HOURS: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub ssid: String,
    pub password: String,
}

/// Which minute wording the front plate uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phrasing {
    /// "viertel drei", "drei viertel drei", "zehn vor halb drei".
    #[default]
    Regional,
    /// "viertel nach zwei", "zwanzig nach zwei", "viertel vor drei".
    Standard,
}

/// The single persisted record. Field names match the on-flash document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockConfig {
    #[serde(rename = "wifi", default)]
    pub credentials: Vec<Credential>,
    pub color: Rgb,
    #[serde(rename = "tz", deserialize_with = "deserialize_hours")]
    pub timezone_offset: i32,
    pub auto_dst: bool,
    pub auto_brightness: bool,
    pub brightness: f32,
    #[serde(default)]
    pub phrasing: Phrasing,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            credentials: Vec::new(),
            color: Rgb::RED,
            timezone_offset: DEFAULT_TZ_HOURS,
            auto_dst: true,
            auto_brightness: true,
            brightness: 1.0,
            phrasing: Phrasing::default(),
        }
    }
}

impl ClockConfig {
    pub fn sanitize(&mut self) {
        self.brightness = if self.brightness.is_finite() {
            self.brightness.clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.timezone_offset = self.timezone_offset.clamp(-12, 14);

        let mut seen = Vec::with_capacity(self.credentials.len());
        self.credentials.retain(|entry| {
            if seen.contains(&entry.ssid) {
                false
            } else {
                seen.push(entry.ssid.clone());
                true
            }
        });
    }

    /// Appends a credential unless its ssid is already stored. Returns whether
    /// the list changed.
    pub fn add_credential(&mut self, ssid: &str, password: &str) -> bool {
        if self.credentials.iter().any(|entry| entry.ssid == ssid) {
            return false;
        }
        self.credentials.push(Credential {
            ssid: ssid.to_string(),
            password: password.to_string(),
        });
        true
    }

    pub fn set_color(&mut self, color: Rgb) -> bool {
        if self.color != color {
            self.color = color;
            true
        } else {
            false
        }
    }

    pub fn set_timezone(&mut self, offset_hours: i32, auto_dst: bool) {
        self.timezone_offset = offset_hours.clamp(-12, 14);
        self.auto_dst = auto_dst;
    }

    /// `percent` is the 0-100 value the settings page sends.
    pub fn set_brightness(&mut self, auto_brightness: bool, percent: f32) {
        self.auto_brightness = auto_brightness;
        self.brightness = if percent.is_finite() {
            (percent / 100.0).clamp(0.0, 1.0)
        } else {
            1.0
        };
    }

    pub fn ssids(&self) -> Vec<String> {
        self.credentials
            .iter()
            .map(|entry| entry.ssid.clone())
            .collect()
    }
}

/// Numbers have been written as integers, floats (`1.0`) and strings (`"1"`)
/// by different firmware and settings page versions.
pub fn deserialize_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Number {
        Int(i64),
        Float(f64),
        Text(String),
    }

    let value = match Number::deserialize(deserializer)? {
        Number::Int(value) => value as f64,
        Number::Float(value) => value,
        Number::Text(text) => text.trim().parse::<f64>().map_err(|_| {
            serde::de::Error::custom(format!("invalid number `{text}`"))
        })?,
    };

    if value.is_finite() {
        Ok(value)
    } else {
        Err(serde::de::Error::custom("non-finite number"))
    }
}

pub fn deserialize_hours<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let hours = deserialize_number(deserializer)?.round();
    if (f64::from(i32::MIN)..=f64::from(i32::MAX)).contains(&hours) {
        Ok(hours as i32)
    } else {
        Err(serde::de::Error::custom("hour offset out of range"))
    }
}
