//! Limit bands, colors and persistence.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::value::Value;

/// Name of the limits set every item with limits must define
pub const DEFAULT_LIMITS_SET: &str = "DEFAULT";

/// Color assigned to an item's current value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitsState {
    /// At or below red low
    RedLow,
    /// Between red low and yellow low
    YellowLow,
    /// Between yellow low and green low
    GreenLow,
    /// Inside the good band
    Green,
    /// Between green high and yellow high
    GreenHigh,
    /// Inside the operational band
    Blue,
    /// Between yellow high and red high
    YellowHigh,
    /// At or above red high
    RedHigh,
    /// State color
    Yellow,
    /// State color
    Red,
}

impl LimitsState {
    /// Returns the keyword for this state
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitsState::RedLow => "RED_LOW",
            LimitsState::YellowLow => "YELLOW_LOW",
            LimitsState::GreenLow => "GREEN_LOW",
            LimitsState::Green => "GREEN",
            LimitsState::GreenHigh => "GREEN_HIGH",
            LimitsState::Blue => "BLUE",
            LimitsState::YellowHigh => "YELLOW_HIGH",
            LimitsState::RedHigh => "RED_HIGH",
            LimitsState::Yellow => "YELLOW",
            LimitsState::Red => "RED",
        }
    }

    /// Returns true for the colors that need no operator attention
    pub fn is_good(&self) -> bool {
        matches!(
            self,
            LimitsState::Green | LimitsState::GreenLow | LimitsState::GreenHigh | LimitsState::Blue
        )
    }

    /// Parses a state color keyword (GREEN, YELLOW, RED)
    pub fn state_color(text: &str) -> Result<Self> {
        match text.to_ascii_uppercase().as_str() {
            "GREEN" => Ok(LimitsState::Green),
            "YELLOW" => Ok(LimitsState::Yellow),
            "RED" => Ok(LimitsState::Red),
            other => Err(Error::invalid_value(
                "STATE",
                format!("invalid state color '{}', must be GREEN, YELLOW, or RED", other),
            )),
        }
    }
}

impl fmt::Display for LimitsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boundaries of one limits set
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LimitsBand {
    /// Red low boundary
    pub red_low: f64,
    /// Yellow low boundary
    pub yellow_low: f64,
    /// Yellow high boundary
    pub yellow_high: f64,
    /// Red high boundary
    pub red_high: f64,
    /// Optional green low boundary
    pub green_low: Option<f64>,
    /// Optional green high boundary
    pub green_high: Option<f64>,
}

impl LimitsBand {
    /// Creates a four-boundary band, checking the ordering
    pub fn new(red_low: f64, yellow_low: f64, yellow_high: f64, red_high: f64) -> Result<Self> {
        let band = Self {
            red_low,
            yellow_low,
            yellow_high,
            red_high,
            green_low: None,
            green_high: None,
        };
        band.verify()?;
        Ok(band)
    }

    /// Adds the inner green boundaries, checking the ordering
    pub fn with_green(mut self, green_low: f64, green_high: f64) -> Result<Self> {
        self.green_low = Some(green_low);
        self.green_high = Some(green_high);
        self.verify()?;
        Ok(self)
    }

    fn verify(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::invalid_value("LIMITS", msg.to_string()));
        if self.red_low > self.yellow_low {
            return fail("red_low must be less than or equal to yellow_low");
        }
        if self.yellow_high > self.red_high {
            return fail("yellow_high must be less than or equal to red_high");
        }
        if self.yellow_low > self.yellow_high {
            return fail("yellow_low must be less than or equal to yellow_high");
        }
        if let (Some(gl), Some(gh)) = (self.green_low, self.green_high) {
            if gl < self.yellow_low || gh > self.yellow_high || gl > gh {
                return fail("green limits must lie inside the yellow limits");
            }
        }
        Ok(())
    }

    /// Color of `value` within this band
    pub fn evaluate(&self, value: f64) -> LimitsState {
        if value > self.yellow_low {
            if value < self.yellow_high {
                match (self.green_low, self.green_high) {
                    (Some(green_low), Some(green_high)) => {
                        if value < green_high {
                            if value > green_low {
                                LimitsState::Blue
                            } else {
                                LimitsState::GreenLow
                            }
                        } else {
                            LimitsState::GreenHigh
                        }
                    }
                    _ => LimitsState::Green,
                }
            } else if value < self.red_high {
                LimitsState::YellowHigh
            } else {
                LimitsState::RedHigh
            }
        } else if value > self.red_low {
            LimitsState::YellowLow
        } else {
            LimitsState::RedLow
        }
    }
}

/// Limits definition of one item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Limits {
    sets: BTreeMap<String, LimitsBand>,
    persistence: u32,
    enabled: bool,
}

impl Limits {
    /// Creates limits with a single DEFAULT band
    pub fn new(default: LimitsBand) -> Self {
        let mut sets = BTreeMap::new();
        sets.insert(DEFAULT_LIMITS_SET.to_string(), default);
        Self {
            sets,
            persistence: 1,
            enabled: true,
        }
    }

    /// Adds or replaces a named band
    pub fn set_band(&mut self, set: &str, band: LimitsBand) {
        self.sets.insert(set.to_uppercase(), band);
    }

    /// Band for a set, falling back to DEFAULT
    pub fn band(&self, set: &str) -> Option<&LimitsBand> {
        self.sets
            .get(set)
            .or_else(|| self.sets.get(DEFAULT_LIMITS_SET))
    }

    /// Names of the defined sets
    pub fn sets(&self) -> impl Iterator<Item = &str> + '_ {
        self.sets.keys().map(String::as_str)
    }

    /// Consecutive samples needed before a color change is committed
    pub fn persistence(&self) -> u32 {
        self.persistence
    }

    /// Sets the persistence; zero is treated as one
    pub fn set_persistence(&mut self, persistence: u32) {
        self.persistence = persistence.max(1);
    }

    /// Whether checking starts enabled
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Sets whether checking starts enabled
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

/// Runtime limits status of one item in one packet instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimitsRuntime {
    /// Committed color
    pub state: Option<LimitsState>,
    /// Consecutive samples disagreeing with the committed color
    pub persistence_count: u32,
    /// Whether the item is checked
    pub enabled: bool,
}

impl LimitsRuntime {
    /// Creates the runtime for an item with the given starting enable flag
    pub fn new(enabled: bool) -> Self {
        Self {
            state: None,
            persistence_count: 0,
            enabled,
        }
    }

    /// Feeds one sample's color through the persistence filter.
    ///
    /// Returns the previous color when the committed color changes. Good
    /// colors are committed at once; others wait for `persistence`
    /// consecutive samples. A sample matching the committed color resets
    /// the counter.
    pub fn update(
        &mut self,
        computed: LimitsState,
        persistence: u32,
        ignore_persistence: bool,
    ) -> Option<Option<LimitsState>> {
        if self.state == Some(computed) {
            self.persistence_count = 0;
            return None;
        }
        self.persistence_count += 1;
        if ignore_persistence || computed.is_good() || self.persistence_count >= persistence {
            let previous = self.state.replace(computed);
            self.persistence_count = 0;
            return Some(previous);
        }
        None
    }

    /// Commits a state color immediately
    pub fn set_state_color(&mut self, color: Option<LimitsState>) -> Option<Option<LimitsState>> {
        self.persistence_count = 0;
        if self.state == color {
            return None;
        }
        let previous = std::mem::replace(&mut self.state, color);
        Some(previous)
    }
}

/// A committed limits color change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitsChange {
    /// Target name
    pub target: String,
    /// Packet name
    pub packet: String,
    /// Item name
    pub item: String,
    /// Color before the change
    pub old_state: Option<LimitsState>,
    /// Color after the change
    pub new_state: Option<LimitsState>,
    /// Converted value that caused the change
    pub value: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band() -> LimitsBand {
        LimitsBand::new(0.0, 1.0, 9.0, 10.0).unwrap()
    }

    #[test]
    fn test_band_ordering() {
        let band = band();
        assert_eq!(band.evaluate(-1.0), LimitsState::RedLow);
        assert_eq!(band.evaluate(0.0), LimitsState::RedLow);
        assert_eq!(band.evaluate(0.5), LimitsState::YellowLow);
        assert_eq!(band.evaluate(1.0), LimitsState::YellowLow);
        assert_eq!(band.evaluate(5.0), LimitsState::Green);
        assert_eq!(band.evaluate(9.0), LimitsState::YellowHigh);
        assert_eq!(band.evaluate(10.0), LimitsState::RedHigh);
    }

    #[test]
    fn test_green_subdivision() {
        let band = band().with_green(4.0, 6.0).unwrap();
        assert_eq!(band.evaluate(2.0), LimitsState::GreenLow);
        assert_eq!(band.evaluate(4.0), LimitsState::GreenLow);
        assert_eq!(band.evaluate(5.0), LimitsState::Blue);
        assert_eq!(band.evaluate(6.0), LimitsState::GreenHigh);
        assert_eq!(band.evaluate(8.0), LimitsState::GreenHigh);
    }

    #[test]
    fn test_invalid_band() {
        assert!(LimitsBand::new(2.0, 1.0, 9.0, 10.0).is_err());
        assert!(band().with_green(0.5, 6.0).is_err());
    }

    #[test]
    fn test_persistence_hysteresis() {
        let band = band();
        let mut runtime = LimitsRuntime::new(true);
        assert_eq!(runtime.update(band.evaluate(5.0), 3, false), Some(None));

        assert_eq!(runtime.update(band.evaluate(11.0), 3, false), None);
        assert_eq!(runtime.update(band.evaluate(11.0), 3, false), None);
        assert_eq!(
            runtime.update(band.evaluate(11.0), 3, false),
            Some(Some(LimitsState::Green))
        );
        assert_eq!(runtime.state, Some(LimitsState::RedHigh));

        assert_eq!(
            runtime.update(band.evaluate(5.0), 3, false),
            Some(Some(LimitsState::RedHigh))
        );
        assert_eq!(runtime.persistence_count, 0);
    }

    #[test]
    fn test_matching_sample_resets_counter() {
        let band = band();
        let mut runtime = LimitsRuntime::new(true);
        runtime.update(band.evaluate(5.0), 3, false);
        runtime.update(band.evaluate(11.0), 3, false);
        runtime.update(band.evaluate(11.0), 3, false);
        runtime.update(band.evaluate(5.0), 3, false);
        assert_eq!(runtime.persistence_count, 0);
        assert_eq!(runtime.update(band.evaluate(11.0), 3, false), None);
        assert_eq!(runtime.state, Some(LimitsState::Green));
    }

    #[test]
    fn test_ignore_persistence() {
        let mut runtime = LimitsRuntime::new(true);
        assert_eq!(runtime.update(LimitsState::RedLow, 5, true), Some(None));
    }

    #[test]
    fn test_band_fallback_to_default() {
        let mut limits = Limits::new(band());
        let tvac = LimitsBand::new(-10.0, -5.0, 50.0, 60.0).unwrap();
        limits.set_band("tvac", tvac);
        assert_eq!(limits.band("TVAC"), Some(&tvac));
        assert_eq!(limits.band("OTHER"), Some(&band()));
        assert_eq!(limits.sets().collect::<Vec<_>>(), vec!["DEFAULT", "TVAC"]);
    }
}
