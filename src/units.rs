//! Physical units for unit-tagged result columns.
//!
//! Units are treated as mostly opaque: a unit symbol is split into an optional
//! SI prefix and a base symbol. Two units are compatible when their base symbols
//! match, in which case a value converts by the ratio of their prefix scales.
//! Unknown symbols are kept verbatim and are only compatible with themselves.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Base symbols that accept SI prefixes.
const BASE_SYMBOLS: &[&str] = &[
    "V", "A", "W", "Hz", "s", "m", "g", "K", "Ohm", "F", "H", "T", "J", "C", "Pa", "rad",
];

/// SI prefixes, longest first so "da" wins over "d".
const PREFIXES: &[(&str, f64)] = &[
    ("da", 1e1),
    ("T", 1e12),
    ("G", 1e9),
    ("M", 1e6),
    ("k", 1e3),
    ("h", 1e2),
    ("d", 1e-1),
    ("c", 1e-2),
    ("m", 1e-3),
    ("u", 1e-6),
    ("µ", 1e-6),
    ("n", 1e-9),
    ("p", 1e-12),
    ("f", 1e-15),
];

/// A unit symbol resolved to `scale * base`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Unit {
    symbol: String,
    base: String,
    scale: f64,
}

impl Unit {
    /// Resolve a unit symbol such as `"mV"` or `"kHz"`.
    pub fn parse(symbol: &str) -> Self {
        let symbol = symbol.trim();
        if let Some(base) = BASE_SYMBOLS.iter().find(|b| **b == symbol) {
            return Self::with_base(symbol, base, 1.0);
        }
        for (prefix, scale) in PREFIXES {
            if let Some(rest) = symbol.strip_prefix(prefix) {
                if let Some(base) = BASE_SYMBOLS.iter().find(|b| **b == rest) {
                    return Self::with_base(symbol, base, *scale);
                }
            }
        }
        Self::with_base(symbol, symbol, 1.0)
    }

    fn with_base(symbol: &str, base: &str, scale: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            base: base.to_string(),
            scale,
        }
    }

    /// The symbol as written, e.g. `"mV"`.
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// The prefix-free base symbol, e.g. `"V"`.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Whether values in `other` can be expressed in `self`.
    pub fn is_compatible(&self, other: &Unit) -> bool {
        self.base == other.base
    }

    /// Convert `value` given in `from` into this unit.
    pub fn convert_from(&self, value: f64, from: &Unit) -> Option<f64> {
        self.is_compatible(from)
            .then(|| value * from.scale / self.scale)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol)
    }
}

impl From<String> for Unit {
    fn from(symbol: String) -> Self {
        Unit::parse(&symbol)
    }
}

impl From<&str> for Unit {
    fn from(symbol: &str) -> Self {
        Unit::parse(symbol)
    }
}

impl From<Unit> for String {
    fn from(unit: Unit) -> Self {
        unit.symbol
    }
}

/// A magnitude tagged with a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    /// Magnitude in `unit`.
    pub value: f64,
    /// Unit of `value`.
    pub unit: Unit,
}

impl Quantity {
    /// Create a quantity from a magnitude and a unit symbol.
    pub fn new(value: f64, unit: impl Into<Unit>) -> Self {
        Self {
            value,
            unit: unit.into(),
        }
    }

    /// Parse `"<number> <unit>"` (the space is optional, e.g. `"12.5mV"`).
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let split = text
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E')))
            .map(|(i, _)| i)?;
        let (number, unit) = text.split_at(split);
        let value = number.trim().parse::<f64>().ok()?;
        let unit = unit.trim();
        if unit.is_empty() {
            return None;
        }
        Some(Self::new(value, unit))
    }

    /// Express this quantity in `target`, if the units are compatible.
    pub fn to_unit(&self, target: &Unit) -> Option<f64> {
        target.convert_from(self.value, &self.unit)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_units_share_base() {
        let mv = Unit::parse("mV");
        assert_eq!(mv.base(), "V");
        assert!(mv.is_compatible(&Unit::parse("kV")));
        assert!(!mv.is_compatible(&Unit::parse("A")));
    }

    #[test]
    fn bare_metre_is_not_a_prefix() {
        let m = Unit::parse("m");
        assert_eq!(m.base(), "m");
        let ms = Unit::parse("ms");
        assert_eq!(ms.base(), "s");
    }

    #[test]
    fn converts_between_prefixes() {
        let volts = Unit::parse("V");
        let value = Quantity::new(500.0, "mV").to_unit(&volts);
        assert!((value.unwrap_or(f64::NAN) - 0.5).abs() < 1e-12);

        let khz = Unit::parse("kHz");
        let value = Quantity::new(2500.0, "Hz").to_unit(&khz);
        assert!((value.unwrap_or(f64::NAN) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn incompatible_units_do_not_convert() {
        assert_eq!(Quantity::new(3.0, "A").to_unit(&Unit::parse("V")), None);
    }

    #[test]
    fn unknown_symbols_only_match_themselves() {
        let counts = Unit::parse("counts");
        assert!(counts.is_compatible(&Unit::parse("counts")));
        assert!(!counts.is_compatible(&Unit::parse("V")));
    }

    #[test]
    fn parses_quantity_text() {
        assert_eq!(Quantity::parse("12.5 mV"), Some(Quantity::new(12.5, "mV")));
        assert_eq!(Quantity::parse("-3e2Hz"), Some(Quantity::new(-300.0, "Hz")));
        assert_eq!(Quantity::parse("12.5"), None);
        assert_eq!(Quantity::parse("volts"), None);
    }
}
