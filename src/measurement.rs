use std::fmt::{Debug, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use uuid::Uuid;

/// Timestamps are 'ticks': 100ns intervals since 0001-01-01 00:00:00 UTC, matching the
///  resolution used on the wire.
pub type Ticks = i64;

pub const TICKS_PER_MILLISECOND: i64 = 10_000;
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Ticks between 0001-01-01 and the Unix epoch.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

pub fn now_ticks() -> Ticks {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => UNIX_EPOCH_TICKS + (d.as_nanos() / 100) as i64,
        Err(_) => UNIX_EPOCH_TICKS,
    }
}

/// The textual source plus numeric id that a measurement stream is addressed by at its origin,
///  e.g. `PPA:12`. This is the human-facing half of a signal's identity; the [Uuid] signal id
///  is the globally unique half.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MeasurementKey {
    pub source: String,
    pub id: u32,
}

impl MeasurementKey {
    pub fn new(source: impl Into<String>, id: u32) -> MeasurementKey {
        MeasurementKey { source: source.into(), id }
    }

    /// Parses the `SOURCE:ID` notation used in `inputMeasurementKeys` filter expressions.
    pub fn parse(s: &str) -> Option<MeasurementKey> {
        let (source, id) = s.split_once(':')?;
        let id = id.trim().parse().ok()?;
        let source = source.trim();
        if source.is_empty() {
            return None;
        }
        Some(MeasurementKey { source: source.to_string(), id })
    }
}

impl Debug for MeasurementKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source, self.id)
    }
}

bitflags! {
    /// Quality / provenance flags carried with each measurement. Only the bits that survive
    ///  the compact encoding are modelled.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
    pub struct MeasurementFlags: u32 {
        const BAD_DATA         = 0x01;
        const SUSPECT_DATA     = 0x02;
        const BAD_TIME         = 0x04;
        const SYSTEM_ISSUE     = 0x08;
        const CALCULATED_VALUE = 0x10;
        const DISCARDED_VALUE  = 0x20;
    }
}

/// One sampled value of one signal. Immutable once constructed; the measurement source produces
///  these continuously and the subscriptions consume them.
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    pub signal_id: Uuid,
    pub key: MeasurementKey,
    pub value: f64,
    pub timestamp: Ticks,
    pub flags: MeasurementFlags,
    pub adder: f64,
    pub multiplier: f64,
}

impl Measurement {
    pub fn new(signal_id: Uuid, key: MeasurementKey, value: f64, timestamp: Ticks) -> Measurement {
        Measurement {
            signal_id,
            key,
            value,
            timestamp,
            flags: MeasurementFlags::empty(),
            adder: 0.0,
            multiplier: 1.0,
        }
    }

    /// The value after linear scaling, which is what goes on the wire.
    pub fn adjusted_value(&self) -> f64 {
        self.value * self.multiplier + self.adder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::simple("PPA:12", Some(("PPA", 12)))]
    #[case::spaces(" PPA : 7 ", Some(("PPA", 7)))]
    #[case::no_colon("PPA12", None)]
    #[case::no_id("PPA:", None)]
    #[case::bad_id("PPA:x", None)]
    #[case::empty_source(":4", None)]
    fn test_key_parse(#[case] s: &str, #[case] expected: Option<(&str, u32)>) {
        let actual = MeasurementKey::parse(s);
        assert_eq!(actual, expected.map(|(source, id)| MeasurementKey::new(source, id)));
    }

    #[rstest]
    #[case::identity(5.0, 0.0, 1.0, 5.0)]
    #[case::scaled(5.0, 1.5, 2.0, 11.5)]
    #[case::inverted(4.0, 0.0, -1.0, -4.0)]
    fn test_adjusted_value(#[case] value: f64, #[case] adder: f64, #[case] multiplier: f64, #[case] expected: f64) {
        let mut m = Measurement::new(Uuid::new_v4(), MeasurementKey::new("PPA", 1), value, 0);
        m.adder = adder;
        m.multiplier = multiplier;
        assert_eq!(m.adjusted_value(), expected);
    }

    #[test]
    fn test_now_ticks_after_epoch() {
        assert!(now_ticks() > UNIX_EPOCH_TICKS);
    }
}
