//! Plan duration grammar: a JSON number is nanoseconds, a string is
//! humantime ("30s", "5m"). Serializes back to nanoseconds.

use std::fmt;
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanDuration(pub Duration);

impl PlanDuration {
    pub fn default_timeout() -> Self {
        PlanDuration(Duration::from_secs(60 * 60))
    }

    pub fn default_progress_timeout() -> Self {
        PlanDuration(Duration::from_secs(5 * 60))
    }

    pub fn default_poll_interval() -> Self {
        PlanDuration(Duration::from_secs(5))
    }
}

impl From<Duration> for PlanDuration {
    fn from(d: Duration) -> Self {
        PlanDuration(d)
    }
}

impl Serialize for PlanDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0.as_nanos() as u64)
    }
}

struct PlanDurationVisitor;

impl<'de> Visitor<'de> for PlanDurationVisitor {
    type Value = PlanDuration;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a duration as nanoseconds or a humantime string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(PlanDuration(Duration::from_nanos(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        if v < 0 {
            return Err(E::custom("duration must not be negative"));
        }
        Ok(PlanDuration(Duration::from_nanos(v as u64)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        if v < 0.0 {
            return Err(E::custom("duration must not be negative"));
        }
        Ok(PlanDuration(Duration::from_nanos(v as u64)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        humantime::parse_duration(v)
            .map(PlanDuration)
            .map_err(|e| E::custom(format!("invalid duration {:?}: {}", v, e)))
    }
}

impl<'de> Deserialize<'de> for PlanDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(PlanDurationVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_humantime_strings() {
        let d: PlanDuration = serde_json::from_str("\"30s\"").unwrap();
        assert_eq!(d.0, Duration::from_secs(30));
        let d: PlanDuration = serde_json::from_str("\"5m\"").unwrap();
        assert_eq!(d.0, Duration::from_secs(300));
    }

    #[test]
    fn parses_nanosecond_numbers() {
        let d: PlanDuration = serde_json::from_str("1000000000").unwrap();
        assert_eq!(d.0, Duration::from_secs(1));
    }

    #[test]
    fn serializes_as_nanoseconds() {
        let s = serde_json::to_string(&PlanDuration(Duration::from_secs(2))).unwrap();
        assert_eq!(s, "2000000000");
    }

    #[test]
    fn rejects_garbage() {
        assert!(serde_json::from_str::<PlanDuration>("\"soon\"").is_err());
        assert!(serde_json::from_str::<PlanDuration>("-5").is_err());
    }
}
