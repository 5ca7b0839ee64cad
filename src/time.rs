use std::time::Duration;

/// Parse human-friendly durations such as `12h`, `45days` or `1h 30min`. Used as a clap
/// value parser.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    cyborgtime::parse_duration(s).map_err(|e| format!("Invalid duration: {e}"))
}

/// Render a duration for log lines, e.g. `1 month, 3 days, 2 hours`. The sign is ignored.
pub fn humanize_duration(duration: time::Duration) -> String {
    // Months and years are approximated as 30.44 and 365.25 days
    const UNITS: [(&str, i64); 6] = [
        ("year", 31_557_600),
        ("month", 2_630_016),
        ("day", 86400),
        ("hour", 3600),
        ("minute", 60),
        ("second", 1),
    ];

    let mut remaining = duration.abs().whole_seconds();
    let mut components = Vec::new();
    for (unit, seconds) in UNITS {
        let count = remaining / seconds;
        remaining %= seconds;
        if count > 0 || (unit == "second" && components.is_empty()) {
            let plural = if count == 1 { "" } else { "s" };
            components.push(format!("{count} {unit}{plural}"));
        }
    }
    components.join(", ")
}

/// Serde adapter for [`Duration`] fields written as human-friendly strings (`12h`, `45d`).
/// Plain integers are read as seconds.
pub mod serde_duration {
    use serde::de::{Error, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a duration such as \"12h\" or a number of seconds")
        }

        fn visit_str<E: Error>(self, v: &str) -> Result<Self::Value, E> {
            super::parse_duration(v).map_err(E::custom)
        }

        fn visit_u64<E: Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: Error>(self, v: i64) -> Result<Self::Value, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must not be negative"))
        }
    }
}
