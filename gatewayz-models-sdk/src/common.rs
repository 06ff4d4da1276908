//! Shared helpers used by both workspace crates.

/// Serde adapter for [`std::time::Duration`] fields in configuration.
///
/// Serializes as `"{secs}s"`; accepts `"500ms"`, `"30s"`, `"5m"`, `"1h"`,
/// or a bare number of seconds.
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
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
        use serde::de::Error;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse_duration_string(&s).map_err(Error::custom),
        }
    }

    fn parse_duration_string(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration string".to_string());
        }
        if let Some(stripped) = s.strip_suffix("ms") {
            let num: u64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            return Ok(Duration::from_millis(num));
        }
        if let Some(stripped) = s.strip_suffix('s') {
            let num: f64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            let secs = num.trunc() as u64;
            let nanos = (num.fract() * 1_000_000_000.0).round() as u32;
            return Ok(Duration::new(secs, nanos));
        }
        if let Some(stripped) = s.strip_suffix('m') {
            let num: u64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            return Ok(Duration::from_secs(num * 60));
        }
        if let Some(stripped) = s.strip_suffix('h') {
            let num: u64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            return Ok(Duration::from_secs(num * 3600));
        }
        s.parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| format!("invalid duration: {s}"))
    }

    #[cfg(test)]
    mod tests {
        use super::parse_duration_string;
        use std::time::Duration;

        #[test]
        fn test_parse_suffixes() {
            assert_eq!(parse_duration_string("500ms"), Ok(Duration::from_millis(500)));
            assert_eq!(parse_duration_string("30s"), Ok(Duration::from_secs(30)));
            assert_eq!(parse_duration_string("5m"), Ok(Duration::from_secs(300)));
            assert_eq!(parse_duration_string("1h"), Ok(Duration::from_secs(3600)));
            assert_eq!(parse_duration_string("45"), Ok(Duration::from_secs(45)));
            assert!(parse_duration_string("").is_err());
        }
    }
}
