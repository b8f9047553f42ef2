//! Connection-string parsing. Subscription parameters travel as `key=value` pairs separated by
//!  `;`, with `{...}` nesting for structured values (`dataChannel={port=9500}`). A segment
//!  without `=` continues the previous value, so measurement key lists may appear braced or
//!  bare. Keys are case-insensitive.

use std::str::FromStr;

use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: FxHashMap<String, String>,
}

impl Settings {
    pub fn parse(s: &str) -> anyhow::Result<Settings> {
        let mut values = FxHashMap::default();

        let mut depth = 0usize;
        let mut start = 0usize;
        let mut pairs = Vec::new();
        for (i, c) in s.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    if depth == 0 {
                        bail!("unbalanced '}}' in connection string");
                    }
                    depth -= 1;
                }
                ';' if depth == 0 => {
                    pairs.push(&s[start..i]);
                    start = i + c.len_utf8();
                }
                _ => {}
            }
        }
        if depth != 0 {
            bail!("unbalanced '{{' in connection string");
        }
        pairs.push(&s[start..]);

        let mut last_key: Option<String> = None;
        for pair in pairs {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((key, value)) => {
                    let mut value = value.trim();
                    if value.starts_with('{') && value.ends_with('}') {
                        value = &value[1..value.len() - 1];
                    }
                    let key = key.trim().to_ascii_lowercase();
                    values.insert(key.clone(), value.to_string());
                    last_key = Some(key);
                }
                None => {
                    // a segment without '=' continues the previous value, so measurement key
                    //  lists like `inputMeasurementKeys=PPA:1;PPA:2` need no braces
                    let Some(key) = &last_key else {
                        bail!("connection string entry without '=': {:?}", pair);
                    };
                    if let Some(value) = values.get_mut(key) {
                        value.push(';');
                        value.push_str(pair);
                    }
                }
            }
        }

        Ok(Settings { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&key.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => v.eq_ignore_ascii_case("true") || v == "1",
            None => default,
        }
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v.trim().parse()
                .map(Some)
                .map_err(|_| anyhow!("invalid value for {}: {:?}", key, v)),
        }
    }

    /// Nested values parse recursively: `dataChannel={port=9500}` yields a [Settings] with
    ///  `port` in it.
    pub fn get_nested(&self, key: &str) -> anyhow::Result<Option<Settings>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => Settings::parse(v).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_flat() {
        let settings = Settings::parse("trackLatestMeasurements=true; publishInterval=0.5;includeTime=false").unwrap();
        assert_eq!(settings.get("trackLatestMeasurements"), Some("true"));
        assert_eq!(settings.get("TRACKLATESTMEASUREMENTS"), Some("true"));
        assert_eq!(settings.get_parsed::<f64>("publishInterval").unwrap(), Some(0.5));
        assert!(!settings.get_bool("includeTime", true));
        assert_eq!(settings.get("missing"), None);
    }

    #[test]
    fn test_parse_nested() {
        let settings = Settings::parse("inputMeasurementKeys=PPA:1;dataChannel={port=9500; interface=0.0.0.0}").unwrap();
        let data_channel = settings.get_nested("dataChannel").unwrap().unwrap();
        assert_eq!(data_channel.get_parsed::<u16>("port").unwrap(), Some(9500));
        assert_eq!(data_channel.get("interface"), Some("0.0.0.0"));
        assert_eq!(settings.get("inputMeasurementKeys"), Some("PPA:1"));
    }

    #[test]
    fn test_parse_value_list_spanning_semicolons() {
        let settings = Settings::parse("inputMeasurementKeys=PPA:1;PPA:2;PPA:3;lagTime=3.0").unwrap();
        assert_eq!(settings.get("inputMeasurementKeys"), Some("PPA:1;PPA:2;PPA:3"));
        assert_eq!(settings.get_parsed::<f64>("lagTime").unwrap(), Some(3.0));
    }

    #[test]
    fn test_parse_braced_value_list() {
        let settings = Settings::parse("inputMeasurementKeys={PPA:1;PPA:2};lagTime=3.0").unwrap();
        assert_eq!(settings.get("inputMeasurementKeys"), Some("PPA:1;PPA:2"));
        assert_eq!(settings.get_parsed::<f64>("lagTime").unwrap(), Some(3.0));
    }

    #[rstest]
    #[case::unbalanced_open("a={b=1")]
    #[case::unbalanced_close("a=b}1")]
    #[case::no_equals("justakey")]
    fn test_parse_rejects(#[case] s: &str) {
        assert!(Settings::parse(s).is_err());
    }

    #[rstest]
    #[case::true_word("x=true", true)]
    #[case::true_caps("x=True", true)]
    #[case::one("x=1", true)]
    #[case::false_word("x=false", false)]
    #[case::garbage("x=yes", false)]
    fn test_get_bool(#[case] s: &str, #[case] expected: bool) {
        let settings = Settings::parse(s).unwrap();
        assert_eq!(settings.get_bool("x", !expected), expected);
    }

    #[test]
    fn test_get_parsed_invalid() {
        let settings = Settings::parse("port=notanumber").unwrap();
        assert!(settings.get_parsed::<u16>("port").is_err());
    }

    #[test]
    fn test_empty_string() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings.get("anything"), None);
    }
}
