//! Run configuration.
//!
//! A [`Configuration`] is a two-level mapping, section name to key to string
//! value, with typed getters doing the conversion on access. The text form is
//! TOML: top-level scalar keys land in the unnamed section `""`, every table
//! holding scalars becomes a section named by its dotted path.
//!
//! ```toml
//! Name = "beam test"
//!
//! [Producer.tlu]
//! TriggerInterval = "0x20"
//!
//! [DataCollector.dc]
//! FilePattern = "run$6R$X"
//! ```
//!
//! Nodes get a *view* of the configuration with their own section
//! (`<Kind>.<name>`) selected as current. Lookups fall back to the unnamed
//! section when a key is missing from the current one.
//!
//! [`Configuration`]: struct.Configuration.html

use std::convert::TryFrom;
use std::fmt;
use std::fmt::Write;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use linked_hash_map::LinkedHashMap;
use toml::Value;

use crate::error::{Error, Result};

type Section = LinkedHashMap<String, String>;

/// Key under the unnamed section holding the configuration name.
pub const NAME_KEY: &str = "Name";

#[derive(Clone, Debug, PartialEq)]
pub struct Configuration {
    sections: LinkedHashMap<String, Section>,
    current: String,
}

impl Default for Configuration {
    fn default() -> Self {
        let mut sections = LinkedHashMap::new();
        sections.insert(String::new(), Section::new());
        Self {
            sections,
            current: String::new(),
        }
    }
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let text = fs::read_to_string(path.as_ref()).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path_str.clone()),
            _ => Error::ReadFailure(format!("{}: {}", path_str, e)),
        })?;
        text.parse()
    }

    /// Returns a copy of this configuration with `section` selected as
    /// current.
    pub fn for_section(&self, section: &str) -> Self {
        if !self.has_section(section) {
            debug!("configuration has no section {}, using defaults", section);
        }
        Self {
            sections: self.sections.clone(),
            current: section.to_string(),
        }
    }

    pub fn current_section(&self) -> &str {
        &self.current
    }

    /// Selects `section` as current, returning whether it exists.
    pub fn set_section(&mut self, section: &str) -> bool {
        self.current = section.to_string();
        self.has_section(section)
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// Lists named sections, in the order they were defined.
    pub fn sections(&self) -> Vec<&str> {
        self.sections
            .keys()
            .filter(|s| !s.is_empty())
            .map(|s| s.as_str())
            .collect()
    }

    /// Lists keys of the current section.
    pub fn keys(&self) -> Vec<&str> {
        match self.sections.get(&self.current) {
            Some(section) => section.keys().map(|k| k.as_str()).collect(),
            None => Vec::new(),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.get_raw(key).is_some()
    }

    /// Looks up a key in the current section, falling back to the unnamed
    /// section.
    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.sections
            .get(&self.current)
            .and_then(|s| s.get(key))
            .or_else(|| self.sections.get("").and_then(|s| s.get(key)))
            .map(|v| v.as_str())
    }

    /// Gets the value parsed as `T`, or `default` if it's missing or fails
    /// to parse.
    pub fn get<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.get_raw(key) {
            Some(raw) => match raw.trim().parse() {
                Ok(v) => v,
                Err(_) => {
                    warn!("config key {} has unparsable value: {}", key, raw);
                    default
                }
            },
            None => default,
        }
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.get_raw(key).unwrap_or(default).to_string()
    }

    /// Gets a signed integer, accepting `0x` and `0b` prefixes.
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.get_raw(key) {
            Some(raw) => parse_int(raw).unwrap_or_else(|e| {
                warn!("config key {}: {}", key, e);
                default
            }),
            None => default,
        }
    }

    /// Gets an unsigned integer, accepting `0x` and `0b` prefixes.
    pub fn get_uint(&self, key: &str, default: u64) -> u64 {
        match self.get_raw(key) {
            Some(raw) => parse_uint(raw).unwrap_or_else(|e| {
                warn!("config key {}: {}", key, e);
                default
            }),
            None => default,
        }
    }

    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        self.get(key, default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_raw(key).map(|v| v.trim().to_lowercase()) {
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    warn!("config key {} has unparsable value: {}", key, v);
                    default
                }
            },
            None => default,
        }
    }

    /// Sets a value in the current section, creating the section if needed.
    pub fn set<V: ToString>(&mut self, key: &str, value: V) {
        let current = self.current.clone();
        self.sections
            .entry(current)
            .or_insert_with(Section::new)
            .insert(key.to_string(), value.to_string());
    }

    /// Name of the configuration, taken from the unnamed section.
    pub fn name(&self) -> String {
        self.sections
            .get("")
            .and_then(|s| s.get(NAME_KEY))
            .cloned()
            .unwrap_or_default()
    }
}

impl FromStr for Configuration {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let root: Value = toml::from_str(s)?;
        let table = match root {
            Value::Table(table) => table,
            _ => return Err(Error::ConfigError("expected a table at top level".to_string())),
        };
        let mut config = Configuration::new();
        flatten("", &table, &mut config.sections);
        Ok(config)
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(root) = self.sections.get("") {
            for (key, value) in root {
                writeln!(f, "{} = {}", quote_key(key), quote_str(value))?;
            }
        }
        for (name, section) in &self.sections {
            if name.is_empty() {
                continue;
            }
            let header = name.split('.').map(quote_key).collect::<Vec<_>>().join(".");
            writeln!(f, "\n[{}]", header)?;
            for (key, value) in section {
                writeln!(f, "{} = {}", quote_key(key), quote_str(value))?;
            }
        }
        Ok(())
    }
}

fn flatten(prefix: &str, table: &toml::value::Table, sections: &mut LinkedHashMap<String, Section>) {
    for (key, value) in table {
        match value {
            Value::Table(sub) => {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                if sub.is_empty() || sub.values().any(|v| !v.is_table()) {
                    sections.entry(name.clone()).or_insert_with(Section::new);
                }
                flatten(&name, sub, sections);
            }
            other => {
                sections
                    .entry(prefix.to_string())
                    .or_insert_with(Section::new)
                    .insert(key.clone(), stringify(other));
            }
        }
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Datetime(d) => d.to_string(),
        Value::Array(items) => items.iter().map(stringify).collect::<Vec<_>>().join(","),
        Value::Table(_) => value.to_string(),
    }
}

fn quote_key(key: &str) -> String {
    if !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        key.to_string()
    } else {
        quote_str(key)
    }
}

fn quote_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Parses a signed integer with an optional `0x`/`0b` radix prefix.
pub fn parse_int(s: &str) -> Result<i64> {
    let s = s.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let magnitude = i128::from(parse_uint(digits)?);
    let value = if negative { -magnitude } else { magnitude };
    i64::try_from(value)
        .map_err(|_| Error::ConfigError(format!("{} is out of range for a signed integer", s)))
}

/// Parses an unsigned integer with an optional `0x`/`0b` radix prefix.
pub fn parse_uint(s: &str) -> Result<u64> {
    let s = s.trim();
    let lower = s.to_lowercase();
    let value = if let Some(hex) = lower.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)?
    } else if let Some(bin) = lower.strip_prefix("0b") {
        u64::from_str_radix(bin, 2)?
    } else {
        s.parse::<u64>()?
    };
    Ok(value)
}

#[cfg(test)]
const SAMPLE: &str = r#"
Name = "beam test"
Period = 25

[Producer.p1]
Threshold = "0x1F"
Enabled = "yes"
Ratio = 0.5
Channels = [1, 2, 3]

[DataCollector.dc]
FilePattern = "run$6R$X"
"#;

#[test]
fn parse_sections() {
    let config: Configuration = SAMPLE.parse().unwrap();
    assert_eq!(config.sections(), vec!["Producer.p1", "DataCollector.dc"]);
    assert_eq!(config.name(), "beam test");
    assert_eq!(config.get_int("Period", 0), 25);

    let view = config.for_section("Producer.p1");
    assert_eq!(view.get_uint("Threshold", 0), 31);
    assert!(view.get_bool("Enabled", false));
    assert_eq!(view.get_float("Ratio", 0.), 0.5);
    assert_eq!(view.get_str("Channels", ""), "1,2,3");
    // falls back to the unnamed section
    assert_eq!(view.get_int("Period", 0), 25);
    assert_eq!(view.get_str("FilePattern", "none"), "none");
    assert_eq!(view.keys(), vec!["Threshold", "Enabled", "Ratio", "Channels"]);
}

#[test]
fn typed_getters_use_defaults() {
    let mut config = Configuration::new();
    config.set("Bad", "twelve");
    assert_eq!(config.get_int("Bad", 7), 7);
    assert_eq!(config.get::<u32>("Missing", 3), 3);
    assert!(!config.has("Missing"));
    assert_eq!(parse_int("-0x10").unwrap(), -16);
    assert_eq!(parse_uint("0b101").unwrap(), 5);
    assert!(parse_uint("0xZZ").is_err());
}

#[test]
fn signed_integers_at_the_edges() {
    assert_eq!(parse_int("-9223372036854775808").unwrap(), i64::MIN);
    assert_eq!(parse_int("9223372036854775807").unwrap(), i64::MAX);
    assert_eq!(parse_int("-0x8000000000000000").unwrap(), i64::MIN);
    assert!(parse_int("9223372036854775808").is_err());
    assert!(parse_int("0xFFFFFFFFFFFFFFFF").is_err());
    assert!(parse_int("-9223372036854775809").is_err());

    let mut config = Configuration::new();
    config.set("Wide", "0xFFFFFFFFFFFFFFFF");
    config.set("Lowest", "-9223372036854775808");
    assert_eq!(config.get_int("Wide", 7), 7);
    assert_eq!(config.get_int("Lowest", 0), i64::MIN);
}

#[test]
fn text_form_round_trips() {
    let mut config: Configuration = SAMPLE.parse().unwrap();
    config.set_section("Monitor.quoted section");
    config.set("Note", "a \"quoted\" value\nwith newline");
    let text = config.to_string();
    let mut parsed: Configuration = text.parse().unwrap();
    parsed.set_section("Monitor.quoted section");
    assert_eq!(parsed, config);
}
