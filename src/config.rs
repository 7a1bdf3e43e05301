//! serde-based configuration loading: the `defaults` + `fields` JSON/YAML file shape, and the
//! small hand-rolled duration parser shared with the splitter's URL query directives.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::byte_order::ByteOrder;
use crate::constants::MAX_DURATION_HOURS;
use crate::error::{ModbusError, Result};
use crate::field::{Field, FieldType, Protocol};

/// Parse a duration string (`"1s"`, `"500ms"`, `"2h"`, plain integer seconds) into a
/// `Duration`, rejecting negative values and anything beyond the conservative 8640-hour guard
/// (see design note: a defence against misparsed nanosecond integers read as huge durations).
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ModbusError::InvalidDuration("empty duration string".into()));
    }
    if let Some(rest) = s.strip_prefix('-') {
        // Still validate the rest so the error message names the real unit, then reject.
        let _ = parse_duration(rest);
        return Err(ModbusError::InvalidDuration(format!("negative duration not allowed: {s}")));
    }

    let split_at = s.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(s.len());
    let (number_part, unit_part) = s.split_at(split_at);
    let number: f64 = number_part
        .parse()
        .map_err(|_| ModbusError::InvalidDuration(format!("invalid numeric value in duration: {s}")))?;

    let seconds = match unit_part {
        "" | "s" => number,
        "ms" => number / 1_000.0,
        "us" | "µs" => number / 1_000_000.0,
        "ns" => number / 1_000_000_000.0,
        "m" => number * 60.0,
        "h" => number * 3_600.0,
        other => return Err(ModbusError::InvalidDuration(format!("unknown duration unit {other:?} in {s}"))),
    };

    if seconds < 0.0 {
        return Err(ModbusError::InvalidDuration(format!("negative duration not allowed: {s}")));
    }
    let hours = seconds / 3_600.0;
    if hours > MAX_DURATION_HOURS as f64 {
        return Err(ModbusError::InvalidDuration(format!(
            "duration {s} exceeds the {MAX_DURATION_HOURS}-hour guard"
        )));
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// Defaults inherited by every field entry that does not override them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "snake_case")]
pub struct FieldDefaults {
    pub server_url: Option<String>,
    pub unit_id: Option<u8>,
    pub function_code: Option<u8>,
    pub protocol: Option<String>,
    pub request_interval: Option<String>,
    pub byte_order: Option<String>,
}

/// One field entry as it appears in the configuration file. Mirrors the Field Model
/// attributes; unset values fall back to `FieldDefaults`, then to hard-coded defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub address: u16,
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub unit_id: Option<u8>,
    #[serde(default)]
    pub function_code: Option<u8>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub request_interval: Option<String>,
    #[serde(default)]
    pub bit: Option<u8>,
    #[serde(default)]
    pub from_high_byte: bool,
    #[serde(default)]
    pub length: Option<usize>,
    #[serde(default)]
    pub byte_order: Option<String>,
    /// Hex string, even length, e.g. `"ffff"`.
    #[serde(default)]
    pub invalid: Option<String>,
    /// Recognised by the consumer (e.g. an example poller binary), not by the core; carried
    /// verbatim so downstream code can read it without the core needing to know its meaning.
    #[serde(default)]
    pub scale: Option<serde_json::Value>,
}

/// Top-level configuration file shape: `defaults` + `fields`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "snake_case")]
pub struct PollingConfig {
    pub defaults: FieldDefaults,
    pub fields: Vec<FieldConfig>,
}

impl PollingConfig {
    /// Load from a JSON or YAML file, detected by extension (`.yaml`/`.yml` vs anything else).
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ModbusError::Io(e.to_string()))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml {
            serde_yaml::from_str(&contents).map_err(|e| ModbusError::Validation(format!("yaml parse error: {e}")))
        } else {
            serde_json::from_str(&contents).map_err(|e| ModbusError::Validation(format!("json parse error: {e}")))
        }
    }

    /// Resolve every entry in `fields` against `defaults` into runtime `Field` values.
    pub fn resolve_fields(&self) -> Result<Vec<Field>> {
        self.fields.iter().map(|f| self.resolve_one(f)).collect()
    }

    fn resolve_one(&self, f: &FieldConfig) -> Result<Field> {
        let server_url = f
            .server_url
            .clone()
            .or_else(|| self.defaults.server_url.clone())
            .ok_or_else(|| ModbusError::Validation(format!("field {} has no server_url", f.name)))?;
        let unit_id = f.unit_id.or(self.defaults.unit_id).unwrap_or(1);
        let function_code = f.function_code.or(self.defaults.function_code).unwrap_or(0);
        let protocol_str = f.protocol.as_deref().or(self.defaults.protocol.as_deref()).unwrap_or("any");
        let protocol = Protocol::from_str(protocol_str)?;
        let interval_str = f
            .request_interval
            .as_deref()
            .or(self.defaults.request_interval.as_deref())
            .unwrap_or("1s");
        let request_interval = parse_duration(interval_str)?;
        let byte_order_str = f.byte_order.as_deref().or(self.defaults.byte_order.as_deref());
        let byte_order = match byte_order_str {
            Some(s) => ByteOrder::from_str(s).ok_or_else(|| ModbusError::Validation(format!("unknown byte order {s:?}")))?,
            None => ByteOrder::default(),
        };
        let field_type = FieldType::from_str(&f.field_type)?;
        let invalid = match &f.invalid {
            Some(hex_str) => Some(hex::decode(hex_str).map_err(|e| ModbusError::Validation(format!("invalid hex in `invalid`: {e}")))?),
            None => None,
        };

        let field = Field {
            name: f.name.clone(),
            server_url,
            unit_id,
            function_code,
            protocol,
            request_interval,
            address: f.address,
            field_type,
            bit: f.bit,
            from_high_byte: f.from_high_byte,
            length: f.length,
            byte_order,
            invalid,
        };
        field.validate()?;
        Ok(field)
    }
}

/// Opaque passthrough map of `name -> scale`, extracted from a loaded config for a consumer
/// that wants to apply scaling after decode without the core needing to understand it.
pub fn scale_factors(config: &PollingConfig) -> HashMap<String, serde_json::Value> {
    config
        .fields
        .iter()
        .filter_map(|f| f.scale.clone().map(|s| (f.name.clone(), s)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_handles_common_suffixes() {
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7_200));
        assert_eq!(parse_duration("1500").unwrap(), Duration::from_secs(1500));
    }

    #[test]
    fn parse_duration_rejects_negative() {
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn parse_duration_rejects_beyond_guard() {
        assert!(parse_duration("10000h").is_err());
        assert!(parse_duration("8640h").is_ok());
    }

    #[test]
    fn resolve_fields_applies_defaults() {
        let json = r#"{
            "defaults": {"server_url": "tcp://127.0.0.1:502", "unit_id": 1},
            "fields": [
                {"name": "temp", "type": "uint16", "address": 10},
                {"name": "raw", "type": "raw-bytes", "address": 20, "length": 4, "invalid": "ffffffff"}
            ]
        }"#;
        let config: PollingConfig = serde_json::from_str(json).unwrap();
        let fields = config.resolve_fields().unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].server_url, "tcp://127.0.0.1:502");
        assert_eq!(fields[1].invalid, Some(vec![0xFF, 0xFF, 0xFF, 0xFF]));
    }

    #[test]
    fn resolve_fields_rejects_missing_server_url() {
        let json = r#"{"fields": [{"name": "a", "type": "uint16", "address": 1}]}"#;
        let config: PollingConfig = serde_json::from_str(json).unwrap();
        assert!(config.resolve_fields().is_err());
    }
}
