//! YAML parsing using yaml-rust2
//!
//! The live controller configuration arrives as a YAML document inside a
//! ConfigMap. It is parsed here into a `serde_json::Value` tree so callers
//! can either walk it untyped or deserialize it into typed structs with
//! serde. Only the first document of a multi-document input is used; the
//! config ConfigMap carries exactly one.

use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use crate::{Error, Result};

/// Parse a YAML string into a `serde_json::Value`.
///
/// Returns `Value::Null` for empty input.
pub fn parse_yaml(input: &str) -> Result<Value> {
    let docs = YamlLoader::load_from_str(input)
        .map_err(|e| Error::serialization_in("yaml", e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => yaml_to_json(doc),
        None => Ok(Value::Null),
    }
}

/// Parse a YAML string directly into a typed value.
pub fn from_yaml<T: DeserializeOwned>(input: &str) -> Result<T> {
    let value = parse_yaml(input)?;
    serde_json::from_value(value).map_err(|e| Error::serialization_in("yaml", e.to_string()))
}

/// Convert a yaml_rust2::Yaml value to serde_json::Value
fn yaml_to_json(yaml: Yaml) -> Result<Value> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| Error::serialization_in("yaml", e.to_string()))?;
            Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Real(r) => r,
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    _ => {
                        return Err(Error::serialization_in("yaml", "unsupported YAML key type"))
                    }
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(Error::serialization_in("yaml", "YAML aliases not supported")),
        Yaml::BadValue => Err(Error::serialization_in("yaml", "bad YAML value")),
    }
}
