//! Multi-format configuration loading
//!
//! JSON, YAML and XML documents all normalize into `serde_json::Value`
//! before deserialization. XML element attributes become `@`-prefixed keys
//! and repeated elements collapse into arrays; YAML and XML scalars arrive
//! type-inferred (bool / integer / float / string).
//!
//! An object of the form `{"$ref": "path"}` is replaced by the parsed
//! contents of `path`, resolved relative to the referring file and applied
//! recursively with cycle detection.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde_json::{Map, Value};

/// Supported configuration formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Xml,
}

impl ConfigFormat {
    /// Pick a format from a file extension.
    pub fn from_path(path: &Path) -> anyhow::Result<ConfigFormat> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "json" => Ok(ConfigFormat::Json),
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "xml" => Ok(ConfigFormat::Xml),
            other => bail!("unsupported config format: .{other}"),
        }
    }
}

/// Load a configuration file and resolve its `$ref` inclusions.
pub fn load_file(path: &Path) -> anyhow::Result<Value> {
    let mut visiting = Vec::new();
    load_file_inner(path, &mut visiting)
}

fn load_file_inner(path: &Path, visiting: &mut Vec<PathBuf>) -> anyhow::Result<Value> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("config file not found: {}", path.display()))?;
    if visiting.contains(&canonical) {
        bail!("$ref cycle detected at {}", path.display());
    }
    visiting.push(canonical);

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let format = ConfigFormat::from_path(path)?;
    let value = parse_str(&content, format)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let resolved = resolve_refs(value, base_dir, visiting)?;

    visiting.pop();
    Ok(resolved)
}

/// Parse a document in the given format into the common value model.
pub fn parse_str(content: &str, format: ConfigFormat) -> anyhow::Result<Value> {
    match format {
        ConfigFormat::Json => Ok(serde_json::from_str(content)?),
        ConfigFormat::Yaml => {
            let yaml: serde_yaml::Value = serde_yaml::from_str(content)?;
            yaml_to_json(yaml)
        }
        ConfigFormat::Xml => xml_to_json(content),
    }
}

fn resolve_refs(
    value: Value,
    base_dir: &Path,
    visiting: &mut Vec<PathBuf>,
) -> anyhow::Result<Value> {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(target)) = map.get("$ref") {
                    let target_path = if Path::new(target).is_absolute() {
                        PathBuf::from(target)
                    } else {
                        base_dir.join(target)
                    };
                    return load_file_inner(&target_path, visiting);
                }
            }
            let mut resolved = Map::with_capacity(map.len());
            for (key, entry) in map {
                resolved.insert(key, resolve_refs(entry, base_dir, visiting)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .into_iter()
                .map(|item| resolve_refs(item, base_dir, visiting))
                .collect::<anyhow::Result<_>>()?,
        )),
        scalar => Ok(scalar),
    }
}

// ----- YAML -----

fn yaml_to_json(value: serde_yaml::Value) -> anyhow::Result<Value> {
    Ok(match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else if let Some(f) = n.as_f64() {
                Value::from(f)
            } else {
                bail!("unrepresentable YAML number: {n:?}")
            }
        }
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(items) => Value::Array(
            items
                .into_iter()
                .map(yaml_to_json)
                .collect::<anyhow::Result<_>>()?,
        ),
        serde_yaml::Value::Mapping(mapping) => {
            let mut map = Map::new();
            for (key, entry) in mapping {
                let key = match key {
                    serde_yaml::Value::String(s) => s,
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    other => bail!("unsupported YAML mapping key: {other:?}"),
                };
                map.insert(key, yaml_to_json(entry)?);
            }
            Value::Object(map)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value)?,
    })
}

// ----- XML -----

fn xml_to_json(content: &str) -> anyhow::Result<Value> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    // Stack frame per open element: (name, child map, accumulated text).
    let mut stack: Vec<(String, Map<String, Value>, String)> =
        vec![(String::new(), Map::new(), String::new())];

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let mut map = Map::new();
                for attr in start.attributes() {
                    let attr = attr?;
                    let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
                    let value = attr.unescape_value()?.into_owned();
                    map.insert(key, infer_scalar(&value));
                }
                stack.push((name, map, String::new()));
            }
            Event::Empty(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let mut map = Map::new();
                for attr in start.attributes() {
                    let attr = attr?;
                    let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
                    let value = attr.unescape_value()?.into_owned();
                    map.insert(key, infer_scalar(&value));
                }
                let value = if map.is_empty() {
                    Value::Null
                } else {
                    Value::Object(map)
                };
                let parent = stack.last_mut().expect("xml stack underflow");
                insert_child(&mut parent.1, name, value);
            }
            Event::Text(text) => {
                let text = text.unescape()?;
                stack.last_mut().expect("xml stack underflow").2.push_str(&text);
            }
            Event::End(_) => {
                let (name, map, text) = stack.pop().expect("xml stack underflow");
                let value = element_value(map, text);
                let parent = stack.last_mut().expect("xml stack underflow");
                insert_child(&mut parent.1, name, value);
            }
            Event::Eof => break,
            // Declarations, comments, processing instructions and CDATA
            // markers carry no configuration data.
            _ => {}
        }
    }

    let (_, mut root, _) = stack.pop().expect("xml stack underflow");

    // A document has one root element; unwrap it so XML configs address
    // the same keys as JSON and YAML ones.
    if root.len() == 1 {
        let key = root.keys().next().cloned().expect("non-empty map");
        if matches!(root.get(&key), Some(Value::Object(_))) {
            if let Some(Value::Object(inner)) = root.remove(&key) {
                return Ok(Value::Object(inner));
            }
        }
    }
    Ok(Value::Object(root))
}

fn element_value(map: Map<String, Value>, text: String) -> Value {
    let trimmed = text.trim();
    if map.is_empty() {
        if trimmed.is_empty() {
            Value::Null
        } else {
            infer_scalar(trimmed)
        }
    } else {
        let mut map = map;
        if !trimmed.is_empty() {
            map.insert("#text".to_string(), infer_scalar(trimmed));
        }
        Value::Object(map)
    }
}

fn insert_child(map: &mut Map<String, Value>, name: String, value: Value) {
    match map.entry(name) {
        serde_json::map::Entry::Vacant(slot) => {
            slot.insert(value);
        }
        serde_json::map::Entry::Occupied(mut slot) => {
            let existing = slot.get_mut();
            if let Value::Array(items) = existing {
                items.push(value);
            } else {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
        }
    }
}

fn infer_scalar(text: &str) -> Value {
    match text {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = text.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = text.parse::<f64>() {
        return Value::from(f);
    }
    Value::String(text.to_string())
}
