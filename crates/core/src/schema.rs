//! Declarative schema for JSON records.
//!
//! Fields are top-level object keys:
//! - id: string or number; missing is an extraction error
//! - search: strings as-is, arrays joined with spaces, scalars rendered, missing/null empty
//! - filter: a string array or a single string; missing/null means no tags
//! - store: the raw value, `null` when missing

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{FacetOptions, SearchConfig, TextOptions};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    pub id_field: String,
    #[serde(default)]
    pub search_fields: Vec<String>,
    #[serde(default)]
    pub filter_fields: Vec<String>,
    #[serde(default)]
    pub store_fields: Vec<String>,
    #[serde(default)]
    pub text: TextOptions,
    #[serde(default)]
    pub facets: FacetOptions,
}

impl Schema {
    pub fn into_config(self) -> SearchConfig<Value> {
        let id_field = self.id_field;
        let mut cfg = SearchConfig::new(move |rec: &Value| id_value(rec, &id_field));
        for name in self.search_fields {
            let key = name.clone();
            cfg = cfg.search_field(name, move |rec: &Value| Ok(text_value(rec.get(&key))));
        }
        for name in self.filter_fields {
            let key = name.clone();
            cfg = cfg.filter_field(name, move |rec: &Value| tag_values(rec.get(&key), &key));
        }
        for name in self.store_fields {
            let key = name.clone();
            cfg = cfg.store_field(name, move |rec: &Value| Ok(rec.get(&key).cloned().unwrap_or(Value::Null)));
        }
        cfg.text_options(self.text).facet_options(self.facets)
    }
}

fn id_value(rec: &Value, key: &str) -> Result<String> {
    match rec.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => bail!("id field {key} must be a string or number, got {other}"),
        None => bail!("missing id field {key}"),
    }
}

fn text_value(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(xs)) => xs
            .iter()
            .map(|x| text_value(Some(x)))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        Some(Value::Object(m)) => m
            .values()
            .map(|x| text_value(Some(x)))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        Some(other) => other.to_string(),
    }
}

fn tag_values(v: Option<&Value>, key: &str) -> Result<Vec<String>> {
    match v {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(xs)) => xs
            .iter()
            .map(|x| match x {
                Value::String(s) => Ok(s.clone()),
                other => Err(anyhow!("filter field {key}: expected string tag, got {other}")),
            })
            .collect(),
        Some(other) => bail!("filter field {key}: expected string or string array, got {other}"),
    }
}
