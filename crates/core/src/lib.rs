//! Sift core types: record schema, field extractors and engine options.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod schema;

/// Position of a record in the indexed collection (insertion order).
pub type DocId = u32;

/// Query text matching every indexed record.
pub const WILDCARD: &str = "";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate record id: {0}")]
    DuplicateId(String),
    #[error("field {field} of record #{record}: {reason}")]
    Extract { field: String, record: usize, reason: String },
    #[error("schema: {0}")]
    Schema(String),
}

/// Fallible accessor pulling one field out of a record.
pub type Extractor<R, T> = Arc<dyn Fn(&R) -> anyhow::Result<T> + Send + Sync>;

/// Named field plus the extractor producing its value.
pub struct Field<R, T> {
    pub name: String,
    extract: Extractor<R, T>,
}

impl<R, T> Field<R, T> {
    pub fn new(name: impl Into<String>, f: impl Fn(&R) -> anyhow::Result<T> + Send + Sync + 'static) -> Self {
        Self { name: name.into(), extract: Arc::new(f) }
    }

    pub fn extract(&self, rec: &R) -> anyhow::Result<T> { (self.extract)(rec) }
}

impl<R, T> Clone for Field<R, T> {
    fn clone(&self) -> Self { Self { name: self.name.clone(), extract: Arc::clone(&self.extract) } }
}

impl<R, T> std::fmt::Debug for Field<R, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Static search schema: how to pull ids, searchable text, filter tags and
/// stored values out of a record of type `R`.
pub struct SearchConfig<R> {
    id: Extractor<R, String>,
    pub search_fields: Vec<Field<R, String>>,
    pub filter_fields: Vec<Field<R, Vec<String>>>,
    pub store_fields: Vec<Field<R, serde_json::Value>>,
    pub text: TextOptions,
    pub facets: FacetOptions,
}

impl<R> Clone for SearchConfig<R> {
    fn clone(&self) -> Self {
        Self {
            id: Arc::clone(&self.id),
            search_fields: self.search_fields.clone(),
            filter_fields: self.filter_fields.clone(),
            store_fields: self.store_fields.clone(),
            text: self.text.clone(),
            facets: self.facets,
        }
    }
}

impl<R> SearchConfig<R> {
    pub fn new(id: impl Fn(&R) -> anyhow::Result<String> + Send + Sync + 'static) -> Self {
        Self {
            id: Arc::new(id),
            search_fields: Vec::new(),
            filter_fields: Vec::new(),
            store_fields: Vec::new(),
            text: TextOptions::default(),
            facets: FacetOptions::default(),
        }
    }

    pub fn search_field(mut self, name: impl Into<String>, f: impl Fn(&R) -> anyhow::Result<String> + Send + Sync + 'static) -> Self {
        self.search_fields.push(Field::new(name, f));
        self
    }

    pub fn filter_field(mut self, name: impl Into<String>, f: impl Fn(&R) -> anyhow::Result<Vec<String>> + Send + Sync + 'static) -> Self {
        self.filter_fields.push(Field::new(name, f));
        self
    }

    pub fn store_field(mut self, name: impl Into<String>, f: impl Fn(&R) -> anyhow::Result<serde_json::Value> + Send + Sync + 'static) -> Self {
        self.store_fields.push(Field::new(name, f));
        self
    }

    pub fn text_options(mut self, text: TextOptions) -> Self { self.text = text; self }
    pub fn facet_options(mut self, facets: FacetOptions) -> Self { self.facets = facets; self }

    pub fn id_of(&self, rec: &R) -> anyhow::Result<String> { (self.id)(rec) }

    pub fn filter_names(&self) -> Vec<String> { self.filter_fields.iter().map(|f| f.name.clone()).collect() }

    /// Reject schemas whose field lists repeat a name. Columns are addressed by
    /// name, so a repeated filter field would make actions ambiguous.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn unique<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<(), ConfigError> {
            let mut seen = std::collections::HashSet::new();
            for n in names {
                if n.is_empty() { return Err(ConfigError::Schema(format!("empty {kind} field name"))); }
                if !seen.insert(n) { return Err(ConfigError::Schema(format!("duplicate {kind} field: {n}"))); }
            }
            Ok(())
        }
        unique("search", self.search_fields.iter().map(|f| f.name.as_str()))?;
        unique("filter", self.filter_fields.iter().map(|f| f.name.as_str()))?;
        unique("store", self.store_fields.iter().map(|f| f.name.as_str()))?;
        if self.text.fuzzy < 0.0 || !self.text.fuzzy.is_finite() {
            return Err(ConfigError::Schema(format!("fuzzy must be a finite non-negative number, got {}", self.text.fuzzy)));
        }
        if self.search_fields.len() > u16::MAX as usize {
            return Err(ConfigError::Schema("too many search fields".into()));
        }
        Ok(())
    }
}

/// How multiple query terms combine.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Combine {
    /// A record matches when any query term matches.
    #[default]
    Or,
    /// A record matches only when every query term matches.
    And,
}

/// Text matching options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TextOptions {
    /// Query terms also match indexed terms they are a prefix of.
    pub prefix: bool,
    /// Below 1: allowed edit distance as a fraction of the query term length.
    /// From 1 up: absolute edit distance. 0 disables fuzzy matching.
    pub fuzzy: f32,
    /// Upper bound for fractional fuzzy distances.
    pub max_fuzzy: usize,
    pub combine: Combine,
    /// Regexes; a query term matching any of them is never matched fuzzily
    /// (identifiers like `T1059` should not drift to `T1058`).
    pub exact_patterns: Vec<String>,
    /// Index-time expansions: a token equal to the key is indexed under each
    /// listed term instead.
    pub expansions: BTreeMap<String, Vec<String>>,
}

impl Default for TextOptions {
    fn default() -> Self {
        Self { prefix: true, fuzzy: 0.15, max_fuzzy: 6, combine: Combine::Or, exact_patterns: Vec::new(), expansions: BTreeMap::new() }
    }
}

impl TextOptions {
    /// Edit distance allowed for a query term of `len` characters.
    pub fn max_distance(&self, len: usize) -> usize {
        if self.fuzzy <= 0.0 { return 0; }
        if self.fuzzy < 1.0 {
            ((len as f32 * self.fuzzy).round() as usize).min(self.max_fuzzy)
        } else {
            self.fuzzy as usize
        }
    }
}

/// Row order inside a facet column.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RowOrder {
    /// Order of first appearance over the candidate sequence.
    #[default]
    FirstSeen,
    /// Case-insensitive by name, ties by exact name.
    Alphabetical,
}

/// What happens to selections when facets are rebuilt for a new query.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CarryPolicy {
    /// Keep `on` for rows whose tag still appears; drop the rest.
    #[default]
    CarryForward,
    /// Every rebuild starts with nothing selected.
    Reset,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FacetOptions {
    pub order: RowOrder,
    pub carry: CarryPolicy,
}

/// Read access to the filter tags of indexed records.
pub trait TagSource {
    /// Filterable field names; position `i` names field `i`.
    fn field_names(&self) -> &[String];

    /// Position of the filterable field called `name`.
    fn field_index(&self, name: &str) -> Option<usize> { self.field_names().iter().position(|f| f == name) }

    /// Tags of record `doc` for the filterable field at position `field`.
    /// Unknown docs or fields yield an empty slice.
    fn tags(&self, doc: DocId, field: usize) -> &[String];
}

pub mod prelude {
    pub use super::{CarryPolicy, Combine, ConfigError, DocId, FacetOptions, Field, RowOrder, SearchConfig, TagSource, TextOptions, WILDCARD};
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tech { id: &'static str, name: &'static str }

    #[test]
    fn fractional_fuzzy_rounds_and_caps() {
        let t = TextOptions::default();
        assert_eq!(t.max_distance(1), 0);
        assert_eq!(t.max_distance(4), 1); // 0.6 -> 1
        assert_eq!(t.max_distance(10), 2); // 1.5 -> 2
        let capped = TextOptions { max_fuzzy: 1, ..TextOptions::default() };
        assert_eq!(capped.max_distance(40), 1);
    }

    #[test]
    fn absolute_fuzzy_and_disabled() {
        let abs = TextOptions { fuzzy: 2.0, ..TextOptions::default() };
        assert_eq!(abs.max_distance(1), 2);
        let off = TextOptions { fuzzy: 0.0, ..TextOptions::default() };
        assert_eq!(off.max_distance(50), 0);
    }

    #[test]
    fn builder_collects_fields_in_order() {
        let cfg = SearchConfig::<Tech>::new(|t| Ok(t.id.to_string()))
            .search_field("name", |t| Ok(t.name.to_string()))
            .filter_field("Tactic", |_| Ok(vec!["Execution".into()]))
            .filter_field("Platform", |_| Ok(vec![]));
        assert_eq!(cfg.filter_names(), vec!["Tactic".to_string(), "Platform".to_string()]);
        let t = Tech { id: "T1059", name: "Command and Scripting Interpreter" };
        assert_eq!(cfg.id_of(&t).unwrap(), "T1059");
        assert_eq!(cfg.search_fields[0].extract(&t).unwrap(), t.name);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn duplicate_filter_field_rejected() {
        let cfg = SearchConfig::<Tech>::new(|t| Ok(t.id.to_string()))
            .filter_field("Tactic", |_| Ok(vec![]))
            .filter_field("Tactic", |_| Ok(vec![]));
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Schema(ref m) if m.contains("Tactic")), "{err}");
    }

    #[test]
    fn negative_fuzzy_rejected() {
        let cfg = SearchConfig::<Tech>::new(|t| Ok(t.id.to_string()))
            .text_options(TextOptions { fuzzy: -0.5, ..TextOptions::default() });
        assert!(matches!(cfg.validate(), Err(ConfigError::Schema(_))));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let t: TextOptions = serde_json::from_str(r#"{"prefix": false, "combine": "and"}"#).unwrap();
        assert!(!t.prefix);
        assert_eq!(t.combine, Combine::And);
        assert_eq!(t.max_fuzzy, 6);
        let f: FacetOptions = serde_json::from_str(r#"{"order": "alphabetical"}"#).unwrap();
        assert_eq!(f.order, RowOrder::Alphabetical);
        assert_eq!(f.carry, CarryPolicy::CarryForward);
    }
}
