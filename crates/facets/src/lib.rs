//! Sift facets: per-field tag columns with counts over a candidate set,
//! the selection reducer and the record matcher.
//!
//! Columns are tied to tag fields by name through [`TagSource::field_names`];
//! a column naming no field has no rows and constrains nothing.

#![forbid(unsafe_code)]

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use sift_core::{CarryPolicy, DocId, FacetOptions, RowOrder, TagSource};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRow {
    pub name: String,
    pub on: bool,
    /// Candidates carrying this tag.
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCol {
    pub name: String,
    pub rows: Vec<FilterRow>,
}

impl FilterCol {
    pub fn row(&self, name: &str) -> Option<&FilterRow> { self.rows.iter().find(|r| r.name == name) }
    pub fn len(&self) -> usize { self.rows.len() }
    pub fn is_empty(&self) -> bool { self.rows.is_empty() }
    pub fn num_on(&self) -> usize { self.rows.iter().filter(|r| r.on).count() }
    pub fn any_on(&self) -> bool { self.rows.iter().any(|r| r.on) }

    /// Names of selected rows, in row order.
    pub fn on_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.rows.iter().filter(|r| r.on).map(|r| r.name.as_str())
    }

    fn clear(&mut self) {
        for r in &mut self.rows { r.on = false; }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSet {
    cols: Vec<FilterCol>,
}

impl FilterSet {
    pub fn cols(&self) -> &[FilterCol] { &self.cols }
    pub fn col(&self, name: &str) -> Option<&FilterCol> { self.cols.iter().find(|c| c.name == name) }
    pub fn any_on(&self) -> bool { self.cols.iter().any(FilterCol::any_on) }
    pub fn names(&self) -> Vec<String> { self.cols.iter().map(|c| c.name.clone()).collect() }

    fn col_mut(&mut self, name: &str) -> Option<&mut FilterCol> { self.cols.iter_mut().find(|c| c.name == name) }
}

/// Selection changes. Wire form is tagged by `name`:
/// `{"name":"toggle-row","colName":"Platform","rowName":"Linux"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum FilterSetAction {
    ToggleRow {
        #[serde(rename = "colName")]
        col: String,
        #[serde(rename = "rowName")]
        row: String,
    },
    ClearCol {
        #[serde(rename = "colName")]
        col: String,
    },
    ClearAll {
        #[serde(rename = "colNames")]
        cols: Vec<String>,
    },
}

impl FilterSetAction {
    pub fn toggle(col: impl Into<String>, row: impl Into<String>) -> Self {
        Self::ToggleRow { col: col.into(), row: row.into() }
    }
    pub fn clear_col(col: impl Into<String>) -> Self { Self::ClearCol { col: col.into() } }
    pub fn clear_all<I, S>(cols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::ClearAll { cols: cols.into_iter().map(Into::into).collect() }
    }
}

fn cmp_names(a: &str, b: &str) -> std::cmp::Ordering {
    let fold = |s: &str| s.chars().flat_map(char::to_lowercase).collect::<Vec<_>>();
    fold(a).cmp(&fold(b)).then_with(|| a.cmp(b))
}

/// Build facet columns for `candidates`, one per entry of `fields`, in that
/// order. Selections from `prior` survive on rows that still exist when the
/// carry policy allows it.
pub fn build<T: TagSource + ?Sized>(
    fields: &[String],
    candidates: &[DocId],
    tags: &T,
    prior: Option<&FilterSet>,
    opts: FacetOptions,
) -> FilterSet {
    let cols = fields
        .iter()
        .map(|name| {
            let field = tags.field_index(name);
            if field.is_none() {
                debug!(col = %name, "facet column names no tag field");
            }
            let mut order: Vec<&str> = Vec::new();
            let mut counts: FxHashMap<&str, usize> = FxHashMap::default();
            for &doc in candidates {
                let doc_tags = field.map(|fi| tags.tags(doc, fi)).unwrap_or(&[]);
                for (k, t) in doc_tags.iter().enumerate() {
                    // count records, not occurrences
                    if doc_tags[..k].contains(t) { continue; }
                    let c = counts.entry(t.as_str()).or_insert(0);
                    if *c == 0 { order.push(t.as_str()); }
                    *c += 1;
                }
            }
            if opts.order == RowOrder::Alphabetical {
                order.sort_by(|a, b| cmp_names(a, b));
            }

            let carried: FxHashSet<&str> = match (opts.carry, prior.and_then(|p| p.col(name))) {
                (CarryPolicy::CarryForward, Some(col)) => col.on_names().collect(),
                _ => FxHashSet::default(),
            };
            let dropped = carried.iter().filter(|n| !counts.contains_key(*n)).count();
            if dropped > 0 {
                debug!(col = %name, dropped, "facet selections dropped");
            }

            let rows = order
                .into_iter()
                .map(|n| FilterRow { name: n.to_string(), on: carried.contains(n), count: counts.get(n).copied().unwrap_or(0) })
                .collect();
            FilterCol { name: name.clone(), rows }
        })
        .collect();
    FilterSet { cols }
}

/// Apply one action, returning the next set. Unknown columns or rows leave
/// the set unchanged.
pub fn reduce(set: &FilterSet, action: &FilterSetAction) -> FilterSet {
    let mut next = set.clone();
    match action {
        FilterSetAction::ToggleRow { col, row } => {
            match next.col_mut(col).and_then(|c| c.rows.iter_mut().find(|r| r.name == *row)) {
                Some(r) => r.on = !r.on,
                None => debug!(col = %col, row = %row, "toggle of unknown facet row ignored"),
            }
        }
        FilterSetAction::ClearCol { col } => match next.col_mut(col) {
            Some(c) => c.clear(),
            None => debug!(col = %col, "clear of unknown facet column ignored"),
        },
        FilterSetAction::ClearAll { cols } => {
            for col in cols {
                match next.col_mut(col) {
                    Some(c) => c.clear(),
                    None => debug!(col = %col, "clear of unknown facet column ignored"),
                }
            }
        }
    }
    next
}

/// Whether record `doc` passes the selection: within a column any selected
/// tag suffices, every column with a selection must pass.
pub fn matches<T: TagSource + ?Sized>(set: &FilterSet, tags: &T, doc: DocId) -> bool {
    set.cols.iter().all(|col| {
        if !col.any_on() { return true; }
        let Some(fi) = tags.field_index(&col.name) else { return true };
        let have = tags.tags(doc, fi);
        col.on_names().any(|n| have.iter().any(|t| t == n))
    })
}
