//! Sift search: in-RAM inverted index over a fixed record collection.
//! Built once, immutable afterwards; safe to share behind an `Arc`.

#![forbid(unsafe_code)]

mod text;

pub use text::{fold, index_terms, levenshtein_within, normalize_expansions, tokenize};

use std::sync::Arc;
use std::time::Instant;

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use regex::Regex;
use rustc_hash::FxHashMap;
use sift_core::{Combine, ConfigError, DocId, SearchConfig, TagSource, TextOptions, WILDCARD};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

/// Indexed term that made a record match, and the search field it was found in.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TermMatch {
    pub field: u16,
    pub term: String,
}

pub type Matches = SmallVec<[TermMatch; 2]>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    pub doc: DocId,
    pub matches: Matches,
}

/// Stored fields of one record, in schema order.
pub type Stored = Arc<[(String, serde_json::Value)]>;

/// Projection of one matching record handed to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub doc: DocId,
    pub id: String,
    pub stored: Stored,
    pub matches: Matches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Posting {
    doc: DocId,
    field: u16,
}

pub struct RecordIndex {
    ids: Vec<String>,
    by_id: FxHashMap<String, DocId>,
    search_fields: Vec<String>,
    filter_fields: Vec<String>,
    store_fields: Vec<String>,
    // [doc][search field]
    texts: Vec<Vec<String>>,
    // [doc][filter field], deduplicated, extraction order
    tags: Vec<Vec<SmallVec<[String; 4]>>>,
    stored: Vec<Stored>,
    // sorted vocabulary; postings[i] belongs to vocab[i] and is sorted by doc
    vocab: Vec<String>,
    postings: Vec<Vec<Posting>>,
    opts: TextOptions,
    exact: Vec<Regex>,
}

fn extract_err(field: &str, record: usize, e: anyhow::Error) -> ConfigError {
    ConfigError::Extract { field: field.to_string(), record, reason: format!("{e:#}") }
}

impl RecordIndex {
    /// Index `records` under `config`. Fails on the first duplicate id,
    /// extractor error or schema problem; nothing is returned partially built.
    pub fn build<R>(records: &[R], config: &SearchConfig<R>) -> Result<Self, ConfigError> {
        let started = Instant::now();
        config.validate()?;
        if records.len() > DocId::MAX as usize {
            return Err(ConfigError::Schema(format!("too many records: {}", records.len())));
        }
        let exact = config
            .text
            .exact_patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| ConfigError::Schema(format!("exact pattern {p:?}: {e}"))))
            .collect::<Result<Vec<_>, _>>()?;

        let n = records.len();
        let mut ids = Vec::with_capacity(n);
        let mut by_id: FxHashMap<String, DocId> = FxHashMap::default();
        let mut texts = Vec::with_capacity(n);
        let mut tags = Vec::with_capacity(n);
        let mut stored = Vec::with_capacity(n);
        let mut terms: FxHashMap<String, Vec<Posting>> = FxHashMap::default();
        let expansions = normalize_expansions(&config.text.expansions);

        for (i, rec) in records.iter().enumerate() {
            let doc = i as DocId;
            let id = config.id_of(rec).map_err(|e| extract_err("id", i, e))?;
            if by_id.insert(id.clone(), doc).is_some() {
                return Err(ConfigError::DuplicateId(id));
            }
            ids.push(id);

            let mut doc_texts = Vec::with_capacity(config.search_fields.len());
            for (fi, field) in config.search_fields.iter().enumerate() {
                let text = field.extract(rec).map_err(|e| extract_err(&field.name, i, e))?;
                let p = Posting { doc, field: fi as u16 };
                for tok in tokenize(&text) {
                    for term in index_terms(&tok, &expansions) {
                        let post = terms.entry(term).or_default();
                        // postings of the current doc sit at the tail
                        if !post.iter().rev().take_while(|q| q.doc == doc).any(|q| *q == p) {
                            post.push(p);
                        }
                    }
                }
                doc_texts.push(text);
            }
            texts.push(doc_texts);

            let mut doc_tags = Vec::with_capacity(config.filter_fields.len());
            for field in config.filter_fields.iter() {
                let vals = field.extract(rec).map_err(|e| extract_err(&field.name, i, e))?;
                let mut uniq: SmallVec<[String; 4]> = SmallVec::new();
                for v in vals {
                    if !uniq.contains(&v) { uniq.push(v); }
                }
                doc_tags.push(uniq);
            }
            tags.push(doc_tags);

            let mut doc_stored = Vec::with_capacity(config.store_fields.len());
            for field in config.store_fields.iter() {
                let v = field.extract(rec).map_err(|e| extract_err(&field.name, i, e))?;
                doc_stored.push((field.name.clone(), v));
            }
            stored.push(Stored::from(doc_stored));
        }

        let mut entries: Vec<(String, Vec<Posting>)> = terms.into_iter().collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        let (vocab, postings): (Vec<String>, Vec<Vec<Posting>>) = entries.into_iter().unzip();

        if n == 0 { warn!("record index built over an empty collection"); }
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        metrics::gauge!("index_docs", n as f64);
        metrics::gauge!("index_terms", vocab.len() as f64);
        metrics::histogram!("index_build_ms", elapsed_ms);
        info!(docs = n, terms = vocab.len(), ms = elapsed_ms, "record index built");

        Ok(Self {
            ids,
            by_id,
            search_fields: config.search_fields.iter().map(|f| f.name.clone()).collect(),
            filter_fields: config.filter_names(),
            store_fields: config.store_fields.iter().map(|f| f.name.clone()).collect(),
            texts,
            tags,
            stored,
            vocab,
            postings,
            opts: config.text.clone(),
            exact,
        })
    }

    /// Records matching `q`, in insertion order. The wildcard matches every
    /// record; a query without any token matches none.
    pub fn query(&self, q: &str) -> Vec<Hit> {
        let started = Instant::now();
        if q == WILDCARD {
            return (0..self.ids.len() as DocId).map(|doc| Hit { doc, matches: Matches::new() }).collect();
        }
        let mut qterms = tokenize(q);
        let mut seen = rustc_hash::FxHashSet::default();
        qterms.retain(|t| seen.insert(t.clone()));

        let mut acc: Option<FxHashMap<DocId, Matches>> = None;
        for qt in qterms.iter() {
            let mut per: FxHashMap<DocId, Matches> = FxHashMap::default();
            for ti in self.matching_terms(qt) {
                for p in self.postings[ti].iter() {
                    let m = TermMatch { field: p.field, term: self.vocab[ti].clone() };
                    let e = per.entry(p.doc).or_default();
                    if !e.contains(&m) { e.push(m); }
                }
            }
            acc = Some(match (acc, self.opts.combine) {
                (None, _) => per,
                (Some(mut all), Combine::Or) => {
                    for (doc, ms) in per { merge(all.entry(doc).or_default(), ms); }
                    all
                }
                (Some(mut all), Combine::And) => {
                    all.retain(|doc, _| per.contains_key(doc));
                    for (doc, ms) in per {
                        if let Some(e) = all.get_mut(&doc) { merge(e, ms); }
                    }
                    all
                }
            });
            if self.opts.combine == Combine::And && acc.as_ref().map(|a| a.is_empty()).unwrap_or(false) { break; }
        }

        let mut hits: Vec<Hit> = acc
            .unwrap_or_default()
            .into_iter()
            .map(|(doc, matches)| Hit { doc, matches })
            .collect();
        hits.sort_unstable_by_key(|h| h.doc);
        metrics::histogram!("search_candidates", hits.len() as f64);
        metrics::histogram!("search_eval_ms", started.elapsed().as_secs_f64() * 1_000.0);
        debug!(query = %q, terms = qterms.len(), hits = hits.len(), "query evaluated");
        hits
    }

    /// Vocabulary positions matched by one processed query term.
    fn matching_terms(&self, qt: &str) -> Vec<usize> {
        let start = self.vocab.partition_point(|t| t.as_str() < qt);
        let mut end = start;
        if self.opts.prefix {
            while end < self.vocab.len() && self.vocab[end].starts_with(qt) { end += 1; }
        } else if self.vocab.get(start).map(|t| t == qt).unwrap_or(false) {
            end = start + 1;
        }
        let mut out: Vec<usize> = (start..end).collect();

        let max_d = if self.exact.iter().any(|re| re.is_match(qt)) { 0 } else { self.opts.max_distance(qt.chars().count()) };
        if max_d > 0 {
            for (i, t) in self.vocab.iter().enumerate() {
                if (start..end).contains(&i) { continue; }
                if levenshtein_within(qt, t, max_d) { out.push(i); }
            }
        }
        out
    }

    /// Sorted char positions in a search field's text covered by the hit's
    /// matched terms, for bolding in a renderer.
    pub fn highlight(&self, hit: &Hit, field: u16) -> Vec<usize> {
        let Some(text) = self.texts.get(hit.doc as usize).and_then(|t| t.get(field as usize)) else { return Vec::new() };
        // terms are folded, match against folded text
        let text = fold(text);
        let matcher = SkimMatcherV2::default();
        let mut out: Vec<usize> = Vec::new();
        for m in hit.matches.iter().filter(|m| m.field == field) {
            if let Some((_score, idx)) = matcher.fuzzy_indices(&text, &m.term) { out.extend(idx); }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn result(&self, hit: &Hit) -> SearchResult {
        SearchResult {
            doc: hit.doc,
            id: self.ids[hit.doc as usize].clone(),
            stored: Arc::clone(&self.stored[hit.doc as usize]),
            matches: hit.matches.clone(),
        }
    }

    /// Tags of the record `id` for the filter field named `filter_field`.
    pub fn fields(&self, id: &str, filter_field: &str) -> &[String] {
        let (Some(doc), Some(fi)) = (self.by_id.get(id), self.filter_fields.iter().position(|f| f == filter_field)) else {
            return &[];
        };
        self.tags(*doc, fi)
    }

    pub fn len(&self) -> usize { self.ids.len() }
    pub fn is_empty(&self) -> bool { self.ids.is_empty() }
    pub fn id(&self, doc: DocId) -> Option<&str> { self.ids.get(doc as usize).map(|s| s.as_str()) }
    pub fn doc_of(&self, id: &str) -> Option<DocId> { self.by_id.get(id).copied() }
    pub fn text(&self, doc: DocId, field: u16) -> Option<&str> { self.texts.get(doc as usize)?.get(field as usize).map(|s| s.as_str()) }
    pub fn search_fields(&self) -> &[String] { &self.search_fields }
    pub fn filter_fields(&self) -> &[String] { &self.filter_fields }
    pub fn store_fields(&self) -> &[String] { &self.store_fields }
    pub fn term_count(&self) -> usize { self.vocab.len() }
    pub fn text_options(&self) -> &TextOptions { &self.opts }
}

impl TagSource for RecordIndex {
    fn field_names(&self) -> &[String] { &self.filter_fields }

    fn tags(&self, doc: DocId, field: usize) -> &[String] {
        self.tags.get(doc as usize).and_then(|t| t.get(field)).map(|t| t.as_slice()).unwrap_or(&[])
    }
}

fn merge(into: &mut Matches, from: Matches) {
    for m in from {
        if !into.contains(&m) { into.push(m); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_core::TextOptions;

    struct Tech { id: &'static str, name: &'static str, tactics: &'static [&'static str] }

    fn techs() -> Vec<Tech> {
        vec![
            Tech { id: "T1566", name: "Phishing", tactics: &["Initial Access"] },
            Tech { id: "T1566.002", name: "Spearphishing Link", tactics: &["Initial Access"] },
            Tech { id: "T1059.001", name: "PowerShell", tactics: &["Execution", "Execution"] },
            Tech { id: "T1059", name: "Command and Scripting Interpreter", tactics: &["Execution"] },
            Tech { id: "T1003", name: "OS Credential Dumping", tactics: &[] },
        ]
    }

    fn config(text: TextOptions) -> SearchConfig<Tech> {
        SearchConfig::new(|t: &Tech| Ok(t.id.to_string()))
            .search_field("id", |t| Ok(t.id.to_string()))
            .search_field("name", |t| Ok(t.name.to_string()))
            .filter_field("Tactic", |t| Ok(t.tactics.iter().map(|s| s.to_string()).collect()))
            .store_field("name", |t| Ok(serde_json::Value::String(t.name.to_string())))
            .text_options(text)
    }

    fn ids(idx: &RecordIndex, hits: &[Hit]) -> Vec<String> {
        hits.iter().map(|h| idx.id(h.doc).unwrap().to_string()).collect()
    }

    fn attack_text() -> TextOptions {
        let mut t = TextOptions { exact_patterns: vec![r"(?i)^t\d+".into()], ..TextOptions::default() };
        t.expansions.insert("spearphishing".into(), vec!["spearphishing".into(), "phishing".into()]);
        t.expansions.insert("powershell".into(), vec!["powershell".into(), "shell".into()]);
        t
    }

    #[test]
    fn wildcard_returns_every_record_in_order() {
        let data = techs();
        let idx = RecordIndex::build(&data, &config(TextOptions::default())).unwrap();
        let hits = idx.query(WILDCARD);
        assert_eq!(ids(&idx, &hits), vec!["T1566", "T1566.002", "T1059.001", "T1059", "T1003"]);
        assert!(hits.iter().all(|h| h.matches.is_empty()));
    }

    #[test]
    fn case_insensitive_and_prefix() {
        let data = techs();
        let idx = RecordIndex::build(&data, &config(TextOptions::default())).unwrap();
        assert_eq!(ids(&idx, &idx.query("CREDENTIAL")), vec!["T1003"]);
        assert_eq!(ids(&idx, &idx.query("cred")), vec!["T1003"]);
        let no_prefix = RecordIndex::build(&data, &config(TextOptions { prefix: false, fuzzy: 0.0, ..TextOptions::default() })).unwrap();
        assert!(no_prefix.query("cred").is_empty());
        assert_eq!(ids(&no_prefix, &no_prefix.query("credential")), vec!["T1003"]);
    }

    #[test]
    fn expansions_reach_compound_words() {
        let data = techs();
        let plain = RecordIndex::build(&data, &config(TextOptions { fuzzy: 0.0, ..TextOptions::default() })).unwrap();
        assert_eq!(ids(&plain, &plain.query("phishing")), vec!["T1566"]);
        let idx = RecordIndex::build(&data, &config(attack_text())).unwrap();
        assert_eq!(ids(&idx, &idx.query("phishing")), vec!["T1566", "T1566.002"]);
        assert_eq!(ids(&idx, &idx.query("shell")), vec!["T1059.001"]);
    }

    #[test]
    fn fuzzy_tolerates_typos() {
        let data = techs();
        let idx = RecordIndex::build(&data, &config(TextOptions::default())).unwrap();
        assert_eq!(ids(&idx, &idx.query("phising")), vec!["T1566"]);
        let strict = RecordIndex::build(&data, &config(TextOptions { fuzzy: 0.0, ..TextOptions::default() })).unwrap();
        assert!(strict.query("phising").is_empty());
    }

    #[test]
    fn exact_patterns_disable_fuzzy_for_ids() {
        let data = techs();
        let loose = RecordIndex::build(&data, &config(TextOptions::default())).unwrap();
        assert_eq!(ids(&loose, &loose.query("t1058")), vec!["T1059.001", "T1059"]);
        let idx = RecordIndex::build(&data, &config(attack_text())).unwrap();
        assert!(idx.query("t1058").is_empty());
        assert_eq!(ids(&idx, &idx.query("T1059")), vec!["T1059.001", "T1059"]);
    }

    #[test]
    fn combine_or_and() {
        let data = techs();
        let text = TextOptions { fuzzy: 0.0, ..TextOptions::default() };
        let or = RecordIndex::build(&data, &config(text.clone())).unwrap();
        assert_eq!(ids(&or, &or.query("phishing dumping")), vec!["T1566", "T1003"]);
        let and = RecordIndex::build(&data, &config(TextOptions { combine: Combine::And, ..text })).unwrap();
        assert!(and.query("phishing dumping").is_empty());
        assert_eq!(ids(&and, &and.query("credential dumping")), vec!["T1003"]);
    }

    #[test]
    fn tokenless_query_matches_nothing() {
        let data = techs();
        let idx = RecordIndex::build(&data, &config(TextOptions::default())).unwrap();
        assert!(idx.query("   ").is_empty());
        assert!(idx.query("&&").is_empty());
    }

    #[test]
    fn matches_name_field_and_term() {
        let data = techs();
        let idx = RecordIndex::build(&data, &config(TextOptions { fuzzy: 0.0, ..TextOptions::default() })).unwrap();
        let hits = idx.query("dump");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].matches.as_slice(), [TermMatch { field: 1, term: "dumping".into() }]);
        // "OS Credential Dumping": d,u,m,p,i,n,g at 14..21
        assert_eq!(idx.highlight(&hits[0], 1), (14..21).collect::<Vec<_>>());
        assert!(idx.highlight(&hits[0], 0).is_empty());
    }

    #[test]
    fn highlight_covers_folded_text() {
        let data = vec![Tech { id: "T1055.013", name: "Process Doppelgänging", tactics: &["Defense Evasion"] }];
        let idx = RecordIndex::build(&data, &config(TextOptions::default())).unwrap();
        let hits = idx.query("doppelganging");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].matches.as_slice(), [TermMatch { field: 1, term: "doppelganging".into() }]);
        assert_eq!(idx.highlight(&hits[0], 1), (8..21).collect::<Vec<_>>());
    }

    #[test]
    fn expansion_keys_ignore_case() {
        let data = techs();
        let mut text = TextOptions { fuzzy: 0.0, ..TextOptions::default() };
        text.expansions.insert("PowerShell".into(), vec!["PowerShell".into(), "Shell".into()]);
        let idx = RecordIndex::build(&data, &config(text)).unwrap();
        assert_eq!(ids(&idx, &idx.query("shell")), vec!["T1059.001"]);
    }

    #[test]
    fn filter_tags_are_deduplicated() {
        let data = techs();
        let idx = RecordIndex::build(&data, &config(TextOptions::default())).unwrap();
        assert_eq!(idx.fields("T1059.001", "Tactic"), ["Execution".to_string()]);
        assert!(idx.fields("T1003", "Tactic").is_empty());
        assert!(idx.fields("T9999", "Tactic").is_empty());
        assert!(idx.fields("T1566", "Platform").is_empty());
        assert_eq!(idx.tags(0, 0), ["Initial Access".to_string()]);
    }

    #[test]
    fn result_projects_stored_fields() {
        let data = techs();
        let idx = RecordIndex::build(&data, &config(TextOptions::default())).unwrap();
        let hit = idx.query("powershell").remove(0);
        let r = idx.result(&hit);
        assert_eq!(r.id, "T1059.001");
        assert_eq!(r.stored[0], ("name".to_string(), serde_json::json!("PowerShell")));
    }

    #[test]
    fn duplicate_id_fails_build() {
        let mut data = techs();
        data.push(Tech { id: "T1566", name: "Again", tactics: &[] });
        match RecordIndex::build(&data, &config(TextOptions::default())) {
            Err(ConfigError::DuplicateId(id)) => assert_eq!(id, "T1566"),
            other => panic!("expected duplicate id, got {:?}", other.err()),
        }
    }

    #[test]
    fn extractor_failure_fails_build() {
        let data = techs();
        let cfg = config(TextOptions::default()).filter_field("Platform", |t: &Tech| {
            if t.id == "T1059" { anyhow::bail!("no platforms for {}", t.id) }
            Ok(vec![])
        });
        match RecordIndex::build(&data, &cfg) {
            Err(ConfigError::Extract { field, record, reason }) => {
                assert_eq!(field, "Platform");
                assert_eq!(record, 3);
                assert!(reason.contains("T1059"));
            }
            other => panic!("expected extract error, got {:?}", other.err()),
        }
    }

    #[test]
    fn invalid_exact_pattern_is_schema_error() {
        let data = techs();
        let cfg = config(TextOptions { exact_patterns: vec!["(".into()], ..TextOptions::default() });
        assert!(matches!(RecordIndex::build(&data, &cfg), Err(ConfigError::Schema(_))));
    }
}
