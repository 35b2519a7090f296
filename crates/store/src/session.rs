//! Owned search session: query text plus facet selection, with candidates
//! and results derived on every transition.

use std::sync::Arc;

use sift_core::{ConfigError, DocId, FacetOptions, SearchConfig, WILDCARD};
use sift_facets::{FilterSet, FilterSetAction};
use sift_search::{Hit, RecordIndex, SearchResult};
use tracing::debug;

/// Immutable view of a session after one transition.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Bumped on every transition; 0 is the initial wildcard state.
    pub epoch: u64,
    pub text: String,
    pub filters: FilterSet,
    /// Query hits before facet filtering, in insertion order.
    pub candidates: Arc<[Hit]>,
    /// Candidates passing the selection, in candidate order.
    pub results: Vec<SearchResult>,
}

impl SessionState {
    pub fn result_ids(&self) -> Vec<&str> { self.results.iter().map(|r| r.id.as_str()).collect() }
}

pub struct SearchSession {
    index: Arc<RecordIndex>,
    facets: FacetOptions,
    state: Arc<SessionState>,
}

impl SearchSession {
    pub fn new<R>(records: &[R], config: &SearchConfig<R>) -> Result<Self, ConfigError> {
        let index = RecordIndex::build(records, config)?;
        Ok(Self::with_index(Arc::new(index), config.facets))
    }

    /// Session over an already built index. Starts on the wildcard query
    /// with nothing selected.
    pub fn with_index(index: Arc<RecordIndex>, facets: FacetOptions) -> Self {
        let candidates: Arc<[Hit]> = index.query(WILDCARD).into();
        let filters = build_filters(&index, &candidates, None, facets);
        let results = filter_results(&index, &filters, &candidates);
        let state = Arc::new(SessionState { epoch: 0, text: WILDCARD.to_string(), filters, candidates, results });
        Self { index, facets, state }
    }

    /// Re-run the query and rebuild facets, carrying selections per the
    /// configured policy.
    pub fn set_query(&mut self, text: &str) -> Arc<SessionState> {
        let candidates: Arc<[Hit]> = self.index.query(text).into();
        let filters = build_filters(&self.index, &candidates, Some(&self.state.filters), self.facets);
        self.publish(text.to_string(), filters, candidates, "query")
    }

    /// Change the selection and re-filter the current candidates. Facet counts
    /// stay as the last query produced them.
    pub fn apply_action(&mut self, action: &FilterSetAction) -> Arc<SessionState> {
        let filters = sift_facets::reduce(&self.state.filters, action);
        let candidates = Arc::clone(&self.state.candidates);
        self.publish(self.state.text.clone(), filters, candidates, "action")
    }

    pub fn state(&self) -> Arc<SessionState> { Arc::clone(&self.state) }
    pub fn index(&self) -> &Arc<RecordIndex> { &self.index }
    pub fn facet_options(&self) -> FacetOptions { self.facets }

    fn publish(&mut self, text: String, filters: FilterSet, candidates: Arc<[Hit]>, kind: &'static str) -> Arc<SessionState> {
        let results = filter_results(&self.index, &filters, &candidates);
        let epoch = self.state.epoch.saturating_add(1);
        metrics::counter!("session_transitions_total", 1u64, "kind" => kind);
        metrics::histogram!("session_results", results.len() as f64);
        debug!(epoch, kind, text = %text, candidates = candidates.len(), results = results.len(), "session transition");
        self.state = Arc::new(SessionState { epoch, text, filters, candidates, results });
        Arc::clone(&self.state)
    }
}

fn build_filters(index: &RecordIndex, candidates: &[Hit], prior: Option<&FilterSet>, opts: FacetOptions) -> FilterSet {
    let docs: Vec<DocId> = candidates.iter().map(|h| h.doc).collect();
    sift_facets::build(index.filter_fields(), &docs, index, prior, opts)
}

fn filter_results(index: &RecordIndex, filters: &FilterSet, candidates: &[Hit]) -> Vec<SearchResult> {
    candidates
        .iter()
        .filter(|h| sift_facets::matches(filters, index, h.doc))
        .map(|h| index.result(h))
        .collect()
}
