//! Record Aggregator: filter and deduplicate every persisted page.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use tracing::{debug, info, instrument};

use crate::checkpoint::{CheckpointError, CheckpointStore, QuerySignature};
use crate::record::{RawRecord, normalize_affiliation};

/// Exact match on the corresponding author's institution, ignoring case and
/// surrounding whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffiliationFilter {
    target: String,
}

impl AffiliationFilter {
    /// Filter matching `target`.
    #[must_use]
    pub fn new(target: &str) -> Self {
        Self {
            target: normalize_affiliation(target),
        }
    }

    /// The normalized target.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether `record` passes. Records without an institution never do.
    #[must_use]
    pub fn matches(&self, record: &RawRecord) -> bool {
        record
            .corresponding_institution
            .as_deref()
            .is_some_and(|institution| normalize_affiliation(institution) == self.target)
    }
}

/// Deduplicated records, one per normalized DOI, ordered by normalized DOI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalRecordSet {
    records: Vec<RawRecord>,
}

impl FinalRecordSet {
    /// The records.
    #[must_use]
    pub fn records(&self) -> &[RawRecord] {
        &self.records
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over the records.
    pub fn iter(&self) -> std::slice::Iter<'_, RawRecord> {
        self.records.iter()
    }

    /// Concatenates sets in the given order without further deduplication.
    #[must_use]
    pub fn concat<'a>(sets: impl IntoIterator<Item = &'a FinalRecordSet>) -> Self {
        Self {
            records: sets
                .into_iter()
                .flat_map(|set| set.records.iter().cloned())
                .collect(),
        }
    }
}

impl IntoIterator for FinalRecordSet {
    type Item = RawRecord;
    type IntoIter = std::vec::IntoIter<RawRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a FinalRecordSet {
    type Item = &'a RawRecord;
    type IntoIter = std::slice::Iter<'a, RawRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Filters and deduplicates `records`, given in traversal order.
///
/// Within a DOI group the highest version wins; among equal versions the
/// first one traversed is kept.
#[must_use]
pub fn merge_records(
    records: impl IntoIterator<Item = RawRecord>,
    filter: Option<&AffiliationFilter>,
) -> FinalRecordSet {
    let mut by_doi: BTreeMap<String, RawRecord> = BTreeMap::new();
    let mut dropped = 0usize;

    for mut record in records {
        if filter.is_some_and(|filter| !filter.matches(&record)) {
            dropped += 1;
            continue;
        }
        record.strip_excluded();
        match by_doi.entry(record.normalized_doi()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                if record.version > slot.get().version {
                    slot.insert(record);
                }
            }
        }
    }

    debug!(kept = by_doi.len(), filtered_out = dropped, "records merged");
    FinalRecordSet {
        records: by_doi.into_values().collect(),
    }
}

/// Reads every page persisted under `signature` and merges their records.
///
/// Pages are traversed in ascending index order, records in page order,
/// so the result does not depend on the order pages were fetched in.
///
/// # Errors
///
/// Returns a [`CheckpointError`] if a unit cannot be listed or read.
#[instrument(skip(store, filter), fields(signature = %signature, filtered = filter.is_some()))]
pub fn aggregate(
    store: &CheckpointStore,
    signature: &QuerySignature,
    filter: Option<&AffiliationFilter>,
) -> Result<FinalRecordSet, CheckpointError> {
    let pages = store.list(signature)?;
    let mut records = Vec::new();
    for &page_index in &pages {
        if let Some(checkpoint) = store.get(signature, page_index)? {
            records.extend(checkpoint.records);
        }
    }

    let read = records.len();
    let set = merge_records(records, filter);
    info!(pages = pages.len(), read, kept = set.len(), "aggregation complete");
    Ok(set)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::config::Server;
    use crate::fetch::PageResult;

    fn rec(doi: &str, version: u32, institution: &str, title: &str) -> RawRecord {
        serde_json::from_value(json!({
            "doi": doi,
            "version": version,
            "title": title,
            "date": "2021-04-01",
            "author_corresponding_institution": institution,
            "abstract": "long text"
        }))
        .unwrap()
    }

    // ==================== Affiliation Filter ====================

    #[test]
    fn test_filter_ignores_case_and_padding() {
        let filter = AffiliationFilter::new("institut pasteur");
        assert!(filter.matches(&rec("10.1/a", 1, "  Institut Pasteur  ", "t")));
        assert!(filter.matches(&rec("10.1/a", 1, "INSTITUT PASTEUR", "t")));
    }

    #[test]
    fn test_filter_is_otherwise_exact() {
        let filter = AffiliationFilter::new("Institut Pasteur");
        assert!(!filter.matches(&rec("10.1/a", 1, "Institut Pasteur Paris", "t")));
        assert!(!filter.matches(&rec("10.1/a", 1, "Institut  Pasteur", "t")));
    }

    #[test]
    fn test_filter_rejects_missing_institution() {
        let filter = AffiliationFilter::new("Institut Pasteur");
        let mut record = rec("10.1/a", 1, "x", "t");
        record.corresponding_institution = None;
        assert!(!filter.matches(&record));
    }

    // ==================== Deduplication ====================

    #[test]
    fn test_keeps_highest_version() {
        let set = merge_records(
            vec![
                rec("10.1101/x", 1, "a", "v1"),
                rec("10.1101/x", 3, "a", "v3"),
                rec("10.1101/x", 2, "a", "v2"),
            ],
            None,
        );
        assert_eq!(set.len(), 1);
        assert_eq!(set.records()[0].version, 3);
    }

    #[test]
    fn test_equal_versions_keep_first_seen() {
        let set = merge_records(
            vec![
                rec("10.1101/x", 2, "a", "first"),
                rec("10.1101/X", 2, "a", "second"),
            ],
            None,
        );
        assert_eq!(set.len(), 1);
        assert_eq!(set.records()[0].title, "first");
    }

    #[test]
    fn test_doi_normalization_groups_variants() {
        let set = merge_records(
            vec![
                rec("10.1101/abc", 1, "a", "t"),
                rec("https://doi.org/10.1101/ABC", 2, "a", "t"),
                rec("10.1101/other", 1, "a", "t"),
            ],
            None,
        );
        assert_eq!(set.len(), 2);
        assert_eq!(set.records()[0].version, 2);
    }

    #[test]
    fn test_merge_is_order_independent_for_distinct_versions() {
        let forward = vec![
            rec("10.1/b", 1, "a", "t"),
            rec("10.1/a", 2, "a", "t"),
            rec("10.1/a", 1, "a", "t"),
            rec("10.1/b", 4, "a", "t"),
        ];
        let mut backward = forward.clone();
        backward.reverse();
        assert_eq!(merge_records(forward, None), merge_records(backward, None));
    }

    #[test]
    fn test_filter_applies_before_dedup() {
        let filter = AffiliationFilter::new("Pasteur");
        let set = merge_records(
            vec![
                rec("10.1/a", 1, "Pasteur", "kept"),
                rec("10.1/a", 2, "Elsewhere", "newer elsewhere"),
            ],
            Some(&filter),
        );
        assert_eq!(set.len(), 1);
        assert_eq!(set.records()[0].title, "kept");
    }

    #[test]
    fn test_excluded_fields_dropped() {
        let set = merge_records(vec![rec("10.1/a", 1, "a", "t")], None);
        assert!(!set.records()[0].extra.contains_key("abstract"));
    }

    #[test]
    fn test_concat_preserves_order() {
        let a = merge_records(vec![rec("10.1/z", 1, "a", "t")], None);
        let b = merge_records(vec![rec("10.1/a", 1, "a", "t")], None);
        let combined = FinalRecordSet::concat([&a, &b]);
        let dois: Vec<&str> = combined.iter().map(|r| r.doi.as_str()).collect();
        assert_eq!(dois, vec!["10.1/z", "10.1/a"]);
    }

    // ==================== Store Traversal ====================

    #[test]
    fn test_aggregate_reads_all_pages() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        let sig = QuerySignature::new(
            Server::Biorxiv,
            NaiveDate::from_ymd_opt(2021, 4, 1).unwrap(),
            NaiveDate::from_ymd_opt(2021, 4, 30).unwrap(),
            None,
        );
        let page = |page_index, records| PageResult {
            page_index,
            records,
            is_terminal: false,
            declared_total: None,
        };
        store
            .put(&sig, &page(1, vec![rec("10.1/a", 1, "a", "later page")]))
            .unwrap();
        store
            .put(
                &sig,
                &page(0, vec![rec("10.1/a", 1, "a", "earlier page"), rec("10.1/b", 1, "a", "t")]),
            )
            .unwrap();

        let set = aggregate(&store, &sig, None).unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.records()[0].title, "earlier page");
    }

    #[test]
    fn test_aggregate_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::at(dir.path().join("none"));
        let sig = QuerySignature::new(
            Server::Medrxiv,
            NaiveDate::from_ymd_opt(2021, 4, 1).unwrap(),
            NaiveDate::from_ymd_opt(2021, 4, 30).unwrap(),
            None,
        );
        assert!(aggregate(&store, &sig, None).unwrap().is_empty());
    }
}
