//! Bibliographic record as served by the details endpoint.
//!
//! Decoding is strict for the fields the pipeline depends on (`doi`,
//! `version`, `title`, `date`): a record missing one of them fails the whole
//! page. Fields the API adds that are not modelled here are preserved in
//! [`RawRecord::extra`], except those listed in [`EXCLUDED_FIELDS`].

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::config::Server;

/// Fields never persisted or returned (the abstract dominates record size).
pub const EXCLUDED_FIELDS: &[&str] = &["abstract"];

/// URL prefixes stripped from DOIs before comparison.
const DOI_URL_PREFIXES: &[&str] = &[
    "https://doi.org/",
    "http://doi.org/",
    "https://dx.doi.org/",
    "http://dx.doi.org/",
];

/// One preprint version as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Document identifier, the deduplication key.
    pub doi: String,
    /// Revision number; the highest wins during deduplication.
    #[serde(deserialize_with = "deserialize_version")]
    pub version: u32,
    /// Title.
    pub title: String,
    /// Semicolon separated author list.
    #[serde(default)]
    pub authors: Option<String>,
    /// Corresponding author name.
    #[serde(default, rename = "author_corresponding")]
    pub corresponding_author: Option<String>,
    /// Corresponding author institution, the affiliation filter target.
    #[serde(default, rename = "author_corresponding_institution")]
    pub corresponding_institution: Option<String>,
    /// Posting date of this version.
    pub date: NaiveDate,
    /// Article type (e.g. "new results").
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// License code.
    #[serde(default)]
    pub license: Option<String>,
    /// Subject category.
    #[serde(default)]
    pub category: Option<String>,
    /// Link to the JATS XML full text.
    #[serde(default)]
    pub jatsxml: Option<String>,
    /// Journal DOI once published, "NA" otherwise.
    #[serde(default)]
    pub published: Option<String>,
    /// Server name as reported by the API.
    #[serde(default)]
    pub server: Option<String>,
    /// First funder name.
    #[serde(default, deserialize_with = "deserialize_funder")]
    pub funder: Option<String>,
    /// Server this record was harvested from.
    #[serde(default)]
    pub source_server: Option<Server>,
    /// Any other field sent by the API.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RawRecord {
    /// DOI in canonical comparison form.
    #[must_use]
    pub fn normalized_doi(&self) -> String {
        normalize_doi(&self.doi)
    }

    /// Resolver link for this record.
    #[must_use]
    pub fn doi_url(&self) -> String {
        format!("https://doi.org/{}", self.doi.trim())
    }

    /// Removes every field listed in [`EXCLUDED_FIELDS`].
    pub fn strip_excluded(&mut self) {
        for field in EXCLUDED_FIELDS {
            self.extra.remove(*field);
        }
    }
}

/// Canonical DOI form: trimmed, resolver prefix removed, lowercase.
#[must_use]
pub fn normalize_doi(doi: &str) -> String {
    let mut doi = doi.trim();
    for prefix in DOI_URL_PREFIXES {
        if let Some(stripped) = doi.strip_prefix(prefix) {
            doi = stripped;
            break;
        }
    }
    if doi.len() >= 4 && doi.is_char_boundary(4) && doi[..4].eq_ignore_ascii_case("doi:") {
        doi = doi[4..].trim_start();
    }
    doi.trim().to_lowercase()
}

/// Canonical affiliation form: surrounding whitespace trimmed, case folded.
///
/// Inner whitespace is left untouched, so matching stays exact apart from
/// case and padding.
#[must_use]
pub fn normalize_affiliation(affiliation: &str) -> String {
    affiliation.trim().to_lowercase()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(u64),
    Text(String),
}

fn deserialize_version<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(n) => u32::try_from(n).map_err(serde::de::Error::custom),
        NumberOrText::Text(s) => s
            .trim()
            .parse::<u32>()
            .map_err(|_| serde::de::Error::custom(format!("invalid version '{s}'"))),
    }
}

#[derive(Deserialize)]
struct FunderEntry {
    name: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FunderField {
    Name(String),
    List(Vec<FunderEntry>),
}

fn deserialize_funder<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        match Option::<FunderField>::deserialize(deserializer)? {
            None => None,
            Some(FunderField::Name(name)) => Some(name),
            Some(FunderField::List(entries)) => entries.into_iter().next().map(|f| f.name),
        },
    )
}
