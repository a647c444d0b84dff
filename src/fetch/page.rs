//! Page addressing and strict decoding of details endpoint responses.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};

use super::RequestError;
use crate::config::Server;
use crate::record::RawRecord;

/// Status string of a message block describing a served page.
const STATUS_OK: &str = "ok";

/// Everything that identifies a page except its index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    /// Server queried.
    pub server: Server,
    /// First day of the window.
    pub start_date: NaiveDate,
    /// Last day of the window.
    pub end_date: NaiveDate,
    /// Records per page.
    pub page_size: u32,
}

impl PageQuery {
    /// Request for page `page_index` of this query.
    #[must_use]
    pub fn request(&self, page_index: u64) -> PageRequest {
        PageRequest {
            server: self.server,
            start_date: self.start_date,
            end_date: self.end_date,
            page_index,
            page_size: self.page_size,
        }
    }
}

/// One page of the remote result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Server queried.
    pub server: Server,
    /// First day of the window.
    pub start_date: NaiveDate,
    /// Last day of the window.
    pub end_date: NaiveDate,
    /// Zero-based page index.
    pub page_index: u64,
    /// Records per page.
    pub page_size: u32,
}

impl PageRequest {
    /// Offset into the remote result set: `page_index × page_size`.
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.page_index * u64::from(self.page_size)
    }
}

/// A successfully fetched and decoded page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    /// Zero-based page index.
    pub page_index: u64,
    /// Records in API order, excluded fields already stripped.
    pub records: Vec<RawRecord>,
    /// No further pages exist after this one.
    pub is_terminal: bool,
    /// Total the API declared for the whole window, if any.
    pub declared_total: Option<u64>,
}

impl PageResult {
    /// Decodes a response body for `request`.
    ///
    /// The page is terminal when it holds fewer than `page_size` records or
    /// when `cursor + count` reaches the declared total. A message block with
    /// a status other than `ok` and no records (the API's "no posts found")
    /// is an empty terminal page.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Decode`] when the body does not match the
    /// response schema and [`RequestError::Malformed`] when it contradicts
    /// the request.
    pub fn decode(request: &PageRequest, url: &str, body: &[u8]) -> Result<Self, RequestError> {
        let response: ApiResponse =
            serde_json::from_slice(body).map_err(|e| RequestError::decode(url, e))?;

        let Some(message) = response.messages.into_iter().next() else {
            return Err(RequestError::malformed(url, "response has no message block"));
        };

        if message.status != STATUS_OK {
            if response.collection.is_empty() {
                return Ok(Self {
                    page_index: request.page_index,
                    records: Vec::new(),
                    is_terminal: true,
                    declared_total: message.total,
                });
            }
            return Err(RequestError::malformed(
                url,
                format!(
                    "status '{}' with {} records",
                    message.status,
                    response.collection.len()
                ),
            ));
        }

        let cursor = message
            .cursor
            .ok_or_else(|| RequestError::malformed(url, "message block has no cursor"))?;
        if cursor != request.cursor() {
            return Err(RequestError::malformed(
                url,
                format!("cursor echo {cursor}, expected {}", request.cursor()),
            ));
        }

        let count = message
            .count
            .ok_or_else(|| RequestError::malformed(url, "message block has no count"))?;
        let returned = response.collection.len() as u64;
        if count != returned {
            return Err(RequestError::malformed(
                url,
                format!("declared count {count}, collection holds {returned}"),
            ));
        }

        let is_terminal = count < u64::from(request.page_size)
            || message.total.is_some_and(|total| cursor + count >= total);

        let records = response
            .collection
            .into_iter()
            .map(|mut record| {
                record.strip_excluded();
                record.source_server = Some(request.server);
                record
            })
            .collect();

        Ok(Self {
            page_index: request.page_index,
            records,
            is_terminal,
            declared_total: message.total,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    messages: Vec<ApiMessage>,
    collection: Vec<RawRecord>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    status: String,
    #[serde(default, deserialize_with = "deserialize_count")]
    cursor: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_count")]
    count: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_count")]
    total: Option<u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Count {
    Number(u64),
    Text(String),
}

fn deserialize_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Count>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Count::Number(n)) => Ok(Some(n)),
        Some(Count::Text(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid count '{s}'"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    const URL: &str = "https://api.biorxiv.org/details/biorxiv/2020-01-01/2020-01-31/0";

    fn query(page_size: u32) -> PageQuery {
        PageQuery {
            server: Server::Biorxiv,
            start_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2020, 1, 31).unwrap(),
            page_size,
        }
    }

    fn record(n: u64) -> Value {
        json!({
            "doi": format!("10.1101/2020.01.{n:06}"),
            "title": format!("Paper {n}"),
            "date": "2020-01-15",
            "version": "1",
            "author_corresponding_institution": "Institut Pasteur",
            "abstract": "text"
        })
    }

    fn body(cursor: Value, count: usize, total: Option<Value>) -> Vec<u8> {
        let mut message = json!({"status": "ok", "cursor": cursor, "count": count});
        if let Some(total) = total {
            message["total"] = total;
        }
        let collection: Vec<Value> = (0..count as u64).map(record).collect();
        serde_json::to_vec(&json!({"messages": [message], "collection": collection})).unwrap()
    }

    #[test]
    fn test_cursor_is_index_times_page_size() {
        assert_eq!(query(100).request(0).cursor(), 0);
        assert_eq!(query(100).request(3).cursor(), 300);
        assert_eq!(query(25).request(2).cursor(), 50);
    }

    #[test]
    fn test_decode_full_page_not_terminal() {
        let request = query(100).request(0);
        let page = PageResult::decode(&request, URL, &body(json!(0), 100, None)).unwrap();
        assert_eq!(page.records.len(), 100);
        assert!(!page.is_terminal);
        assert_eq!(page.page_index, 0);
    }

    #[test]
    fn test_decode_short_page_terminal() {
        let request = query(100).request(1);
        let page = PageResult::decode(&request, URL, &body(json!("100"), 37, Some(json!("137"))))
            .unwrap();
        assert_eq!(page.records.len(), 37);
        assert!(page.is_terminal);
        assert_eq!(page.declared_total, Some(137));
    }

    #[test]
    fn test_decode_full_page_reaching_total_terminal() {
        let request = query(10).request(1);
        let page = PageResult::decode(&request, URL, &body(json!(10), 10, Some(json!(20)))).unwrap();
        assert!(page.is_terminal);
    }

    #[test]
    fn test_decode_stamps_source_and_strips_abstract() {
        let request = query(100).request(0);
        let page = PageResult::decode(&request, URL, &body(json!(0), 3, None)).unwrap();
        for record in &page.records {
            assert_eq!(record.source_server, Some(Server::Biorxiv));
            assert!(!record.extra.contains_key("abstract"));
        }
    }

    #[test]
    fn test_decode_no_posts_found_is_empty_terminal() {
        let request = query(100).request(5);
        let body = serde_json::to_vec(&json!({
            "messages": [{"status": "no posts found"}],
            "collection": []
        }))
        .unwrap();
        let page = PageResult::decode(&request, URL, &body).unwrap();
        assert!(page.records.is_empty());
        assert!(page.is_terminal);
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        let request = query(100).request(0);
        let err = PageResult::decode(&request, URL, b"<html>busy</html>").unwrap_err();
        assert!(matches!(err, RequestError::Decode { .. }));
    }

    #[test]
    fn test_decode_rejects_missing_collection() {
        let request = query(100).request(0);
        let body = serde_json::to_vec(&json!({"messages": [{"status": "ok"}]})).unwrap();
        let err = PageResult::decode(&request, URL, &body).unwrap_err();
        assert!(matches!(err, RequestError::Decode { .. }));
    }

    #[test]
    fn test_decode_rejects_cursor_mismatch() {
        let request = query(100).request(2);
        let err = PageResult::decode(&request, URL, &body(json!(0), 5, None)).unwrap_err();
        assert!(matches!(err, RequestError::Malformed { .. }));
    }

    #[test]
    fn test_decode_rejects_count_mismatch() {
        let request = query(100).request(0);
        let body = serde_json::to_vec(&json!({
            "messages": [{"status": "ok", "cursor": 0, "count": 5}],
            "collection": [record(1)]
        }))
        .unwrap();
        let err = PageResult::decode(&request, URL, &body).unwrap_err();
        assert!(matches!(err, RequestError::Malformed { .. }));
    }

    #[test]
    fn test_decode_rejects_missing_message_block() {
        let request = query(100).request(0);
        let body = serde_json::to_vec(&json!({"messages": [], "collection": []})).unwrap();
        let err = PageResult::decode(&request, URL, &body).unwrap_err();
        assert!(matches!(err, RequestError::Malformed { .. }));
    }
}
