use std::{
    collections::{BTreeMap, VecDeque},
    path::Path,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use futures::{pin_mut, stream, Stream, TryStreamExt};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    Client,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::SearchConfig,
    error::{Error, Result},
    http,
};

/// How long the server keeps a scroll cursor alive between batches.
pub const SCROLL_KEEP_ALIVE: &str = "2m";
/// Documents requested per scroll batch.
pub const SCROLL_BATCH_SIZE: usize = 1000;
/// `dump_hits` logs progress every this many documents.
pub const PROGRESS_INTERVAL: usize = 1000;

/// A boolean query where every wildcard clause must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WildcardQuery {
    clauses: Vec<(String, String)>,
}

impl WildcardQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn must(mut self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.clauses.push((field.into(), pattern.into()));
        self
    }

    /// Parses `field=pattern`.
    pub fn parse_clause(clause: &str) -> Result<(String, String)> {
        match clause.split_once('=') {
            Some((field, pattern)) if !field.is_empty() && !pattern.is_empty() => {
                Ok((field.to_string(), pattern.to_string()))
            }
            _ => Err(Error::InvalidArgument(format!(
                "wildcard clause {clause:?} is not of the form field=pattern"
            ))),
        }
    }

    pub fn to_body(&self) -> Value {
        let must: Vec<Value> = self
            .clauses
            .iter()
            .map(|(field, pattern)| json!({ "wildcard": { field: pattern } }))
            .collect();
        json!({ "query": { "bool": { "must": must } } })
    }
}

/// A single document returned by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    /// The full hit as returned by the server (`_id`, `_index`, `_source`, ...).
    pub body: Value,
}

impl Hit {
    fn from_value(body: Value) -> Result<Self> {
        let id = body
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::IncompleteReference("search hit without an _id".into()))?
            .to_string();
        Ok(Self { id, body })
    }
}

#[derive(Debug, Deserialize)]
struct ScrollResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    hits: Vec<Value>,
}

struct ScanState {
    index: String,
    body: Value,
    scroll_id: Option<String>,
    buffer: VecDeque<Hit>,
    started: bool,
    done: bool,
}

/// Client for the document search index.
pub struct SearchClient {
    server: String,
    client: Client,
}

impl SearchClient {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let token = STANDARD.encode(format!("{}:{}", config.api_id, config.api_key));
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("ApiKey {token}"))
                .map_err(|_| Error::Config("api key contains invalid characters".into()))?,
        );
        if config.transport.accept_invalid_certs {
            warn!("certificate verification disabled for {}", config.server);
        }

        Ok(Self {
            server: config.server.trim_end_matches('/').to_string(),
            client: http::build_client(&config.transport, headers)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.server, path.trim_start_matches('/'))
    }

    /// Names of every index visible to the api key.
    #[instrument(skip_all)]
    pub async fn list_indices(&self) -> Result<Vec<String>> {
        let aliases: BTreeMap<String, Value> =
            http::read_json(self.client.get(self.url("_alias")).send().await?).await?;
        Ok(aliases.into_keys().collect())
    }

    /// Streams every document in `index` matching `query` using a scroll cursor.
    ///
    /// The stream ends when the server returns an empty batch. Any error ends the scan.
    pub fn scan<'a>(
        &'a self,
        query: &WildcardQuery,
        index: &str,
    ) -> impl Stream<Item = Result<Hit>> + 'a {
        let mut body = query.to_body();
        body["size"] = json!(SCROLL_BATCH_SIZE);
        let state = ScanState {
            index: index.to_string(),
            body,
            scroll_id: None,
            buffer: VecDeque::new(),
            started: false,
            done: false,
        };

        stream::try_unfold(state, move |state| self.step(state))
    }

    async fn step(&self, mut state: ScanState) -> Result<Option<(Hit, ScanState)>> {
        loop {
            if let Some(hit) = state.buffer.pop_front() {
                return Ok(Some((hit, state)));
            }
            if state.done {
                return Ok(None);
            }

            let batch = self.next_batch(&mut state).await?;
            if batch.is_empty() {
                state.done = true;
                if let Some(scroll_id) = state.scroll_id.take() {
                    self.clear_scroll(&scroll_id).await;
                }
                return Ok(None);
            }
            debug!(count = batch.len(), "received scroll batch");
            state.buffer = batch
                .into_iter()
                .map(Hit::from_value)
                .collect::<Result<_>>()?;
        }
    }

    async fn next_batch(&self, state: &mut ScanState) -> Result<Vec<Value>> {
        let request = if !state.started {
            state.started = true;
            self.client
                .post(self.url(&format!("{}/_search", state.index)))
                .query(&[("scroll", SCROLL_KEEP_ALIVE)])
                .json(&state.body)
        } else {
            let scroll_id = state.scroll_id.clone().ok_or_else(|| {
                Error::IncompleteReference("server did not return a scroll id".into())
            })?;
            self.client
                .post(self.url("_search/scroll"))
                .json(&json!({ "scroll": SCROLL_KEEP_ALIVE, "scroll_id": scroll_id }))
        };

        let resp: ScrollResponse = http::read_json(request.send().await?).await?;
        if resp.scroll_id.is_some() {
            state.scroll_id = resp.scroll_id;
        }
        Ok(resp.hits.hits)
    }

    async fn clear_scroll(&self, scroll_id: &str) {
        let result = match self
            .client
            .delete(self.url("_search/scroll"))
            .json(&json!({ "scroll_id": [scroll_id] }))
            .send()
            .await
        {
            Ok(resp) => http::ensure_success(resp).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("failed to clear scroll cursor: {e}");
        }
    }
}

fn file_name_for(id: &str) -> String {
    format!("{}.json", id.replace(['/', '\\'], "_"))
}

/// Writes every hit to `<dir>/<id>.json`, returning how many were written.
///
/// Files already written stay in place when the stream fails.
#[instrument(skip(hits))]
pub async fn dump_hits(hits: impl Stream<Item = Result<Hit>>, dir: &Path) -> Result<usize> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::file(dir, e))?;

    pin_mut!(hits);
    let mut count = 0;
    while let Some(hit) = hits.try_next().await? {
        let path = dir.join(file_name_for(&hit.id));
        let contents = serde_json::to_vec_pretty(&hit.body)?;
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| Error::file(&path, e))?;

        count += 1;
        if count % PROGRESS_INTERVAL == 0 {
            info!("up to {count} docs...");
        }
    }
    info!("total: {count} docs");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::Transport;
    use httpmock::prelude::*;
    use tempdir::TempDir;

    fn client(server: &MockServer) -> SearchClient {
        SearchClient::new(&SearchConfig {
            server: server.base_url(),
            api_id: "id".into(),
            api_key: "key".into(),
            transport: Transport::default(),
        })
        .unwrap()
    }

    fn hits(range: std::ops::Range<usize>) -> Vec<Value> {
        range
            .map(|i| {
                json!({
                    "_index": "brca_synth",
                    "_id": format!("doc-{i}"),
                    "_source": {"text": format!("breast brca note {i}")}
                })
            })
            .collect()
    }

    #[test]
    fn query_body_has_bool_must_shape() {
        let query = WildcardQuery::new()
            .must("text", "*brca*")
            .must("text", "*breast*");
        assert_eq!(
            query.to_body(),
            json!({"query": {"bool": {"must": [
                {"wildcard": {"text": "*brca*"}},
                {"wildcard": {"text": "*breast*"}}
            ]}}})
        );
    }

    #[test]
    fn clause_parsing_rejects_missing_pattern() {
        assert_eq!(
            WildcardQuery::parse_clause("text=*brca*").unwrap(),
            ("text".to_string(), "*brca*".to_string())
        );
        assert!(WildcardQuery::parse_clause("text=").is_err());
        assert!(WildcardQuery::parse_clause("text").is_err());
    }

    #[test]
    fn ids_never_escape_the_output_dir() {
        assert_eq!(file_name_for("a/b"), "a_b.json");
        assert_eq!(file_name_for("plain"), "plain.json");
    }

    #[tokio::test]
    async fn scan_writes_every_document_across_batches() {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method(POST)
                .path("/brca_synth/_search")
                .query_param("scroll", SCROLL_KEEP_ALIVE)
                .header("authorization", format!("ApiKey {}", STANDARD.encode("id:key")));
            then.status(200)
                .json_body(json!({"_scroll_id": "alpha", "hits": {"hits": hits(0..1000)}}));
        });
        let second = server.mock(|when, then| {
            when.method(POST)
                .path("/_search/scroll")
                .body_contains("\"alpha\"");
            then.status(200)
                .json_body(json!({"_scroll_id": "bravo", "hits": {"hits": hits(1000..2000)}}));
        });
        let third = server.mock(|when, then| {
            when.method(POST)
                .path("/_search/scroll")
                .body_contains("\"bravo\"");
            then.status(200)
                .json_body(json!({"_scroll_id": "charlie", "hits": {"hits": hits(2000..2500)}}));
        });
        let last = server.mock(|when, then| {
            when.method(POST)
                .path("/_search/scroll")
                .body_contains("\"charlie\"");
            then.status(200)
                .json_body(json!({"_scroll_id": "charlie", "hits": {"hits": []}}));
        });
        let clear = server.mock(|when, then| {
            when.method(DELETE).path("/_search/scroll");
            then.status(200).json_body(json!({"succeeded": true}));
        });

        let client = client(&server);
        let query = WildcardQuery::new()
            .must("text", "*brca*")
            .must("text", "*breast*");
        let dir = TempDir::new("search-dump").unwrap();

        let count = dump_hits(client.scan(&query, "brca_synth"), dir.path())
            .await
            .unwrap();

        assert_eq!(count, 2500);
        let files: HashSet<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files.len(), 2500);
        assert!(files.contains("doc-0.json"));
        assert!(files.contains("doc-2499.json"));

        let stored: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("doc-42.json")).unwrap())
                .unwrap();
        assert_eq!(stored["_source"]["text"], "breast brca note 42");

        first.assert();
        second.assert();
        third.assert();
        last.assert();
        clear.assert();
    }

    #[tokio::test]
    async fn scan_error_keeps_partial_output() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/notes/_search");
            then.status(200)
                .json_body(json!({"_scroll_id": "alpha", "hits": {"hits": hits(0..3)}}));
        });
        server.mock(|when, then| {
            when.method(POST).path("/_search/scroll");
            then.status(500).body("shard failure");
        });

        let client = client(&server);
        let dir = TempDir::new("search-partial").unwrap();
        let err = dump_hits(
            client.scan(&WildcardQuery::new().must("text", "*x*"), "notes"),
            dir.path(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status(), Some(500));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[tokio::test]
    async fn lists_indices_sorted() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/_alias");
            then.status(200)
                .json_body(json!({"notes": {"aliases": {}}, "brca_synth": {"aliases": {}}}));
        });

        let indices = client(&server).list_indices().await.unwrap();
        assert_eq!(indices, vec!["brca_synth".to_string(), "notes".to_string()]);
    }
}
