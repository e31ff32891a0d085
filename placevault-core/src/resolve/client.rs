use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{ArchiveError, Result};
use crate::feed::TokenProvider;
use crate::types::ChangedCoordinate;

/// Identity of one request slot inside a combined batch request. Results are
/// matched back to coordinates through this id, never by position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u16);

impl SlotId {
    /// GraphQL alias for the slot (`input1`, `input2`, ...).
    pub fn alias(&self) -> String {
        format!("input{}", self.0)
    }

    pub fn from_alias(alias: &str) -> Option<Self> {
        alias.strip_prefix("input")?.parse().ok().map(SlotId)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRequest {
    pub slot: SlotId,
    pub coordinate: ChangedCoordinate,
}

/// Last authored change of a coordinate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileHistory {
    pub author: String,
    pub modified_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotResult {
    Resolved(TileHistory),
    /// Upstream answered but required fields were absent.
    Missing(String),
}

/// Upstream batch lookup of tile authorship.
#[async_trait]
pub trait TileHistoryResolver: Send + Sync + fmt::Debug {
    /// One round trip for every slot. The reply may be in any order and may
    /// omit slots; omitted slots are treated as missing.
    async fn resolve(&self, slots: &[SlotRequest]) -> Result<Vec<(SlotId, SlotResult)>>;
}

const ACTION_NAME: &str = "r/replace:get_tile_history";

const SLOT_SELECTION: &str = r#"
      data {
        ... on BasicMessage {
          id
          data {
            ... on GetTileHistoryResponseMessageData {
              lastModifiedTimestamp
              userInfo {
                userID
                username
              }
            }
          }
        }
      }"#;

/// Builds the combined `pixelHistory` mutation with one aliased `act` per slot.
pub fn history_mutation(slots: impl IntoIterator<Item = SlotId>) -> String {
    let mut header = Vec::new();
    let mut body = String::new();
    for slot in slots {
        let alias = slot.alias();
        header.push(format!("${alias}: ActInput!"));
        body.push_str(&format!(
            "\n    {alias}: act(input: ${alias}) {{{SLOT_SELECTION}\n    }}"
        ));
    }
    format!("mutation pixelHistory({}) {{{body}\n}}", header.join(", "))
}

fn slot_variables(slot: &SlotRequest) -> Value {
    json!({
        "actionName": ACTION_NAME,
        "PixelMessageData": {
            "canvasIndex": slot.coordinate.partition.0,
            "colorIndex": 0,
            "coordinate": { "x": slot.coordinate.x, "y": slot.coordinate.y },
        },
    })
}

/// Extracts one slot's result from `data.<alias>.data[0].data`.
pub fn parse_slot(value: &Value) -> SlotResult {
    let message = &value["data"][0]["data"];
    let author = message["userInfo"]["username"].as_str();
    let modified = match &message["lastModifiedTimestamp"] {
        Value::Number(n) => n.as_f64().map(|f| f as i64),
        Value::String(s) => s.parse::<f64>().ok().map(|f| f as i64),
        _ => None,
    };
    match (author, modified) {
        (Some(author), Some(modified_ms)) => SlotResult::Resolved(TileHistory {
            author: author.to_string(),
            modified_ms,
        }),
        (None, _) => SlotResult::Missing("userInfo.username absent".into()),
        (_, None) => SlotResult::Missing("lastModifiedTimestamp absent".into()),
    }
}

/// GraphQL-over-HTTP resolver.
pub struct GraphqlTileHistoryResolver {
    client: reqwest::Client,
    endpoint: String,
    origin: Option<String>,
    tokens: Arc<dyn TokenProvider>,
}

impl fmt::Debug for GraphqlTileHistoryResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphqlTileHistoryResolver")
            .field("endpoint", &self.endpoint)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl GraphqlTileHistoryResolver {
    pub fn new(
        endpoint: impl Into<String>,
        origin: Option<String>,
        tokens: Arc<dyn TokenProvider>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("placevault/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            origin,
            tokens,
        })
    }
}

#[async_trait]
impl TileHistoryResolver for GraphqlTileHistoryResolver {
    async fn resolve(&self, slots: &[SlotRequest]) -> Result<Vec<(SlotId, SlotResult)>> {
        if slots.is_empty() {
            return Ok(Vec::new());
        }

        let query = history_mutation(slots.iter().map(|s| s.slot));
        let variables: serde_json::Map<String, Value> = slots
            .iter()
            .map(|s| (s.slot.alias(), slot_variables(s)))
            .collect();

        let token = self.tokens.token().await?;
        let mut request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .json(&json!({
                "operationName": "pixelHistory",
                "query": query,
                "variables": variables,
            }));
        if let Some(origin) = &self.origin {
            request = request.header(reqwest::header::ORIGIN, origin);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            if status.as_u16() == 401 {
                self.tokens.invalidate().await;
            }
            return Err(ArchiveError::HttpStatus {
                status: status.as_u16(),
                url: self.endpoint.clone(),
            });
        }

        let reply: Value = response.json().await?;
        let Some(data) = reply.get("data").and_then(Value::as_object) else {
            let errors = reply.get("errors").cloned().unwrap_or(Value::Null);
            return Err(ArchiveError::Internal(format!(
                "tile history reply carried no data: {errors}"
            )));
        };

        let results: Vec<(SlotId, SlotResult)> = data
            .iter()
            .filter_map(|(alias, value)| Some((SlotId::from_alias(alias)?, parse_slot(value))))
            .collect();
        debug!(requested = slots.len(), answered = results.len(), "tile history batch resolved");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_declares_one_alias_per_slot() {
        let query = history_mutation((1..=3).map(SlotId));
        assert!(query.starts_with(
            "mutation pixelHistory($input1: ActInput!, $input2: ActInput!, $input3: ActInput!)"
        ));
        assert!(query.contains("input3: act(input: $input3)"));
        assert!(!query.contains("input4"));
    }

    #[test]
    fn aliases_round_trip() {
        assert_eq!(SlotId(7).alias(), "input7");
        assert_eq!(SlotId::from_alias("input12"), Some(SlotId(12)));
        assert_eq!(SlotId::from_alias("other"), None);
    }

    #[test]
    fn slot_parsing_accepts_numeric_and_string_timestamps() {
        let numeric = json!({"data": [{"id": "x", "data": {
            "lastModifiedTimestamp": 1649012345678.0,
            "userInfo": {"userID": "t2_1", "username": "painter"}
        }}]});
        assert_eq!(
            parse_slot(&numeric),
            SlotResult::Resolved(TileHistory {
                author: "painter".into(),
                modified_ms: 1_649_012_345_678
            })
        );

        let text = json!({"data": [{"data": {
            "lastModifiedTimestamp": "1649012345678",
            "userInfo": {"username": "painter"}
        }}]});
        assert!(matches!(parse_slot(&text), SlotResult::Resolved(_)));
    }

    #[test]
    fn slot_without_author_is_missing() {
        let value = json!({"data": [{"data": {"lastModifiedTimestamp": 1, "userInfo": null}}]});
        assert!(matches!(parse_slot(&value), SlotResult::Missing(_)));
        assert!(matches!(parse_slot(&Value::Null), SlotResult::Missing(_)));
    }
}
