//! Websocket transport speaking the graphql-ws subprotocol.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header},
    },
};
use tracing::debug;

use super::token::TokenProvider;
use crate::error::{ArchiveError, Result};
use crate::types::{FeedChannel, FeedFrame, FrameKind};

pub const DEFAULT_FEED_URL: &str = "wss://gql-realtime-2.reddit.com/query";
pub const DEFAULT_FEED_ORIGIN: &str = "https://hot-potato.reddit.com";
pub const DEFAULT_TEAM_OWNER: &str = "AFD2022";

const CONFIGURATION_DOCUMENT: &str = r#"
  subscription configuration($input: SubscribeInput!) {
    subscribe(input: $input) {
      id
      ... on BasicMessage {
        data {
          __typename
          ... on ConfigurationMessageData {
            canvasConfigurations {
              index
              dx
              dy
            }
            canvasWidth
            canvasHeight
          }
        }
      }
    }
  }
"#;

const REPLACE_DOCUMENT: &str = r#"
  subscription replace($input: SubscribeInput!) {
    subscribe(input: $input) {
      id
      ... on BasicMessage {
        data {
          __typename
          ... on FullFrameMessageData {
            __typename
            name
            timestamp
          }
          ... on DiffFrameMessageData {
            __typename
            name
            currentTimestamp
            previousTimestamp
          }
        }
      }
    }
  }
"#;

/// Opens one upstream subscription per channel.
#[async_trait]
pub trait FeedTransport: Send + Sync + fmt::Debug {
    /// Connect, complete the handshake and start the channel's subscription.
    async fn connect(&self, channel: FeedChannel) -> Result<Box<dyn FeedConnection>>;
}

#[async_trait]
pub trait FeedConnection: Send {
    /// Next data frame. `None` once the peer closed the connection.
    async fn next_frame(&mut self) -> Result<Option<FeedFrame>>;
}

pub fn connection_init(token: &str) -> Value {
    json!({
        "type": "connection_init",
        "payload": { "Authorization": format!("Bearer {token}") },
    })
}

/// The `start` frame subscribing to `channel`.
pub fn start_message(channel: FeedChannel, team_owner: &str) -> Value {
    let (operation, document, input) = match channel {
        FeedChannel::Configuration => (
            "configuration",
            CONFIGURATION_DOCUMENT,
            json!({ "category": "CONFIG", "teamOwner": team_owner }),
        ),
        FeedChannel::Canvas(partition) => (
            "replace",
            REPLACE_DOCUMENT,
            json!({
                "category": "CANVAS",
                "tag": partition.0.to_string(),
                "teamOwner": team_owner,
            }),
        ),
    };
    json!({
        "id": channel.subscription_id(),
        "type": "start",
        "payload": {
            "extensions": {},
            "operationName": operation,
            "query": document,
            "variables": { "input": { "channel": input } },
        },
    })
}

fn transport_error(err: impl fmt::Display) -> ArchiveError {
    ArchiveError::Transport(err.to_string())
}

pub struct WsFeedTransport {
    url: String,
    origin: Option<String>,
    team_owner: String,
    tokens: Arc<dyn TokenProvider>,
}

impl fmt::Debug for WsFeedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsFeedTransport")
            .field("url", &self.url)
            .field("origin", &self.origin)
            .field("team_owner", &self.team_owner)
            .finish_non_exhaustive()
    }
}

impl WsFeedTransport {
    pub fn new(
        url: impl Into<String>,
        origin: Option<String>,
        team_owner: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            url: url.into(),
            origin,
            team_owner: team_owner.into(),
            tokens,
        }
    }
}

#[async_trait]
impl FeedTransport for WsFeedTransport {
    async fn connect(&self, channel: FeedChannel) -> Result<Box<dyn FeedConnection>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(transport_error)?;
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("graphql-ws"),
        );
        if let Some(origin) = &self.origin {
            request.headers_mut().insert(
                header::ORIGIN,
                HeaderValue::from_str(origin).map_err(transport_error)?,
            );
        }

        let token = self.tokens.token().await?;
        let (mut stream, _) = connect_async(request).await.map_err(transport_error)?;

        stream
            .send(Message::Text(connection_init(&token).to_string()))
            .await
            .map_err(transport_error)?;
        stream
            .send(Message::Text(
                start_message(channel, &self.team_owner).to_string(),
            ))
            .await
            .map_err(transport_error)?;
        debug!(%channel, url = %self.url, "subscription started");

        Ok(Box::new(WsFeedConnection { stream, channel }))
    }
}

struct WsFeedConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    channel: FeedChannel,
}

#[async_trait]
impl FeedConnection for WsFeedConnection {
    async fn next_frame(&mut self) -> Result<Option<FeedFrame>> {
        while let Some(message) = self.stream.next().await {
            let (kind, payload) = match message.map_err(transport_error)? {
                Message::Text(text) => (FrameKind::Text, text.into_bytes()),
                Message::Binary(bytes) => (FrameKind::Binary, bytes),
                Message::Close(_) => return Ok(None),
                // Pings are answered by tungstenite on the next read.
                _ => continue,
            };
            return Ok(Some(FeedFrame {
                channel: self.channel,
                kind,
                payload,
                received_at: Utc::now(),
            }));
        }
        Ok(None)
    }
}
