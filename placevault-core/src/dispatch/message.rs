//! Decoding of raw feed frames into typed messages.
//!
//! Data frames arrive in one of two envelope shapes: the direct
//! `{"subscribe": {"data": ...}}` form and the graphql-ws
//! `{"payload": {"data": {"subscribe": {"data": ...}}}}` form. The direct
//! shape is tried first. The inner object is discriminated by `__typename`.

use serde::Deserialize;
use serde_json::Value;

use crate::types::PartitionId;

#[derive(Debug, Deserialize)]
struct CanvasConfiguration {
    index: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "__typename")]
enum SubscribeData {
    ConfigurationMessageData {
        #[serde(rename = "canvasConfigurations", default)]
        canvas_configurations: Vec<CanvasConfiguration>,
    },
    FullFrameMessageData {
        name: String,
    },
    DiffFrameMessageData {
        name: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramePointerKind {
    Full,
    Diff,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedMessage {
    /// `ka`, `connection_ack`, `complete` and friends.
    Control(String),
    Configuration {
        max_index: PartitionId,
    },
    FramePointer {
        kind: FramePointerKind,
        url: String,
    },
    Unrecognized(String),
}

/// A decoded frame plus the envelope fields used to place it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Subscription id the upstream echoed back (`"id"`).
    pub subscription_id: Option<u32>,
    /// Explicit partition tag carried by the envelope (`"canvas_id"`).
    pub canvas_id: Option<PartitionId>,
    pub message: FeedMessage,
}

const CONTROL_TYPES: &[&str] = &[
    "ka",
    "connection_ack",
    "complete",
    "connection_error",
    "error",
    "stop",
];

fn number_or_string(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn subscribe_data(root: &Value) -> Option<&Value> {
    root.pointer("/subscribe/data")
        .or_else(|| root.pointer("/payload/data/subscribe/data"))
}

pub fn decode(payload: &[u8]) -> Envelope {
    let unrecognized = |reason: String| Envelope {
        subscription_id: None,
        canvas_id: None,
        message: FeedMessage::Unrecognized(reason),
    };

    let root: Value = match serde_json::from_slice(payload) {
        Ok(root) => root,
        Err(err) => return unrecognized(format!("not JSON: {err}")),
    };

    let subscription_id = root.get("id").and_then(number_or_string);
    let canvas_id = root
        .get("canvas_id")
        .and_then(number_or_string)
        .map(PartitionId);
    let envelope = |message| Envelope {
        subscription_id,
        canvas_id,
        message,
    };

    if let Some(kind) = root.get("type").and_then(Value::as_str)
        && CONTROL_TYPES.contains(&kind)
    {
        return envelope(FeedMessage::Control(kind.to_string()));
    }

    let Some(data) = subscribe_data(&root) else {
        return envelope(FeedMessage::Unrecognized(
            "neither envelope shape carries subscribe.data".into(),
        ));
    };

    let message = match SubscribeData::deserialize(data) {
        Ok(SubscribeData::ConfigurationMessageData {
            canvas_configurations,
        }) => FeedMessage::Configuration {
            max_index: PartitionId(
                canvas_configurations
                    .iter()
                    .map(|c| c.index)
                    .max()
                    .unwrap_or(0),
            ),
        },
        Ok(SubscribeData::FullFrameMessageData { name }) => FeedMessage::FramePointer {
            kind: FramePointerKind::Full,
            url: name,
        },
        Ok(SubscribeData::DiffFrameMessageData { name }) => FeedMessage::FramePointer {
            kind: FramePointerKind::Diff,
            url: name,
        },
        Err(err) => {
            let typename = data
                .get("__typename")
                .and_then(Value::as_str)
                .unwrap_or("<none>");
            FeedMessage::Unrecognized(format!("unhandled data `{typename}`: {err}"))
        }
    };
    envelope(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_is_control() {
        let envelope = decode(br#"{"type":"ka"}"#);
        assert_eq!(envelope.message, FeedMessage::Control("ka".into()));
    }

    #[test]
    fn nested_diff_frame_is_a_pointer() {
        let raw = br#"{"type":"data","id":"3","payload":{"data":{"subscribe":{"id":"x","data":{
            "__typename":"DiffFrameMessageData",
            "name":"https://hot-potato.reddit.com/media/canvas-images/1.png",
            "currentTimestamp":1,"previousTimestamp":0}}}}}"#;
        let envelope = decode(raw);
        assert_eq!(envelope.subscription_id, Some(3));
        assert_eq!(
            envelope.message,
            FeedMessage::FramePointer {
                kind: FramePointerKind::Diff,
                url: "https://hot-potato.reddit.com/media/canvas-images/1.png".into()
            }
        );
    }

    #[test]
    fn direct_shape_wins_over_nested() {
        let raw = br#"{"canvas_id":4,
            "subscribe":{"data":{"__typename":"FullFrameMessageData","name":"direct","timestamp":1}},
            "payload":{"data":{"subscribe":{"data":{"__typename":"FullFrameMessageData","name":"nested"}}}}}"#;
        let envelope = decode(raw);
        assert_eq!(envelope.canvas_id, Some(PartitionId(4)));
        assert!(matches!(
            envelope.message,
            FeedMessage::FramePointer { kind: FramePointerKind::Full, ref url } if url == "direct"
        ));
    }

    #[test]
    fn configuration_reports_highest_index() {
        let raw = br#"{"type":"data","id":"1","payload":{"data":{"subscribe":{"data":{
            "__typename":"ConfigurationMessageData",
            "canvasConfigurations":[{"index":0,"dx":0,"dy":0},{"index":3,"dx":1000,"dy":1000},{"index":1,"dx":1000,"dy":0}]}}}}}"#;
        assert_eq!(
            decode(raw).message,
            FeedMessage::Configuration {
                max_index: PartitionId(3)
            }
        );
    }

    #[test]
    fn unknown_shapes_are_unrecognized() {
        assert!(matches!(decode(b"garbage").message, FeedMessage::Unrecognized(_)));
        assert!(matches!(
            decode(br#"{"type":"data","payload":{}}"#).message,
            FeedMessage::Unrecognized(_)
        ));
        assert!(matches!(
            decode(br#"{"subscribe":{"data":{"__typename":"Other"}}}"#).message,
            FeedMessage::Unrecognized(_)
        ));
    }
}
