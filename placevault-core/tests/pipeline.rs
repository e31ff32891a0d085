//! End-to-end run of the archiver against stub upstreams and in-memory
//! backends: feed frame -> download -> diff -> batch resolution -> history.

use std::{collections::HashMap, io::Cursor, sync::Arc, time::Duration};

use async_trait::async_trait;
use image::{ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;

use placevault_core::{
    ArchiveContext, ArchivePorts, ArchiverConfig, ArchiverRuntime, Result,
    download::SnapshotFetcher,
    feed::{FeedConnection, FeedTransport},
    jobs::{JobEvent, JobKind},
    persist::PixelHistoryRepository,
    resolve::{BatchConfig, PendingCoordinates, SlotId, SlotRequest, SlotResult, TileHistory, TileHistoryResolver},
    types::{FeedChannel, FeedFrame, PartitionId},
};

const SNAPSHOT_URL: &str = "https://cdn.example/canvas/0/diff-1.png";

/// Each channel emits its scripted frames once, then goes quiet.
#[derive(Debug, Default)]
struct ScriptedTransport {
    scripts: HashMap<FeedChannel, Vec<String>>,
    connects: Mutex<Vec<FeedChannel>>,
}

struct ScriptedConnection {
    channel: FeedChannel,
    frames: Vec<String>,
}

#[async_trait]
impl FeedConnection for ScriptedConnection {
    async fn next_frame(&mut self) -> Result<Option<FeedFrame>> {
        if self.frames.is_empty() {
            return std::future::pending().await;
        }
        let payload = self.frames.remove(0);
        Ok(Some(FeedFrame::text(self.channel, payload)))
    }
}

#[async_trait]
impl FeedTransport for ScriptedTransport {
    async fn connect(&self, channel: FeedChannel) -> Result<Box<dyn FeedConnection>> {
        self.connects.lock().push(channel);
        Ok(Box::new(ScriptedConnection {
            channel,
            frames: self.scripts.get(&channel).cloned().unwrap_or_default(),
        }))
    }
}

#[derive(Debug)]
struct PngFetcher {
    bytes: Vec<u8>,
}

#[async_trait]
impl SnapshotFetcher for PngFetcher {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>> {
        Ok(self.bytes.clone())
    }
}

/// Answers every slot with an author derived from the coordinate, in
/// reverse order.
#[derive(Debug, Default)]
struct EchoResolver {
    calls: Mutex<Vec<usize>>,
}

#[async_trait]
impl TileHistoryResolver for EchoResolver {
    async fn resolve(&self, slots: &[SlotRequest]) -> Result<Vec<(SlotId, SlotResult)>> {
        self.calls.lock().push(slots.len());
        Ok(slots
            .iter()
            .rev()
            .map(|s| {
                (
                    s.slot,
                    SlotResult::Resolved(TileHistory {
                        author: format!("user-{}", s.coordinate.x),
                        modified_ms: 1_649_000_000_000 + i64::from(s.coordinate.x),
                    }),
                )
            })
            .collect())
    }
}

fn diff_png(changed: u32) -> Vec<u8> {
    let mut img = RgbaImage::new(100, 100);
    for x in 0..changed {
        img.put_pixel(x, 7, Rgba([0, 0, 0, 255]));
    }
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).expect("encode png");
    buf.into_inner()
}

fn scripted_feed() -> ScriptedTransport {
    let config = r#"{"type":"data","id":"1","payload":{"data":{"subscribe":{"data":{
        "__typename":"ConfigurationMessageData",
        "canvasConfigurations":[{"index":0},{"index":1}]}}}}}"#;
    let diff = format!(
        r#"{{"type":"data","id":"2","payload":{{"data":{{"subscribe":{{"data":{{"__typename":"DiffFrameMessageData","name":"{SNAPSHOT_URL}"}}}}}}}}}}"#
    );
    let mut scripts = HashMap::new();
    scripts.insert(
        FeedChannel::Configuration,
        vec![r#"{"type":"connection_ack"}"#.to_string(), config.to_string()],
    );
    scripts.insert(
        FeedChannel::Canvas(PartitionId(0)),
        vec![r#"{"type":"ka"}"#.to_string(), diff],
    );
    ScriptedTransport {
        scripts,
        connects: Mutex::new(Vec::new()),
    }
}

fn fast_config() -> ArchiverConfig {
    ArchiverConfig {
        worker_count: 4,
        batch: BatchConfig {
            batch_size: 8,
            poll_interval: Duration::from_millis(10),
            partial_wait: Duration::from_millis(50),
        },
        ..ArchiverConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn diff_frame_ends_up_in_pixel_history() {
    let transport = Arc::new(scripted_feed());
    let resolver = Arc::new(EchoResolver::default());
    let config = fast_config();
    let ports = ArchivePorts::in_memory(
        config.policies,
        transport.clone(),
        Arc::new(PngFetcher { bytes: diff_png(10) }),
        resolver.clone(),
    );
    let context = Arc::new(ArchiveContext::new(config, ports).expect("valid context"));
    let mut events = context.events().subscribe();

    let runtime = ArchiverRuntime::start(Arc::clone(&context))
        .await
        .expect("runtime starts");

    let mut persisted = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while persisted < 10 {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("pipeline finished in time")
            .expect("event bus open");
        match event {
            JobEvent::Completed { kind: JobKind::PersistPixel, .. } => persisted += 1,
            JobEvent::DeadLettered { kind, error, .. } => panic!("{kind} dead-lettered: {error}"),
            _ => {}
        }
    }

    let pixels = &context.ports().pixels;
    assert_eq!(pixels.count().await.expect("count"), 10);

    // One full batch of 8, then the two leftovers one at a time.
    let mut calls = resolver.calls.lock().clone();
    calls.sort_unstable();
    assert_eq!(calls, vec![1, 1, 8]);

    assert_eq!(
        runtime.subscriptions().active_partitions(),
        vec![PartitionId(0), PartitionId(1)]
    );
    assert_eq!(context.tracker().current(), Some(PartitionId(1)));

    runtime.shutdown().await;

    let connects = transport.connects.lock().clone();
    assert_eq!(connects.len(), 3, "one connect per channel: {connects:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_frames_above_cutoff_persist_nothing() {
    let transport = Arc::new(scripted_feed());
    let resolver = Arc::new(EchoResolver::default());
    let config = ArchiverConfig {
        anomaly_threshold: 5,
        ..fast_config()
    };
    let ports = ArchivePorts::in_memory(
        config.policies,
        transport,
        Arc::new(PngFetcher { bytes: diff_png(10) }),
        resolver.clone(),
    );
    let context = Arc::new(ArchiveContext::new(config, ports).expect("valid context"));
    let mut events = context.events().subscribe();
    let runtime = ArchiverRuntime::start(Arc::clone(&context))
        .await
        .expect("runtime starts");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("diff ran in time")
            .expect("event bus open");
        if let JobEvent::Completed { kind: JobKind::DiffSnapshot, .. } = event {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(resolver.calls.lock().is_empty());
    assert_eq!(context.ports().pixels.count().await.expect("count"), 0);
    assert_eq!(context.ports().pending.len().await.expect("len"), 0);

    runtime.shutdown().await;
}
