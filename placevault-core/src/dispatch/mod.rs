//! Classification of logged feed frames into configuration updates and
//! snapshot download jobs.

pub mod dispatcher;
pub mod message;

pub use dispatcher::{DispatchOutcome, Dispatcher, PartitionSource, resolve_partition};
pub use message::{Envelope, FeedMessage, FramePointerKind, decode};
