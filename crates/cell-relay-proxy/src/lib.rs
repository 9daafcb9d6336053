//! Message proxy and stream summarizer for wrapped execution engines.
//!
//! Provides:
//! - `Relay` - Forward requests, transform and persist streamed output
//! - `StreamSummarizer` - Live truncation of long output streams
//! - Per-channel reader tasks feeding one coordinator

mod reader;
pub mod router;
pub mod summarize;

pub use router::{Relay, RelayError, RelayOptions};
pub use summarize::{FragmentAction, StreamSummarizer};
