//! Trait seams for the external collaborators the session engine depends on. The engine only
//!  ever talks to these narrow contracts; concrete implementations (rights database, frame
//!  sorting engine, metadata store, consuming application) live outside this crate.

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use uuid::Uuid;

use crate::commands::ResponseFrame;
use crate::measurement::{Measurement, Ticks};

/// Where outbound response frames go. The publisher's client connection implements this
///  (routing to the control channel or the optional UDP data channel, applying payload
///  encryption); tests substitute a capturing mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResponseSink: Send + Sync + 'static {
    async fn send_response(&self, response: ResponseFrame) -> anyhow::Result<()>;
}

/// Resolves a connecting client to a subscriber identity and answers per-signal authorization
///  queries against externally managed rights.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuthorizationProvider: Send + Sync + 'static {
    /// Resolves the credentials presented with an `Authenticate` command, or `None` if they
    ///  are not acceptable.
    async fn authenticate(&self, connection_id: Uuid, credentials: &str) -> Option<Uuid>;

    /// Whether the given subscriber may receive the given signal.
    async fn is_authorized(&self, subscriber_id: Uuid, signal_id: Uuid) -> bool;

    /// Resolves a textual measurement key (`SOURCE:ID`) to its signal id, or `None` if no such
    ///  signal exists.
    async fn lookup_signal(&self, source: &str, id: u32) -> Option<Uuid>;
}

/// Configuration handed to a frame sorter instance; mirrors the knobs of the external
///  time-alignment engine.
#[derive(Debug, Clone)]
pub struct FrameSorterConfig {
    pub frames_per_second: u32,
    pub lag_time: f64,
    pub lead_time: f64,
    pub allow_sorts_by_arrival: bool,
    pub allow_preemptive_publishing: bool,
    pub downsampling_method: String,
    pub time_resolution: i64,
}

/// The time-alignment engine that buffers out-of-order measurements into synchronized frames.
///  Its sorting algorithm is not part of this crate; the engine is fed batches and calls back
///  once per completed frame.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameSorter: Send + Sync + 'static {
    async fn sort_measurements(&self, measurements: Vec<Measurement>);
}

/// Receives completed frames from a [FrameSorter].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FramePublisher: Send + Sync + 'static {
    async fn publish_frame(&self, timestamp: Ticks, measurements: Vec<Measurement>);
}

/// Produces the metadata payload for a `MetaDataRefresh` response. Table selection and per-row
///  filtering happen behind this seam.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetadataProvider: Send + Sync + 'static {
    async fn metadata_for(&self, subscriber_id: Option<Uuid>, filter: &str) -> anyhow::Result<Vec<u8>>;
}

/// The subscriber-side delivery callback: decoded measurements and lifecycle notifications go
///  to the consuming application through this.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MeasurementSink: Send + Sync + 'static {
    async fn on_measurements(&self, measurements: Vec<Measurement>);

    /// A metadata payload obtained via MetaDataRefresh, already decompressed.
    async fn on_metadata(&self, metadata: Vec<u8>);

    async fn on_status_message(&self, message: String);

    async fn on_processing_complete(&self, message: String);
}
