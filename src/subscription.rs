//! Per-subscriber packetization: turns the incoming measurement stream into data-packet
//!  response frames that honor the maximum packet size, the subscriber's chosen format and the
//!  base-time rotation contract. One tokio task per subscription consumes a channel, so there
//!  is never more than one packetization pass in flight and flush order matches enqueue order.
//!
//! Subscribe command payload:
//! ```ascii
//! 0: subscription flags (u8): bit 0 remotely synchronized, bit 1 compact format
//! 1: connection string length (u32 BE)
//! 5: connection string (negotiated encoding)
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::atomic_swap::AtomicValue;
use crate::buf::{put_string, try_get_string};
use crate::collaborators::ResponseSink;
use crate::commands::{DataPacketFlags, ResponseFrame, ServerCommand, ServerResponse, MAX_PACKET_SIZE};
use crate::compact::{BaseTimeOffsets, CompactCodec, FullCodec};
use crate::measurement::{now_ticks, Measurement, Ticks, TICKS_PER_SECOND};
use crate::operational_modes::OperationalEncoding;
use crate::settings::Settings;
use crate::signal_index_cache::SignalIndexCache;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
    pub struct SubscriptionFlags: u8 {
        const REMOTELY_SYNCHRONIZED = 0x01;
        const COMPACT = 0x02;
    }
}

/// The Subscribe command payload as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub flags: SubscriptionFlags,
    pub connection_string: String,
}

impl SubscribeRequest {
    pub fn ser(&self, buf: &mut BytesMut, encoding: OperationalEncoding) {
        buf.put_u8(self.flags.bits());
        put_string(buf, &self.connection_string, encoding);
    }

    pub fn deser(buf: &mut impl Buf, encoding: OperationalEncoding) -> anyhow::Result<SubscribeRequest> {
        let flags = SubscriptionFlags::from_bits_retain(buf.try_get_u8()?);
        let connection_string = try_get_string(buf, encoding)?;
        if connection_string.trim().is_empty() {
            bail!("subscribe request without a connection string");
        }
        Ok(SubscribeRequest { flags, connection_string })
    }
}

/// All knobs of one subscription, parsed out of the request's connection string.
#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    pub synchronized: bool,
    pub compact: bool,
    pub include_time: bool,
    pub use_millisecond_resolution: bool,
    pub use_base_time_offsets: bool,
    pub track_latest_measurements: bool,
    /// Flush interval in throttled mode, seconds; falls back to lag time.
    pub publish_interval: Option<f64>,
    pub lag_time: f64,
    pub lead_time: f64,
    pub filter_nan: bool,
    pub processing_interval: Option<i32>,
    pub input_keys: Vec<String>,
    pub data_channel_port: Option<u16>,
    pub start_time_constraint: Option<String>,
    pub stop_time_constraint: Option<String>,
    pub frames_per_second: Option<u32>,
}

impl SubscriptionSettings {
    pub fn from_request(request: &SubscribeRequest, publisher_allows_base_times: bool) -> anyhow::Result<SubscriptionSettings> {
        let settings = Settings::parse(&request.connection_string)?;

        let synchronized = request.flags.contains(SubscriptionFlags::REMOTELY_SYNCHRONIZED);
        let compact = request.flags.contains(SubscriptionFlags::COMPACT);

        // synchronized frames carry a frame-level timestamp, so per-measurement time is
        //  omitted regardless of what the connection string asks for
        let include_time = !synchronized && settings.get_bool("includeTime", true);

        let input_keys = settings.get("inputMeasurementKeys")
            .map(|s| s.split(';')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect())
            .unwrap_or_default();

        let data_channel_port = match settings.get_nested("dataChannel")? {
            Some(data_channel) => data_channel.get_parsed::<u16>("port")?,
            None => None,
        };

        let result = SubscriptionSettings {
            synchronized,
            compact,
            include_time,
            use_millisecond_resolution: settings.get_bool("useMillisecondResolution", false),
            use_base_time_offsets: publisher_allows_base_times
                && compact
                && include_time
                && settings.get_bool("useBaseTimeOffsets", true),
            track_latest_measurements: settings.get_bool("trackLatestMeasurements", false),
            publish_interval: settings.get_parsed("publishInterval")?,
            lag_time: settings.get_parsed("lagTime")?.unwrap_or(10.0),
            lead_time: settings.get_parsed("leadTime")?.unwrap_or(5.0),
            filter_nan: settings.get_bool("requestNaNValueFilter", false),
            processing_interval: settings.get_parsed("processingInterval")?,
            input_keys,
            data_channel_port,
            start_time_constraint: settings.get("startTimeConstraint").map(str::to_string),
            stop_time_constraint: settings.get("stopTimeConstraint").map(str::to_string),
            frames_per_second: settings.get_parsed("framesPerSecond")?,
        };
        result.validate()?;
        Ok(result)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lag_time <= 0.0 {
            bail!("lag time must be positive, was {}", self.lag_time);
        }
        if self.lead_time <= 0.0 {
            bail!("lead time must be positive, was {}", self.lead_time);
        }
        if self.synchronized && self.frames_per_second.is_none() {
            bail!("synchronized subscriptions require framesPerSecond");
        }
        Ok(())
    }

    pub fn is_temporal(&self) -> bool {
        self.start_time_constraint.is_some() || self.stop_time_constraint.is_some()
    }

    pub fn base_time_rotation_period(&self) -> Duration {
        if self.use_millisecond_resolution {
            Duration::from_secs(60)
        }
        else {
            Duration::from_secs(420)
        }
    }

    fn compact_codec(&self) -> CompactCodec {
        CompactCodec {
            include_time: self.include_time,
            use_base_time_offsets: self.use_base_time_offsets,
            use_millisecond_resolution: self.use_millisecond_resolution,
        }
    }
}

enum SubscriptionInput {
    /// Unsynchronized delivery: measurements forwarded as they arrive.
    Measurements(Vec<Measurement>),
    /// Synchronized delivery: one time-aligned frame from the frame sorter.
    Frame { timestamp: Ticks, measurements: Vec<Measurement> },
}

/// One active subscription on one connection. Created on Subscribe, replaced (never mutated)
///  when the subscriber switches synchronization mode, dropped on Unsubscribe or disconnect.
pub struct ClientSubscription {
    connection_id: Uuid,
    settings: SubscriptionSettings,
    signal_index_cache: Arc<SignalIndexCache>,
    base_times: Arc<AtomicValue<BaseTimeOffsets>>,
    input: mpsc::Sender<SubscriptionInput>,
    packetizer_task: JoinHandle<()>,
    rotation_task: Option<JoinHandle<()>>,
}

impl ClientSubscription {
    pub fn start(
        connection_id: Uuid,
        settings: SubscriptionSettings,
        signal_index_cache: Arc<SignalIndexCache>,
        encoding: OperationalEncoding,
        sink: Arc<dyn ResponseSink>,
    ) -> ClientSubscription {
        let base_times = Arc::new(AtomicValue::new());
        let (tx, rx) = mpsc::channel(1024);

        let rotation_task = if settings.use_base_time_offsets {
            Some(Self::spawn_base_time_rotation(
                connection_id,
                settings.base_time_rotation_period(),
                base_times.clone(),
                sink.clone(),
            ))
        }
        else {
            None
        };

        let packetizer = Packetizer {
            connection_id,
            settings: settings.clone(),
            signal_index_cache: signal_index_cache.clone(),
            base_times: base_times.clone(),
            encoding,
            sink,
            start_time_sent: false,
            latest_values: FxHashMap::default(),
        };
        let packetizer_task = tokio::spawn(packetizer.run(rx));

        ClientSubscription {
            connection_id,
            settings,
            signal_index_cache,
            base_times,
            input: tx,
            packetizer_task,
            rotation_task,
        }
    }

    /// Base-time offsets rotate on their own timer. The first rotation runs immediately so the
    ///  offsets are established before the first compact-timestamp-bearing packet; the
    ///  rotation push is never skipped while the subscription is active.
    fn spawn_base_time_rotation(
        connection_id: Uuid,
        period: Duration,
        base_times: Arc<AtomicValue<BaseTimeOffsets>>,
        sink: Arc<dyn ResponseSink>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;

                let rotated = match base_times.get() {
                    None => BaseTimeOffsets {
                        time_index: 0,
                        offsets: [now_ticks(), now_ticks()],
                    },
                    Some(current) => {
                        let new_index = current.time_index ^ 1;
                        let mut offsets = current.offsets;
                        offsets[new_index as usize] = now_ticks();
                        BaseTimeOffsets { time_index: new_index, offsets }
                    }
                };

                let mut payload = BytesMut::new();
                rotated.ser(&mut payload);
                base_times.set(rotated);

                trace!("rotating base time offsets for connection {}", connection_id);
                let response = ResponseFrame::new(ServerResponse::UpdateBaseTimes, ServerCommand::Subscribe, payload.to_vec());
                if let Err(e) = sink.send_response(response).await {
                    debug!("failed to push base time offsets to {}: {}", connection_id, e);
                }
            }
        })
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn settings(&self) -> &SubscriptionSettings {
        &self.settings
    }

    pub fn signal_index_cache(&self) -> &Arc<SignalIndexCache> {
        &self.signal_index_cache
    }

    pub fn base_times(&self) -> Option<Arc<BaseTimeOffsets>> {
        self.base_times.get()
    }

    /// Routes a batch of measurements into this subscription. Measurements not covered by the
    ///  signal index cache are dropped here, so callers can fan out the full stream.
    pub async fn queue_measurements(&self, measurements: Vec<Measurement>) {
        let filtered: Vec<_> = measurements.into_iter()
            .filter(|m| self.signal_index_cache.index_of(&m.signal_id).is_some())
            .filter(|m| !self.settings.filter_nan || !m.value.is_nan())
            .collect();
        if filtered.is_empty() {
            return;
        }
        if self.input.send(SubscriptionInput::Measurements(filtered)).await.is_err() {
            debug!("subscription for {} is gone, dropping measurements", self.connection_id);
        }
    }

    /// Routes one completed, time-aligned frame (synchronized subscriptions only).
    pub async fn queue_frame(&self, timestamp: Ticks, measurements: Vec<Measurement>) {
        let filtered: Vec<_> = measurements.into_iter()
            .filter(|m| self.signal_index_cache.index_of(&m.signal_id).is_some())
            .collect();
        if self.input.send(SubscriptionInput::Frame { timestamp, measurements: filtered }).await.is_err() {
            debug!("subscription for {} is gone, dropping frame", self.connection_id);
        }
    }

    pub fn stop(&self) {
        self.packetizer_task.abort();
        if let Some(rotation_task) = &self.rotation_task {
            rotation_task.abort();
        }
        self.base_times.clear();
    }
}

impl Drop for ClientSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The single consumer of a subscription's input channel.
struct Packetizer {
    connection_id: Uuid,
    settings: SubscriptionSettings,
    signal_index_cache: Arc<SignalIndexCache>,
    base_times: Arc<AtomicValue<BaseTimeOffsets>>,
    encoding: OperationalEncoding,
    sink: Arc<dyn ResponseSink>,
    start_time_sent: bool,
    latest_values: FxHashMap<Uuid, Measurement>,
}

impl Packetizer {
    async fn run(mut self, mut rx: mpsc::Receiver<SubscriptionInput>) {
        if self.settings.track_latest_measurements && !self.settings.synchronized {
            let publish_interval = self.settings.publish_interval.unwrap_or(self.settings.lag_time);
            let mut flush = tokio::time::interval(Duration::from_secs_f64(publish_interval.max(0.01)));
            flush.tick().await; // the first tick fires immediately

            loop {
                tokio::select! {
                    input = rx.recv() => {
                        match input {
                            Some(SubscriptionInput::Measurements(measurements)) => {
                                for m in measurements {
                                    self.latest_values.insert(m.signal_id, m);
                                }
                            }
                            Some(SubscriptionInput::Frame { .. }) => {
                                warn!("dropping synchronized frame queued to an unsynchronized subscription for {}", self.connection_id);
                            }
                            None => return,
                        }
                    }
                    _ = flush.tick() => {
                        self.flush_latest().await;
                    }
                }
            }
        }
        else {
            while let Some(input) = rx.recv().await {
                match input {
                    SubscriptionInput::Measurements(measurements) => {
                        self.process(measurements, None).await;
                    }
                    SubscriptionInput::Frame { timestamp, measurements } => {
                        self.process(measurements, Some(timestamp)).await;
                    }
                }
            }
        }
    }

    /// Throttled mode: publish the latest known value per signal, marking values whose most
    ///  recent sample has expired relative to real time with NaN.
    async fn flush_latest(&mut self) {
        if self.latest_values.is_empty() {
            return;
        }

        let expiry = now_ticks() - (self.settings.lag_time * TICKS_PER_SECOND as f64) as i64;
        let current: Vec<_> = self.latest_values.values()
            .map(|m| {
                let mut m = m.clone();
                if m.timestamp < expiry {
                    m.value = f64::NAN;
                }
                m
            })
            .collect();

        self.process(current, None).await;
    }

    async fn process(&mut self, measurements: Vec<Measurement>, frame_timestamp: Option<Ticks>) {
        if measurements.is_empty() {
            return;
        }

        if !self.start_time_sent {
            self.start_time_sent = true;
            let start_time = frame_timestamp.unwrap_or(measurements[0].timestamp);
            let mut payload = BytesMut::new();
            payload.put_i64(start_time);
            self.send(ResponseFrame::new(ServerResponse::DataStartTime, ServerCommand::Subscribe, payload.to_vec())).await;
        }

        let header_len = self.packet_header_len(frame_timestamp.is_some());
        let base_times = self.base_times.get();
        let compact_codec = self.settings.compact_codec();
        let full_codec = FullCodec { encoding: self.encoding };

        let mut packet: Vec<BytesMut> = Vec::new();
        let mut packet_size = header_len;

        for measurement in &measurements {
            let mut serialized = BytesMut::new();
            if self.settings.compact {
                match compact_codec.ser(measurement, &self.signal_index_cache, base_times.as_deref(), &mut serialized) {
                    Ok(()) => {}
                    Err(e) => {
                        warn!("skipping measurement for {}: {}", self.connection_id, e);
                        continue;
                    }
                }
            }
            else {
                full_codec.ser(measurement, &mut serialized);
            }

            // a single measurement that can never fit must not force out an empty packet
            if header_len + serialized.len() > MAX_PACKET_SIZE {
                warn!("skipping measurement for {}: serialized size {} exceeds the packet limit", self.connection_id, serialized.len());
                continue;
            }

            if packet_size + serialized.len() > MAX_PACKET_SIZE {
                self.flush_packet(&mut packet, frame_timestamp).await;
                packet_size = header_len;
            }

            packet_size += serialized.len();
            packet.push(serialized);
        }

        if !packet.is_empty() {
            self.flush_packet(&mut packet, frame_timestamp).await;
        }
    }

    fn packet_header_len(&self, synchronized: bool) -> usize {
        // flags byte + optional frame timestamp + measurement count
        ResponseFrame::HEADER_LEN + 1 + if synchronized { 8 } else { 0 } + 4
    }

    async fn flush_packet(&self, packet: &mut Vec<BytesMut>, frame_timestamp: Option<Ticks>) {
        let mut flags = DataPacketFlags::empty();
        flags.set(DataPacketFlags::SYNCHRONIZED, frame_timestamp.is_some());
        flags.set(DataPacketFlags::COMPACT, self.settings.compact);

        let mut payload = BytesMut::new();
        payload.put_u8(flags.bits());
        if let Some(timestamp) = frame_timestamp {
            payload.put_i64(timestamp);
        }
        payload.put_u32(packet.len() as u32);
        for serialized in packet.drain(..) {
            payload.put_slice(&serialized);
        }

        self.send(ResponseFrame::new(ServerResponse::DataPacket, ServerCommand::Subscribe, payload.to_vec())).await;
    }

    async fn send(&self, response: ResponseFrame) {
        if let Err(e) = self.sink.send_response(response).await {
            debug!("failed to send to {}: {}", self.connection_id, e);
        }
    }
}
