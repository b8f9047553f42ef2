//! The subscribing side of the protocol: connect cycle, command sending, response decoding
//!  and the data-loss watchdog that tears a silent session down and reconnects.
//!
//! Session state (signal index cache, base-time offsets, cipher keys) is scoped to one
//!  connect cycle; a reconnect starts from scratch and the publisher pushes fresh state after
//!  the subscription is re-established.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::bail;
use bytes::{Buf, BytesMut};
use flate2::read::GzDecoder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::atomic_swap::AtomicValue;
use crate::buf::put_string;
use crate::cipher::{CipherKeySet, PayloadCipher};
use crate::collaborators::{FrameSorter, MeasurementSink};
use crate::commands::{CommandFrame, DataPacketFlags, ResponseFrame, ServerCommand, ServerResponse};
use crate::config::SubscriberConfig;
use crate::compact::{BaseTimeOffsets, CompactCodec, FullCodec};
use crate::measurement::Measurement;
use crate::signal_index_cache::SignalIndexCache;
use crate::subscription::{SubscribeRequest, SubscriptionFlags, SubscriptionSettings};

const MAX_RESPONSE_LEN: u32 = 32 * 1024 * 1024;

pub struct DataSubscriber {
    config: SubscriberConfig,
    sink: Arc<dyn MeasurementSink>,
    /// Local time-alignment fallback used when the publisher refuses remotely synchronized
    ///  subscriptions.
    local_sorter: Option<Arc<dyn FrameSorter>>,
    /// The subscription to (re)establish on every successful connect; shared with the live
    ///  session for auto-subscription after authentication.
    subscribe_request: Arc<AtomicValue<SubscribeRequest>>,
    /// Command channel of the current session; absent while disconnected.
    command_tx: AtomicValue<mpsc::Sender<CommandFrame>>,
    stopping: Arc<AtomicBool>,
    cycle_task: Mutex<Option<JoinHandle<()>>>,
}

impl DataSubscriber {
    pub fn new(
        config: SubscriberConfig,
        sink: Arc<dyn MeasurementSink>,
        local_sorter: Option<Arc<dyn FrameSorter>>,
    ) -> anyhow::Result<DataSubscriber> {
        config.validate()?;
        Ok(DataSubscriber {
            config,
            sink,
            local_sorter,
            subscribe_request: Arc::new(AtomicValue::new()),
            command_tx: AtomicValue::new(),
            stopping: Arc::new(AtomicBool::new(false)),
            cycle_task: Mutex::new(None),
        })
    }

    /// Starts the connect cycle: connect, negotiate, pump responses, reconnect on failure
    ///  until [DataSubscriber::stop].
    pub fn start(self: &Arc<DataSubscriber>) {
        let subscriber = self.clone();
        let task = tokio::spawn(async move {
            loop {
                if subscriber.stopping.load(Ordering::Acquire) {
                    return;
                }
                match subscriber.run_session().await {
                    Ok(()) => info!("session to {} ended", subscriber.config.server_addr),
                    Err(e) => warn!("session to {} failed: {}", subscriber.config.server_addr, e),
                }
                subscriber.command_tx.clear();
                if subscriber.stopping.load(Ordering::Acquire) {
                    return;
                }
                debug!("reconnecting in {:?}", subscriber.config.reconnect_delay);
                tokio::time::sleep(subscriber.config.reconnect_delay).await;
            }
        });
        *self.cycle_task.lock().unwrap() = Some(task);
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        if let Some(task) = self.cycle_task.lock().unwrap().take() {
            task.abort();
        }
        self.command_tx.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.command_tx.get().is_some()
    }

    /// Stores the subscription and establishes it on the live session (if any); it is also
    ///  re-established automatically after every reconnect.
    pub async fn subscribe(&self, request: SubscribeRequest) -> anyhow::Result<()> {
        // parsed eagerly so a malformed connection string fails here, not mid-session
        SubscriptionSettings::from_request(&request, true)?;
        self.subscribe_request.set(request.clone());

        if let Some(tx) = self.command_tx.get() {
            let mut payload = BytesMut::new();
            request.ser(&mut payload, self.config.operational_modes.encoding());
            Self::send_on(&tx, CommandFrame::new(ServerCommand::Subscribe, payload.to_vec())).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe(&self) -> anyhow::Result<()> {
        self.subscribe_request.clear();
        self.send_command(ServerCommand::Unsubscribe, vec![]).await
    }

    pub async fn refresh_metadata(&self, filter: &str) -> anyhow::Result<()> {
        let payload = if filter.is_empty() {
            vec![]
        }
        else {
            let mut buf = BytesMut::new();
            put_string(&mut buf, filter, self.config.operational_modes.encoding());
            buf.to_vec()
        };
        self.send_command(ServerCommand::MetaDataRefresh, payload).await
    }

    pub async fn request_cipher_key_rotation(&self) -> anyhow::Result<()> {
        self.send_command(ServerCommand::RotateCipherKeys, vec![]).await
    }

    pub async fn update_processing_interval(&self, interval: i32) -> anyhow::Result<()> {
        self.send_command(ServerCommand::UpdateProcessingInterval, interval.to_be_bytes().to_vec()).await
    }

    async fn send_command(&self, command: ServerCommand, payload: Vec<u8>) -> anyhow::Result<()> {
        let Some(tx) = self.command_tx.get() else {
            bail!("not connected");
        };
        Self::send_on(&tx, CommandFrame::new(command, payload)).await
    }

    async fn send_on(tx: &mpsc::Sender<CommandFrame>, frame: CommandFrame) -> anyhow::Result<()> {
        if tx.send(frame).await.is_err() {
            bail!("session ended while sending command");
        }
        Ok(())
    }

    async fn run_session(self: &Arc<DataSubscriber>) -> anyhow::Result<()> {
        info!("connecting to publisher at {}", self.config.server_addr);
        let stream = TcpStream::connect(self.config.server_addr).await?;
        let (mut read_half, write_half) = stream.into_split();

        let (command_tx, command_rx) = mpsc::channel::<CommandFrame>(64);
        let state = Arc::new(SessionState::new(
            self.config.clone(),
            self.sink.clone(),
            self.local_sorter.clone(),
            self.subscribe_request.clone(),
            command_tx.clone(),
        ));

        let writer_task = tokio::spawn(Self::command_writer(state.clone(), write_half, command_rx));
        self.command_tx.set(command_tx.clone());

        // negotiation first; everything after depends on the modes being known server-side
        let modes = self.config.operational_modes;
        Self::send_on(&command_tx, CommandFrame::new(ServerCommand::DefineOperationalModes, modes.0.to_be_bytes().to_vec())).await?;

        if let Some(credentials) = &self.config.credentials {
            let mut payload = BytesMut::new();
            put_string(&mut payload, credentials, modes.encoding());
            Self::send_on(&command_tx, CommandFrame::new(ServerCommand::Authenticate, payload.to_vec())).await?;
        }
        else if let Some(request) = self.subscribe_request.get() {
            let mut payload = BytesMut::new();
            request.ser(&mut payload, modes.encoding());
            Self::send_on(&command_tx, CommandFrame::new(ServerCommand::Subscribe, payload.to_vec())).await?;
        }

        let result = self.control_read_loop(&state, &mut read_half).await;

        state.stop_data_channel();
        writer_task.abort();
        self.command_tx.clear();
        result
    }

    async fn command_writer(
        state: Arc<SessionState>,
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::Receiver<CommandFrame>,
    ) {
        while let Some(frame) = rx.recv().await {
            // a requested UDP channel must be listening before the publisher learns of the
            //  subscription, otherwise the first packets land on a closed port
            if frame.command == ServerCommand::Subscribe {
                if let Err(e) = state.ensure_data_channel().await {
                    warn!("failed to start data channel: {}", e);
                }
            }

            // registered before the bytes leave so the response can never race the bookkeeping
            state.pending.lock().unwrap().push(frame.command);

            let mut serialized = BytesMut::new();
            frame.ser(&mut serialized);
            let mut message = BytesMut::with_capacity(4 + serialized.len());
            message.extend_from_slice(&(serialized.len() as u32).to_be_bytes());
            message.extend_from_slice(&serialized);

            if let Err(e) = write_half.write_all(&message).await {
                debug!("command write failed: {}", e);
                return;
            }
        }
    }

    async fn control_read_loop(&self, state: &Arc<SessionState>, read_half: &mut OwnedReadHalf) -> anyhow::Result<()> {
        // fires only while subscribed with nothing received on either channel for a full
        //  interval; cancelling the in-flight read is fine then because the session ends
        let watchdog = async {
            let mut interval = tokio::time::interval(self.config.data_loss_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if state.subscribed.load(Ordering::Acquire)
                    && state.since_last_activity() >= self.config.data_loss_interval
                {
                    return;
                }
            }
        };
        tokio::pin!(watchdog);

        loop {
            tokio::select! {
                frame = Self::read_frame(read_half) => {
                    let response = frame?;
                    state.touch();
                    state.handle_response(response).await;
                }
                _ = &mut watchdog => {
                    bail!(
                        "no data received in {:?} - restarting connection cycle",
                        self.config.data_loss_interval
                    );
                }
            }
        }
    }

    async fn read_frame(read_half: &mut OwnedReadHalf) -> anyhow::Result<ResponseFrame> {
        let len = read_half.read_u32().await?;
        if len == 0 || len > MAX_RESPONSE_LEN {
            bail!("implausible message length {}", len);
        }
        let mut payload = vec![0u8; len as usize];
        read_half.read_exact(&mut payload).await?;
        let mut buf: &[u8] = &payload;
        ResponseFrame::deser(&mut buf)
    }
}

impl Drop for DataSubscriber {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::Release);
        if let Some(task) = self.cycle_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Everything one connect cycle accumulates. Dropped wholesale on disconnect.
struct SessionState {
    config: SubscriberConfig,
    sink: Arc<dyn MeasurementSink>,
    local_sorter: Option<Arc<dyn FrameSorter>>,
    subscribe_request: Arc<AtomicValue<SubscribeRequest>>,
    command_tx: mpsc::Sender<CommandFrame>,
    pending: Mutex<Vec<ServerCommand>>,
    cache: AtomicValue<SignalIndexCache>,
    base_times: AtomicValue<BaseTimeOffsets>,
    cipher_keys: AtomicValue<CipherKeySet>,
    payload_cipher: PayloadCipher,
    /// Settings of the active subscription, set when Subscribe is acknowledged.
    settings: AtomicValue<SubscriptionSettings>,
    subscribed: AtomicBool,
    /// Set when a synchronized request was downgraded and frames are aligned locally.
    local_sorting: AtomicBool,
    /// Receive task of the UDP data channel plus the port it is bound to; started lazily by
    ///  the first Subscribe that asks for one, replaced when a later Subscribe names a
    ///  different port.
    udp_task: Mutex<Option<(u16, JoinHandle<()>)>>,
    created: Instant,
    last_activity_millis: AtomicU64,
    last_missing_cache_warning: Mutex<Option<Instant>>,
}

impl SessionState {
    fn new(
        config: SubscriberConfig,
        sink: Arc<dyn MeasurementSink>,
        local_sorter: Option<Arc<dyn FrameSorter>>,
        subscribe_request: Arc<AtomicValue<SubscribeRequest>>,
        command_tx: mpsc::Sender<CommandFrame>,
    ) -> SessionState {
        SessionState {
            config,
            sink,
            local_sorter,
            subscribe_request,
            command_tx,
            pending: Mutex::new(Vec::new()),
            cache: AtomicValue::new(),
            base_times: AtomicValue::new(),
            cipher_keys: AtomicValue::new(),
            payload_cipher: PayloadCipher::new(),
            settings: AtomicValue::new(),
            subscribed: AtomicBool::new(false),
            local_sorting: AtomicBool::new(false),
            udp_task: Mutex::new(None),
            created: Instant::now(),
            last_activity_millis: AtomicU64::new(0),
            last_missing_cache_warning: Mutex::new(None),
        }
    }

    /// Binds the UDP data channel named in the stored subscribe request (if any) and pumps
    ///  its datagrams through the same response handling as the control channel. A no-op when
    ///  the requested port is already bound, so re-subscribing keeps the running task.
    async fn ensure_data_channel(self: &Arc<SessionState>) -> anyhow::Result<()> {
        let Some(request) = self.subscribe_request.get() else {
            return Ok(());
        };
        let settings = SubscriptionSettings::from_request(&request, true)?;
        let Some(port) = settings.data_channel_port else {
            self.stop_data_channel();
            return Ok(());
        };

        // not held across the bind; a concurrent Subscribe for the same session is impossible
        //  because all frames flow through the single command writer
        if matches!(&*self.udp_task.lock().unwrap(), Some((bound, _)) if *bound == port) {
            return Ok(());
        }

        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        info!("data channel listening on UDP port {}", port);

        let state = self.clone();
        let task = tokio::spawn(async move {
            let mut datagram = vec![0u8; 65_536];
            loop {
                match socket.recv(&mut datagram).await {
                    Ok(len) => {
                        state.touch();
                        let mut buf: &[u8] = &datagram[..len];
                        match ResponseFrame::deser(&mut buf) {
                            Ok(response) => state.handle_response(response).await,
                            Err(e) => warn!("dropping malformed data channel frame: {}", e),
                        }
                    }
                    Err(e) => {
                        debug!("data channel receive failed: {}", e);
                        return;
                    }
                }
            }
        });

        if let Some((_, previous)) = self.udp_task.lock().unwrap().replace((port, task)) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_data_channel(&self) {
        if let Some((_, task)) = self.udp_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn touch(&self) {
        let millis = self.created.elapsed().as_millis() as u64;
        self.last_activity_millis.store(millis, Ordering::Release);
    }

    fn since_last_activity(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_millis.load(Ordering::Acquire));
        self.created.elapsed().saturating_sub(last)
    }

    /// Removes the pending-command entry, returning whether the response was solicited.
    fn take_pending(&self, command: ServerCommand) -> bool {
        let mut pending = self.pending.lock().unwrap();
        match pending.iter().position(|c| *c == command) {
            Some(i) => {
                pending.remove(i);
                true
            }
            None => false,
        }
    }

    async fn handle_response(&self, response: ResponseFrame) {
        match response.response {
            ServerResponse::Succeeded => self.handle_succeeded(response).await,
            ServerResponse::Failed => self.handle_failed(response).await,
            ServerResponse::DataPacket => {
                match self.decode_data_packet(&response.payload) {
                    Ok(Some(measurements)) => self.deliver(measurements).await,
                    Ok(None) => {} // skipped, cache not yet held
                    Err(e) => warn!("failed to decode data packet: {}", e),
                }
            }
            ServerResponse::UpdateSignalIndexCache => {
                match SignalIndexCache::deser(&response.payload, self.config.operational_modes) {
                    Ok(cache) => {
                        info!("signal index cache updated: {} signals, {} unauthorized", cache.len(), cache.unauthorized().len());
                        self.cache.set(cache);
                    }
                    Err(e) => warn!("failed to decode signal index cache: {}", e),
                }
            }
            ServerResponse::UpdateBaseTimes => {
                let mut buf: &[u8] = &response.payload;
                match BaseTimeOffsets::deser(&mut buf) {
                    Ok(base_times) => {
                        debug!("base time offsets updated, active index {}", base_times.time_index);
                        self.base_times.set(base_times);
                    }
                    Err(e) => warn!("failed to decode base time offsets: {}", e),
                }
            }
            ServerResponse::UpdateCipherKeys => {
                let mut buf: &[u8] = &response.payload;
                match CipherKeySet::deser(&mut buf) {
                    Ok(keys) => {
                        info!("cipher keys updated, active index {}", keys.cipher_index);
                        self.cipher_keys.set(keys);
                    }
                    Err(e) => warn!("failed to decode cipher keys: {}", e),
                }
            }
            ServerResponse::DataStartTime => {
                let mut buf: &[u8] = &response.payload;
                if let Ok(start_time) = buf.try_get_i64() {
                    self.sink.on_status_message(format!("data start time {}", start_time)).await;
                }
            }
            ServerResponse::ProcessingComplete => {
                let message = self.decode_message(&response.payload);
                self.subscribed.store(false, Ordering::Release);
                self.sink.on_processing_complete(message).await;
            }
            ServerResponse::NoOp => {}
        }
    }

    async fn handle_succeeded(&self, response: ResponseFrame) {
        let Ok(command) = ServerCommand::try_from(response.in_response_to) else {
            warn!("Succeeded response for unknown command code 0x{:02x}, ignoring", response.in_response_to);
            return;
        };
        let solicited = self.take_pending(command);

        // a publisher may push metadata or a key rotation on its own initiative
        let legitimately_unsolicited = matches!(command, ServerCommand::MetaDataRefresh | ServerCommand::RotateCipherKeys);
        if !solicited && !legitimately_unsolicited {
            warn!("unsolicited Succeeded for {:?}, ignoring", command);
            return;
        }

        match command {
            ServerCommand::Authenticate => {
                info!("authenticated with publisher");
                self.sink.on_status_message(self.decode_message(&response.payload)).await;
                // authentication unblocks the stored auto-subscription
                if self.subscribe_request.get().is_some() {
                    self.send_subscribe().await;
                }
            }
            ServerCommand::Subscribe => {
                if let Some(request) = self.subscribe_request.get() {
                    match SubscriptionSettings::from_request(&request, true) {
                        Ok(settings) => self.settings.set(settings),
                        Err(e) => warn!("cannot derive subscription settings: {}", e),
                    }
                }
                self.subscribed.store(true, Ordering::Release);
                self.sink.on_status_message(self.decode_message(&response.payload)).await;
            }
            ServerCommand::Unsubscribe => {
                self.subscribed.store(false, Ordering::Release);
                self.sink.on_status_message(self.decode_message(&response.payload)).await;
            }
            ServerCommand::MetaDataRefresh => {
                match self.decompress_metadata(response.payload) {
                    Ok(metadata) => self.sink.on_metadata(metadata).await,
                    Err(e) => warn!("failed to decompress metadata: {}", e),
                }
            }
            _ => {
                debug!("{:?} acknowledged", command);
            }
        }
    }

    async fn handle_failed(&self, response: ResponseFrame) {
        let Ok(command) = ServerCommand::try_from(response.in_response_to) else {
            warn!("Failed response for unknown command code 0x{:02x}, ignoring", response.in_response_to);
            return;
        };
        if !self.take_pending(command) {
            warn!("unsolicited Failed for {:?}, ignoring", command);
            return;
        }

        let message = self.decode_message(&response.payload);
        warn!("{:?} failed: {}", command, message);
        self.sink.on_status_message(format!("{:?} failed: {}", command, message)).await;

        // a refused synchronized subscription falls back to sorting frames locally
        if command == ServerCommand::Subscribe && self.local_sorter.is_some() && !self.local_sorting.load(Ordering::Acquire) {
            if let Some(request) = self.subscribe_request.get() {
                if request.flags.contains(SubscriptionFlags::REMOTELY_SYNCHRONIZED) {
                    info!("publisher refused remote synchronization, falling back to local frame sorting");
                    let downgraded = SubscribeRequest {
                        flags: request.flags & !SubscriptionFlags::REMOTELY_SYNCHRONIZED,
                        connection_string: request.connection_string.clone(),
                    };
                    self.subscribe_request.set(downgraded);
                    self.local_sorting.store(true, Ordering::Release);
                    self.send_subscribe().await;
                }
            }
        }
    }

    async fn send_subscribe(&self) {
        let Some(request) = self.subscribe_request.get() else {
            return;
        };
        let mut payload = BytesMut::new();
        request.ser(&mut payload, self.config.operational_modes.encoding());
        let frame = CommandFrame::new(ServerCommand::Subscribe, payload.to_vec());
        if self.command_tx.send(frame).await.is_err() {
            debug!("session ended before the subscribe command could be sent");
        }
    }

    fn decode_message(&self, payload: &[u8]) -> String {
        self.config
            .operational_modes
            .encoding()
            .decode_str(payload)
            .unwrap_or_else(|_| String::from_utf8_lossy(payload).into_owned())
    }

    fn decompress_metadata(&self, payload: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        let modes = self.config.operational_modes;
        if modes.compress_metadata() && modes.gzip_compression() {
            let mut decompressed = Vec::new();
            std::io::Read::read_to_end(&mut GzDecoder::new(&payload[..]), &mut decompressed)?;
            Ok(decompressed)
        }
        else {
            Ok(payload)
        }
    }

    /// `Ok(None)` means the packet had to be skipped because no signal index cache is held
    ///  yet; that happens legitimately right after (re)subscribing.
    fn decode_data_packet(&self, payload: &[u8]) -> anyhow::Result<Option<Vec<Measurement>>> {
        if payload.is_empty() {
            bail!("empty data packet");
        }
        let flags = DataPacketFlags::from_bits_retain(payload[0]);

        let decrypted;
        let mut buf: &[u8] = match self.cipher_keys.get() {
            Some(keys) => {
                let pair = keys.pair(flags.contains(DataPacketFlags::CIPHER_INDEX));
                decrypted = self.payload_cipher.decrypt(pair, &payload[1..])?;
                &decrypted
            }
            None => &payload[1..],
        };

        let frame_timestamp = if flags.contains(DataPacketFlags::SYNCHRONIZED) {
            Some(buf.try_get_i64()?)
        }
        else {
            None
        };
        let count = buf.try_get_u32()?;

        let settings = self.settings.get();
        let compact = flags.contains(DataPacketFlags::COMPACT);

        if compact && self.cache.get().is_none() {
            self.warn_missing_cache();
            return Ok(None);
        }

        let compact_codec = CompactCodec {
            include_time: settings.as_deref().map(|s| s.include_time).unwrap_or(true),
            use_base_time_offsets: settings.as_deref().map(|s| s.use_base_time_offsets).unwrap_or(false),
            use_millisecond_resolution: settings.as_deref().map(|s| s.use_millisecond_resolution).unwrap_or(false),
        };
        let full_codec = FullCodec { encoding: self.config.operational_modes.encoding() };
        let cache = self.cache.get();
        let base_times = self.base_times.get();

        let mut measurements = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let measurement = if compact {
                let Some(cache) = cache.as_deref() else {
                    bail!("signal index cache vanished mid-decode");
                };
                compact_codec.deser(&mut buf, cache, base_times.as_deref(), frame_timestamp)?
            }
            else {
                full_codec.deser(&mut buf)?
            };
            measurements.push(measurement);
        }
        Ok(Some(measurements))
    }

    fn warn_missing_cache(&self) {
        let mut last = self.last_missing_cache_warning.lock().unwrap();
        let due = match *last {
            None => true,
            Some(at) => at.elapsed() >= self.config.missing_cache_warning_interval,
        };
        if due {
            warn!("skipping compact data packet: no signal index cache received yet");
            *last = Some(Instant::now());
        }
    }

    async fn deliver(&self, measurements: Vec<Measurement>) {
        if self.local_sorting.load(Ordering::Acquire) {
            if let Some(sorter) = &self.local_sorter {
                sorter.sort_measurements(measurements).await;
                return;
            }
        }
        self.sink.on_measurements(measurements).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MockAuthorizationProvider, MockMeasurementSink, MockMetadataProvider};
    use crate::config::PublisherConfig;
    use crate::measurement::MeasurementKey;
    use crate::operational_modes::OperationalModes;
    use crate::publisher::DataPublisher;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    const SIGNAL_1: Uuid = Uuid::from_u128(0xaaaa_aaaa_aaaa_aaaa_aaaa_aaaa_aaaa_aaaa);

    async fn started_publisher() -> (Arc<DataPublisher>, SocketAddr) {
        let mut auth = MockAuthorizationProvider::new();
        auth.expect_authenticate().returning(|_, _| Some(Uuid::new_v4()));
        auth.expect_lookup_signal().returning(|source, id| {
            if source == "PPA" && id == 1 { Some(SIGNAL_1) } else { None }
        });
        auth.expect_is_authorized().returning(|_, _| true);

        let mut metadata = MockMetadataProvider::new();
        metadata.expect_metadata_for().returning(|_, _| Ok(b"device,signal".to_vec()));

        let mut config = PublisherConfig::default();
        config.bind_addr = "127.0.0.1:0".parse().unwrap();
        let publisher = Arc::new(DataPublisher::new(config, Arc::new(auth), Arc::new(metadata)).unwrap());
        let addr = publisher.start().await.unwrap();
        (publisher, addr)
    }

    struct Captured {
        measurements: Mutex<Vec<Measurement>>,
        statuses: Mutex<Vec<String>>,
        metadata: Mutex<Vec<Vec<u8>>>,
    }

    fn capturing_sink() -> (Arc<MockMeasurementSink>, Arc<Captured>) {
        let captured = Arc::new(Captured {
            measurements: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
            metadata: Mutex::new(Vec::new()),
        });

        let mut sink = MockMeasurementSink::new();
        let c = captured.clone();
        sink.expect_on_measurements().returning(move |m| {
            c.measurements.lock().unwrap().extend(m);
        });
        let c = captured.clone();
        sink.expect_on_status_message().returning(move |s| {
            c.statuses.lock().unwrap().push(s);
        });
        let c = captured.clone();
        sink.expect_on_metadata().returning(move |m| {
            c.metadata.lock().unwrap().push(m);
        });
        sink.expect_on_processing_complete().returning(|_| {});
        (Arc::new(sink), captured)
    }

    fn compact_request(connection_string: &str) -> SubscribeRequest {
        SubscribeRequest {
            flags: SubscriptionFlags::COMPACT,
            connection_string: connection_string.to_string(),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached within 5s");
    }

    #[tokio::test]
    async fn test_end_to_end_subscribe_and_receive() {
        let (publisher, addr) = started_publisher().await;
        let (sink, captured) = capturing_sink();

        let subscriber = Arc::new(DataSubscriber::new(SubscriberConfig::new(addr), sink, None).unwrap());
        subscriber.subscribe(compact_request("inputMeasurementKeys=PPA:1;useBaseTimeOffsets=false")).await.unwrap();
        subscriber.start();

        wait_until(|| {
            captured.statuses.lock().unwrap().iter().any(|s| s.contains("subscribed"))
        }).await;

        let m = Measurement::new(SIGNAL_1, MeasurementKey::new("PPA", 1), 99.5, 638_100_000_000_000_000);
        publisher.publish_measurements(vec![m]).await;

        wait_until(|| !captured.measurements.lock().unwrap().is_empty()).await;

        let received = captured.measurements.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].signal_id, SIGNAL_1);
        assert_eq!(received[0].key, MeasurementKey::new("PPA", 1));
        assert_eq!(received[0].value, 99.5f32 as f64);
        assert_eq!(received[0].timestamp, 638_100_000_000_000_000);
        drop(received);

        subscriber.stop();
        publisher.stop();
    }

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_mid_session_subscribe_starts_data_channel() {
        let (publisher, addr) = started_publisher().await;
        let (sink, captured) = capturing_sink();

        // connect without a stored subscription; the data channel must come up when the
        //  subscription is established later in the session
        let subscriber = Arc::new(DataSubscriber::new(SubscriberConfig::new(addr), sink, None).unwrap());
        subscriber.start();
        wait_until(|| subscriber.is_connected()).await;

        let connection_string = format!(
            "inputMeasurementKeys=PPA:1;useBaseTimeOffsets=false;dataChannel={{port={}}}",
            free_udp_port()
        );
        subscriber.subscribe(compact_request(&connection_string)).await.unwrap();

        wait_until(|| {
            captured.statuses.lock().unwrap().iter().any(|s| s.contains("subscribed"))
        }).await;

        let m = Measurement::new(SIGNAL_1, MeasurementKey::new("PPA", 1), 7.25, 638_200_000_000_000_000);
        publisher.publish_measurements(vec![m]).await;

        // arrives over UDP; the publisher routes data packets to the negotiated channel
        wait_until(|| !captured.measurements.lock().unwrap().is_empty()).await;
        let received = captured.measurements.lock().unwrap();
        assert_eq!(received[0].signal_id, SIGNAL_1);
        assert_eq!(received[0].value, 7.25f32 as f64);
        drop(received);

        subscriber.stop();
        publisher.stop();
    }

    #[tokio::test]
    async fn test_metadata_refresh_delivered_to_sink() {
        let (publisher, addr) = started_publisher().await;
        let (sink, captured) = capturing_sink();

        let subscriber = Arc::new(DataSubscriber::new(SubscriberConfig::new(addr), sink, None).unwrap());
        subscriber.start();
        wait_until(|| subscriber.is_connected()).await;

        subscriber.refresh_metadata("").await.unwrap();
        wait_until(|| !captured.metadata.lock().unwrap().is_empty()).await;
        assert_eq!(captured.metadata.lock().unwrap()[0], b"device,signal");

        subscriber.stop();
        publisher.stop();
    }

    #[tokio::test]
    async fn test_rejected_subscribe_reported_as_status() {
        let (publisher, addr) = started_publisher().await;
        let (sink, captured) = capturing_sink();

        let subscriber = Arc::new(DataSubscriber::new(SubscriberConfig::new(addr), sink, None).unwrap());
        // PPA:9 does not resolve to any signal, so the publisher rejects the subscription
        subscriber.subscribe(compact_request("inputMeasurementKeys=PPA:9")).await.unwrap();
        subscriber.start();

        wait_until(|| {
            captured.statuses.lock().unwrap().iter().any(|s| s.contains("Subscribe failed"))
        }).await;

        subscriber.stop();
        publisher.stop();
    }

    /// Minimal scripted publisher: acknowledges every command, pushes nothing else, then goes
    ///  silent, so the data-loss watchdog must restart the connect cycle.
    async fn silent_fake_server(connect_count: Arc<AtomicUsize>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                connect_count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    loop {
                        let Ok(len) = stream.read_u32().await else { return };
                        let mut payload = vec![0u8; len as usize];
                        if stream.read_exact(&mut payload).await.is_err() {
                            return;
                        }
                        let mut buf: &[u8] = &payload;
                        let Ok(frame) = CommandFrame::deser(&mut buf) else { return };

                        let response = ResponseFrame::new(ServerResponse::Succeeded, frame.command, vec![]);
                        let mut serialized = BytesMut::new();
                        response.ser(&mut serialized);
                        if stream.write_u32(serialized.len() as u32).await.is_err()
                            || stream.write_all(&serialized).await.is_err()
                        {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_data_loss_restarts_connect_cycle() {
        let connect_count = Arc::new(AtomicUsize::new(0));
        let addr = silent_fake_server(connect_count.clone()).await;

        let (sink, _captured) = capturing_sink();
        let mut config = SubscriberConfig::new(addr);
        config.data_loss_interval = Duration::from_millis(200);
        config.reconnect_delay = Duration::from_millis(50);

        let subscriber = Arc::new(DataSubscriber::new(config, sink, None).unwrap());
        subscriber.subscribe(compact_request("inputMeasurementKeys=PPA:1;useBaseTimeOffsets=false")).await.unwrap();
        subscriber.start();

        // the fake server acknowledges the subscription but never sends data, so the watchdog
        //  must tear the session down and reconnect, repeatedly
        wait_until(|| connect_count.load(Ordering::SeqCst) >= 2).await;

        subscriber.stop();
    }
}
