//! The publishing side of the protocol: accepts control-channel connections, dispatches
//!  command frames, negotiates subscriptions and fans the measurement stream out to them.
//!
//! Each accepted connection gets a read task and a writer task; everything else the
//!  connection owns (subscription packetizer, base-time rotation) hangs off the registry and
//!  is torn down by a background task when the read task ends.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use bytes::{Buf, BytesMut};
use flate2::write::GzEncoder;
use flate2::Compression;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buf::try_get_string;
use crate::collaborators::{AuthorizationProvider, FramePublisher, MetadataProvider, ResponseSink};
use crate::commands::{CommandFrame, ResponseFrame, ServerCommand, ServerResponse};
use crate::config::PublisherConfig;
use crate::connection::{ClientConnection, ConnectionRegistry, DataChannel};
use crate::measurement::{Measurement, MeasurementKey, Ticks};
use crate::operational_modes::OperationalModes;
use crate::signal_index_cache::{SignalIndexCache, SignalReference};
use crate::subscription::{ClientSubscription, SubscribeRequest, SubscriptionSettings};

/// Sanity bound for inbound transport messages; a single command never comes close.
const MAX_COMMAND_LEN: u32 = 1024 * 1024;

/// Snapshot of one connection for the administrative surface.
#[derive(Debug, Clone)]
pub struct SubscriberStatus {
    pub connection_id: Uuid,
    pub remote_addr: SocketAddr,
    pub subscriber_id: Option<Uuid>,
    pub authenticated: bool,
    pub subscribed: bool,
    pub signal_count: usize,
}

pub struct DataPublisher {
    config: PublisherConfig,
    authorization: Arc<dyn AuthorizationProvider>,
    metadata: Arc<dyn MetadataProvider>,
    registry: ConnectionRegistry,
    /// Serializes subscription setup/teardown so routing never observes a half-built state.
    subscribe_lock: tokio::sync::Mutex<()>,
    /// Last value per signal, kept for subscriptions that ask for tracked latest values.
    latest_values: Mutex<FxHashMap<Uuid, Measurement>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DataPublisher {
    pub fn new(
        config: PublisherConfig,
        authorization: Arc<dyn AuthorizationProvider>,
        metadata: Arc<dyn MetadataProvider>,
    ) -> anyhow::Result<DataPublisher> {
        config.validate()?;
        Ok(DataPublisher {
            config,
            authorization,
            metadata,
            registry: ConnectionRegistry::new(),
            subscribe_lock: tokio::sync::Mutex::new(()),
            latest_values: Mutex::new(FxHashMap::default()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Binds the control channel and starts the accept loop plus the cipher rotation timer.
    ///  Returns the actual listen address (relevant when binding port 0).
    pub async fn start(self: &Arc<DataPublisher>) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("listening for subscribers on {}", local_addr);

        let publisher = self.clone();
        let accept_task = tokio::spawn(async move { publisher.accept_loop(listener).await });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(accept_task);

        if self.config.encrypt_payload {
            let publisher = self.clone();
            tasks.push(tokio::spawn(async move { publisher.cipher_rotation_loop().await }));
        }

        Ok(local_addr)
    }

    /// Aborts all background tasks and tears down every live connection.
    pub fn stop(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        for connection in self.registry.snapshot() {
            self.registry.deregister(connection.connection_id());
            connection.disconnect();
        }
        info!("publisher stopped");
    }

    async fn accept_loop(self: Arc<DataPublisher>, mut listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    let publisher = self.clone();
                    tokio::spawn(async move { publisher.handle_connection(stream, remote_addr).await });
                }
                Err(e) => {
                    // the listener itself broke; resurrect it after the configured delay
                    warn!("accept loop stopped: {} - restarting in {:?}", e, self.config.restart_delay);
                    tokio::time::sleep(self.config.restart_delay).await;
                    loop {
                        match TcpListener::bind(self.config.bind_addr).await {
                            Ok(l) => {
                                info!("listener restarted on {}", self.config.bind_addr);
                                listener = l;
                                break;
                            }
                            Err(e) => {
                                warn!("listener restart failed: {} - retrying in {:?}", e, self.config.restart_delay);
                                tokio::time::sleep(self.config.restart_delay).await;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(self: Arc<DataPublisher>, stream: TcpStream, remote_addr: SocketAddr) {
        let connection_id = Uuid::new_v4();
        info!("subscriber connected from {} as connection {}", remote_addr, connection_id);

        let (mut read_half, write_half) = stream.into_split();
        let (control_tx, control_rx) = mpsc::channel(1024);
        let writer_task = tokio::spawn(Self::control_writer(connection_id, write_half, control_rx));

        let connection = Arc::new(ClientConnection::new(connection_id, remote_addr, control_tx));
        self.registry.register(connection.clone());

        loop {
            let len = match read_half.read_u32().await {
                Ok(len) => len,
                Err(e) => {
                    debug!("control channel read from {} ended: {}", connection_id, e);
                    break;
                }
            };
            if len == 0 || len > MAX_COMMAND_LEN {
                warn!("dropping connection {}: implausible message length {}", connection_id, len);
                break;
            }

            let mut payload = vec![0u8; len as usize];
            if let Err(e) = read_half.read_exact(&mut payload).await {
                debug!("control channel read from {} ended: {}", connection_id, e);
                break;
            }

            let mut buf: &[u8] = &payload;
            match CommandFrame::deser(&mut buf) {
                Ok(frame) => self.handle_command(&connection, frame).await,
                Err(e) => {
                    // echo the raw command byte so the subscriber can correlate the failure
                    warn!("rejecting command frame from {}: {}", connection_id, e);
                    self.send_failed(&connection, payload[0], &e.to_string()).await;
                }
            }
        }

        // teardown runs in the background, never on the I/O path
        let publisher = self.clone();
        tokio::spawn(async move {
            writer_task.abort();
            publisher.registry.deregister(connection_id);
            connection.disconnect();
            info!("connection {} from {} closed", connection_id, remote_addr);
        });
    }

    async fn control_writer(
        connection_id: Uuid,
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::Receiver<ResponseFrame>,
    ) {
        while let Some(response) = rx.recv().await {
            let mut frame = BytesMut::new();
            response.ser(&mut frame);

            let mut message = BytesMut::with_capacity(4 + frame.len());
            message.extend_from_slice(&(frame.len() as u32).to_be_bytes());
            message.extend_from_slice(&frame);

            if let Err(e) = write_half.write_all(&message).await {
                debug!("control channel write to {} failed: {}", connection_id, e);
                return;
            }
        }
    }

    async fn handle_command(&self, connection: &Arc<ClientConnection>, frame: CommandFrame) {
        let command = frame.command;
        debug!("received {:?} from {}", command, connection.connection_id());

        let gated = !matches!(command, ServerCommand::Authenticate | ServerCommand::DefineOperationalModes);
        if gated && self.config.require_authentication && !connection.is_authenticated() {
            self.send_failed(connection, command, "subscriber not authenticated").await;
            return;
        }

        let result: anyhow::Result<Option<String>> = match command {
            ServerCommand::DefineOperationalModes => self.handle_define_operational_modes(connection, &frame.payload).await,
            ServerCommand::Authenticate => self.handle_authenticate(connection, &frame.payload).await,
            ServerCommand::MetaDataRefresh => self.handle_metadata_refresh(connection, &frame.payload).await,
            ServerCommand::Subscribe => self.handle_subscribe(connection, &frame.payload).await,
            ServerCommand::Unsubscribe => self.handle_unsubscribe(connection).await,
            ServerCommand::RotateCipherKeys => self.handle_rotate_cipher_keys(connection).await,
            ServerCommand::UpdateProcessingInterval => self.handle_update_processing_interval(connection, &frame.payload).await,
        };

        match result {
            Ok(Some(message)) => self.send_succeeded(connection, command, &message).await,
            Ok(None) => {} // the handler crafted its own Succeeded payload
            Err(e) => {
                warn!("{:?} from {} failed: {}", command, connection.connection_id(), e);
                self.send_failed(connection, command, &e.to_string()).await;
            }
        }
    }

    async fn handle_define_operational_modes(&self, connection: &Arc<ClientConnection>, payload: &[u8]) -> anyhow::Result<Option<String>> {
        let mut buf = payload;
        let modes = OperationalModes(buf.try_get_u32()?);
        connection.set_operational_modes(modes)?;
        Ok(Some("operational modes defined".to_string()))
    }

    async fn handle_authenticate(&self, connection: &Arc<ClientConnection>, payload: &[u8]) -> anyhow::Result<Option<String>> {
        let encoding = connection.operational_modes().encoding();
        let mut buf = payload;
        let credentials = try_get_string(&mut buf, encoding)?;

        match self.authorization.authenticate(connection.connection_id(), &credentials).await {
            Some(subscriber_id) => {
                connection.mark_authenticated(subscriber_id);
                info!("connection {} authenticated as subscriber {}", connection.connection_id(), subscriber_id);
                Ok(Some("authentication succeeded".to_string()))
            }
            None => bail!("authentication failed"),
        }
    }

    async fn handle_metadata_refresh(&self, connection: &Arc<ClientConnection>, payload: &[u8]) -> anyhow::Result<Option<String>> {
        let modes = connection.operational_modes();
        let filter = if payload.is_empty() {
            String::new()
        }
        else {
            let mut buf = payload;
            try_get_string(&mut buf, modes.encoding())?
        };

        let mut metadata = self.metadata.metadata_for(connection.subscriber_id(), &filter).await?;
        if modes.compress_metadata() && modes.gzip_compression() {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            std::io::Write::write_all(&mut encoder, &metadata)?;
            metadata = encoder.finish()?;
        }

        connection
            .send_response(ResponseFrame::new(ServerResponse::Succeeded, ServerCommand::MetaDataRefresh, metadata))
            .await?;
        Ok(None)
    }

    async fn handle_subscribe(&self, connection: &Arc<ClientConnection>, payload: &[u8]) -> anyhow::Result<Option<String>> {
        let _guard = self.subscribe_lock.lock().await;

        let modes = connection.operational_modes();
        if !modes.use_common_serialization_format() {
            bail!("only the common serialization format is supported");
        }
        let encoding = modes.encoding();

        let mut buf = payload;
        let request = SubscribeRequest::deser(&mut buf, encoding)?;
        let settings = SubscriptionSettings::from_request(&request, self.config.use_base_time_offsets)?;

        if settings.synchronized && !self.config.allow_synchronized_subscription {
            bail!("remotely synchronized subscriptions are not enabled on this publisher");
        }

        let cache = Arc::new(self.build_signal_index_cache(connection, &settings).await?);
        if cache.is_empty() {
            bail!("no measurements were authorized for subscription");
        }

        if let Some(port) = settings.data_channel_port {
            // bind in the address family of the subscriber's interface
            let bind_addr: SocketAddr = if connection.remote_addr().is_ipv4() {
                SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0))
            }
            else {
                SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
            };
            let socket = UdpSocket::bind(bind_addr).await?;
            connection.set_data_channel(DataChannel {
                socket: Arc::new(socket),
                target: SocketAddr::new(connection.remote_addr().ip(), port),
            });
        }
        else {
            connection.clear_data_channel();
        }

        // first key establishment happens here, so the subscriber holds key material before
        //  the first encrypted packet can possibly be produced
        if self.config.encrypt_payload && connection.cipher_keys().is_none() {
            self.push_cipher_keys(connection).await?;
        }

        // the cache must be with the subscriber before any packet references its indices
        let cache_image = cache.ser(modes)?;
        connection
            .send_response(ResponseFrame::new(ServerResponse::UpdateSignalIndexCache, ServerCommand::Subscribe, cache_image))
            .await?;

        let subscription = ClientSubscription::start(
            connection.connection_id(),
            settings.clone(),
            cache.clone(),
            encoding,
            connection.clone(),
        );

        if settings.track_latest_measurements {
            let current: Vec<Measurement> = {
                let latest = self.latest_values.lock().unwrap();
                cache.signal_ids().filter_map(|id| latest.get(id).cloned()).collect()
            };
            if !current.is_empty() {
                subscription.queue_measurements(current).await;
            }
        }

        connection.set_subscription(subscription);

        let summary = format!(
            "client subscribed as {} {} with {} signals",
            if settings.compact { "compact" } else { "full" },
            if settings.synchronized { "synchronized" } else { "unsynchronized" },
            cache.len(),
        );
        info!("connection {}: {}", connection.connection_id(), summary);
        Ok(Some(summary))
    }

    async fn build_signal_index_cache(
        &self,
        connection: &Arc<ClientConnection>,
        settings: &SubscriptionSettings,
    ) -> anyhow::Result<SignalIndexCache> {
        let subscriber_id = connection.subscriber_id().unwrap_or_else(|| connection.connection_id());

        let mut authorized = Vec::new();
        let mut unauthorized = Vec::new();

        for key_text in &settings.input_keys {
            let Some(key) = MeasurementKey::parse(key_text) else {
                bail!("malformed measurement key '{}'", key_text);
            };
            let Some(signal_id) = self.authorization.lookup_signal(&key.source, key.id).await else {
                debug!("ignoring unknown measurement key {:?}", key);
                continue;
            };
            if self.authorization.is_authorized(subscriber_id, signal_id).await {
                authorized.push(SignalReference { signal_id, key });
            }
            else {
                unauthorized.push(signal_id);
            }
        }

        SignalIndexCache::new(connection.connection_id(), authorized, unauthorized)
    }

    async fn handle_unsubscribe(&self, connection: &Arc<ClientConnection>) -> anyhow::Result<Option<String>> {
        let _guard = self.subscribe_lock.lock().await;

        let Some(subscription) = connection.subscription() else {
            bail!("connection is not subscribed");
        };

        if subscription.settings().is_temporal() {
            let encoding = connection.operational_modes().encoding();
            let message = encoding.encode_str("temporal processing complete");
            let response = ResponseFrame::new(ServerResponse::ProcessingComplete, ServerCommand::Subscribe, message);
            if let Err(e) = connection.send_response(response).await {
                debug!("failed to send processing complete to {}: {}", connection.connection_id(), e);
            }
        }

        connection.remove_subscription();
        connection.clear_data_channel();
        info!("connection {} unsubscribed", connection.connection_id());
        Ok(Some("client unsubscribed".to_string()))
    }

    async fn handle_rotate_cipher_keys(&self, connection: &Arc<ClientConnection>) -> anyhow::Result<Option<String>> {
        if !self.config.encrypt_payload {
            bail!("payload encryption is not enabled on this publisher");
        }
        self.push_cipher_keys(connection).await?;
        Ok(Some("cipher keys rotated".to_string()))
    }

    async fn handle_update_processing_interval(&self, connection: &Arc<ClientConnection>, payload: &[u8]) -> anyhow::Result<Option<String>> {
        let mut buf = payload;
        let interval = buf.try_get_i32()?;
        connection.set_processing_interval(interval);
        debug!("connection {} set processing interval {}", connection.connection_id(), interval);
        Ok(Some("processing interval updated".to_string()))
    }

    /// Rotates the connection's key set and pushes the new material via UpdateCipherKeys.
    async fn push_cipher_keys(&self, connection: &Arc<ClientConnection>) -> anyhow::Result<()> {
        let keys = connection.rotate_cipher_keys();
        let mut payload = BytesMut::new();
        keys.ser(&mut payload);
        connection
            .send_response(ResponseFrame::new(ServerResponse::UpdateCipherKeys, ServerCommand::Subscribe, payload.to_vec()))
            .await
    }

    async fn cipher_rotation_loop(self: Arc<DataPublisher>) {
        let mut interval = tokio::time::interval(self.config.cipher_key_rotation_period);
        interval.tick().await; // establishment happens on first use, not at time zero
        loop {
            interval.tick().await;
            for connection in self.registry.snapshot() {
                if !connection.is_authenticated() {
                    continue;
                }
                if let Err(e) = self.push_cipher_keys(&connection).await {
                    debug!("cipher rotation for {} failed: {}", connection.connection_id(), e);
                }
            }
        }
    }

    async fn send_succeeded(&self, connection: &Arc<ClientConnection>, command: ServerCommand, message: &str) {
        let payload = connection.operational_modes().encoding().encode_str(message);
        let response = ResponseFrame::new(ServerResponse::Succeeded, command, payload);
        if let Err(e) = connection.send_response(response).await {
            debug!("failed to respond to {}: {}", connection.connection_id(), e);
        }
    }

    async fn send_failed(&self, connection: &Arc<ClientConnection>, command: impl Into<u8>, message: &str) {
        let payload = connection.operational_modes().encoding().encode_str(message);
        let response = ResponseFrame::new(ServerResponse::Failed, command, payload);
        if let Err(e) = connection.send_response(response).await {
            debug!("failed to respond to {}: {}", connection.connection_id(), e);
        }
    }

    /// Fans a batch of measurements out to every unsynchronized subscription. Synchronized
    ///  subscriptions are fed through [FramePublisher::publish_frame] by the sorting engine.
    pub async fn publish_measurements(&self, measurements: Vec<Measurement>) {
        {
            let mut latest = self.latest_values.lock().unwrap();
            for m in &measurements {
                latest.insert(m.signal_id, m.clone());
            }
        }

        for connection in self.registry.snapshot() {
            if let Some(subscription) = connection.subscription() {
                if !subscription.settings().synchronized {
                    subscription.queue_measurements(measurements.clone()).await;
                }
            }
        }
    }

    // administrative surface

    pub fn enumerate_clients(&self) -> Vec<SubscriberStatus> {
        self.registry.snapshot().iter().map(|c| Self::status_of(c)).collect()
    }

    pub fn subscriber_status(&self, connection_id: Uuid) -> anyhow::Result<SubscriberStatus> {
        match self.registry.get(&connection_id) {
            Some(connection) => Ok(Self::status_of(&connection)),
            None => bail!("no connection {}", connection_id),
        }
    }

    pub async fn rotate_connection_cipher_keys(&self, connection_id: Uuid) -> anyhow::Result<()> {
        let Some(connection) = self.registry.get(&connection_id) else {
            bail!("no connection {}", connection_id);
        };
        if !connection.is_authenticated() {
            bail!("connection {} is not authenticated", connection_id);
        }
        self.push_cipher_keys(&connection).await
    }

    fn status_of(connection: &Arc<ClientConnection>) -> SubscriberStatus {
        let subscription = connection.subscription();
        SubscriberStatus {
            connection_id: connection.connection_id(),
            remote_addr: connection.remote_addr(),
            subscriber_id: connection.subscriber_id(),
            authenticated: connection.is_authenticated(),
            subscribed: subscription.is_some(),
            signal_count: subscription.map(|s| s.signal_index_cache().len()).unwrap_or(0),
        }
    }
}

#[async_trait::async_trait]
impl FramePublisher for DataPublisher {
    /// Delivery callback of the external frame sorter: routes one completed frame to every
    ///  remotely synchronized subscription.
    async fn publish_frame(&self, timestamp: Ticks, measurements: Vec<Measurement>) {
        for connection in self.registry.snapshot() {
            if let Some(subscription) = connection.subscription() {
                if subscription.settings().synchronized {
                    subscription.queue_frame(timestamp, measurements.clone()).await;
                }
            }
        }
    }
}
