//! Publisher-side state for one connected subscriber: negotiated modes, authentication,
//!  cipher keys, the optional UDP data channel and the active subscription. The connection
//!  itself never touches sockets for reading; the publisher's per-connection read task feeds
//!  commands in, and everything outbound funnels through [ClientConnection::send_response].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::atomic_swap::{AtomicMap, AtomicValue};
use crate::cipher::{CipherKeySet, PayloadCipher};
use crate::collaborators::ResponseSink;
use crate::commands::{DataPacketFlags, ResponseFrame, ServerResponse};
use crate::operational_modes::OperationalModes;
use crate::subscription::ClientSubscription;

/// UDP delivery target for data packets, established during Subscribe when the connection
///  string requests a data channel.
pub struct DataChannel {
    pub socket: Arc<UdpSocket>,
    pub target: SocketAddr,
}

pub struct ClientConnection {
    connection_id: Uuid,
    remote_addr: SocketAddr,
    /// Identity established by Authenticate; unset until then.
    subscriber_id: AtomicValue<Uuid>,
    operational_modes: AtomicValue<OperationalModes>,
    cipher_keys: AtomicValue<CipherKeySet>,
    payload_cipher: PayloadCipher,
    encrypt_payload: AtomicBool,
    data_channel: AtomicValue<DataChannel>,
    subscription: AtomicValue<ClientSubscription>,
    /// Temporal replay speed requested via UpdateProcessingInterval; forwarded to the
    ///  historian session feeding temporal subscriptions.
    processing_interval: AtomicValue<i32>,
    control_tx: mpsc::Sender<ResponseFrame>,
}

impl ClientConnection {
    pub fn new(
        connection_id: Uuid,
        remote_addr: SocketAddr,
        control_tx: mpsc::Sender<ResponseFrame>,
    ) -> ClientConnection {
        ClientConnection {
            connection_id,
            remote_addr,
            subscriber_id: AtomicValue::new(),
            operational_modes: AtomicValue::new(),
            cipher_keys: AtomicValue::new(),
            payload_cipher: PayloadCipher::new(),
            encrypt_payload: AtomicBool::new(false),
            data_channel: AtomicValue::new(),
            subscription: AtomicValue::new(),
            processing_interval: AtomicValue::new(),
            control_tx,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn subscriber_id(&self) -> Option<Uuid> {
        self.subscriber_id.get().map(|id| *id)
    }

    pub fn is_authenticated(&self) -> bool {
        self.subscriber_id.get().is_some()
    }

    pub fn mark_authenticated(&self, subscriber_id: Uuid) {
        self.subscriber_id.set(subscriber_id);
    }

    /// DefineOperationalModes is accepted exactly once, before anything else on the session.
    pub fn set_operational_modes(&self, modes: OperationalModes) -> anyhow::Result<()> {
        if self.operational_modes.get().is_some() {
            bail!("operational modes are already defined for connection {}", self.connection_id);
        }
        modes.validate()?;
        self.operational_modes.set(modes);
        Ok(())
    }

    /// Falls back to the defaults when the subscriber never sent DefineOperationalModes.
    pub fn operational_modes(&self) -> OperationalModes {
        self.operational_modes.get().map(|m| *m).unwrap_or_default()
    }

    pub fn cipher_keys(&self) -> Option<Arc<CipherKeySet>> {
        self.cipher_keys.get()
    }

    /// Installs the initial key set or rotates the existing one, returning the set that the
    ///  subscriber must be told about.
    pub fn rotate_cipher_keys(&self) -> Arc<CipherKeySet> {
        let rotated = Arc::new(match self.cipher_keys.get() {
            None => CipherKeySet::initial(),
            Some(current) => current.rotated(),
        });
        self.cipher_keys.set_arc(rotated.clone());
        self.encrypt_payload.store(true, Ordering::Release);
        rotated
    }

    pub fn set_data_channel(&self, channel: DataChannel) {
        self.data_channel.set(channel);
    }

    pub fn clear_data_channel(&self) {
        self.data_channel.clear();
    }

    pub fn set_processing_interval(&self, interval: i32) {
        self.processing_interval.set(interval);
    }

    pub fn processing_interval(&self) -> Option<i32> {
        self.processing_interval.get().map(|i| *i)
    }

    pub fn subscription(&self) -> Option<Arc<ClientSubscription>> {
        self.subscription.get()
    }

    pub fn set_subscription(&self, subscription: ClientSubscription) {
        self.remove_subscription();
        self.subscription.set(subscription);
    }

    pub fn remove_subscription(&self) {
        if let Some(previous) = self.subscription.get() {
            previous.stop();
        }
        self.subscription.clear();
    }

    /// Tears down everything this connection owns. Called when the read task ends, whatever
    ///  the reason.
    pub fn disconnect(&self) {
        self.remove_subscription();
        self.clear_data_channel();
        self.cipher_keys.clear();
    }

    /// Data packets leave the flags byte readable and encrypt the remainder, so the receiver
    ///  can pick the key pair from CIPHER_INDEX before decrypting.
    fn encrypt_data_packet(&self, frame: ResponseFrame) -> anyhow::Result<ResponseFrame> {
        let Some(keys) = self.cipher_keys.get() else {
            bail!("payload encryption is active but no cipher keys are established");
        };

        let mut flags = DataPacketFlags::from_bits_retain(frame.payload[0]);
        flags.set(DataPacketFlags::CIPHER_INDEX, keys.cipher_index == 1);

        let encrypted = self.payload_cipher.encrypt(keys.active_pair(), &frame.payload[1..])?;
        let mut payload = Vec::with_capacity(1 + encrypted.len());
        payload.push(flags.bits());
        payload.extend_from_slice(&encrypted);

        Ok(ResponseFrame::new(frame.response, frame.in_response_to, payload))
    }
}

#[async_trait]
impl ResponseSink for ClientConnection {
    async fn send_response(&self, response: ResponseFrame) -> anyhow::Result<()> {
        let response = if response.response == ServerResponse::DataPacket
            && !response.payload.is_empty()
            && self.encrypt_payload.load(Ordering::Acquire)
        {
            self.encrypt_data_packet(response)?
        }
        else {
            response
        };

        if response.response == ServerResponse::DataPacket {
            if let Some(data_channel) = self.data_channel.get() {
                let mut buf = BytesMut::new();
                response.ser(&mut buf);
                if let Err(e) = data_channel.socket.send_to(&buf, data_channel.target).await {
                    debug!("UDP send to {} failed: {}", data_channel.target, e);
                }
                return Ok(());
            }
        }

        if self.control_tx.send(response).await.is_err() {
            bail!("control channel for connection {} is closed", self.connection_id);
        }
        Ok(())
    }
}

/// The publisher's view of all live connections. Lock free so the measurement fan-out path
///  and the admin operations never contend.
pub struct ConnectionRegistry {
    connections: AtomicMap<Uuid, Arc<ClientConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry { connections: AtomicMap::new() }
    }

    pub fn register(&self, connection: Arc<ClientConnection>) {
        self.connections.update(|m| {
            m.insert(connection.connection_id(), connection.clone());
        });
    }

    pub fn deregister(&self, connection_id: Uuid) -> Option<Arc<ClientConnection>> {
        let removed = self.connections.get(&connection_id);
        self.connections.update(|m| {
            m.remove(&connection_id);
        });
        removed
    }

    pub fn get(&self, connection_id: &Uuid) -> Option<Arc<ClientConnection>> {
        self.connections.get(connection_id)
    }

    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.snapshot().values().cloned().collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        ConnectionRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ServerCommand;
    use crate::operational_modes::{OperationalEncoding, COMPRESS_GZIP, USE_COMMON_SERIALIZATION_FORMAT};

    fn test_connection() -> (Arc<ClientConnection>, mpsc::Receiver<ResponseFrame>) {
        let (tx, rx) = mpsc::channel(16);
        let connection = Arc::new(ClientConnection::new(
            Uuid::new_v4(),
            "127.0.0.1:50000".parse().unwrap(),
            tx,
        ));
        (connection, rx)
    }

    #[test]
    fn test_operational_modes_set_once() {
        let (connection, _rx) = test_connection();
        assert_eq!(connection.operational_modes(), OperationalModes::default());

        let modes = OperationalModes(u32::from(OperationalEncoding::Utf8) | COMPRESS_GZIP | USE_COMMON_SERIALIZATION_FORMAT);
        connection.set_operational_modes(modes).unwrap();
        assert_eq!(connection.operational_modes(), modes);

        assert!(connection.set_operational_modes(OperationalModes::default()).is_err());
    }

    #[test]
    fn test_authentication_state() {
        let (connection, _rx) = test_connection();
        assert!(!connection.is_authenticated());
        assert_eq!(connection.subscriber_id(), None);

        let subscriber_id = Uuid::new_v4();
        connection.mark_authenticated(subscriber_id);
        assert!(connection.is_authenticated());
        assert_eq!(connection.subscriber_id(), Some(subscriber_id));
    }

    #[test]
    fn test_cipher_key_rotation_flips_index() {
        let (connection, _rx) = test_connection();
        assert!(connection.cipher_keys().is_none());

        let first = connection.rotate_cipher_keys();
        assert_eq!(first.cipher_index, 0);

        let second = connection.rotate_cipher_keys();
        assert_eq!(second.cipher_index, 1);
        assert_eq!(second.even, first.even, "the previously active pair survives rotation");
        assert_ne!(second.odd, first.odd);
        assert_eq!(connection.cipher_keys().as_deref(), Some(&*second), "the returned set is the installed set");
    }

    #[tokio::test]
    async fn test_non_data_responses_stay_clear_on_control_channel() {
        let (connection, mut rx) = test_connection();
        connection.rotate_cipher_keys();

        let response = ResponseFrame::new(ServerResponse::Succeeded, ServerCommand::Subscribe, b"ok".to_vec());
        connection.send_response(response.clone()).await.unwrap();

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent, response);
    }

    #[tokio::test]
    async fn test_data_packet_encrypted_after_key_establishment() {
        let (connection, mut rx) = test_connection();

        let flags = DataPacketFlags::COMPACT.bits();
        let mut payload = vec![flags];
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&[0u8; 15]);

        // before keys: data packets pass through in the clear
        connection.send_response(ResponseFrame::new(ServerResponse::DataPacket, ServerCommand::Subscribe, payload.clone())).await.unwrap();
        let clear = rx.recv().await.unwrap();
        assert_eq!(clear.payload, payload);

        let keys = connection.rotate_cipher_keys();
        connection.send_response(ResponseFrame::new(ServerResponse::DataPacket, ServerCommand::Subscribe, payload.clone())).await.unwrap();
        let encrypted = rx.recv().await.unwrap();

        assert_ne!(encrypted.payload, payload);
        let sent_flags = DataPacketFlags::from_bits_retain(encrypted.payload[0]);
        assert!(sent_flags.contains(DataPacketFlags::COMPACT));
        assert!(!sent_flags.contains(DataPacketFlags::CIPHER_INDEX));

        let cipher = PayloadCipher::new();
        let decrypted = cipher.decrypt(keys.active_pair(), &encrypted.payload[1..]).unwrap();
        assert_eq!(decrypted, payload[1..]);
    }

    #[test]
    fn test_registry_register_and_deregister() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = test_connection();
        let (b, _rx_b) = test_connection();
        registry.register(a.clone());
        registry.register(b.clone());

        assert!(registry.get(&a.connection_id()).is_some());
        assert_eq!(registry.snapshot().len(), 2);

        let removed = registry.deregister(a.connection_id()).unwrap();
        assert_eq!(removed.connection_id(), a.connection_id());
        assert!(registry.get(&a.connection_id()).is_none());
        assert_eq!(registry.snapshot().len(), 1);
    }
}
