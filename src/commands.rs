//! Command and response codes plus the response frame envelope. A command frame is just the
//!  code byte followed by its payload; the response frame carries the code it responds to and
//!  an explicit payload length (see the crate docs for the byte layouts).

use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Default TCP port for the control channel.
pub const DEFAULT_PORT: u16 = 6165;

/// Upper bound for a single data-packet payload. Batches exceeding this are split across
///  multiple packets, never sent oversized.
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize / 2;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ServerCommand {
    Authenticate = 0x00,
    MetaDataRefresh = 0x01,
    Subscribe = 0x02,
    Unsubscribe = 0x03,
    RotateCipherKeys = 0x04,
    UpdateProcessingInterval = 0x05,
    DefineOperationalModes = 0x06,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ServerResponse {
    Succeeded = 0x80,
    Failed = 0x81,
    DataPacket = 0x82,
    UpdateSignalIndexCache = 0x83,
    UpdateBaseTimes = 0x84,
    UpdateCipherKeys = 0x85,
    DataStartTime = 0x86,
    ProcessingComplete = 0x87,
    NoOp = 0xFF,
}

impl ServerResponse {
    /// Solicited responses answer a specific pending command and must be matched against the
    ///  pending-command list; everything else is an unsolicited push.
    pub fn is_solicited(&self) -> bool {
        matches!(self, ServerResponse::Succeeded | ServerResponse::Failed)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
    pub struct DataPacketFlags: u8 {
        /// A frame-level timestamp follows the flags byte; measurements omit their own.
        const SYNCHRONIZED = 0x01;
        /// Measurements use the compact encoding.
        const COMPACT = 0x02;
        /// Selects which of the even/odd cipher key pairs encrypted this payload.
        const CIPHER_INDEX = 0x04;
    }
}

/// A command frame as read off the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub command: ServerCommand,
    pub payload: Vec<u8>,
}

impl CommandFrame {
    pub fn new(command: ServerCommand, payload: Vec<u8>) -> CommandFrame {
        CommandFrame { command, payload }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.command.into());
        buf.put_slice(&self.payload);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<CommandFrame> {
        let code = buf.try_get_u8()?;
        let Ok(command) = ServerCommand::try_from(code) else {
            bail!("unknown command code 0x{:02x}", code);
        };
        let mut payload = vec![0u8; buf.remaining()];
        buf.copy_to_slice(&mut payload);
        Ok(CommandFrame { command, payload })
    }
}

/// A response frame. The payload length is explicit on the wire even though the transport
///  delimits messages, so a frame survives being embedded in a datagram unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub response: ServerResponse,
    /// The raw code of the command this responds to. Kept as a byte rather than a
    ///  [ServerCommand] so a Failed response can echo a command code the publisher does not
    ///  recognize.
    pub in_response_to: u8,
    pub payload: Vec<u8>,
}

impl ResponseFrame {
    pub const HEADER_LEN: usize = 6;

    pub fn new(response: ServerResponse, in_response_to: impl Into<u8>, payload: Vec<u8>) -> ResponseFrame {
        ResponseFrame { response, in_response_to: in_response_to.into(), payload }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.response.into());
        buf.put_u8(self.in_response_to);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ResponseFrame> {
        let response_code = buf.try_get_u8()?;
        let Ok(response) = ServerResponse::try_from(response_code) else {
            bail!("unknown response code 0x{:02x}", response_code);
        };
        let in_response_to = buf.try_get_u8()?;
        let payload_len = buf.try_get_u32()? as usize;
        if buf.remaining() < payload_len {
            bail!("response payload truncated: declared {} bytes, {} available", payload_len, buf.remaining());
        }
        let mut payload = vec![0u8; payload_len];
        buf.copy_to_slice(&mut payload);
        Ok(ResponseFrame { response, in_response_to, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::succeeded(ServerResponse::Succeeded, true)]
    #[case::failed(ServerResponse::Failed, true)]
    #[case::data_packet(ServerResponse::DataPacket, false)]
    #[case::update_signal_index_cache(ServerResponse::UpdateSignalIndexCache, false)]
    #[case::update_base_times(ServerResponse::UpdateBaseTimes, false)]
    #[case::update_cipher_keys(ServerResponse::UpdateCipherKeys, false)]
    #[case::data_start_time(ServerResponse::DataStartTime, false)]
    #[case::processing_complete(ServerResponse::ProcessingComplete, false)]
    #[case::no_op(ServerResponse::NoOp, false)]
    fn test_solicited_classification(#[case] response: ServerResponse, #[case] expected: bool) {
        assert_eq!(response.is_solicited(), expected);
    }

    #[rstest]
    #[case::empty(ServerCommand::Unsubscribe, vec![])]
    #[case::subscribe(ServerCommand::Subscribe, vec![0x02, 0, 0, 0, 1, b'x'])]
    fn test_command_frame_round_trip(#[case] command: ServerCommand, #[case] payload: Vec<u8>) {
        let original = CommandFrame::new(command, payload);
        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        let mut b: &[u8] = &buf;
        let deser = CommandFrame::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_command_frame_unknown_code() {
        let mut b: &[u8] = &[0x55, 1, 2, 3];
        assert!(CommandFrame::deser(&mut b).is_err());
    }

    #[rstest]
    #[case::empty(ServerResponse::Succeeded, ServerCommand::Subscribe, vec![])]
    #[case::payload(ServerResponse::DataStartTime, ServerCommand::Subscribe, vec![0, 0, 0, 0, 0, 0, 0, 9])]
    #[case::no_op(ServerResponse::NoOp, ServerCommand::Subscribe, vec![])]
    fn test_response_frame_round_trip(
        #[case] response: ServerResponse,
        #[case] in_response_to: ServerCommand,
        #[case] payload: Vec<u8>,
    ) {
        let original = ResponseFrame::new(response, in_response_to, payload);
        let mut buf = BytesMut::new();
        original.ser(&mut buf);

        assert_eq!(buf.len(), ResponseFrame::HEADER_LEN + original.payload.len());

        let mut b: &[u8] = &buf;
        let deser = ResponseFrame::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_response_frame_echoes_unknown_command_code() {
        // a Failed may answer a command code the publisher does not know
        let original = ResponseFrame::new(ServerResponse::Failed, 0x55u8, b"unknown command".to_vec());
        let mut buf = BytesMut::new();
        original.ser(&mut buf);

        let mut b: &[u8] = &buf;
        let deser = ResponseFrame::deser(&mut b).unwrap();
        assert_eq!(deser, original);
        assert_eq!(deser.in_response_to, 0x55);
    }

    #[test]
    fn test_response_frame_truncated_payload() {
        let frame = ResponseFrame::new(ServerResponse::DataPacket, ServerCommand::Subscribe, vec![1, 2, 3, 4]);
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        buf.truncate(buf.len() - 1);
        let mut b: &[u8] = &buf;
        assert!(ResponseFrame::deser(&mut b).is_err());
    }

    #[test]
    fn test_response_frame_unknown_response_code() {
        let mut b: &[u8] = &[0x70, 0x02, 0, 0, 0, 0];
        assert!(ResponseFrame::deser(&mut b).is_err());
    }
}
