//! Session engine for the Gateway Exchange Protocol (GEP), a publish/subscribe protocol for
//!  streaming time-series measurements (synchrophasor / SCADA telemetry) from one publishing
//!  server to many subscribing clients at sub-second rates.
//!
//! ## Design goals
//!
//! * A persistent reliable *control channel* (TCP, default port 6165) carries commands from the
//!   subscriber and responses from the publisher. An optional unreliable *data channel* (UDP)
//!   can carry the high-volume data packets instead of the control channel.
//! * Subscriptions are negotiated: the subscriber picks protocol version, string encoding,
//!   compression and serialization options once per connection via a bitfield
//!   (`DefineOperationalModes`), then subscribes with a filter expression.
//! * Measurements can be sent *full fidelity* (self-describing, 128-bit signal id) or *compact*
//!   (16-bit runtime index assigned per subscription plus a reduced-width timestamp). The
//!   index assignment is pushed to the subscriber as a *signal index cache* before any data
//!   packet that uses it.
//! * Payload encryption is optional, with even/odd cipher key pairs rotated periodically by the
//!   publisher and pushed to each authenticated client.
//! * The subscriber is self-healing: a data-loss watchdog restarts the whole connect cycle when
//!   the stream goes silent.
//!
//! ## Framing
//!
//! Messages on the control channel are length-delimited:
//! ```ascii
//! 0: message length (u32 BE), starting after the encoded length
//! 4: message bytes
//! ```
//!
//! Command frame (subscriber -> publisher), one per control-channel message:
//! ```ascii
//! 0: command code (u8)
//! 1: command-specific payload
//! ```
//!
//! Response frame (publisher -> subscriber), one per control-channel message (and the entire
//!  payload of a data-channel datagram):
//! ```ascii
//! 0: response code (u8)
//! 1: code of the command this responds to (u8)
//! 2: payload length (u32 BE)
//! 6: payload
//! ```
//!
//! Command codes: `Authenticate` 0x00, `MetaDataRefresh` 0x01, `Subscribe` 0x02,
//!  `Unsubscribe` 0x03, `RotateCipherKeys` 0x04, `UpdateProcessingInterval` 0x05,
//!  `DefineOperationalModes` 0x06.
//!
//! Response codes: `Succeeded` 0x80, `Failed` 0x81, `DataPacket` 0x82,
//!  `UpdateSignalIndexCache` 0x83, `UpdateBaseTimes` 0x84, `UpdateCipherKeys` 0x85,
//!  `DataStartTime` 0x86, `ProcessingComplete` 0x87, `NoOp` 0xFF.
//!
//! Only `Succeeded` and `Failed` are *solicited*, i.e. answer a specific pending command; all
//!  other responses are unsolicited pushes from the publisher.
//!
//! ## Data packets
//!
//! ```ascii
//! 0: flags (u8):
//!     * bit 0: synchronized - a frame-level timestamp follows, measurements omit their own
//!     * bit 1: compact - measurements use the compact encoding
//!     * bit 2: cipher index - which of the even/odd key pairs encrypted this payload
//!     * bits 3-7: reserved, must be 0
//! 1: frame timestamp (i64 BE ticks) - only if 'synchronized' is set
//! *: measurement count (u32 BE)
//! *: serialized measurements
//! ```
//!
//! Compact measurement encoding:
//! ```ascii
//! 0: compact flags (u8) - quality bits, base-time-offset marker, time index
//! 1: runtime index (u16 BE) - resolved through the signal index cache
//! 3: value (f32 BE)
//! 7: timestamp - 0, 2, 4 or 8 bytes; the width is *computed*, not stored (see
//!     `compact::timestamp_length`), so both sides must negotiate the same inputs
//! ```
//!
//! ## Negotiation bits
//!
//! The operational modes bitfield (u32):
//! ```ascii
//! bits  0- 4: protocol version (currently 0)
//! bits  5- 7: compression mode (bit 5: GZip)
//! bits  8- 9: string encoding (00 UTF-16LE, 01 UTF-16BE, 10 UTF-8, 11 ANSI)
//! bit     24: use common serialization format (required by this implementation)
//! bit     30: compress signal index cache
//! bit     31: compress metadata
//! ```

pub mod atomic_swap;
pub mod buf;
pub mod cipher;
pub mod collaborators;
pub mod commands;
pub mod compact;
pub mod config;
pub mod connection;
pub mod measurement;
pub mod operational_modes;
pub mod publisher;
pub mod settings;
pub mod signal_index_cache;
pub mod subscriber;
pub mod subscription;
