//! The two measurement wire encodings.
//!
//! Compact encoding:
//! ```ascii
//! 0: compact flags (u8)
//! 1: runtime index (u16 BE)
//! 3: adjusted value (f32 BE)
//! 7: timestamp (0 / 2 / 4 / 8 bytes, see below)
//! ```
//!
//! The timestamp width is *computed* from four subscription-level booleans and never stored.
//!  Whether a delta or an absolute timestamp follows is recoverable from the flags byte, but
//!  the millisecond-resolution choice is not, so both sides must agree on that setting:
//! * time not included: 0 bytes (the frame-level timestamp applies)
//! * base-time offsets + millisecond resolution: 2 bytes (u16 BE millisecond delta)
//! * base-time offsets, full resolution: 4 bytes (u32 BE tick delta)
//! * no base-time offsets: 8 bytes (i64 BE absolute ticks)
//!
//! Full-fidelity encoding (self-describing, no cache required):
//! ```ascii
//!  0: signal id (uuid, 16 bytes)
//! 16: source length (u32 BE) + source bytes (negotiated encoding)
//!  *: numeric id (u32 BE)
//!  *: timestamp (i64 BE ticks)
//!  *: state flags (u32 BE)
//!  *: adjusted value (f64 BE)
//! ```

use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

use crate::buf::{put_string, put_uuid, try_get_string, try_get_uuid};
use crate::measurement::{Measurement, MeasurementFlags, Ticks, TICKS_PER_MILLISECOND};
use crate::operational_modes::OperationalEncoding;
use crate::signal_index_cache::SignalIndexCache;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
    pub struct CompactFlags: u8 {
        const DATA_RANGE       = 0x01;
        const DATA_QUALITY     = 0x02;
        const TIME_QUALITY     = 0x04;
        const SYSTEM_ISSUE     = 0x08;
        const CALCULATED_VALUE = 0x10;
        const DISCARDED_VALUE  = 0x20;
        /// Marker that the timestamp is a delta against a base-time offset rather than an
        ///  absolute value; the decoder keys the timestamp width off this bit.
        const BASE_TIME_OFFSET = 0x40;
        /// Which of the two base-time offsets the delta is expressed against.
        const TIME_INDEX       = 0x80;
    }
}

impl CompactFlags {
    fn from_measurement_flags(flags: MeasurementFlags) -> CompactFlags {
        let mut result = CompactFlags::empty();
        result.set(CompactFlags::DATA_RANGE, flags.contains(MeasurementFlags::BAD_DATA));
        result.set(CompactFlags::DATA_QUALITY, flags.contains(MeasurementFlags::SUSPECT_DATA));
        result.set(CompactFlags::TIME_QUALITY, flags.contains(MeasurementFlags::BAD_TIME));
        result.set(CompactFlags::SYSTEM_ISSUE, flags.contains(MeasurementFlags::SYSTEM_ISSUE));
        result.set(CompactFlags::CALCULATED_VALUE, flags.contains(MeasurementFlags::CALCULATED_VALUE));
        result.set(CompactFlags::DISCARDED_VALUE, flags.contains(MeasurementFlags::DISCARDED_VALUE));
        result
    }

    fn to_measurement_flags(self) -> MeasurementFlags {
        let mut result = MeasurementFlags::empty();
        result.set(MeasurementFlags::BAD_DATA, self.contains(CompactFlags::DATA_RANGE));
        result.set(MeasurementFlags::SUSPECT_DATA, self.contains(CompactFlags::DATA_QUALITY));
        result.set(MeasurementFlags::BAD_TIME, self.contains(CompactFlags::TIME_QUALITY));
        result.set(MeasurementFlags::SYSTEM_ISSUE, self.contains(CompactFlags::SYSTEM_ISSUE));
        result.set(MeasurementFlags::CALCULATED_VALUE, self.contains(CompactFlags::CALCULATED_VALUE));
        result.set(MeasurementFlags::DISCARDED_VALUE, self.contains(CompactFlags::DISCARDED_VALUE));
        result
    }
}

/// The width rule both sides must agree on byte-for-byte.
pub fn timestamp_length(compact: bool, include_time: bool, use_base_time_offsets: bool, use_millisecond_resolution: bool) -> usize {
    if !include_time {
        return 0;
    }
    if !compact || !use_base_time_offsets {
        return 8;
    }
    if use_millisecond_resolution { 2 } else { 4 }
}

/// Two recently-sent absolute timestamps against which compact timestamps are expressed as
///  small deltas, plus the index of the currently active one. Replaced wholesale on rotation.
///
/// `UpdateBaseTimes` payload: `[4B BE time index][8B BE offset 0][8B BE offset 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseTimeOffsets {
    pub time_index: u32,
    pub offsets: [Ticks; 2],
}

impl BaseTimeOffsets {
    pub fn active_offset(&self) -> Ticks {
        self.offsets[(self.time_index & 1) as usize]
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.time_index);
        buf.put_i64(self.offsets[0]);
        buf.put_i64(self.offsets[1]);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<BaseTimeOffsets> {
        let time_index = buf.try_get_u32()?;
        if time_index > 1 {
            bail!("base time index out of range: {}", time_index);
        }
        let offsets = [buf.try_get_i64()?, buf.try_get_i64()?];
        Ok(BaseTimeOffsets { time_index, offsets })
    }
}

/// Serializer/deserializer for the compact encoding, parameterized with the subscription-level
///  settings that determine the timestamp width.
#[derive(Debug, Clone, Copy)]
pub struct CompactCodec {
    pub include_time: bool,
    pub use_base_time_offsets: bool,
    pub use_millisecond_resolution: bool,
}

impl CompactCodec {
    pub fn serialized_len(&self) -> usize {
        1 + 2 + 4 + timestamp_length(true, self.include_time, self.use_base_time_offsets, self.use_millisecond_resolution)
    }

    pub fn ser(
        &self,
        measurement: &Measurement,
        cache: &SignalIndexCache,
        base_times: Option<&BaseTimeOffsets>,
        buf: &mut BytesMut,
    ) -> anyhow::Result<()> {
        let Some(index) = cache.index_of(&measurement.signal_id) else {
            bail!("signal {} is not in the signal index cache", measurement.signal_id);
        };

        let mut flags = CompactFlags::from_measurement_flags(measurement.flags);

        let timestamp_len = timestamp_length(true, self.include_time, self.use_base_time_offsets, self.use_millisecond_resolution);
        if timestamp_len == 2 || timestamp_len == 4 {
            let Some(base_times) = base_times else {
                bail!("compact encoding requires base time offsets but none are established");
            };
            flags.insert(CompactFlags::BASE_TIME_OFFSET);
            flags.set(CompactFlags::TIME_INDEX, base_times.time_index & 1 == 1);
        }

        buf.put_u8(flags.bits());
        buf.put_u16(index);
        buf.put_f32(measurement.adjusted_value() as f32);

        match timestamp_len {
            0 => {}
            2 => {
                let base = base_times.map(|b| b.active_offset()).unwrap_or(0);
                let delta_ms = (measurement.timestamp - base) / TICKS_PER_MILLISECOND;
                if !(0..=u16::MAX as i64).contains(&delta_ms) {
                    bail!("millisecond delta {} out of range for base time offset", delta_ms);
                }
                buf.put_u16(delta_ms as u16);
            }
            4 => {
                let base = base_times.map(|b| b.active_offset()).unwrap_or(0);
                let delta = measurement.timestamp - base;
                if !(0..=u32::MAX as i64).contains(&delta) {
                    bail!("tick delta {} out of range for base time offset", delta);
                }
                buf.put_u32(delta as u32);
            }
            _ => {
                buf.put_i64(measurement.timestamp);
            }
        }
        Ok(())
    }

    /// `frame_timestamp` supplies the timestamp when time is not included per measurement
    ///  (synchronized data packets).
    pub fn deser(
        &self,
        buf: &mut impl Buf,
        cache: &SignalIndexCache,
        base_times: Option<&BaseTimeOffsets>,
        frame_timestamp: Option<Ticks>,
    ) -> anyhow::Result<Measurement> {
        let flags = CompactFlags::from_bits_retain(buf.try_get_u8()?);
        let index = buf.try_get_u16()?;
        let value = buf.try_get_f32()? as f64;

        let Some(reference) = cache.reference(index) else {
            bail!("runtime index {} is not in the signal index cache", index);
        };

        // the sender marks base-time-relative timestamps in the flags byte, so the width can
        //  be derived from the wire even if the local base-time setting disagrees
        let timestamp_len = timestamp_length(
            true,
            self.include_time,
            flags.contains(CompactFlags::BASE_TIME_OFFSET),
            self.use_millisecond_resolution,
        );
        let timestamp = match timestamp_len {
            0 => frame_timestamp.unwrap_or(0),
            2 | 4 => {
                let Some(base_times) = base_times else {
                    bail!("compact decoding requires base time offsets but none are established");
                };
                let time_index = flags.contains(CompactFlags::TIME_INDEX) as usize;
                let base = base_times.offsets[time_index];
                if timestamp_len == 2 {
                    base + buf.try_get_u16()? as i64 * TICKS_PER_MILLISECOND
                }
                else {
                    base + buf.try_get_u32()? as i64
                }
            }
            _ => buf.try_get_i64()?,
        };

        let mut measurement = Measurement::new(reference.signal_id, reference.key.clone(), value, timestamp);
        measurement.flags = flags.to_measurement_flags();
        Ok(measurement)
    }
}

/// The self-describing full-fidelity encoding; used when a subscription did not request the
///  compact format.
#[derive(Debug, Clone, Copy)]
pub struct FullCodec {
    pub encoding: OperationalEncoding,
}

impl FullCodec {
    pub fn serialized_len(&self, measurement: &Measurement) -> usize {
        16 + 4 + self.encoding.encode_str(&measurement.key.source).len() + 4 + 8 + 4 + 8
    }

    pub fn ser(&self, measurement: &Measurement, buf: &mut BytesMut) {
        put_uuid(buf, &measurement.signal_id);
        put_string(buf, &measurement.key.source, self.encoding);
        buf.put_u32(measurement.key.id);
        buf.put_i64(measurement.timestamp);
        buf.put_u32(measurement.flags.bits());
        buf.put_f64(measurement.adjusted_value());
    }

    pub fn deser(&self, buf: &mut impl Buf) -> anyhow::Result<Measurement> {
        let signal_id = try_get_uuid(buf)?;
        let source = try_get_string(buf, self.encoding)?;
        let id = buf.try_get_u32()?;
        let timestamp = buf.try_get_i64()?;
        let flags = MeasurementFlags::from_bits_retain(buf.try_get_u32()?);
        let value = buf.try_get_f64()?;

        let mut measurement = Measurement::new(signal_id, crate::measurement::MeasurementKey { source, id }, value, timestamp);
        measurement.flags = flags;
        Ok(measurement)
    }
}
