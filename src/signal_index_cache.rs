//! Per-subscription mapping from a 16-bit runtime index to a full signal identity, plus the
//!  list of requested-but-unauthorized identities. Built once per (re)subscribe and treated as
//!  an immutable snapshot afterwards: a new subscribe produces a new cache behind a fresh
//!  `Arc`, never an in-place mutation visible to an in-flight decode.
//!
//! Wire image (common serialization format, all numbers BE):
//! ```ascii
//!  0: total image length (u32), including these four bytes
//!  4: subscriber id (uuid, 16 bytes)
//! 20: reference count (u32)
//!  *: per reference: runtime index (u16), signal id (uuid), source length (u32),
//!      source bytes (negotiated encoding), numeric id (u32)
//!  *: unauthorized count (u32)
//!  *: per unauthorized signal: signal id (uuid)
//! ```
//! The image is gzip-compressed as a whole when `CompressSignalIndexCache` plus the GZip
//!  compression mode were negotiated.

use std::io::{Read, Write};

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::buf::{put_string, put_uuid, try_get_string, try_get_uuid};
use crate::measurement::MeasurementKey;
use crate::operational_modes::OperationalModes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalReference {
    pub signal_id: Uuid,
    pub key: MeasurementKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalIndexCache {
    subscriber_id: Uuid,
    /// index position == runtime index, so indices are 0..N-1 in request order by construction
    references: Vec<SignalReference>,
    by_signal_id: FxHashMap<Uuid, u16>,
    unauthorized: Vec<Uuid>,
}

impl SignalIndexCache {
    /// Builds a cache from the authorization outcome of a subscribe request. `authorized` must
    ///  be in request order - the sequential index assignment is part of the wire contract.
    pub fn new(subscriber_id: Uuid, authorized: Vec<SignalReference>, unauthorized: Vec<Uuid>) -> anyhow::Result<SignalIndexCache> {
        if authorized.len() > u16::MAX as usize {
            bail!("too many signals for 16-bit runtime indices: {}", authorized.len());
        }

        let mut by_signal_id = FxHashMap::default();
        for (index, reference) in authorized.iter().enumerate() {
            if by_signal_id.insert(reference.signal_id, index as u16).is_some() {
                bail!("duplicate signal id {} in subscription", reference.signal_id);
            }
        }

        Ok(SignalIndexCache {
            subscriber_id,
            references: authorized,
            by_signal_id,
            unauthorized,
        })
    }

    pub fn subscriber_id(&self) -> Uuid {
        self.subscriber_id
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub fn unauthorized(&self) -> &[Uuid] {
        &self.unauthorized
    }

    pub fn index_of(&self, signal_id: &Uuid) -> Option<u16> {
        self.by_signal_id.get(signal_id).copied()
    }

    pub fn reference(&self, index: u16) -> Option<&SignalReference> {
        self.references.get(index as usize)
    }

    pub fn signal_ids(&self) -> impl Iterator<Item = &Uuid> {
        self.references.iter().map(|r| &r.signal_id)
    }

    fn ser_image(&self, modes: OperationalModes) -> BytesMut {
        let encoding = modes.encoding();

        let mut body = BytesMut::new();
        put_uuid(&mut body, &self.subscriber_id);
        body.put_u32(self.references.len() as u32);
        for (index, reference) in self.references.iter().enumerate() {
            body.put_u16(index as u16);
            put_uuid(&mut body, &reference.signal_id);
            put_string(&mut body, &reference.key.source, encoding);
            body.put_u32(reference.key.id);
        }
        body.put_u32(self.unauthorized.len() as u32);
        for signal_id in &self.unauthorized {
            put_uuid(&mut body, signal_id);
        }

        let mut image = BytesMut::with_capacity(4 + body.len());
        image.put_u32((4 + body.len()) as u32);
        image.put_slice(&body);
        image
    }

    /// Serializes the cache for an `UpdateSignalIndexCache` push, honoring the connection's
    ///  negotiated compression.
    pub fn ser(&self, modes: OperationalModes) -> anyhow::Result<Vec<u8>> {
        let image = self.ser_image(modes);

        if modes.compress_signal_index_cache() && modes.gzip_compression() {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&image)?;
            Ok(encoder.finish()?)
        }
        else {
            Ok(image.to_vec())
        }
    }

    pub fn deser(payload: &[u8], modes: OperationalModes) -> anyhow::Result<SignalIndexCache> {
        let decompressed;
        let image: &[u8] = if modes.compress_signal_index_cache() && modes.gzip_compression() {
            let mut decoder = GzDecoder::new(payload);
            let mut buf = Vec::new();
            decoder.read_to_end(&mut buf)?;
            decompressed = buf;
            &decompressed
        }
        else {
            payload
        };

        let encoding = modes.encoding();
        let buf = &mut &image[..];

        let declared_len = buf.try_get_u32()? as usize;
        if declared_len != image.len() {
            bail!("signal index cache image length mismatch: declared {}, got {}", declared_len, image.len());
        }

        let subscriber_id = try_get_uuid(buf)?;

        let reference_count = buf.try_get_u32()? as usize;
        let mut references = Vec::with_capacity(reference_count);
        for expected_index in 0..reference_count {
            let index = buf.try_get_u16()?;
            if index as usize != expected_index {
                bail!("non-sequential runtime index {} at position {}", index, expected_index);
            }
            let signal_id = try_get_uuid(buf)?;
            let source = try_get_string(buf, encoding)?;
            let id = buf.try_get_u32()?;
            references.push(SignalReference {
                signal_id,
                key: MeasurementKey { source, id },
            });
        }

        let unauthorized_count = buf.try_get_u32()? as usize;
        let mut unauthorized = Vec::with_capacity(unauthorized_count);
        for _ in 0..unauthorized_count {
            unauthorized.push(try_get_uuid(buf)?);
        }

        SignalIndexCache::new(subscriber_id, references, unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operational_modes::{COMPRESS_GZIP, COMPRESS_SIGNAL_INDEX_CACHE, USE_COMMON_SERIALIZATION_FORMAT};
    use crate::operational_modes::OperationalEncoding;
    use rstest::rstest;

    fn reference(source: &str, id: u32) -> SignalReference {
        SignalReference {
            signal_id: Uuid::new_v4(),
            key: MeasurementKey::new(source, id),
        }
    }

    #[test]
    fn test_sequential_indices_in_request_order() {
        let references: Vec<_> = (0..5).map(|i| reference("PPA", i)).collect();
        let cache = SignalIndexCache::new(Uuid::new_v4(), references.clone(), vec![]).unwrap();

        for (i, r) in references.iter().enumerate() {
            assert_eq!(cache.index_of(&r.signal_id), Some(i as u16));
            assert_eq!(cache.reference(i as u16), Some(r));
        }
        assert_eq!(cache.reference(5), None);
    }

    #[test]
    fn test_authorized_unauthorized_partition() {
        let authorized: Vec<_> = (0..3).map(|i| reference("PPA", i)).collect();
        let unauthorized = vec![Uuid::new_v4(), Uuid::new_v4()];
        let cache = SignalIndexCache::new(Uuid::new_v4(), authorized.clone(), unauthorized.clone()).unwrap();

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.unauthorized(), &unauthorized);
        for signal_id in &unauthorized {
            assert_eq!(cache.index_of(signal_id), None);
        }
    }

    #[test]
    fn test_duplicate_signal_rejected() {
        let r = reference("PPA", 1);
        assert!(SignalIndexCache::new(Uuid::new_v4(), vec![r.clone(), r], vec![]).is_err());
    }

    #[rstest]
    #[case::plain(OperationalModes(OperationalEncoding::Utf8 as u32 | USE_COMMON_SERIALIZATION_FORMAT))]
    #[case::utf16(OperationalModes(OperationalEncoding::Utf16Le as u32 | USE_COMMON_SERIALIZATION_FORMAT))]
    #[case::gzipped(OperationalModes(OperationalEncoding::Utf8 as u32 | USE_COMMON_SERIALIZATION_FORMAT | COMPRESS_GZIP | COMPRESS_SIGNAL_INDEX_CACHE))]
    fn test_ser_deser_round_trip(#[case] modes: OperationalModes) {
        let authorized = vec![reference("PPA", 1), reference("SHELBY", 99)];
        let unauthorized = vec![Uuid::new_v4()];
        let original = SignalIndexCache::new(Uuid::new_v4(), authorized, unauthorized).unwrap();

        let payload = original.ser(modes).unwrap();
        let deser = SignalIndexCache::deser(&payload, modes).unwrap();
        assert_eq!(deser, original);
    }

    #[test]
    fn test_deser_length_mismatch() {
        let modes = OperationalModes::default();
        let cache = SignalIndexCache::new(Uuid::new_v4(), vec![reference("PPA", 1)], vec![]).unwrap();
        let mut payload = cache.ser(modes).unwrap();
        payload.truncate(payload.len() - 1);
        assert!(SignalIndexCache::deser(&payload, modes).is_err());
    }
}
