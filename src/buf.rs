use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

use crate::operational_modes::OperationalEncoding;

/// Strings on the wire are length-prefixed (u32 BE, counting bytes) and encoded in the
///  connection's negotiated encoding.
pub fn put_string(buf: &mut BytesMut, s: &str, encoding: OperationalEncoding) {
    let encoded = encoding.encode_str(s);
    buf.put_u32(encoded.len() as u32);
    buf.put_slice(&encoded);
}

pub fn try_get_string(buf: &mut impl Buf, encoding: OperationalEncoding) -> anyhow::Result<String> {
    let len = buf.try_get_u32()? as usize;
    if buf.remaining() < len {
        anyhow::bail!("string truncated: declared {} bytes, {} available", len, buf.remaining());
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    encoding.decode_str(&bytes)
}

/// Uuids go on the wire big-endian (RFC 4122 byte order).
pub fn put_uuid(buf: &mut BytesMut, id: &Uuid) {
    buf.put_slice(id.as_bytes());
}

pub fn try_get_uuid(buf: &mut impl Buf) -> anyhow::Result<Uuid> {
    if buf.remaining() < 16 {
        anyhow::bail!("buffer too short for a uuid: {} bytes", buf.remaining());
    }
    let mut bytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Ok(Uuid::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty_utf8("", OperationalEncoding::Utf8, vec![0, 0, 0, 0])]
    #[case::abc_utf8("abc", OperationalEncoding::Utf8, vec![0, 0, 0, 3, 97, 98, 99])]
    #[case::umlaut_utf8("ä", OperationalEncoding::Utf8, vec![0, 0, 0, 2, 0xc3, 0xa4])]
    #[case::abc_utf16le("abc", OperationalEncoding::Utf16Le, vec![0, 0, 0, 6, 97, 0, 98, 0, 99, 0])]
    #[case::abc_utf16be("abc", OperationalEncoding::Utf16Be, vec![0, 0, 0, 6, 0, 97, 0, 98, 0, 99])]
    fn test_put_string(#[case] s: &str, #[case] encoding: OperationalEncoding, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s, encoding);
        assert_eq!(&buf, &expected);

        let mut deser_buf: &[u8] = &buf;
        let deser = try_get_string(&mut deser_buf, encoding).unwrap();
        assert!(deser_buf.is_empty());
        assert_eq!(&deser, s);
    }

    #[test]
    fn test_try_get_string_remaining() {
        let mut b: &[u8] = &[0, 0, 0, 1, b'a', b'b', b'c'];
        let actual = try_get_string(&mut b, OperationalEncoding::Utf8).unwrap();
        assert_eq!(&actual, "a");
        assert_eq!(b, b"bc");
    }

    #[test]
    fn test_try_get_string_too_short() {
        let mut b: &[u8] = &[0, 0, 0, 2, b'a'];
        assert!(try_get_string(&mut b, OperationalEncoding::Utf8).is_err());
    }

    #[test]
    fn test_uuid_round_trip() {
        let id = Uuid::new_v4();
        let mut buf = BytesMut::new();
        put_uuid(&mut buf, &id);
        assert_eq!(buf.len(), 16);

        let mut b: &[u8] = &buf;
        assert_eq!(try_get_uuid(&mut b).unwrap(), id);
        assert!(b.is_empty());
    }

    #[test]
    fn test_uuid_too_short() {
        let mut b: &[u8] = &[1, 2, 3];
        assert!(try_get_uuid(&mut b).is_err());
    }
}
