//! The on-disk snapshot format: a Redis-compatible RDB-style binary dump
//! with opcode-driven sections and a trailing CRC64 checksum. Magic,
//! metadata pairs, one database section, end-of-file opcode, then an
//! 8-byte little-endian CRC64 trailer. Length encoding uses a reduced
//! single-byte-prefix scheme (see `write_len`/`read_len` below), not the
//! full multi-width RDB scheme.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use crc::{Crc, CRC_64_GO_ISO};

use crate::error::SnapshotError;
use crate::keyspace::Keyspace;

const MAGIC: &[u8; 5] = b"REDIS";
const VERSION: &[u8; 4] = b"0011";

const OP_METADATA: u8 = 0xFA;
const OP_SELECTDB: u8 = 0xFE;
const OP_RESIZEDB: u8 = 0xFB;
const OP_EXPIRE_MS: u8 = 0xFC;
const OP_EXPIRE_SEC: u8 = 0xFD;
const OP_EOF: u8 = 0xFF;

const LEN_U8: u8 = 0xC0;
const LEN_U16: u8 = 0xC1;
const LEN_U32: u8 = 0xC2;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

fn write_len(buf: &mut Vec<u8>, len: usize) -> Result<(), SnapshotError> {
    if len > u8::MAX as usize {
        return Err(SnapshotError::ValueTooLong(len));
    }
    buf.push(len as u8);
    Ok(())
}

fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) -> Result<(), SnapshotError> {
    write_len(buf, data.len())?;
    buf.extend_from_slice(data);
    Ok(())
}

/// Serializes `keyspace` (database index 0) into the on-disk snapshot
/// format, appending metadata pairs ahead of the database section.
pub fn save(keyspace: &Keyspace, metadata: &[(String, String)]) -> Result<Vec<u8>, SnapshotError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(VERSION);

    for (key, value) in metadata {
        buf.push(OP_METADATA);
        write_bytes(&mut buf, key.as_bytes())?;
        write_bytes(&mut buf, value.as_bytes())?;
    }

    buf.push(OP_SELECTDB);
    buf.push(0u8);
    buf.push(OP_RESIZEDB);
    write_len(&mut buf, keyspace.len())?;
    write_len(&mut buf, keyspace.expiring_len())?;

    for (key, record) in keyspace.iter() {
        if let Some(expires_at_ms) = record.expires_at_ms {
            buf.push(OP_EXPIRE_MS);
            buf.extend_from_slice(&expires_at_ms.to_le_bytes());
        }
        buf.push(record.type_tag);
        write_bytes(&mut buf, key)?;
        write_bytes(&mut buf, &record.value)?;
    }

    buf.push(OP_EOF);

    let checksum = CRC64.checksum(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(buf)
}

fn read_len(cursor: &mut Cursor<&[u8]>) -> Result<usize, SnapshotError> {
    let marker = cursor
        .read_u8()
        .map_err(|_| SnapshotError::UnexpectedEof)?;
    match marker {
        LEN_U8 => Ok(cursor.read_u8().map_err(|_| SnapshotError::UnexpectedEof)? as usize),
        LEN_U16 => Ok(cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| SnapshotError::UnexpectedEof)? as usize),
        LEN_U32 => Ok(cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| SnapshotError::UnexpectedEof)? as usize),
        other => Ok(other as usize),
    }
}

fn read_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Bytes, SnapshotError> {
    let len = read_len(cursor)?;
    let mut data = vec![0u8; len];
    cursor
        .read_exact(&mut data)
        .map_err(|_| SnapshotError::UnexpectedEof)?;
    Ok(Bytes::from(data))
}

fn peek_u8(cursor: &Cursor<&[u8]>) -> Option<u8> {
    let pos = cursor.position() as usize;
    cursor.get_ref().get(pos).copied()
}

/// Deserializes a snapshot image into a fresh [`Keyspace`].
///
/// Never fails by losing already-decoded records: on any error, returns the
/// partially-populated keyspace alongside the error so the caller can decide
/// whether to keep it (checksum mismatch: yes) or discard it (bad magic at
/// the very start: there's nothing to discard anyway).
pub fn load(bytes: &[u8]) -> (Keyspace, Option<SnapshotError>) {
    let mut keyspace = Keyspace::new();
    let err = load_into(&mut keyspace, bytes).err();
    (keyspace, err)
}

fn load_into(keyspace: &mut Keyspace, bytes: &[u8]) -> Result<(), SnapshotError> {
    if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let mut cursor = Cursor::new(bytes);
    cursor.set_position(MAGIC.len() as u64);

    let mut version = [0u8; 4];
    cursor
        .read_exact(&mut version)
        .map_err(|_| SnapshotError::UnexpectedEof)?;
    std::str::from_utf8(&version).map_err(|_| SnapshotError::InvalidVersion)?;

    loop {
        let opcode = cursor
            .read_u8()
            .map_err(|_| SnapshotError::UnexpectedEof)?;
        match opcode {
            OP_METADATA => {
                read_bytes(&mut cursor)?;
                read_bytes(&mut cursor)?;
            }
            OP_SELECTDB => {
                let db_index = cursor
                    .read_u8()
                    .map_err(|_| SnapshotError::UnexpectedEof)?;
                if peek_u8(&cursor) == Some(OP_RESIZEDB) {
                    cursor.set_position(cursor.position() + 1);
                    read_len(&mut cursor)?;
                    read_len(&mut cursor)?;
                }
                read_records(&mut cursor, keyspace, db_index == 0)?;
            }
            OP_EOF => {
                let trailer_start = cursor.position() as usize;
                let computed = CRC64.checksum(&bytes[..trailer_start]);
                match cursor.read_u64::<LittleEndian>() {
                    Err(_) => return Ok(()),
                    Ok(stored) if stored != computed => return Err(SnapshotError::ChecksumMismatch),
                    Ok(_) => return Ok(()),
                }
            }
            other => return Err(SnapshotError::BadOpcode(other)),
        }
    }
}

fn read_records(
    cursor: &mut Cursor<&[u8]>,
    keyspace: &mut Keyspace,
    keep: bool,
) -> Result<(), SnapshotError> {
    loop {
        match peek_u8(cursor) {
            None => return Err(SnapshotError::UnexpectedEof),
            Some(OP_SELECTDB) | Some(OP_EOF) => return Ok(()),
            _ => {}
        }

        let expires_at_ms = match peek_u8(cursor) {
            Some(OP_EXPIRE_MS) => {
                cursor.set_position(cursor.position() + 1);
                Some(
                    cursor
                        .read_u64::<LittleEndian>()
                        .map_err(|_| SnapshotError::UnexpectedEof)?,
                )
            }
            Some(OP_EXPIRE_SEC) => {
                cursor.set_position(cursor.position() + 1);
                let secs = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| SnapshotError::UnexpectedEof)?;
                Some(secs as u64 * 1000)
            }
            _ => None,
        };

        let _type_tag = cursor
            .read_u8()
            .map_err(|_| SnapshotError::UnexpectedEof)?;
        let key = read_bytes(cursor)?;
        let value = read_bytes(cursor)?;
        if keep {
            keyspace.put(key.to_vec(), value, expires_at_ms);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_byte_string_values() {
        let mut ks = Keyspace::new();
        ks.put(b"k1".to_vec(), Bytes::from_static(b"v1"), None);
        ks.put(b"k2".to_vec(), Bytes::from_static(b"v2"), Some(9_999_999_999_999));

        let bytes = save(&ks, &[]).unwrap();
        let (loaded, err) = load(&bytes);
        assert!(err.is_none());
        assert_eq!(loaded.len(), 2);

        let mut loaded = loaded;
        assert_eq!(loaded.get(b"k1"), Some(Bytes::from_static(b"v1")));
        assert_eq!(loaded.get(b"k2"), Some(Bytes::from_static(b"v2")));
    }

    #[test]
    fn trailer_is_crc64_of_everything_before_it() {
        let ks = Keyspace::new();
        let bytes = save(&ks, &[]).unwrap();
        let trailer = &bytes[bytes.len() - 8..];
        let expected = CRC64.checksum(&bytes[..bytes.len() - 8]);
        assert_eq!(trailer, expected.to_le_bytes());
    }

    #[test]
    fn bad_magic_is_reported_and_yields_empty_keyspace() {
        let (ks, err) = load(b"NOTREDIS0011\xFF");
        assert!(ks.is_empty());
        assert!(matches!(err, Some(SnapshotError::BadMagic)));
    }

    #[test]
    fn corrupted_trailer_reports_checksum_mismatch_but_keeps_records() {
        let mut ks = Keyspace::new();
        ks.put(b"k1".to_vec(), Bytes::from_static(b"v1"), None);
        let mut bytes = save(&ks, &[]).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let (loaded, err) = load(&bytes);
        assert!(matches!(err, Some(SnapshotError::ChecksumMismatch)));
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn metadata_pairs_are_skipped_on_read() {
        let ks = Keyspace::new();
        let bytes = save(&ks, &[("redis-ver".to_string(), "7.0.0".to_string())]).unwrap();
        let (loaded, err) = load(&bytes);
        assert!(err.is_none());
        assert!(loaded.is_empty());
    }

    #[test]
    fn missing_file_equivalent_is_empty_keyspace() {
        let ks = Keyspace::new();
        assert!(ks.is_empty());
    }
}
