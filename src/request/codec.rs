//! `PartitionRequest` wire codec.
//!
//! Frame layout, all integers big-endian:
//!
//! ```text
//! header    [u64 id][u8 from][u8 kind][u8 op]
//! KeySet    [i32 count] count x [binary]
//! EntryMap  [i32 count] count x [binary][bool present][binary if present]
//! Mask      [bool has_mask][partition set if has_mask]
//! Metadata  [binary name][bool relayed]
//!
//! binary         [i32 len][len bytes]
//! partition set  [u32 partition_count][u32 blocks] blocks x [u32]
//! ```

use crate::request::{
    EntryOp, KeyOp, MaskOp, MetadataOp, PartitionRequest, RequestKind,
};
use crate::utils::{GridError, MemberSet, PartitionSet};

use bytes::{Buf, BufMut, Bytes, BytesMut};

const KIND_KEY_SET: u8 = 1;
const KIND_ENTRY_MAP: u8 = 2;
const KIND_PARTITION_MASK: u8 = 3;
const KIND_STORAGE_METADATA: u8 = 4;

/// Encodes a request into a wire frame. Local-only state is left out.
/// Fails if an item count or binary length does not fit the frame's
/// `i32` length fields.
pub fn encode_request(request: &PartitionRequest) -> Result<Bytes, GridError> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u64(request.id());
    buf.put_u8(request.from());

    match request.kind() {
        RequestKind::KeySet { op, keys } => {
            buf.put_u8(KIND_KEY_SET);
            buf.put_u8(match op {
                KeyOp::Get => 0,
                KeyOp::Remove => 1,
                KeyOp::Contains => 2,
            });
            buf.put_i32(wire_len(keys.len(), "key count")?);
            for key in keys {
                put_binary(&mut buf, key)?;
            }
        }
        RequestKind::EntryMap { op, entries } => {
            buf.put_u8(KIND_ENTRY_MAP);
            buf.put_u8(match op {
                EntryOp::PutAll => 0,
            });
            buf.put_i32(wire_len(entries.len(), "entry count")?);
            for (key, value) in entries {
                put_binary(&mut buf, key)?;
                match value {
                    Some(value) => {
                        buf.put_u8(1);
                        put_binary(&mut buf, value)?;
                    }
                    None => buf.put_u8(0),
                }
            }
        }
        RequestKind::PartitionMask { op, mask } => {
            buf.put_u8(KIND_PARTITION_MASK);
            buf.put_u8(match op {
                MaskOp::Size => 0,
                MaskOp::Keys => 1,
                MaskOp::Clear => 2,
                MaskOp::IsEmpty => 3,
            });
            match mask {
                Some(mask) => {
                    buf.put_u8(1);
                    put_partition_set(&mut buf, mask)?;
                }
                None => buf.put_u8(0),
            }
        }
        RequestKind::StorageMetadata { op, relayed } => {
            buf.put_u8(KIND_STORAGE_METADATA);
            let name = match op {
                MetadataOp::AddIndex(name) => {
                    buf.put_u8(0);
                    name
                }
                MetadataOp::RemoveIndex(name) => {
                    buf.put_u8(1);
                    name
                }
            };
            put_binary(&mut buf, name.as_bytes())?;
            buf.put_u8(*relayed as u8);
        }
    }

    Ok(buf.freeze())
}

/// Decodes a wire frame into a request. The decoded request has no targets,
/// no tracked partitions, and no deferred response.
pub fn decode_request(mut buf: Bytes) -> Result<PartitionRequest, GridError> {
    ensure(&buf, 11, "header")?;
    let id = buf.get_u64();
    let from = buf.get_u8();
    let kind_tag = buf.get_u8();
    let op_tag = buf.get_u8();

    let kind = match kind_tag {
        KIND_KEY_SET => {
            let op = match op_tag {
                0 => KeyOp::Get,
                1 => KeyOp::Remove,
                2 => KeyOp::Contains,
                _ => return Err(bad_tag("key op", op_tag)),
            };
            let count = get_count(&mut buf, 4)?;
            let mut keys = Vec::with_capacity(count);
            for _ in 0..count {
                keys.push(get_binary(&mut buf)?);
            }
            RequestKind::KeySet { op, keys }
        }
        KIND_ENTRY_MAP => {
            let op = match op_tag {
                0 => EntryOp::PutAll,
                _ => return Err(bad_tag("entry op", op_tag)),
            };
            let count = get_count(&mut buf, 5)?;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let key = get_binary(&mut buf)?;
                let value = if get_bool(&mut buf)? {
                    Some(get_binary(&mut buf)?)
                } else {
                    None
                };
                entries.push((key, value));
            }
            RequestKind::EntryMap { op, entries }
        }
        KIND_PARTITION_MASK => {
            let op = match op_tag {
                0 => MaskOp::Size,
                1 => MaskOp::Keys,
                2 => MaskOp::Clear,
                3 => MaskOp::IsEmpty,
                _ => return Err(bad_tag("mask op", op_tag)),
            };
            let mask = if get_bool(&mut buf)? {
                Some(get_partition_set(&mut buf)?)
            } else {
                None
            };
            RequestKind::PartitionMask { op, mask }
        }
        KIND_STORAGE_METADATA => {
            let name = String::from_utf8(get_binary(&mut buf)?.to_vec())?;
            let op = match op_tag {
                0 => MetadataOp::AddIndex(name),
                1 => MetadataOp::RemoveIndex(name),
                _ => return Err(bad_tag("metadata op", op_tag)),
            };
            let relayed = get_bool(&mut buf)?;
            RequestKind::StorageMetadata { op, relayed }
        }
        _ => return Err(bad_tag("request kind", kind_tag)),
    };

    if buf.has_remaining() {
        return Err(GridError::msg(format!(
            "{} trailing bytes after request frame",
            buf.remaining()
        )));
    }

    let mut request = PartitionRequest::new(from, MemberSet::new(), kind);
    request.set_id(id);
    Ok(request)
}

/// Converts a count or length into its `i32` wire form.
fn wire_len(len: usize, what: &str) -> Result<i32, GridError> {
    i32::try_from(len).map_err(|_| {
        GridError::msg(format!("{} {} too large for frame", what, len))
    })
}

fn put_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), GridError> {
    buf.put_i32(wire_len(data.len(), "binary length")?);
    buf.put_slice(data);
    Ok(())
}

fn put_partition_set(
    buf: &mut BytesMut,
    set: &PartitionSet,
) -> Result<(), GridError> {
    buf.put_u32(set.partition_count());
    let blocks = set.blocks();
    let num_blocks = u32::try_from(blocks.len()).map_err(|_| {
        GridError::msg(format!("{} partition set blocks", blocks.len()))
    })?;
    buf.put_u32(num_blocks);
    for &block in blocks {
        buf.put_u32(block);
    }
    Ok(())
}

#[inline]
fn ensure(buf: &Bytes, len: usize, what: &str) -> Result<(), GridError> {
    if buf.remaining() < len {
        return Err(GridError::msg(format!(
            "truncated frame reading {}: need {}, have {}",
            what,
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

fn bad_tag(what: &str, tag: u8) -> GridError {
    GridError::msg(format!("unknown {} tag {}", what, tag))
}

/// Reads an item count, rejecting negatives and counts that cannot possibly
/// fit in the rest of the frame given each item's minimum encoded size.
fn get_count(buf: &mut Bytes, min_item_len: usize) -> Result<usize, GridError> {
    ensure(buf, 4, "count")?;
    let count = buf.get_i32();
    if count < 0 {
        return Err(GridError::msg(format!("negative count {}", count)));
    }
    let count = count as usize;
    ensure(buf, count * min_item_len, "items")?;
    Ok(count)
}

fn get_binary(buf: &mut Bytes) -> Result<Bytes, GridError> {
    ensure(buf, 4, "binary length")?;
    let len = buf.get_i32();
    if len < 0 {
        return Err(GridError::msg(format!("negative binary length {}", len)));
    }
    ensure(buf, len as usize, "binary")?;
    Ok(buf.split_to(len as usize))
}

fn get_bool(buf: &mut Bytes) -> Result<bool, GridError> {
    ensure(buf, 1, "bool")?;
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(bad_tag("bool", b)),
    }
}

fn get_partition_set(buf: &mut Bytes) -> Result<PartitionSet, GridError> {
    ensure(buf, 8, "partition set header")?;
    let count = buf.get_u32();
    let num_blocks = buf.get_u32() as usize;
    ensure(buf, num_blocks * 4, "partition set blocks")?;
    let blocks = (0..num_blocks).map(|_| buf.get_u32()).collect();
    PartitionSet::from_blocks(count, blocks)
}

#[cfg(test)]
mod codec_tests {
    use super::*;

    fn key(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    fn with_id(kind: RequestKind, id: u64, from: u8) -> PartitionRequest {
        let mut request = PartitionRequest::new(from, MemberSet::single(9), kind);
        request.set_id(id);
        request
    }

    #[test]
    fn key_set_layout() -> Result<(), GridError> {
        let request = with_id(
            RequestKind::KeySet {
                op: KeyOp::Remove,
                keys: vec![key("k1"), key("")],
            },
            7,
            3,
        );
        let frame = request.encode()?;
        let mut expected = BytesMut::new();
        expected.put_u64(7);
        expected.put_u8(3);
        expected.put_u8(KIND_KEY_SET);
        expected.put_u8(1);
        expected.put_i32(2);
        expected.put_i32(2);
        expected.put_slice(b"k1");
        expected.put_i32(0);
        assert_eq!(frame, expected.freeze());

        let decoded = decode_request(frame)?;
        assert_eq!(decoded.id(), 7);
        assert_eq!(decoded.from(), 3);
        assert_eq!(decoded.kind(), request.kind());
        assert!(decoded.to().is_empty());
        Ok(())
    }

    #[test]
    fn entry_map_nullable_values() -> Result<(), GridError> {
        let kind = RequestKind::EntryMap {
            op: EntryOp::PutAll,
            entries: vec![(key("k1"), Some(key("v1"))), (key("k2"), None)],
        };
        let decoded = decode_request(with_id(kind.clone(), 1, 0).encode()?)?;
        assert_eq!(decoded.kind(), &kind);
        Ok(())
    }

    #[test]
    fn mask_flag_controls_set() -> Result<(), GridError> {
        let absent = with_id(
            RequestKind::PartitionMask {
                op: MaskOp::Size,
                mask: None,
            },
            1,
            0,
        );
        // header + one flag byte, nothing else
        assert_eq!(absent.encode()?.len(), 12);
        assert_eq!(decode_request(absent.encode()?)?.kind(), absent.kind());

        let kind = RequestKind::PartitionMask {
            op: MaskOp::Clear,
            mask: Some(PartitionSet::from_ids(40, [0, 35])?),
        };
        let decoded = decode_request(with_id(kind.clone(), 2, 1).encode()?)?;
        assert_eq!(decoded.kind(), &kind);
        Ok(())
    }

    #[test]
    fn metadata_relayed_flag() -> Result<(), GridError> {
        let kind = RequestKind::StorageMetadata {
            op: MetadataOp::AddIndex("by_age".into()),
            relayed: true,
        };
        let decoded = decode_request(with_id(kind.clone(), 5, 2).encode()?)?;
        assert_eq!(decoded.kind(), &kind);
        assert!(!decoded.is_relayed_request());
        Ok(())
    }

    #[test]
    fn local_state_not_encoded() -> Result<(), GridError> {
        let kind = RequestKind::KeySet {
            op: KeyOp::Get,
            keys: vec![key("k1")],
        };
        let plain = with_id(kind.clone(), 1, 0);
        let tracked = with_id(kind, 1, 0)
            .with_tracked(PartitionSet::from_ids(8, [1])?);
        assert_eq!(plain.encode()?, tracked.encode()?);
        Ok(())
    }

    #[test]
    fn lengths_beyond_i32_rejected() -> Result<(), GridError> {
        assert_eq!(wire_len(5, "key count")?, 5);
        assert_eq!(wire_len(i32::MAX as usize, "key count")?, i32::MAX);
        assert!(wire_len(i32::MAX as usize + 1, "binary length").is_err());
        Ok(())
    }

    #[test]
    fn contains_and_is_empty_ops() -> Result<(), GridError> {
        let contains = RequestKind::KeySet {
            op: KeyOp::Contains,
            keys: vec![key("k3")],
        };
        let decoded = decode_request(with_id(contains.clone(), 4, 1).encode()?)?;
        assert_eq!(decoded.kind(), &contains);

        let is_empty = RequestKind::PartitionMask {
            op: MaskOp::IsEmpty,
            mask: Some(PartitionSet::from_ids(8, [2])?),
        };
        let decoded = decode_request(with_id(is_empty.clone(), 5, 1).encode()?)?;
        assert_eq!(decoded.kind(), &is_empty);
        Ok(())
    }

    #[test]
    fn malformed_frames() {
        assert!(decode_request(Bytes::from_static(&[0; 5])).is_err());

        let mut bad_kind = BytesMut::new();
        bad_kind.put_u64(1);
        bad_kind.put_u8(0);
        bad_kind.put_u8(99);
        bad_kind.put_u8(0);
        assert!(decode_request(bad_kind.freeze()).is_err());

        let mut huge_count = BytesMut::new();
        huge_count.put_u64(1);
        huge_count.put_u8(0);
        huge_count.put_u8(KIND_KEY_SET);
        huge_count.put_u8(0);
        huge_count.put_i32(i32::MAX);
        assert!(decode_request(huge_count.freeze()).is_err());

        let mut negative = BytesMut::new();
        negative.put_u64(1);
        negative.put_u8(0);
        negative.put_u8(KIND_KEY_SET);
        negative.put_u8(0);
        negative.put_i32(1);
        negative.put_i32(-4);
        assert!(decode_request(negative.freeze()).is_err());

        let mut trailing = BytesMut::new();
        trailing.put_u64(1);
        trailing.put_u8(0);
        trailing.put_u8(KIND_PARTITION_MASK);
        trailing.put_u8(0);
        trailing.put_u8(0);
        trailing.put_u8(0xff);
        assert!(decode_request(trailing.freeze()).is_err());
    }
}
