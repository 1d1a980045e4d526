use super::codec::{check_header, read_u32_le, read_u64_le, read_u8, skip};
use super::types::{
    FeatureFlags, FileId, LockKind, MemKind, ObjectId, ObjectKind, Rank, RequestKey, RequestKind,
    OBJECT_ID_LEN,
};
use super::WireError;
use serde::{Deserialize, Serialize};

const REQUEST_VERSION: u8 = 1;

/// Encoded size of a [`Request`] record.
pub const REQUEST_FRAME_LEN: usize = 8 + 8 + 4 + 4 + 8 + 8 + 6 * 8 + OBJECT_ID_LEN;

/// Allocation parameters mirrored by the server for each open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenParams {
    pub max_address: u64,
    pub feature_flags: FeatureFlags,
    pub meta_block_size: u64,
    pub small_data_block_size: u64,
    pub threshold: u64,
    pub alignment: u64,
}

impl Default for OpenParams {
    fn default() -> Self {
        Self {
            max_address: 0,
            feature_flags: FeatureFlags::empty(),
            meta_block_size: 0,
            small_data_block_size: 0,
            threshold: 0,
            alignment: 0,
        }
    }
}

/// One fixed-size request record. Variable-length payloads travel separately on the
/// METADATA channel, announced by `payload_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub request_id: u64,
    pub kind: RequestKind,
    pub sender_rank: Rank,
    pub file_id: FileId,
    pub object_kind: ObjectKind,
    pub lock_kind: LockKind,
    pub mem_kind: MemKind,
    pub payload_size: u64,
    pub address: u64,
    pub object_id: ObjectId,
    pub open: OpenParams,
}

impl Request {
    pub fn new(kind: RequestKind, key: RequestKey, file_id: FileId) -> Self {
        Self {
            request_id: key.request_id,
            kind,
            sender_rank: key.sender_rank,
            file_id,
            object_kind: ObjectKind::Memory,
            lock_kind: LockKind::Read,
            mem_kind: MemKind::Default,
            payload_size: 0,
            address: 0,
            object_id: ObjectId::default(),
            open: OpenParams::default(),
        }
    }

    pub fn key(&self) -> RequestKey {
        RequestKey::new(self.sender_rank, self.request_id)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REQUEST_FRAME_LEN);
        buf.push(REQUEST_VERSION);
        buf.push(self.kind.code());
        buf.push(self.object_kind.code());
        buf.push(self.lock_kind.code());
        buf.push(self.mem_kind.code());
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.sender_rank.to_le_bytes());
        buf.extend_from_slice(&self.file_id.to_le_bytes());
        buf.extend_from_slice(&self.payload_size.to_le_bytes());
        buf.extend_from_slice(&self.address.to_le_bytes());
        buf.extend_from_slice(&self.open.max_address.to_le_bytes());
        buf.extend_from_slice(&self.open.feature_flags.bits().to_le_bytes());
        buf.extend_from_slice(&self.open.meta_block_size.to_le_bytes());
        buf.extend_from_slice(&self.open.small_data_block_size.to_le_bytes());
        buf.extend_from_slice(&self.open.threshold.to_le_bytes());
        buf.extend_from_slice(&self.open.alignment.to_le_bytes());
        buf.extend_from_slice(self.object_id.as_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        check_header(bytes, "request", REQUEST_FRAME_LEN, REQUEST_VERSION)?;
        let mut cursor = 1;
        let kind = RequestKind::from_code(read_u8(bytes, &mut cursor)?)?;
        let object_kind = ObjectKind::from_code(read_u8(bytes, &mut cursor)?)?;
        let lock_kind = LockKind::from_code(read_u8(bytes, &mut cursor)?)?;
        let mem_kind = MemKind::from_code(read_u8(bytes, &mut cursor)?)?;
        skip(bytes, &mut cursor, 3)?;
        let request_id = read_u64_le(bytes, &mut cursor)?;
        let sender_rank = read_u32_le(bytes, &mut cursor)?;
        let file_id = read_u32_le(bytes, &mut cursor)?;
        let payload_size = read_u64_le(bytes, &mut cursor)?;
        let address = read_u64_le(bytes, &mut cursor)?;
        let open = OpenParams {
            max_address: read_u64_le(bytes, &mut cursor)?,
            feature_flags: FeatureFlags(read_u64_le(bytes, &mut cursor)?),
            meta_block_size: read_u64_le(bytes, &mut cursor)?,
            small_data_block_size: read_u64_le(bytes, &mut cursor)?,
            threshold: read_u64_le(bytes, &mut cursor)?,
            alignment: read_u64_le(bytes, &mut cursor)?,
        };
        let object_id = ObjectId::from_slice(&bytes[cursor..cursor + OBJECT_ID_LEN])?;
        Ok(Self {
            request_id,
            kind,
            sender_rank,
            file_id,
            object_kind,
            lock_kind,
            mem_kind,
            payload_size,
            address,
            object_id,
            open,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Request {
        let mut request = Request::new(RequestKind::LockEnd, RequestKey::new(3, 41), 7);
        request.object_kind = ObjectKind::Dataset;
        request.lock_kind = LockKind::Write;
        request.mem_kind = MemKind::Ohdr;
        request.address = 0x1000;
        request.object_id = ObjectId::from_address(0x2040);
        request.open.meta_block_size = 2048;
        request
    }

    #[test]
    fn request_frame_has_fixed_length() {
        assert_eq!(sample().encode().len(), REQUEST_FRAME_LEN);
        assert_eq!(REQUEST_FRAME_LEN, 104);
    }

    #[test]
    fn request_decodes_what_was_encoded() {
        let request = sample();
        let decoded = Request::decode(&request.encode()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.key(), RequestKey::new(3, 41));
    }

    #[test]
    fn request_decode_rejects_unknown_kind() {
        let mut frame = sample().encode();
        frame[1] = 99;
        assert!(matches!(
            Request::decode(&frame),
            Err(WireError::UnknownCode {
                field: "request_kind",
                code: 99
            })
        ));
    }

    #[test]
    fn request_decode_rejects_short_frame() {
        let frame = sample().encode();
        assert!(matches!(
            Request::decode(&frame[..REQUEST_FRAME_LEN - 1]),
            Err(WireError::Truncated { .. })
        ));
    }
}
