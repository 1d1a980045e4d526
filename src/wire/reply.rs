use super::codec::{check_header, read_u32_le, read_u64_le, read_u8, skip};
use super::types::{FileId, MemKind, Status};
use super::WireError;

const REPLY_VERSION: u8 = 1;
const READ_REPLY_VERSION: u8 = 1;
const ALLOC_REPLY_VERSION: u8 = 1;

pub const REPLY_FRAME_LEN: usize = 4 + 4 + 8 + 8;
pub const READ_REPLY_FRAME_LEN: usize = 4 + 4 + 8 + 8 + 8;
pub const ALLOC_REPLY_FRAME_LEN: usize = 4 + 4 + 8 + 8 + 8 + 8;

/// Generic reply. Also used for FILE_ID announcements and dump acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub request_id: u64,
    pub file_id: FileId,
    pub status: Status,
    pub payload_size: u64,
}

impl Reply {
    pub fn new(request_id: u64, file_id: FileId, status: Status) -> Self {
        Self {
            request_id,
            file_id,
            status,
            payload_size: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REPLY_FRAME_LEN);
        buf.push(REPLY_VERSION);
        buf.push(self.status.code());
        buf.extend_from_slice(&[0u8; 2]);
        buf.extend_from_slice(&self.file_id.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.payload_size.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        check_header(bytes, "reply", REPLY_FRAME_LEN, REPLY_VERSION)?;
        let mut cursor = 1;
        let status = Status::from_code(read_u8(bytes, &mut cursor)?)?;
        skip(bytes, &mut cursor, 2)?;
        let file_id = read_u32_le(bytes, &mut cursor)?;
        let request_id = read_u64_le(bytes, &mut cursor)?;
        let payload_size = read_u64_le(bytes, &mut cursor)?;
        Ok(Self {
            request_id,
            file_id,
            status,
            payload_size,
        })
    }
}

/// Reply to READ, and the header of every dumped cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadReply {
    pub request_id: u64,
    pub file_id: FileId,
    pub status: Status,
    pub mem_kind: MemKind,
    pub address: u64,
    pub payload_size: u64,
}

impl ReadReply {
    pub fn new(request_id: u64, file_id: FileId, status: Status) -> Self {
        Self {
            request_id,
            file_id,
            status,
            mem_kind: MemKind::Default,
            address: 0,
            payload_size: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(READ_REPLY_FRAME_LEN);
        buf.push(READ_REPLY_VERSION);
        buf.push(self.status.code());
        buf.push(self.mem_kind.code());
        buf.push(0);
        buf.extend_from_slice(&self.file_id.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.address.to_le_bytes());
        buf.extend_from_slice(&self.payload_size.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        check_header(bytes, "read_reply", READ_REPLY_FRAME_LEN, READ_REPLY_VERSION)?;
        let mut cursor = 1;
        let status = Status::from_code(read_u8(bytes, &mut cursor)?)?;
        let mem_kind = MemKind::from_code(read_u8(bytes, &mut cursor)?)?;
        skip(bytes, &mut cursor, 1)?;
        let file_id = read_u32_le(bytes, &mut cursor)?;
        let request_id = read_u64_le(bytes, &mut cursor)?;
        let address = read_u64_le(bytes, &mut cursor)?;
        let payload_size = read_u64_le(bytes, &mut cursor)?;
        Ok(Self {
            request_id,
            file_id,
            status,
            mem_kind,
            address,
            payload_size,
        })
    }
}

/// Reply to ALLOC and FREE. `payload_size` echoes the allocated length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocReply {
    pub request_id: u64,
    pub file_id: FileId,
    pub status: Status,
    pub mem_kind: MemKind,
    pub address: u64,
    pub end_of_address: u64,
    pub payload_size: u64,
}

impl AllocReply {
    pub fn new(request_id: u64, file_id: FileId, status: Status) -> Self {
        Self {
            request_id,
            file_id,
            status,
            mem_kind: MemKind::Default,
            address: 0,
            end_of_address: 0,
            payload_size: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ALLOC_REPLY_FRAME_LEN);
        buf.push(ALLOC_REPLY_VERSION);
        buf.push(self.status.code());
        buf.push(self.mem_kind.code());
        buf.push(0);
        buf.extend_from_slice(&self.file_id.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.address.to_le_bytes());
        buf.extend_from_slice(&self.end_of_address.to_le_bytes());
        buf.extend_from_slice(&self.payload_size.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        check_header(
            bytes,
            "alloc_reply",
            ALLOC_REPLY_FRAME_LEN,
            ALLOC_REPLY_VERSION,
        )?;
        let mut cursor = 1;
        let status = Status::from_code(read_u8(bytes, &mut cursor)?)?;
        let mem_kind = MemKind::from_code(read_u8(bytes, &mut cursor)?)?;
        skip(bytes, &mut cursor, 1)?;
        let file_id = read_u32_le(bytes, &mut cursor)?;
        let request_id = read_u64_le(bytes, &mut cursor)?;
        let address = read_u64_le(bytes, &mut cursor)?;
        let end_of_address = read_u64_le(bytes, &mut cursor)?;
        let payload_size = read_u64_le(bytes, &mut cursor)?;
        Ok(Self {
            request_id,
            file_id,
            status,
            mem_kind,
            address,
            end_of_address,
            payload_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_layouts_have_fixed_lengths() {
        assert_eq!(Reply::new(1, 2, Status::Ok).encode().len(), REPLY_FRAME_LEN);
        assert_eq!(
            ReadReply::new(1, 2, Status::Ok).encode().len(),
            READ_REPLY_FRAME_LEN
        );
        assert_eq!(
            AllocReply::new(1, 2, Status::Ok).encode().len(),
            ALLOC_REPLY_FRAME_LEN
        );
    }

    #[test]
    fn read_reply_keeps_dump_header_fields() {
        let mut header = ReadReply::new(9, 4, Status::Dumping);
        header.mem_kind = MemKind::Btree;
        header.address = 4096;
        header.payload_size = 512;
        let decoded = ReadReply::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn reply_decoders_do_not_accept_each_other() {
        let reply = Reply::new(1, 1, Status::Ok).encode();
        assert!(ReadReply::decode(&reply).is_err());
        assert!(AllocReply::decode(&reply).is_err());
    }

    #[test]
    fn alloc_reply_rejects_unknown_status() {
        let mut frame = AllocReply::new(1, 1, Status::CantAlloc).encode();
        frame[1] = 200;
        assert!(matches!(
            AllocReply::decode(&frame),
            Err(WireError::UnknownCode {
                field: "status",
                ..
            })
        ));
    }
}
