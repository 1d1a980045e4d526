use super::WireError;
use std::convert::TryInto;

/// Little-endian cursor helpers shared by every fixed-size record.
pub(crate) fn read_u64_le(bytes: &[u8], cursor: &mut usize) -> Result<u64, WireError> {
    let end = *cursor + 8;
    if bytes.len() < end {
        return Err(WireError::Truncated {
            expected: end,
            observed: bytes.len(),
        });
    }
    let value = u64::from_le_bytes(
        bytes[*cursor..end]
            .try_into()
            .map_err(|_| WireError::Truncated {
                expected: end,
                observed: bytes.len(),
            })?,
    );
    *cursor = end;
    Ok(value)
}

pub(crate) fn read_u32_le(bytes: &[u8], cursor: &mut usize) -> Result<u32, WireError> {
    let end = *cursor + 4;
    if bytes.len() < end {
        return Err(WireError::Truncated {
            expected: end,
            observed: bytes.len(),
        });
    }
    let value = u32::from_le_bytes(
        bytes[*cursor..end]
            .try_into()
            .map_err(|_| WireError::Truncated {
                expected: end,
                observed: bytes.len(),
            })?,
    );
    *cursor = end;
    Ok(value)
}

pub(crate) fn read_u8(bytes: &[u8], cursor: &mut usize) -> Result<u8, WireError> {
    let value = *bytes.get(*cursor).ok_or(WireError::Truncated {
        expected: *cursor + 1,
        observed: bytes.len(),
    })?;
    *cursor += 1;
    Ok(value)
}

pub(crate) fn skip(bytes: &[u8], cursor: &mut usize, len: usize) -> Result<(), WireError> {
    if bytes.len() < *cursor + len {
        return Err(WireError::Truncated {
            expected: *cursor + len,
            observed: bytes.len(),
        });
    }
    *cursor += len;
    Ok(())
}

/// Validates the leading version byte and the exact record length.
pub(crate) fn check_header(
    bytes: &[u8],
    record: &'static str,
    expected_len: usize,
    expected_version: u8,
) -> Result<(), WireError> {
    if bytes.len() != expected_len {
        if bytes.len() < expected_len {
            return Err(WireError::Truncated {
                expected: expected_len,
                observed: bytes.len(),
            });
        }
        return Err(WireError::TrailingBytes {
            record,
            extra: bytes.len() - expected_len,
        });
    }
    if bytes[0] != expected_version {
        return Err(WireError::InvalidVersion {
            record,
            observed: bytes[0],
            expected: expected_version,
        });
    }
    Ok(())
}
