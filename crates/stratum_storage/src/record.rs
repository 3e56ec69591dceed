//! Record framing for the log engine.
//!
//! Envelope: `magic (4) | version (2) | type (1) | length (4) | payload | crc32 (4)`,
//! integers little-endian, CRC over everything before it. When the engine
//! runs with an at-rest key the payload is sealed with [`RecordCipher`].

use crate::cipher::RecordCipher;
use crate::error::{StorageError, StorageResult};

/// Magic bytes identifying a log record.
pub const RECORD_MAGIC: [u8; 4] = *b"STLG";

/// Current record format version.
pub const RECORD_VERSION: u16 = 1;

const HEADER_SIZE: usize = 4 + 2 + 1 + 4;
const CRC_SIZE: usize = 4;

/// A logged table mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// A table was created.
    CreateTable {
        /// Table URI.
        uri: String,
        /// Creation configuration.
        config: String,
    },
    /// A table was dropped.
    DropTable {
        /// Table URI.
        uri: String,
    },
    /// A row was inserted or overwritten.
    Put {
        /// Table URI.
        uri: String,
        /// Row key.
        key: String,
        /// Row value.
        value: Vec<u8>,
    },
    /// A row was removed.
    Remove {
        /// Table URI.
        uri: String,
        /// Row key.
        key: String,
    },
}

impl LogRecord {
    fn type_byte(&self) -> u8 {
        match self {
            Self::CreateTable { .. } => 1,
            Self::DropTable { .. } => 2,
            Self::Put { .. } => 3,
            Self::Remove { .. } => 4,
        }
    }

    fn encode_payload(&self) -> StorageResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::CreateTable { uri, config } => {
                put_bytes(&mut buf, uri.as_bytes())?;
                put_bytes(&mut buf, config.as_bytes())?;
            }
            Self::DropTable { uri } => put_bytes(&mut buf, uri.as_bytes())?,
            Self::Put { uri, key, value } => {
                put_bytes(&mut buf, uri.as_bytes())?;
                put_bytes(&mut buf, key.as_bytes())?;
                put_bytes(&mut buf, value)?;
            }
            Self::Remove { uri, key } => {
                put_bytes(&mut buf, uri.as_bytes())?;
                put_bytes(&mut buf, key.as_bytes())?;
            }
        }
        Ok(buf)
    }

    fn decode_payload(type_byte: u8, payload: &[u8]) -> StorageResult<Self> {
        let mut reader = PayloadReader { data: payload, pos: 0 };
        let record = match type_byte {
            1 => Self::CreateTable {
                uri: reader.string()?,
                config: reader.string()?,
            },
            2 => Self::DropTable {
                uri: reader.string()?,
            },
            3 => Self::Put {
                uri: reader.string()?,
                key: reader.string()?,
                value: reader.bytes()?.to_vec(),
            },
            4 => Self::Remove {
                uri: reader.string()?,
                key: reader.string()?,
            },
            other => {
                return Err(StorageError::corrupted(format!(
                    "unknown record type {other}"
                )))
            }
        };
        if reader.pos != payload.len() {
            return Err(StorageError::corrupted(format!(
                "trailing bytes in record: expected {} bytes, got {}",
                reader.pos,
                payload.len()
            )));
        }
        Ok(record)
    }

    /// Encodes the record with its envelope.
    pub fn encode(&self, cipher: Option<&RecordCipher>) -> StorageResult<Vec<u8>> {
        let mut payload = self.encode_payload()?;
        if let Some(cipher) = cipher {
            payload = cipher.seal(&payload)?;
        }
        let len = u32::try_from(payload.len())
            .map_err(|_| StorageError::invalid_argument("log record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&RECORD_MAGIC);
        data.extend_from_slice(&RECORD_VERSION.to_le_bytes());
        data.push(self.type_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }
}

/// Decodes every record in `data`.
///
/// A truncated or checksum-damaged final record is a torn write and ends the
/// log; damage anywhere else is corruption.
pub fn decode_all(data: &[u8], cipher: Option<&RecordCipher>) -> StorageResult<Vec<LogRecord>> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < HEADER_SIZE {
            tracing::warn!(offset, "ignoring truncated record header at end of log");
            break;
        }
        if rest[0..4] != RECORD_MAGIC {
            return Err(StorageError::corrupted(format!(
                "invalid magic at offset {offset}"
            )));
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version > RECORD_VERSION {
            return Err(StorageError::corrupted(format!(
                "unsupported record version {version} at offset {offset}"
            )));
        }
        let type_byte = rest[6];
        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < total {
            tracing::warn!(offset, "ignoring truncated record at end of log");
            break;
        }

        let body_end = HEADER_SIZE + len;
        let stored = u32::from_le_bytes([
            rest[body_end],
            rest[body_end + 1],
            rest[body_end + 2],
            rest[body_end + 3],
        ]);
        let computed = compute_crc32(&rest[..body_end]);
        if stored != computed {
            if rest.len() == total {
                tracing::warn!(offset, "ignoring torn record at end of log");
                break;
            }
            return Err(StorageError::corrupted(format!(
                "checksum mismatch at offset {offset}: expected {stored:08x}, got {computed:08x}"
            )));
        }

        let payload = &rest[HEADER_SIZE..body_end];
        let record = match cipher {
            Some(cipher) => LogRecord::decode_payload(type_byte, &cipher.open(payload)?)?,
            None => LogRecord::decode_payload(type_byte, payload)?,
        };
        records.push(record);
        offset += total;
    }

    Ok(records)
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> StorageResult<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| StorageError::invalid_argument("log record field too large"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn bytes(&mut self) -> StorageResult<&'a [u8]> {
        let short = || StorageError::corrupted("record payload too short");
        let len_end = self.pos.checked_add(4).ok_or_else(short)?;
        let len_bytes = self.data.get(self.pos..len_end).ok_or_else(short)?;
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        let end = len_end.checked_add(len as usize).ok_or_else(short)?;
        let bytes = self.data.get(len_end..end).ok_or_else(short)?;
        self.pos = end;
        Ok(bytes)
    }

    fn string(&mut self) -> StorageResult<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| StorageError::corrupted("record field is not valid UTF-8"))
    }
}
