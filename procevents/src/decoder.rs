//! Field-by-field decoding of the fixed-layout records written by the kernel
//! programs.
//!
//! Records are `u32 pid | u32 ppid | u32 exit_code | u64 duration_ns |
//! char[16] comm | char[127] filename`, in the byte order of the loaded
//! object. Anything after `filename` is ignored.

use procevents_common::{MAX_FILENAME_LEN, TASK_COMM_LEN};
use serde::Serialize;

use crate::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// Reads `EI_DATA` from an ELF identification header.
    ///
    /// Returns `None` when the bytes are not an ELF object or the data
    /// encoding is neither `ELFDATA2LSB` nor `ELFDATA2MSB`.
    pub fn from_elf_ident(object: &[u8]) -> Option<Self> {
        const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
        const EI_DATA: usize = 5;

        if object.len() <= EI_DATA || &object[..ELF_MAGIC.len()] != ELF_MAGIC {
            return None;
        }
        match object[EI_DATA] {
            1 => Some(ByteOrder::Little),
            2 => Some(ByteOrder::Big),
            _ => None,
        }
    }
}

/// A decoded process lifecycle record, serialized as one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    #[serde(rename = "Pid")]
    pub pid: i64,
    #[serde(rename = "PPid")]
    pub ppid: i64,
    /// Only meaningful for exit records.
    #[serde(rename = "ExitCode")]
    pub exit_code: i64,
    /// Process lifetime, only meaningful for exit records.
    #[serde(rename = "DurationNs")]
    pub duration_ns: i64,
    #[serde(rename = "Comm")]
    pub comm: String,
    #[serde(rename = "FileName")]
    pub file_name: String,
}

impl Event {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Stateless cursor decoder. Every read takes an offset and hands back the
/// offset just past the bytes it consumed.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    byte_order: ByteOrder,
}

impl Decoder {
    pub fn new(byte_order: ByteOrder) -> Self {
        Self { byte_order }
    }

    pub fn read_u32_as_int(&self, buf: &[u8], offset: usize) -> Result<(i64, usize), DecodeError> {
        let bytes = field(buf, offset, 4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        let value = match self.byte_order {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        };
        Ok((i64::from(value), offset + 4))
    }

    /// Values above `i64::MAX` wrap to negative numbers.
    pub fn read_u64_as_int(&self, buf: &[u8], offset: usize) -> Result<(i64, usize), DecodeError> {
        let bytes = field(buf, offset, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        let value = match self.byte_order {
            ByteOrder::Little => u64::from_le_bytes(raw),
            ByteOrder::Big => u64::from_be_bytes(raw),
        };
        Ok((value as i64, offset + 8))
    }

    /// Reads a NUL-padded string of exactly `width` bytes.
    ///
    /// The text stops at the first zero byte, or spans the whole width when
    /// there is none. Invalid UTF-8 is replaced rather than rejected.
    pub fn read_fixed_string(
        &self,
        buf: &[u8],
        offset: usize,
        width: usize,
    ) -> Result<(String, usize), DecodeError> {
        let bytes = field(buf, offset, width)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(width);
        let text = String::from_utf8_lossy(&bytes[..end]).into_owned();
        Ok((text, offset + width))
    }

    pub fn decode_event(&self, buf: &[u8]) -> Result<Event, DecodeError> {
        let (pid, off) = self.read_u32_as_int(buf, 0)?;
        let (ppid, off) = self.read_u32_as_int(buf, off)?;
        let (exit_code, off) = self.read_u32_as_int(buf, off)?;
        let (duration_ns, off) = self.read_u64_as_int(buf, off)?;
        let (comm, off) = self.read_fixed_string(buf, off, TASK_COMM_LEN)?;
        let (file_name, _) = self.read_fixed_string(buf, off, MAX_FILENAME_LEN)?;

        Ok(Event {
            pid,
            ppid,
            exit_code,
            duration_ns,
            comm,
            file_name,
        })
    }
}

fn field(buf: &[u8], offset: usize, width: usize) -> Result<&[u8], DecodeError> {
    offset
        .checked_add(width)
        .and_then(|end| buf.get(offset..end))
        .ok_or(DecodeError::TruncatedRecord {
            offset,
            needed: width,
            available: buf.len().saturating_sub(offset),
        })
}

/// Bytes covered by the decoded fields.
pub const RECORD_LEN: usize = 4 + 4 + 4 + 8 + TASK_COMM_LEN + MAX_FILENAME_LEN;
