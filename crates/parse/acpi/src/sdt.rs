//! System Description Table (SDT) header and checksum utilities.

use crate::{AcpiError, read_u32};

/// Standard ACPI System Description Table header.
///
/// This 36-byte header is present at the start of every ACPI table
/// (RSDT, XSDT, MADT, SRAT, HPET, FADT, …).
#[derive(Debug, Clone, Copy)]
pub struct SdtHeader {
    /// 4-byte ASCII signature identifying the table type.
    pub signature: [u8; 4],
    /// Total length of the table, including the header, in bytes.
    pub length: u32,
    /// Revision of the table structure.
    pub revision: u8,
    /// Checksum byte; the entire table must sum to zero.
    pub checksum: u8,
    /// OEM-supplied identification string.
    pub oem_id: [u8; 6],
    /// OEM-supplied table identification string.
    pub oem_table_id: [u8; 8],
}

impl SdtHeader {
    /// The size of an SDT header in bytes.
    pub const SIZE: usize = 36;

    /// Reads a header from the start of `data`.
    ///
    /// Returns `None` if the span is shorter than [`SdtHeader::SIZE`].
    #[must_use]
    pub fn read(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            signature: data[0..4].try_into().ok()?,
            length: read_u32(data, 4)?,
            revision: data[8],
            checksum: data[9],
            oem_id: data[10..16].try_into().ok()?,
            oem_table_id: data[16..24].try_into().ok()?,
        })
    }
}

/// Sums `data` modulo 256; a valid ACPI table sums to zero.
#[must_use]
pub fn checksum_valid(data: &[u8]) -> bool {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)) == 0
}

/// Validates the standard header sequence over a full table span:
/// signature match, length within the span, checksum over `length` bytes.
///
/// Returns the validated header and the table bytes trimmed to `length`.
///
/// # Errors
///
/// [`AcpiError::TruncatedData`], [`AcpiError::InvalidSignature`], or
/// [`AcpiError::InvalidChecksum`].
pub fn validate<'a>(data: &'a [u8], expected_signature: &[u8; 4]) -> Result<(SdtHeader, &'a [u8]), AcpiError> {
    let header = SdtHeader::read(data).ok_or(AcpiError::TruncatedData)?;
    if &header.signature != expected_signature {
        return Err(AcpiError::InvalidSignature);
    }
    let length = header.length as usize;
    if length < SdtHeader::SIZE || length > data.len() {
        return Err(AcpiError::TruncatedData);
    }
    let table = &data[..length];
    if !checksum_valid(table) {
        return Err(AcpiError::InvalidChecksum);
    }
    Ok((header, table))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a minimal table: header + payload with a fixed checksum.
    pub(crate) fn build_table(signature: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let length = SdtHeader::SIZE + payload.len();
        let mut table = vec![0u8; length];
        table[0..4].copy_from_slice(signature);
        table[4..8].copy_from_slice(&(length as u32).to_le_bytes());
        table[8] = 2; // revision
        table[10..16].copy_from_slice(b"MUONOS");
        table[SdtHeader::SIZE..].copy_from_slice(payload);

        let sum: u8 = table.iter().fold(0u8, |s, b| s.wrapping_add(*b));
        table[9] = 0u8.wrapping_sub(sum);
        table
    }

    #[test]
    fn header_roundtrip() {
        let table = build_table(b"APIC", &[1, 2, 3, 4]);
        let header = SdtHeader::read(&table).unwrap();
        assert_eq!(&header.signature, b"APIC");
        assert_eq!(header.length as usize, table.len());
        assert_eq!(&header.oem_id, b"MUONOS");
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut table = build_table(b"APIC", &[0; 8]);
        assert!(checksum_valid(&table));
        table[40] ^= 0xFF;
        assert!(!checksum_valid(&table));
    }

    #[test]
    fn validate_sequence() {
        let table = build_table(b"SRAT", &[0; 16]);
        let (header, span) = validate(&table, b"SRAT").unwrap();
        assert_eq!(span.len(), header.length as usize);

        assert_eq!(
            validate(&table, b"APIC").unwrap_err(),
            AcpiError::InvalidSignature
        );
        assert_eq!(
            validate(&table[..20], b"SRAT").unwrap_err(),
            AcpiError::TruncatedData
        );
    }
}
