//! Removal of the SRCS records kindlegen embeds in its output.
//!
//! kindlegen appends a copy of its inputs (the "sources" section) to every
//! MOBI it produces, which can double the file size. The section is a run of
//! consecutive PDB records announced by the MOBI header; dropping it means
//! rewriting the record table around the gap and patching the header (and
//! the EXTH boundary pointer, when present) to match.
//!
//! PDB layout, big endian:
//!
//! ```text
//! 0x00  name[32] ... 0x3C type+creator "BOOKMOBI"
//! 0x44  unique id seed (u32)   0x4C record count (u16)
//! 0x4E  record table: count x { offset: u32, attributes+uid: u32 }
//! ```

use crate::error::{ErrorKind, Result};
use exn::OptionExt;

const MAGIC: &[u8] = b"BOOKMOBI";
const MAGIC_OFFSET: usize = 0x3c;
const UID_SEED: usize = 0x44;
const RECORD_COUNT: usize = 0x4c;
const RECORD_TABLE: usize = 0x4e;
const RECORD_INFO: usize = 8;

// Offsets relative to record 0.
const MOBI_HEADER_LENGTH: usize = 0x14;
const EXTH_FLAGS: usize = 0x80;
const SRCS_INDEX: usize = 0xe0;
const SRCS_COUNT: usize = 0xe4;
const MOBI_HEADER_START: usize = 16;

const EXTH_PRESENT: u32 = 0x40;
const EXTH_BOUNDARY: u32 = 121;
const NO_SRCS: u32 = 0xffff_ffff;

fn read_u16(data: &[u8], at: usize) -> Result<u16> {
    let bytes = data.get(at..at + 2).ok_or_raise(|| ErrorKind::InvalidFormat("truncated"))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], at: usize) -> Result<u32> {
    let bytes = data.get(at..at + 4).ok_or_raise(|| ErrorKind::InvalidFormat("truncated"))?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn write_u32(data: &mut [u8], at: usize, value: u32) -> Result<()> {
    let bytes = data.get_mut(at..at + 4).ok_or_raise(|| ErrorKind::InvalidFormat("truncated"))?;
    bytes.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Returns `data` without its SRCS records.
///
/// Fails with [`ErrorKind::NoSources`] when the header announces none, and
/// with [`ErrorKind::InvalidFormat`] when the file isn't a well-formed MOBI.
pub fn strip_srcs(data: &[u8]) -> Result<Vec<u8>> {
    if data.get(MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()) != Some(MAGIC) {
        exn::bail!(ErrorKind::InvalidFormat("not a MOBI file"));
    }
    let count = read_u16(data, RECORD_COUNT)? as usize;
    let records = (0..count)
        .map(|i| {
            let at = RECORD_TABLE + i * RECORD_INFO;
            Ok((read_u32(data, at)? as usize, read_u32(data, at + 4)?))
        })
        .collect::<Result<Vec<_>>>()?;
    if count < 2 {
        exn::bail!(ErrorKind::InvalidFormat("missing records"));
    }
    if records.windows(2).any(|pair| pair[0].0 > pair[1].0) {
        exn::bail!(ErrorKind::InvalidFormat("record offsets out of order"));
    }
    if records[count - 1].0 > data.len() {
        exn::bail!(ErrorKind::InvalidFormat("records past end of file"));
    }
    let record0 = records[0].0..records[1].0;
    let header = data.get(record0.clone()).ok_or_raise(|| ErrorKind::InvalidFormat("record 0 out of bounds"))?;

    let srcs_index = read_u32(header, SRCS_INDEX)?;
    let srcs_count = read_u32(header, SRCS_COUNT)? as usize;
    if srcs_index == NO_SRCS || srcs_count == 0 {
        exn::bail!(ErrorKind::NoSources);
    }
    let start = srcs_index as usize;
    let end = start + srcs_count;
    if start == 0 || end > count {
        exn::bail!(ErrorKind::InvalidFormat("SRCS records out of range"));
    }
    let srcs_offset = records[start].0;
    let next_offset = records.get(end).map(|r| r.0).unwrap_or(data.len());
    if data.get(srcs_offset..srcs_offset + 4) != Some(b"SRCS".as_slice()) {
        exn::bail!(ErrorKind::InvalidFormat("SRCS record not found"));
    }
    let srcs_length = next_offset - srcs_offset;
    let remaining = count - srcs_count;
    let table_shrink = RECORD_INFO * srcs_count;
    let table_end = RECORD_TABLE + remaining * RECORD_INFO;
    let first = records[0].0.checked_sub(table_shrink).filter(|&f| f >= table_end);
    let first = first.ok_or_raise(|| ErrorKind::InvalidFormat("record table overlaps records"))?;
    let shift = |offset: usize, by: usize| {
        offset
            .checked_sub(by)
            .and_then(|shifted| u32::try_from(shifted).ok())
            .ok_or_raise(|| ErrorKind::InvalidFormat("record offset out of range"))
    };

    let mut out = Vec::with_capacity(data.len() - srcs_length);
    out.extend_from_slice(&data[..UID_SEED]);
    out.extend_from_slice(&((remaining * 2 + 1) as u32).to_be_bytes());
    out.extend_from_slice(&data[UID_SEED + 4..RECORD_COUNT]);
    out.extend_from_slice(&(remaining as u16).to_be_bytes());
    for &(offset, attributes) in &records[..start] {
        out.extend_from_slice(&shift(offset, table_shrink)?.to_be_bytes());
        out.extend_from_slice(&attributes.to_be_bytes());
    }
    for (i, &(offset, _)) in records.iter().enumerate().skip(end) {
        out.extend_from_slice(&shift(offset, table_shrink + srcs_length)?.to_be_bytes());
        out.extend_from_slice(&((2 * (i - srcs_count)) as u32).to_be_bytes());
    }
    let kept = data.get(records[0].0..srcs_offset).zip(data.get(next_offset..));
    let (before, after) = kept.ok_or_raise(|| ErrorKind::InvalidFormat("records out of bounds"))?;
    out.resize(first, 0);
    out.extend_from_slice(before);
    out.extend_from_slice(after);

    let header = out
        .get_mut(first..first + record0.len())
        .ok_or_raise(|| ErrorKind::InvalidFormat("record 0 out of bounds"))?;
    write_u32(header, SRCS_INDEX, NO_SRCS)?;
    write_u32(header, SRCS_COUNT, 0)?;
    if let Err(e) = patch_boundary(header, srcs_index, srcs_count as u32) {
        tracing::debug!(error = ?e, "EXTH boundary pointer left unchanged");
    }
    tracing::debug!(removed = srcs_count, bytes = srcs_length, "SRCS records stripped");
    Ok(out)
}

/// Shifts the EXTH 121 boundary pointer back over the removed records.
fn patch_boundary(header: &mut [u8], srcs_index: u32, srcs_count: u32) -> Result<()> {
    if read_u32(header, EXTH_FLAGS)? & EXTH_PRESENT == 0 {
        return Ok(());
    }
    let exth = MOBI_HEADER_START + read_u32(header, MOBI_HEADER_LENGTH)? as usize;
    if header.get(exth..exth + 4) != Some(b"EXTH".as_slice()) {
        exn::bail!(ErrorKind::InvalidFormat("EXTH block not found"));
    }
    let items = read_u32(header, exth + 8)?;
    let mut at = exth + 12;
    for _ in 0..items {
        let kind = read_u32(header, at)?;
        let size = read_u32(header, at + 4)? as usize;
        if size < 8 {
            exn::bail!(ErrorKind::InvalidFormat("malformed EXTH record"));
        }
        if kind == EXTH_BOUNDARY {
            let boundary = read_u32(header, at + 8)?;
            if srcs_index <= boundary {
                // A pointer into the removed run lands on the record that follows it.
                let patched = boundary.checked_sub(srcs_count).filter(|&b| b >= srcs_index).unwrap_or(srcs_index);
                write_u32(header, at + 8, patched)?;
            }
        }
        at += size;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const HEADER_SIZE: usize = 0x130;
    const EXTH_AT: usize = 0xf8;

    /// Minimal MOBI: record 0 header, a text record, `srcs` SRCS records and
    /// an image record.
    pub(crate) fn mobi(srcs: usize, boundary: Option<u32>) -> Vec<u8> {
        let mut header = vec![0u8; HEADER_SIZE];
        header[16..20].copy_from_slice(b"MOBI");
        header[MOBI_HEADER_LENGTH..MOBI_HEADER_LENGTH + 4].copy_from_slice(&((EXTH_AT - 16) as u32).to_be_bytes());
        let (index, count) = if srcs == 0 { (NO_SRCS, 0) } else { (2, srcs as u32) };
        header[SRCS_INDEX..SRCS_INDEX + 4].copy_from_slice(&index.to_be_bytes());
        header[SRCS_COUNT..SRCS_COUNT + 4].copy_from_slice(&count.to_be_bytes());
        if let Some(boundary) = boundary {
            header[EXTH_FLAGS..EXTH_FLAGS + 4].copy_from_slice(&EXTH_PRESENT.to_be_bytes());
            let mut exth = b"EXTH".to_vec();
            exth.extend_from_slice(&24u32.to_be_bytes());
            exth.extend_from_slice(&1u32.to_be_bytes());
            exth.extend_from_slice(&EXTH_BOUNDARY.to_be_bytes());
            exth.extend_from_slice(&12u32.to_be_bytes());
            exth.extend_from_slice(&boundary.to_be_bytes());
            header[EXTH_AT..EXTH_AT + exth.len()].copy_from_slice(&exth);
        }
        let mut records = vec![header, b"TEXT record".to_vec()];
        for i in 0..srcs {
            records.push([b"SRCS".as_slice(), &[i as u8; 12]].concat());
        }
        records.push(b"IMAGE data".to_vec());
        pdb(&records)
    }

    fn pdb(records: &[Vec<u8>]) -> Vec<u8> {
        let mut data = vec![0u8; RECORD_TABLE];
        data[..4].copy_from_slice(b"Test");
        data[MAGIC_OFFSET..MAGIC_OFFSET + 8].copy_from_slice(MAGIC);
        data[UID_SEED..UID_SEED + 4].copy_from_slice(&((records.len() * 2 - 1) as u32).to_be_bytes());
        data[RECORD_COUNT..RECORD_COUNT + 2].copy_from_slice(&(records.len() as u16).to_be_bytes());
        let mut offset = RECORD_TABLE + records.len() * RECORD_INFO + 2;
        for (i, record) in records.iter().enumerate() {
            data.extend_from_slice(&(offset as u32).to_be_bytes());
            data.extend_from_slice(&((i * 2) as u32).to_be_bytes());
            offset += record.len();
        }
        data.extend_from_slice(&[0, 0]);
        for record in records {
            data.extend_from_slice(record);
        }
        data
    }

    /// Records of a PDB as `(bytes, uid)`.
    fn records(data: &[u8]) -> Vec<(Vec<u8>, u32)> {
        let count = read_u16(data, RECORD_COUNT).unwrap() as usize;
        (0..count)
            .map(|i| {
                let at = RECORD_TABLE + i * RECORD_INFO;
                let start = read_u32(data, at).unwrap() as usize;
                let end = match i + 1 < count {
                    true => read_u32(data, at + RECORD_INFO).unwrap() as usize,
                    false => data.len(),
                };
                (data[start..end].to_vec(), read_u32(data, at + 4).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_strip_removes_sources() {
        let original = mobi(2, None);
        let stripped = strip_srcs(&original).unwrap();
        let records = records(&stripped);
        assert_eq!(records.len(), 3);
        assert_eq!(read_u32(&stripped, UID_SEED).unwrap(), 7);
        assert_eq!(records[1], (b"TEXT record".to_vec(), 2));
        assert_eq!(records[2], (b"IMAGE data".to_vec(), 4));
        let header = &records[0].0;
        assert_eq!(header.len(), HEADER_SIZE);
        assert_eq!(read_u32(header, SRCS_INDEX).unwrap(), NO_SRCS);
        assert_eq!(read_u32(header, SRCS_COUNT).unwrap(), 0);
        assert_eq!(stripped.len(), original.len() - 2 * (16 + RECORD_INFO));
        // Padding between the table and the first record is preserved.
        assert_eq!(read_u32(&stripped, RECORD_TABLE).unwrap() as usize, RECORD_TABLE + 3 * RECORD_INFO + 2);
    }

    #[test]
    fn test_strip_patches_boundary() {
        let stripped = strip_srcs(&mobi(1, Some(3))).unwrap();
        let header = &records(&stripped)[0].0;
        assert_eq!(read_u32(header, EXTH_AT + 20).unwrap(), 2);
    }

    #[test]
    fn test_strip_keeps_boundary_before_sources() {
        let stripped = strip_srcs(&mobi(1, Some(1))).unwrap();
        let header = &records(&stripped)[0].0;
        assert_eq!(read_u32(header, EXTH_AT + 20).unwrap(), 1);
    }

    #[test]
    fn test_no_sources() {
        let err = strip_srcs(&mobi(0, None)).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NoSources));
    }

    #[test]
    fn test_not_mobi() {
        let mut data = mobi(1, None);
        data[MAGIC_OFFSET..MAGIC_OFFSET + 8].copy_from_slice(b"TEXtREAd");
        let err = strip_srcs(&data).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidFormat(_)));
        let err = strip_srcs(&data[..40]).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidFormat(_)));
    }

    #[test]
    fn test_index_without_srcs_record() {
        let mut data = mobi(1, None);
        let records = self::records(&data);
        let start = data.len() - records[3].0.len() - records[2].0.len();
        data[start..start + 4].copy_from_slice(b"XXXX");
        let err = strip_srcs(&data).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidFormat(_)));
    }

    /// Overwrites the offset of record `index` in the record table.
    fn set_offset(data: &mut [u8], index: usize, offset: u32) {
        let at = RECORD_TABLE + index * RECORD_INFO;
        data[at..at + 4].copy_from_slice(&offset.to_be_bytes());
    }

    #[test]
    fn test_truncated_document() {
        let data = mobi(2, None);
        let err = strip_srcs(&data[..data.len() - 20]).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidFormat(_)));
    }

    #[test]
    fn test_offsets_out_of_order() {
        let mut data = mobi(2, None);
        set_offset(&mut data, 4, 5);
        let err = strip_srcs(&data).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidFormat(_)));
    }

    #[test]
    fn test_record_table_overlapping_records() {
        let mut data = mobi(2, None);
        set_offset(&mut data, 0, 8);
        let err = strip_srcs(&data).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidFormat(_)));
    }

    #[test]
    fn test_corrupted_record_table_never_panics() {
        let original = mobi(2, Some(3));
        let table_end = RECORD_TABLE + 5 * RECORD_INFO;
        for at in RECORD_COUNT..table_end {
            for value in [0x00, 0x01, 0x05, 0x7f, 0x80, 0xff] {
                let mut data = original.clone();
                data[at] = value;
                // Either a valid document comes out or the corruption is reported.
                if let Err(e) = strip_srcs(&data) {
                    assert!(matches!(&*e, ErrorKind::InvalidFormat(_) | ErrorKind::NoSources), "{at:#x}={value:#x}");
                }
            }
        }
    }
}
