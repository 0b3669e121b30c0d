//! NCZ decoding: zstd-compressed NCAs back into valid encrypted NCAs.
//!
//! An NCZ keeps the first 0x4000 bytes of the NCA verbatim, then stores a
//! section table (`NCZSECTN`) describing the per-section AES-CTR keys of
//! the original NCA, then the compressed body: either a block table
//! (`NCZBLOCK`) followed by independently compressed blocks, or one solid
//! zstd stream.
//!
//! Decoding streams: the header passes through, the body is decompressed
//! in bounded chunks, each chunk is re-encrypted with the covering
//! section's key and counter, and only then handed to the sink. The full
//! NCA never exists in memory. A sink failure aborts the pipeline before
//! any further write.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::crypto::aes_ctr_apply;
use crate::error::{Error, Result};

/// Size of the pass-through NCA header region.
pub const UNCOMPRESSABLE_HEADER_SIZE: u64 = 0x4000;

/// Section-table magic at offset 0x4000.
pub const SECTION_MAGIC: &[u8; 8] = b"NCZSECTN";

/// Block-table magic following the section table (block mode only).
pub const BLOCK_MAGIC: &[u8; 8] = b"NCZBLOCK";

/// Stream-mode flush granularity.
const FLUSH_BUFFER_SIZE: usize = 512 * 1024;

/// Upper bound on the section count; anything larger is a corrupt table.
const MAX_SECTIONS: u64 = 0x100;

/// One 0x40-byte NCZ section record.
#[derive(Debug, Clone)]
pub struct NczSection {
    /// Byte offset of this section within the plaintext NCA.
    pub offset: u64,
    /// Section size in bytes.
    pub size: u64,
    /// Encryption type; >= 3 means AES-CTR re-encryption applies.
    pub crypto_type: u64,
    /// AES key for this section.
    pub crypto_key: [u8; 16],
    /// Base counter; the low eight bytes are replaced by the block offset.
    pub crypto_counter: [u8; 16],
}

impl NczSection {
    fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.offset + self.size
    }
}

/// Parsed `NCZBLOCK` table.
#[derive(Debug, Clone)]
pub struct NczBlockHeader {
    pub version: u8,
    pub block_type: u8,
    /// log2 of the decompressed block size, 14..=32.
    pub block_size_exponent: u8,
    pub block_count: u32,
    pub decompressed_size: u64,
    /// Compressed size of each block, in order.
    pub block_sizes: Vec<u32>,
}

/// Decode metadata returned alongside the sink output.
#[derive(Debug)]
pub struct NczDecodeInfo {
    /// Size of the reconstructed NCA.
    pub nca_size: u64,
    pub sections: Vec<NczSection>,
    /// Present in block mode only.
    pub block_header: Option<NczBlockHeader>,
}

/// Decompress an NCZ from `reader` into `sink`, re-encrypting the body with
/// the section keys. The sink receives a valid encrypted NCA in strictly
/// increasing offset order.
pub fn decompress_ncz<R: Read + Seek, W: Write>(
    reader: &mut R,
    sink: &mut W,
) -> Result<NczDecodeInfo> {
    reader.seek(SeekFrom::Start(0))?;

    // NCA header region passes through untouched.
    let mut header = vec![0u8; UNCOMPRESSABLE_HEADER_SIZE as usize];
    reader.read_exact(&mut header)?;
    sink.write_all(&header).map_err(Error::SinkWrite)?;
    drop(header);

    let sections = read_section_table(reader)?;

    // Either a block table follows, or these bytes already start the zstd
    // stream.
    let table_end = reader.stream_position()?;
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;

    let mut writer = ReencryptingSink {
        sink,
        sections: &sections,
        position: UNCOMPRESSABLE_HEADER_SIZE,
        failed: false,
    };

    if &magic == BLOCK_MAGIC {
        let block_header = read_block_header(reader)?;
        let nca_size = UNCOMPRESSABLE_HEADER_SIZE + block_header.decompressed_size;
        emit_blocks(reader, &mut writer, &block_header)?;
        tracing::debug!(nca_size, blocks = block_header.block_count, "NCZ block decode done");
        Ok(NczDecodeInfo {
            nca_size,
            sections,
            block_header: Some(block_header),
        })
    } else {
        reader.seek(SeekFrom::Start(table_end))?;
        let nca_size = sections
            .iter()
            .map(|s| s.offset + s.size)
            .max()
            .unwrap_or(UNCOMPRESSABLE_HEADER_SIZE);
        emit_stream(reader, &mut writer)?;
        tracing::debug!(nca_size, "NCZ stream decode done");
        Ok(NczDecodeInfo {
            nca_size,
            sections,
            block_header: None,
        })
    }
}

fn read_section_table<R: Read + Seek>(reader: &mut R) -> Result<Vec<NczSection>> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != SECTION_MAGIC {
        return Err(Error::InvalidMagic {
            location: "NCZ section table",
        });
    }

    let section_count = reader.read_u64::<LittleEndian>()?;
    if section_count == 0 || section_count > MAX_SECTIONS {
        return Err(Error::InvalidFieldRange {
            field: "NCZ section count",
            value: section_count,
        });
    }

    let mut sections = Vec::with_capacity(section_count as usize);
    for _ in 0..section_count {
        let offset = reader.read_u64::<LittleEndian>()?;
        let size = reader.read_u64::<LittleEndian>()?;
        let crypto_type = reader.read_u64::<LittleEndian>()?;
        let _padding = reader.read_u64::<LittleEndian>()?;
        let mut crypto_key = [0u8; 16];
        reader.read_exact(&mut crypto_key)?;
        let mut crypto_counter = [0u8; 16];
        reader.read_exact(&mut crypto_counter)?;
        sections.push(NczSection {
            offset,
            size,
            crypto_type,
            crypto_key,
            crypto_counter,
        });
    }
    Ok(sections)
}

fn read_block_header<R: Read>(reader: &mut R) -> Result<NczBlockHeader> {
    let version = reader.read_u8()?;
    if version != 2 {
        return Err(Error::InvalidFieldRange {
            field: "NCZ block version",
            value: version as u64,
        });
    }
    let block_type = reader.read_u8()?;
    if block_type != 1 {
        return Err(Error::InvalidFieldRange {
            field: "NCZ block type",
            value: block_type as u64,
        });
    }
    let _unused = reader.read_u8()?;
    let block_size_exponent = reader.read_u8()?;
    if !(14..=32).contains(&block_size_exponent) {
        return Err(Error::InvalidFieldRange {
            field: "NCZ block size exponent",
            value: block_size_exponent as u64,
        });
    }
    let block_count = reader.read_u32::<LittleEndian>()?;
    let decompressed_size = reader.read_u64::<LittleEndian>()?;

    let mut block_sizes = Vec::with_capacity(block_count as usize);
    for _ in 0..block_count {
        block_sizes.push(reader.read_u32::<LittleEndian>()?);
    }

    Ok(NczBlockHeader {
        version,
        block_type,
        block_size_exponent,
        block_count,
        decompressed_size,
        block_sizes,
    })
}

fn emit_blocks<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut ReencryptingSink<'_, W>,
    header: &NczBlockHeader,
) -> Result<()> {
    let block_size = 1u64 << header.block_size_exponent;
    let mut remaining = header.decompressed_size;

    for (index, &compressed_size) in header.block_sizes.iter().enumerate() {
        let expected = remaining.min(block_size);
        let mut compressed = vec![0u8; compressed_size as usize];
        reader.read_exact(&mut compressed)?;

        // Blocks whose compressed size reaches the decompressed size are
        // stored raw.
        let mut data = if (compressed_size as u64) < expected {
            zstd::bulk::decompress(&compressed, expected as usize).map_err(|e| Error::Zstd {
                phase: "block decompress",
                message: e.to_string(),
            })?
        } else {
            compressed
        };
        if data.len() as u64 != expected {
            return Err(Error::Zstd {
                phase: "block decompress",
                message: format!(
                    "block {index}: expected {expected} bytes, produced {}",
                    data.len()
                ),
            });
        }

        writer.emit(&mut data)?;
        remaining -= expected;
    }
    Ok(())
}

fn emit_stream<R: Read, W: Write>(reader: &mut R, writer: &mut ReencryptingSink<'_, W>) -> Result<()> {
    let mut decoder = zstd::stream::read::Decoder::new(reader).map_err(|e| Error::Zstd {
        phase: "stream init",
        message: e.to_string(),
    })?;

    let mut flush = vec![0u8; FLUSH_BUFFER_SIZE];
    let mut filled = 0usize;
    loop {
        let n = decoder.read(&mut flush[filled..]).map_err(|e| Error::Zstd {
            phase: "stream decompress",
            message: e.to_string(),
        })?;
        if n == 0 {
            if filled > 0 {
                writer.emit(&mut flush[..filled])?;
            }
            return Ok(());
        }
        filled += n;
        if filled == flush.len() {
            writer.emit(&mut flush)?;
            filled = 0;
        }
    }
}

/// Wraps the caller's sink: every chunk is re-encrypted at its NCA offset
/// before being written, and a write failure poisons the writer so nothing
/// further reaches the sink.
struct ReencryptingSink<'a, W: Write> {
    sink: &'a mut W,
    sections: &'a [NczSection],
    position: u64,
    failed: bool,
}

impl<W: Write> ReencryptingSink<'_, W> {
    fn emit(&mut self, buf: &mut [u8]) -> Result<()> {
        debug_assert!(!self.failed, "write after sink failure");
        reencrypt(self.sections, self.position, buf)?;
        if let Err(e) = self.sink.write_all(buf) {
            self.failed = true;
            return Err(Error::SinkWrite(e));
        }
        self.position += buf.len() as u64;
        Ok(())
    }
}

/// Re-encrypt `buf`, which sits at NCA offset `offset`, section by section.
/// A single chunk may span several sections; any byte outside every section
/// is an error.
fn reencrypt(sections: &[NczSection], mut offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut pos = 0usize;
    while pos < buf.len() {
        let section = sections
            .iter()
            .find(|s| s.contains(offset))
            .ok_or(Error::NoSectionForOffset { offset })?;

        let in_section = (section.offset + section.size - offset) as usize;
        let chunk = in_section.min(buf.len() - pos);
        if section.crypto_type >= 3 {
            let counter = ncz_counter(&section.crypto_counter, offset);
            aes_ctr_apply(&section.crypto_key, &counter, &mut buf[pos..pos + chunk]);
        }
        pos += chunk;
        offset += chunk as u64;
    }
    Ok(())
}

/// CTR for a chunk: the section counter's high half plus the 16-byte block
/// index of the NCA offset, big-endian.
fn ncz_counter(section_counter: &[u8; 16], offset: u64) -> [u8; 16] {
    let mut counter = [0u8; 16];
    counter[..8].copy_from_slice(&section_counter[..8]);
    counter[8..].copy_from_slice(&(offset / 16).to_be_bytes());
    counter
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Cursor;

    fn sample_key() -> [u8; 16] {
        core::array::from_fn(|i| i as u8)
    }

    fn write_ncz_prelude(sections: &[NczSection]) -> Vec<u8> {
        let mut out = vec![0xEEu8; UNCOMPRESSABLE_HEADER_SIZE as usize];
        out.extend_from_slice(SECTION_MAGIC);
        out.write_u64::<LittleEndian>(sections.len() as u64).unwrap();
        for s in sections {
            out.write_u64::<LittleEndian>(s.offset).unwrap();
            out.write_u64::<LittleEndian>(s.size).unwrap();
            out.write_u64::<LittleEndian>(s.crypto_type).unwrap();
            out.write_u64::<LittleEndian>(0).unwrap();
            out.extend_from_slice(&s.crypto_key);
            out.extend_from_slice(&s.crypto_counter);
        }
        out
    }

    fn ctr_section() -> NczSection {
        NczSection {
            offset: UNCOMPRESSABLE_HEADER_SIZE,
            size: 0x10000,
            crypto_type: 3,
            crypto_key: sample_key(),
            crypto_counter: sample_key(),
        }
    }

    /// Reference re-encryption of a whole body at offset 0x4000.
    fn expected_ctr_body(section: &NczSection, plaintext: &[u8]) -> Vec<u8> {
        let mut data = plaintext.to_vec();
        let counter = ncz_counter(&section.crypto_counter, section.offset);
        aes_ctr_apply(&section.crypto_key, &counter, &mut data);
        data
    }

    #[test]
    fn test_stream_mode_reencrypts_zeros() {
        let section = ctr_section();
        let plaintext = vec![0u8; 0x10000];
        let compressed = zstd::bulk::compress(&plaintext, 3).unwrap();

        let mut ncz = write_ncz_prelude(std::slice::from_ref(&section));
        ncz.extend_from_slice(&compressed);

        let mut sink = Vec::new();
        let info = decompress_ncz(&mut Cursor::new(ncz), &mut sink).unwrap();

        assert_eq!(info.nca_size, 0x14000);
        assert!(info.block_header.is_none());
        assert_eq!(info.sections.len(), 1);
        assert_eq!(sink.len(), 0x14000);
        assert_eq!(&sink[..0x4000], &vec![0xEEu8; 0x4000][..]);
        assert_eq!(&sink[0x4000..], &expected_ctr_body(&section, &plaintext)[..]);
    }

    #[test]
    fn test_stream_mode_flush_boundaries() {
        // Body larger than the 512 KiB flush buffer exercises the partial
        // tail path and counter continuity across flushes.
        let section = NczSection {
            size: 0xA0000,
            ..ctr_section()
        };
        let plaintext: Vec<u8> = (0..0xA0000u32).map(|i| (i % 253) as u8).collect();
        let compressed = zstd::bulk::compress(&plaintext, 1).unwrap();

        let mut ncz = write_ncz_prelude(std::slice::from_ref(&section));
        ncz.extend_from_slice(&compressed);

        let mut sink = Vec::new();
        decompress_ncz(&mut Cursor::new(ncz), &mut sink).unwrap();
        assert_eq!(&sink[0x4000..], &expected_ctr_body(&section, &plaintext)[..]);
    }

    #[test]
    fn test_block_mode_mixed_blocks() {
        let section = NczSection {
            size: 0x8000,
            ..ctr_section()
        };

        // Block 0 compresses, block 1 is stored raw.
        let block0 = vec![0u8; 0x4000];
        let block1: Vec<u8> = (0..0x4000u32).map(|i| (i ^ (i >> 5)) as u8).collect();
        let compressed0 = zstd::bulk::compress(&block0, 3).unwrap();
        assert!(compressed0.len() < 0x4000);

        let mut ncz = write_ncz_prelude(std::slice::from_ref(&section));
        ncz.extend_from_slice(BLOCK_MAGIC);
        ncz.push(2); // version
        ncz.push(1); // type
        ncz.push(0); // unused
        ncz.push(14); // block size exponent
        ncz.write_u32::<LittleEndian>(2).unwrap();
        ncz.write_u64::<LittleEndian>(0x8000).unwrap();
        ncz.write_u32::<LittleEndian>(compressed0.len() as u32).unwrap();
        ncz.write_u32::<LittleEndian>(0x4000).unwrap();
        ncz.extend_from_slice(&compressed0);
        ncz.extend_from_slice(&block1);

        let mut sink = Vec::new();
        let info = decompress_ncz(&mut Cursor::new(ncz), &mut sink).unwrap();

        assert_eq!(info.nca_size, 0x4000 + 0x8000);
        let header = info.block_header.unwrap();
        assert_eq!(header.block_size_exponent, 14);
        assert_eq!(header.block_sizes.len(), 2);

        let mut plaintext = block0;
        plaintext.extend_from_slice(&block1);
        assert_eq!(&sink[0x4000..], &expected_ctr_body(&section, &plaintext)[..]);
    }

    #[test]
    fn test_plain_sections_pass_through() {
        let section = NczSection {
            crypto_type: 0,
            ..ctr_section()
        };
        let plaintext: Vec<u8> = (0..0x10000u32).map(|i| i as u8).collect();
        let compressed = zstd::bulk::compress(&plaintext, 3).unwrap();

        let mut ncz = write_ncz_prelude(std::slice::from_ref(&section));
        ncz.extend_from_slice(&compressed);

        let mut sink = Vec::new();
        decompress_ncz(&mut Cursor::new(ncz), &mut sink).unwrap();
        assert_eq!(&sink[0x4000..], &plaintext[..]);
    }

    #[test]
    fn test_chunk_spanning_two_sections() {
        // First section plain, second encrypted; one stream covers both.
        let plain = NczSection {
            offset: 0x4000,
            size: 0x1000,
            crypto_type: 0,
            crypto_key: [0; 16],
            crypto_counter: [0; 16],
        };
        let encrypted = NczSection {
            offset: 0x5000,
            size: 0x3000,
            crypto_type: 3,
            crypto_key: [0x77; 16],
            crypto_counter: [0x20; 16],
        };
        let plaintext = vec![0x42u8; 0x4000];
        let compressed = zstd::bulk::compress(&plaintext, 3).unwrap();

        let mut ncz = write_ncz_prelude(&[plain, encrypted.clone()]);
        ncz.extend_from_slice(&compressed);

        let mut sink = Vec::new();
        decompress_ncz(&mut Cursor::new(ncz), &mut sink).unwrap();

        assert_eq!(&sink[0x4000..0x5000], &plaintext[..0x1000]);
        let mut tail = plaintext[0x1000..].to_vec();
        let counter = ncz_counter(&encrypted.crypto_counter, 0x5000);
        aes_ctr_apply(&encrypted.crypto_key, &counter, &mut tail);
        assert_eq!(&sink[0x5000..], &tail[..]);
    }

    #[test]
    fn test_bad_section_magic() {
        let mut ncz = vec![0u8; UNCOMPRESSABLE_HEADER_SIZE as usize];
        ncz.extend_from_slice(b"NCZWRONG");
        ncz.extend_from_slice(&[0u8; 8]);
        let mut sink = Vec::new();
        assert!(matches!(
            decompress_ncz(&mut Cursor::new(ncz), &mut sink),
            Err(Error::InvalidMagic {
                location: "NCZ section table"
            })
        ));
    }

    #[test]
    fn test_bad_block_fields() {
        for (version, block_type, exponent, field) in [
            (1u8, 1u8, 14u8, "NCZ block version"),
            (2, 0, 14, "NCZ block type"),
            (2, 1, 13, "NCZ block size exponent"),
            (2, 1, 33, "NCZ block size exponent"),
        ] {
            let mut ncz = write_ncz_prelude(&[ctr_section()]);
            ncz.extend_from_slice(BLOCK_MAGIC);
            ncz.push(version);
            ncz.push(block_type);
            ncz.push(0);
            ncz.push(exponent);
            ncz.write_u32::<LittleEndian>(0).unwrap();
            ncz.write_u64::<LittleEndian>(0).unwrap();

            let mut sink = Vec::new();
            let err = decompress_ncz(&mut Cursor::new(ncz), &mut sink).unwrap_err();
            assert!(
                matches!(err, Error::InvalidFieldRange { field: f, .. } if f == field),
                "expected {field}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_no_section_for_offset() {
        // Stream produces more bytes than the sections cover.
        let section = NczSection {
            size: 0x1000,
            ..ctr_section()
        };
        let plaintext = vec![0u8; 0x2000];
        let compressed = zstd::bulk::compress(&plaintext, 3).unwrap();

        let mut ncz = write_ncz_prelude(std::slice::from_ref(&section));
        ncz.extend_from_slice(&compressed);

        let mut sink = Vec::new();
        let err = decompress_ncz(&mut Cursor::new(ncz), &mut sink).unwrap_err();
        assert!(matches!(err, Error::NoSectionForOffset { offset: 0x5000 }));
    }

    /// Write sink that fails after a byte budget, counting attempts.
    struct FailingSink {
        budget: usize,
        writes_after_failure: usize,
        failed: bool,
    }

    impl Write for FailingSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.failed {
                self.writes_after_failure += 1;
            }
            if buf.len() > self.budget {
                self.failed = true;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    "backpressure",
                ));
            }
            self.budget -= buf.len();
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sink_error_stops_pipeline() {
        let section = ctr_section();
        let plaintext = vec![0u8; 0x10000];
        let compressed = zstd::bulk::compress(&plaintext, 3).unwrap();

        let mut ncz = write_ncz_prelude(std::slice::from_ref(&section));
        ncz.extend_from_slice(&compressed);

        let mut sink = FailingSink {
            budget: 0x4000, // header fits, first body chunk does not
            writes_after_failure: 0,
            failed: false,
        };
        let err = decompress_ncz(&mut Cursor::new(ncz), &mut sink).unwrap_err();
        assert!(matches!(err, Error::SinkWrite(_)));
        assert_eq!(sink.writes_after_failure, 0);
    }
}
