#![forbid(unsafe_code)]
//! Extent payload decompression.
//!
//! One entry point, [`decompress`], dispatches on the algorithm tag
//! stored in the file extent item. Output is written into the caller's
//! buffer and the produced byte count returned; compressors do not
//! always fill a whole sector, so callers zero-fill anything beyond the
//! returned length up to the extent's logical size.

mod lzo;

use flate2::{Decompress, FlushDecompress, Status};
use rime_error::{Result, RimeError};
use rime_types::{COMPRESS_LZO, COMPRESS_NONE, COMPRESS_ZLIB, COMPRESS_ZSTD};

pub use lzo::lzo1x_decompress;

/// Supported extent compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    None,
    Zlib,
    Lzo,
    Zstd,
}

impl Algorithm {
    /// Decode the on-disk tag. Unknown tags are not mapped.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            COMPRESS_NONE => Some(Self::None),
            COMPRESS_ZLIB => Some(Self::Zlib),
            COMPRESS_LZO => Some(Self::Lzo),
            COMPRESS_ZSTD => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// Decode `input` into `output`, returning the bytes produced.
///
/// A failure mid-stream is fatal to this extent only; the tree block
/// the payload came from stays valid.
pub fn decompress(
    algo: Algorithm,
    input: &[u8],
    sectorsize: u32,
    output: &mut [u8],
) -> Result<usize> {
    match algo {
        Algorithm::None => {
            let len = input.len().min(output.len());
            output[..len].copy_from_slice(&input[..len]);
            Ok(len)
        }
        Algorithm::Zlib => decompress_zlib(input, sectorsize, output),
        Algorithm::Lzo => decompress_lzo(input, sectorsize, output),
        Algorithm::Zstd => zstd::bulk::decompress_to_buffer(input, output)
            .map_err(|err| RimeError::Decode(format!("zstd: {err}"))),
    }
}

/// Streaming inflate of a zlib-framed deflate stream.
///
/// The stream was written page-at-a-time, so input is fed to the
/// inflater in sector-sized slices until it naturally ends. The 2-byte
/// zlib header is validated and skipped and raw deflate used from
/// there; the adler32 trailer is not checked (block checksums already
/// cover the payload).
fn decompress_zlib(input: &[u8], sectorsize: u32, output: &mut [u8]) -> Result<usize> {
    let sector = sector_size(sectorsize)?;
    if input.len() < 2 {
        return Err(RimeError::Decode("zlib stream shorter than its header".into()));
    }
    let cmf = input[0];
    let flg = input[1];
    if cmf & 0x0F != 8 {
        return Err(RimeError::Decode("zlib header: not a deflate stream".into()));
    }
    if flg & 0x20 != 0 {
        return Err(RimeError::Decode("zlib header: preset dictionary".into()));
    }
    if (u16::from(cmf) << 8 | u16::from(flg)) % 31 != 0 {
        return Err(RimeError::Decode("zlib header: bad check bits".into()));
    }

    let mut inflate = Decompress::new(false);
    let mut in_pos = 2_usize;
    let mut out_pos = 0_usize;

    loop {
        if in_pos >= input.len() {
            return Err(RimeError::Decode("deflate stream truncated".into()));
        }
        // never feed across a sector boundary
        let slice_end = input.len().min((in_pos / sector + 1) * sector);

        let before_in = inflate.total_in();
        let before_out = inflate.total_out();
        let status = inflate
            .decompress(
                &input[in_pos..slice_end],
                &mut output[out_pos..],
                FlushDecompress::None,
            )
            .map_err(|err| RimeError::Decode(format!("deflate: {err}")))?;

        let consumed = usize::try_from(inflate.total_in() - before_in)
            .map_err(|_| RimeError::Decode("deflate consumed count overflow".into()))?;
        let produced = usize::try_from(inflate.total_out() - before_out)
            .map_err(|_| RimeError::Decode("deflate produced count overflow".into()))?;
        in_pos += consumed;
        out_pos += produced;

        match status {
            Status::StreamEnd => return Ok(out_pos),
            Status::Ok | Status::BufError => {
                if out_pos == output.len() {
                    // caller asked for exactly this much
                    return Ok(out_pos);
                }
                if consumed == 0 && produced == 0 {
                    return Err(RimeError::Decode(
                        "deflate stream stalled before its end".into(),
                    ));
                }
            }
        }
    }
}

/// Segmented LZO framing.
///
/// Layout: a 4-byte little-endian total length covering the whole
/// framed stream, then repeated (4-byte segment length, LZO1X payload)
/// pairs. A segment header never straddles a sector boundary; when
/// fewer than 4 bytes remain in the current sector the stream skips to
/// the next one.
fn decompress_lzo(input: &[u8], sectorsize: u32, output: &mut [u8]) -> Result<usize> {
    const LEN_FIELD: usize = 4;

    let sector = sector_size(sectorsize)?;
    let total = read_le32(input, 0)?;
    if total < LEN_FIELD || total > input.len() {
        return Err(RimeError::Decode(
            "lzo framing: total length field disagrees with input".into(),
        ));
    }

    let mut in_pos = LEN_FIELD;
    let mut out_pos = 0_usize;

    while in_pos < total && out_pos < output.len() {
        let sector_left = sector - in_pos % sector;
        if sector_left < LEN_FIELD {
            in_pos += sector_left;
            if in_pos >= total {
                break;
            }
        }

        let seg_len = read_le32(input, in_pos)?;
        in_pos += LEN_FIELD;
        if seg_len == 0 {
            return Err(RimeError::Decode("lzo framing: empty segment".into()));
        }
        let seg_end = in_pos
            .checked_add(seg_len)
            .filter(|end| *end <= total)
            .ok_or_else(|| {
                RimeError::Decode("lzo framing: segment extends past total length".into())
            })?;

        let written = lzo1x_decompress(&input[in_pos..seg_end], &mut output[out_pos..])
            .map_err(|err| RimeError::Decode(format!("lzo segment: {err}")))?;
        out_pos += written;
        in_pos = seg_end;
    }

    Ok(out_pos)
}

fn sector_size(sectorsize: u32) -> Result<usize> {
    if sectorsize == 0 {
        return Err(RimeError::Decode("sectorsize is zero".into()));
    }
    usize::try_from(sectorsize).map_err(|_| RimeError::Decode("sectorsize overflow".into()))
}

fn read_le32(data: &[u8], offset: usize) -> Result<usize> {
    let end = offset
        .checked_add(4)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| RimeError::Decode("length field extends past input".into()))?;
    let mut raw = [0_u8; 4];
    raw.copy_from_slice(&data[offset..end]);
    Ok(u32::from_le_bytes(raw) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    fn sample_bytes(len: usize) -> Vec<u8> {
        // deterministic, mildly compressible content
        let mut seed = 0x1234_5678_u64;
        (0..len)
            .map(|i| {
                if i % 7 < 4 {
                    b'r'
                } else {
                    seed ^= seed << 13;
                    seed ^= seed >> 7;
                    seed ^= seed << 17;
                    (seed & 0xFF) as u8
                }
            })
            .collect()
    }

    fn zlib_compress(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).expect("compress write");
        encoder.finish().expect("compress finish")
    }

    /// Literal-only LZO1X stream for a 1..=238 byte segment.
    fn lzo_literal_segment(data: &[u8]) -> Vec<u8> {
        assert!(!data.is_empty() && data.len() <= 238);
        let mut seg = Vec::with_capacity(data.len() + 4);
        seg.push(17 + u8::try_from(data.len()).expect("length fits"));
        seg.extend_from_slice(data);
        seg.extend_from_slice(&[0x11, 0x00, 0x00]);
        seg
    }

    /// Frame segments with the btrfs total-length + per-segment headers,
    /// realigning exactly like the reader expects.
    fn lzo_frame(segments: &[Vec<u8>], sectorsize: usize) -> Vec<u8> {
        let mut body = vec![0_u8; 4];
        for seg in segments {
            let left = sectorsize - body.len() % sectorsize;
            if left < 4 {
                body.resize(body.len() + left, 0);
            }
            body.extend_from_slice(
                &u32::try_from(seg.len()).expect("segment length").to_le_bytes(),
            );
            body.extend_from_slice(seg);
        }
        let total = u32::try_from(body.len()).expect("total length");
        body[0..4].copy_from_slice(&total.to_le_bytes());
        body
    }

    fn lzo_compress(data: &[u8], sectorsize: usize) -> Vec<u8> {
        let segments: Vec<Vec<u8>> = data.chunks(128).map(lzo_literal_segment).collect();
        lzo_frame(&segments, sectorsize)
    }

    #[test]
    fn algorithm_tags() {
        assert_eq!(Algorithm::from_tag(0), Some(Algorithm::None));
        assert_eq!(Algorithm::from_tag(1), Some(Algorithm::Zlib));
        assert_eq!(Algorithm::from_tag(2), Some(Algorithm::Lzo));
        assert_eq!(Algorithm::from_tag(3), Some(Algorithm::Zstd));
        assert_eq!(Algorithm::from_tag(4), None);
    }

    #[test]
    fn none_is_a_bounded_copy() {
        let data = sample_bytes(100);
        let mut out = vec![0_u8; 64];
        let n = decompress(Algorithm::None, &data, 4096, &mut out).expect("copy");
        assert_eq!(n, 64);
        assert_eq!(out, data[..64]);

        let mut big = vec![0_u8; 4096];
        let n = decompress(Algorithm::None, &data, 4096, &mut big).expect("copy");
        assert_eq!(n, 100);
        assert_eq!(&big[..100], &data[..]);
        assert!(big[100..].iter().all(|b| *b == 0));
    }

    #[test]
    fn zlib_round_trip_sizes() {
        for &(len, outcap) in &[(4096_usize, 4096_usize), (131_072, 131_072), (5000, 8192)] {
            let data = sample_bytes(len);
            let packed = zlib_compress(&data);
            let mut out = vec![0_u8; outcap];
            let n = decompress(Algorithm::Zlib, &packed, 4096, &mut out).expect("inflate");
            assert_eq!(n, len);
            assert_eq!(&out[..n], &data[..]);
        }
    }

    #[test]
    fn zlib_sector_sliced_feed() {
        // tiny sector size forces many feed iterations
        let data = sample_bytes(10_000);
        let packed = zlib_compress(&data);
        let mut out = vec![0_u8; 10_000];
        let n = decompress(Algorithm::Zlib, &packed, 64, &mut out).expect("inflate");
        assert_eq!(n, 10_000);
        assert_eq!(out, data);
    }

    #[test]
    fn zlib_output_capacity_bounds_yield() {
        let data = sample_bytes(4096);
        let packed = zlib_compress(&data);
        let mut out = vec![0_u8; 1000];
        let n = decompress(Algorithm::Zlib, &packed, 4096, &mut out).expect("inflate");
        assert_eq!(n, 1000);
        assert_eq!(out, data[..1000]);
    }

    #[test]
    fn zlib_rejects_bad_header() {
        let mut packed = zlib_compress(&sample_bytes(100));
        packed[0] = 0x77; // method nibble no longer 8
        let mut out = vec![0_u8; 100];
        assert!(matches!(
            decompress(Algorithm::Zlib, &packed, 4096, &mut out),
            Err(RimeError::Decode(_))
        ));
    }

    #[test]
    fn zlib_rejects_truncated_stream() {
        let packed = zlib_compress(&sample_bytes(4096));
        let mut out = vec![0_u8; 4096];
        let cut = &packed[..packed.len() / 2];
        assert!(matches!(
            decompress(Algorithm::Zlib, cut, 4096, &mut out),
            Err(RimeError::Decode(_))
        ));
    }

    #[test]
    fn lzo_round_trip_sizes() {
        for &len in &[1_usize, 100, 4096, 131_072, 5000] {
            let data = sample_bytes(len);
            let packed = lzo_compress(&data, 4096);
            let mut out = vec![0_u8; len];
            let n = decompress(Algorithm::Lzo, &packed, 4096, &mut out).expect("lzo");
            assert_eq!(n, len);
            assert_eq!(out, data);
        }
    }

    #[test]
    fn lzo_header_realignment() {
        // small sectors force segment headers up against boundaries
        let data = sample_bytes(2000);
        let packed = lzo_compress(&data, 128);
        let mut out = vec![0_u8; 2000];
        let n = decompress(Algorithm::Lzo, &packed, 128, &mut out).expect("lzo");
        assert_eq!(n, 2000);
        assert_eq!(out, data);
    }

    #[test]
    fn lzo_rejects_bad_total() {
        let data = sample_bytes(100);
        let mut packed = lzo_compress(&data, 4096);
        let bogus = u32::try_from(packed.len() + 50).expect("len");
        packed[0..4].copy_from_slice(&bogus.to_le_bytes());
        let mut out = vec![0_u8; 100];
        assert!(matches!(
            decompress(Algorithm::Lzo, &packed, 4096, &mut out),
            Err(RimeError::Decode(_))
        ));
    }

    #[test]
    fn lzo_rejects_truncated_segment() {
        let data = sample_bytes(100);
        let packed = lzo_compress(&data, 4096);
        let mut cut = packed[..packed.len() - 5].to_vec();
        let total = u32::try_from(cut.len()).expect("len");
        cut[0..4].copy_from_slice(&total.to_le_bytes());
        let mut out = vec![0_u8; 100];
        assert!(matches!(
            decompress(Algorithm::Lzo, &cut, 4096, &mut out),
            Err(RimeError::Decode(_))
        ));
    }

    #[test]
    fn zstd_round_trip_sizes() {
        for &len in &[4096_usize, 131_072, 5000] {
            let data = sample_bytes(len);
            let packed = zstd::bulk::compress(&data, 3).expect("zstd compress");
            let mut out = vec![0_u8; len];
            let n = decompress(Algorithm::Zstd, &packed, 4096, &mut out).expect("zstd");
            assert_eq!(n, len);
            assert_eq!(out, data);
        }
    }

    #[test]
    fn zstd_garbage_is_decode_error() {
        let mut out = vec![0_u8; 100];
        assert!(matches!(
            decompress(Algorithm::Zstd, &[0xDE, 0xAD, 0xBE, 0xEF], 4096, &mut out),
            Err(RimeError::Decode(_))
        ));
    }

    #[test]
    fn short_yield_lets_caller_zero_fill() {
        // 40 compressed bytes inflating to 100, decoded into a 4096
        // buffer: the dispatcher reports 100 and touches nothing else.
        let data = sample_bytes(100);
        let packed = zlib_compress(&data);
        let mut out = vec![0xFF_u8; 4096];
        let n = decompress(Algorithm::Zlib, &packed, 4096, &mut out).expect("inflate");
        assert_eq!(n, 100);
        assert_eq!(&out[..100], &data[..]);
        assert!(out[100..].iter().all(|b| *b == 0xFF));
    }
}
