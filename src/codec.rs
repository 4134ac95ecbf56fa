//! Encode-then-compress pipeline over `u64` arrays: optional byte-width
//! masking, then optional ZSTD / histogram quantisation / ZFP / SZ. The file
//! format for one array is `[usize len_after_pipeline][bytes...]`, where the
//! `len` semantics depend on which stages ran: raw byte size (no pipeline),
//! encoded byte size (masking only), or compressed byte size (any
//! compression stage). Exactly one of these conventions applies per write,
//! and the reader is told `n` (the element count) out of band so it can
//! pick the matching decode path via `Parameters`.

use crate::io_utils::{read_bytes, read_usize, write_usize};
use crate::params::{CompressionAlgorithm, EncodingAlgorithm, Parameters};
use crate::{PallasError, Result};
use std::io::{Read, Write};

/// Encodes `values` per `params` and writes `[len][bytes]` to `writer`.
/// Returns the number of bytes written (including the length prefix),
/// which callers use to track a running file offset.
pub fn encode<W: Write>(values: &[u64], params: &Parameters, writer: &mut W) -> Result<usize> {
    let raw = mask_encode(values, params.encoding_algorithm);
    let payload = compress(&raw, params)?;
    write_usize(writer, payload.len())?;
    writer.write_all(&payload)?;
    Ok(8 + payload.len())
}

/// Decodes `n` `u64` values from `reader`, which must have been produced by
/// [`encode`] with the same `params` used at write time. `n` is the element
/// count, remembered out of band (in the `LinkedDurationVector` header or
/// the codec's own length prefix).
pub fn decode<R: Read>(reader: &mut R, n: usize) -> Result<Vec<u64>> {
    decode_with(reader, n, &Parameters::default())
}

/// Like [`decode`], but uses the codec configuration persisted in the
/// archive header instead of assuming defaults. Real callers (the storage
/// engine) always go through this; `decode` exists for codec-internal
/// round-trip tests where the pipeline is implicit.
pub fn decode_with<R: Read>(reader: &mut R, n: usize, params: &Parameters) -> Result<Vec<u64>> {
    let len = read_usize(reader)?;
    let payload = read_bytes(reader, len)?;
    let raw = decompress(&payload, params, n)?;
    mask_decode(&raw, params.encoding_algorithm, n)
}

fn mask_encode(values: &[u64], encoding: EncodingAlgorithm) -> Vec<u8> {
    match encoding {
        EncodingAlgorithm::None => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        EncodingAlgorithm::Masking => {
            let mask = values.iter().fold(0u64, |acc, v| acc | v);
            let width = mask_width(mask);
            if width == 8 {
                return values.iter().flat_map(|v| v.to_le_bytes()).collect();
            }
            let mut out = Vec::with_capacity(values.len() * width);
            for v in values {
                out.extend_from_slice(&v.to_le_bytes()[..width]);
            }
            out
        }
    }
}

fn mask_decode(raw: &[u8], encoding: EncodingAlgorithm, n: usize) -> Result<Vec<u64>> {
    match encoding {
        EncodingAlgorithm::None => {
            if raw.len() != n * 8 {
                return Err(PallasError::Corruption(format!(
                    "expected {} raw bytes for {n} values, got {}",
                    n * 8,
                    raw.len()
                )));
            }
            Ok(raw
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                .collect())
        }
        EncodingAlgorithm::Masking => {
            if n == 0 {
                return Ok(Vec::new());
            }
            let width = raw.len() / n;
            if width == 0 {
                return Ok(vec![0u64; n]);
            }
            let mut out = Vec::with_capacity(n);
            for chunk in raw.chunks_exact(width) {
                let mut buf = [0u8; 8];
                buf[..width].copy_from_slice(chunk);
                out.push(u64::from_le_bytes(buf));
            }
            Ok(out)
        }
    }
}

/// `w = ceil(log256(mask + 1))`, the minimal byte width covering `mask`.
/// Width 0 for an all-zero mask, width 8 ("fall back to raw") for anything
/// needing the full 8 bytes.
fn mask_width(mask: u64) -> usize {
    if mask == 0 {
        return 0;
    }
    let bits = 64 - mask.leading_zeros();
    (bits as usize).div_ceil(8)
}

fn compress(raw: &[u8], params: &Parameters) -> Result<Vec<u8>> {
    match params.compression_algorithm {
        CompressionAlgorithm::None => Ok(raw.to_vec()),
        CompressionAlgorithm::Zstd => {
            zstd::encode_all(raw, params.zstd_compression_level as i32).map_err(PallasError::Io)
        }
        CompressionAlgorithm::Histogram => Ok(histogram_encode(raw)),
        CompressionAlgorithm::Zfp | CompressionAlgorithm::Sz => Ok(lossy_quantize_encode(raw)),
    }
}

fn decompress(payload: &[u8], params: &Parameters, n: usize) -> Result<Vec<u8>> {
    match params.compression_algorithm {
        CompressionAlgorithm::None => Ok(payload.to_vec()),
        CompressionAlgorithm::Zstd => zstd::decode_all(payload).map_err(PallasError::Io),
        CompressionAlgorithm::Histogram => histogram_decode(payload, n),
        CompressionAlgorithm::Zfp | CompressionAlgorithm::Sz => lossy_quantize_decode(payload, n),
    }
}

/// Histogram (lossy): write `(min, max)` then each element as an
/// `N_BYTES`-wide bucket index (default 1 byte). Intended for statistics,
/// not timestamps requiring exactness.
const HISTOGRAM_N_BYTES: usize = 1;

fn histogram_encode(raw: &[u8]) -> Vec<u8> {
    let values: Vec<u64> = raw
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    let min = values.iter().copied().min().unwrap_or(0);
    let max = values.iter().copied().max().unwrap_or(0);
    let mut out = Vec::with_capacity(16 + values.len() * HISTOGRAM_N_BYTES);
    out.extend_from_slice(&min.to_le_bytes());
    out.extend_from_slice(&max.to_le_bytes());
    let span = (max - min) as f64;
    let buckets = ((1u64 << (8 * HISTOGRAM_N_BYTES)) - 1) as f64;
    for v in values {
        let idx = if span == 0.0 {
            0u64
        } else {
            (((v - min) as f64 / span) * buckets).round() as u64
        };
        out.extend_from_slice(&idx.to_le_bytes()[..HISTOGRAM_N_BYTES]);
    }
    out
}

fn histogram_decode(payload: &[u8], n: usize) -> Result<Vec<u8>> {
    if payload.len() < 16 {
        return Err(PallasError::Corruption("histogram payload too short".into()));
    }
    let min = u64::from_le_bytes(payload[0..8].try_into().unwrap());
    let max = u64::from_le_bytes(payload[8..16].try_into().unwrap());
    let span = (max - min) as f64;
    let buckets = ((1u64 << (8 * HISTOGRAM_N_BYTES)) - 1) as f64;
    let mut out = Vec::with_capacity(n * 8);
    for chunk in payload[16..].chunks_exact(HISTOGRAM_N_BYTES) {
        let mut buf = [0u8; 8];
        buf[..HISTOGRAM_N_BYTES].copy_from_slice(chunk);
        let idx = u64::from_le_bytes(buf);
        let v = if span == 0.0 {
            min
        } else {
            min + ((idx as f64 / buckets) * span).round() as u64
        };
        out.extend_from_slice(&v.to_le_bytes());
    }
    Ok(out)
}

/// Stand-in for the ZFP/SZ numeric compressors: a fixed-point quantisation
/// to 32 bits per value, relative to the array's min. Linking the real ZFP
/// or SZ C libraries is out of reach for a pure-Rust crate here (see
/// DESIGN.md); this keeps the wire shape (lossy, approximate) and the
/// `Parameters` surface real so the codec dispatch and storage format are
/// exercised end to end.
fn lossy_quantize_encode(raw: &[u8]) -> Vec<u8> {
    let values: Vec<u64> = raw
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    let min = values.iter().copied().min().unwrap_or(0);
    let mut out = Vec::with_capacity(8 + values.len() * 4);
    out.extend_from_slice(&min.to_le_bytes());
    for v in values {
        let delta = (v - min).min(u32::MAX as u64) as u32;
        out.extend_from_slice(&delta.to_le_bytes());
    }
    out
}

fn lossy_quantize_decode(payload: &[u8], n: usize) -> Result<Vec<u8>> {
    if payload.len() < 8 {
        return Err(PallasError::Corruption("quantized payload too short".into()));
    }
    let min = u64::from_le_bytes(payload[0..8].try_into().unwrap());
    let mut out = Vec::with_capacity(n * 8);
    for chunk in payload[8..].chunks_exact(4) {
        let delta = u32::from_le_bytes(chunk.try_into().unwrap());
        out.extend_from_slice(&(min + delta as u64).to_le_bytes());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(params: &Parameters, values: &[u64]) -> Vec<u64> {
        let mut buf = Vec::new();
        encode(values, params, &mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        decode_with(&mut cursor, values.len(), params).unwrap()
    }

    #[test]
    fn lossless_none_none_roundtrips_exactly() {
        let values = vec![0, 1, 42, u64::MAX, 1000, 7];
        let params = Parameters::default();
        assert_eq!(roundtrip(&params, &values), values);
    }

    #[test]
    fn masking_roundtrips_exactly() {
        let values = vec![1, 2, 3, 255, 4, 5];
        let params = Parameters {
            encoding_algorithm: EncodingAlgorithm::Masking,
            ..Parameters::default()
        };
        assert_eq!(roundtrip(&params, &values), values);
    }

    #[test]
    fn masking_wide_values_roundtrip() {
        let values = vec![1, u64::MAX, 3];
        let params = Parameters {
            encoding_algorithm: EncodingAlgorithm::Masking,
            ..Parameters::default()
        };
        assert_eq!(roundtrip(&params, &values), values);
    }

    #[test]
    fn zstd_plus_masking_roundtrips_exactly() {
        let values: Vec<u64> = (0..200).map(|i| i * 3 % 17).collect();
        let params = Parameters {
            compression_algorithm: CompressionAlgorithm::Zstd,
            encoding_algorithm: EncodingAlgorithm::Masking,
            ..Parameters::default()
        };
        assert_eq!(roundtrip(&params, &values), values);
    }

    #[test]
    fn histogram_is_lossy_but_bounded() {
        let values = vec![100u64, 150, 200, 250, 300];
        let params = Parameters {
            compression_algorithm: CompressionAlgorithm::Histogram,
            ..Parameters::default()
        }
        .normalized();
        let back = roundtrip(&params, &values);
        for (a, b) in values.iter().zip(back.iter()) {
            assert!((*a as i64 - *b as i64).abs() <= 1, "{a} vs {b}");
        }
    }

    #[test]
    fn mask_width_table() {
        assert_eq!(mask_width(0), 0);
        assert_eq!(mask_width(0xFF), 1);
        assert_eq!(mask_width(0x1_0000_0000), 5);
        assert_eq!(mask_width(u64::MAX), 8);
    }
}
