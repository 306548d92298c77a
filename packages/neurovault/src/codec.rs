//! Binary chunk encoding.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! offset 0  version          u8
//! offset 1  channel_count    u8
//! offset 2  quality_summary  u8   (OR of every sample's flags)
//! offset 3  reserved         u8   (0)
//! offset 4  values           i16 × sample_count × channel_count, sample-major
//! [v2 only] quality plane    u8  × sample_count
//! ```
//!
//! Values are interleaved by sample so a decoder walks the payload once and
//! builds each `Sample` from a contiguous run. Timestamps are never stored;
//! they are regenerated from the chunk start and the sample rate. The scale
//! factor is supplied by the caller on both sides.

use crate::error::{StorageError, StorageResult};
use crate::types::{QualityFlags, Sample};

pub const HEADER_LEN: usize = 4;

/// Values only.
pub const ENCODING_V1: u8 = 1;
/// Values followed by one quality byte per sample.
pub const ENCODING_V2: u8 = 2;
pub const CURRENT_ENCODING_VERSION: u8 = ENCODING_V2;

/// Stored in place of NaN, so Missing samples survive a round trip.
const NAN_SENTINEL: i16 = i16::MIN;
const MAX_QUANTIZED: f64 = i16::MAX as f64;
const MIN_QUANTIZED: f64 = (i16::MIN + 1) as f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version: u8,
    pub channel_count: u8,
    pub quality_summary: QualityFlags,
}

/// Result of encoding one chunk window.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub blob: Vec<u8>,
    pub version: u8,
    pub sample_count: u32,
    pub quality_summary: QualityFlags,
}

/// Timestamp of sample `index` in a chunk starting at `base_timestamp_us`.
pub fn sample_timestamp_us(base_timestamp_us: i64, index: usize, sample_rate: f64) -> i64 {
    base_timestamp_us + (index as f64 * 1_000_000.0 / sample_rate).round() as i64
}

/// Encode a contiguous window of samples.
///
/// Every sample must carry exactly `channel_count` values and sit on the
/// sample grid implied by the first timestamp and `sample_rate` (within half
/// a period), since decoding regenerates timestamps from that grid.
pub fn encode(
    samples: &[Sample],
    channel_count: usize,
    sample_rate: f64,
    scale_factor: f64,
) -> StorageResult<EncodedChunk> {
    validate_rates(sample_rate, scale_factor)?;
    if samples.is_empty() {
        return Err(StorageError::InvalidInput(
            "cannot encode an empty chunk".to_string(),
        ));
    }
    if channel_count == 0 || channel_count > u8::MAX as usize {
        return Err(StorageError::InvalidInput(format!(
            "channel count {} outside 1..=255",
            channel_count
        )));
    }

    let base = samples[0].timestamp_us;
    let half_period = 500_000.0 / sample_rate;
    let mut blob =
        Vec::with_capacity(HEADER_LEN + samples.len() * (channel_count * 2 + 1));
    blob.extend_from_slice(&[CURRENT_ENCODING_VERSION, channel_count as u8, 0, 0]);

    let mut qualities = Vec::with_capacity(samples.len());
    let mut summary = QualityFlags::NORMAL;

    for (i, sample) in samples.iter().enumerate() {
        if sample.values.len() != channel_count {
            return Err(StorageError::InvalidInput(format!(
                "sample {} has {} values, expected {}",
                i,
                sample.values.len(),
                channel_count
            )));
        }
        let expected = sample_timestamp_us(base, i, sample_rate);
        if ((sample.timestamp_us - expected) as f64).abs() > half_period {
            return Err(StorageError::InvalidInput(format!(
                "sample {} at {}us is off the sample grid (expected {}us)",
                i, sample.timestamp_us, expected
            )));
        }

        let mut quality = sample.quality;
        for &value in &sample.values {
            let (raw, flags) = quantize(value, scale_factor);
            quality |= flags;
            blob.extend_from_slice(&raw.to_le_bytes());
        }
        summary |= quality;
        qualities.push(quality.bits());
    }

    blob.extend_from_slice(&qualities);
    blob[2] = summary.bits();

    Ok(EncodedChunk {
        blob,
        version: CURRENT_ENCODING_VERSION,
        sample_count: samples.len() as u32,
        quality_summary: summary,
    })
}

/// Parse and validate the fixed header.
pub fn decode_header(blob: &[u8]) -> StorageResult<ChunkHeader> {
    if blob.len() < HEADER_LEN {
        return Err(StorageError::CorruptChunk(format!(
            "blob is {} bytes, shorter than the {}-byte header",
            blob.len(),
            HEADER_LEN
        )));
    }
    let version = blob[0];
    if version != ENCODING_V1 && version != ENCODING_V2 {
        return Err(StorageError::CorruptChunk(format!(
            "unrecognized encoding version {}",
            version
        )));
    }
    let channel_count = blob[1];
    if channel_count == 0 {
        return Err(StorageError::CorruptChunk(
            "header declares zero channels".to_string(),
        ));
    }
    Ok(ChunkHeader {
        version,
        channel_count,
        quality_summary: QualityFlags::from_bits_truncate(blob[2]),
    })
}

/// Number of samples contained in a blob, derived from its length.
pub fn sample_count(blob: &[u8]) -> StorageResult<usize> {
    let header = decode_header(blob)?;
    let payload = blob.len() - HEADER_LEN;
    let stride = stride(&header);
    if payload % stride != 0 {
        return Err(StorageError::CorruptChunk(format!(
            "payload of {} bytes is not a whole number of {}-byte samples",
            payload, stride
        )));
    }
    Ok(payload / stride)
}

/// Rebuild samples from a blob. Timestamps are `base + i * 1e6 / sample_rate`.
pub fn decode(
    blob: &[u8],
    scale_factor: f64,
    base_timestamp_us: i64,
    sample_rate: f64,
) -> StorageResult<Vec<Sample>> {
    validate_rates(sample_rate, scale_factor)?;
    let header = decode_header(blob)?;
    let count = sample_count(blob)?;
    let channels = header.channel_count as usize;
    let values_len = count * channels * 2;
    let values = &blob[HEADER_LEN..HEADER_LEN + values_len];
    let quality_plane = match header.version {
        ENCODING_V2 => Some(&blob[HEADER_LEN + values_len..]),
        _ => None,
    };

    let mut samples = Vec::with_capacity(count);
    for (i, raw_sample) in values.chunks_exact(channels * 2).enumerate() {
        let mut quality = quality_plane
            .map(|plane| QualityFlags::from_bits_truncate(plane[i]))
            .unwrap_or(QualityFlags::NORMAL);

        let sample_values: Vec<f32> = raw_sample
            .chunks_exact(2)
            .map(|pair| {
                let raw = i16::from_le_bytes([pair[0], pair[1]]);
                if raw == NAN_SENTINEL {
                    quality |= QualityFlags::MISSING;
                    f32::NAN
                } else {
                    (raw as f64 * scale_factor) as f32
                }
            })
            .collect();

        samples.push(Sample {
            timestamp_us: sample_timestamp_us(base_timestamp_us, i, sample_rate),
            values: sample_values,
            quality,
        });
    }

    Ok(samples)
}

fn stride(header: &ChunkHeader) -> usize {
    let values = header.channel_count as usize * 2;
    match header.version {
        ENCODING_V2 => values + 1,
        _ => values,
    }
}

fn quantize(value: f32, scale_factor: f64) -> (i16, QualityFlags) {
    if value.is_nan() {
        return (NAN_SENTINEL, QualityFlags::MISSING);
    }
    let scaled = (value as f64 / scale_factor).round();
    if scaled > MAX_QUANTIZED {
        (i16::MAX, QualityFlags::SATURATED)
    } else if scaled < MIN_QUANTIZED {
        (i16::MIN + 1, QualityFlags::SATURATED)
    } else {
        (scaled as i16, QualityFlags::NORMAL)
    }
}

fn validate_rates(sample_rate: f64, scale_factor: f64) -> StorageResult<()> {
    if !(sample_rate.is_finite() && sample_rate > 0.0 && sample_rate <= 1_000_000.0) {
        return Err(StorageError::InvalidInput(format!(
            "sample rate {} outside (0, 1e6]",
            sample_rate
        )));
    }
    if !(scale_factor.is_finite() && scale_factor > 0.0) {
        return Err(StorageError::InvalidInput(format!(
            "scale factor {} must be positive",
            scale_factor
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SCALE: f64 = 0.076;

    fn one_second_at_160hz(raw: i16) -> Vec<Sample> {
        (0..160)
            .map(|i| {
                let value = (raw as f64 * SCALE) as f32;
                Sample::new(sample_timestamp_us(1_000_000, i, 160.0), vec![value, value])
            })
            .collect()
    }

    #[test]
    fn test_raw_100_decodes_to_7_6_microvolts() {
        let samples = one_second_at_160hz(100);
        let encoded = encode(&samples, 2, 160.0, SCALE).unwrap();
        assert_eq!(encoded.sample_count, 160);
        assert_eq!(encoded.blob.len(), HEADER_LEN + 160 * (2 * 2 + 1));

        let decoded = decode(&encoded.blob, SCALE, 1_000_000, 160.0).unwrap();
        assert_eq!(decoded.len(), 160);
        for sample in &decoded {
            assert!((sample.values[0] - 7.6).abs() < 1e-4);
            assert!(sample.quality.is_normal());
        }
    }

    #[test]
    fn test_decoded_timestamps_strictly_increase() {
        let samples = one_second_at_160hz(5);
        let encoded = encode(&samples, 2, 160.0, SCALE).unwrap();
        let decoded = decode(&encoded.blob, SCALE, 42, 160.0).unwrap();
        assert_eq!(decoded[0].timestamp_us, 42);
        assert!(decoded
            .windows(2)
            .all(|w| w[1].timestamp_us > w[0].timestamp_us));
        assert_eq!(decoded[1].timestamp_us, 42 + 6_250);
    }

    #[test]
    fn test_header_layout() {
        let mut samples = one_second_at_160hz(1);
        samples[3].quality = QualityFlags::LEAD_OFF;
        let encoded = encode(&samples, 2, 160.0, SCALE).unwrap();
        assert_eq!(encoded.blob[0], ENCODING_V2);
        assert_eq!(encoded.blob[1], 2);
        assert_eq!(encoded.blob[2], QualityFlags::LEAD_OFF.bits());
        assert_eq!(encoded.blob[3], 0);

        let header = decode_header(&encoded.blob).unwrap();
        assert_eq!(header.quality_summary, QualityFlags::LEAD_OFF);
    }

    #[test]
    fn test_missing_and_saturated_values() {
        let samples = vec![
            Sample::new(0, vec![1.0]),
            Sample::missing(6_250, 1),
            Sample::new(12_500, vec![1.0e9]),
        ];
        let encoded = encode(&samples, 1, 160.0, SCALE).unwrap();
        assert_eq!(
            encoded.quality_summary,
            QualityFlags::MISSING | QualityFlags::SATURATED
        );

        let decoded = decode(&encoded.blob, SCALE, 0, 160.0).unwrap();
        assert!(!decoded[0].values[0].is_nan());
        assert!(decoded[1].values[0].is_nan());
        assert!(decoded[1].quality.contains(QualityFlags::MISSING));
        assert!(decoded[2].quality.contains(QualityFlags::SATURATED));
        assert!((decoded[2].values[0] as f64 - i16::MAX as f64 * SCALE).abs() < 1e-2);
    }

    #[test]
    fn test_v1_blobs_still_decode() {
        let mut blob = vec![ENCODING_V1, 1, 0, 0];
        blob.extend_from_slice(&10i16.to_le_bytes());
        blob.extend_from_slice(&(-10i16).to_le_bytes());
        let decoded = decode(&blob, 0.5, 0, 2.0).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].values, vec![5.0]);
        assert_eq!(decoded[1].values, vec![-5.0]);
        assert_eq!(decoded[1].timestamp_us, 500_000);
    }

    #[test]
    fn test_corrupt_blobs_rejected() {
        assert!(matches!(
            decode(&[ENCODING_V2, 1], SCALE, 0, 160.0),
            Err(StorageError::CorruptChunk(_))
        ));
        assert!(matches!(
            decode(&[9, 1, 0, 0, 0, 0, 0], SCALE, 0, 160.0),
            Err(StorageError::CorruptChunk(_))
        ));
        // 2 channels × 2 bytes + 1 quality byte = 5 bytes per sample; 4 is not whole
        assert!(matches!(
            decode(&[ENCODING_V2, 2, 0, 0, 1, 2, 3, 4], SCALE, 0, 160.0),
            Err(StorageError::CorruptChunk(_))
        ));
    }

    #[test]
    fn test_encode_rejects_off_grid_and_ragged_samples() {
        let samples = vec![Sample::new(0, vec![1.0]), Sample::new(50_000, vec![1.0])];
        assert!(matches!(
            encode(&samples, 1, 160.0, SCALE),
            Err(StorageError::InvalidInput(_))
        ));

        let samples = vec![Sample::new(0, vec![1.0, 2.0])];
        assert!(encode(&samples, 1, 160.0, SCALE).is_err());
        assert!(encode(&[], 1, 160.0, SCALE).is_err());
    }

    proptest! {
        #[test]
        fn prop_round_trip_within_one_step(
            raws in proptest::collection::vec((-32_000i16..32_000, -32_000i16..32_000), 1..400),
            scale in 0.001f64..10.0,
        ) {
            let samples: Vec<Sample> = raws
                .iter()
                .enumerate()
                .map(|(i, (a, b))| Sample::new(
                    sample_timestamp_us(0, i, 250.0),
                    vec![(*a as f64 * scale) as f32, (*b as f64 * scale) as f32],
                ))
                .collect();
            let encoded = encode(&samples, 2, 250.0, scale).unwrap();
            let decoded = decode(&encoded.blob, scale, 0, 250.0).unwrap();

            prop_assert_eq!(decoded.len(), samples.len());
            for (original, restored) in samples.iter().zip(&decoded) {
                prop_assert_eq!(original.timestamp_us, restored.timestamp_us);
                for (x, y) in original.values.iter().zip(&restored.values) {
                    prop_assert!(((*x as f64) - (*y as f64)).abs() <= scale / 2.0 + 1e-3 * scale.max(1.0));
                }
            }
        }
    }
}
