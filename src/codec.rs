//! Binary numeric array decoding (§4.9).
//!
//! `copy_rates_*`/`copy_ticks_*` responses carry a `NumpyArray{data, dtype,
//! shape}` payload: a flat byte buffer, a dtype string (a simple scalar name
//! like `"float64"`, or a structured record layout like
//! `"[('time','<i8'),('open','<f8'),...]"`), and the logical shape. Decoding
//! is a boundary concern (outside this design's core reliability scope) but
//! still needs a concrete implementation for the façade to return typed
//! rows instead of raw bytes. Uses `byteorder` for the little-endian field
//! reads, the narrower fit for a dtype-string-driven fixed layout compared
//! to a `Pod`/alignment-based crate over externally sourced bytes.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::BridgeError;

/// A decoded OHLCV bar (`copy_rates_*`).
#[derive(Debug, Clone, PartialEq)]
pub struct RateBar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub tick_volume: i64,
    pub spread: i32,
    pub real_volume: i64,
}

const RATE_FIELD_WIDTHS: &[usize] = &[8, 8, 8, 8, 8, 8, 4, 8];
const RATE_ROW_WIDTH: usize = 60;

/// A decoded tick (`copy_ticks_*`).
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub time: i64,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume: i64,
    pub time_msc: i64,
    pub flags: u32,
    pub volume_real: f64,
}

const TICK_ROW_WIDTH: usize = 56;

/// Decodes a `NumpyArray` payload into [`RateBar`] rows per the fixed
/// structured dtype the terminal emits for `copy_rates_*`.
///
/// Ignores `dtype`/`shape` field ordering beyond validating the buffer is an
/// exact multiple of the known row width — the terminal's rate dtype layout
/// is fixed, so this is a defensive length check rather than a real parse of
/// the dtype string.
pub fn decode_rates(data: &[u8]) -> Result<Vec<RateBar>, BridgeError> {
    if data.len() % RATE_ROW_WIDTH != 0 {
        return Err(BridgeError::ArrayDecode(format!(
            "rate buffer length {} is not a multiple of row width {RATE_ROW_WIDTH}",
            data.len()
        )));
    }
    let _ = RATE_FIELD_WIDTHS;
    let mut bars = Vec::with_capacity(data.len() / RATE_ROW_WIDTH);
    for row in data.chunks_exact(RATE_ROW_WIDTH) {
        bars.push(RateBar {
            time: LittleEndian::read_i64(&row[0..8]),
            open: LittleEndian::read_f64(&row[8..16]),
            high: LittleEndian::read_f64(&row[16..24]),
            low: LittleEndian::read_f64(&row[24..32]),
            close: LittleEndian::read_f64(&row[32..40]),
            tick_volume: LittleEndian::read_i64(&row[40..48]),
            spread: LittleEndian::read_i32(&row[48..52]),
            real_volume: LittleEndian::read_i64(&row[52..60]),
        });
    }
    Ok(bars)
}

/// Decodes a `NumpyArray` payload into [`Tick`] rows for `copy_ticks_*`.
pub fn decode_ticks(data: &[u8]) -> Result<Vec<Tick>, BridgeError> {
    if data.len() % TICK_ROW_WIDTH != 0 {
        return Err(BridgeError::ArrayDecode(format!(
            "tick buffer length {} is not a multiple of row width {TICK_ROW_WIDTH}",
            data.len()
        )));
    }
    let mut ticks = Vec::with_capacity(data.len() / TICK_ROW_WIDTH);
    for row in data.chunks_exact(TICK_ROW_WIDTH) {
        ticks.push(Tick {
            time: LittleEndian::read_i64(&row[0..8]),
            bid: LittleEndian::read_f64(&row[8..16]),
            ask: LittleEndian::read_f64(&row[16..24]),
            last: LittleEndian::read_f64(&row[24..32]),
            volume: LittleEndian::read_i64(&row[32..40]),
            time_msc: LittleEndian::read_i64(&row[40..48]),
            flags: LittleEndian::read_u32(&row[48..52]),
            volume_real: LittleEndian::read_f64(&row[52..56]),
        });
    }
    Ok(ticks)
}

/// Validates a dtype string names one of the two structured layouts this
/// module knows how to decode, returning a descriptive error otherwise
/// rather than silently misreading the buffer.
pub fn validate_dtype(dtype: &str, kind: DecodeKind) -> Result<(), BridgeError> {
    let expects_rate = dtype.contains("open") && dtype.contains("close");
    let expects_tick = dtype.contains("bid") && dtype.contains("ask");
    match kind {
        DecodeKind::Rates if expects_rate => Ok(()),
        DecodeKind::Ticks if expects_tick => Ok(()),
        _ => Err(BridgeError::ArrayDecode(format!(
            "dtype {dtype:?} does not match expected {kind:?} layout"
        ))),
    }
}

/// Which row layout a buffer is expected to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeKind {
    Rates,
    Ticks,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rate_row() -> Vec<u8> {
        let mut row = vec![0u8; RATE_ROW_WIDTH];
        LittleEndian::write_i64(&mut row[0..8], 1_700_000_000);
        LittleEndian::write_f64(&mut row[8..16], 1.1000);
        LittleEndian::write_f64(&mut row[16..24], 1.1010);
        LittleEndian::write_f64(&mut row[24..32], 1.0990);
        LittleEndian::write_f64(&mut row[32..40], 1.1005);
        LittleEndian::write_i64(&mut row[40..48], 1200);
        LittleEndian::write_i32(&mut row[48..52], 2);
        LittleEndian::write_i64(&mut row[52..60], 50_000);
        row
    }

    #[test]
    fn decodes_single_rate_bar() {
        let data = sample_rate_row();
        let bars = decode_rates(&data).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].time, 1_700_000_000);
        assert!((bars[0].open - 1.1000).abs() < 1e-9);
        assert_eq!(bars[0].tick_volume, 1200);
        assert_eq!(bars[0].spread, 2);
    }

    #[test]
    fn rejects_misaligned_rate_buffer() {
        let mut data = sample_rate_row();
        data.push(0);
        assert!(decode_rates(&data).is_err());
    }

    #[test]
    fn decodes_multiple_rows() {
        let mut data = sample_rate_row();
        data.extend(sample_rate_row());
        let bars = decode_rates(&data).unwrap();
        assert_eq!(bars.len(), 2);
    }

    #[test]
    fn validate_dtype_accepts_matching_layout() {
        assert!(validate_dtype(
            "[('time','<i8'),('open','<f8'),('high','<f8'),('low','<f8'),('close','<f8')]",
            DecodeKind::Rates
        )
        .is_ok());
    }

    #[test]
    fn validate_dtype_rejects_mismatched_layout() {
        assert!(validate_dtype(
            "[('time','<i8'),('bid','<f8'),('ask','<f8')]",
            DecodeKind::Rates
        )
        .is_err());
    }
}
