//! Fitness sensor GATT protocol
//!
//! Pure decoders for the characteristic payloads we subscribe to or read.
//! The byte layouts follow the Bluetooth SIG Fitness Machine Service,
//! Heart Rate Service, Cycling Power Service and Device Information Service
//! specifications. All multi-byte fields are little-endian.

use crate::domain::gatt::CharacteristicId;
use crate::domain::models::{HeartRateMeasurement, TrainerSample};
use crate::error::ParseError;
use std::time::Duration;
use tracing::trace;

/// Indoor Bike Data (0x2AD2) flag bits
pub mod bike_flags {
    pub const MORE_DATA: u16 = 0x0001;
    pub const AVERAGE_SPEED: u16 = 0x0002;
    pub const INSTANTANEOUS_CADENCE: u16 = 0x0004;
    pub const AVERAGE_CADENCE: u16 = 0x0008;
    pub const TOTAL_DISTANCE: u16 = 0x0010;
    pub const RESISTANCE_LEVEL: u16 = 0x0020;
    pub const INSTANTANEOUS_POWER: u16 = 0x0040;
    pub const AVERAGE_POWER: u16 = 0x0080;
    pub const EXPENDED_ENERGY: u16 = 0x0100;
    pub const HEART_RATE: u16 = 0x0200;
    pub const METABOLIC_EQUIVALENT: u16 = 0x0400;
    pub const ELAPSED_TIME: u16 = 0x0800;
    pub const REMAINING_TIME: u16 = 0x1000;
}

/// Heart Rate Measurement (0x2A37) flag bits
pub mod hr_flags {
    pub const VALUE_U16: u8 = 0x01;
    pub const ENERGY_EXPENDED: u8 = 0x08;
    pub const RR_INTERVAL: u8 = 0x10;
}

/// Fitness Machine Feature (0x2ACC) bits
pub mod machine_features {
    pub const AVERAGE_SPEED: u32 = 0x0000_0001;
    pub const CADENCE: u32 = 0x0000_0002;
    pub const TOTAL_DISTANCE: u32 = 0x0000_0004;
    pub const INCLINATION: u32 = 0x0000_0008;
    pub const ELEVATION_GAIN: u32 = 0x0000_0010;
    pub const PACE: u32 = 0x0000_0020;
    pub const STEP_COUNT: u32 = 0x0000_0040;
    pub const RESISTANCE_LEVEL: u32 = 0x0000_0080;
    pub const STRIDE_COUNT: u32 = 0x0000_0100;
    pub const EXPENDED_ENERGY: u32 = 0x0000_0200;
    pub const HEART_RATE_MEASUREMENT: u32 = 0x0000_0400;
    pub const METABOLIC_EQUIVALENT: u32 = 0x0000_0800;
    pub const ELAPSED_TIME: u32 = 0x0000_1000;
    pub const REMAINING_TIME: u32 = 0x0000_2000;
    pub const POWER_MEASUREMENT: u32 = 0x0000_4000;
    pub const FORCE_ON_BELT: u32 = 0x0000_8000;
    pub const POWER_OUTPUT: u32 = 0x0001_0000;
}

/// Scale factors for fixed-point fields
pub mod scale {
    /// Speed resolution: 0.01 km/h
    pub const SPEED_DIVISOR: f64 = 100.0;
    /// Cadence resolution: 0.5 rpm
    pub const CADENCE_RPM: f64 = 0.5;
    /// RR interval resolution: 1/1024 s
    pub const RR_SECONDS: f64 = 1.0 / 1024.0;
}

/// Offset cursor over a frame. Once a field does not fit, every later field
/// is treated as absent: fields are laid out in a fixed order, so reading past
/// a gap would misalign the rest of the frame.
struct FrameReader<'a> {
    bytes: &'a [u8],
    offset: usize,
    truncated: bool,
}

impl<'a> FrameReader<'a> {
    fn new(bytes: &'a [u8], offset: usize) -> Self {
        Self {
            bytes,
            offset,
            truncated: false,
        }
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        if self.truncated {
            return None;
        }
        let Some(slice) = self.bytes.get(self.offset..self.offset + N) else {
            self.truncated = true;
            return None;
        };
        self.offset += N;
        slice.try_into().ok()
    }

    fn u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|[b]| b)
    }

    fn u16(&mut self) -> Option<u16> {
        self.take::<2>().map(u16::from_le_bytes)
    }

    fn i16(&mut self) -> Option<i16> {
        self.take::<2>().map(i16::from_le_bytes)
    }

    fn u24(&mut self) -> Option<u32> {
        self.take::<3>().map(|[a, b, c]| u32::from_le_bytes([a, b, c, 0]))
    }

    fn skip(&mut self, len: usize) {
        if self.truncated {
            return;
        }
        if self.offset + len > self.bytes.len() {
            self.truncated = true;
        } else {
            self.offset += len;
        }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.offset)
    }
}

/// Decode an Indoor Bike Data notification
///
/// # Frame layout
///
/// ```text
/// [0-1]  flags (u16)
/// then, in this order, each only if its flag bit is set:
///        instantaneous speed  u16  0.01 km/h   (always read, see below)
///        average speed        u16  skipped     bit 1
///        instantaneous cadence u16 0.5 rpm     bit 2
///        average cadence      u16  skipped     bit 3
///        total distance       u24  m           bit 4
///        resistance level     i16              bit 5
///        instantaneous power  i16  W           bit 6
///        average power        i16  skipped     bit 7
///        expended energy      u16+u16+u8 (total kcal kept)  bit 8
///        heart rate           u8   bpm         bit 9
///        metabolic equivalent u8   skipped     bit 10
///        elapsed time         u16  s           bit 11
///        remaining time       u16  skipped     bit 12
/// ```
///
/// Bit 0 ("more data") nominally hides the speed field, but trainers in the
/// field send speed regardless, so the two bytes after the flags are always
/// read as speed when present. Fields that do not fit in the payload are
/// absent rather than an error.
pub fn decode_indoor_bike_data(bytes: &[u8]) -> Result<TrainerSample, ParseError> {
    if bytes.len() < 2 {
        return Err(ParseError::TooShort {
            expected: 2,
            actual: bytes.len(),
        });
    }

    let flags = u16::from_le_bytes([bytes[0], bytes[1]]);
    let has = |bit: u16| flags & bit != 0;
    let mut reader = FrameReader::new(bytes, 2);
    let mut sample = TrainerSample::default();

    if let Some(raw) = reader.u16() {
        sample = sample.with_speed(raw as f64 / scale::SPEED_DIVISOR);
    }
    if has(bike_flags::AVERAGE_SPEED) {
        reader.skip(2);
    }
    if has(bike_flags::INSTANTANEOUS_CADENCE) {
        if let Some(raw) = reader.u16() {
            sample = sample.with_cadence(raw as f64 * scale::CADENCE_RPM);
        }
    }
    if has(bike_flags::AVERAGE_CADENCE) {
        reader.skip(2);
    }
    if has(bike_flags::TOTAL_DISTANCE) {
        if let Some(meters) = reader.u24() {
            sample = sample.with_distance(meters);
        }
    }
    if has(bike_flags::RESISTANCE_LEVEL) {
        if let Some(level) = reader.i16() {
            sample = sample.with_resistance_level(level);
        }
    }
    if has(bike_flags::INSTANTANEOUS_POWER) {
        if let Some(watts) = reader.i16() {
            sample = sample.with_power(watts);
        }
    }
    if has(bike_flags::AVERAGE_POWER) {
        reader.skip(2);
    }
    if has(bike_flags::EXPENDED_ENERGY) {
        if let Some([t0, t1, _, _, _]) = reader.take::<5>() {
            sample = sample.with_expended_energy(u16::from_le_bytes([t0, t1]));
        }
    }
    if has(bike_flags::HEART_RATE) {
        if let Some(bpm) = reader.u8() {
            sample = sample.with_heart_rate(bpm);
        }
    }
    if has(bike_flags::METABOLIC_EQUIVALENT) {
        reader.skip(1);
    }
    if has(bike_flags::ELAPSED_TIME) {
        if let Some(seconds) = reader.u16() {
            sample = sample.with_elapsed_time(Duration::from_secs(seconds.into()));
        }
    }
    if has(bike_flags::REMAINING_TIME) {
        reader.skip(2);
    }

    if reader.truncated {
        trace!(
            "Indoor bike data truncated at offset {} (flags {:#06X}, {} bytes)",
            reader.offset,
            flags,
            bytes.len()
        );
    }

    Ok(sample)
}

/// Decode a Heart Rate Measurement notification
///
/// ```text
/// [0]    flags: bit 0 = u16 value, bit 3 = energy expended, bit 4 = RR intervals
/// [1]    heart rate (u8)            or  [1-2] heart rate (u16)
/// [..]   energy expended (u16, skipped) if bit 3
/// [..]   RR intervals (u16, 1/1024 s each) while two bytes remain, if bit 4
/// ```
pub fn decode_heart_rate_measurement(bytes: &[u8]) -> Result<HeartRateMeasurement, ParseError> {
    if bytes.len() < 2 {
        return Err(ParseError::TooShort {
            expected: 2,
            actual: bytes.len(),
        });
    }

    let flags = bytes[0];
    let mut reader = FrameReader::new(bytes, 1);

    let bpm = if flags & hr_flags::VALUE_U16 != 0 {
        reader.u16().ok_or(ParseError::TooShort {
            expected: 3,
            actual: bytes.len(),
        })?
    } else {
        reader.u8().map(u16::from).unwrap_or_default()
    };

    if flags & hr_flags::ENERGY_EXPENDED != 0 {
        reader.skip(2);
    }

    let mut rr_intervals = Vec::new();
    if flags & hr_flags::RR_INTERVAL != 0 {
        while reader.remaining() >= 2 {
            match reader.u16() {
                Some(raw) => rr_intervals.push(raw as f64 * scale::RR_SECONDS),
                None => break,
            }
        }
    }

    Ok(HeartRateMeasurement { bpm, rr_intervals })
}

/// Decode a Cycling Power Measurement notification (instantaneous power only)
///
/// ```text
/// [0-1]  flags (u16)
/// [2-3]  instantaneous power (i16, W)
/// ```
pub fn decode_cycling_power_measurement(bytes: &[u8]) -> Result<TrainerSample, ParseError> {
    if bytes.len() < 4 {
        return Err(ParseError::TooShort {
            expected: 4,
            actual: bytes.len(),
        });
    }
    let watts = i16::from_le_bytes([bytes[2], bytes[3]]);
    Ok(TrainerSample::default().with_power(watts))
}

/// Decode a Fitness Machine Feature read; only the feature word is kept.
pub fn decode_fitness_machine_features(bytes: &[u8]) -> Result<u32, ParseError> {
    match bytes {
        [a, b, c, d, ..] => Ok(u32::from_le_bytes([*a, *b, *c, *d])),
        _ => Err(ParseError::TooShort {
            expected: 4,
            actual: bytes.len(),
        }),
    }
}

/// Decode a Device Information string characteristic (UTF-8, NUL padded).
pub fn decode_utf8_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

/// Route a notification payload to its decoder.
///
/// Returns `Ok(None)` for characteristics that carry no telemetry.
pub fn decode_notification(
    characteristic: CharacteristicId,
    bytes: &[u8],
) -> Result<Option<TrainerSample>, ParseError> {
    #[cfg(debug_assertions)]
    trace!("Raw frame from {}: {:02X?}", characteristic, bytes);

    match characteristic {
        CharacteristicId::INDOOR_BIKE_DATA => decode_indoor_bike_data(bytes).map(Some),
        CharacteristicId::HEART_RATE_MEASUREMENT => {
            decode_heart_rate_measurement(bytes).map(|hr| Some(hr.to_sample()))
        }
        CharacteristicId::CYCLING_POWER_MEASUREMENT => {
            decode_cycling_power_measurement(bytes).map(Some)
        }
        _ => Ok(None),
    }
}
