use crate::error::{CgmError, Result};
use bytes::Buf;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Records shorter than this decode to an empty [`CgmMeasurement`]
pub const MIN_MEASUREMENT_LEN: usize = 4;

/// Flag bit: trend information present
pub const FLAG_TREND_PRESENT: u8 = 0x01;
/// Flag bit: quality present
pub const FLAG_QUALITY_PRESENT: u8 = 0x02;
/// Flag bit: sensor status annunciation "warning" octet present
pub const FLAG_WARNING_OCTET: u8 = 0x20;
/// Flag bit: sensor status annunciation "calibration/temperature" octet present
pub const FLAG_CAL_TEMP_OCTET: u8 = 0x40;
/// Flag bit: sensor status annunciation "status" octet present
pub const FLAG_STATUS_OCTET: u8 = 0x80;

const STATUS_OCTET_MASK: u8 = FLAG_WARNING_OCTET | FLAG_CAL_TEMP_OCTET | FLAG_STATUS_OCTET;

/// CCCD value enabling notifications
pub const CCCD_ENABLE_NOTIFICATION: [u8; 2] = [0x01, 0x00];
/// CCCD value enabling indications
pub const CCCD_ENABLE_INDICATION: [u8; 2] = [0x02, 0x00];

/// One CGM Measurement record
///
/// Layout (little-endian):
/// - Byte 0: record size (informational)
/// - Byte 1: flags
/// - Bytes 2-3: glucose concentration, SFLOAT mg/dL
/// - Bytes 4-5: time offset in minutes since session start
/// - 0 to 3 sensor status annunciation octets, one per flag bit 5/6/7
/// - Trend SFLOAT if flag bit 0, then quality SFLOAT if flag bit 1
///
/// Fields are `None` whenever the record is too short to carry them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CgmMeasurement {
    /// Size byte as sent by the sensor
    pub size: u8,
    /// Flags bitmask
    pub flags: u8,
    /// Glucose concentration
    pub glucose: Option<f32>,
    /// Minutes since session start
    pub time_offset: Option<u16>,
    /// Rate of change
    pub trend: Option<f32>,
    /// Quality in percent
    pub quality: Option<f32>,
    /// Raw sensor status annunciation octets, in flag-bit order
    pub sensor_status: Option<Vec<u8>>,
}

impl CgmMeasurement {
    /// Whether flag bit 0 announces a trend field
    #[must_use]
    pub const fn has_trend(&self) -> bool {
        self.flags & FLAG_TREND_PRESENT != 0
    }

    /// Whether flag bit 1 announces a quality field
    #[must_use]
    pub const fn has_quality(&self) -> bool {
        self.flags & FLAG_QUALITY_PRESENT != 0
    }

    /// Number of sensor status octets announced by flag bits 5, 6 and 7
    #[must_use]
    pub const fn status_octet_count(&self) -> usize {
        (self.flags & STATUS_OCTET_MASK).count_ones() as usize
    }
}

impl fmt::Display for CgmMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "size={}, flags=0x{:x}", self.size, self.flags)?;
        match self.glucose {
            Some(glucose) => write!(f, ", glucose={glucose}")?,
            None => write!(f, ", glucose=?")?,
        }
        match self.time_offset {
            Some(offset) => write!(f, ", timeOffset={offset}")?,
            None => write!(f, ", timeOffset=?")?,
        }
        if let Some(trend) = self.trend {
            write!(f, ", trend={trend}")?;
        }
        if let Some(quality) = self.quality {
            write!(f, ", quality={quality}")?;
        }
        if let Some(status) = &self.sensor_status {
            write!(f, ", status={}", to_hex(status))?;
        }
        Ok(())
    }
}

/// Decode one CGM Measurement record
///
/// Never fails: truncated input yields a partially populated record, and input
/// shorter than [`MIN_MEASUREMENT_LEN`] yields [`CgmMeasurement::default`].
#[must_use]
pub fn parse_measurement(data: &[u8]) -> CgmMeasurement {
    if data.len() < MIN_MEASUREMENT_LEN {
        return CgmMeasurement::default();
    }

    let mut buf = data;
    let size = buf.get_u8();
    let flags = buf.get_u8();

    let glucose = read_sfloat(&mut buf);
    let time_offset = if buf.remaining() >= 2 {
        Some(buf.get_u16_le())
    } else {
        None
    };

    let mut measurement = CgmMeasurement {
        size,
        flags,
        glucose,
        time_offset,
        ..CgmMeasurement::default()
    };

    let status_len = measurement.status_octet_count();
    if status_len > 0 && buf.remaining() >= status_len {
        measurement.sensor_status = Some(buf[..status_len].to_vec());
        buf.advance(status_len);
    }

    if measurement.has_trend() {
        measurement.trend = read_sfloat(&mut buf);
    }
    if measurement.has_quality() {
        measurement.quality = read_sfloat(&mut buf);
    }

    measurement
}

/// Read one little-endian SFLOAT, `None` when fewer than 2 bytes remain
pub fn read_sfloat(buf: &mut &[u8]) -> Option<f32> {
    if buf.remaining() < 2 {
        return None;
    }
    Some(decode_sfloat(buf.get_u16_le()))
}

/// Decode a raw 16-bit SFLOAT: 12-bit signed mantissa, 4-bit signed base-10 exponent
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn decode_sfloat(raw: u16) -> f32 {
    let mut mantissa = i32::from(raw & 0x0FFF);
    let mut exponent = i32::from(raw >> 12);

    if mantissa & 0x0800 != 0 {
        mantissa |= !0x0FFF;
    }
    if exponent & 0x0008 != 0 {
        exponent |= !0x000F;
    }

    (f64::from(mantissa) * 10f64.powi(exponent)) as f32
}

/// Encode a mantissa/exponent pair as a raw SFLOAT
///
/// Returns `None` when the mantissa is outside `-2048..=2047` or the exponent
/// outside `-8..=7`.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub fn encode_sfloat(mantissa: i16, exponent: i8) -> Option<u16> {
    if !(-2048..=2047).contains(&mantissa) || !(-8..=7).contains(&exponent) {
        return None;
    }
    let mantissa_bits = (mantissa as u16) & 0x0FFF;
    let exponent_bits = ((exponent as u16) & 0x000F) << 12;
    Some(exponent_bits | mantissa_bits)
}

/// Specific Ops Control Point opcodes used by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SocpOpCode {
    /// Set the measurement interval
    SetCommunicationInterval = 0x01,
    /// Ask for the measurement interval, harmless on every sensor
    GetCommunicationInterval = 0x02,
    /// Reply carrying the interval in minutes
    CommunicationIntervalResponse = 0x03,
    /// Start a sensor session
    StartSession = 0x1A,
    /// Stop the sensor session
    StopSession = 0x1B,
    /// Generic reply to a request opcode
    ResponseCode = 0x1C,
}

impl SocpOpCode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::SetCommunicationInterval),
            0x02 => Some(Self::GetCommunicationInterval),
            0x03 => Some(Self::CommunicationIntervalResponse),
            0x1A => Some(Self::StartSession),
            0x1B => Some(Self::StopSession),
            0x1C => Some(Self::ResponseCode),
            _ => None,
        }
    }

    /// Request frame for an opcode without operand
    #[must_use]
    pub fn request(self) -> Vec<u8> {
        vec![self as u8]
    }
}

/// Indication received on the Specific Ops Control Point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocpResponse {
    /// Current measurement interval
    CommunicationInterval {
        /// Interval in minutes
        minutes: u8,
    },
    /// Outcome of a request
    ResponseCode {
        /// Opcode of the request being answered
        request: u8,
        /// Response code value (1 = success)
        code: u8,
    },
    /// Any other frame
    Other {
        /// Opcode byte
        opcode: u8,
        /// Remaining bytes
        operand: Vec<u8>,
    },
}

impl SocpResponse {
    /// Parse an indication payload
    ///
    /// # Errors
    ///
    /// Returns [`CgmError::ParseError`] for an empty payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if !buf.has_remaining() {
            return Err(CgmError::ParseError("Empty control point frame".to_string()));
        }

        let opcode = buf.get_u8();
        let response = match SocpOpCode::from_u8(opcode) {
            Some(SocpOpCode::CommunicationIntervalResponse) if buf.remaining() >= 1 => {
                Self::CommunicationInterval {
                    minutes: buf.get_u8(),
                }
            }
            Some(SocpOpCode::ResponseCode) if buf.remaining() >= 2 => Self::ResponseCode {
                request: buf.get_u8(),
                code: buf.get_u8(),
            },
            _ => Self::Other {
                opcode,
                operand: buf.to_vec(),
            },
        };
        Ok(response)
    }
}

impl fmt::Display for SocpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommunicationInterval { minutes } => {
                write!(f, "communication interval {minutes} min")
            }
            Self::ResponseCode { request, code } => {
                write!(f, "response to 0x{request:02X}: code {code}")
            }
            Self::Other { opcode, operand } => {
                write!(f, "opcode 0x{opcode:02X} [{}]", to_hex(operand))
            }
        }
    }
}

/// Space separated upper-case hex, as used in log lines
#[must_use]
pub fn to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: Option<f32>, expected: f32) {
        let value = actual.expect("value should be present");
        assert!(
            (value - expected).abs() <= expected.abs() * 1e-5 + 1e-6,
            "expected {expected}, got {value}"
        );
    }

    #[test]
    fn test_sfloat_known_values() {
        assert_close(Some(decode_sfloat(0x0064)), 100.0);
        // 1234 x 10^-1
        assert_close(Some(decode_sfloat(0xF4D2)), 123.4);
        // -5 x 10^-2
        assert_close(Some(decode_sfloat(0xEFFB)), -0.05);
        // 2047 x 10^7
        assert_close(Some(decode_sfloat(0x77FF)), 2.047e10);
        // -2048 x 10^-8
        assert_close(Some(decode_sfloat(0x8800)), -2.048e-5);
    }

    #[test]
    fn test_sfloat_round_trip() {
        let mantissas = [-2048i16, -1000, -1, 0, 1, 55, 999, 2047];
        for exponent in -8i8..=7 {
            for mantissa in mantissas {
                let raw = encode_sfloat(mantissa, exponent).unwrap();
                let expected = (f64::from(mantissa) * 10f64.powi(i32::from(exponent))) as f32;
                let decoded = decode_sfloat(raw);
                assert!(
                    (decoded - expected).abs() <= expected.abs() * 1e-6,
                    "m={mantissa} e={exponent}: {decoded} != {expected}"
                );
            }
        }
    }

    #[test]
    fn test_encode_sfloat_rejects_out_of_range() {
        assert_eq!(encode_sfloat(2048, 0), None);
        assert_eq!(encode_sfloat(-2049, 0), None);
        assert_eq!(encode_sfloat(1, 8), None);
        assert_eq!(encode_sfloat(1, -9), None);
    }

    #[test]
    fn test_read_sfloat_needs_two_bytes() {
        let data = [0x64u8];
        let mut buf = &data[..];
        assert_eq!(read_sfloat(&mut buf), None);
    }

    #[test]
    fn test_short_records_decode_empty() {
        for len in 0..MIN_MEASUREMENT_LEN {
            let data = vec![0xFFu8; len];
            let m = parse_measurement(&data);
            assert_eq!(m, CgmMeasurement::default());
            assert!(m.glucose.is_none());
            assert!(m.time_offset.is_none());
            assert!(m.trend.is_none());
            assert!(m.quality.is_none());
            assert!(m.sensor_status.is_none());
        }
    }

    #[test]
    fn test_plain_record() {
        // size 6, no flags, glucose 120, offset 15 minutes
        let m = parse_measurement(&[0x06, 0x00, 0x78, 0x00, 0x0F, 0x00]);
        assert_eq!(m.size, 6);
        assert_eq!(m.flags, 0);
        assert_close(m.glucose, 120.0);
        assert_eq!(m.time_offset, Some(15));
        assert!(m.trend.is_none());
        assert!(m.quality.is_none());
        assert!(m.sensor_status.is_none());
    }

    #[test]
    fn test_four_byte_record_has_glucose_only() {
        let m = parse_measurement(&[0x04, 0x00, 0x78, 0x00]);
        assert_close(m.glucose, 120.0);
        assert_eq!(m.time_offset, None);
        assert!(m.sensor_status.is_none());
    }

    #[test]
    fn test_all_status_octets() {
        let data = [
            0x0B, 0xE3, // size, flags: trend + quality + all status octets
            0x64, 0x00, // glucose 100
            0x05, 0x00, // time offset 5
            0x11, 0x22, 0x33, // status octets
            0xFB, 0xEF, // trend -0.05
            0x5F, 0x00, // quality 95
        ];
        let m = parse_measurement(&data);
        assert_eq!(m.status_octet_count(), 3);
        assert_eq!(m.sensor_status, Some(vec![0x11, 0x22, 0x33]));
        assert_close(m.trend, -0.05);
        assert_close(m.quality, 95.0);
    }

    #[test]
    fn test_status_octets_require_full_length() {
        // flags 0xE0 needs three status bytes, only two present
        let m = parse_measurement(&[0x08, 0xE0, 0x64, 0x00, 0x05, 0x00, 0x11, 0x22]);
        assert_close(m.glucose, 100.0);
        assert_eq!(m.time_offset, Some(5));
        assert!(m.sensor_status.is_none());

        let m = parse_measurement(&[0x09, 0xE0, 0x64, 0x00, 0x05, 0x00, 0x11, 0x22, 0x33]);
        assert_eq!(m.sensor_status, Some(vec![0x11, 0x22, 0x33]));
    }

    #[test]
    fn test_single_status_octet_precedes_trend() {
        // cal/temp octet only, then trend
        let m = parse_measurement(&[0x09, 0x41, 0x64, 0x00, 0x01, 0x00, 0x7F, 0x0A, 0x00]);
        assert_eq!(m.sensor_status, Some(vec![0x7F]));
        assert_close(m.trend, 10.0);
        assert!(m.quality.is_none());
    }

    #[test]
    fn test_truncated_trend_and_quality() {
        // trend and quality announced, one byte left
        let m = parse_measurement(&[0x07, 0x03, 0x64, 0x00, 0x01, 0x00, 0x0A]);
        assert!(m.trend.is_none());
        assert!(m.quality.is_none());
    }

    #[test]
    fn test_measurement_display() {
        let m = parse_measurement(&[0x06, 0x00, 0x78, 0x00, 0x0F, 0x00]);
        assert_eq!(m.to_string(), "size=6, flags=0x0, glucose=120, timeOffset=15");

        let empty = CgmMeasurement::default();
        assert_eq!(empty.to_string(), "size=0, flags=0x0, glucose=?, timeOffset=?");
    }

    #[test]
    fn test_socp_response_parsing() {
        assert_eq!(
            SocpResponse::parse(&[0x03, 0x05]).unwrap(),
            SocpResponse::CommunicationInterval { minutes: 5 }
        );
        assert_eq!(
            SocpResponse::parse(&[0x1C, 0x02, 0x01]).unwrap(),
            SocpResponse::ResponseCode {
                request: 0x02,
                code: 0x01
            }
        );
        assert_eq!(
            SocpResponse::parse(&[0x1C, 0x02]).unwrap(),
            SocpResponse::Other {
                opcode: 0x1C,
                operand: vec![0x02]
            }
        );
        assert!(SocpResponse::parse(&[]).is_err());
        assert_eq!(SocpOpCode::GetCommunicationInterval.request(), vec![0x02]);
    }

    #[test]
    fn test_hex_formatting() {
        assert_eq!(to_hex(&[0x01, 0xAB, 0x00]), "01 AB 00");
        assert_eq!(to_hex(&[]), "");
    }
}
