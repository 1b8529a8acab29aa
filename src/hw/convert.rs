//! Conversion between native driver samples and `f32`.
//!
//! Integer samples are normalised against 2^31 regardless of their wire
//! width: the value bits are first aligned so their MSB sits at bit 31.
//! On the way out, floats are scaled by 2^31 and clipped to
//! `[-2^31, 2^31 * (1 - epsilon)]` so the positive edge cannot wrap.
//! Float wire formats are clipped to `[-1, +1]` and passed through
//! otherwise.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::format::SampleFormat;

const INT_AMPLITUDE: f32 = 2_147_483_648.0;
const INT_MIN: f32 = -INT_AMPLITUDE;
const INT_MAX: f32 = INT_AMPLITUDE * (1.0 - f32::EPSILON);

/// Convert `frames` native samples from `src` into `dst`.
///
/// `src` must hold at least `dst.len() * format.bytes_per_sample()` bytes.
pub fn to_float(src: &[u8], format: SampleFormat, dst: &mut [f32]) {
    let bps = format.bytes_per_sample();
    for (frame, out) in dst.iter_mut().enumerate() {
        let at = frame * bps;
        *out = match format {
            SampleFormat::Float32Le => LittleEndian::read_f32(&src[at..at + 4]),
            SampleFormat::Float32Be => BigEndian::read_f32(&src[at..at + 4]),
            SampleFormat::Float64Le => LittleEndian::read_f64(&src[at..at + 8]) as f32,
            SampleFormat::Float64Be => BigEndian::read_f64(&src[at..at + 8]) as f32,
            _ => {
                let raw = read_container(&src[at..at + bps], format);
                // Bits above the significant range are shifted out, so an
                // unclean container cannot leak into the value.
                let aligned = raw.wrapping_shl(format.align_shift());
                aligned as f32 / INT_AMPLITUDE
            }
        };
    }
}

/// Convert `src` into `frames` native samples in `dst`.
///
/// `dst` must hold at least `src.len() * format.bytes_per_sample()` bytes.
pub fn from_float(src: &[f32], format: SampleFormat, dst: &mut [u8]) {
    let bps = format.bytes_per_sample();
    for (frame, &sample) in src.iter().enumerate() {
        let at = frame * bps;
        if format.is_float() {
            let clipped = sample.clamp(-1.0, 1.0);
            match format {
                SampleFormat::Float32Le => LittleEndian::write_f32(&mut dst[at..at + 4], clipped),
                SampleFormat::Float32Be => BigEndian::write_f32(&mut dst[at..at + 4], clipped),
                SampleFormat::Float64Le => {
                    LittleEndian::write_f64(&mut dst[at..at + 8], clipped as f64)
                }
                SampleFormat::Float64Be => {
                    BigEndian::write_f64(&mut dst[at..at + 8], clipped as f64)
                }
                _ => unreachable!(),
            }
        } else {
            let scaled = (sample * INT_AMPLITUDE).clamp(INT_MIN, INT_MAX);
            let aligned = scaled as i32;
            let raw = aligned >> format.align_shift();
            write_container(&mut dst[at..at + bps], format, raw);
        }
    }
}

fn read_container(bytes: &[u8], format: SampleFormat) -> i32 {
    let be = format.is_big_endian();
    match format.bytes_per_sample() {
        2 => {
            if be {
                BigEndian::read_i16(bytes) as i32
            } else {
                LittleEndian::read_i16(bytes) as i32
            }
        }
        3 => {
            if be {
                BigEndian::read_i24(bytes)
            } else {
                LittleEndian::read_i24(bytes)
            }
        }
        _ => {
            if be {
                BigEndian::read_i32(bytes)
            } else {
                LittleEndian::read_i32(bytes)
            }
        }
    }
}

fn write_container(bytes: &mut [u8], format: SampleFormat, value: i32) {
    let be = format.is_big_endian();
    match format.bytes_per_sample() {
        2 => {
            if be {
                BigEndian::write_i16(bytes, value as i16)
            } else {
                LittleEndian::write_i16(bytes, value as i16)
            }
        }
        3 => {
            if be {
                BigEndian::write_i24(bytes, value)
            } else {
                LittleEndian::write_i24(bytes, value)
            }
        }
        _ => {
            if be {
                BigEndian::write_i32(bytes, value)
            } else {
                LittleEndian::write_i32(bytes, value)
            }
        }
    }
}

/// Round-trip one float sample through the native representation.
pub fn round_trip_sample(format: SampleFormat, sample: f32) -> f32 {
    let mut wire = [0u8; 8];
    let src = [sample];
    let mut dst = [0f32];
    from_float(&src, format, &mut wire);
    to_float(&wire, format, &mut dst);
    dst[0]
}

/// Largest float value a channel of this format can reproduce: the round
/// trip of +1.0. Clients compare against this to detect hardware clipping
/// precisely.
pub fn max_sample_value(format: SampleFormat) -> f32 {
    round_trip_sample(format, 1.0)
}

/// Smallest reproducible value: the round trip of -1.0.
pub fn min_sample_value(format: SampleFormat) -> f32 {
    round_trip_sample(format, -1.0)
}
