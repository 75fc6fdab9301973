//! Raw register to engineering-unit conversion.
//!
//! Pure functions, applied in this order to a channel's process-value register:
//!
//! 1. **Sign extension**: the register is a 16-bit two's-complement value.
//! 2. **Decimal scaling**: divide by `10^decimal_point`.
//! 3. **Linear remap** (optional): map `[input_low, input_high]` onto
//!    `[output_low, output_high]` and round to `decimal_point` digits.
//!
//! The remap is skipped, and the decimal-scaled value passes through unchanged, when
//! scaling is disabled for the channel, when the input span is narrower than
//! [`MIN_INPUT_SPAN`], or when the value is below `input_low`. Readings under the
//! configured input floor are never extrapolated.

use crate::config::ChannelConfig;
use crate::source::{RawSample, FAILED_READING, INACTIVE_READING};

/// Smallest input span (`input_high - input_low`) for which the remap is applied.
pub const MIN_INPUT_SPAN: f64 = 10.0;

/// Interpret a register word as a signed 16-bit value.
pub fn sign_extend(raw: u16) -> i32 {
    i32::from(raw as i16)
}

/// Apply the implied decimal point.
pub fn decimal_scale(value: i32, decimal_point: u8) -> f64 {
    if decimal_point > 0 {
        f64::from(value) / 10f64.powi(i32::from(decimal_point))
    } else {
        f64::from(value)
    }
}

/// Round to a fixed number of decimal digits.
pub fn round_to(value: f64, digits: u8) -> f64 {
    let factor = 10f64.powi(i32::from(digits));
    (value * factor).round() / factor
}

/// Whether the linear remap applies to `value` on this channel.
pub fn remap_applies(channel: &ChannelConfig, value: f64) -> bool {
    channel.scale
        && channel.input_high >= channel.input_low + MIN_INPUT_SPAN
        && value >= channel.input_low
}

/// Map a decimal-scaled value from the input range onto the output range.
pub fn remap(channel: &ChannelConfig, value: f64) -> f64 {
    let gain =
        (channel.output_high - channel.output_low) / (channel.input_high - channel.input_low);
    let mapped = gain * (value - channel.input_low) + channel.output_low;
    round_to(mapped, channel.decimal_point)
}

/// Full conversion of a process-value register.
pub fn scale_register(raw: u16, channel: &ChannelConfig) -> f64 {
    let value = decimal_scale(sign_extend(raw), channel.decimal_point);
    if remap_applies(channel, value) {
        remap(channel, value)
    } else {
        value
    }
}

/// Engineering value of one channel's reading for this tick.
pub fn scale_sample(sample: &RawSample, channel: &ChannelConfig) -> f64 {
    match sample {
        RawSample::Inactive => INACTIVE_READING,
        RawSample::Failed => FAILED_READING,
        RawSample::Recorded(value) => *value,
        RawSample::Register { process, .. } => scale_register(*process, channel),
    }
}
