//! Axis and MACRO-station addressing arithmetic.
//!
//! Pure functions: every input the controller would normally supply (model
//! family, axis count) is passed in explicitly, so nothing here touches the wire.
//!
//! On a Geobrick/Clipper the first 8 axes are on-board; axes beyond that sit on
//! the MACRO ring. On other Turbo controllers every axis is a MACRO-station axis.

use crate::error::{PmacError, PmacResult};

/// Number of on-board axes on a Geobrick or Clipper.
pub const ONBOARD_AXES: i32 = 8;

/// Axes served by one MACRO IC.
pub const AXES_PER_MACRO_IC: u32 = 8;

/// MACRO-station number for each ring axis, in ring order.
pub const MACRO_STATION_LOOKUP_TABLE: [u32; 34] = [
    0, 1, 4, 5, 8, 9, 12, 13, 16, 17, 20, 21, 24, 25, 28, 29, 32, 33, 36, 37, 40, 41, 44, 45,
    48, 49, 52, 53, 56, 57, 60, 61, 64, 65,
];

/// Reject negative axes and axes beyond the controller's count.
pub fn check_axis_is_in_range(axis: i32, num_axes: u32) -> PmacResult<()> {
    if axis < 0 {
        return Err(PmacError::NegativeAxis);
    }
    if axis as u32 > num_axes {
        return Err(PmacError::AxisOutOfRange {
            axis,
            available: num_axes,
        });
    }
    Ok(())
}

/// `true` if the axis is reached over the MACRO ring.
pub fn is_macro_station_axis(axis: i32, num_axes: u32, geobrick: bool) -> PmacResult<bool> {
    check_axis_is_in_range(axis, num_axes)?;
    Ok(!geobrick || axis > ONBOARD_AXES)
}

/// MACRO-station number of a ring axis.
///
/// `start_offset` shifts the table index for Geobricks whose ring does not start
/// at the first station; it is ignored on other controllers.
pub fn macro_station_number(
    axis: i32,
    num_axes: u32,
    geobrick: bool,
    start_offset: usize,
) -> PmacResult<u32> {
    check_axis_is_in_range(axis, num_axes)?;
    let index = if geobrick {
        if axis <= ONBOARD_AXES {
            return Err(PmacError::NotMacroStationAxis(axis));
        }
        (axis - ONBOARD_AXES - 1) as usize + start_offset
    } else {
        if axis < 1 {
            return Err(PmacError::NotMacroStationAxis(axis));
        }
        (axis - 1) as usize
    };
    MACRO_STATION_LOOKUP_TABLE
        .get(index)
        .copied()
        .ok_or(PmacError::NotMacroStationAxis(axis))
}

/// Base of the I7000+ variable block for an on-board Geobrick axis.
///
/// Axes 1..=8 map to 7010, 7020, 7030, 7040, 7110, 7120, 7130, 7140.
pub fn onboard_i7000_base(axis: i32, num_axes: u32, geobrick: bool) -> PmacResult<u32> {
    if is_macro_station_axis(axis, num_axes, geobrick)? || axis < 1 {
        return Err(PmacError::NotOnboardAxis(axis));
    }
    let m = ((axis - 1) / 4) as u32;
    let n = ((axis - 1) % 4 + 1) as u32;
    Ok(7000 + 100 * m + 10 * n)
}

/// I-variable number of an axis setup variable `Ixxyy`.
pub fn axis_setup_i_var(axis: i32, offset: u32) -> u32 {
    100 * axis.max(0) as u32 + offset
}

/// Axis count contributed by MACRO ICs, given the values of I20..I23.
///
/// An IC is present when its base address is non-zero.
pub fn macro_ic_axis_count<S: AsRef<str>>(ic_base_addresses: &[S]) -> u32 {
    ic_base_addresses
        .iter()
        .filter(|value| !is_zero_value(value.as_ref()))
        .count() as u32
        * AXES_PER_MACRO_IC
}

fn is_zero_value(value: &str) -> bool {
    let digits = value.trim().trim_start_matches('$');
    !digits.is_empty() && digits.chars().all(|c| c == '0')
}
