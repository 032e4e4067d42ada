#[macro_export]
macro_rules! choose {
    ($cond: expr => $true_val: expr, $false_val: expr) => {{
        if $cond {
            $true_val
        } else {
            $false_val
        }
    }};
}

/// Rounds `value` up to the nearest multiple of `multiple`. A zero multiple leaves the value as is.
#[inline]
pub fn round_up(value: u32, multiple: u32) -> u32 {
    match multiple {
        0 => value,
        _ => ((value + multiple - 1) / multiple) * multiple,
    }
}
