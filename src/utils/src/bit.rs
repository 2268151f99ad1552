pub fn is_power_of_two(n: u64) -> bool {
    n != 0 && n & (n - 1) == 0
}

/// Rounds `n` up to the next multiple of `align` (a power of two).
/// None on wraparound past the machine word.
pub fn align_up(n: u64, align: u64) -> Option<u64> {
    debug_assert!(is_power_of_two(align));
    let mask = align - 1;
    n.checked_add(mask).map(|v| v & !mask)
}

pub fn align_down(n: u64, align: u64) -> u64 {
    debug_assert!(is_power_of_two(align));
    n & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align() {
        assert_eq!(align_up(0, 0x1000), Some(0));
        assert_eq!(align_up(1, 0x1000), Some(0x1000));
        assert_eq!(align_up(0x1000, 0x1000), Some(0x1000));
        assert_eq!(align_up(u64::MAX, 0x1000), None);
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
    }
}
