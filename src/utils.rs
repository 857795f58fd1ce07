use std::fmt::{Debug, Formatter};

/// Wraps a preformatted string so `Debug` output prints it without quotes.
pub struct DebugStr(pub String);

impl Debug for DebugStr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const SLOT_SIZE: usize = 8;

pub const fn align_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        value
    } else {
        (value + align - 1) / align * align
    }
}

/// Number of 8-byte stack slots needed to hold `bytes`.
pub const fn slots_for_bytes(bytes: usize) -> usize {
    (bytes + SLOT_SIZE - 1) / SLOT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_rounding() {
        assert_eq!(slots_for_bytes(0), 0);
        assert_eq!(slots_for_bytes(1), 1);
        assert_eq!(slots_for_bytes(8), 1);
        assert_eq!(slots_for_bytes(12), 2);
        assert_eq!(slots_for_bytes(17), 3);
        assert_eq!(align_up(13, 4), 16);
        assert_eq!(align_up(13, 1), 13);
    }
}
