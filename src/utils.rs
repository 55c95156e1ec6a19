#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::sync::OnceLock;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Reports a broken caller contract (refcount/pincount underflow, stale handle).
///
/// Fatal in debug builds; in release builds the message is logged and the
/// caller continues with a best-effort no-op.
#[macro_export]
macro_rules! invariant_violation {
    ($($arg:tt)*) => {{
        ::log::error!($($arg)*);
        if cfg!(debug_assertions) {
            panic!($($arg)*);
        }
    }};
}

/// CPU page size as reported by the OS, cached after the first query.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| {
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ret > 0 {
            ret as usize
        } else {
            FALLBACK_PAGE_SIZE
        }
    })
}

#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn align_down(val: u64, align: u64) -> u64 {
    val & !(align - 1)
}

/// Number of `page`-sized pages needed to hold `size` bytes.
#[must_use]
pub const fn page_count(size: usize, page: usize) -> usize {
    size.div_ceil(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_down(4095, 4096), 0);
        assert_eq!(align_down(8193, 4096), 8192);
        assert_eq!(page_count(1, 4096), 1);
        assert_eq!(page_count(4096, 4096), 1);
        assert_eq!(page_count(4097, 4096), 2);
    }

    #[test]
    fn page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
    }
}
