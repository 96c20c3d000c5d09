//! Builder library for emberfs, a flash-friendly log-structured filesystem.
//!
//! The `mkfs.emberfs` binary is a thin wrapper around this crate: it opens the
//! device, runs every metadata subsystem through the five creation phases and
//! writes the finished image out in one pass.

use std::fmt;
use std::process::exit;

pub mod bitmap;
pub mod commit;
pub mod compression;
pub mod device;
pub mod error;
pub mod layout;
pub mod log;
pub mod maptbl;
pub mod maptbl_cache;
pub mod ondisk;
pub mod options;
pub mod segbmap;
pub mod snapshot;
pub mod superblock;

/// Fixed granularity steps accepted on the command line.
pub const SIZE_256B: u64 = 256;
pub const SIZE_512B: u64 = 512;
pub const SIZE_1KB: u64 = 1024;
pub const SIZE_2KB: u64 = 2048;
pub const SIZE_4KB: u64 = 4096;
pub const SIZE_8KB: u64 = 8192;
pub const SIZE_16KB: u64 = 16384;
pub const SIZE_32KB: u64 = 32768;
pub const SIZE_64KB: u64 = 65536;
pub const SIZE_128KB: u64 = 131072;
pub const SIZE_256KB: u64 = 262144;
pub const SIZE_512KB: u64 = 524288;
pub const SIZE_1MB: u64 = 1048576;
pub const SIZE_2MB: u64 = 2097152;
pub const SIZE_8MB: u64 = 8388608;
pub const SIZE_16MB: u64 = 16777216;
pub const SIZE_32MB: u64 = 33554432;
pub const SIZE_64MB: u64 = 67108864;
pub const SIZE_128MB: u64 = 134217728;
pub const SIZE_256MB: u64 = 268435456;
pub const SIZE_512MB: u64 = 536870912;
pub const SIZE_1GB: u64 = 1073741824;
pub const SIZE_2GB: u64 = 2147483648;
pub const SIZE_8GB: u64 = 8589934592;
pub const SIZE_16GB: u64 = 17179869184;
pub const SIZE_32GB: u64 = 34359738368;
pub const SIZE_64GB: u64 = 68719476736;

/// Content granularity of metadata table fragments (segment bitmap fragments,
/// LEB/PEB table mempages, mapping-table cache pages).
pub const MEM_PAGE_SIZE: u32 = 4096;

/// Prints an informational line on stdout when `show` is set.
#[macro_export]
macro_rules! mkfs_info {
    ($show:expr, $($arg:tt)*) => {
        if $show {
            println!($($arg)*);
        }
    };
}

/// Prints an error line on stderr, prefixed with the failing position.
#[macro_export]
macro_rules! mkfs_err {
    ($($arg:tt)*) => {
        eprintln!("mkfs.emberfs: {}:{}:{}: {}",
                  file!(), line!(), module_path!(), format_args!($($arg)*));
    };
}

/// Prints a warning line on stderr.
#[macro_export]
macro_rules! mkfs_warn {
    ($($arg:tt)*) => {
        eprintln!("mkfs.emberfs: WARNING: {}", format_args!($($arg)*));
    };
}

/// Prints a debug line on stderr when `show` is set.
#[macro_export]
macro_rules! mkfs_dbg {
    ($show:expr, $($arg:tt)*) => {
        if $show {
            eprintln!("mkfs.emberfs: {}:{}:{}: {}",
                      file!(), line!(), module_path!(), format_args!($($arg)*));
        }
    };
}

/// Checks an invariant the builder believes holds by construction. A debug
/// build asserts; a release build reports `Error::Internal` to the driver.
#[macro_export]
macro_rules! verify_internal {
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            debug_assert!($cond, $($arg)*);
            $crate::mkfs_err!($($arg)*);
            return Err($crate::error::Error::internal(format!($($arg)*)));
        }
    };
}

/// Writes an error to stderr, then exits.
pub fn fatal<M: fmt::Display>(msg: M) -> ! {
    eprintln!("mkfs.emberfs: error: {msg}");
    exit(1);
}

/// Returns `log2(n)` for a non-zero power of two, `None` otherwise.
pub fn log2(n: u64) -> Option<u32> {
    if n == 0 || !n.is_power_of_two() {
        return None;
    }
    Some(n.trailing_zeros())
}

/// Division rounding the quotient up.
pub fn ceil_division(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn log2_of_powers_of_two() {
        assert_eq!(log2(1), Some(0));
        assert_eq!(log2(SIZE_4KB), Some(12));
        assert_eq!(log2(SIZE_8MB), Some(23));
        assert_eq!(log2(0), None);
        assert_eq!(log2(3), None);
        assert_eq!(log2(SIZE_8MB + 1), None);
    }

    #[test]
    fn ceil_division_rounds_up() {
        assert_eq!(ceil_division(0, 4), 0);
        assert_eq!(ceil_division(1, 4), 1);
        assert_eq!(ceil_division(4, 4), 1);
        assert_eq!(ceil_division(5, 4), 2);
    }
}
