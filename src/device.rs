//! Device access: one operations trait, three back-ends (MTD, raw block
//! device or image file, zoned block device) and the open-time probing that
//! selects between them.

use crate::error::{Error, Result};
use crate::mkfs_dbg;
use crate::mkfs_err;
use crate::ondisk::RESERVED_BOOT_RECORD_SIZE;
use libc::ioctl;
use std::ffi::c_ulong;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::fs::MetadataExt;

/// ioctl macro: command.
macro_rules! ioc {
    ($dir:expr, $ty:expr, $nr:expr, $size:expr) => {
        ((($dir) << 30) | (($ty) << 8) | ($nr) | (($size) << 16)) as c_ulong
    };
}

/// ioctl macro: no-argument command.
macro_rules! io {
    ($ty:expr, $nr:expr) => {
        ioc!(0u64, $ty, $nr, 0u64)
    };
}

/// ioctl macro: write command.
macro_rules! iow {
    ($ty:expr, $nr:expr, $arg:ty) => {
        ioc!(1u64, $ty, $nr, std::mem::size_of::<$arg>() as u64)
    };
}

/// ioctl macro: read command.
macro_rules! ior {
    ($ty:expr, $nr:expr, $arg:ty) => {
        ioc!(2u64, $ty, $nr, std::mem::size_of::<$arg>() as u64)
    };
}

/// MTD character devices use this major number.
const MTD_MAJOR_DEV: u32 = 90;

#[repr(C)]
struct MtdInfoUser {
    kind: u8,
    flags: u32,
    size: u32,
    erasesize: u32,
    writesize: u32,
    oobsize: u32,
    padding: u64,
}

#[repr(C)]
struct EraseInfoUser {
    start: u32,
    length: u32,
}

#[repr(C)]
struct EraseInfoUser64 {
    start: u64,
    length: u64,
}

#[repr(C)]
struct BlkZoneRange {
    sector: u64,
    nr_sectors: u64,
}

const MEMGETINFO: c_ulong = ior!(0x4Du64, 1u64, MtdInfoUser);
const MEMERASE: c_ulong = iow!(0x4Du64, 2u64, EraseInfoUser);
const MEMGETBADBLOCK: c_ulong = iow!(0x4Du64, 11u64, i64);
const MEMERASE64: c_ulong = iow!(0x4Du64, 20u64, EraseInfoUser64);

const BLKGETSIZE64: c_ulong = ior!(0x12u64, 114u64, u64);
const BLKSECDISCARD: c_ulong = io!(0x12u64, 125u64);
const BLKZEROOUT: c_ulong = io!(0x12u64, 127u64);
const BLKRESETZONE: c_ulong = iow!(0x12u64, 131u64, BlkZoneRange);
const BLKGETZONESZ: c_ulong = ior!(0x12u64, 132u64, u32);
const BLKOPENZONE: c_ulong = iow!(0x12u64, 134u64, BlkZoneRange);
const BLKFINISHZONE: c_ulong = iow!(0x12u64, 136u64, BlkZoneRange);

const SECTOR_SIZE: u64 = 512;

/// NAND geometry details.
#[derive(Clone, Copy)]
pub struct NandGeometry {
    /// Erase size in bytes.
    pub erasesize: u32,
    /// NAND flash page size in bytes.
    pub writesize: u32,
}

/// Kinds of opened devices.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceType {
    Mtd,
    Block,
    Zoned,
}

/// Result of probing the configured geometry against the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GeometryStatus {
    /// The device agrees with the configured geometry.
    Matches,
    /// The probe overwrote the geometry; the caller must re-derive sizes.
    Corrected,
}

/// Result of probing one PEB.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PebCondition {
    Ok,
    Bad,
    Recovering,
}

/// `pread` with EINTR retry until the whole buffer is transferred.
pub fn device_pread(file: &File, mut offset: u64, buf: &mut [u8]) -> Result<()> {
    let fd = file.as_raw_fd();
    let mut rest = buf.len();
    let mut pos = 0usize;

    while rest > 0 {
        let ret = unsafe {
            libc::pread(fd, buf[pos..].as_mut_ptr() as *mut _, rest, offset as libc::off_t)
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            mkfs_err!("read failed: {err}");
            return Err(err.into());
        } else if ret == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read",
            )));
        }

        rest -= ret as usize;
        pos += ret as usize;
        offset += ret as u64;
    }

    Ok(())
}

/// `pwrite` with EINTR retry until the whole buffer is transferred.
pub fn device_pwrite(file: &File, mut offset: u64, buf: &[u8]) -> Result<()> {
    let fd = file.as_raw_fd();
    let mut rest = buf.len();
    let mut pos = 0usize;

    while rest > 0 {
        let ret = unsafe {
            libc::pwrite(fd, buf[pos..].as_ptr() as *const _, rest, offset as libc::off_t)
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            mkfs_err!("write failed: {err}");
            return Err(err.into());
        } else if ret == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write",
            )));
        }

        rest -= ret as usize;
        pos += ret as usize;
        offset += ret as u64;
    }

    Ok(())
}

/// The capability surface the builder consumes from a storage back-end.
pub trait DeviceOps {
    fn read(&self, file: &File, offset: u64, buf: &mut [u8], show_debug: bool) -> Result<()>;

    fn write(
        &self,
        file: &File,
        geometry: &NandGeometry,
        offset: u64,
        buf: &[u8],
        open_zones: &mut u32,
        show_debug: bool,
    ) -> Result<()>;

    fn erase(
        &self,
        file: &File,
        offset: u64,
        size: u64,
        fill_buf: &[u8],
        show_debug: bool,
    ) -> Result<()>;

    fn check_nand_geometry(
        &self,
        file: &File,
        geometry: &mut NandGeometry,
        show_debug: bool,
    ) -> Result<GeometryStatus>;

    fn check_peb(
        &self,
        file: &File,
        offset: u64,
        erasesize: u32,
        need_close_zone: bool,
        show_debug: bool,
    ) -> Result<PebCondition>;
}

/// MTD back-end: erase through the MEMERASE ioctls, geometry through
/// MEMGETINFO, bad block probing through MEMGETBADBLOCK.
pub struct MtdOps;

impl DeviceOps for MtdOps {
    fn read(&self, file: &File, offset: u64, buf: &mut [u8], _show_debug: bool) -> Result<()> {
        device_pread(file, offset, buf)
    }

    fn write(
        &self,
        file: &File,
        _geometry: &NandGeometry,
        offset: u64,
        buf: &[u8],
        _open_zones: &mut u32,
        _show_debug: bool,
    ) -> Result<()> {
        device_pwrite(file, offset, buf)
    }

    fn erase(
        &self,
        file: &File,
        offset: u64,
        size: u64,
        _fill_buf: &[u8],
        _show_debug: bool,
    ) -> Result<()> {
        let fd = file.as_raw_fd();

        let res = if offset >= 0x1_0000_0000 {
            let ei = EraseInfoUser64 { start: offset, length: size };
            unsafe { ioctl(fd, MEMERASE64, &ei) }
        } else {
            let ei = EraseInfoUser { start: offset as u32, length: size as u32 };
            unsafe { ioctl(fd, MEMERASE, &ei) }
        };

        if res < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn check_nand_geometry(
        &self,
        file: &File,
        geometry: &mut NandGeometry,
        _show_debug: bool,
    ) -> Result<GeometryStatus> {
        let mut info: MtdInfoUser = unsafe { std::mem::zeroed() };

        let res = unsafe { ioctl(file.as_raw_fd(), MEMGETINFO, &mut info) };
        if res < 0 {
            let err = io::Error::last_os_error();
            mkfs_err!("fail to get MTD characteristics info: {err}");
            return Err(err.into());
        }

        if info.erasesize != geometry.erasesize {
            mkfs_err!("device erasesize {} != erasesize {}", info.erasesize, geometry.erasesize);
            return Err(Error::invalid("MTD erase size mismatch"));
        }
        if info.writesize != geometry.writesize {
            mkfs_err!("device writesize {} != writesize {}", info.writesize, geometry.writesize);
            return Err(Error::invalid("MTD write size mismatch"));
        }

        Ok(GeometryStatus::Matches)
    }

    fn check_peb(
        &self,
        file: &File,
        offset: u64,
        erasesize: u32,
        _need_close_zone: bool,
        show_debug: bool,
    ) -> Result<PebCondition> {
        let fd = file.as_raw_fd();
        let loffset = offset as i64;

        let res = unsafe { ioctl(fd, MEMGETBADBLOCK, &loffset) };
        if res < 0 {
            let err = io::Error::last_os_error();
            mkfs_err!("fail to check PEB: offset {offset}: {err}");
            return Err(err.into());
        } else if res > 0 {
            return Ok(PebCondition::Bad);
        }

        match self.erase(file, offset, erasesize as u64, &[], show_debug) {
            Ok(()) => Ok(PebCondition::Ok),
            Err(_) => Ok(PebCondition::Recovering),
        }
    }
}

/// Raw block device / image file back-end. Erase tries secure discard, falls
/// back to zero-out, then to bulk writes of the fill buffer.
pub struct BdevOps;

impl DeviceOps for BdevOps {
    fn read(&self, file: &File, offset: u64, buf: &mut [u8], _show_debug: bool) -> Result<()> {
        device_pread(file, offset, buf)
    }

    fn write(
        &self,
        file: &File,
        _geometry: &NandGeometry,
        offset: u64,
        buf: &[u8],
        _open_zones: &mut u32,
        _show_debug: bool,
    ) -> Result<()> {
        device_pwrite(file, offset, buf)
    }

    fn erase(
        &self,
        file: &File,
        offset: u64,
        size: u64,
        fill_buf: &[u8],
        show_debug: bool,
    ) -> Result<()> {
        let fd = file.as_raw_fd();
        let range: [u64; 2] = [offset, size];

        if unsafe { ioctl(fd, BLKSECDISCARD, &range) } >= 0 {
            return Ok(());
        }

        mkfs_dbg!(show_debug, "BLKSECDISCARD is not supported: offset {offset}, size {size}");

        if unsafe { ioctl(fd, BLKZEROOUT, &range) } >= 0 {
            return Ok(());
        }

        mkfs_dbg!(show_debug, "BLKZEROOUT is not supported: trying write: offset {offset}, size {size}");

        let mut erased_bytes = 0u64;
        while erased_bytes < size {
            device_pwrite(file, offset + erased_bytes, fill_buf)?;
            erased_bytes += fill_buf.len() as u64;
        }

        Ok(())
    }

    fn check_nand_geometry(
        &self,
        _file: &File,
        _geometry: &mut NandGeometry,
        _show_debug: bool,
    ) -> Result<GeometryStatus> {
        Err(Error::invalid("block devices report no NAND geometry"))
    }

    fn check_peb(
        &self,
        _file: &File,
        _offset: u64,
        _erasesize: u32,
        _need_close_zone: bool,
        _show_debug: bool,
    ) -> Result<PebCondition> {
        Err(Error::invalid("block devices cannot probe erase blocks"))
    }
}

/// Zoned block device back-end: erase resets the zone, the first write into a
/// zone opens it explicitly.
pub struct ZnsOps;

impl DeviceOps for ZnsOps {
    fn read(&self, file: &File, offset: u64, buf: &mut [u8], _show_debug: bool) -> Result<()> {
        device_pread(file, offset, buf)
    }

    fn write(
        &self,
        file: &File,
        geometry: &NandGeometry,
        offset: u64,
        buf: &[u8],
        open_zones: &mut u32,
        show_debug: bool,
    ) -> Result<()> {
        let zone_start = (offset / geometry.erasesize as u64) * geometry.erasesize as u64;

        mkfs_dbg!(
            show_debug,
            "trying write: offset {offset}, size {}, zone_start {zone_start}, erasesize {}",
            buf.len(),
            geometry.erasesize
        );

        if zone_start == offset || offset == RESERVED_BOOT_RECORD_SIZE as u64 {
            let range = BlkZoneRange {
                sector: zone_start / SECTOR_SIZE,
                nr_sectors: geometry.erasesize as u64 / SECTOR_SIZE,
            };

            if unsafe { ioctl(file.as_raw_fd(), BLKOPENZONE, &range) } < 0 {
                let err = io::Error::last_os_error();
                mkfs_err!(
                    "fail to open zone (start {}, sectors {}): {err}",
                    range.sector,
                    range.nr_sectors
                );
                return Err(err.into());
            }

            *open_zones += 1;
            mkfs_dbg!(show_debug, "open_zones {}", *open_zones);
        }

        if (zone_start + geometry.erasesize as u64) < (offset + buf.len() as u64) {
            mkfs_err!(
                "invalid write request: zone (start {zone_start}, erasesize {}), request (offset {offset}, size {})",
                geometry.erasesize,
                buf.len()
            );
            return Err(Error::invalid("write crosses a zone boundary"));
        }

        device_pwrite(file, offset, buf)
    }

    fn erase(
        &self,
        file: &File,
        offset: u64,
        size: u64,
        _fill_buf: &[u8],
        show_debug: bool,
    ) -> Result<()> {
        let range = BlkZoneRange {
            sector: offset / SECTOR_SIZE,
            nr_sectors: (size + SECTOR_SIZE - 1) / SECTOR_SIZE,
        };

        mkfs_dbg!(
            show_debug,
            "erase zone: offset {offset}, size {size}, range (sector {}, nr_sectors {})",
            range.sector,
            range.nr_sectors
        );

        if unsafe { ioctl(file.as_raw_fd(), BLKRESETZONE, &range) } < 0 {
            let err = io::Error::last_os_error();
            mkfs_err!("fail to reset zone (offset {offset}, size {size}): {err}");
            return Err(err.into());
        }

        Ok(())
    }

    fn check_nand_geometry(
        &self,
        file: &File,
        geometry: &mut NandGeometry,
        show_debug: bool,
    ) -> Result<GeometryStatus> {
        let mut sectors_per_zone: u32 = 0;

        let res = unsafe { ioctl(file.as_raw_fd(), BLKGETZONESZ, &mut sectors_per_zone) };
        if res < 0 {
            let err = io::Error::last_os_error();
            mkfs_err!("fail to retrieve zone size: {err}");
            return Err(err.into());
        }
        if sectors_per_zone == 0 {
            return Err(Error::device("device reports a zero zone size"));
        }

        let zone_size = sectors_per_zone as u64 * SECTOR_SIZE;
        if zone_size >= u32::MAX as u64 {
            return Err(Error::invalid(format!("unsupported zone size {zone_size}")));
        }

        mkfs_dbg!(show_debug, "sectors_per_zone {sectors_per_zone}, zone_size {zone_size}");

        let mut status = GeometryStatus::Matches;

        if zone_size != geometry.erasesize as u64 {
            geometry.erasesize = zone_size as u32;
            status = GeometryStatus::Corrected;
        }

        if zone_size % geometry.writesize as u64 != 0 {
            geometry.writesize = match geometry.writesize {
                w if w <= crate::SIZE_4KB as u32 => crate::SIZE_4KB as u32,
                w if w <= crate::SIZE_8KB as u32 => crate::SIZE_8KB as u32,
                w if w <= crate::SIZE_16KB as u32 => crate::SIZE_16KB as u32,
                _ => crate::SIZE_32KB as u32,
            };
            status = GeometryStatus::Corrected;
        }

        Ok(status)
    }

    fn check_peb(
        &self,
        file: &File,
        offset: u64,
        erasesize: u32,
        need_close_zone: bool,
        _show_debug: bool,
    ) -> Result<PebCondition> {
        if need_close_zone {
            let range = BlkZoneRange {
                sector: offset / SECTOR_SIZE,
                nr_sectors: (erasesize as u64 + SECTOR_SIZE - 1) / SECTOR_SIZE,
            };

            if unsafe { ioctl(file.as_raw_fd(), BLKFINISHZONE, &range) } < 0 {
                let err = io::Error::last_os_error();
                mkfs_err!("fail to finish zone (offset {offset}, size {erasesize}): {err}");
                return Err(err.into());
            }
        }

        Ok(PebCondition::Ok)
    }
}

pub static MTD_OPS: MtdOps = MtdOps;
pub static BDEV_OPS: BdevOps = BdevOps;
pub static ZNS_OPS: ZnsOps = ZnsOps;

/// Tool environment: the opened device, its geometry and verbosity switches.
pub struct Environment {
    pub show_info: bool,
    pub show_debug: bool,

    /// Size in bytes of the selected partition.
    pub fs_size: u64,
    /// PEB size in bytes.
    pub erase_size: u32,
    /// Number of open/active zones.
    pub open_zones: u32,
    /// Logical block size in bytes.
    pub page_size: u32,

    pub device_type: DeviceType,
    pub dev_name: String,
    pub file: Option<File>,
    pub ops: &'static dyn DeviceOps,
}

impl Environment {
    pub fn new() -> Self {
        Environment {
            show_info: true,
            show_debug: false,
            fs_size: 0,
            erase_size: crate::SIZE_8MB as u32,
            open_zones: 0,
            page_size: crate::SIZE_4KB as u32,
            device_type: DeviceType::Block,
            dev_name: String::new(),
            file: None,
            ops: &BDEV_OPS,
        }
    }

    pub fn device(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| Error::internal("device is not opened"))
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

/// Tells whether the opened block device is zoned.
pub fn is_zoned_device(file: &File) -> bool {
    let mut sectors_per_zone: u32 = 0;

    let res = unsafe { ioctl(file.as_raw_fd(), BLKGETZONESZ, &mut sectors_per_zone) };
    res >= 0 && sectors_per_zone != 0
}

/// Opens the target and selects the matching operations set by examining the
/// file type (and, for block devices, the zone size).
pub fn open_device(env: &mut Environment) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&env.dev_name)
        .map_err(|err| {
            mkfs_err!("unable to open {}: {err}", env.dev_name);
            Error::Io(err)
        })?;

    let metadata = file.metadata()?;
    let file_type = metadata.file_type();

    if file_type.is_char_device() {
        let major = ((metadata.rdev() >> 8) & 0xFFF) as u32;
        if major != MTD_MAJOR_DEV {
            return Err(Error::device(format!(
                "non-mtd character device number {major}"
            )));
        }

        let mut info: MtdInfoUser = unsafe { std::mem::zeroed() };
        if unsafe { ioctl(file.as_raw_fd(), MEMGETINFO, &mut info) } < 0 {
            let err = io::Error::last_os_error();
            mkfs_err!("mtd ioctl failed for {}: {err}", env.dev_name);
            return Err(err.into());
        }

        if !(info.erasesize as u64).is_power_of_two() {
            return Err(Error::invalid("erasesize must be a power of 2"));
        }
        if !(info.writesize as u64).is_power_of_two() {
            return Err(Error::invalid("writesize must be a power of 2"));
        }

        env.erase_size = info.erasesize;
        env.fs_size = info.size as u64;
        env.ops = &MTD_OPS;
        env.device_type = DeviceType::Mtd;
    } else if file_type.is_file() {
        env.fs_size = metadata.len();
        env.ops = &BDEV_OPS;
        env.device_type = DeviceType::Block;
    } else if file_type.is_block_device() {
        let mut size: u64 = 0;
        if unsafe { ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) } < 0 {
            let err = io::Error::last_os_error();
            mkfs_err!("block ioctl failed for {}: {err}", env.dev_name);
            return Err(err.into());
        }
        env.fs_size = size;

        if is_zoned_device(&file) {
            env.ops = &ZNS_OPS;
            env.device_type = DeviceType::Zoned;
        } else {
            env.ops = &BDEV_OPS;
            env.device_type = DeviceType::Block;
        }
    } else {
        return Err(Error::device(format!("device {} has invalid type", env.dev_name)));
    }

    env.file = Some(file);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;
    use std::io::Seek;
    use std::io::SeekFrom;
    use std::io::Write;

    fn scratch_file(name: &str, len: u64) -> (std::path::PathBuf, File) {
        let path = std::env::temp_dir().join(format!("emberfs-{}-{name}", std::process::id()));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.seek(SeekFrom::Start(len - 1)).unwrap();
        file.write_all(&[0]).unwrap();
        (path, file)
    }

    #[test]
    fn pwrite_pread_round_trip() {
        let (path, file) = scratch_file("rw", 8192);

        device_pwrite(&file, 4096, b"emberfs log").unwrap();

        let mut back = [0u8; 11];
        device_pread(&file, 4096, &mut back).unwrap();
        assert_eq!(&back, b"emberfs log");

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn bdev_erase_falls_back_to_writes() {
        let (path, mut file) = scratch_file("erase", 8192);

        device_pwrite(&file, 0, &[0xAAu8; 8192]).unwrap();

        let fill = [0xFFu8; 4096];
        BDEV_OPS.erase(&file, 0, 8192, &fill, false).unwrap();

        let mut back = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut back).unwrap();
        assert!(back.iter().all(|b| *b == 0xFF));

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn open_device_detects_a_regular_image() {
        let (path, _file) = scratch_file("open", 1 << 20);

        let mut env = Environment::new();
        env.dev_name = path.to_string_lossy().into_owned();
        open_device(&mut env).unwrap();

        assert_eq!(env.device_type, DeviceType::Block);
        assert_eq!(env.fs_size, 1 << 20);
        assert!(env.file.is_some());

        std::fs::remove_file(path).unwrap();
    }
}
