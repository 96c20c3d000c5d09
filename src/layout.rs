//! Planner state of the volume under creation and the driver running every
//! metadata subsystem through the five creation phases in lock-step.

use crate::compression::CompressionType;
use crate::device::DeviceType;
use crate::device::Environment;
use crate::device::GeometryStatus;
use crate::device::NandGeometry;
use crate::error::{Error, Result};
use crate::maptbl;
use crate::mkfs_dbg;
use crate::mkfs_err;
use crate::mkfs_warn;
use crate::ondisk;
use crate::ondisk::VolumeHeader;
use crate::ondisk::VolumeState;
use crate::segbmap;
use crate::snapshot;
use crate::superblock;
use crate::verify_internal;
use std::mem;

/// Extent slots of one PEB's log, in placement order.
pub const SEG_HEADER: usize = 0;
pub const BLOCK_BITMAP: usize = 1;
pub const OFFSET_TABLE: usize = 2;
pub const BLOCK_DESCRIPTORS: usize = 3;
pub const MAPTBL_CACHE: usize = 4;
pub const LOG_PAYLOAD: usize = 5;
pub const LOG_FOOTER: usize = 6;
pub const BLOCK_BITMAP_BACKUP: usize = 7;
pub const OFFSET_TABLE_BACKUP: usize = 8;
pub const SEG_LOG_ITEMS_COUNT: usize = 9;

/// Segment allocation classes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentPolicy {
    Dedicated,
    Shared,
}

/// Metadata subsystems in driver order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetaIndex {
    InitialSnapshot = 0,
    Superblock = 1,
    SegmentBitmap = 2,
    MappingTable = 3,
    UserData = 4,
}

pub const META_ITEMS_COUNT: usize = 5;

pub const META_INDEXES: [MetaIndex; META_ITEMS_COUNT] = [
    MetaIndex::InitialSnapshot,
    MetaIndex::Superblock,
    MetaIndex::SegmentBitmap,
    MetaIndex::MappingTable,
    MetaIndex::UserData,
];

/// Maps a subsystem to the segment type stamped into its logs.
pub fn meta2seg_type(index: MetaIndex) -> u16 {
    match index {
        MetaIndex::InitialSnapshot => ondisk::INITIAL_SNAPSHOT_SEG_TYPE,
        MetaIndex::Superblock => ondisk::SB_SEG_TYPE,
        MetaIndex::SegmentBitmap => ondisk::SEGBMAP_SEG_TYPE,
        MetaIndex::MappingTable => ondisk::MAPTBL_SEG_TYPE,
        MetaIndex::UserData => ondisk::USER_DATA_SEG_TYPE,
    }
}

/// Maps a segment type to the PEB type recorded in the mapping table.
pub fn seg2peb_type(seg_type: u16) -> u8 {
    match seg_type {
        ondisk::SB_SEG_TYPE => ondisk::MAPTBL_SBSEG_PEB_TYPE,
        ondisk::INITIAL_SNAPSHOT_SEG_TYPE => ondisk::MAPTBL_INIT_SNAP_PEB_TYPE,
        ondisk::SEGBMAP_SEG_TYPE => ondisk::MAPTBL_SEGBMAP_PEB_TYPE,
        ondisk::MAPTBL_SEG_TYPE => ondisk::MAPTBL_MAPTBL_PEB_TYPE,
        ondisk::LEAF_NODE_SEG_TYPE => ondisk::MAPTBL_LNODE_PEB_TYPE,
        ondisk::HYBRID_NODE_SEG_TYPE => ondisk::MAPTBL_HNODE_PEB_TYPE,
        ondisk::INDEX_NODE_SEG_TYPE => ondisk::MAPTBL_IDXNODE_PEB_TYPE,
        ondisk::USER_DATA_SEG_TYPE => ondisk::MAPTBL_DATA_PEB_TYPE,
        _ => ondisk::MAPTBL_UNKNOWN_PEB_TYPE,
    }
}

/// Segments each subsystem asks for when it has no allocation policy hook.
pub const DEFAULT_ALLOC_SEGS_COUNT: usize = 1;

/// Metadata may take at most half of the volume's segments.
pub fn metadata_quota_max(segs_count: u64) -> u64 {
    segs_count / 2
}

/// Clamp applied to a derived full-log size before the alignment step.
pub const LOG_MAX_PAGES: u32 = 2048;
/// Default count of full logs inside one PEB.
pub const LOGS_PER_PEB_DEFAULT: u32 = 4;
/// Same default for user data segments.
pub const DATA_LOGS_PER_PEB_DEFAULT: u32 = 4;

pub const NAND_DIES_DEFAULT: u32 = 4;
pub const SEGBMAP_SEGS_PER_CHAIN_DEFAULT: u16 = 1;
pub const SEGBMAP_FRAG_PER_PEB_DEFAULT: u16 = 32;
pub const MAPTBL_STRIPES_PER_PORTION_DEFAULT: u16 = 2;
pub const MAPTBL_PORTIONS_PER_FRAGMENT_DEFAULT: u16 = 32;
pub const MAPTBL_RESERVED_PEBS_DEFAULT: u16 = 20;
pub const PEB_RECOVER_MONTHS_DEFAULT: u8 = 3;

/// One extent of a PEB's log: the prepared bytes and their placement.
#[derive(Default)]
pub struct ExtentDesc {
    pub buf: Option<Vec<u8>>,
    /// Offset from the PEB's beginning in bytes.
    pub offset: u32,
    pub bytes_count: u32,
}

/// Content of one PEB's log.
pub struct PebContent {
    pub leb_id: u64,
    pub peb_id: u64,
    pub extents: [ExtentDesc; SEG_LOG_ITEMS_COUNT],
}

impl PebContent {
    pub fn new() -> Self {
        PebContent {
            leb_id: u64::MAX,
            peb_id: u64::MAX,
            extents: Default::default(),
        }
    }
}

impl Default for PebContent {
    fn default() -> Self {
        Self::new()
    }
}

/// Description of one prepared segment.
pub struct SegmentDesc {
    pub seg_type: Option<MetaIndex>,
    pub seg_state: Option<SegmentPolicy>,
    pub seg_id: u64,
    pub pebs: Vec<PebContent>,
    /// Count of PEBs that actually carry a log.
    pub pebs_count: u16,
}

impl SegmentDesc {
    pub fn pebs_capacity(&self) -> u16 {
        self.pebs.len() as u16
    }
}

/// Reservation record of one metadata subsystem.
#[derive(Clone, Copy, Default)]
pub struct MetadataSegRequest {
    pub start_seg_index: Option<usize>,
    pub segs_count: usize,
    pub seg_state: Option<SegmentPolicy>,
}

/// Superblock creation state.
pub struct SuperblockLayout {
    pub log_pages: u16,
    pub vh: VolumeHeader,
    pub vs: VolumeState,
}

/// Block bitmap creation options.
pub struct BlkBmapLayout {
    pub has_backup_copy: bool,
    pub compression: CompressionType,
}

/// Offset translation table creation options.
pub struct Blk2OffLayout {
    pub has_backup_copy: bool,
    pub compression: CompressionType,
    pub pages_per_seg: u32,
}

/// Segment bitmap creation state.
pub struct SegbmapLayout {
    pub has_backup_copy: bool,
    pub segs_per_chain: u16,
    pub fragments_per_peb: u16,
    pub pebs_per_seg: u16,
    pub log_pages: u16,
    pub migration_threshold: u16,
    pub compression: CompressionType,

    pub fragments_count: u32,
    pub fragment_size: u32,
    pub bmap_bytes: u32,
    /// One buffer per segbmap PEB; handed over to the payload extents.
    pub fragments_array: Vec<Option<Vec<u8>>>,
}

/// PEB mapping table creation state.
pub struct MaptblLayout {
    pub has_backup_copy: bool,
    pub stripes_per_portion: u16,
    pub portions_per_fragment: u16,
    /// Set when the user picked the portions count explicitly; an impossible
    /// explicit value is rejected instead of corrected.
    pub portions_per_fragment_explicit: bool,
    pub log_pages: u16,
    pub migration_threshold: u16,
    pub reserved_pebs_per_fragment: u16,
    pub compression: CompressionType,

    pub maptbl_pebs: u32,
    pub lebtbl_portion_bytes: u32,
    pub lebtbl_portion_mempages: u16,
    pub pebtbl_portion_bytes: u32,
    pub pebtbl_portion_mempages: u16,
    pub lebs_per_portion: u16,
    pub pebs_per_portion: u16,
    pub portions_count: u32,
    pub portion_size: u32,
    pub pre_erased_pebs: u64,
    /// One buffer per mapping table PEB; handed over to the payload extents.
    pub fragments_array: Vec<Option<Vec<u8>>>,
}

/// PEB mapping table cache creation state.
pub struct MaptblCacheLayout {
    pub fragments_count: u32,
    pub fragment_size: u32,
    pub fragments_array: Vec<Option<Vec<u8>>>,
}

impl MaptblCacheLayout {
    /// Total bytes the cache occupies inside the superblock log.
    pub fn bytes_count(&self) -> u32 {
        let mut bytes = 0u32;
        for fragment in self.fragments_array.iter().flatten() {
            let hdr: &ondisk::MaptblCacheHeader = ondisk::cast(fragment, 0);
            bytes += u16::from(hdr.bytes_count) as u32;
        }
        bytes
    }
}

/// Btree creation options.
pub struct BtreeLayout {
    pub node_size: u32,
    pub min_index_area_size: u16,
    pub lnode_log_pages: u16,
    pub hnode_log_pages: u16,
    pub inode_log_pages: u16,
}

/// User data segment creation options.
pub struct UserDataLayout {
    pub log_pages: u16,
    pub migration_threshold: u16,
    pub compression: CompressionType,
}

/// Description of the created volume layout: all creation options, the
/// per-subsystem planner state and the prepared segments.
pub struct VolumeLayout {
    pub force_overwrite: bool,
    pub need_erase_device: bool,

    pub seg_size: u64,
    pub page_size: u32,
    pub nand_dies_count: u32,
    pub volume_label: [u8; ondisk::VOLUME_LABEL_MAX],
    pub create_timestamp: u64,
    pub create_cno: u64,
    pub migration_threshold: u16,
    pub compression: CompressionType,
    pub inode_size: u16,
    pub lebs_per_peb_index: u32,

    pub sb: SuperblockLayout,
    pub blkbmap: BlkBmapLayout,
    pub blk2off_tbl: Blk2OffLayout,
    pub segbmap: SegbmapLayout,
    pub maptbl: MaptblLayout,
    pub maptbl_cache: MaptblCacheLayout,
    pub btree: BtreeLayout,
    pub user_data_seg: UserDataLayout,

    pub meta_array: [MetadataSegRequest; META_ITEMS_COUNT],

    pub segs: Vec<SegmentDesc>,
    pub last_allocated_seg_index: Option<usize>,
    pub segs_count: usize,
    pub calculated_open_zones: u32,

    pub env: Environment,
    pub is_volume_erased: bool,
}

impl VolumeLayout {
    pub fn new() -> Self {
        VolumeLayout {
            force_overwrite: false,
            need_erase_device: true,
            seg_size: crate::SIZE_8MB,
            page_size: crate::SIZE_4KB as u32,
            nand_dies_count: NAND_DIES_DEFAULT,
            volume_label: [0; ondisk::VOLUME_LABEL_MAX],
            create_timestamp: 0,
            create_cno: 0,
            migration_threshold: u16::MAX,
            compression: CompressionType::Zlib,
            inode_size: mem::size_of::<ondisk::Inode>() as u16,
            lebs_per_peb_index: ondisk::LEBS_PER_PEB_INDEX_DEFAULT,
            sb: SuperblockLayout {
                log_pages: u16::MAX,
                vh: unsafe { mem::zeroed() },
                vs: unsafe { mem::zeroed() },
            },
            blkbmap: BlkBmapLayout {
                has_backup_copy: false,
                compression: CompressionType::Unknown,
            },
            blk2off_tbl: Blk2OffLayout {
                has_backup_copy: false,
                compression: CompressionType::Unknown,
                pages_per_seg: u32::MAX,
            },
            segbmap: SegbmapLayout {
                has_backup_copy: false,
                segs_per_chain: SEGBMAP_SEGS_PER_CHAIN_DEFAULT,
                fragments_per_peb: SEGBMAP_FRAG_PER_PEB_DEFAULT,
                pebs_per_seg: 0,
                log_pages: u16::MAX,
                migration_threshold: u16::MAX,
                compression: CompressionType::Unknown,
                fragments_count: 0,
                fragment_size: crate::MEM_PAGE_SIZE,
                bmap_bytes: 0,
                fragments_array: Vec::new(),
            },
            maptbl: MaptblLayout {
                has_backup_copy: false,
                stripes_per_portion: MAPTBL_STRIPES_PER_PORTION_DEFAULT,
                portions_per_fragment: MAPTBL_PORTIONS_PER_FRAGMENT_DEFAULT,
                portions_per_fragment_explicit: false,
                log_pages: u16::MAX,
                migration_threshold: u16::MAX,
                reserved_pebs_per_fragment: u16::MAX,
                compression: CompressionType::Unknown,
                maptbl_pebs: 0,
                lebtbl_portion_bytes: 0,
                lebtbl_portion_mempages: 0,
                pebtbl_portion_bytes: 0,
                pebtbl_portion_mempages: 0,
                lebs_per_portion: 0,
                pebs_per_portion: 0,
                portions_count: 0,
                portion_size: 0,
                pre_erased_pebs: 0,
                fragments_array: Vec::new(),
            },
            maptbl_cache: MaptblCacheLayout {
                fragments_count: 0,
                fragment_size: crate::MEM_PAGE_SIZE,
                fragments_array: Vec::new(),
            },
            btree: BtreeLayout {
                node_size: crate::SIZE_8KB as u32,
                min_index_area_size: 0,
                lnode_log_pages: u16::MAX,
                hnode_log_pages: u16::MAX,
                inode_log_pages: u16::MAX,
            },
            user_data_seg: UserDataLayout {
                log_pages: u16::MAX,
                migration_threshold: u16::MAX,
                compression: CompressionType::Unknown,
            },
            meta_array: [MetadataSegRequest::default(); META_ITEMS_COUNT],
            segs: Vec::new(),
            last_allocated_seg_index: None,
            segs_count: 0,
            calculated_open_zones: 0,
            env: Environment::new(),
            is_volume_erased: false,
        }
    }

    pub fn pebs_per_seg(&self) -> u32 {
        (self.seg_size / self.env.erase_size as u64) as u32
    }

    pub fn pages_per_peb(&self) -> u32 {
        self.env.erase_size / self.page_size
    }

    pub fn fs_segs_count(&self) -> u64 {
        self.env.fs_size / self.seg_size
    }

    pub fn pebs_per_volume(&self) -> u64 {
        self.env.fs_size / self.env.erase_size as u64
    }
}

impl Default for VolumeLayout {
    fn default() -> Self {
        Self::new()
    }
}

/// Phases of creating the volume's metadata. Phase N completes for every
/// subsystem before phase N+1 begins, so later subsystems see the fully
/// reserved segment list of the earlier ones.
pub trait MetadataOps {
    /// Returns the allocation class and the count of requested segments, or
    /// `None` when the subsystem consumes no segments of its own.
    fn allocation_policy(&self, _layout: &mut VolumeLayout) -> Result<Option<(SegmentPolicy, usize)>> {
        Ok(None)
    }

    fn prepare(&self, _layout: &mut VolumeLayout) -> Result<()> {
        Ok(())
    }

    fn validate(&self, _layout: &mut VolumeLayout) -> Result<()> {
        Ok(())
    }

    fn define_layout(&self, _layout: &mut VolumeLayout) -> Result<()> {
        Ok(())
    }

    fn commit(&self, _layout: &mut VolumeLayout) -> Result<()> {
        Ok(())
    }
}

/// User data carries no segments in a fresh image; the phases only feed the
/// superblock's user data options.
struct UserDataOps;

impl MetadataOps for UserDataOps {
    fn validate(&self, layout: &mut VolumeLayout) -> Result<()> {
        let pebs_per_seg = layout.pebs_per_seg();

        if layout.user_data_seg.migration_threshold == u16::MAX {
            layout.user_data_seg.migration_threshold = layout.migration_threshold;
        } else if layout.user_data_seg.migration_threshold as u32 > pebs_per_seg {
            mkfs_warn!(
                "user data migration threshold {} was corrected to {}",
                layout.user_data_seg.migration_threshold,
                pebs_per_seg
            );
            layout.user_data_seg.migration_threshold = pebs_per_seg as u16;
        }

        Ok(())
    }

    fn define_layout(&self, layout: &mut VolumeLayout) -> Result<()> {
        let pages_per_peb = layout.pages_per_peb();
        let mut log_pages = layout.user_data_seg.log_pages as u32;

        if log_pages == u16::MAX as u32 {
            log_pages = pages_per_peb / DATA_LOGS_PER_PEB_DEFAULT;
            log_pages = log_pages.clamp(1, LOG_MAX_PAGES);
        }

        if log_pages > pages_per_peb {
            mkfs_warn!(
                "invalid user data segment option: log_pages {} will be changed on pages_per_peb {}",
                log_pages,
                pages_per_peb
            );
            log_pages = pages_per_peb.min(LOG_MAX_PAGES);
        }

        if pages_per_peb % log_pages != 0 {
            let corrected = 1u32 << (31 - log_pages.leading_zeros());

            verify_internal!(
                pages_per_peb % corrected == 0,
                "pages_per_peb {} is not divisible by corrected log_pages {}",
                pages_per_peb,
                corrected
            );
            mkfs_warn!(
                "invalid user data segment option: log_pages {} will be changed on corrected value {}",
                log_pages,
                corrected
            );
            log_pages = corrected.min(LOG_MAX_PAGES);
        }

        layout.user_data_seg.log_pages = log_pages as u16;
        layout.sb.vh.user_data_log_pages = (log_pages as u16).into();

        superblock::prepare_user_data_options(layout)
    }
}

static USER_DATA_OPS: UserDataOps = UserDataOps;

/// The creation operations of one subsystem.
pub fn metadata_ops(index: MetaIndex) -> &'static dyn MetadataOps {
    match index {
        MetaIndex::InitialSnapshot => &snapshot::SNAPSHOT_OPS,
        MetaIndex::Superblock => &superblock::SUPERBLOCK_OPS,
        MetaIndex::SegmentBitmap => &segbmap::SEGBMAP_OPS,
        MetaIndex::MappingTable => &maptbl::MAPTBL_OPS,
        MetaIndex::UserData => &USER_DATA_OPS,
    }
}

/// Checks the key creation options, corrects the geometry on zoned devices
/// and derives the dependent defaults.
pub fn validate_key_creation_options(layout: &mut VolumeLayout) -> Result<()> {
    let fs_size = layout.env.fs_size;
    let mut seg_size = layout.seg_size;
    let mut erase_size = layout.env.erase_size;
    let page_size = layout.page_size;

    mkfs_dbg!(
        layout.env.show_debug,
        "BEFORE_CHECK: fs_size {fs_size}, seg_size {seg_size}, erase_size {erase_size}, page_size {page_size}"
    );

    if !(page_size as u64).is_power_of_two() {
        mkfs_err!("page size {page_size} is not a power of two");
        return Err(Error::invalid("page size is not a power of two"));
    }

    if page_size >= erase_size {
        mkfs_err!("page size {page_size} can't be equal/greater than erase size {erase_size}");
        return Err(Error::invalid("page size >= erase size"));
    }

    if erase_size % page_size != 0 {
        mkfs_err!("erase size {erase_size} should be aligned on page size {page_size}");
        return Err(Error::invalid("erase size is not aligned on page size"));
    }

    if seg_size < erase_size as u64 {
        mkfs_err!("segment size {seg_size} can't be lesser than erase size {erase_size}");
        return Err(Error::invalid("segment size < erase size"));
    }

    if seg_size % erase_size as u64 != 0 {
        mkfs_err!("segment size {seg_size} should be aligned on erase size {erase_size}");
        return Err(Error::invalid("segment size is not aligned on erase size"));
    }

    if layout.env.device_type != DeviceType::Zoned
        && (!seg_size.is_power_of_two() || !(erase_size as u64).is_power_of_two())
    {
        mkfs_err!("segment size {seg_size} and erase size {erase_size} must be powers of two");
        return Err(Error::invalid("segment/erase size is not a power of two"));
    }

    if fs_size <= seg_size {
        mkfs_err!("fs size {fs_size} can't be equal/lesser than segment size {seg_size}");
        return Err(Error::invalid("volume is not larger than one segment"));
    }

    if layout.env.device_type == DeviceType::Zoned {
        let mut info = NandGeometry {
            erasesize: layout.env.erase_size,
            writesize: layout.page_size,
        };

        let file = layout.env.device()?;
        let status = layout
            .env
            .ops
            .check_nand_geometry(file, &mut info, layout.env.show_debug)?;

        if status == GeometryStatus::Corrected {
            layout.env.erase_size = info.erasesize;
            layout.page_size = info.writesize;
            crate::mkfs_info!(
                layout.env.show_info,
                "NAND geometry corrected: erase_size {}, write_size {}",
                info.erasesize,
                info.writesize
            );
            erase_size = info.erasesize;
        }

        // One zone per segment.
        if seg_size != erase_size as u64 {
            layout.seg_size = erase_size as u64;
            crate::mkfs_info!(
                layout.env.show_info,
                "segment size corrected: seg_size {}, erase_size {}",
                layout.seg_size,
                erase_size
            );
            seg_size = layout.seg_size;
        }
    }

    let segs_count = fs_size / seg_size;
    layout.env.fs_size = segs_count * seg_size;

    if layout.env.fs_size != fs_size && layout.env.show_info {
        mkfs_warn!(
            "device size {} was corrected to fs size {} because of segment size {}",
            fs_size,
            layout.env.fs_size,
            seg_size
        );
    }

    let pebs_per_seg = (seg_size / erase_size as u64) as u32;

    if layout.migration_threshold == u16::MAX {
        layout.migration_threshold = pebs_per_seg.min(u16::MAX as u32 - 1) as u16;
    } else if layout.migration_threshold as u32 > pebs_per_seg {
        mkfs_warn!(
            "migration threshold {} was corrected to {}",
            layout.migration_threshold,
            pebs_per_seg
        );
        layout.migration_threshold = pebs_per_seg as u16;
    }

    let pages_per_seg = seg_size / layout.page_size as u64;
    if pages_per_seg >= u32::MAX as u64 {
        mkfs_err!("pages_per_seg {pages_per_seg} is too huge");
        return Err(Error::invalid("too many pages per segment"));
    }
    layout.blk2off_tbl.pages_per_seg = pages_per_seg as u32;

    if layout.blkbmap.compression == CompressionType::Unknown {
        layout.blkbmap.compression = layout.compression;
    }
    if layout.blk2off_tbl.compression == CompressionType::Unknown {
        layout.blk2off_tbl.compression = layout.compression;
    }
    if layout.segbmap.compression == CompressionType::Unknown {
        layout.segbmap.compression = layout.compression;
    }
    if layout.maptbl.compression == CompressionType::Unknown {
        layout.maptbl.compression = layout.compression;
    }
    if layout.user_data_seg.compression == CompressionType::Unknown {
        layout.user_data_seg.compression = layout.compression;
    }

    mkfs_dbg!(layout.env.show_debug, "AFTER_CHECK: fs_size {}", layout.env.fs_size);

    Ok(())
}

/// Collects every subsystem's allocation policy and sizes the segments array.
pub fn alloc_segs_array(layout: &mut VolumeLayout) -> Result<()> {
    let mut dedicated = 0usize;
    let mut shared = 0usize;

    verify_internal!(layout.segs.is_empty(), "segments array is allocated twice");

    layout.last_allocated_seg_index = None;
    layout.segs_count = 0;

    for index in META_INDEXES {
        if index == MetaIndex::UserData {
            continue;
        }

        layout.meta_array[index as usize] = MetadataSegRequest::default();

        match metadata_ops(index).allocation_policy(layout)? {
            Some((SegmentPolicy::Dedicated, count)) => {
                if count < 1 {
                    return Err(Error::invalid(format!("invalid segments count {count}")));
                }
                dedicated += count;
            }
            Some((SegmentPolicy::Shared, count)) => {
                if count < 1 {
                    return Err(Error::invalid(format!("invalid segments count {count}")));
                }
                shared = shared.max(count);
            }
            None => dedicated += DEFAULT_ALLOC_SEGS_COUNT,
        }
    }

    let segs_capacity = dedicated + shared;

    let fs_segs_count = layout.fs_segs_count();
    let quota = metadata_quota_max(fs_segs_count);

    if segs_capacity as u64 > quota {
        mkfs_err!(
            "partition too small: fs_segs_count {fs_segs_count}, metadata quota {quota}, metadata_segs_count {segs_capacity}"
        );
        return Err(Error::no_space("partition too small for metadata"));
    }

    let pebs_per_seg = layout.pebs_per_seg();

    layout.segs.reserve(segs_capacity);
    for _ in 0..segs_capacity {
        let mut pebs = Vec::with_capacity(pebs_per_seg as usize);
        for _ in 0..pebs_per_seg {
            pebs.push(PebContent::new());
        }

        layout.segs.push(SegmentDesc {
            seg_type: None,
            seg_state: None,
            seg_id: u64::MAX,
            pebs,
            pebs_count: 0,
        });
    }

    mkfs_dbg!(layout.env.show_debug, "ALLOCATED: segs_capacity {segs_capacity}");

    Ok(())
}

/// Marks a run of segments in the array as owned by one subsystem.
pub fn reserve_segments(layout: &mut VolumeLayout, meta_index: MetaIndex) -> Result<()> {
    let request = layout.meta_array[meta_index as usize];

    if request.segs_count == 0 {
        mkfs_warn!("subsystem {:?} reserves no segments", meta_index);
        return Ok(());
    }

    let index = match layout.last_allocated_seg_index {
        Some(last) => last + 1,
        None => 0,
    };

    if index + request.segs_count > layout.segs.len() {
        mkfs_err!(
            "start_seg_index {} + segs_count {} is above segs_capacity {}",
            index,
            request.segs_count,
            layout.segs.len()
        );
        return Err(Error::no_space("segments array exhausted"));
    }

    layout.meta_array[meta_index as usize].start_seg_index = Some(index);

    for i in 0..request.segs_count {
        layout.segs[index + i].seg_type = Some(meta_index);
        layout.segs[index + i].seg_state = request.seg_state;
        layout.last_allocated_seg_index = Some(index + i);
    }

    mkfs_dbg!(
        layout.env.show_debug,
        "meta_index {:?}, start_seg_index {}, segs_count {}",
        meta_index,
        index,
        request.segs_count
    );

    Ok(())
}

fn dump_layout_state(layout: &VolumeLayout) {
    if !layout.env.show_debug {
        return;
    }

    for seg in &layout.segs {
        mkfs_dbg!(
            true,
            "seg_type {:?}, seg_state {:?}, seg_id {}, pebs_count {}, pebs_capacity {}",
            seg.seg_type,
            seg.seg_state,
            seg.seg_id,
            seg.pebs_count,
            seg.pebs_capacity()
        );

        for peb in &seg.pebs {
            mkfs_dbg!(true, "leb_id {}, peb_id {}", peb.leb_id, peb.peb_id);

            for (index, extent) in peb.extents.iter().enumerate() {
                mkfs_dbg!(
                    true,
                    "index {}, offset {}, bytes_count {}, prepared {}",
                    index,
                    extent.offset,
                    extent.bytes_count,
                    extent.buf.is_some()
                );
            }
        }
    }
}

/// Runs `prepare`, `validate`, `define_layout` and `commit` across every
/// subsystem, one phase at a time.
pub fn mkfs_create(layout: &mut VolumeLayout) -> Result<()> {
    for index in META_INDEXES {
        metadata_ops(index).prepare(layout)?;
    }
    dump_layout_state(layout);

    for index in META_INDEXES {
        metadata_ops(index).validate(layout)?;
    }
    dump_layout_state(layout);

    for index in META_INDEXES {
        metadata_ops(index).define_layout(layout)?;
    }
    dump_layout_state(layout);

    for index in META_INDEXES {
        metadata_ops(index).commit(layout)?;
    }
    dump_layout_state(layout);

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seg_and_peb_type_mapping() {
        assert_eq!(meta2seg_type(MetaIndex::Superblock), ondisk::SB_SEG_TYPE);
        assert_eq!(meta2seg_type(MetaIndex::MappingTable), ondisk::MAPTBL_SEG_TYPE);
        assert_eq!(
            seg2peb_type(ondisk::SEGBMAP_SEG_TYPE),
            ondisk::MAPTBL_SEGBMAP_PEB_TYPE
        );
        assert_eq!(
            seg2peb_type(ondisk::USER_DATA_SEG_TYPE),
            ondisk::MAPTBL_DATA_PEB_TYPE
        );
    }

    #[test]
    fn geometry_validation_rejects_broken_options() {
        let mut layout = VolumeLayout::new();
        layout.env.fs_size = crate::SIZE_1GB;
        layout.page_size = crate::SIZE_8MB as u32;
        layout.env.erase_size = crate::SIZE_8MB as u32;
        assert!(validate_key_creation_options(&mut layout).is_err());

        let mut layout = VolumeLayout::new();
        layout.env.fs_size = crate::SIZE_8MB; // equal to one segment
        assert!(validate_key_creation_options(&mut layout).is_err());

        let mut layout = VolumeLayout::new();
        layout.env.fs_size = crate::SIZE_1GB;
        layout.seg_size = crate::SIZE_2MB;
        layout.env.erase_size = crate::SIZE_8MB as u32;
        assert!(validate_key_creation_options(&mut layout).is_err());
    }

    #[test]
    fn geometry_validation_derives_defaults() {
        let mut layout = VolumeLayout::new();
        layout.env.fs_size = crate::SIZE_1GB + crate::SIZE_2MB;
        layout.env.show_info = false;

        validate_key_creation_options(&mut layout).unwrap();

        // The trailing partial segment is cut off.
        assert_eq!(layout.env.fs_size, crate::SIZE_1GB);
        assert_eq!(layout.migration_threshold, 1);
        assert_eq!(layout.blk2off_tbl.pages_per_seg, 2048);
        assert_eq!(layout.blkbmap.compression, CompressionType::Zlib);
        assert_eq!(layout.segbmap.compression, CompressionType::Zlib);
    }

    #[test]
    fn reservation_walks_the_array_densely() {
        let mut layout = VolumeLayout::new();
        layout.env.fs_size = crate::SIZE_1GB;

        for _ in 0..4 {
            let mut pebs = Vec::new();
            pebs.push(PebContent::new());
            layout.segs.push(SegmentDesc {
                seg_type: None,
                seg_state: None,
                seg_id: u64::MAX,
                pebs,
                pebs_count: 0,
            });
        }

        layout.meta_array[MetaIndex::InitialSnapshot as usize] = MetadataSegRequest {
            start_seg_index: None,
            segs_count: 1,
            seg_state: Some(SegmentPolicy::Dedicated),
        };
        layout.meta_array[MetaIndex::Superblock as usize] = MetadataSegRequest {
            start_seg_index: None,
            segs_count: 3,
            seg_state: Some(SegmentPolicy::Dedicated),
        };

        reserve_segments(&mut layout, MetaIndex::InitialSnapshot).unwrap();
        reserve_segments(&mut layout, MetaIndex::Superblock).unwrap();

        assert_eq!(
            layout.meta_array[MetaIndex::InitialSnapshot as usize].start_seg_index,
            Some(0)
        );
        assert_eq!(
            layout.meta_array[MetaIndex::Superblock as usize].start_seg_index,
            Some(1)
        );
        assert_eq!(layout.segs[0].seg_type, Some(MetaIndex::InitialSnapshot));
        assert_eq!(layout.segs[3].seg_type, Some(MetaIndex::Superblock));
        assert_eq!(layout.last_allocated_seg_index, Some(3));

        // A fifth segment does not exist.
        layout.meta_array[MetaIndex::SegmentBitmap as usize] = MetadataSegRequest {
            start_seg_index: None,
            segs_count: 1,
            seg_state: Some(SegmentPolicy::Dedicated),
        };
        assert!(reserve_segments(&mut layout, MetaIndex::SegmentBitmap).is_err());
    }
}
