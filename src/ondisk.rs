//! On-disk structures of the emberfs format.
//!
//! Every record here is a tightly packed little-endian structure whose byte
//! layout is the authoritative contract with the filesystem driver. Multi-byte
//! fields are declared with the `simple_endian` wrappers so a value can only
//! cross the record boundary through an explicit conversion; reserved byte
//! positions are spelled out and must stay zero.

use simple_endian::{u16le, u32le, u64le};
use std::mem;
use std::slice;

/// Common magic signature ("EmbF").
pub const SUPER_MAGIC: u32 = 0x456D6246;

/* Two-byte key magics of the concrete record types. */
pub const SEGMENT_HDR_MAGIC: u16 = 0x5348; /* SH */
pub const LOG_FOOTER_MAGIC: u16 = 0x4C46; /* LF */
pub const PARTIAL_LOG_HDR_MAGIC: u16 = 0x5048; /* PH */
pub const BLK_BMAP_MAGIC: u16 = 0x424D; /* BM */
pub const BLK2OFF_TABLE_HDR_MAGIC: u16 = 0x5474; /* Tt */
pub const SEGBMAP_HDR_MAGIC: u16 = 0x534D; /* SM */
pub const INODE_MAGIC: u16 = 0x6469; /* di */
pub const PEB_TABLE_MAGIC: u16 = 0x5074; /* Pt */
pub const LEB_TABLE_MAGIC: u16 = 0x4C74; /* Lt */
pub const MAPTBL_CACHE_MAGIC: u16 = 0x4D63; /* Mc */
pub const FRAGMENT_DESC_MAGIC: u8 = 0x66; /* f */
pub const CHAIN_HDR_MAGIC: u8 = 0x63; /* c */
pub const PHYS_OFF_TABLE_MAGIC: u32 = 0x504F5448; /* POTH */
pub const MAPTBL_CACHE_PEB_STATE_MAGIC: u32 = 0x4D635053; /* McPS */

pub const INODES_BTREE_MAGIC: u32 = 0x496E4274; /* InBt */
pub const DENTRIES_BTREE_MAGIC: u32 = 0x44654274; /* DeBt */
pub const EXTENTS_BTREE_MAGIC: u32 = 0x45784274; /* ExBt */
pub const SHARED_EXTENTS_BTREE_MAGIC: u32 = 0x53454274; /* SEBt */
pub const XATTR_BTREE_MAGIC: u32 = 0x45414274; /* EABt */
pub const SHARED_DICT_BTREE_MAGIC: u32 = 0x53446963; /* SDic */
pub const SNAPSHOTS_BTREE_MAGIC: u32 = 0x536E4274; /* SnBt */
pub const INVEXT_BTREE_MAGIC: u32 = 0x49784274; /* IxBt */

/// Format revision stamped into every signature.
pub const MAJOR_REVISION: u8 = 1;
pub const MINOR_REVISION: u8 = 0;

pub const MAX_NAME_LEN: usize = 255;
pub const UUID_SIZE: usize = 16;
pub const VOLUME_LABEL_MAX: usize = 16;

/// Bytes reserved for a boot record at the beginning of the initial
/// snapshot PEB.
pub const RESERVED_BOOT_RECORD_SIZE: u32 = 1024;
/// Segment ID fixed for the initial snapshot.
pub const INITIAL_SNAPSHOT_SEG: u64 = 0;
/// First allocatable segment ID.
pub const START_SEGMENT: u64 = 1;

/* File system states. */
pub const MOUNTED_FS: u16 = 0x0000;
pub const VALID_FS: u16 = 0x0001;
pub const ERROR_FS: u16 = 0x0002;

/* Behaviour when detecting errors. */
pub const ERRORS_CONTINUE: u16 = 1;
pub const ERRORS_RO: u16 = 2;
pub const ERRORS_PANIC: u16 = 3;
pub const ERRORS_DEFAULT: u16 = ERRORS_CONTINUE;

/* Reserved inode IDs. */
pub const INVALID_EXTENTS_BTREE_INO: u64 = 5;
pub const SNAPSHOTS_BTREE_INO: u64 = 6;
pub const SHARED_DICT_BTREE_INO: u64 = 8;
pub const INODES_BTREE_INO: u64 = 9;
pub const SHARED_EXTENTS_BTREE_INO: u64 = 10;
pub const SHARED_XATTR_BTREE_INO: u64 = 11;
pub const MAPTBL_INO: u64 = 12;
pub const SEG_TREE_INO: u64 = 13;
pub const SEG_BMAP_INO: u64 = 14;
pub const PEB_CACHE_INO: u64 = 15;
pub const ROOT_INO: u64 = 16;

/// Metadata structure version.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct Revision {
    pub major: u8,
    pub minor: u8,
}

/// Magic signature opening every self-describing record.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct Signature {
    pub common: u32le,
    pub key: u16le,
    pub version: Revision,
}

/* Check flags. */
pub const CHECK_CRC32: u16 = 1 << 0;
pub const CHECK_ZLIB_COMPRESSED: u16 = 1 << 1;
pub const CHECK_LZO_COMPRESSED: u16 = 1 << 2;

/// Metadata structure checksum: the number of covered bytes, flags and the
/// CRC32 computed with the `csum` field zeroed.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct MetadataCheck {
    pub bytes: u16le,
    pub flags: u16le,
    pub csum: u32le,
}

/// Raw (on-disk) extent.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct RawExtent {
    pub seg_id: u64le,
    pub logical_blk: u32le,
    pub len: u32le,
}

/* Type of item in a metadata area extent. */
pub const EMPTY_EXTENT_TYPE: u16 = 0;
pub const SEG_EXTENT_TYPE: u16 = 1;
pub const PEB_EXTENT_TYPE: u16 = 2;
pub const BLK_EXTENT_TYPE: u16 = 3;

/// Metadata area extent: a run of segment/PEB/block IDs.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct MetaAreaExtent {
    pub start_id: u64le,
    pub len: u32le,
    pub kind: u16le,
    pub flags: u16le,
}

/* Segment bitmap segment copies. */
pub const MAIN_SEGBMAP_SEG: usize = 0;
pub const COPY_SEGBMAP_SEG: usize = 1;
pub const SEGBMAP_SEG_COPY_MAX: usize = 2;

/// Maximum number of segments in one segment bitmap chain.
pub const SEGBMAP_SEGS: usize = 8;

/* Segment bitmap flags. */
pub const SEGBMAP_HAS_COPY: u16 = 1 << 0;
pub const SEGBMAP_ERROR: u16 = 1 << 1;
pub const SEGBMAP_MAKE_ZLIB_COMPR: u16 = 1 << 2;
pub const SEGBMAP_MAKE_LZO_COMPR: u16 = 1 << 3;

/// Superblock's segment bitmap header.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct SegbmapSbHeader {
    pub fragments_count: u16le,
    pub fragments_per_seg: u16le,
    pub fragments_per_peb: u16le,
    pub fragment_size: u16le,
    pub bytes_count: u32le,
    pub flags: u16le,
    pub segs_count: u16le,
    pub segs: [[u64le; SEGBMAP_SEG_COPY_MAX]; SEGBMAP_SEGS],
}

/* Mapping table segment copies. */
pub const MAIN_MAPTBL_SEG: usize = 0;
pub const COPY_MAPTBL_SEG: usize = 1;
pub const MAPTBL_SEG_COPY_MAX: usize = 2;

/// The volume header reserves room for this many extent runs per copy of the
/// mapping table chain; building aborts when a chain fragments further.
pub const MAPTBL_RESERVED_EXTENTS: usize = 3;

/* Mapping table flags. */
pub const MAPTBL_HAS_COPY: u16 = 1 << 0;
pub const MAPTBL_ERROR: u16 = 1 << 1;
pub const MAPTBL_MAKE_ZLIB_COMPR: u16 = 1 << 2;
pub const MAPTBL_MAKE_LZO_COMPR: u16 = 1 << 3;
pub const MAPTBL_UNDER_FLUSH: u16 = 1 << 4;

/// Superblock's mapping table header.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct MaptblSbHeader {
    pub fragments_count: u32le,
    pub fragment_bytes: u32le,
    pub last_peb_recover_cno: u64le,
    pub lebs_count: u64le,
    pub pebs_count: u64le,
    pub fragments_per_seg: u16le,
    pub fragments_per_peb: u16le,
    pub flags: u16le,
    pub pre_erase_pebs: u16le,
    pub lebs_per_fragment: u16le,
    pub pebs_per_fragment: u16le,
    pub pebs_per_stripe: u16le,
    pub stripes_per_fragment: u16le,
    pub extents: [[MetaAreaExtent; MAPTBL_SEG_COPY_MAX]; MAPTBL_RESERVED_EXTENTS],
}

/* Btree types. */
pub const BTREE_UNKNOWN_TYPE: u8 = 0;
pub const INODES_BTREE: u8 = 1;
pub const DENTRIES_BTREE: u8 = 2;
pub const EXTENTS_BTREE: u8 = 3;
pub const SHARED_EXTENTS_BTREE: u8 = 4;
pub const XATTR_BTREE: u8 = 5;
pub const SHARED_XATTR_BTREE: u8 = 6;
pub const SHARED_DICTIONARY_BTREE: u8 = 7;
pub const SNAPSHOTS_BTREE: u8 = 8;
pub const INVALIDATED_EXTENTS_BTREE: u8 = 9;

pub const BTREE_DESC_INDEX_AREA_RESIZABLE: u16 = 1 << 0;

/// Generic btree descriptor keeping the main features of one tree kind.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct BtreeDescriptor {
    pub magic: u32le,
    pub flags: u16le,
    pub kind: u8,
    pub log_node_size: u8,
    pub pages_per_node: u8,
    pub node_ptr_size: u8,
    pub index_size: u16le,
    pub item_size: u16le,
    pub index_area_min_size: u16le,
}

/// Btree descriptor embedded into the volume header with reserved tail.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct PaddedBtreeDescriptor {
    pub desc: BtreeDescriptor,
    pub reserved: [u8; 0x10],
}

/* Superblock segment copies and chain phases. */
pub const MAIN_SB_SEG: usize = 0;
pub const COPY_SB_SEG: usize = 1;
pub const SB_SEG_COPY_MAX: usize = 2;

pub const CUR_SB_SEG: usize = 0;
pub const NEXT_SB_SEG: usize = 1;
pub const RESERVED_SB_SEG: usize = 2;
pub const PREV_SB_SEG: usize = 3;
pub const SB_CHAIN_MAX: usize = 4;

/// LEB/PEB numbers association.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct Leb2PebPair {
    pub leb_id: u64le,
    pub peb_id: u64le,
}

/// Btree index: hash plus the extent of the child node.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct BtreeIndex {
    pub hash: u64le,
    pub extent: RawExtent,
}

/// Node identification key.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct BtreeIndexKey {
    pub node_id: u32le,
    pub node_type: u8,
    pub height: u8,
    pub flags: u16le,
    pub index: BtreeIndex,
}

pub const BTREE_LEAF_NODE_HEIGHT: u8 = 0;
pub const BTREE_ROOT_NODE_ID: u32 = 0;
pub const BTREE_ROOT_NODE_INDEX_COUNT: usize = 2;

/* Btree node types. */
pub const BTREE_NODE_UNKNOWN_TYPE: u8 = 0;
pub const BTREE_ROOT_NODE: u8 = 1;
pub const BTREE_INDEX_NODE: u8 = 2;
pub const BTREE_HYBRID_NODE: u8 = 3;
pub const BTREE_LEAF_NODE: u8 = 4;

/// Root node header.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct BtreeRootNodeHeader {
    pub height: u8,
    pub items_count: u8,
    pub flags: u8,
    pub node_type: u8,
    pub upper_node_id: u32le,
    pub node_ids: [u32le; BTREE_ROOT_NODE_INDEX_COUNT],
}

/// Inline root node living inside the superblock records. The two indexes
/// split the whole tree on two branches once it grows beyond the root.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct BtreeInlineRootNode {
    pub header: BtreeRootNodeHeader,
    pub indexes: [BtreeIndex; BTREE_ROOT_NODE_INDEX_COUNT],
}

/// Inodes btree root: descriptor, usage counters and the inline root node.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct InodesBtree {
    pub desc: BtreeDescriptor,
    pub allocated_inodes: u64le,
    pub free_inodes: u64le,
    pub inodes_capacity: u64le,
    pub leaf_nodes: u32le,
    pub nodes_count: u32le,
    pub upper_allocated_ino: u64le,
    pub reserved: [u8; 0x8],
    pub root_node: BtreeInlineRootNode,
}

/// Btree root without item counters (shared extents, shared dictionary,
/// snapshots, invalidated extents).
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct InlineBtree {
    pub desc: BtreeDescriptor,
    pub reserved: [u8; 0x30],
    pub root_node: BtreeInlineRootNode,
}

/* Current segment slots in the volume state. */
pub const CUR_DATA_SEG: usize = 0;
pub const CUR_LNODE_SEG: usize = 1;
pub const CUR_HNODE_SEG: usize = 2;
pub const CUR_IDXNODE_SEG: usize = 3;
pub const CUR_DATA_UPDATE_SEG: usize = 4;
pub const CUR_SEGS_COUNT: usize = 5;

/* Block bitmap options. */
pub const BLK_BMAP_CREATE_COPY: u16 = 1 << 0;
pub const BLK_BMAP_MAKE_COMPRESSION: u16 = 1 << 1;
pub const BLK_BMAP_NOCOMPR_TYPE: u8 = 0;
pub const BLK_BMAP_ZLIB_COMPR_TYPE: u8 = 1;
pub const BLK_BMAP_LZO_COMPR_TYPE: u8 = 2;

#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct BlkBmapOptions {
    pub flags: u16le,
    pub compression: u8,
    pub reserved: u8,
}

/* Offset translation table options. */
pub const BLK2OFF_TBL_CREATE_COPY: u16 = 1 << 0;
pub const BLK2OFF_TBL_MAKE_COMPRESSION: u16 = 1 << 1;
pub const BLK2OFF_TBL_NOCOMPR_TYPE: u8 = 0;
pub const BLK2OFF_TBL_ZLIB_COMPR_TYPE: u8 = 1;
pub const BLK2OFF_TBL_LZO_COMPR_TYPE: u8 = 2;

#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct Blk2OffTblOptions {
    pub flags: u16le,
    pub compression: u8,
    pub reserved: u8,
}

/* User data options. */
pub const USER_DATA_MAKE_COMPRESSION: u16 = 1 << 0;
pub const USER_DATA_NOCOMPR_TYPE: u8 = 0;
pub const USER_DATA_ZLIB_COMPR_TYPE: u8 = 1;
pub const USER_DATA_LZO_COMPR_TYPE: u8 = 2;

#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct UserDataOptions {
    pub flags: u16le,
    pub compression: u8,
    pub reserved1: u8,
    pub migration_threshold: u16le,
    pub reserved2: u16le,
}

pub const INLINE_EXTENTS_COUNT: usize = 3;

/// Contiguous sequence of raw extents belonging to one file.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct RawFork {
    pub start_offset: u64le,
    pub blks_count: u64le,
    pub extents: [RawExtent; INLINE_EXTENTS_COUNT],
}

/* Dentry types. */
pub const DENTRY_UNKNOWN_TYPE: u8 = 0;
pub const INLINE_DENTRY: u8 = 1;
pub const REGULAR_DENTRY: u8 = 2;

/* Directory file types. */
pub const FT_UNKNOWN: u8 = 0;
pub const FT_REG_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_CHRDEV: u8 = 3;
pub const FT_BLKDEV: u8 = 4;
pub const FT_FIFO: u8 = 5;
pub const FT_SOCK: u8 = 6;
pub const FT_SYMLINK: u8 = 7;

pub const DENTRY_INLINE_NAME_MAX_LEN: usize = 12;

/// Directory entry. Short names live in the inline string; longer names keep
/// their first twelve symbols here and the full string in the shared
/// dictionary.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct DirEntry {
    pub ino: u64le,
    pub hash_code: u64le,
    pub name_len: u8,
    pub dentry_type: u8,
    pub file_type: u8,
    pub flags: u8,
    pub inline_string: [u8; DENTRY_INLINE_NAME_MAX_LEN],
}

pub const XATTR_INLINE_NAME_MAX_LEN: usize = 16;
pub const XATTR_INLINE_BLOB_MAX_LEN: usize = 32;

/// Extended attribute entry.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct XattrEntry {
    pub name_hash: u64le,
    pub inline_index: u8,
    pub name_len: u8,
    pub name_type: u8,
    pub name_flags: u8,
    pub blob_len: u16le,
    pub blob_type: u8,
    pub blob_flags: u8,
    pub inline_string: [u8; XATTR_INLINE_NAME_MAX_LEN],
    pub blob: [u8; XATTR_INLINE_BLOB_MAX_LEN],
}

pub const INLINE_DENTRIES_PER_AREA: usize = 2;

/// Inline dentries array of one inode private area.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct InodeInlineDentries {
    pub array: [DirEntry; INLINE_DENTRIES_PER_AREA],
}

/// Inode's private area. Area one holds inline dentries for directories (or
/// the extents root for files); area two is reserved for the xattr root.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct InodePrivateArea {
    pub area1: InodeInlineDentries,
    pub area2: [u8; 0x40],
}

/* Inode private flags. */
pub const INODE_HAS_INLINE_EXTENTS: u16 = 1 << 0;
pub const INODE_HAS_EXTENTS_BTREE: u16 = 1 << 1;
pub const INODE_HAS_INLINE_DENTRIES: u16 = 1 << 2;
pub const INODE_HAS_DENTRIES_BTREE: u16 = 1 << 3;
pub const INODE_HAS_INLINE_XATTR: u16 = 1 << 4;
pub const INODE_HAS_XATTR_BTREE: u16 = 1 << 5;
pub const INODE_HAS_INLINE_FILE: u16 = 1 << 6;

/// Mode bits of a directory (on-disk representation, Linux layout).
pub const S_IFDIR: u16 = 0o040000;

/// Raw (on-disk) inode.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct Inode {
    pub magic: u16le,
    pub mode: u16le,
    pub flags: u32le,
    pub uid: u32le,
    pub gid: u32le,
    pub atime: u64le,
    pub ctime: u64le,
    pub mtime: u64le,
    pub birthtime: u64le,
    pub atime_nsec: u32le,
    pub ctime_nsec: u32le,
    pub mtime_nsec: u32le,
    pub birthtime_nsec: u32le,
    pub generation: u64le,
    pub size: u64le,
    pub blocks: u64le,
    pub parent_ino: u64le,
    pub refcount: u32le,
    pub checksum: u32le,
    pub ino: u64le,
    pub hash_code: u64le,
    pub name_len: u16le,
    pub private_flags: u16le,
    /// Count of forks for a file, count of dentries for a directory.
    pub count_of: u32le,
    pub internal: InodePrivateArea,
}

/* Volume header flags. */
pub const VH_ZNS_BASED_VOLUME: u32 = 1 << 0;
pub const VH_UNALIGNED_ZONE: u32 = 1 << 1;

pub const LEBS_PER_PEB_INDEX_DEFAULT: u32 = 1;

/// Static part of the superblock.
///
/// The header carries the fixed geometry (as log2 values), the superblock
/// chain placement, the segment bitmap and mapping table descriptions, the
/// advertised full-log sizes and the btree descriptors shared by every tree
/// instance of the given kind.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct VolumeHeader {
    pub magic: Signature,
    pub check: MetadataCheck,
    /* 0x10 */
    pub log_pagesize: u8,
    pub log_erasesize: u8,
    pub log_segsize: u8,
    pub log_pebs_per_seg: u8,
    pub megabytes_per_peb: u16le,
    pub pebs_per_seg: u16le,
    /* 0x18 */
    pub create_time: u64le,
    pub create_cno: u64le,
    pub flags: u32le,
    pub lebs_per_peb_index: u32le,
    /* 0x30 */
    pub sb_pebs: [[Leb2PebPair; SB_SEG_COPY_MAX]; SB_CHAIN_MAX],
    /* 0xB0 */
    pub segbmap: SegbmapSbHeader,
    /* 0x140 */
    pub maptbl: MaptblSbHeader,
    /* 0x1D0 */
    pub sb_seg_log_pages: u16le,
    pub segbmap_log_pages: u16le,
    pub maptbl_log_pages: u16le,
    pub lnodes_seg_log_pages: u16le,
    pub hnodes_seg_log_pages: u16le,
    pub inodes_seg_log_pages: u16le,
    pub user_data_log_pages: u16le,
    pub create_threads_per_seg: u16le,
    /* 0x1E0 */
    pub dentries_btree: PaddedBtreeDescriptor,
    /* 0x200 */
    pub extents_btree: PaddedBtreeDescriptor,
    /* 0x220 */
    pub xattr_btree: PaddedBtreeDescriptor,
    /* 0x240 */
    pub invextree: InlineBtree,
    /* 0x2C0 */
    pub uuid: [u8; UUID_SIZE],
    /* 0x2D0 */
    pub reserved4: [u8; 0x130],
}

/* Volume state flags. */
pub const HAS_INLINE_INODES_TREE: u32 = 1 << 0;

/* Compatible feature flags. */
pub const HAS_SEGBMAP_COMPAT_FLAG: u64 = 1 << 0;
pub const HAS_MAPTBL_COMPAT_FLAG: u64 = 1 << 1;
pub const HAS_SHARED_EXTENTS_COMPAT_FLAG: u64 = 1 << 2;
pub const HAS_SHARED_XATTRS_COMPAT_FLAG: u64 = 1 << 3;
pub const HAS_SHARED_DICT_COMPAT_FLAG: u64 = 1 << 4;
pub const HAS_INODES_TREE_COMPAT_FLAG: u64 = 1 << 5;
pub const HAS_SNAPSHOTS_TREE_COMPAT_FLAG: u64 = 1 << 6;
pub const HAS_INVALID_EXTENTS_TREE_COMPAT_FLAG: u64 = 1 << 7;

/* Read-only compatible feature flags. */
pub const ZLIB_COMPAT_RO_FLAG: u64 = 1 << 0;
pub const LZO_COMPAT_RO_FLAG: u64 = 1 << 1;

/// Changeable part of the superblock.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct VolumeState {
    pub magic: Signature,
    pub check: MetadataCheck,
    /* 0x10 */
    pub nsegs: u64le,
    pub free_pages: u64le,
    /* 0x20 */
    pub timestamp: u64le,
    pub cno: u64le,
    /* 0x30 */
    pub flags: u32le,
    pub state: u16le,
    pub errors: u16le,
    /* 0x38 */
    pub feature_compat: u64le,
    pub feature_compat_ro: u64le,
    pub feature_incompat: u64le,
    /* 0x50 */
    pub uuid: [u8; UUID_SIZE],
    pub label: [u8; VOLUME_LABEL_MAX],
    /* 0x70 */
    pub cur_segs: [u64le; CUR_SEGS_COUNT],
    /* 0x98 */
    pub migration_threshold: u16le,
    pub reserved1: u16le,
    /* 0x9C */
    pub blkbmap: BlkBmapOptions,
    pub blk2off_tbl: Blk2OffTblOptions,
    /* 0xA4 */
    pub user_data: UserDataOptions,
    /* 0xAC */
    pub open_zones: u32le,
    /* 0xB0 */
    pub root_folder: Inode,
    /* 0x1B0 */
    pub reserved3: [u8; 0x50],
    /* 0x200 */
    pub inodes_btree: InodesBtree,
    /* 0x280 */
    pub shared_extents_btree: InlineBtree,
    /* 0x300 */
    pub shared_dict_btree: InlineBtree,
    /* 0x380 */
    pub snapshots_btree: InlineBtree,
}

/// Metadata descriptor: a pointer from a log header or footer to one region
/// of the log, together with the region's checksum.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct MetadataDescriptor {
    pub offset: u32le,
    pub size: u32le,
    pub check: MetadataCheck,
}

/* Indexes into the metadata descriptor arrays. */
pub const BLK_BMAP_INDEX: usize = 0;
pub const SNAPSHOT_RULES_AREA_INDEX: usize = 1;
pub const OFF_TABLE_INDEX: usize = 2;
pub const COLD_PAYLOAD_AREA_INDEX: usize = 3;
pub const WARM_PAYLOAD_AREA_INDEX: usize = 4;
pub const HOT_PAYLOAD_AREA_INDEX: usize = 5;
pub const BLK_DESC_AREA_INDEX: usize = 6;
pub const MAPTBL_CACHE_INDEX: usize = 7;
pub const LOG_FOOTER_INDEX: usize = 8;
pub const SEG_HDR_DESC_MAX: usize = LOG_FOOTER_INDEX + 1;
pub const LOG_FOOTER_DESC_MAX: usize = OFF_TABLE_INDEX + 1;

/* PEB migration chain. */
pub const PREV_MIGRATING_PEB: usize = 0;
pub const CUR_MIGRATING_PEB: usize = 1;
pub const MIGRATING_PEBS_CHAIN: usize = 2;

pub const PEB_UNKNOWN_MIGRATION_ID: u8 = 0;
pub const PEB_MIGRATION_ID_START: u8 = 1;

/// Header of a segment's log: a copy of the volume header plus the log's own
/// identity, flags and metadata descriptors.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct SegmentHeader {
    pub volume_hdr: VolumeHeader,
    /* 0x400 */
    pub timestamp: u64le,
    pub cno: u64le,
    /* 0x410 */
    pub log_pages: u16le,
    pub seg_type: u16le,
    pub seg_flags: u32le,
    /* 0x418 */
    pub desc_array: [MetadataDescriptor; SEG_HDR_DESC_MAX],
    /* 0x4A8 */
    pub peb_migration_id: [u8; MIGRATING_PEBS_CHAIN],
    pub reserved: [u8; 0x6],
    /* 0x4B0 */
    pub peb_create_time: u64le,
    /* 0x4B8 */
    pub seg_id: u64le,
    pub leb_id: u64le,
    pub peb_id: u64le,
    pub relation_peb_id: u64le,
    /* 0x4D8 */
    pub payload: [u8; 0x328],
}

/* Segment types. */
pub const UNKNOWN_SEG_TYPE: u16 = 0;
pub const SB_SEG_TYPE: u16 = 1;
pub const INITIAL_SNAPSHOT_SEG_TYPE: u16 = 2;
pub const SEGBMAP_SEG_TYPE: u16 = 3;
pub const MAPTBL_SEG_TYPE: u16 = 4;
pub const LEAF_NODE_SEG_TYPE: u16 = 5;
pub const HYBRID_NODE_SEG_TYPE: u16 = 6;
pub const INDEX_NODE_SEG_TYPE: u16 = 7;
pub const USER_DATA_SEG_TYPE: u16 = 8;
pub const LAST_KNOWN_SEG_TYPE: u16 = USER_DATA_SEG_TYPE;

/* Segment header flags. */
pub const SEG_HDR_HAS_BLK_BMAP: u32 = 1 << 0;
pub const SEG_HDR_HAS_OFFSET_TABLE: u32 = 1 << 1;
pub const LOG_HAS_COLD_PAYLOAD: u32 = 1 << 2;
pub const LOG_HAS_WARM_PAYLOAD: u32 = 1 << 3;
pub const LOG_HAS_HOT_PAYLOAD: u32 = 1 << 4;
pub const LOG_HAS_BLK_DESC_CHAIN: u32 = 1 << 5;
pub const LOG_HAS_MAPTBL_CACHE: u32 = 1 << 6;
pub const LOG_HAS_FOOTER: u32 = 1 << 7;
pub const LOG_IS_PARTIAL: u32 = 1 << 8;
pub const LOG_HAS_PARTIAL_HEADER: u32 = 1 << 9;
pub const PARTIAL_HEADER_INSTEAD_FOOTER: u32 = 1 << 10;

/// Footer closing a full log: a copy of the volume state plus descriptors of
/// the backup areas.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct LogFooter {
    pub volume_state: VolumeState,
    /* 0x400 */
    pub timestamp: u64le,
    pub cno: u64le,
    /* 0x410 */
    pub log_bytes: u32le,
    pub log_flags: u32le,
    pub reserved1: u64le,
    /* 0x420 */
    pub desc_array: [MetadataDescriptor; LOG_FOOTER_DESC_MAX],
    /* 0x450 */
    pub peb_create_time: u64le,
    /* 0x458 */
    pub payload: [u8; 0x3A8],
}

/* Log footer flags. */
pub const LOG_FOOTER_HAS_BLK_BMAP: u32 = 1 << 0;
pub const LOG_FOOTER_HAS_OFFSET_TABLE: u32 = 1 << 1;
pub const PARTIAL_LOG_FOOTER: u32 = 1 << 2;
pub const ENDING_LOG_FOOTER: u32 = 1 << 3;

/// Header of a partial log. Emitted instead of a footer when the advertised
/// full-log size is larger than what the written log actually uses; carries
/// the essential segment header and volume state fields in one record.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct PartialLogHeader {
    pub magic: Signature,
    pub check: MetadataCheck,
    /* 0x10 */
    pub timestamp: u64le,
    pub cno: u64le,
    /* 0x20 */
    pub log_pages: u16le,
    pub seg_type: u16le,
    pub pl_flags: u32le,
    /* 0x28 */
    pub log_bytes: u32le,
    pub flags: u32le,
    /* 0x30 */
    pub desc_array: [MetadataDescriptor; SEG_HDR_DESC_MAX],
    /* 0xC0 */
    pub nsegs: u64le,
    pub free_pages: u64le,
    /* 0xD0 */
    pub root_folder: Inode,
    /* 0x1D0 */
    pub inodes_btree: InodesBtree,
    /* 0x250 */
    pub shared_extents_btree: InlineBtree,
    /* 0x2D0 */
    pub shared_dict_btree: InlineBtree,
    /* 0x350 */
    pub sequence_id: u32le,
    pub log_pagesize: u8,
    pub log_erasesize: u8,
    pub log_segsize: u8,
    pub log_pebs_per_seg: u8,
    pub lebs_per_peb_index: u32le,
    pub create_threads_per_seg: u16le,
    pub reserved1: [u8; 0x2],
    /* 0x360 */
    pub snapshots_btree: InlineBtree,
    /* 0x3E0 */
    pub open_zones: u32le,
    pub reserved2: [u8; 0x4],
    pub peb_create_time: u64le,
    pub reserved3: [u8; 0x10],
    /* 0x400 */
    pub invextree: InlineBtree,
    /* 0x480 */
    pub seg_id: u64le,
    pub leb_id: u64le,
    pub peb_id: u64le,
    pub relation_peb_id: u64le,
    /* 0x4A0 */
    pub uuid: [u8; UUID_SIZE],
    /* 0x4B0 */
    pub volume_create_time: u64le,
    /* 0x4B8 */
    pub payload: [u8; 0x348],
}

/* Fragments chain types. */
pub const UNKNOWN_CHAIN_HDR: u8 = 0x0;
pub const LOG_AREA_CHAIN_HDR: u8 = 0x1;
pub const BLK_STATE_CHAIN_HDR: u8 = 0x2;
pub const BLK_DESC_CHAIN_HDR: u8 = 0x3;
pub const BLK2OFF_CHAIN_HDR: u8 = 0x6;
pub const BLK_BMAP_CHAIN_HDR: u8 = 0x9;

/* Fragments chain flags. */
pub const MULTIPLE_HDR_CHAIN: u16 = 1 << 0;

/// Maximum fragment descriptors in one area block table.
pub const FRAGMENTS_CHAIN_MAX: usize = 14;

/// Header of a fragments' chain.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct FragmentsChainHeader {
    pub compr_bytes: u32le,
    pub uncompr_bytes: u32le,
    pub fragments_count: u16le,
    pub desc_size: u16le,
    pub magic: u8,
    pub kind: u8,
    pub flags: u16le,
}

/* Fragment descriptor types. */
pub const UNKNOWN_FRAGMENT_TYPE: u8 = 0;
pub const FRAGMENT_UNCOMPR_BLOB: u8 = 1;
pub const FRAGMENT_ZLIB_BLOB: u8 = 2;
pub const FRAGMENT_LZO_BLOB: u8 = 3;
pub const DATA_BLK_STATE_DESC: u8 = 4;
pub const DATA_BLK_DESC: u8 = 5;
pub const NEXT_TABLE_DESC: u8 = 14;

/* Fragment descriptor flags. */
pub const FRAGMENT_HAS_CSUM: u8 = 1 << 0;

/// Fragment descriptor.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct FragmentDesc {
    pub offset: u32le,
    pub compr_size: u16le,
    pub uncompr_size: u16le,
    pub checksum: u32le,
    pub sequence_id: u8,
    pub magic: u8,
    pub kind: u8,
    pub flags: u8,
}

/* Block bitmap header flags and types. */
pub const BLK_BMAP_BACKUP: u8 = 1 << 0;
pub const BLK_BMAP_COMPRESSED: u8 = 1 << 1;
pub const BLK_BMAP_UNCOMPRESSED_BLOB: u8 = 0;
pub const BLK_BMAP_ZLIB_BLOB: u8 = 1;
pub const BLK_BMAP_LZO_BLOB: u8 = 2;

/// Header of a segment's block bitmap.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct BlockBitmapHeader {
    pub magic: Signature,
    pub fragments_count: u16le,
    pub bytes_count: u32le,
    pub flags: u8,
    pub kind: u8,
}

/* Block bitmap fragment types (bits 6..8 of the flags byte). */
pub const SRC_BLK_BMAP: u8 = 0;
pub const DST_BLK_BMAP: u8 = 1;

/// Block bitmap fragment header. The low six bits of `flags` carry the
/// fragment flags, the upper two the source/destination type.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct BlockBitmapFragment {
    pub peb_index: u16le,
    pub sequence_id: u8,
    pub flags: u8,
    pub last_free_blk: u32le,
    pub metadata_blks: u32le,
    pub invalid_blks: u32le,
    pub chain_hdr: FragmentsChainHeader,
}

/* Log area types. */
pub const LOG_BLK_DESC_AREA: u8 = 0;
pub const LOG_MAIN_AREA: u8 = 1;
pub const LOG_DIFFS_AREA: u8 = 2;
pub const LOG_JOURNAL_AREA: u8 = 3;
pub const LOG_AREA_MAX: u8 = 4;

/// PEB's page descriptor.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct PebPageDescriptor {
    pub logical_offset: u32le,
    pub logical_blk: u16le,
    pub peb_page: u16le,
}

/// Block's state offset inside a log area.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct BlkStateOffset {
    pub log_start_page: u16le,
    pub log_area: u8,
    pub peb_migration_id: u8,
    pub byte_offset: u32le,
}

/// Descriptor of a physical offset.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct PhysOffsetDescriptor {
    pub page_desc: PebPageDescriptor,
    pub blk_state: BlkStateOffset,
}

/* Physical offset table types and flags. */
pub const SEG_OFF_TABLE: u16 = 1;
pub const OFF_TABLE_HAS_CSUM: u16 = 1 << 0;
pub const OFF_TABLE_HAS_NEXT_FRAGMENT: u16 = 1 << 1;

/// Physical offset table fragment header. A fragment is an ordered array of
/// offset descriptors; `next_fragment_off` chains fragments, `U16_MAX`
/// terminates the chain.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct PhysOffsetTableHeader {
    pub start_id: u16le,
    pub id_count: u16le,
    pub byte_size: u32le,
    pub peb_index: u16le,
    pub sequence_id: u16le,
    pub kind: u16le,
    pub flags: u16le,
    pub magic: u32le,
    pub checksum: u32le,
    pub used_logical_blks: u16le,
    pub free_logical_blks: u16le,
    pub last_allocated_blk: u16le,
    pub next_fragment_off: u16le,
}

pub const INVALID_OFFSET_ID: u16 = u16::MAX;

/* Logical block sequence states. */
pub const LOGICAL_BLK_UNKNOWN_STATE: u8 = 0;
pub const LOGICAL_BLK_FREE: u8 = 1;
pub const LOGICAL_BLK_USED: u8 = 2;

/// Logical block to offset ID translation extent.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct TranslationExtent {
    pub logical_blk: u16le,
    pub offset_id: u16le,
    pub len: u16le,
    pub sequence_id: u8,
    pub state: u8,
}

/// Offset translation table header: one inline translation extent followed by
/// the chain of physical offset table fragments.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct Blk2OffTableHeader {
    pub magic: Signature,
    pub check: MetadataCheck,
    /* 0x10 */
    pub extents_off: u16le,
    pub extents_count: u16le,
    pub offset_table_off: u16le,
    pub fragments_count: u16le,
    /* 0x18 */
    pub sequence: [TranslationExtent; 1],
}

pub const NEXT_BLK_TABLE_INDEX: usize = FRAGMENTS_CHAIN_MAX;
pub const BLK_TABLE_MAX: usize = FRAGMENTS_CHAIN_MAX + 1;

/// Descriptor of a block descriptor sequence in an area. One table covers up
/// to fourteen fragments; the fifteenth slot points at the next table.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct AreaBlockTable {
    pub chain_hdr: FragmentsChainHeader,
    pub blk: [FragmentDesc; BLK_TABLE_MAX],
}

pub const BLK_STATE_OFF_MAX: usize = 6;

/// Block descriptor.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct BlockDescriptor {
    pub ino: u64le,
    pub logical_offset: u32le,
    pub peb_index: u16le,
    pub peb_page: u16le,
    pub state: [BlkStateOffset; BLK_STATE_OFF_MAX],
}

/// Block's state descriptor opening a data area portion.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct BlockStateDescriptor {
    pub cno: u64le,
    pub parent_snapshot: u64le,
    pub chain_hdr: FragmentsChainHeader,
}

/* Segment bitmap fragment flags. */
pub const SEGBMAP_FRAG_ZLIB_COMPR: u8 = 1 << 0;
pub const SEGBMAP_FRAG_LZO_COMPR: u8 = 1 << 1;

/// Segment bitmap fragment header.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct SegbmapFragmentHeader {
    pub magic: u16le,
    pub seg_index: u16le,
    pub peb_index: u16le,
    pub flags: u8,
    pub seg_type: u8,
    pub start_item: u64le,
    pub sequence_id: u16le,
    pub fragment_bytes: u16le,
    pub checksum: u32le,
    pub total_segs: u16le,
    pub clean_or_using_segs: u16le,
    pub used_or_dirty_segs: u16le,
    pub bad_segs: u16le,
}

/* PEB types. */
pub const MAPTBL_UNKNOWN_PEB_TYPE: u8 = 0x00;
pub const MAPTBL_DATA_PEB_TYPE: u8 = 0x01;
pub const MAPTBL_LNODE_PEB_TYPE: u8 = 0x02;
pub const MAPTBL_HNODE_PEB_TYPE: u8 = 0x03;
pub const MAPTBL_IDXNODE_PEB_TYPE: u8 = 0x04;
pub const MAPTBL_INIT_SNAP_PEB_TYPE: u8 = 0x05;
pub const MAPTBL_SBSEG_PEB_TYPE: u8 = 0x06;
pub const MAPTBL_SEGBMAP_PEB_TYPE: u8 = 0x07;
pub const MAPTBL_MAPTBL_PEB_TYPE: u8 = 0x08;

/* PEB states. */
pub const MAPTBL_UNKNOWN_PEB_STATE: u8 = 0x00;
pub const MAPTBL_BAD_PEB_STATE: u8 = 0x01;
pub const MAPTBL_CLEAN_PEB_STATE: u8 = 0x02;
pub const MAPTBL_USING_PEB_STATE: u8 = 0x03;
pub const MAPTBL_USED_PEB_STATE: u8 = 0x04;
pub const MAPTBL_PRE_ERASE_STATE: u8 = 0x10;
pub const MAPTBL_UNDER_ERASE_STATE: u8 = 0x11;
pub const MAPTBL_RECOVERING_STATE: u8 = 0x13;

/// Descriptor of a PEB in the mapping table.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct PebDescriptor {
    pub erase_cycles: u32le,
    pub peb_type: u8,
    pub state: u8,
    pub flags: u8,
    pub shared_peb_index: u8,
}

/* PEB table bitmap indexes. */
pub const PEBTBL_USED_BMAP: usize = 0;
pub const PEBTBL_DIRTY_BMAP: usize = 1;
pub const PEBTBL_RECOVER_BMAP: usize = 2;
pub const PEBTBL_BADBLK_BMAP: usize = 3;
pub const PEBTBL_BMAP_MAX: usize = 4;

/// Bytes per PEB table bitmap: one bit per descriptor slot of a stripe.
pub const PEBTBL_BMAP_SIZE: usize =
    (crate::MEM_PAGE_SIZE as usize / mem::size_of::<PebDescriptor>()) / 8;

/* PEB table fragment flags. */
pub const PEBTBL_FRAG_ZLIB_COMPR: u8 = 1 << 0;
pub const PEBTBL_FRAG_LZO_COMPR: u8 = 1 << 1;
pub const PEBTBL_UNDER_RECOVERING: u8 = 1 << 2;
pub const PEBTBL_BADBLK_EXIST: u8 = 1 << 3;

pub const PEBTBL_FIRST_RECOVER_TRY: u8 = 0;

/// Header of one PEB table stripe. The `recover` byte packs the recovering
/// duration in months (low nibble) and the recover threshold (high nibble).
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct PebTableFragmentHeader {
    pub magic: u16le,
    pub flags: u8,
    pub recover: u8,
    pub checksum: u32le,
    pub start_peb: u64le,
    pub pebs_count: u16le,
    pub last_selected_peb: u16le,
    pub reserved_pebs: u16le,
    pub stripe_id: u16le,
    pub portion_id: u16le,
    pub fragment_id: u16le,
    pub bytes_count: u32le,
    pub bmaps: [[u8; PEBTBL_BMAP_SIZE]; PEBTBL_BMAP_MAX],
}

/* LEB table fragment flags. */
pub const LEBTBL_FRAG_ZLIB_COMPR: u16 = 1 << 0;
pub const LEBTBL_FRAG_LZO_COMPR: u16 = 1 << 1;

/// Logical descriptor of an erase block: offsets into the portion's PEB
/// tables for the mapped and the migration-destination PEB.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct LebDescriptor {
    pub physical_index: u16le,
    pub relation_index: u16le,
}

/// Header of one LEB table mempage.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct LebTableFragmentHeader {
    pub magic: u16le,
    pub flags: u16le,
    pub checksum: u32le,
    pub start_leb: u64le,
    pub lebs_count: u16le,
    pub mapped_lebs: u16le,
    pub migrating_lebs: u16le,
    pub reserved1: u16le,
    pub portion_id: u16le,
    pub fragment_id: u16le,
    pub bytes_count: u32le,
}

/* Maptbl cache flags. */
pub const MAPTBL_CACHE_ZLIB_COMPR: u16 = 1 << 0;
pub const MAPTBL_CACHE_LZO_COMPR: u16 = 1 << 1;

/// Mapping table cache fragment header. The fragment body is a sorted array
/// of LEB/PEB pairs, a sentinel magic, then one state record per pair.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct MaptblCacheHeader {
    pub magic: Signature,
    pub sequence_id: u16le,
    pub flags: u16le,
    pub items_count: u16le,
    pub bytes_count: u16le,
    pub start_leb: u64le,
    pub end_leb: u64le,
}

/* PEB state consistency. */
pub const PEB_STATE_UNKNOWN: u8 = 0;
pub const PEB_STATE_CONSISTENT: u8 = 1;
pub const PEB_STATE_INCONSISTENT: u8 = 2;

/// Per-pair PEB state record of the mapping table cache.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct MaptblCachePebState {
    pub consistency: u8,
    pub state: u8,
    pub flags: u8,
    pub shared_peb_index: u8,
}

/// Generic btree node header (on-disk node prologue).
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct BtreeNodeHeader {
    pub magic: Signature,
    pub check: MetadataCheck,
    pub height: u8,
    pub log_node_size: u8,
    pub log_index_area_size: u8,
    pub node_type: u8,
    pub flags: u16le,
    pub index_area_offset: u16le,
    pub index_count: u16le,
    pub index_size: u8,
    pub min_item_size: u8,
    pub max_item_size: u16le,
    pub items_capacity: u16le,
    pub start_hash: u64le,
    pub end_hash: u64le,
    pub create_cno: u64le,
    pub node_id: u32le,
    pub item_area_offset: u32le,
}

/* Fixed record sizes are part of the format contract. */
const _: () = assert!(mem::size_of::<Signature>() == 0x08);
const _: () = assert!(mem::size_of::<MetadataCheck>() == 0x08);
const _: () = assert!(mem::size_of::<RawExtent>() == 0x10);
const _: () = assert!(mem::size_of::<MetaAreaExtent>() == 0x10);
const _: () = assert!(mem::size_of::<SegbmapSbHeader>() == 0x90);
const _: () = assert!(mem::size_of::<MaptblSbHeader>() == 0x90);
const _: () = assert!(mem::size_of::<BtreeDescriptor>() == 0x10);
const _: () = assert!(mem::size_of::<PaddedBtreeDescriptor>() == 0x20);
const _: () = assert!(mem::size_of::<Leb2PebPair>() == 0x10);
const _: () = assert!(mem::size_of::<BtreeIndex>() == 0x18);
const _: () = assert!(mem::size_of::<BtreeIndexKey>() == 0x20);
const _: () = assert!(mem::size_of::<BtreeInlineRootNode>() == 0x40);
const _: () = assert!(mem::size_of::<InodesBtree>() == 0x80);
const _: () = assert!(mem::size_of::<InlineBtree>() == 0x80);
const _: () = assert!(mem::size_of::<RawFork>() == 0x40);
const _: () = assert!(mem::size_of::<DirEntry>() == 0x20);
const _: () = assert!(mem::size_of::<XattrEntry>() == 0x40);
const _: () = assert!(mem::size_of::<Inode>() == 0x100);
const _: () = assert!(mem::size_of::<VolumeHeader>() == 0x400);
const _: () = assert!(mem::size_of::<VolumeState>() == 0x400);
const _: () = assert!(mem::size_of::<MetadataDescriptor>() == 0x10);
const _: () = assert!(mem::size_of::<SegmentHeader>() == 0x800);
const _: () = assert!(mem::size_of::<LogFooter>() == 0x800);
const _: () = assert!(mem::size_of::<PartialLogHeader>() == 0x800);
const _: () = assert!(mem::size_of::<FragmentsChainHeader>() == 0x10);
const _: () = assert!(mem::size_of::<FragmentDesc>() == 0x10);
const _: () = assert!(mem::size_of::<BlockBitmapHeader>() == 0x10);
const _: () = assert!(mem::size_of::<BlockBitmapFragment>() == 0x20);
const _: () = assert!(mem::size_of::<PhysOffsetDescriptor>() == 0x10);
const _: () = assert!(mem::size_of::<PhysOffsetTableHeader>() == 0x20);
const _: () = assert!(mem::size_of::<TranslationExtent>() == 0x08);
const _: () = assert!(mem::size_of::<Blk2OffTableHeader>() == 0x20);
const _: () = assert!(mem::size_of::<AreaBlockTable>() == 0x100);
const _: () = assert!(mem::size_of::<BlockDescriptor>() == 0x40);
const _: () = assert!(mem::size_of::<BlockStateDescriptor>() == 0x20);
const _: () = assert!(mem::size_of::<SegbmapFragmentHeader>() == 0x20);
const _: () = assert!(mem::size_of::<PebDescriptor>() == 0x08);
const _: () = assert!(mem::size_of::<PebTableFragmentHeader>() == 0x120);
const _: () = assert!(mem::size_of::<LebDescriptor>() == 0x04);
const _: () = assert!(mem::size_of::<LebTableFragmentHeader>() == 0x20);
const _: () = assert!(mem::size_of::<MaptblCacheHeader>() == 0x20);
const _: () = assert!(mem::size_of::<MaptblCachePebState>() == 0x04);
const _: () = assert!(mem::size_of::<BtreeNodeHeader>() == 0x40);

/// Fills a signature with the common magic, the given key and the current
/// format revision.
pub fn set_signature(sig: &mut Signature, key: u16) {
    sig.common = SUPER_MAGIC.into();
    sig.key = key.into();
    sig.version.major = MAJOR_REVISION;
    sig.version.minor = MINOR_REVISION;
}

/// CRC32 of `data` as stored on disk (bitwise NOT of the IEEE checksum).
pub fn crc32_le(data: &[u8]) -> u32 {
    !crc32fast::hash(data)
}

/// Views a packed record as its raw bytes.
pub fn reinterpret<T>(val: &T) -> &[u8] {
    unsafe { slice::from_raw_parts(val as *const T as *const u8, mem::size_of::<T>()) }
}

/// Views a packed record at `offset` inside `buf`.
///
/// `T` must be `#[repr(C, packed)]` so any byte offset is properly aligned.
pub fn cast<T>(buf: &[u8], offset: usize) -> &T {
    assert!(offset + mem::size_of::<T>() <= buf.len());
    unsafe { &*(buf.as_ptr().add(offset) as *const T) }
}

/// Mutable counterpart of [`cast`].
pub fn cast_mut<T>(buf: &mut [u8], offset: usize) -> &mut T {
    assert!(offset + mem::size_of::<T>() <= buf.len());
    unsafe { &mut *(buf.as_mut_ptr().add(offset) as *mut T) }
}

/// Seals the metadata check embedded at `check_offset` inside `record`:
/// stores the covered byte count and the CRC32 flag, then the checksum of
/// `record[..bytes]` computed with the checksum field zeroed.
pub fn seal_record(record: &mut [u8], check_offset: usize, bytes: u16) {
    {
        let check: &mut MetadataCheck = cast_mut(record, check_offset);
        check.bytes = bytes.into();
        check.flags = CHECK_CRC32.into();
        check.csum = 0u32.into();
    }
    let csum = crc32_le(&record[..bytes as usize]);
    let check: &mut MetadataCheck = cast_mut(record, check_offset);
    check.csum = csum.into();
}

/// Recomputes the checksum of a sealed record and compares it with the
/// stored value.
pub fn record_csum_valid(record: &[u8], check_offset: usize) -> bool {
    let check: &MetadataCheck = cast(record, check_offset);
    let bytes = u16::from(check.bytes) as usize;
    let stored = u32::from(check.csum);
    if bytes > record.len() {
        return false;
    }

    let mut copy = record[..bytes].to_vec();
    let check: &mut MetadataCheck = cast_mut(&mut copy, check_offset);
    check.csum = 0u32.into();
    crc32_le(&copy) == stored
}

#[cfg(test)]
mod test {
    use super::*;
    use std::ptr::addr_of;

    macro_rules! offset_of {
        ($val:expr, $field:ident) => {
            (addr_of!($val.$field) as usize) - (addr_of!($val) as usize)
        };
    }

    #[test]
    fn volume_header_field_offsets() {
        let vh: VolumeHeader = unsafe { mem::zeroed() };

        assert_eq!(offset_of!(vh, check), 0x08);
        assert_eq!(offset_of!(vh, log_pagesize), 0x10);
        assert_eq!(offset_of!(vh, create_time), 0x18);
        assert_eq!(offset_of!(vh, sb_pebs), 0x30);
        assert_eq!(offset_of!(vh, segbmap), 0xB0);
        assert_eq!(offset_of!(vh, maptbl), 0x140);
        assert_eq!(offset_of!(vh, sb_seg_log_pages), 0x1D0);
        assert_eq!(offset_of!(vh, dentries_btree), 0x1E0);
        assert_eq!(offset_of!(vh, extents_btree), 0x200);
        assert_eq!(offset_of!(vh, xattr_btree), 0x220);
        assert_eq!(offset_of!(vh, invextree), 0x240);
        assert_eq!(offset_of!(vh, uuid), 0x2C0);
        assert_eq!(offset_of!(vh, reserved4), 0x2D0);
    }

    #[test]
    fn volume_state_field_offsets() {
        let vs: VolumeState = unsafe { mem::zeroed() };

        assert_eq!(offset_of!(vs, nsegs), 0x10);
        assert_eq!(offset_of!(vs, timestamp), 0x20);
        assert_eq!(offset_of!(vs, flags), 0x30);
        assert_eq!(offset_of!(vs, feature_compat), 0x38);
        assert_eq!(offset_of!(vs, uuid), 0x50);
        assert_eq!(offset_of!(vs, label), 0x60);
        assert_eq!(offset_of!(vs, cur_segs), 0x70);
        assert_eq!(offset_of!(vs, migration_threshold), 0x98);
        assert_eq!(offset_of!(vs, blkbmap), 0x9C);
        assert_eq!(offset_of!(vs, user_data), 0xA4);
        assert_eq!(offset_of!(vs, open_zones), 0xAC);
        assert_eq!(offset_of!(vs, root_folder), 0xB0);
        assert_eq!(offset_of!(vs, inodes_btree), 0x200);
        assert_eq!(offset_of!(vs, shared_extents_btree), 0x280);
        assert_eq!(offset_of!(vs, shared_dict_btree), 0x300);
        assert_eq!(offset_of!(vs, snapshots_btree), 0x380);
    }

    #[test]
    fn segment_header_field_offsets() {
        let hdr: SegmentHeader = unsafe { mem::zeroed() };

        assert_eq!(offset_of!(hdr, timestamp), 0x400);
        assert_eq!(offset_of!(hdr, log_pages), 0x410);
        assert_eq!(offset_of!(hdr, desc_array), 0x418);
        assert_eq!(offset_of!(hdr, peb_migration_id), 0x4A8);
        assert_eq!(offset_of!(hdr, peb_create_time), 0x4B0);
        assert_eq!(offset_of!(hdr, seg_id), 0x4B8);
        assert_eq!(offset_of!(hdr, payload), 0x4D8);
    }

    #[test]
    fn partial_log_header_field_offsets() {
        let plh: PartialLogHeader = unsafe { mem::zeroed() };

        assert_eq!(offset_of!(plh, log_pages), 0x20);
        assert_eq!(offset_of!(plh, desc_array), 0x30);
        assert_eq!(offset_of!(plh, nsegs), 0xC0);
        assert_eq!(offset_of!(plh, root_folder), 0xD0);
        assert_eq!(offset_of!(plh, inodes_btree), 0x1D0);
        assert_eq!(offset_of!(plh, sequence_id), 0x350);
        assert_eq!(offset_of!(plh, snapshots_btree), 0x360);
        assert_eq!(offset_of!(plh, open_zones), 0x3E0);
        assert_eq!(offset_of!(plh, invextree), 0x400);
        assert_eq!(offset_of!(plh, seg_id), 0x480);
        assert_eq!(offset_of!(plh, uuid), 0x4A0);
        assert_eq!(offset_of!(plh, volume_create_time), 0x4B0);
    }

    #[test]
    fn log_footer_field_offsets() {
        let footer: LogFooter = unsafe { mem::zeroed() };

        assert_eq!(offset_of!(footer, timestamp), 0x400);
        assert_eq!(offset_of!(footer, log_bytes), 0x410);
        assert_eq!(offset_of!(footer, desc_array), 0x420);
        assert_eq!(offset_of!(footer, peb_create_time), 0x450);
        assert_eq!(offset_of!(footer, payload), 0x458);
    }

    #[test]
    fn seal_and_verify_round_trip() {
        let mut record = vec![0u8; 0x40];
        record[0x20..0x30].copy_from_slice(&[0xAB; 0x10]);

        seal_record(&mut record, 0x08, 0x40);
        assert!(record_csum_valid(&record, 0x08));

        // A single flipped payload byte must break the checksum.
        record[0x21] ^= 0x01;
        assert!(!record_csum_valid(&record, 0x08));
    }

    #[test]
    fn checksum_matches_inverted_crc32() {
        let data = b"emberfs";
        assert_eq!(crc32_le(data), !crc32fast::hash(data));
    }

    #[test]
    fn reserved_bytes_stay_zero_after_zeroed_init() {
        let vh: VolumeHeader = unsafe { mem::zeroed() };
        assert!(reinterpret(&vh).iter().all(|b| *b == 0));
    }
}
