//! Superblock subsystem.
//!
//! Prepares the two canonical records of the volume (volume header and volume
//! state): geometry, feature flags, the btree descriptors, the inline root
//! nodes of the inodes / shared extents / shared dictionary / snapshots /
//! invalidated extents trees and the empty root folder. Owns the superblock
//! segment chain and commits the logs of its current slots.

use crate::compression::CompressionType;
use crate::error::{Error, Result};
use crate::layout::*;
use crate::log;
use crate::mkfs_dbg;
use crate::mkfs_err;
use crate::mkfs_warn;
use crate::ondisk::*;
use crate::verify_internal;
use std::mem;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use uuid::Uuid;

/// Default minimal index area: one full node header of the concrete trees.
const BTREE_NODE_HEADER_SIZE: u16 = 0x100;

/// On-disk snapshot records are the snapshots tree's items.
const SNAPSHOT_ITEM_SIZE: u16 = 0x40;

pub struct SuperblockOps;

pub static SUPERBLOCK_OPS: SuperblockOps = SuperblockOps;

/// Current time in nanoseconds since the epoch.
pub fn current_time_in_nanoseconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs().saturating_mul(1_000_000_000))
        .unwrap_or(0)
}

fn floor_log2(value: u64) -> u8 {
    debug_assert!(value != 0);
    (63 - value.leading_zeros() as u64) as u8
}

fn define_compression_option(layout: &mut VolumeLayout) {
    let mut feature_compat_ro = u64::from(layout.sb.vs.feature_compat_ro);

    match layout.compression {
        CompressionType::Zlib => feature_compat_ro |= ZLIB_COMPAT_RO_FLAG,
        CompressionType::Lzo => feature_compat_ro |= LZO_COMPAT_RO_FLAG,
        _ => {}
    }

    layout.sb.vs.feature_compat_ro = feature_compat_ro.into();
}

fn prepare_block_bitmap_options(layout: &mut VolumeLayout) -> Result<()> {
    let mut flags = 0u16;
    let mut compression = BLK_BMAP_NOCOMPR_TYPE;

    if layout.blkbmap.has_backup_copy {
        flags |= BLK_BMAP_CREATE_COPY;
    }

    match layout.blkbmap.compression {
        CompressionType::None => {}
        CompressionType::Zlib => {
            flags |= BLK_BMAP_MAKE_COMPRESSION;
            compression = BLK_BMAP_ZLIB_COMPR_TYPE;
        }
        CompressionType::Lzo => {
            flags |= BLK_BMAP_MAKE_COMPRESSION;
            compression = BLK_BMAP_LZO_COMPR_TYPE;
        }
        CompressionType::Unknown => {
            mkfs_err!("invalid compression type");
            return Err(Error::invalid("block bitmap compression is not selected"));
        }
    }

    layout.sb.vs.blkbmap.flags = flags.into();
    layout.sb.vs.blkbmap.compression = compression;

    Ok(())
}

fn prepare_blk2off_table_options(layout: &mut VolumeLayout) -> Result<()> {
    let mut flags = 0u16;
    let mut compression = BLK2OFF_TBL_NOCOMPR_TYPE;

    if layout.blk2off_tbl.has_backup_copy {
        flags |= BLK2OFF_TBL_CREATE_COPY;
    }

    match layout.blk2off_tbl.compression {
        CompressionType::None => {}
        CompressionType::Zlib => {
            flags |= BLK2OFF_TBL_MAKE_COMPRESSION;
            compression = BLK2OFF_TBL_ZLIB_COMPR_TYPE;
        }
        CompressionType::Lzo => {
            flags |= BLK2OFF_TBL_MAKE_COMPRESSION;
            compression = BLK2OFF_TBL_LZO_COMPR_TYPE;
        }
        CompressionType::Unknown => {
            mkfs_err!("invalid compression type");
            return Err(Error::invalid("offset table compression is not selected"));
        }
    }

    layout.sb.vs.blk2off_tbl.flags = flags.into();
    layout.sb.vs.blk2off_tbl.compression = compression;

    Ok(())
}

/// Fills the user data options of the volume state.
pub fn prepare_user_data_options(layout: &mut VolumeLayout) -> Result<()> {
    let mut flags = 0u16;
    let mut compression = USER_DATA_NOCOMPR_TYPE;

    match layout.user_data_seg.compression {
        CompressionType::None => {}
        CompressionType::Zlib => {
            flags |= USER_DATA_MAKE_COMPRESSION;
            compression = USER_DATA_ZLIB_COMPR_TYPE;
        }
        CompressionType::Lzo => {
            flags |= USER_DATA_MAKE_COMPRESSION;
            compression = USER_DATA_LZO_COMPR_TYPE;
        }
        CompressionType::Unknown => {
            mkfs_err!("invalid compression type");
            return Err(Error::invalid("user data compression is not selected"));
        }
    }

    layout.sb.vs.user_data.flags = flags.into();
    layout.sb.vs.user_data.compression = compression;
    layout.sb.vs.user_data.migration_threshold = layout.user_data_seg.migration_threshold.into();

    Ok(())
}

/// Derives the full-log size of one btree node segment kind.
fn node_seg_log_pages(layout: &VolumeLayout, configured: u16) -> u16 {
    let pages_per_peb = layout.pages_per_peb();
    let upper = pages_per_peb.min(LOG_MAX_PAGES);

    let mut log_pages = if configured == u16::MAX {
        upper
    } else if configured as u32 > pages_per_peb {
        mkfs_warn!("log_pages is corrected from {} to {}", configured, upper);
        upper
    } else {
        if pages_per_peb % configured as u32 != 0 {
            mkfs_warn!("pages_per_peb {}, log_pages {}", pages_per_peb, configured);
        }
        configured as u32
    };

    let log_pages_default = (pages_per_peb / LOGS_PER_PEB_DEFAULT).max(1);
    log_pages = log_pages.max(log_pages_default);
    log_pages = log_pages.min(LOG_MAX_PAGES);

    log_pages as u16
}

struct BtreeDescParams {
    magic: u32,
    kind: u8,
    flags: u16,
    item_size: u16,
    default_min_index_area: u16,
}

fn prepare_btree_descriptor(layout: &mut VolumeLayout, params: &BtreeDescParams) -> Result<BtreeDescriptor> {
    let erasesize = layout.env.erase_size;
    let pagesize = layout.page_size;
    let node_ptr_size = mem::size_of::<BtreeIndexKey>() as u16;

    let mut node_size = layout.btree.node_size;

    if node_size == 0 || node_size >= u16::MAX as u32 * 2 {
        mkfs_err!("invalid option: node_size {node_size}");
        return Err(Error::invalid("invalid btree node size"));
    }

    if node_size < pagesize || node_size % pagesize != 0 {
        mkfs_warn!("node_size is corrected from {} to {}", node_size, pagesize);
        layout.btree.node_size = pagesize;
        node_size = pagesize;
    }

    if node_size >= erasesize || erasesize % node_size != 0 {
        mkfs_err!("invalid option: node_size {node_size}, erasesize {erasesize}");
        return Err(Error::invalid("btree node size does not divide the erase size"));
    }

    let log_node_size = crate::log2(node_size as u64)
        .ok_or_else(|| Error::invalid("btree node size is not a power of two"))?;

    let mut min_index_area_size = layout.btree.min_index_area_size;
    if min_index_area_size == 0 {
        min_index_area_size = params.default_min_index_area;
    }

    if min_index_area_size <= node_ptr_size || min_index_area_size % node_ptr_size != 0 {
        mkfs_err!(
            "invalid option: min_index_area_size {min_index_area_size}, node_ptr_size {node_ptr_size}"
        );
        return Err(Error::invalid("invalid minimal index area size"));
    }

    if min_index_area_size as u32 >= node_size / 2 {
        mkfs_err!("invalid option: min_index_area_size {min_index_area_size}, node_size {node_size}");
        return Err(Error::invalid("minimal index area does not fit the node"));
    }

    let mut desc: BtreeDescriptor = unsafe { mem::zeroed() };
    desc.magic = params.magic.into();
    desc.flags = params.flags.into();
    desc.kind = params.kind;
    desc.log_node_size = log_node_size as u8;
    desc.pages_per_node = (node_size / pagesize) as u8;
    desc.node_ptr_size = node_ptr_size as u8;
    desc.index_size = node_ptr_size.into();
    desc.item_size = params.item_size.into();
    desc.index_area_min_size = min_index_area_size.into();

    mkfs_dbg!(
        layout.env.show_debug,
        "btree descriptor: kind {:#x}, node_size {}, item_size {}, min_index_area_size {}",
        params.kind,
        node_size,
        params.item_size,
        min_index_area_size
    );

    Ok(desc)
}

fn prepare_empty_root_node(root_node: &mut BtreeInlineRootNode) {
    root_node.header.height = BTREE_LEAF_NODE_HEIGHT;
    root_node.header.items_count = 0;
    root_node.header.flags = 0;
    root_node.header.node_type = BTREE_ROOT_NODE;
    root_node.header.upper_node_id = BTREE_ROOT_NODE_ID.into();
    root_node.header.node_ids[0] = u32::MAX.into();
    root_node.header.node_ids[1] = u32::MAX.into();
}

fn prepare_root_folder(layout: &mut VolumeLayout) {
    let creation_time = layout.create_timestamp / 1_000_000_000;
    let page_size = layout.page_size;

    let root_folder = &mut layout.sb.vs.root_folder;

    root_folder.magic = INODE_MAGIC.into();
    root_folder.mode = (S_IFDIR | 0o755).into();
    root_folder.flags = 0u32.into();

    root_folder.uid = unsafe { libc::getuid() }.into();
    root_folder.gid = unsafe { libc::getgid() }.into();

    root_folder.atime = creation_time.into();
    root_folder.ctime = creation_time.into();
    root_folder.mtime = creation_time.into();
    root_folder.birthtime = creation_time.into();

    root_folder.atime_nsec = 0u32.into();
    root_folder.ctime_nsec = 0u32.into();
    root_folder.mtime_nsec = 0u32.into();
    root_folder.birthtime_nsec = 0u32.into();

    root_folder.generation = 0u64.into();
    root_folder.size = (page_size as u64).into();
    root_folder.blocks = 1u64.into();
    root_folder.parent_ino = ROOT_INO.into();

    root_folder.refcount = 2u32.into();

    root_folder.ino = ROOT_INO.into();
    root_folder.hash_code = 0u64.into();
    root_folder.name_len = 0u16.into();
    root_folder.private_flags = INODE_HAS_INLINE_DENTRIES.into();
    root_folder.count_of = 2u32.into();

    let dentry = &mut root_folder.internal.area1.array[0];
    dentry.ino = ROOT_INO.into();
    dentry.hash_code = 0u64.into();
    dentry.name_len = 1;
    dentry.dentry_type = INLINE_DENTRY;
    dentry.file_type = FT_DIR;
    dentry.flags = 0;
    dentry.inline_string = *b".\0\0\0\0\0\0\0\0\0\0\0";

    let dentry = &mut root_folder.internal.area1.array[1];
    dentry.ino = ROOT_INO.into();
    dentry.hash_code = 0u64.into();
    dentry.name_len = 2;
    dentry.dentry_type = INLINE_DENTRY;
    dentry.file_type = FT_DIR;
    dentry.flags = 0;
    dentry.inline_string = *b"..\0\0\0\0\0\0\0\0\0\0";

    root_folder.checksum = 0u32.into();
    let checksum = crc32_le(reinterpret(&layout.sb.vs.root_folder));
    layout.sb.vs.root_folder.checksum = checksum.into();
}

fn prepare_inodes_btree(layout: &mut VolumeLayout) -> Result<()> {
    let inode_size = layout.inode_size;

    let desc = prepare_btree_descriptor(
        layout,
        &BtreeDescParams {
            magic: INODES_BTREE_MAGIC,
            kind: INODES_BTREE,
            flags: 0,
            item_size: inode_size,
            default_min_index_area: inode_size,
        },
    )?;

    let tree = &mut layout.sb.vs.inodes_btree;
    *tree = unsafe { mem::zeroed() };

    tree.desc = desc;
    tree.allocated_inodes = 1u64.into();
    tree.free_inodes = 0u64.into();
    tree.inodes_capacity = 1u64.into();
    tree.leaf_nodes = 0u32.into();
    // The fresh tree consists of the root node alone.
    tree.nodes_count = 1u32.into();
    tree.upper_allocated_ino = ROOT_INO.into();

    prepare_empty_root_node(&mut tree.root_node);
    prepare_root_folder(layout);

    let feature_compat = u64::from(layout.sb.vs.feature_compat) | HAS_INODES_TREE_COMPAT_FLAG;
    layout.sb.vs.feature_compat = feature_compat.into();

    Ok(())
}

fn prepare_shared_extents_btree(layout: &mut VolumeLayout) -> Result<()> {
    let desc = prepare_btree_descriptor(
        layout,
        &BtreeDescParams {
            magic: SHARED_EXTENTS_BTREE_MAGIC,
            kind: SHARED_EXTENTS_BTREE,
            flags: BTREE_DESC_INDEX_AREA_RESIZABLE,
            item_size: mem::size_of::<RawFork>() as u16,
            default_min_index_area: BTREE_NODE_HEADER_SIZE,
        },
    )?;

    let tree = &mut layout.sb.vs.shared_extents_btree;
    *tree = unsafe { mem::zeroed() };
    tree.desc = desc;
    prepare_empty_root_node(&mut tree.root_node);

    let feature_compat = u64::from(layout.sb.vs.feature_compat) | HAS_SHARED_EXTENTS_COMPAT_FLAG;
    layout.sb.vs.feature_compat = feature_compat.into();

    Ok(())
}

fn prepare_shared_dict_btree(layout: &mut VolumeLayout) -> Result<()> {
    let desc = prepare_btree_descriptor(
        layout,
        &BtreeDescParams {
            magic: SHARED_DICT_BTREE_MAGIC,
            kind: SHARED_DICTIONARY_BTREE,
            flags: BTREE_DESC_INDEX_AREA_RESIZABLE,
            item_size: MAX_NAME_LEN as u16,
            default_min_index_area: BTREE_NODE_HEADER_SIZE,
        },
    )?;

    let tree = &mut layout.sb.vs.shared_dict_btree;
    *tree = unsafe { mem::zeroed() };
    tree.desc = desc;
    prepare_empty_root_node(&mut tree.root_node);

    let feature_compat = u64::from(layout.sb.vs.feature_compat) | HAS_SHARED_DICT_COMPAT_FLAG;
    layout.sb.vs.feature_compat = feature_compat.into();

    Ok(())
}

fn prepare_snapshots_btree(layout: &mut VolumeLayout) -> Result<()> {
    let desc = prepare_btree_descriptor(
        layout,
        &BtreeDescParams {
            magic: SNAPSHOTS_BTREE_MAGIC,
            kind: SNAPSHOTS_BTREE,
            flags: BTREE_DESC_INDEX_AREA_RESIZABLE,
            item_size: SNAPSHOT_ITEM_SIZE,
            default_min_index_area: BTREE_NODE_HEADER_SIZE,
        },
    )?;

    let tree = &mut layout.sb.vs.snapshots_btree;
    *tree = unsafe { mem::zeroed() };
    tree.desc = desc;
    prepare_empty_root_node(&mut tree.root_node);

    let feature_compat = u64::from(layout.sb.vs.feature_compat) | HAS_SNAPSHOTS_TREE_COMPAT_FLAG;
    layout.sb.vs.feature_compat = feature_compat.into();

    Ok(())
}

fn prepare_invext_btree(layout: &mut VolumeLayout) -> Result<()> {
    let desc = prepare_btree_descriptor(
        layout,
        &BtreeDescParams {
            magic: INVEXT_BTREE_MAGIC,
            kind: INVALIDATED_EXTENTS_BTREE,
            flags: BTREE_DESC_INDEX_AREA_RESIZABLE,
            item_size: mem::size_of::<RawExtent>() as u16,
            default_min_index_area: BTREE_NODE_HEADER_SIZE,
        },
    )?;

    let tree = &mut layout.sb.vh.invextree;
    *tree = unsafe { mem::zeroed() };
    tree.desc = desc;
    prepare_empty_root_node(&mut tree.root_node);

    let feature_compat = u64::from(layout.sb.vs.feature_compat) | HAS_INVALID_EXTENTS_TREE_COMPAT_FLAG;
    layout.sb.vs.feature_compat = feature_compat.into();

    Ok(())
}

fn sb_request(layout: &VolumeLayout) -> Result<MetadataSegRequest> {
    let request = layout.meta_array[MetaIndex::Superblock as usize];

    if request.segs_count == 0 || request.segs_count > SB_CHAIN_MAX * SB_SEG_COPY_MAX {
        mkfs_err!("invalid segs_count {}", request.segs_count);
        return Err(Error::internal("superblock chain is not reserved"));
    }

    match request.start_seg_index {
        Some(index) if index < layout.segs.len() => Ok(request),
        _ => Err(Error::internal("superblock segments are not reserved")),
    }
}

fn sb_set_log_pages(layout: &mut VolumeLayout, blks: u32) -> Result<()> {
    mkfs_dbg!(layout.env.show_debug, "log_pages {}, blks_count {}", layout.sb.log_pages, blks);

    verify_internal!(blks != 0 && blks < u16::MAX as u32, "invalid sb log size {blks}");

    let pages_per_peb = layout.pages_per_peb();
    let blks = blks.min(LOG_MAX_PAGES);

    verify_internal!(
        blks / 2 <= pages_per_peb,
        "sb log of {} pages cannot fit a PEB of {} pages",
        blks,
        pages_per_peb
    );

    if pages_per_peb % blks != 0 {
        mkfs_warn!("pages_per_peb {}, blks {}", pages_per_peb, blks);
    }

    layout.sb.log_pages = blks as u16;
    layout.sb.vh.sb_seg_log_pages = (blks as u16).into();

    Ok(())
}

impl MetadataOps for SuperblockOps {
    fn allocation_policy(&self, layout: &mut VolumeLayout) -> Result<Option<(SegmentPolicy, usize)>> {
        let segs = (RESERVED_SB_SEG + 1) * SB_SEG_COPY_MAX;

        layout.meta_array[MetaIndex::Superblock as usize].segs_count = segs;
        layout.meta_array[MetaIndex::Superblock as usize].seg_state = Some(SegmentPolicy::Dedicated);

        mkfs_dbg!(layout.env.show_debug, "superblock segs {segs}");

        Ok(Some((SegmentPolicy::Dedicated, segs)))
    }

    fn prepare(&self, layout: &mut VolumeLayout) -> Result<()> {
        reserve_segments(layout, MetaIndex::Superblock)?;

        let ctime = current_time_in_nanoseconds();
        layout.create_timestamp = ctime;
        layout.create_cno = 0;

        let pagesize = layout.page_size;
        let segsize = layout.seg_size;
        let erasesize = layout.env.erase_size;

        let pebs_per_seg = layout.pebs_per_seg();
        if pebs_per_seg >= u16::MAX as u32 {
            mkfs_err!("unsupported value: pebs_per_seg {pebs_per_seg}");
            return Err(Error::invalid("too many erase blocks per segment"));
        }

        let megabytes_per_peb = erasesize as u64 / crate::SIZE_1MB;
        if megabytes_per_peb >= u16::MAX as u64 {
            mkfs_err!("unsupported value: megabytes_per_peb {megabytes_per_peb}");
            return Err(Error::invalid("erase block is too large"));
        }

        /* volume header initialization */
        {
            let vh = &mut layout.sb.vh;
            // The key magic is stamped when the header lands in a log.
            set_signature(&mut vh.magic, 0);

            vh.log_pagesize = floor_log2(pagesize as u64);
            vh.log_segsize = floor_log2(segsize);
            vh.log_erasesize = floor_log2(erasesize as u64);
            vh.log_pebs_per_seg = floor_log2(pebs_per_seg.max(1) as u64);
            vh.megabytes_per_peb = (megabytes_per_peb as u16).into();
            vh.pebs_per_seg = (pebs_per_seg as u16).into();

            let mut flags = 0u32;
            if layout.env.device_type == crate::device::DeviceType::Zoned {
                flags |= VH_ZNS_BASED_VOLUME;
                if 1u64 << vh.log_erasesize != erasesize as u64 {
                    flags |= VH_UNALIGNED_ZONE;
                }
            }
            vh.flags = flags.into();

            vh.lebs_per_peb_index = layout.lebs_per_peb_index.into();

            let create_threads_per_seg = layout.nand_dies_count.min(pebs_per_seg);
            verify_internal!(
                create_threads_per_seg < u16::MAX as u32,
                "invalid create_threads_per_seg {create_threads_per_seg}"
            );
            vh.create_threads_per_seg = (create_threads_per_seg as u16).into();

            vh.create_time = ctime.into();
            vh.create_cno = 0u64.into();
        }

        layout.sb.vh.lnodes_seg_log_pages =
            node_seg_log_pages(layout, layout.btree.lnode_log_pages).into();
        layout.btree.lnode_log_pages = u16::from(layout.sb.vh.lnodes_seg_log_pages);
        layout.sb.vh.hnodes_seg_log_pages =
            node_seg_log_pages(layout, layout.btree.hnode_log_pages).into();
        layout.btree.hnode_log_pages = u16::from(layout.sb.vh.hnodes_seg_log_pages);
        layout.sb.vh.inodes_seg_log_pages =
            node_seg_log_pages(layout, layout.btree.inode_log_pages).into();
        layout.btree.inode_log_pages = u16::from(layout.sb.vh.inodes_seg_log_pages);

        layout.sb.vh.dentries_btree.desc = prepare_btree_descriptor(
            layout,
            &BtreeDescParams {
                magic: DENTRIES_BTREE_MAGIC,
                kind: DENTRIES_BTREE,
                flags: BTREE_DESC_INDEX_AREA_RESIZABLE,
                item_size: mem::size_of::<DirEntry>() as u16,
                default_min_index_area: BTREE_NODE_HEADER_SIZE,
            },
        )?;

        layout.sb.vh.extents_btree.desc = prepare_btree_descriptor(
            layout,
            &BtreeDescParams {
                magic: EXTENTS_BTREE_MAGIC,
                kind: EXTENTS_BTREE,
                flags: BTREE_DESC_INDEX_AREA_RESIZABLE,
                item_size: mem::size_of::<RawFork>() as u16,
                default_min_index_area: BTREE_NODE_HEADER_SIZE,
            },
        )?;

        layout.sb.vh.xattr_btree.desc = prepare_btree_descriptor(
            layout,
            &BtreeDescParams {
                magic: XATTR_BTREE_MAGIC,
                kind: XATTR_BTREE,
                flags: BTREE_DESC_INDEX_AREA_RESIZABLE,
                item_size: mem::size_of::<XattrEntry>() as u16,
                default_min_index_area: BTREE_NODE_HEADER_SIZE,
            },
        )?;

        /* volume state initialization */
        {
            let nsegs = layout.fs_segs_count();
            let migration_threshold = layout.migration_threshold;
            let label = layout.volume_label;

            let vs = &mut layout.sb.vs;
            set_signature(&mut vs.magic, 0);

            vs.nsegs = nsegs.into();
            vs.timestamp = ctime.into();
            vs.cno = 0u64.into();

            vs.flags = HAS_INLINE_INODES_TREE.into();
            vs.state = VALID_FS.into();
            vs.errors = ERRORS_DEFAULT.into();

            vs.uuid = *Uuid::new_v4().as_bytes();
            vs.label = label;

            for slot in 0..CUR_SEGS_COUNT {
                vs.cur_segs[slot] = u64::MAX.into();
            }

            vs.migration_threshold = migration_threshold.into();
        }

        define_compression_option(layout);
        prepare_block_bitmap_options(layout)?;
        prepare_blk2off_table_options(layout)?;

        prepare_inodes_btree(layout)?;
        prepare_shared_extents_btree(layout)?;
        prepare_shared_dict_btree(layout)?;
        prepare_snapshots_btree(layout)?;
        prepare_invext_btree(layout)?;

        Ok(())
    }

    fn validate(&self, layout: &mut VolumeLayout) -> Result<()> {
        let segs_count = layout.fs_segs_count();
        let free_segs = segs_count - layout.segs.len() as u64;
        let pages_per_seg = layout.seg_size / layout.page_size as u64;

        layout.sb.vs.free_pages = (free_segs * pages_per_seg).into();

        mkfs_dbg!(layout.env.show_debug, "free pages {}", free_segs * pages_per_seg);

        Ok(())
    }

    fn define_layout(&self, layout: &mut VolumeLayout) -> Result<()> {
        let request = sb_request(layout)?;
        let fragments = layout.maptbl_cache.fragments_count;
        let fragment_size = layout.maptbl_cache.fragment_size;
        let page_size = layout.page_size;
        let mut log_pages = 0u32;

        let mut seg_index = request.start_seg_index.unwrap_or(0);

        for chain_slot in 0..=RESERVED_SB_SEG {
            for _replica in 0..SB_SEG_COPY_MAX {
                if chain_slot != CUR_SB_SEG {
                    seg_index += 1;
                    continue;
                }

                layout.calculated_open_zones += 1;

                layout.segs[seg_index].pebs_count = 1;
                let peb_index = 0usize;

                {
                    let peb = &mut layout.segs[seg_index].pebs[peb_index];
                    log::set_extent_start_offset(page_size, peb, SEG_HEADER)?;
                }
                log::define_segment_header_layout(layout, seg_index, peb_index)?;

                {
                    let peb = &mut layout.segs[seg_index].pebs[peb_index];
                    log::set_extent_start_offset(page_size, peb, MAPTBL_CACHE)?;
                }

                // The cache fragments buffer is replicated into every current
                // sb log.
                let mut cache_buf = vec![0u8; (fragments * fragment_size) as usize];
                let mut cache_bytes = 0u32;
                for k in 0..fragments as usize {
                    let fragment = match layout.maptbl_cache.fragments_array[k].as_ref() {
                        Some(fragment) => fragment,
                        None => return Err(Error::internal("maptbl cache fragment is gone")),
                    };

                    let dst = k * fragment_size as usize;
                    cache_buf[dst..dst + fragment_size as usize].copy_from_slice(fragment);

                    let hdr: &MaptblCacheHeader = cast(fragment, 0);
                    cache_bytes += u16::from(hdr.bytes_count) as u32;
                }

                {
                    let peb = &mut layout.segs[seg_index].pebs[peb_index];
                    let extent = &mut peb.extents[MAPTBL_CACHE];
                    verify_internal!(extent.buf.is_none(), "maptbl cache extent is prepared twice");

                    extent.buf = Some(cache_buf);
                    extent.bytes_count = cache_bytes;

                    // A cache small enough rides inline right behind the
                    // segment header.
                    if cache_bytes <= log::inline_capacity() {
                        let hdr_extent_end = peb.extents[SEG_HEADER].offset
                            + peb.extents[SEG_HEADER].bytes_count;
                        peb.extents[MAPTBL_CACHE].offset = hdr_extent_end;
                    }
                }

                {
                    let peb = &mut layout.segs[seg_index].pebs[peb_index];
                    log::set_extent_start_offset(page_size, peb, LOG_FOOTER)?;
                }
                log::define_log_footer_layout(layout, seg_index, peb_index)?;

                let blks = {
                    let peb = &layout.segs[seg_index].pebs[peb_index];
                    log::calculate_log_pages(page_size, layout.env.erase_size, peb)?
                };
                log_pages = log_pages.max(blks);

                seg_index += 1;
            }
        }

        // The planner's cache buffers have been handed over.
        for fragment in layout.maptbl_cache.fragments_array.iter_mut() {
            *fragment = None;
        }

        sb_set_log_pages(layout, log_pages)
    }

    fn commit(&self, layout: &mut VolumeLayout) -> Result<()> {
        let request = sb_request(layout)?;
        let mut seg_index = request.start_seg_index.unwrap_or(0);

        for chain_slot in 0..(SB_CHAIN_MAX - 1) {
            for _replica in 0..SB_SEG_COPY_MAX {
                if chain_slot != CUR_SB_SEG {
                    seg_index += 1;
                    continue;
                }

                let peb_index = 0usize;

                log::pre_commit_segment_header(layout, seg_index, peb_index, SB_SEG_TYPE)?;
                log::pre_commit_log_footer(layout, seg_index, peb_index)?;

                let blks = {
                    let peb = &layout.segs[seg_index].pebs[peb_index];
                    log::calculate_log_pages(layout.page_size, layout.env.erase_size, peb)?
                };

                log::commit_log_footer(layout, seg_index, peb_index, blks)?;
                log::commit_segment_header(layout, seg_index, peb_index, blks)?;

                seg_index += 1;
            }
        }

        layout.segs_count += request.segs_count;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn prepared_layout() -> VolumeLayout {
        let mut layout = VolumeLayout::new();
        layout.env.fs_size = crate::SIZE_1GB;
        layout.env.erase_size = crate::SIZE_8MB as u32;
        layout.seg_size = crate::SIZE_8MB;
        layout.page_size = crate::SIZE_4KB as u32;
        layout.env.show_info = false;
        crate::layout::validate_key_creation_options(&mut layout).unwrap();
        crate::layout::alloc_segs_array(&mut layout).unwrap();
        SUPERBLOCK_OPS.allocation_policy(&mut layout).unwrap();
        layout
    }

    #[test]
    fn prepare_fills_the_volume_header() {
        let mut layout = prepared_layout();
        SUPERBLOCK_OPS.prepare(&mut layout).unwrap();

        let vh = layout.sb.vh;
        assert_eq!(vh.log_pagesize, 12);
        assert_eq!(vh.log_erasesize, 23);
        assert_eq!(vh.log_segsize, 23);
        assert_eq!(vh.log_pebs_per_seg, 0);
        assert_eq!(u16::from(vh.pebs_per_seg), 1);
        assert_eq!(u16::from(vh.megabytes_per_peb), 8);
        assert_eq!(u32::from(vh.lebs_per_peb_index), 1);
        // One PEB per segment bounds the creation threads.
        assert_eq!(u16::from(vh.create_threads_per_seg), 1);
        assert_eq!(u32::from(vh.flags), 0);

        let vs = layout.sb.vs;
        assert_eq!(u64::from(vs.nsegs), 128);
        assert_eq!(u16::from(vs.state), VALID_FS);
        assert_eq!(u16::from(vs.errors), ERRORS_DEFAULT);
        assert_ne!(vs.uuid, [0u8; UUID_SIZE]);
        for slot in 0..CUR_SEGS_COUNT {
            assert_eq!(u64::from(vs.cur_segs[slot]), u64::MAX);
        }

        // The default zlib selection lands in the read-only feature set and
        // in every per-subsystem option.
        assert_eq!(u64::from(vs.feature_compat_ro), ZLIB_COMPAT_RO_FLAG);
        assert_eq!(vs.blkbmap.compression, BLK_BMAP_ZLIB_COMPR_TYPE);
        assert_eq!(vs.blk2off_tbl.compression, BLK2OFF_TBL_ZLIB_COMPR_TYPE);

        let feature_compat = u64::from(vs.feature_compat);
        assert_ne!(feature_compat & HAS_INODES_TREE_COMPAT_FLAG, 0);
        assert_ne!(feature_compat & HAS_SHARED_EXTENTS_COMPAT_FLAG, 0);
        assert_ne!(feature_compat & HAS_SHARED_DICT_COMPAT_FLAG, 0);
        assert_ne!(feature_compat & HAS_SNAPSHOTS_TREE_COMPAT_FLAG, 0);
        assert_ne!(feature_compat & HAS_INVALID_EXTENTS_TREE_COMPAT_FLAG, 0);
    }

    #[test]
    fn root_folder_is_a_checksummed_directory() {
        let mut layout = prepared_layout();
        SUPERBLOCK_OPS.prepare(&mut layout).unwrap();

        let root = layout.sb.vs.root_folder;
        assert_eq!(u16::from(root.magic), INODE_MAGIC);
        assert_eq!(u16::from(root.mode), S_IFDIR | 0o755);
        assert_eq!(u64::from(root.ino), ROOT_INO);
        assert_eq!(u64::from(root.parent_ino), ROOT_INO);
        assert_eq!(u32::from(root.refcount), 2);
        assert_eq!(u16::from(root.private_flags), INODE_HAS_INLINE_DENTRIES);
        assert_eq!(u32::from(root.count_of), 2);

        let dot = root.internal.area1.array[0];
        assert_eq!(dot.name_len, 1);
        assert_eq!(dot.inline_string[0], b'.');
        let dotdot = root.internal.area1.array[1];
        assert_eq!(dotdot.name_len, 2);
        assert_eq!(&dotdot.inline_string[..2], b"..");

        // The checksum covers the whole record with the field zeroed.
        let mut copy = root;
        let stored = u32::from(copy.checksum);
        copy.checksum = 0u32.into();
        assert_eq!(crc32_le(reinterpret(&copy)), stored);
    }

    #[test]
    fn inodes_tree_accounts_the_root_alone() {
        let mut layout = prepared_layout();
        SUPERBLOCK_OPS.prepare(&mut layout).unwrap();

        let tree = layout.sb.vs.inodes_btree;
        assert_eq!(u64::from(tree.allocated_inodes), 1);
        assert_eq!(u64::from(tree.free_inodes), 0);
        assert_eq!(u64::from(tree.inodes_capacity), 1);
        assert_eq!(u32::from(tree.nodes_count), 1);
        assert_eq!(u64::from(tree.upper_allocated_ino), ROOT_INO);

        let header = tree.root_node.header;
        assert_eq!(header.height, BTREE_LEAF_NODE_HEIGHT);
        assert_eq!(header.items_count, 0);
        assert_eq!(header.node_type, BTREE_ROOT_NODE);
        assert_eq!(u32::from(header.upper_node_id), BTREE_ROOT_NODE_ID);
        assert_eq!(u32::from(header.node_ids[0]), u32::MAX);
        assert_eq!(u32::from(header.node_ids[1]), u32::MAX);
    }

    #[test]
    fn btree_descriptors_fix_the_node_geometry() {
        let mut layout = prepared_layout();
        SUPERBLOCK_OPS.prepare(&mut layout).unwrap();

        let desc = layout.sb.vh.dentries_btree.desc;
        assert_eq!(u32::from(desc.magic), DENTRIES_BTREE_MAGIC);
        assert_eq!(desc.kind, DENTRIES_BTREE);
        assert_eq!(desc.log_node_size, 13);
        assert_eq!(desc.pages_per_node, 2);
        assert_eq!(desc.node_ptr_size, 0x20);
        assert_eq!(u16::from(desc.index_size), 0x20);
        assert_eq!(u16::from(desc.item_size), 0x20);

        let desc = layout.sb.vh.extents_btree.desc;
        assert_eq!(u16::from(desc.item_size), 0x40);

        let desc = layout.sb.vs.shared_dict_btree.desc;
        assert_eq!(u16::from(desc.item_size), MAX_NAME_LEN as u16);

        let desc = layout.sb.vh.invextree.desc;
        assert_eq!(u16::from(desc.item_size), 0x10);
    }
}
