//! Common log builder.
//!
//! Given a PEB's role and the subset of extent slots it populates, this
//! module lays the extents out at valid offsets, builds the self-describing
//! log records (segment header, block bitmap, offset translation table,
//! block descriptor chain, footer or partial-log header) and computes every
//! cross-reference descriptor and checksum.

use crate::bitmap;
use crate::error::{Error, Result};
use crate::layout::*;
use crate::mkfs_dbg;
use crate::mkfs_err;
use crate::mkfs_warn;
use crate::ondisk::*;
use crate::verify_internal;
use crate::MEM_PAGE_SIZE;
use std::mem;

/// Bytes of a log's first memory page left after the segment header; a
/// mapping-table cache not larger than this rides inline behind the header.
pub fn inline_capacity() -> u32 {
    MEM_PAGE_SIZE - mem::size_of::<SegmentHeader>() as u32
}

/// Physical offset descriptors fitting into one table fragment.
pub fn off_desc_per_fragment() -> u32 {
    (MEM_PAGE_SIZE as usize - mem::size_of::<PhysOffsetTableHeader>()) as u32
        / mem::size_of::<PhysOffsetDescriptor>() as u32
}

/// Block descriptors fitting into one fragment of the descriptor chain.
pub fn blk_desc_per_fragment() -> u32 {
    (MEM_PAGE_SIZE as usize
        - mem::size_of::<BlockStateDescriptor>()
        - mem::size_of::<FragmentDesc>()) as u32
        / mem::size_of::<BlockDescriptor>() as u32
}

/// Fragments of the block descriptor chain needed for `blks_count` blocks.
pub fn blk_desc_table_fragments(blks_count: u32) -> u32 {
    let per_fragment = blk_desc_per_fragment();
    (blks_count + per_fragment - 1) / per_fragment
}

fn round_up(value: u32, granularity: u32) -> u32 {
    ((value + granularity - 1) / granularity) * granularity
}

/// Aligns an advertised full-log size: the result divides `pages_per_peb`
/// and leaves at least three pages of slack over the actually used `blks`,
/// unless the log grows to the whole PEB first.
pub fn align_full_log_pages(pages_per_peb: u32, blks: u32, configured: u16) -> u32 {
    let blks = blks.clamp(1, LOG_MAX_PAGES.max(pages_per_peb));

    let mut log_pages = if configured == u16::MAX {
        blks
    } else if (configured as u32) < blks {
        mkfs_warn!("log_pages is corrected from {} to {}", configured, blks);
        blks
    } else {
        if configured as u32 % blks != 0 {
            mkfs_warn!("log_pages {}, blks {}", configured, blks);
        }
        configured as u32
    };

    loop {
        while log_pages < pages_per_peb && pages_per_peb % log_pages != 0 {
            log_pages += 1;
        }

        if log_pages >= pages_per_peb {
            log_pages = pages_per_peb;
            break;
        }

        if log_pages - blks < 3 {
            log_pages += 3;
            continue;
        }

        break;
    }

    log_pages
}

/// Sets the start offset of extent `extent_index`: at or after the end of
/// every earlier non-empty extent, page-aligned from the maptbl cache slot
/// onward.
pub fn set_extent_start_offset(
    page_size: u32,
    peb: &mut PebContent,
    extent_index: usize,
) -> Result<()> {
    if extent_index >= SEG_LOG_ITEMS_COUNT {
        mkfs_err!("invalid extent_index {extent_index}");
        return Err(Error::invalid("invalid extent index"));
    }

    let mut offset = peb.extents[SEG_HEADER].offset;

    if extent_index >= BLOCK_BITMAP {
        offset += peb.extents[SEG_HEADER].bytes_count;
    }
    if extent_index >= OFFSET_TABLE {
        offset += peb.extents[BLOCK_BITMAP].bytes_count;
    }
    if extent_index >= BLOCK_DESCRIPTORS {
        offset += peb.extents[OFFSET_TABLE].bytes_count;
    }
    if extent_index >= MAPTBL_CACHE {
        offset += peb.extents[BLOCK_DESCRIPTORS].bytes_count;
    }

    if extent_index < MAPTBL_CACHE {
        peb.extents[extent_index].offset = offset;
        return Ok(());
    }

    offset = round_up(offset, page_size);

    if extent_index >= LOG_FOOTER {
        offset += peb.extents[LOG_PAYLOAD].bytes_count;
        offset = round_up(offset, page_size);
    }

    if extent_index >= LOG_PAYLOAD {
        let cache_bytes = peb.extents[MAPTBL_CACHE].bytes_count;
        if cache_bytes > inline_capacity() {
            offset += cache_bytes;
        }
        offset = round_up(offset, page_size);
    }

    if extent_index >= BLOCK_BITMAP_BACKUP {
        offset += peb.extents[LOG_FOOTER].bytes_count;
    }
    if extent_index >= OFFSET_TABLE_BACKUP {
        offset += peb.extents[BLOCK_BITMAP_BACKUP].bytes_count;
    }

    peb.extents[extent_index].offset = offset;

    Ok(())
}

/// Derives the number of pages the log occupies from the set extents.
pub fn calculate_log_pages(page_size: u32, erase_size: u32, peb: &PebContent) -> Result<u32> {
    let mut bytes_count = 0u32;

    bytes_count += peb.extents[SEG_HEADER].bytes_count;
    bytes_count += peb.extents[BLOCK_BITMAP].bytes_count;
    bytes_count += peb.extents[OFFSET_TABLE].bytes_count;
    bytes_count += peb.extents[BLOCK_DESCRIPTORS].bytes_count;

    let cache_bytes = peb.extents[MAPTBL_CACHE].bytes_count;
    if cache_bytes > inline_capacity() {
        bytes_count = round_up(bytes_count, page_size);
    }
    bytes_count += cache_bytes;

    bytes_count = round_up(bytes_count, page_size);
    bytes_count += peb.extents[LOG_PAYLOAD].bytes_count;

    bytes_count = round_up(bytes_count, page_size);
    bytes_count += peb.extents[LOG_FOOTER].bytes_count;
    bytes_count += peb.extents[BLOCK_BITMAP_BACKUP].bytes_count;
    bytes_count += peb.extents[OFFSET_TABLE_BACKUP].bytes_count;

    bytes_count += page_size - 1;
    verify_internal!(
        bytes_count <= erase_size,
        "log of {} bytes does not fit into erase block of {} bytes",
        bytes_count,
        erase_size
    );

    Ok(bytes_count / page_size)
}

/// Derives the number of metadata pages of the log (everything but the
/// payload).
pub fn calculate_metadata_blks(page_size: u32, erase_size: u32, peb: &PebContent) -> Result<u32> {
    let mut bytes_count = 0u32;

    bytes_count += peb.extents[SEG_HEADER].bytes_count;
    bytes_count += peb.extents[BLOCK_BITMAP].bytes_count;
    bytes_count += peb.extents[OFFSET_TABLE].bytes_count;
    bytes_count += peb.extents[BLOCK_DESCRIPTORS].bytes_count;

    bytes_count = round_up(bytes_count, page_size);
    bytes_count += peb.extents[MAPTBL_CACHE].bytes_count;

    bytes_count = round_up(bytes_count, page_size);
    bytes_count += peb.extents[LOG_FOOTER].bytes_count;
    bytes_count += peb.extents[BLOCK_BITMAP_BACKUP].bytes_count;
    bytes_count += peb.extents[OFFSET_TABLE_BACKUP].bytes_count;

    bytes_count += page_size - 1;
    verify_internal!(
        bytes_count <= erase_size,
        "metadata of {} bytes does not fit into erase block of {} bytes",
        bytes_count,
        erase_size
    );

    Ok(bytes_count / page_size)
}

fn check_indexes(layout: &VolumeLayout, seg_index: usize, peb_index: usize) -> Result<()> {
    if seg_index >= layout.segs.len() {
        mkfs_err!("seg_index {} >= segs_capacity {}", seg_index, layout.segs.len());
        return Err(Error::invalid("segment index out of range"));
    }
    if peb_index >= layout.segs[seg_index].pebs.len() {
        mkfs_err!(
            "peb_index {} >= pebs_capacity {}",
            peb_index,
            layout.segs[seg_index].pebs.len()
        );
        return Err(Error::invalid("PEB index out of range"));
    }
    Ok(())
}

/// Allocates the segment header extent.
pub fn define_segment_header_layout(
    layout: &mut VolumeLayout,
    seg_index: usize,
    peb_index: usize,
) -> Result<()> {
    check_indexes(layout, seg_index, peb_index)?;

    let hdr_len = mem::size_of::<SegmentHeader>();
    let extent = &mut layout.segs[seg_index].pebs[peb_index].extents[SEG_HEADER];

    verify_internal!(extent.buf.is_none(), "segment header extent is prepared twice");

    extent.buf = Some(vec![0u8; hdr_len]);
    extent.bytes_count = hdr_len as u32;

    Ok(())
}

/// Copies the current volume header into the segment header extent and stamps
/// the log's identity.
pub fn pre_commit_segment_header(
    layout: &mut VolumeLayout,
    seg_index: usize,
    peb_index: usize,
    seg_type: u16,
) -> Result<()> {
    check_indexes(layout, seg_index, peb_index)?;
    verify_internal!(seg_type <= LAST_KNOWN_SEG_TYPE, "unknown segment type {seg_type:#x}");

    let vh = layout.sb.vh;
    let timestamp = layout.create_timestamp;
    let cno = layout.create_cno;
    let seg_id = layout.segs[seg_index].seg_id;

    let peb = &mut layout.segs[seg_index].pebs[peb_index];
    let leb_id = peb.leb_id;
    let peb_id = peb.peb_id;
    let extent = &mut peb.extents[SEG_HEADER];

    let buf = match extent.buf.as_mut() {
        Some(buf) => buf,
        None => return Err(Error::internal("segment header extent is not allocated")),
    };

    buf[..mem::size_of::<VolumeHeader>()].copy_from_slice(reinterpret(&vh));

    let hdr: &mut SegmentHeader = cast_mut(buf, 0);
    hdr.volume_hdr.magic.key = SEGMENT_HDR_MAGIC.into();
    hdr.timestamp = timestamp.into();
    hdr.cno = cno.into();
    hdr.seg_type = seg_type.into();

    hdr.peb_migration_id[PREV_MIGRATING_PEB] = PEB_UNKNOWN_MIGRATION_ID;
    hdr.peb_migration_id[CUR_MIGRATING_PEB] = PEB_MIGRATION_ID_START;

    hdr.peb_create_time = timestamp.into();
    hdr.seg_id = seg_id.into();
    hdr.leb_id = leb_id.into();
    hdr.peb_id = peb_id.into();
    hdr.relation_peb_id = u64::MAX.into();

    Ok(())
}

fn prepare_blkbmap_metadata_descriptor(extent: &ExtentDesc) -> Result<MetadataDescriptor> {
    let buf = match extent.buf.as_ref() {
        Some(buf) => buf,
        None => return Err(Error::internal("block bitmap extent is not prepared")),
    };

    let bmp_hdr_size = mem::size_of::<BlockBitmapHeader>();
    let mut desc: MetadataDescriptor = unsafe { mem::zeroed() };

    desc.offset = extent.offset.into();
    desc.size = extent.bytes_count.into();
    desc.check.bytes = (bmp_hdr_size as u16).into();
    desc.check.flags = CHECK_CRC32.into();
    desc.check.csum = crc32_le(&buf[..bmp_hdr_size]).into();

    Ok(desc)
}

fn prepare_offset_table_metadata_descriptor(extent: &ExtentDesc) -> Result<MetadataDescriptor> {
    let buf = match extent.buf.as_ref() {
        Some(buf) => buf,
        None => return Err(Error::internal("offset table extent is not prepared")),
    };

    let hdr: &Blk2OffTableHeader = cast(buf, 0);
    let mut desc: MetadataDescriptor = unsafe { mem::zeroed() };

    desc.offset = extent.offset.into();
    desc.size = extent.bytes_count.into();
    desc.check = hdr.check;

    Ok(desc)
}

fn prepare_blk_desc_table_metadata_descriptor(extent: &ExtentDesc) -> Result<MetadataDescriptor> {
    let buf = match extent.buf.as_ref() {
        Some(buf) => buf,
        None => return Err(Error::internal("block descriptors extent is not prepared")),
    };

    let mut desc: MetadataDescriptor = unsafe { mem::zeroed() };

    desc.offset = extent.offset.into();
    desc.size = extent.bytes_count.into();
    desc.check.bytes = (extent.bytes_count as u16).into();
    desc.check.flags = CHECK_CRC32.into();
    desc.check.csum = crc32_le(&buf[..extent.bytes_count as usize]).into();

    Ok(desc)
}

fn prepare_payload_metadata_descriptor(extent: &ExtentDesc) -> Result<MetadataDescriptor> {
    let buf = match extent.buf.as_ref() {
        Some(buf) => buf,
        None => return Err(Error::internal("payload extent is not prepared")),
    };

    let mut desc: MetadataDescriptor = unsafe { mem::zeroed() };

    desc.offset = extent.offset.into();
    desc.size = extent.bytes_count.into();

    // Only the head of a large payload is covered by the descriptor's
    // checksum; the per-fragment checksums cover the rest.
    let covered = extent.bytes_count.min(MEM_PAGE_SIZE) as u16;
    desc.check.bytes = covered.into();
    desc.check.flags = CHECK_CRC32.into();
    desc.check.csum = crc32_le(&buf[..covered as usize]).into();

    Ok(desc)
}

fn prepare_maptbl_cache_metadata_descriptor(
    fragments_count: u32,
    fragment_size: u32,
    extent: &ExtentDesc,
) -> Result<MetadataDescriptor> {
    let buf = match extent.buf.as_ref() {
        Some(buf) => buf,
        None => return Err(Error::internal("maptbl cache extent is not prepared")),
    };

    let mut desc: MetadataDescriptor = unsafe { mem::zeroed() };
    desc.offset = extent.offset.into();
    desc.size = extent.bytes_count.into();

    // The cache checksum is the accumulator over every fragment's live bytes.
    let mut hasher = crc32fast::Hasher::new();
    let mut bytes_count = 0u32;

    for index in 0..fragments_count {
        let fragment_off = (index * fragment_size) as usize;
        let hdr: &MaptblCacheHeader = cast(buf, fragment_off);
        let size = u16::from(hdr.bytes_count) as usize;

        hasher.update(&buf[fragment_off..fragment_off + size]);
        bytes_count += size as u32;
    }

    verify_internal!(bytes_count < u16::MAX as u32, "maptbl cache is too large");

    desc.check.bytes = (bytes_count as u16).into();
    desc.check.flags = CHECK_CRC32.into();
    desc.check.csum = (!hasher.finalize()).into();

    Ok(desc)
}

fn prepare_footer_metadata_descriptor(extent: &ExtentDesc) -> Result<MetadataDescriptor> {
    let buf = match extent.buf.as_ref() {
        Some(buf) => buf,
        None => return Err(Error::internal("log footer extent is not prepared")),
    };

    // A footer keeps its check inside the volume state, a partial log header
    // at the same offset right behind its signature.
    let check: &MetadataCheck = cast(buf, mem::size_of::<Signature>());
    let mut desc: MetadataDescriptor = unsafe { mem::zeroed() };

    desc.offset = extent.offset.into();
    desc.size = extent.bytes_count.into();
    desc.check = *check;

    Ok(desc)
}

/// Advertised full-log size of the segment the PEB belongs to.
fn advertised_log_pages(layout: &VolumeLayout, seg_index: usize, blks_count: u32) -> Result<(u16, bool)> {
    let pages_per_peb = layout.pages_per_peb();

    match layout.segs[seg_index].seg_type {
        Some(MetaIndex::InitialSnapshot) => {
            verify_internal!(blks_count > 0, "empty initial snapshot log");
            Ok((blks_count as u16, false))
        }
        Some(MetaIndex::Superblock) => {
            let log_pages = layout.sb.log_pages;
            verify_internal!(log_pages != 0 && log_pages != u16::MAX, "sb log_pages is not set");
            verify_internal!(
                log_pages as u32 == blks_count,
                "sb log uses {} pages instead of {}",
                blks_count,
                log_pages
            );
            Ok((log_pages, false))
        }
        Some(MetaIndex::SegmentBitmap) => {
            let log_pages = layout.segbmap.log_pages;
            verify_internal!(log_pages != 0 && log_pages != u16::MAX, "segbmap log_pages is not set");
            Ok((log_pages, log_pages as u32 != blks_count))
        }
        Some(MetaIndex::MappingTable) => {
            let log_pages = layout.maptbl.log_pages;
            verify_internal!(log_pages != 0 && log_pages != u16::MAX, "maptbl log_pages is not set");
            Ok((log_pages, log_pages as u32 != blks_count))
        }
        _ => {
            mkfs_warn!("unprocessed type of segment: index {seg_index}");
            Ok((pages_per_peb as u16, false))
        }
    }
}

/// Finalizes the segment header: advertised log size, metadata descriptors of
/// every populated extent, the flags and the checksum over the whole record.
pub fn commit_segment_header(
    layout: &mut VolumeLayout,
    seg_index: usize,
    peb_index: usize,
    blks_count: u32,
) -> Result<()> {
    check_indexes(layout, seg_index, peb_index)?;
    verify_internal!(blks_count < u16::MAX as u32, "blks_count {blks_count} is too large");

    let (log_pages, is_partial) = advertised_log_pages(layout, seg_index, blks_count)?;
    let is_sb_seg = layout.segs[seg_index].seg_type == Some(MetaIndex::Superblock);

    let cache_fragments = layout.maptbl_cache.fragments_count;
    let cache_fragment_size = layout.maptbl_cache.fragment_size;

    let mut seg_flags = 0u32;
    let mut descriptors: Vec<(usize, MetadataDescriptor)> = Vec::new();

    {
        let peb = &layout.segs[seg_index].pebs[peb_index];

        if peb.extents[BLOCK_BITMAP].bytes_count > 0 {
            let desc = prepare_blkbmap_metadata_descriptor(&peb.extents[BLOCK_BITMAP])?;
            descriptors.push((BLK_BMAP_INDEX, desc));
            seg_flags |= SEG_HDR_HAS_BLK_BMAP;
        }

        if peb.extents[OFFSET_TABLE].bytes_count > 0 {
            let desc = prepare_offset_table_metadata_descriptor(&peb.extents[OFFSET_TABLE])?;
            descriptors.push((OFF_TABLE_INDEX, desc));
            seg_flags |= SEG_HDR_HAS_OFFSET_TABLE;
        }

        if peb.extents[BLOCK_DESCRIPTORS].bytes_count > 0 {
            let desc = prepare_blk_desc_table_metadata_descriptor(&peb.extents[BLOCK_DESCRIPTORS])?;
            descriptors.push((BLK_DESC_AREA_INDEX, desc));
            seg_flags |= LOG_HAS_BLK_DESC_CHAIN;
        }

        if peb.extents[MAPTBL_CACHE].bytes_count > 0 {
            verify_internal!(is_sb_seg, "only the sb segment carries the maptbl cache");

            let desc = prepare_maptbl_cache_metadata_descriptor(
                cache_fragments,
                cache_fragment_size,
                &peb.extents[MAPTBL_CACHE],
            )?;
            descriptors.push((MAPTBL_CACHE_INDEX, desc));
            seg_flags |= LOG_HAS_MAPTBL_CACHE;
        }

        if peb.extents[LOG_PAYLOAD].bytes_count > 0 {
            let desc = prepare_payload_metadata_descriptor(&peb.extents[LOG_PAYLOAD])?;
            descriptors.push((COLD_PAYLOAD_AREA_INDEX, desc));
            seg_flags |= LOG_HAS_COLD_PAYLOAD;
        }

        if peb.extents[LOG_FOOTER].bytes_count > 0 {
            let desc = prepare_footer_metadata_descriptor(&peb.extents[LOG_FOOTER])?;
            descriptors.push((LOG_FOOTER_INDEX, desc));
            if is_partial {
                seg_flags |= LOG_IS_PARTIAL | PARTIAL_HEADER_INSTEAD_FOOTER;
            } else {
                seg_flags |= LOG_HAS_FOOTER;
            }
        }
    }

    let extent = &mut layout.segs[seg_index].pebs[peb_index].extents[SEG_HEADER];
    let buf = match extent.buf.as_mut() {
        Some(buf) => buf,
        None => return Err(Error::internal("segment header extent is not allocated")),
    };

    {
        let hdr: &mut SegmentHeader = cast_mut(buf, 0);
        hdr.log_pages = log_pages.into();
        hdr.seg_flags = seg_flags.into();
        for (index, desc) in descriptors {
            hdr.desc_array[index] = desc;
        }
    }

    let hdr_len = mem::size_of::<SegmentHeader>() as u16;
    seal_record(buf, mem::size_of::<Signature>(), hdr_len);

    Ok(())
}

fn build_block_bitmap_extent(
    pages_per_peb: u32,
    peb_index: usize,
    has_backup: bool,
    valid_blks: u16,
    extent: &mut ExtentDesc,
) -> Result<()> {
    verify_internal!(extent.buf.is_none(), "block bitmap extent is prepared twice");

    if valid_blks as u32 > pages_per_peb {
        mkfs_err!("valid_blks {valid_blks} > pages_per_peb {pages_per_peb}");
        return Err(Error::invalid("more valid blocks than pages in a PEB"));
    }

    let bmp_hdr_size = mem::size_of::<BlockBitmapHeader>();
    let bmp_frag_hdr_size = mem::size_of::<BlockBitmapFragment>();
    let frag_desc_size = mem::size_of::<FragmentDesc>();

    let bmap_bytes = bitmap::blk_bmap_bytes(pages_per_peb);
    let fragments_count = crate::ceil_division(bmap_bytes as u64, MEM_PAGE_SIZE as u64) as u32;

    verify_internal!(
        fragments_count as usize <= FRAGMENTS_CHAIN_MAX,
        "block bitmap needs {} fragments, chain limit is {}",
        fragments_count,
        FRAGMENTS_CHAIN_MAX
    );

    let bmap_offset = bmp_hdr_size + bmp_frag_hdr_size + fragments_count as usize * frag_desc_size;
    let allocation_size = bmap_offset + bmap_bytes as usize;

    let mut buf = vec![0u8; allocation_size];

    {
        let bmp_hdr: &mut BlockBitmapHeader = cast_mut(&mut buf, 0);
        set_signature(&mut bmp_hdr.magic, BLK_BMAP_MAGIC);
        bmp_hdr.fragments_count = 1u16.into();
        bmp_hdr.bytes_count = (allocation_size as u32).into();
        bmp_hdr.flags = if has_backup { BLK_BMAP_BACKUP } else { 0 };
        bmp_hdr.kind = BLK_BMAP_UNCOMPRESSED_BLOB;
    }

    bitmap::blk_bmap_set_area(
        &mut buf[bmap_offset..],
        0,
        valid_blks as u32,
        bitmap::BLK_VALID,
    )?;

    {
        let frag_hdr: &mut BlockBitmapFragment = cast_mut(&mut buf, bmp_hdr_size);
        frag_hdr.peb_index = (peb_index as u16).into();
        frag_hdr.sequence_id = 0;
        frag_hdr.flags = SRC_BLK_BMAP << 6;
        frag_hdr.last_free_blk = (valid_blks as u32).into();
        frag_hdr.invalid_blks = 0u32.into();

        frag_hdr.chain_hdr.magic = CHAIN_HDR_MAGIC;
        frag_hdr.chain_hdr.kind = BLK_BMAP_CHAIN_HDR;
        frag_hdr.chain_hdr.flags = 0u16.into();
        frag_hdr.chain_hdr.desc_size = (frag_desc_size as u16).into();
        frag_hdr.chain_hdr.fragments_count = (fragments_count as u16).into();
        frag_hdr.chain_hdr.compr_bytes = bmap_bytes.into();
        frag_hdr.chain_hdr.uncompr_bytes = bmap_bytes.into();
    }

    let mut written_bmap_bytes = 0u32;
    for i in 0..fragments_count {
        let fragment_size = (bmap_bytes - written_bmap_bytes).min(MEM_PAGE_SIZE);
        let fragment_offset = bmap_offset as u32 + i * MEM_PAGE_SIZE;

        let csum = {
            let start = fragment_offset as usize;
            crc32_le(&buf[start..start + fragment_size as usize])
        };

        let desc_offset = bmp_hdr_size + bmp_frag_hdr_size + i as usize * frag_desc_size;
        let desc: &mut FragmentDesc = cast_mut(&mut buf, desc_offset);

        desc.magic = FRAGMENT_DESC_MAGIC;
        desc.kind = FRAGMENT_UNCOMPR_BLOB;
        desc.flags = FRAGMENT_HAS_CSUM;
        desc.sequence_id = i as u8;
        desc.offset = fragment_offset.into();
        desc.compr_size = (fragment_size as u16).into();
        desc.uncompr_size = (fragment_size as u16).into();
        desc.checksum = csum.into();

        written_bmap_bytes += fragment_size;
    }

    extent.bytes_count = allocation_size as u32;
    extent.buf = Some(buf);

    Ok(())
}

/// Builds the block bitmap extent: indices `[0, valid_blks)` carry the valid
/// state, the rest stays free.
pub fn pre_commit_block_bitmap(
    layout: &mut VolumeLayout,
    seg_index: usize,
    peb_index: usize,
    valid_blks: u16,
) -> Result<()> {
    check_indexes(layout, seg_index, peb_index)?;

    let pages_per_peb = layout.pages_per_peb();
    let has_backup = layout.blkbmap.has_backup_copy;
    let extent = &mut layout.segs[seg_index].pebs[peb_index].extents[BLOCK_BITMAP];

    build_block_bitmap_extent(pages_per_peb, peb_index, has_backup, valid_blks, extent)
}

/// Same as [`pre_commit_block_bitmap`] for the backup slot.
pub fn pre_commit_block_bitmap_backup(
    layout: &mut VolumeLayout,
    seg_index: usize,
    peb_index: usize,
    valid_blks: u16,
) -> Result<()> {
    check_indexes(layout, seg_index, peb_index)?;

    let pages_per_peb = layout.pages_per_peb();
    let has_backup = layout.blkbmap.has_backup_copy;
    let extent = &mut layout.segs[seg_index].pebs[peb_index].extents[BLOCK_BITMAP_BACKUP];

    build_block_bitmap_extent(pages_per_peb, peb_index, has_backup, valid_blks, extent)
}

fn finish_block_bitmap_extent(extent: &mut ExtentDesc, metadata_blks: u32) -> Result<()> {
    let buf = match extent.buf.as_mut() {
        Some(buf) => buf,
        None => return Err(Error::internal("block bitmap extent is not prepared")),
    };

    let frag_hdr: &mut BlockBitmapFragment = cast_mut(buf, mem::size_of::<BlockBitmapHeader>());
    frag_hdr.metadata_blks = metadata_blks.into();

    Ok(())
}

/// Records the count of metadata pages into the block bitmap fragment.
pub fn commit_block_bitmap(
    layout: &mut VolumeLayout,
    seg_index: usize,
    peb_index: usize,
    metadata_blks: u32,
) -> Result<()> {
    check_indexes(layout, seg_index, peb_index)?;
    verify_internal!(
        metadata_blks < layout.pages_per_peb(),
        "metadata_blks {} above pages_per_peb {}",
        metadata_blks,
        layout.pages_per_peb()
    );

    let extent = &mut layout.segs[seg_index].pebs[peb_index].extents[BLOCK_BITMAP];
    finish_block_bitmap_extent(extent, metadata_blks)
}

/// Same as [`commit_block_bitmap`] for the backup slot.
pub fn commit_block_bitmap_backup(
    layout: &mut VolumeLayout,
    seg_index: usize,
    peb_index: usize,
    metadata_blks: u32,
) -> Result<()> {
    check_indexes(layout, seg_index, peb_index)?;

    let extent = &mut layout.segs[seg_index].pebs[peb_index].extents[BLOCK_BITMAP_BACKUP];
    finish_block_bitmap_extent(extent, metadata_blks)
}

fn calculate_offset_table_fragments(valid_blks: u16) -> u32 {
    crate::ceil_division(valid_blks as u64, off_desc_per_fragment() as u64) as u32
}

fn calculate_offset_table_size(fragments: u32, valid_blks: u16) -> usize {
    let tbl_hdr_size = mem::size_of::<Blk2OffTableHeader>();
    let hdr_size = mem::size_of::<PhysOffsetTableHeader>();
    let item_size = mem::size_of::<PhysOffsetDescriptor>();
    let per_fragment = off_desc_per_fragment();

    let full_fragments = fragments.saturating_sub(1);
    let blks_in_last = valid_blks as u32 - full_fragments * per_fragment;

    tbl_hdr_size
        + fragments as usize * hdr_size
        + full_fragments as usize * per_fragment as usize * item_size
        + blks_in_last as usize * item_size
}

/// Byte offset of a block's descriptor inside the block descriptor chain.
fn define_block_descriptor_offset(blk_id: u16) -> u32 {
    let per_area = blk_desc_per_fragment() * FRAGMENTS_CHAIN_MAX as u32;
    let area_index = blk_id as u32 / per_area;
    let hdr_size = mem::size_of::<AreaBlockTable>() as u32;
    let blk_desc_size = mem::size_of::<BlockDescriptor>() as u32;

    (area_index + 1) * hdr_size + blk_id as u32 * blk_desc_size
}

struct OffsetFragmentParams {
    peb_index: u16,
    sequence_id: u16,
    pages_per_seg: u32,
    logical_start_page: u32,
    logical_blk: u16,
    start_id: u16,
    rest_blks: u16,
}

fn prepare_offsets_table_fragment(fragment: &mut [u8], params: &OffsetFragmentParams) -> u16 {
    let hdr_size = mem::size_of::<PhysOffsetTableHeader>();
    let item_size = mem::size_of::<PhysOffsetDescriptor>();
    let id_count = (params.rest_blks as u32).min(off_desc_per_fragment()) as u16;

    for i in 0..id_count {
        let blk_id = params.start_id + i;
        let byte_offset = define_block_descriptor_offset(blk_id);

        let desc: &mut PhysOffsetDescriptor = cast_mut(fragment, hdr_size + i as usize * item_size);
        desc.page_desc.logical_offset = (params.logical_start_page + i as u32).into();
        desc.page_desc.logical_blk = (params.logical_blk + i).into();
        desc.page_desc.peb_page = blk_id.into();

        desc.blk_state.log_start_page = 0u16.into();
        desc.blk_state.log_area = LOG_BLK_DESC_AREA;
        desc.blk_state.peb_migration_id = PEB_MIGRATION_ID_START;
        desc.blk_state.byte_offset = byte_offset.into();
    }

    let byte_size = (hdr_size + id_count as usize * item_size) as u32;
    let has_next = id_count < params.rest_blks;

    {
        let hdr: &mut PhysOffsetTableHeader = cast_mut(fragment, 0);
        hdr.magic = PHYS_OFF_TABLE_MAGIC.into();
        hdr.start_id = params.start_id.into();
        hdr.id_count = id_count.into();
        hdr.byte_size = byte_size.into();
        hdr.peb_index = params.peb_index.into();
        hdr.sequence_id = params.sequence_id.into();
        hdr.kind = SEG_OFF_TABLE.into();

        let mut flags = OFF_TABLE_HAS_CSUM;
        if has_next {
            flags |= OFF_TABLE_HAS_NEXT_FRAGMENT;
        }
        hdr.flags = flags.into();

        let free_items = params.pages_per_seg.min(off_desc_per_fragment()) as u16 - id_count;
        hdr.used_logical_blks = id_count.into();
        hdr.free_logical_blks = free_items.into();
        hdr.last_allocated_blk = (id_count - 1).into();
        hdr.next_fragment_off = if has_next {
            (byte_size as u16).into()
        } else {
            u16::MAX.into()
        };

        hdr.checksum = 0u32.into();
    }

    let csum = crc32_le(&fragment[..byte_size as usize]);
    let hdr: &mut PhysOffsetTableHeader = cast_mut(fragment, 0);
    hdr.checksum = csum.into();

    id_count
}

fn build_offset_table_extent(
    layout_pages_per_seg: u32,
    page_size: u32,
    pages_per_peb: u32,
    peb_index: usize,
    logical_byte_offset: u64,
    start_logical_blk: u32,
    valid_blks: u16,
    extent: &mut ExtentDesc,
) -> Result<()> {
    verify_internal!(extent.buf.is_none(), "offset table extent is prepared twice");
    verify_internal!(start_logical_blk < u16::MAX as u32, "start logical block is too large");

    if valid_blks as u32 > pages_per_peb {
        mkfs_err!("valid_blks {valid_blks} > pages_per_peb {pages_per_peb}");
        return Err(Error::invalid("more valid blocks than pages in a PEB"));
    }

    let tbl_hdr_size = mem::size_of::<Blk2OffTableHeader>();
    let phys_off_hdr_size = mem::size_of::<PhysOffsetTableHeader>();
    let item_size = mem::size_of::<PhysOffsetDescriptor>();

    let fragments_count = calculate_offset_table_fragments(valid_blks);
    let allocation_size = calculate_offset_table_size(fragments_count, valid_blks);

    let mut buf = vec![0u8; allocation_size];

    {
        let tbl_hdr: &mut Blk2OffTableHeader = cast_mut(&mut buf, 0);
        set_signature(&mut tbl_hdr.magic, BLK2OFF_TABLE_HDR_MAGIC);

        tbl_hdr.extents_off = (0x18u16).into();
        tbl_hdr.extents_count = 1u16.into();
        tbl_hdr.offset_table_off = (tbl_hdr_size as u16).into();
        tbl_hdr.fragments_count = (fragments_count as u16).into();

        tbl_hdr.sequence[0].logical_blk = (start_logical_blk as u16).into();
        tbl_hdr.sequence[0].offset_id = 0u16.into();
        tbl_hdr.sequence[0].len = (valid_blks as u16).into();
        tbl_hdr.sequence[0].sequence_id = 0;
        tbl_hdr.sequence[0].state = LOGICAL_BLK_USED;
    }

    let mut start_id = 0u16;
    let mut rest_blks = valid_blks;
    let mut logical_start_page = (logical_byte_offset / page_size as u64) as u32;
    let mut logical_blk = start_logical_blk as u16;
    let mut fragment_off = tbl_hdr_size;

    for i in 0..fragments_count {
        let params = OffsetFragmentParams {
            peb_index: peb_index as u16,
            sequence_id: i as u16,
            pages_per_seg: layout_pages_per_seg,
            logical_start_page,
            logical_blk,
            start_id,
            rest_blks,
        };

        let fragment_bytes = phys_off_hdr_size
            + (rest_blks as u32).min(off_desc_per_fragment()) as usize * item_size;
        let processed =
            prepare_offsets_table_fragment(&mut buf[fragment_off..fragment_off + fragment_bytes], &params);

        start_id += processed;
        rest_blks -= processed;
        logical_start_page += processed as u32;
        logical_blk += processed;
        fragment_off += fragment_bytes;
    }

    extent.bytes_count = allocation_size as u32;
    extent.buf = Some(buf);

    Ok(())
}

/// Builds the offset translation table extent for a run of `valid_blks`
/// logical blocks backed by the log's payload.
pub fn pre_commit_offset_table(
    layout: &mut VolumeLayout,
    seg_index: usize,
    peb_index: usize,
    logical_byte_offset: u64,
    start_logical_blk: u32,
    valid_blks: u16,
) -> Result<()> {
    check_indexes(layout, seg_index, peb_index)?;

    let pages_per_seg = layout.blk2off_tbl.pages_per_seg;
    let page_size = layout.page_size;
    let pages_per_peb = layout.pages_per_peb();
    let extent = &mut layout.segs[seg_index].pebs[peb_index].extents[OFFSET_TABLE];

    build_offset_table_extent(
        pages_per_seg,
        page_size,
        pages_per_peb,
        peb_index,
        logical_byte_offset,
        start_logical_blk,
        valid_blks,
        extent,
    )
}

/// Same as [`pre_commit_offset_table`] for the backup slot.
pub fn pre_commit_offset_table_backup(
    layout: &mut VolumeLayout,
    seg_index: usize,
    peb_index: usize,
    logical_byte_offset: u64,
    start_logical_blk: u32,
    valid_blks: u16,
) -> Result<()> {
    check_indexes(layout, seg_index, peb_index)?;

    let pages_per_seg = layout.blk2off_tbl.pages_per_seg;
    let page_size = layout.page_size;
    let pages_per_peb = layout.pages_per_peb();
    let extent = &mut layout.segs[seg_index].pebs[peb_index].extents[OFFSET_TABLE_BACKUP];

    build_offset_table_extent(
        pages_per_seg,
        page_size,
        pages_per_peb,
        peb_index,
        logical_byte_offset,
        start_logical_blk,
        valid_blks,
        extent,
    )
}

fn finish_offset_table_extent(extent: &mut ExtentDesc) -> Result<()> {
    let buf = match extent.buf.as_mut() {
        Some(buf) => buf,
        None => return Err(Error::internal("offset table extent is not prepared")),
    };

    let bytes = {
        let tbl_hdr: &Blk2OffTableHeader = cast(buf, 0);
        u16::from(tbl_hdr.offset_table_off)
    };

    seal_record(buf, mem::size_of::<Signature>(), bytes);

    Ok(())
}

/// Seals the offset table header's checksum.
pub fn commit_offset_table(layout: &mut VolumeLayout, seg_index: usize, peb_index: usize) -> Result<()> {
    check_indexes(layout, seg_index, peb_index)?;

    let extent = &mut layout.segs[seg_index].pebs[peb_index].extents[OFFSET_TABLE];
    finish_offset_table_extent(extent)
}

/// Same as [`commit_offset_table`] for the backup slot.
pub fn commit_offset_table_backup(
    layout: &mut VolumeLayout,
    seg_index: usize,
    peb_index: usize,
) -> Result<()> {
    check_indexes(layout, seg_index, peb_index)?;

    let extent = &mut layout.segs[seg_index].pebs[peb_index].extents[OFFSET_TABLE_BACKUP];
    finish_offset_table_extent(extent)
}

fn calculate_blk_desc_table_size(fragments: u32, valid_blks: u16) -> usize {
    let hdr_size = mem::size_of::<AreaBlockTable>();
    let item_size = mem::size_of::<BlockDescriptor>();
    let per_fragment = blk_desc_per_fragment();

    let hdrs_count = crate::ceil_division(fragments as u64, FRAGMENTS_CHAIN_MAX as u64) as usize;
    let full_fragments = fragments.saturating_sub(1);
    let blks_in_last = valid_blks as u32 - full_fragments * per_fragment;

    hdrs_count * hdr_size
        + full_fragments as usize * per_fragment as usize * item_size
        + blks_in_last as usize * item_size
}

fn area_blk_table_offset(area_index: u32) -> usize {
    let per_area = blk_desc_per_fragment() * FRAGMENTS_CHAIN_MAX as u32;
    area_index as usize * mem::size_of::<AreaBlockTable>()
        + (area_index * per_area) as usize * mem::size_of::<BlockDescriptor>()
}

struct BlkDescChainParams {
    peb_index: u16,
    inode_id: u64,
    payload_offset_in_bytes: u32,
    item_size: u32,
    page_size: u32,
}

/// Builds the block descriptor chain: one area block table per fourteen
/// fragments, one descriptor per valid block, a next-table descriptor linking
/// consecutive tables.
pub fn pre_commit_block_descriptors(
    layout: &mut VolumeLayout,
    seg_index: usize,
    peb_index: usize,
    valid_blks: u16,
    inode_id: u64,
    payload_offset_in_bytes: u32,
    item_size: u32,
) -> Result<()> {
    check_indexes(layout, seg_index, peb_index)?;

    let pages_per_peb = layout.pages_per_peb();
    if valid_blks as u32 > pages_per_peb {
        mkfs_err!("valid_blks {valid_blks} > pages_per_peb {pages_per_peb}");
        return Err(Error::invalid("more valid blocks than pages in a PEB"));
    }

    let params = BlkDescChainParams {
        peb_index: peb_index as u16,
        inode_id,
        payload_offset_in_bytes,
        item_size,
        page_size: layout.page_size,
    };

    let extent = &mut layout.segs[seg_index].pebs[peb_index].extents[BLOCK_DESCRIPTORS];
    verify_internal!(extent.buf.is_none(), "block descriptors extent is prepared twice");

    let per_fragment = blk_desc_per_fragment();
    let per_area = per_fragment * FRAGMENTS_CHAIN_MAX as u32;
    let fragments_count = blk_desc_table_fragments(valid_blks as u32);
    let allocation_size = calculate_blk_desc_table_size(fragments_count, valid_blks);
    let hdrs_count = crate::ceil_division(fragments_count as u64, FRAGMENTS_CHAIN_MAX as u64) as u32;

    let mut buf = vec![0u8; allocation_size];
    let mut cur_byte_offset = 0u32;
    let mut rest_blks = valid_blks as u32;

    for area_index in 0..hdrs_count {
        let has_next_area = (area_index + 1) < hdrs_count;
        let area_offset = area_blk_table_offset(area_index);
        let area_blks = rest_blks.min(per_area);
        let area_fragments = crate::ceil_division(area_blks as u64, per_fragment as u64) as u32;
        let hdr_size = mem::size_of::<AreaBlockTable>();
        let blk_desc_size = mem::size_of::<BlockDescriptor>();
        let area_bytes = (hdr_size + area_blks as usize * blk_desc_size) as u32;

        {
            let table: &mut AreaBlockTable = cast_mut(&mut buf, area_offset);
            table.chain_hdr.magic = CHAIN_HDR_MAGIC;
            table.chain_hdr.kind = BLK_DESC_CHAIN_HDR;
            table.chain_hdr.flags = if has_next_area {
                MULTIPLE_HDR_CHAIN.into()
            } else {
                0u16.into()
            };
            table.chain_hdr.fragments_count = (area_fragments as u16).into();
            table.chain_hdr.desc_size = (mem::size_of::<FragmentDesc>() as u16).into();
            table.chain_hdr.compr_bytes = area_bytes.into();
            table.chain_hdr.uncompr_bytes = area_bytes.into();
        }

        let mut area_rest = area_blks;
        for i in 0..area_fragments {
            let blk_desc_count = area_rest.min(per_fragment);
            let fragment_offset = area_offset + hdr_size + (i * per_fragment) as usize * blk_desc_size;

            for blk in 0..blk_desc_count {
                let desc: &mut BlockDescriptor =
                    cast_mut(&mut buf, fragment_offset + blk as usize * blk_desc_size);

                let area_type = if params.item_size >= params.page_size {
                    LOG_MAIN_AREA
                } else {
                    LOG_JOURNAL_AREA
                };

                desc.ino = params.inode_id.into();
                desc.peb_index = params.peb_index.into();

                let logical_page =
                    (params.payload_offset_in_bytes + cur_byte_offset) / params.page_size;
                desc.logical_offset = logical_page.into();

                let peb_page = cur_byte_offset / params.page_size;
                verify_internal!(peb_page < u16::MAX as u32, "PEB page {} is out of range", peb_page);
                desc.peb_page = (peb_page as u16).into();

                desc.state[0].log_start_page = 0u16.into();
                desc.state[0].log_area = area_type;
                desc.state[0].peb_migration_id = PEB_MIGRATION_ID_START;
                desc.state[0].byte_offset = cur_byte_offset.into();

                cur_byte_offset += params.item_size;
            }

            let bytes_count = blk_desc_count * blk_desc_size as u32;
            let csum = crc32_le(&buf[fragment_offset..fragment_offset + bytes_count as usize]);

            let table: &mut AreaBlockTable = cast_mut(&mut buf, area_offset);
            let fdesc = &mut table.blk[i as usize];
            fdesc.magic = FRAGMENT_DESC_MAGIC;
            fdesc.kind = DATA_BLK_DESC;
            fdesc.flags = FRAGMENT_HAS_CSUM;
            fdesc.sequence_id = i as u8;
            fdesc.offset = (fragment_offset as u32).into();
            fdesc.compr_size = (bytes_count as u16).into();
            fdesc.uncompr_size = (bytes_count as u16).into();
            fdesc.checksum = csum.into();

            area_rest -= blk_desc_count;
        }

        if has_next_area {
            let sequence_id = area_index as usize * BLK_TABLE_MAX + FRAGMENTS_CHAIN_MAX;
            let hdr_len = mem::size_of::<AreaBlockTable>() as u16;

            let table: &mut AreaBlockTable = cast_mut(&mut buf, area_offset);
            let fdesc = &mut table.blk[NEXT_BLK_TABLE_INDEX];
            fdesc.magic = FRAGMENT_DESC_MAGIC;
            fdesc.kind = NEXT_TABLE_DESC;
            fdesc.flags = 0;
            fdesc.sequence_id = sequence_id as u8;
            fdesc.offset = ((area_offset as u32) + area_bytes).into();
            fdesc.compr_size = hdr_len.into();
            fdesc.uncompr_size = hdr_len.into();
            fdesc.checksum = 0u32.into();
        }

        rest_blks -= area_blks;
    }

    extent.bytes_count = allocation_size as u32;
    extent.buf = Some(buf);

    Ok(())
}

/// Allocates the log footer extent, sized to hold either a footer or a
/// partial log header.
pub fn define_log_footer_layout(
    layout: &mut VolumeLayout,
    seg_index: usize,
    peb_index: usize,
) -> Result<()> {
    check_indexes(layout, seg_index, peb_index)?;

    let footer_len = mem::size_of::<LogFooter>().max(mem::size_of::<PartialLogHeader>());
    let extent = &mut layout.segs[seg_index].pebs[peb_index].extents[LOG_FOOTER];

    verify_internal!(extent.buf.is_none(), "log footer extent is prepared twice");

    extent.buf = Some(vec![0u8; footer_len]);
    extent.bytes_count = footer_len as u32;

    Ok(())
}

/// Verifies the footer extent is in place before the commit phase touches it.
pub fn pre_commit_log_footer(layout: &mut VolumeLayout, seg_index: usize, peb_index: usize) -> Result<()> {
    check_indexes(layout, seg_index, peb_index)?;

    let extent = &layout.segs[seg_index].pebs[peb_index].extents[LOG_FOOTER];
    verify_internal!(extent.buf.is_some(), "log footer extent is not allocated");

    Ok(())
}

fn commit_full_log_footer(
    layout: &mut VolumeLayout,
    seg_index: usize,
    peb_index: usize,
    blks_count: u32,
) -> Result<()> {
    let vs = layout.sb.vs;
    let timestamp = layout.create_timestamp;
    let cno = layout.create_cno;
    let page_size = layout.page_size;
    let blkbmap_backup = layout.blkbmap.has_backup_copy;
    let blk2off_backup = layout.blk2off_tbl.has_backup_copy;

    let mut log_flags = 0u32;
    let mut descriptors: Vec<(usize, MetadataDescriptor)> = Vec::new();

    {
        let peb = &layout.segs[seg_index].pebs[peb_index];

        if blkbmap_backup && peb.extents[BLOCK_BITMAP_BACKUP].bytes_count > 0 {
            let desc = prepare_blkbmap_metadata_descriptor(&peb.extents[BLOCK_BITMAP_BACKUP])?;
            descriptors.push((BLK_BMAP_INDEX, desc));
            log_flags |= LOG_FOOTER_HAS_BLK_BMAP;
        }

        if blk2off_backup && peb.extents[OFFSET_TABLE_BACKUP].bytes_count > 0 {
            let desc = prepare_offset_table_metadata_descriptor(&peb.extents[OFFSET_TABLE_BACKUP])?;
            descriptors.push((OFF_TABLE_INDEX, desc));
            log_flags |= LOG_FOOTER_HAS_OFFSET_TABLE;
        }
    }

    let extent = &mut layout.segs[seg_index].pebs[peb_index].extents[LOG_FOOTER];
    let buf = match extent.buf.as_mut() {
        Some(buf) => buf,
        None => return Err(Error::internal("log footer extent is not allocated")),
    };

    buf[..mem::size_of::<VolumeState>()].copy_from_slice(reinterpret(&vs));

    {
        let footer: &mut LogFooter = cast_mut(buf, 0);
        footer.volume_state.magic.key = LOG_FOOTER_MAGIC.into();
        footer.timestamp = timestamp.into();
        footer.cno = cno.into();
        footer.log_bytes = (blks_count * page_size).into();
        footer.log_flags = log_flags.into();
        footer.peb_create_time = timestamp.into();

        for (index, desc) in descriptors {
            footer.desc_array[index] = desc;
        }
    }

    let footer_len = mem::size_of::<LogFooter>() as u16;
    seal_record(buf, mem::size_of::<Signature>(), footer_len);

    Ok(())
}

fn commit_partial_log_header(
    layout: &mut VolumeLayout,
    seg_index: usize,
    peb_index: usize,
    blks_count: u32,
) -> Result<()> {
    let vh = layout.sb.vh;
    let vs = layout.sb.vs;
    let timestamp = layout.create_timestamp;
    let cno = layout.create_cno;
    let page_size = layout.page_size;
    let blkbmap_backup = layout.blkbmap.has_backup_copy;
    let blk2off_backup = layout.blk2off_tbl.has_backup_copy;
    let seg_id = layout.segs[seg_index].seg_id;

    let meta_index = match layout.segs[seg_index].seg_type {
        Some(index) => index,
        None => return Err(Error::internal("partial log in an unowned segment")),
    };
    let (log_pages, _) = advertised_log_pages(layout, seg_index, blks_count)?;

    let mut log_flags = LOG_IS_PARTIAL | LOG_HAS_PARTIAL_HEADER | PARTIAL_HEADER_INSTEAD_FOOTER;
    let mut descriptors: Vec<(usize, MetadataDescriptor)> = Vec::new();

    {
        let peb = &layout.segs[seg_index].pebs[peb_index];

        if blkbmap_backup && peb.extents[BLOCK_BITMAP_BACKUP].bytes_count > 0 {
            let desc = prepare_blkbmap_metadata_descriptor(&peb.extents[BLOCK_BITMAP_BACKUP])?;
            descriptors.push((BLK_BMAP_INDEX, desc));
            log_flags |= SEG_HDR_HAS_BLK_BMAP;
        }

        if blk2off_backup && peb.extents[OFFSET_TABLE_BACKUP].bytes_count > 0 {
            let desc = prepare_offset_table_metadata_descriptor(&peb.extents[OFFSET_TABLE_BACKUP])?;
            descriptors.push((OFF_TABLE_INDEX, desc));
            log_flags |= SEG_HDR_HAS_OFFSET_TABLE;
        }
    }

    let leb_id = layout.segs[seg_index].pebs[peb_index].leb_id;
    let peb_id = layout.segs[seg_index].pebs[peb_index].peb_id;

    let extent = &mut layout.segs[seg_index].pebs[peb_index].extents[LOG_FOOTER];
    let buf = match extent.buf.as_mut() {
        Some(buf) => buf,
        None => return Err(Error::internal("log footer extent is not allocated")),
    };

    buf.fill(0);

    {
        let plh: &mut PartialLogHeader = cast_mut(buf, 0);
        set_signature(&mut plh.magic, PARTIAL_LOG_HDR_MAGIC);

        plh.timestamp = timestamp.into();
        plh.cno = cno.into();
        plh.log_pages = log_pages.into();
        plh.seg_type = meta2seg_type(meta_index).into();
        plh.pl_flags = log_flags.into();
        plh.log_bytes = (blks_count * page_size).into();
        plh.flags = vs.flags;

        for (index, desc) in descriptors {
            plh.desc_array[index] = desc;
        }

        plh.nsegs = vs.nsegs;
        plh.free_pages = vs.free_pages;
        plh.root_folder = vs.root_folder;
        plh.inodes_btree = vs.inodes_btree;
        plh.shared_extents_btree = vs.shared_extents_btree;
        plh.shared_dict_btree = vs.shared_dict_btree;
        plh.snapshots_btree = vs.snapshots_btree;
        plh.invextree = vh.invextree;

        plh.sequence_id = 0u32.into();
        plh.log_pagesize = vh.log_pagesize;
        plh.log_erasesize = vh.log_erasesize;
        plh.log_segsize = vh.log_segsize;
        plh.log_pebs_per_seg = vh.log_pebs_per_seg;
        plh.lebs_per_peb_index = vh.lebs_per_peb_index;
        plh.create_threads_per_seg = vh.create_threads_per_seg;
        plh.open_zones = vs.open_zones;
        plh.peb_create_time = timestamp.into();

        plh.seg_id = seg_id.into();
        plh.leb_id = leb_id.into();
        plh.peb_id = peb_id.into();
        plh.relation_peb_id = u64::MAX.into();

        plh.uuid = vs.uuid;
        plh.volume_create_time = vh.create_time;
    }

    let hdr_len = mem::size_of::<PartialLogHeader>() as u16;
    seal_record(buf, mem::size_of::<Signature>(), hdr_len);

    Ok(())
}

/// Finishes the terminal record of the log: a full footer when the log fills
/// its advertised size, a partial log header otherwise.
pub fn commit_log_footer(
    layout: &mut VolumeLayout,
    seg_index: usize,
    peb_index: usize,
    blks_count: u32,
) -> Result<()> {
    check_indexes(layout, seg_index, peb_index)?;
    verify_internal!(
        blks_count <= u32::MAX / layout.page_size,
        "blks_count {} overflows the byte count",
        blks_count
    );

    match layout.segs[seg_index].seg_type {
        Some(MetaIndex::InitialSnapshot) | Some(MetaIndex::Superblock) => {
            commit_full_log_footer(layout, seg_index, peb_index, blks_count)
        }
        Some(MetaIndex::SegmentBitmap) => {
            mkfs_dbg!(
                layout.env.show_debug,
                "log_pages {}, blks_count {}",
                layout.segbmap.log_pages,
                blks_count
            );
            if layout.segbmap.log_pages as u32 != blks_count {
                commit_partial_log_header(layout, seg_index, peb_index, blks_count)
            } else {
                commit_full_log_footer(layout, seg_index, peb_index, blks_count)
            }
        }
        Some(MetaIndex::MappingTable) => {
            mkfs_dbg!(
                layout.env.show_debug,
                "log_pages {}, blks_count {}",
                layout.maptbl.log_pages,
                blks_count
            );
            if layout.maptbl.log_pages as u32 != blks_count {
                commit_partial_log_header(layout, seg_index, peb_index, blks_count)
            } else {
                commit_full_log_footer(layout, seg_index, peb_index, blks_count)
            }
        }
        _ => {
            mkfs_warn!("unprocessed type of segment: index {seg_index}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn peb_with_sizes(sizes: &[(usize, u32)]) -> PebContent {
        let mut peb = PebContent::new();
        for &(index, bytes) in sizes {
            peb.extents[index].bytes_count = bytes;
        }
        peb
    }

    #[test]
    fn extent_offsets_grow_and_align() {
        let page_size = 4096u32;
        let mut peb = peb_with_sizes(&[
            (SEG_HEADER, 2048),
            (BLOCK_BITMAP, 100),
            (OFFSET_TABLE, 80),
            (BLOCK_DESCRIPTORS, 200),
            (LOG_PAYLOAD, 8192),
            (LOG_FOOTER, 2048),
        ]);

        set_extent_start_offset(page_size, &mut peb, SEG_HEADER).unwrap();
        set_extent_start_offset(page_size, &mut peb, BLOCK_BITMAP).unwrap();
        set_extent_start_offset(page_size, &mut peb, OFFSET_TABLE).unwrap();
        set_extent_start_offset(page_size, &mut peb, BLOCK_DESCRIPTORS).unwrap();
        set_extent_start_offset(page_size, &mut peb, LOG_PAYLOAD).unwrap();
        set_extent_start_offset(page_size, &mut peb, LOG_FOOTER).unwrap();

        assert_eq!(peb.extents[SEG_HEADER].offset, 0);
        assert_eq!(peb.extents[BLOCK_BITMAP].offset, 2048);
        assert_eq!(peb.extents[OFFSET_TABLE].offset, 2148);
        assert_eq!(peb.extents[BLOCK_DESCRIPTORS].offset, 2228);
        // Payload is the first page-aligned extent.
        assert_eq!(peb.extents[LOG_PAYLOAD].offset, 4096);
        assert_eq!(peb.extents[LOG_FOOTER].offset, 4096 + 8192);

        let pages = calculate_log_pages(page_size, 131072, &peb).unwrap();
        assert_eq!(pages, (4096 + 8192 + 2048 + 4095) / 4096);
    }

    #[test]
    fn log_pages_respect_erase_size() {
        let mut peb = peb_with_sizes(&[(SEG_HEADER, 2048), (LOG_PAYLOAD, 262144)]);
        peb.extents[SEG_HEADER].offset = 0;

        assert!(calculate_log_pages(4096, 131072, &peb).is_err());
    }

    #[test]
    fn full_log_size_alignment() {
        // The advertised size divides pages_per_peb and keeps three pages of
        // slack over the used count.
        let aligned = align_full_log_pages(2048, 37, u16::MAX);
        assert_eq!(2048 % aligned, 0);
        assert!(aligned >= 37 + 3);

        // A configured value below the used count is pulled up.
        let aligned = align_full_log_pages(2048, 37, 8);
        assert!(aligned >= 37 + 3);
        assert_eq!(2048 % aligned, 0);

        // A log filling the whole PEB stays at the PEB size.
        assert_eq!(align_full_log_pages(4, 4, u16::MAX), 4);
        assert_eq!(align_full_log_pages(4, 2, u16::MAX), 4);
    }

    #[test]
    fn chain_capacities() {
        assert_eq!(off_desc_per_fragment(), 254);
        assert_eq!(blk_desc_per_fragment(), 63);
        assert_eq!(blk_desc_table_fragments(63), 1);
        assert_eq!(blk_desc_table_fragments(64), 2);
    }

    fn layout_for_log_tests() -> VolumeLayout {
        let mut layout = VolumeLayout::new();
        layout.env.fs_size = crate::SIZE_1GB;
        layout.env.erase_size = crate::SIZE_8MB as u32;
        layout.seg_size = crate::SIZE_8MB;
        layout.page_size = crate::SIZE_4KB as u32;
        layout.blk2off_tbl.pages_per_seg = 2048;

        let mut pebs = Vec::new();
        pebs.push(PebContent::new());
        layout.segs.push(SegmentDesc {
            seg_type: Some(MetaIndex::SegmentBitmap),
            seg_state: Some(SegmentPolicy::Dedicated),
            seg_id: 3,
            pebs,
            pebs_count: 1,
        });
        layout
    }

    #[test]
    fn block_bitmap_extent_content() {
        let mut layout = layout_for_log_tests();

        pre_commit_block_bitmap(&mut layout, 0, 0, 10).unwrap();
        commit_block_bitmap(&mut layout, 0, 0, 7).unwrap();

        let extent = &layout.segs[0].pebs[0].extents[BLOCK_BITMAP];
        let buf = extent.buf.as_ref().unwrap();

        let hdr: &BlockBitmapHeader = cast(buf, 0);
        assert_eq!(u32::from(hdr.magic.common), SUPER_MAGIC);
        assert_eq!(u16::from(hdr.magic.key), BLK_BMAP_MAGIC);
        assert_eq!(u32::from(hdr.bytes_count), extent.bytes_count);

        let frag: &BlockBitmapFragment = cast(buf, mem::size_of::<BlockBitmapHeader>());
        assert_eq!(u32::from(frag.metadata_blks), 7);
        assert_eq!(u32::from(frag.last_free_blk), 10);

        // 2048 pages per PEB: 512 bitmap bytes, one fragment.
        assert_eq!(u16::from(frag.chain_hdr.fragments_count), 1);
        assert_eq!(u32::from(frag.chain_hdr.uncompr_bytes), 512);

        // First ten blocks valid, the rest free.
        let bmap_off = mem::size_of::<BlockBitmapHeader>()
            + mem::size_of::<BlockBitmapFragment>()
            + mem::size_of::<FragmentDesc>();
        for blk in 0..10 {
            assert_eq!(bitmap::blk_bmap_get(&buf[bmap_off..], blk), bitmap::BLK_VALID);
        }
        assert_eq!(bitmap::blk_bmap_get(&buf[bmap_off..], 10), bitmap::BLK_FREE);
    }

    #[test]
    fn offset_table_extent_content() {
        let mut layout = layout_for_log_tests();

        pre_commit_offset_table(&mut layout, 0, 0, 0, 0, 300).unwrap();
        commit_offset_table(&mut layout, 0, 0).unwrap();

        let extent = &layout.segs[0].pebs[0].extents[OFFSET_TABLE];
        let buf = extent.buf.as_ref().unwrap();

        let hdr: &Blk2OffTableHeader = cast(buf, 0);
        assert_eq!(u16::from(hdr.fragments_count), 2);
        assert_eq!(u16::from(hdr.sequence[0].len), 300);
        assert!(record_csum_valid(buf, mem::size_of::<Signature>()));

        // First fragment holds 254 descriptors and links to the second.
        let frag0: &PhysOffsetTableHeader = cast(buf, mem::size_of::<Blk2OffTableHeader>());
        assert_eq!(u16::from(frag0.id_count), 254);
        assert_ne!(u16::from(frag0.next_fragment_off), u16::MAX);

        let frag0_bytes = u32::from(frag0.byte_size) as usize;
        let frag1_off = mem::size_of::<Blk2OffTableHeader>() + frag0_bytes;
        let frag1: &PhysOffsetTableHeader = cast(buf, frag1_off);
        assert_eq!(u16::from(frag1.id_count), 46);
        assert_eq!(u16::from(frag1.next_fragment_off), u16::MAX);
        assert_eq!(u16::from(frag1.start_id), 254);
    }

    #[test]
    fn block_descriptor_chain_content() {
        let mut layout = layout_for_log_tests();

        pre_commit_block_descriptors(&mut layout, 0, 0, 100, SEG_BMAP_INO, 0, 4096).unwrap();

        let extent = &layout.segs[0].pebs[0].extents[BLOCK_DESCRIPTORS];
        let buf = extent.buf.as_ref().unwrap();

        let table: &AreaBlockTable = cast(buf, 0);
        assert_eq!(u16::from(table.chain_hdr.fragments_count), 2);
        assert_eq!(u16::from(table.chain_hdr.flags), 0);

        let first: &BlockDescriptor = cast(buf, mem::size_of::<AreaBlockTable>());
        assert_eq!(u64::from(first.ino), SEG_BMAP_INO);
        assert_eq!(u16::from(first.peb_page), 0);
        assert_eq!(u32::from(first.state[0].byte_offset), 0);

        let second: &BlockDescriptor =
            cast(buf, mem::size_of::<AreaBlockTable>() + mem::size_of::<BlockDescriptor>());
        assert_eq!(u32::from(second.state[0].byte_offset), 4096);
        assert_eq!(u16::from(second.peb_page), 1);
    }
}
