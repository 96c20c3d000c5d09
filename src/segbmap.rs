//! Segment bitmap subsystem.
//!
//! Sizes the bitmap chain, prepares the page-sized fragments, assigns every
//! metadata segment its ID through the find-first-clean allocation primitive
//! and dumps the fragments into the payload extents of its own PEBs. All
//! metadata segments end up `reserved`, everything else stays `clean`.

use crate::bitmap;
use crate::error::{Error, Result};
use crate::layout::*;
use crate::log;
use crate::mkfs_dbg;
use crate::mkfs_err;
use crate::mkfs_warn;
use crate::ondisk::*;
use crate::verify_internal;
use crate::MEM_PAGE_SIZE;
use std::mem;

const FRAG_HDR_SIZE: usize = mem::size_of::<SegbmapFragmentHeader>();

pub struct SegbmapOps;

pub static SEGBMAP_OPS: SegbmapOps = SegbmapOps;

/// Segment states one fragment can keep.
pub fn items_per_fragment(fragment_bytes: u32) -> u32 {
    debug_assert!(fragment_bytes as usize > FRAG_HDR_SIZE);
    (fragment_bytes - FRAG_HDR_SIZE as u32) * bitmap::items_per_byte(bitmap::SEG_STATE_BITS)
}

/// Fragments needed for `items_count` segment states.
pub fn seg_bmap_fragments(items_count: u64, fragment_size: u32) -> Result<u16> {
    let mut bytes = bitmap::seg_bmap_bytes(items_count) as u64;
    let pages = crate::ceil_division(bytes, fragment_size as u64);
    bytes += pages * FRAG_HDR_SIZE as u64;

    let fragments = crate::ceil_division(bytes, fragment_size as u64);
    if fragments >= u16::MAX as u64 {
        return Err(Error::invalid("segment bitmap needs too many fragments"));
    }

    Ok(fragments as u16)
}

/// First segment state kept by fragment `index`.
fn first_fragment_item(index: u32, fragment_size: u32) -> u64 {
    index as u64 * items_per_fragment(fragment_size) as u64
}

fn segbmap_request(layout: &VolumeLayout) -> Result<MetadataSegRequest> {
    let request = layout.meta_array[MetaIndex::SegmentBitmap as usize];

    if request.segs_count == 0 || request.segs_count > SEGBMAP_SEGS * SEGBMAP_SEG_COPY_MAX {
        mkfs_err!("invalid segs_count {}", request.segs_count);
        return Err(Error::internal("segment bitmap chain is not reserved"));
    }

    match request.start_seg_index {
        Some(index) if index < layout.segs.len() => Ok(request),
        _ => Err(Error::internal("segment bitmap segments are not reserved")),
    }
}

fn prepare_fragment(layout: &mut VolumeLayout, index: u32) -> Result<()> {
    let fragments = layout.segbmap.fragments_count;
    let fragments_per_peb = layout.segbmap.fragments_per_peb as u32;
    let fragment_size = layout.segbmap.fragment_size;
    let pebs_per_seg = layout.segbmap.pebs_per_seg as u32;

    if index >= fragments {
        mkfs_err!("invalid index: index {index} >= fragments {fragments}");
        return Err(Error::invalid("fragment index out of range"));
    }

    let fragments_per_seg = fragments_per_peb * pebs_per_seg;
    let seg_index = index / fragments_per_seg;
    let peb_index = (index % fragments_per_seg) / fragments_per_peb;

    mkfs_dbg!(
        layout.env.show_debug,
        "fragments_per_seg {fragments_per_seg}, fragments_per_peb {fragments_per_peb}, index {index}, seg_index {seg_index}, peb_index {peb_index}"
    );

    let start_item = first_fragment_item(index, fragment_size);

    // Bytes of this fragment: the tail fragment may be partial.
    let payload_bytes = fragment_size - FRAG_HDR_SIZE as u32;
    let mut fragment_bytes =
        layout.segbmap.bmap_bytes as u64 + fragments as u64 * FRAG_HDR_SIZE as u64;
    fragment_bytes -= index as u64 * (payload_bytes as u64 + FRAG_HDR_SIZE as u64);
    let fragment_bytes = fragment_bytes.min(fragment_size as u64) as u32;

    let total_segs = items_per_fragment(fragment_bytes);
    verify_internal!(total_segs < u16::MAX as u32, "too many items in one fragment");

    let buffer_index = (index / fragments_per_peb) as usize;
    let offset = ((index % fragments_per_peb) * fragment_size) as usize;

    let buffer = match layout.segbmap.fragments_array[buffer_index].as_mut() {
        Some(buffer) => buffer,
        None => return Err(Error::internal("segment bitmap buffer is gone")),
    };

    let hdr: &mut SegbmapFragmentHeader = cast_mut(buffer, offset);
    hdr.magic = SEGBMAP_HDR_MAGIC.into();
    hdr.seg_index = (seg_index as u16).into();
    hdr.peb_index = (peb_index as u16).into();
    hdr.flags = 0;
    hdr.seg_type = MAIN_SEGBMAP_SEG as u8;

    hdr.start_item = start_item.into();
    hdr.sequence_id = (index as u16).into();
    hdr.fragment_bytes = (fragment_bytes as u16).into();

    hdr.total_segs = (total_segs as u16).into();
    hdr.clean_or_using_segs = (total_segs as u16).into();
    hdr.used_or_dirty_segs = 0u16.into();
    hdr.bad_segs = 0u16.into();

    Ok(())
}

/// Finds a clean segment in the bitmap, flips it to `new_state` and returns
/// its ID.
fn allocate_segment(layout: &mut VolumeLayout, new_state: u8) -> Result<u64> {
    let fragment_size = layout.segbmap.fragment_size;
    let fragments_per_peb = layout.segbmap.fragments_per_peb as u32;
    let nsegs = layout.fs_segs_count();

    let buffer = match layout.segbmap.fragments_array.first_mut().and_then(Option::as_mut) {
        Some(buffer) => buffer,
        None => return Err(Error::internal("segment bitmap buffers are not prepared")),
    };

    for fragment_index in 0..fragments_per_peb {
        let offset = (fragment_index * fragment_size) as usize;

        let (start_item, fragment_bytes) = {
            let hdr: &SegbmapFragmentHeader = cast(&buffer[..], offset);
            if u16::from(hdr.magic) != SEGBMAP_HDR_MAGIC {
                break;
            }
            (u64::from(hdr.start_item), u16::from(hdr.fragment_bytes) as usize)
        };

        if fragment_bytes <= FRAG_HDR_SIZE {
            break;
        }

        let bmap_start = offset + FRAG_HDR_SIZE;
        let bmap_end = offset + fragment_bytes;
        let found = bitmap::set_first_clean_item(
            &mut buffer[bmap_start..bmap_end],
            start_item,
            start_item,
            nsegs,
            new_state,
        )?;

        if let Some(seg_id) = found {
            return Ok(seg_id);
        }
    }

    Err(Error::no_space("no clean segment is left in the bitmap"))
}

fn define_leb_ids(seg: &mut SegmentDesc) {
    let start_leb_id = seg.seg_id * seg.pebs.len() as u64;
    for (index, peb) in seg.pebs.iter_mut().enumerate() {
        peb.leb_id = start_leb_id + index as u64;
    }
}

fn init_segbmap_sb_header(layout: &mut VolumeLayout) -> Result<()> {
    let request = segbmap_request(layout)?;
    let fragments_per_peb = layout.segbmap.fragments_per_peb as u32;
    let pebs_per_seg = layout.segbmap.pebs_per_seg as u32;
    let fragments_per_seg = fragments_per_peb * pebs_per_seg;
    let segs_per_chain = layout.segbmap.segs_per_chain;
    let has_copy = layout.segbmap.has_backup_copy;
    let fragments_count = layout.segbmap.fragments_count;
    let fragment_size = layout.segbmap.fragment_size;
    let bmap_bytes = layout.segbmap.bmap_bytes;
    let compression = layout.segbmap.compression;

    verify_internal!(fragments_count < u16::MAX as u32, "too many segbmap fragments");
    verify_internal!(fragments_per_seg < u16::MAX as u32, "too many fragments per segment");
    verify_internal!(
        segs_per_chain as usize <= SEGBMAP_SEGS,
        "segment bitmap chain is too long"
    );

    let mut flags = 0u16;
    if has_copy {
        flags |= SEGBMAP_HAS_COPY;
    }
    match compression {
        crate::compression::CompressionType::None => {}
        crate::compression::CompressionType::Zlib => flags |= SEGBMAP_MAKE_ZLIB_COMPR,
        crate::compression::CompressionType::Lzo => flags |= SEGBMAP_MAKE_LZO_COMPR,
        crate::compression::CompressionType::Unknown => {
            mkfs_err!("invalid compression type");
            return Err(Error::invalid("segment bitmap compression is not selected"));
        }
    }

    let mut segs = [[u64::MAX; SEGBMAP_SEG_COPY_MAX]; SEGBMAP_SEGS];
    let mut seg_index = request.start_seg_index.unwrap_or(0);

    for chain in 0..segs_per_chain as usize {
        for replica in 0..SEGBMAP_SEG_COPY_MAX {
            let seg = &layout.segs[seg_index];

            if seg.seg_type != Some(MetaIndex::SegmentBitmap) {
                mkfs_err!("invalid seg_type {:?}", seg.seg_type);
                return Err(Error::internal("foreign segment in the segbmap chain"));
            }

            segs[chain][replica] = seg.seg_id;
            seg_index += 1;

            if !has_copy {
                break;
            }
        }
    }

    let hdr = &mut layout.sb.vh.segbmap;
    hdr.fragments_count = (fragments_count as u16).into();
    hdr.fragments_per_seg = (fragments_per_seg as u16).into();
    hdr.fragments_per_peb = (fragments_per_peb as u16).into();
    hdr.fragment_size = (fragment_size as u16).into();
    hdr.bytes_count = bmap_bytes.into();
    hdr.flags = flags.into();
    hdr.segs_count = segs_per_chain.into();

    for chain in 0..SEGBMAP_SEGS {
        for replica in 0..SEGBMAP_SEG_COPY_MAX {
            hdr.segs[chain][replica] = segs[chain][replica].into();
        }
    }

    Ok(())
}

fn set_segbmap_presence_flag(layout: &mut VolumeLayout) {
    let feature_compat = u64::from(layout.sb.vs.feature_compat) | HAS_SEGBMAP_COMPAT_FLAG;
    layout.sb.vs.feature_compat = feature_compat.into();
}

fn segbmap_set_log_pages(layout: &mut VolumeLayout, blks: u32) -> Result<()> {
    mkfs_dbg!(
        layout.env.show_debug,
        "log_pages {}, blks_count {}",
        layout.segbmap.log_pages,
        blks
    );

    verify_internal!(blks != 0 && blks < u16::MAX as u32, "invalid segbmap log size {blks}");

    let pages_per_peb = layout.pages_per_peb();
    let log_pages = log::align_full_log_pages(pages_per_peb, blks, layout.segbmap.log_pages);

    verify_internal!(log_pages < u16::MAX as u32, "aligned segbmap log size is too large");

    layout.segbmap.log_pages = log_pages as u16;
    layout.sb.vh.segbmap_log_pages = (log_pages as u16).into();

    Ok(())
}

/// Writes the migration threshold of the subsystem into a committed full log
/// footer and re-seals it.
pub fn define_migration_threshold(
    layout: &mut VolumeLayout,
    seg_index: usize,
    peb_index: usize,
    migration_threshold: u16,
) -> Result<()> {
    let extent = &mut layout.segs[seg_index].pebs[peb_index].extents[LOG_FOOTER];
    let buf = match extent.buf.as_mut() {
        Some(buf) => buf,
        None => return Err(Error::internal("log footer extent is not prepared")),
    };

    let is_footer = {
        let footer: &LogFooter = cast(buf, 0);
        let key = footer.volume_state.magic.key;
        u16::from(key) == LOG_FOOTER_MAGIC
    };

    // A partial log header carries no volume state to patch.
    if !is_footer {
        return Ok(());
    }

    {
        let footer: &mut LogFooter = cast_mut(buf, 0);
        footer.volume_state.migration_threshold = migration_threshold.into();
    }

    let footer_len = mem::size_of::<LogFooter>() as u16;
    seal_record(buf, mem::size_of::<Signature>(), footer_len);

    Ok(())
}

impl MetadataOps for SegbmapOps {
    fn allocation_policy(&self, layout: &mut VolumeLayout) -> Result<Option<(SegmentPolicy, usize)>> {
        let seg_nums = layout.fs_segs_count();
        let fragment_size = MEM_PAGE_SIZE;
        let pebs_per_seg = layout.pebs_per_seg();

        layout.segbmap.bmap_bytes = bitmap::seg_bmap_bytes(seg_nums);
        let fragments = seg_bmap_fragments(seg_nums, fragment_size)? as u32;

        let mut fragments_per_peb = layout.segbmap.fragments_per_peb as u32;
        let mut fragments_per_seg = fragments_per_peb * pebs_per_seg;
        let mut segbmap_segs = crate::ceil_division(fragments as u64, fragments_per_seg as u64);

        // The payload may take at most 70% of a PEB; the log metadata needs
        // the rest.
        let payload_ceiling = ((layout.env.erase_size / fragment_size) * 70 / 100).max(1);

        if fragments_per_peb > payload_ceiling || segbmap_segs as usize > SEGBMAP_SEGS {
            fragments_per_peb = payload_ceiling.min(fragments.max(1));
            layout.segbmap.fragments_per_peb = fragments_per_peb as u16;

            mkfs_warn!("it will be used the new value: fragments_per_peb {}", fragments_per_peb);
        }

        layout.segbmap.pebs_per_seg = pebs_per_seg as u16;
        fragments_per_seg = fragments_per_peb * pebs_per_seg;
        segbmap_segs = crate::ceil_division(fragments as u64, fragments_per_seg as u64);

        if segbmap_segs as usize > SEGBMAP_SEGS {
            mkfs_err!("segbmap_segs {} > max {}", segbmap_segs, SEGBMAP_SEGS);
            return Err(Error::no_space("segment bitmap does not fit its chain"));
        }

        if layout.segbmap.segs_per_chain as u64 != segbmap_segs {
            layout.segbmap.segs_per_chain = segbmap_segs as u16;
            mkfs_warn!("it will be used the new value: segs_per_chain {}", segbmap_segs);
        }

        let segs = if layout.segbmap.has_backup_copy {
            layout.segbmap.segs_per_chain as usize * 2
        } else {
            layout.segbmap.segs_per_chain as usize
        };

        layout.segbmap.fragments_count = fragments;
        layout.segbmap.fragment_size = fragment_size;

        layout.meta_array[MetaIndex::SegmentBitmap as usize].segs_count = segs;
        layout.meta_array[MetaIndex::SegmentBitmap as usize].seg_state =
            Some(SegmentPolicy::Dedicated);

        mkfs_dbg!(
            layout.env.show_debug,
            "segbmap: segs {}, segs_per_chain {}, fragments_count {}, fragment_size {}, fragments_per_peb {}",
            segs,
            layout.segbmap.segs_per_chain,
            fragments,
            fragment_size,
            layout.segbmap.fragments_per_peb
        );

        Ok(Some((SegmentPolicy::Dedicated, segs)))
    }

    fn prepare(&self, layout: &mut VolumeLayout) -> Result<()> {
        reserve_segments(layout, MetaIndex::SegmentBitmap)?;

        let fragment_size = layout.segbmap.fragment_size;
        let fragments_per_peb = layout.segbmap.fragments_per_peb as u32;
        let peb_buffer_size = (fragment_size * fragments_per_peb) as usize;
        let buffers_count =
            layout.segbmap.segs_per_chain as usize * layout.segbmap.pebs_per_seg as usize;

        verify_internal!(
            layout.segbmap.fragments_array.is_empty(),
            "segment bitmap buffers are prepared twice"
        );

        for _ in 0..buffers_count {
            layout.segbmap.fragments_array.push(Some(vec![0u8; peb_buffer_size]));
        }

        for index in 0..layout.segbmap.fragments_count {
            prepare_fragment(layout, index)?;
        }

        Ok(())
    }

    fn validate(&self, layout: &mut VolumeLayout) -> Result<()> {
        // Assign segment IDs in subsystem order: every metadata segment turns
        // reserved, user data claims nothing.
        for index in 0..layout.segs.len() {
            let seg_type = match layout.segs[index].seg_type {
                Some(seg_type) => seg_type,
                None => {
                    mkfs_err!("segment {index} has no owner");
                    return Err(Error::internal("unowned segment in the array"));
                }
            };

            if seg_type == MetaIndex::UserData {
                continue;
            }

            let seg_id = allocate_segment(layout, bitmap::SEG_RESERVED)?;
            layout.segs[index].seg_id = seg_id;
            define_leb_ids(&mut layout.segs[index]);

            mkfs_dbg!(layout.env.show_debug, "seg_type {:?}, seg_id {}", seg_type, seg_id);
        }

        init_segbmap_sb_header(layout)?;

        let pebs_per_seg = layout.pebs_per_seg();
        if layout.segbmap.migration_threshold == u16::MAX {
            layout.segbmap.migration_threshold = layout.migration_threshold;
        } else if layout.segbmap.migration_threshold as u32 > pebs_per_seg {
            mkfs_warn!(
                "segbmap migration threshold {} was corrected to {}",
                layout.segbmap.migration_threshold,
                pebs_per_seg
            );
            layout.segbmap.migration_threshold = pebs_per_seg as u16;
        }

        set_segbmap_presence_flag(layout);
        Ok(())
    }

    fn define_layout(&self, layout: &mut VolumeLayout) -> Result<()> {
        let request = segbmap_request(layout)?;
        let pebs_per_seg = layout.segbmap.pebs_per_seg as usize;
        let fragments_count = layout.segbmap.fragments_count;
        let fragment_size = layout.segbmap.fragment_size;
        let fragments_per_peb = layout.segbmap.fragments_per_peb as u32;
        let peb_buffer_size = fragment_size * fragments_per_peb;
        let page_size = layout.page_size;
        let blkbmap_backup = layout.blkbmap.has_backup_copy;
        let blk2off_backup = layout.blk2off_tbl.has_backup_copy;

        let valid_blks = crate::ceil_division(peb_buffer_size as u64, page_size as u64) as u16;

        let mut buffer_index = 0usize;
        let mut log_pages = 0u32;
        let mut payload_offset_in_bytes = 0u32;
        let mut seg_index = request.start_seg_index.unwrap_or(0);

        for _ in 0..request.segs_count {
            let mut start_logical_blk = 0u32;

            for peb_index in 0..pebs_per_seg {
                if buffer_index as u32 * fragments_per_peb >= fragments_count {
                    break;
                }

                let logical_byte_offset = buffer_index as u64 * peb_buffer_size as u64;

                layout.segs[seg_index].pebs_count += 1;
                verify_internal!(
                    layout.segs[seg_index].pebs_count <= layout.segs[seg_index].pebs_capacity(),
                    "more logs than PEBs in segment {}",
                    seg_index
                );

                {
                    let peb = &mut layout.segs[seg_index].pebs[peb_index];
                    log::set_extent_start_offset(page_size, peb, SEG_HEADER)?;
                }
                log::define_segment_header_layout(layout, seg_index, peb_index)?;

                {
                    let peb = &mut layout.segs[seg_index].pebs[peb_index];
                    log::set_extent_start_offset(page_size, peb, BLOCK_BITMAP)?;
                }
                log::pre_commit_block_bitmap(layout, seg_index, peb_index, valid_blks)?;

                {
                    let peb = &mut layout.segs[seg_index].pebs[peb_index];
                    log::set_extent_start_offset(page_size, peb, OFFSET_TABLE)?;
                }
                log::pre_commit_offset_table(
                    layout,
                    seg_index,
                    peb_index,
                    logical_byte_offset,
                    start_logical_blk,
                    valid_blks,
                )?;

                {
                    let peb = &mut layout.segs[seg_index].pebs[peb_index];
                    log::set_extent_start_offset(page_size, peb, BLOCK_DESCRIPTORS)?;
                }
                log::pre_commit_block_descriptors(
                    layout,
                    seg_index,
                    peb_index,
                    valid_blks,
                    SEG_BMAP_INO,
                    payload_offset_in_bytes,
                    MEM_PAGE_SIZE,
                )?;

                {
                    let peb = &mut layout.segs[seg_index].pebs[peb_index];
                    log::set_extent_start_offset(page_size, peb, LOG_PAYLOAD)?;
                }

                {
                    let buffer = layout.segbmap.fragments_array[buffer_index].take();
                    let peb = &mut layout.segs[seg_index].pebs[peb_index];
                    let extent = &mut peb.extents[LOG_PAYLOAD];

                    verify_internal!(extent.buf.is_none(), "payload extent is prepared twice");
                    match buffer {
                        Some(buffer) => extent.buf = Some(buffer),
                        None => {
                            mkfs_err!("invalid fragment pointer: buffer_index {buffer_index}");
                            return Err(Error::internal("segment bitmap buffer is gone"));
                        }
                    }
                    extent.bytes_count = peb_buffer_size;
                }

                {
                    let peb = &mut layout.segs[seg_index].pebs[peb_index];
                    log::set_extent_start_offset(page_size, peb, LOG_FOOTER)?;
                }
                log::define_log_footer_layout(layout, seg_index, peb_index)?;

                if blkbmap_backup {
                    {
                        let peb = &mut layout.segs[seg_index].pebs[peb_index];
                        log::set_extent_start_offset(page_size, peb, BLOCK_BITMAP_BACKUP)?;
                    }
                    log::pre_commit_block_bitmap_backup(layout, seg_index, peb_index, valid_blks)?;
                }

                if blk2off_backup {
                    {
                        let peb = &mut layout.segs[seg_index].pebs[peb_index];
                        log::set_extent_start_offset(page_size, peb, OFFSET_TABLE_BACKUP)?;
                    }
                    log::pre_commit_offset_table_backup(
                        layout,
                        seg_index,
                        peb_index,
                        logical_byte_offset,
                        start_logical_blk,
                        valid_blks,
                    )?;
                }

                let blks = {
                    let peb = &layout.segs[seg_index].pebs[peb_index];
                    log::calculate_log_pages(page_size, layout.env.erase_size, peb)?
                };
                log_pages = log_pages.max(blks);

                buffer_index += 1;
                payload_offset_in_bytes += peb_buffer_size;
                start_logical_blk += valid_blks as u32;
            }

            seg_index += 1;
        }

        segbmap_set_log_pages(layout, log_pages)
    }

    fn commit(&self, layout: &mut VolumeLayout) -> Result<()> {
        let request = segbmap_request(layout)?;
        let pebs_per_seg = layout.segbmap.pebs_per_seg as usize;
        let fragment_size = layout.segbmap.fragment_size;
        let fragments_per_peb = layout.segbmap.fragments_per_peb as u32;
        let page_size = layout.page_size;
        let erase_size = layout.env.erase_size;
        let blkbmap_backup = layout.blkbmap.has_backup_copy;
        let blk2off_backup = layout.blk2off_tbl.has_backup_copy;
        let migration_threshold = layout.segbmap.migration_threshold;

        let mut seg_index = request.start_seg_index.unwrap_or(0);

        for _ in 0..request.segs_count {
            for peb_index in 0..pebs_per_seg {
                // Only PEBs that got a payload extent carry a log.
                let has_payload = {
                    let peb = &layout.segs[seg_index].pebs[peb_index];
                    match peb.extents[LOG_PAYLOAD].buf.as_ref() {
                        Some(buf) => {
                            let hdr: &SegbmapFragmentHeader = cast(buf, 0);
                            u16::from(hdr.magic) == SEGBMAP_HDR_MAGIC
                        }
                        None => false,
                    }
                };
                if !has_payload {
                    break;
                }

                log::pre_commit_segment_header(layout, seg_index, peb_index, SEGBMAP_SEG_TYPE)?;

                // Seal every fragment of the payload.
                {
                    let peb = &mut layout.segs[seg_index].pebs[peb_index];
                    let buf = match peb.extents[LOG_PAYLOAD].buf.as_mut() {
                        Some(buf) => buf,
                        None => return Err(Error::internal("payload extent is gone")),
                    };

                    for i in 0..fragments_per_peb {
                        let offset = (i * fragment_size) as usize;
                        let fragment_bytes = {
                            let hdr: &SegbmapFragmentHeader = cast(&buf[..], offset);
                            if u16::from(hdr.magic) != SEGBMAP_HDR_MAGIC {
                                break;
                            }
                            u16::from(hdr.fragment_bytes) as usize
                        };

                        {
                            let hdr: &mut SegbmapFragmentHeader = cast_mut(buf, offset);
                            hdr.checksum = 0u32.into();
                        }
                        let csum = crc32_le(&buf[offset..offset + fragment_bytes]);
                        let hdr: &mut SegbmapFragmentHeader = cast_mut(buf, offset);
                        hdr.checksum = csum.into();
                    }
                }

                log::pre_commit_log_footer(layout, seg_index, peb_index)?;

                let metadata_blks = {
                    let peb = &layout.segs[seg_index].pebs[peb_index];
                    log::calculate_metadata_blks(page_size, erase_size, peb)?
                };

                log::commit_block_bitmap(layout, seg_index, peb_index, metadata_blks)?;
                log::commit_offset_table(layout, seg_index, peb_index)?;

                if blkbmap_backup {
                    log::commit_block_bitmap_backup(layout, seg_index, peb_index, metadata_blks)?;
                }
                if blk2off_backup {
                    log::commit_offset_table_backup(layout, seg_index, peb_index)?;
                }

                let blks = {
                    let peb = &layout.segs[seg_index].pebs[peb_index];
                    log::calculate_log_pages(page_size, erase_size, peb)?
                };
                log::commit_log_footer(layout, seg_index, peb_index, blks)?;
                define_migration_threshold(layout, seg_index, peb_index, migration_threshold)?;
                log::commit_segment_header(layout, seg_index, peb_index, blks)?;
            }

            seg_index += 1;
        }

        layout.segs_count += request.segs_count;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fragment_capacity_and_chain_sizing() {
        // (4096 - 32) bytes keep two items per byte.
        assert_eq!(items_per_fragment(MEM_PAGE_SIZE), 8128);
        assert_eq!(first_fragment_item(1, MEM_PAGE_SIZE), 8128);

        // 128 segments: 64 bitmap bytes, one fragment.
        assert_eq!(seg_bmap_fragments(128, MEM_PAGE_SIZE).unwrap(), 1);
        // A fragment keeps 8128 items, one more forces a second fragment.
        assert_eq!(seg_bmap_fragments(8128, MEM_PAGE_SIZE).unwrap(), 1);
        assert_eq!(seg_bmap_fragments(8129, MEM_PAGE_SIZE).unwrap(), 2);
    }
}
