//! Image committer: validates the planned extents against the whole device,
//! erases the backing store and writes every reserved PEB out in page-aligned
//! staging buffer cycles.

use crate::error::{Error, Result};
use crate::layout::*;
use crate::mkfs_dbg;
use crate::mkfs_err;
use crate::verify_internal;
use std::alloc;
use std::slice;

/// Size of the erase fill buffer.
const ERASE_BUF_SIZE: usize = crate::SIZE_128KB as usize;

/// Page-aligned staging buffer for the device write cycles.
pub struct AlignedBuf {
    ptr: *mut u8,
    len: usize,
    layout: alloc::Layout,
}

impl AlignedBuf {
    pub fn new(len: usize, align: usize) -> Result<Self> {
        let layout = alloc::Layout::from_size_align(len, align)
            .map_err(|_| Error::internal("invalid staging buffer layout"))?;

        let ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(Error::internal("fail to allocate the staging buffer"));
        }

        Ok(AlignedBuf { ptr, len, layout })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    pub fn fill(&mut self, value: u8) {
        self.as_mut_slice().fill(value);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}

fn check_extent_before_write(layout: &VolumeLayout, peb_id: u64, extent: &ExtentDesc) -> Result<()> {
    let fs_size = layout.env.fs_size;
    let erasesize = layout.env.erase_size as u64;

    if extent.buf.is_none() {
        return Ok(());
    }

    verify_internal!(peb_id < u64::MAX / erasesize, "peb_id {} overflows the volume", peb_id);

    let peb_start_offset = peb_id * erasesize;
    if peb_start_offset >= fs_size {
        mkfs_err!("peb_start_offset {peb_start_offset} >= fs_size {fs_size}");
        return Err(Error::invalid("PEB lies beyond the volume"));
    }

    let extent_offset = extent.offset as u64;
    let extent_size = extent.bytes_count as u64;

    verify_internal!(extent_size != 0, "prepared extent of zero bytes");

    if peb_start_offset + extent_offset + extent_size > fs_size {
        mkfs_err!(
            "peb_start_offset {peb_start_offset}, extent_offset {extent_offset}, extent_size {extent_size}, fs_size {fs_size}"
        );
        return Err(Error::invalid("extent lies beyond the volume"));
    }

    if extent_offset + extent_size > erasesize {
        mkfs_err!("extent (offset {extent_offset}, size {extent_size}) is outside of erasesize {erasesize}");
        return Err(Error::invalid("extent lies outside its erase block"));
    }

    Ok(())
}

/// Verifies one PEB's extents grow monotonically with sub-page gaps only, and
/// claims the destination pages in the global write-position bitmap.
fn check_peb_before_write(layout: &VolumeLayout, peb: &PebContent, bmap: &mut [u8]) -> Result<u32> {
    let erasesize = layout.env.erase_size as u64;
    let pagesize = layout.page_size as u64;

    let mut start_offset: Option<u64> = None;
    let mut payload_size = 0u64;

    for (index, extent) in peb.extents.iter().enumerate() {
        if extent.buf.is_none() {
            continue;
        }

        check_extent_before_write(layout, peb.peb_id, extent).map_err(|err| {
            mkfs_err!("invalid extent: index {index}, peb_id {}", peb.peb_id);
            err
        })?;

        match start_offset {
            None => {
                start_offset = Some(extent.offset as u64);
                payload_size = extent.bytes_count as u64;
            }
            Some(start) => {
                let cur_offset = start + payload_size;
                let offset = extent.offset as u64;

                if cur_offset > offset {
                    mkfs_err!(
                        "invalid extent: cur_offset {cur_offset}, offset {offset}, size {}",
                        extent.bytes_count
                    );
                    return Err(Error::invalid("extents overlap"));
                }

                if offset - cur_offset >= pagesize {
                    mkfs_err!(
                        "invalid extent: cur_offset {cur_offset}, offset {offset}, size {}",
                        extent.bytes_count
                    );
                    return Err(Error::invalid("hole between extents spans a page"));
                }

                payload_size += (offset - cur_offset) + extent.bytes_count as u64;
            }
        }
    }

    let start_offset = match start_offset {
        Some(start) => start,
        None => return Err(Error::internal("PEB carries no prepared extent")),
    };
    verify_internal!(payload_size != 0, "PEB log of zero bytes");

    let aligned_offset = (start_offset / pagesize) * pagesize;
    let aligned_size = payload_size + (start_offset - aligned_offset);

    let start_blk = (peb.peb_id * erasesize + aligned_offset) / pagesize;
    let blks = crate::ceil_division(aligned_size, pagesize);

    for i in 0..blks {
        let cur_blk = start_blk + i;
        let byte = (cur_blk / 8) as usize;
        let bit = (cur_blk % 8) as u8;

        if bmap[byte] & (1 << bit) != 0 {
            mkfs_err!("block {cur_blk} has been used yet");
            return Err(Error::invalid("two logs claim the same page"));
        }
        bmap[byte] |= 1 << bit;
    }

    Ok(blks as u32)
}

/// Walks every prepared PEB before touching the device: extent geometry and a
/// 1-bit-per-page claim bitmap across the whole volume.
pub fn check_layout_before_write(layout: &VolumeLayout) -> Result<()> {
    let fs_blks = layout.env.fs_size / layout.page_size as u64;
    let seg_blks_capacity = layout.seg_size / layout.page_size as u64;
    let mut bmap = vec![0u8; crate::ceil_division(fs_blks, 8) as usize];

    for (seg_index, seg) in layout.segs.iter().enumerate() {
        let mut seg_blks = 0u64;

        for peb_index in 0..seg.pebs_count as usize {
            let blks =
                check_peb_before_write(layout, &seg.pebs[peb_index], &mut bmap).map_err(|err| {
                    mkfs_err!("invalid PEB: seg_index {seg_index}, peb_index {peb_index}");
                    err
                })?;

            seg_blks += blks as u64;
        }

        if seg_blks > seg_blks_capacity {
            mkfs_err!("blocks count {seg_blks} is greater than {seg_blks_capacity}");
            return Err(Error::no_space("segment content exceeds the segment"));
        }
    }

    Ok(())
}

fn erase_range(layout: &mut VolumeLayout, offset: u64, size: u64, fill_buf: &[u8]) -> Result<()> {
    let ops = layout.env.ops;
    let show_debug = layout.env.show_debug;
    let file = match layout.env.file.as_ref() {
        Some(file) => file,
        None => return Err(Error::internal("device is not opened")),
    };

    ops.erase(file, offset, size, fill_buf, show_debug)
}

/// Erases the backing store: the whole device when requested, otherwise only
/// the reserved PEBs.
pub fn erase_device(layout: &mut VolumeLayout) -> Result<()> {
    mkfs_dbg!(
        layout.env.show_debug,
        "device {}, segs_count {}, seg_size {}, need_erase_device {}, is_volume_erased {}",
        layout.env.dev_name,
        layout.segs_count,
        layout.seg_size,
        layout.need_erase_device,
        layout.is_volume_erased
    );

    if layout.is_volume_erased {
        return Ok(());
    }

    // Erased flash reads back as all-ones.
    let fill_buf = vec![0xFFu8; ERASE_BUF_SIZE];

    if layout.need_erase_device {
        let seg_size = layout.seg_size;
        let fs_segs_count = layout.fs_segs_count();
        let mut offset = 0u64;

        for i in 0..fs_segs_count {
            mkfs_dbg!(layout.env.show_debug, "erasing segment {i}...");

            erase_range(layout, offset, seg_size, &fill_buf).map_err(|err| {
                mkfs_err!("unable to erase segment #{i}");
                err
            })?;

            offset += seg_size;
        }
    } else {
        let erase_size = layout.env.erase_size as u64;

        for seg_index in 0..layout.segs.len() {
            for peb_index in 0..layout.segs[seg_index].pebs_count as usize {
                let peb_id = layout.segs[seg_index].pebs[peb_index].peb_id;

                erase_range(layout, peb_id * erase_size, erase_size, &fill_buf).map_err(|err| {
                    mkfs_err!("fail to erase peb: seg_index {seg_index}, peb_index {peb_index}");
                    err
                })?;
            }
        }
    }

    Ok(())
}

fn flush_write_buffer(layout: &mut VolumeLayout, staging: &mut AlignedBuf, offset: u64, size: usize) -> Result<()> {
    verify_internal!(
        size != 0 && size <= staging.len(),
        "invalid requested size: size {}, capacity {}",
        size,
        staging.len()
    );
    verify_internal!(offset % layout.page_size as u64 == 0, "unaligned offset {}", offset);

    let geometry = crate::device::NandGeometry {
        erasesize: layout.env.erase_size,
        writesize: layout.page_size,
    };
    let ops = layout.env.ops;
    let show_debug = layout.env.show_debug;

    {
        let file = match layout.env.file.as_ref() {
            Some(file) => file,
            None => return Err(Error::internal("device is not opened")),
        };

        ops.write(
            file,
            &geometry,
            offset,
            &staging.as_slice()[..size],
            &mut layout.env.open_zones,
            show_debug,
        )
        .map_err(|err| {
            mkfs_err!("unable to write: offset {offset}, bytes_count {size}");
            err
        })?;
    }

    staging.fill(0xFF);

    Ok(())
}

fn write_peb(
    layout: &mut VolumeLayout,
    staging: &mut AlignedBuf,
    seg_index: usize,
    peb_index: usize,
) -> Result<u64> {
    let capacity = staging.len();
    let peb_id = layout.segs[seg_index].pebs[peb_index].peb_id;
    let peb_start = peb_id * layout.env.erase_size as u64;

    staging.fill(0xFF);

    // The staging window covers `capacity` bytes of the PEB starting at
    // `window_base`; `staged` is the high-water mark inside it.
    let mut window_base: Option<usize> = None;
    let mut staged = 0usize;
    let mut peb_offset = 0usize;
    let mut written = 0u64;

    for extent_index in 0..SEG_LOG_ITEMS_COUNT {
        let (offset, bytes_count, has_buf) = {
            let extent = &layout.segs[seg_index].pebs[peb_index].extents[extent_index];
            (extent.offset as usize, extent.bytes_count as usize, extent.buf.is_some())
        };
        if !has_buf {
            continue;
        }

        verify_internal!(
            offset >= peb_offset,
            "extent offset {} below the write position {}",
            offset,
            peb_offset
        );

        peb_offset = offset;
        let mut copied_total = 0usize;

        while copied_total < bytes_count {
            let wanted_base = (peb_offset / capacity) * capacity;

            match window_base {
                Some(base) if base != wanted_base => {
                    flush_write_buffer(layout, staging, peb_start + base as u64, capacity)?;
                    written += capacity as u64;
                    window_base = None;
                    staged = 0;
                    continue;
                }
                None => window_base = Some(wanted_base),
                _ => {}
            }

            let window_offset = peb_offset - wanted_base;
            verify_internal!(
                window_offset >= staged,
                "write position {} fell behind the staged bytes",
                peb_offset
            );

            let chunk = (bytes_count - copied_total).min(capacity - window_offset);
            {
                let extent = &layout.segs[seg_index].pebs[peb_index].extents[extent_index];
                let buf = match extent.buf.as_ref() {
                    Some(buf) => buf,
                    None => return Err(Error::internal("extent buffer is gone")),
                };
                staging.as_mut_slice()[window_offset..window_offset + chunk]
                    .copy_from_slice(&buf[copied_total..copied_total + chunk]);
            }

            staged = window_offset + chunk;
            copied_total += chunk;
            peb_offset += chunk;

            if staged == capacity {
                flush_write_buffer(layout, staging, peb_start + wanted_base as u64, capacity)?;
                written += capacity as u64;
                window_base = None;
                staged = 0;
            }
        }
    }

    if let Some(base) = window_base {
        if staged > 0 {
            flush_write_buffer(layout, staging, peb_start + base as u64, capacity)?;
            written += capacity as u64;
        }
    }

    Ok(written)
}

fn write_segments(layout: &mut VolumeLayout, staging: &mut AlignedBuf) -> Result<()> {
    for seg_index in 0..layout.segs.len() {
        for peb_index in 0..layout.segs[seg_index].pebs_count as usize {
            write_peb(layout, staging, seg_index, peb_index).map_err(|err| {
                mkfs_err!("fail to write PEB: seg_index {seg_index}, peb_index {peb_index}");
                err
            })?;
        }
    }

    Ok(())
}

/// Final pass: validates the planned layout, erases the device and writes
/// every reserved PEB, then syncs the file descriptor.
pub fn write_device(layout: &mut VolumeLayout) -> Result<()> {
    mkfs_dbg!(
        layout.env.show_debug,
        "device {}, segs_capacity {}, segs_count {}",
        layout.env.dev_name,
        layout.segs.len(),
        layout.segs_count
    );

    verify_internal!(!layout.segs.is_empty(), "no segment was prepared");

    if layout.segs.len() != layout.segs_count {
        mkfs_err!(
            "segs_capacity {} is unequal to segs_count {}",
            layout.segs.len(),
            layout.segs_count
        );
        return Err(Error::internal("a subsystem skipped its commit phase"));
    }

    check_layout_before_write(layout)?;
    erase_device(layout)?;

    let capacity = layout.page_size.max(crate::SIZE_4KB as u32) as usize;
    let mut staging = AlignedBuf::new(capacity, capacity)?;
    write_segments(layout, &mut staging)?;

    let file = match layout.env.file.as_ref() {
        Some(file) => file,
        None => return Err(Error::internal("device is not opened")),
    };
    file.sync_all().map_err(|err| {
        mkfs_err!("fail to sync device {}: {err}", layout.env.dev_name);
        Error::Io(err)
    })?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn peb_with_extents(peb_id: u64, extents: &[(usize, u32, u32)]) -> PebContent {
        let mut peb = PebContent::new();
        peb.peb_id = peb_id;
        for &(index, offset, bytes) in extents {
            peb.extents[index].offset = offset;
            peb.extents[index].bytes_count = bytes;
            peb.extents[index].buf = Some(vec![0xAB; bytes as usize]);
        }
        peb
    }

    fn committer_layout() -> VolumeLayout {
        let mut layout = VolumeLayout::new();
        layout.env.fs_size = crate::SIZE_1GB;
        layout.env.erase_size = crate::SIZE_8MB as u32;
        layout.seg_size = crate::SIZE_8MB;
        layout.page_size = crate::SIZE_4KB as u32;
        layout
    }

    fn push_seg(layout: &mut VolumeLayout, peb: PebContent) {
        layout.segs.push(SegmentDesc {
            seg_type: Some(MetaIndex::Superblock),
            seg_state: Some(SegmentPolicy::Dedicated),
            seg_id: peb.peb_id,
            pebs: vec![peb],
            pebs_count: 1,
        });
        layout.segs_count += 1;
    }

    #[test]
    fn overlapping_extents_are_rejected() {
        let mut layout = committer_layout();
        push_seg(
            &mut layout,
            peb_with_extents(1, &[(SEG_HEADER, 0, 2048), (LOG_FOOTER, 1024, 2048)]),
        );

        assert!(check_layout_before_write(&layout).is_err());
    }

    #[test]
    fn page_spanning_holes_are_rejected() {
        let mut layout = committer_layout();
        push_seg(
            &mut layout,
            peb_with_extents(1, &[(SEG_HEADER, 0, 2048), (LOG_FOOTER, 8192, 2048)]),
        );

        assert!(check_layout_before_write(&layout).is_err());
    }

    #[test]
    fn cross_peb_page_collisions_are_rejected() {
        let mut layout = committer_layout();
        // Two logs claiming the pages of PEB 1.
        push_seg(&mut layout, peb_with_extents(1, &[(SEG_HEADER, 0, 2048)]));
        push_seg(&mut layout, peb_with_extents(1, &[(SEG_HEADER, 0, 2048)]));

        assert!(check_layout_before_write(&layout).is_err());
    }

    #[test]
    fn disjoint_pebs_pass_validation() {
        let mut layout = committer_layout();
        push_seg(
            &mut layout,
            peb_with_extents(0, &[(SEG_HEADER, 1024, 2048), (LOG_FOOTER, 4096, 2048)]),
        );
        push_seg(
            &mut layout,
            peb_with_extents(1, &[(SEG_HEADER, 0, 2048), (LOG_FOOTER, 4096, 2048)]),
        );

        check_layout_before_write(&layout).unwrap();
    }

    #[test]
    fn builds_and_verifies_a_small_volume() {
        use crate::bitmap;
        use crate::ondisk::*;
        use std::mem;

        let path = std::env::temp_dir().join(format!("emberfs-volume-{}", std::process::id()));
        {
            use std::io::Seek;
            use std::io::SeekFrom;
            use std::io::Write;

            let mut file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .unwrap();
            file.seek(SeekFrom::Start(16 * crate::SIZE_1MB - 1)).unwrap();
            file.write_all(&[0]).unwrap();
        }

        // 16 MiB image, single-PEB segments: 128 segments of 128 KiB.
        let mut layout = VolumeLayout::new();
        layout.seg_size = crate::SIZE_128KB;
        layout.env.erase_size = crate::SIZE_128KB as u32;
        layout.page_size = crate::SIZE_4KB as u32;
        layout.env.show_info = false;
        layout.env.dev_name = path.to_string_lossy().into_owned();

        crate::device::open_device(&mut layout.env).unwrap();
        crate::layout::validate_key_creation_options(&mut layout).unwrap();
        crate::layout::alloc_segs_array(&mut layout).unwrap();
        crate::layout::mkfs_create(&mut layout).unwrap();
        write_device(&mut layout).unwrap();

        // Metadata takes segments 0..=8: the initial snapshot, six superblock
        // chain slots, the segment bitmap and the mapping table. LEBs map
        // onto PEBs in allocation order, so the mapping is the identity.
        assert_eq!(layout.segs.len(), 9);
        for (index, seg) in layout.segs.iter().enumerate() {
            assert_eq!(seg.seg_id, index as u64);
        }

        let image = std::fs::read(&path).unwrap();
        let erase = crate::SIZE_128KB as usize;
        let hdr_size = mem::size_of::<SegmentHeader>();

        // Initial snapshot log: segment header behind the boot record gap.
        let snap_off = RESERVED_BOOT_RECORD_SIZE as usize;
        let hdr: &SegmentHeader = cast(&image, snap_off);
        assert_eq!(u32::from(hdr.volume_hdr.magic.common), SUPER_MAGIC);
        assert_eq!(u16::from(hdr.volume_hdr.magic.key), SEGMENT_HDR_MAGIC);
        assert_eq!(u16::from(hdr.seg_type), INITIAL_SNAPSHOT_SEG_TYPE);
        assert!(record_csum_valid(&image[snap_off..snap_off + hdr_size], 0x08));

        let vh = hdr.volume_hdr;
        assert_eq!(vh.log_pagesize, 12);
        assert_eq!(vh.log_erasesize, 17);
        assert_eq!(vh.log_segsize, 17);
        assert_eq!(u16::from(vh.pebs_per_seg), 1);

        // The superblock chain: cur/next/reserved mapped, prev marked unused.
        assert_eq!(u64::from(vh.sb_pebs[CUR_SB_SEG][MAIN_SB_SEG].peb_id), 1);
        assert_eq!(u64::from(vh.sb_pebs[CUR_SB_SEG][COPY_SB_SEG].peb_id), 2);
        assert_eq!(u64::from(vh.sb_pebs[NEXT_SB_SEG][MAIN_SB_SEG].peb_id), 3);
        assert_eq!(u64::from(vh.sb_pebs[RESERVED_SB_SEG][COPY_SB_SEG].peb_id), 6);
        assert_eq!(u64::from(vh.sb_pebs[PREV_SB_SEG][MAIN_SB_SEG].peb_id), u64::MAX);

        assert_eq!(u64::from(vh.segbmap.segs[0][MAIN_SEGBMAP_SEG]), 7);
        let maptbl_extent = vh.maptbl.extents[0][MAIN_MAPTBL_SEG];
        assert_eq!(u64::from(maptbl_extent.start_id), 8);
        assert_eq!(u32::from(maptbl_extent.len), 1);
        assert_eq!(u16::from(maptbl_extent.kind), SEG_EXTENT_TYPE);

        // Snapshot footer: the volume state snapshot.
        let footer_off = 4096;
        let footer: &LogFooter = cast(&image, footer_off);
        assert_eq!(u16::from(footer.volume_state.magic.key), LOG_FOOTER_MAGIC);
        assert_eq!(u64::from(footer.volume_state.nsegs), 128);
        assert_eq!(u16::from(footer.volume_state.state), VALID_FS);
        assert!(record_csum_valid(
            &image[footer_off..footer_off + mem::size_of::<LogFooter>()],
            0x08
        ));

        // Current superblock log: header, inline maptbl cache, footer.
        let sb_off = erase;
        let sb_hdr: &SegmentHeader = cast(&image, sb_off);
        assert_eq!(u16::from(sb_hdr.seg_type), SB_SEG_TYPE);
        let sb_flags = u32::from(sb_hdr.seg_flags);
        assert_ne!(sb_flags & LOG_HAS_MAPTBL_CACHE, 0);
        assert_ne!(sb_flags & LOG_HAS_FOOTER, 0);
        assert!(record_csum_valid(&image[sb_off..sb_off + hdr_size], 0x08));

        let cache_desc = sb_hdr.desc_array[MAPTBL_CACHE_INDEX];
        let cache_off = sb_off + u32::from(cache_desc.offset) as usize;
        let cache_hdr: &MaptblCacheHeader = cast(&image, cache_off);
        assert_eq!(u16::from(cache_hdr.magic.key), MAPTBL_CACHE_MAGIC);
        assert_eq!(u16::from(cache_hdr.items_count), 9);
        assert_eq!(u64::from(cache_hdr.start_leb), 0);
        assert_eq!(u64::from(cache_hdr.end_leb), 8);
        for i in 0..9usize {
            let pair: &Leb2PebPair =
                cast(&image, cache_off + mem::size_of::<MaptblCacheHeader>() + i * 0x10);
            assert_eq!(u64::from(pair.leb_id), i as u64);
            assert_eq!(u64::from(pair.peb_id), i as u64);
        }

        // Segment bitmap payload: the metadata segments are reserved, the
        // rest of the volume stays clean.
        let segbmap_off = 7 * erase;
        let segbmap_hdr: &SegmentHeader = cast(&image, segbmap_off);
        assert_eq!(u16::from(segbmap_hdr.seg_type), SEGBMAP_SEG_TYPE);

        let payload_desc = segbmap_hdr.desc_array[COLD_PAYLOAD_AREA_INDEX];
        let payload_off = segbmap_off + u32::from(payload_desc.offset) as usize;
        let frag_hdr: &SegbmapFragmentHeader = cast(&image, payload_off);
        assert_eq!(u16::from(frag_hdr.magic), SEGBMAP_HDR_MAGIC);

        let bmap_start = payload_off + mem::size_of::<SegbmapFragmentHeader>();
        let bmap_end = payload_off + u16::from(frag_hdr.fragment_bytes) as usize;
        let seg_bmap = &image[bmap_start..bmap_end];
        for seg in 0..9u64 {
            assert_eq!(bitmap::seg_bmap_get(seg_bmap, seg), bitmap::SEG_RESERVED);
        }
        for seg in 9..128u64 {
            assert_eq!(bitmap::seg_bmap_get(seg_bmap, seg), bitmap::SEG_CLEAN);
        }

        // Mapping table payload: every metadata LEB mapped, the PEB states
        // and types match the owning subsystems.
        let maptbl_off = 8 * erase;
        let maptbl_hdr: &SegmentHeader = cast(&image, maptbl_off);
        assert_eq!(u16::from(maptbl_hdr.seg_type), MAPTBL_SEG_TYPE);

        let payload_desc = maptbl_hdr.desc_array[COLD_PAYLOAD_AREA_INDEX];
        let lebtbl_off = maptbl_off + u32::from(payload_desc.offset) as usize;
        let lebtbl_hdr: &LebTableFragmentHeader = cast(&image, lebtbl_off);
        assert_eq!(u16::from(lebtbl_hdr.magic), LEB_TABLE_MAGIC);
        assert_eq!(u16::from(lebtbl_hdr.mapped_lebs), 9);

        for leb in 0..9usize {
            let desc: &LebDescriptor = cast(
                &image,
                lebtbl_off + mem::size_of::<LebTableFragmentHeader>() + leb * 4,
            );
            assert_eq!(u16::from(desc.physical_index), leb as u16);
        }

        let pebtbl_off = lebtbl_off + 4096;
        let pebtbl_hdr: &PebTableFragmentHeader = cast(&image, pebtbl_off);
        assert_eq!(u16::from(pebtbl_hdr.magic), PEB_TABLE_MAGIC);

        let expected_types = [
            MAPTBL_INIT_SNAP_PEB_TYPE,
            MAPTBL_SBSEG_PEB_TYPE,
            MAPTBL_SBSEG_PEB_TYPE,
            MAPTBL_SBSEG_PEB_TYPE,
            MAPTBL_SBSEG_PEB_TYPE,
            MAPTBL_SBSEG_PEB_TYPE,
            MAPTBL_SBSEG_PEB_TYPE,
            MAPTBL_SEGBMAP_PEB_TYPE,
            MAPTBL_MAPTBL_PEB_TYPE,
        ];
        for (peb, expected) in expected_types.iter().enumerate() {
            let used = pebtbl_hdr.bmaps[PEBTBL_USED_BMAP][peb / 8] & (1 << (peb % 8)) != 0;
            assert!(used);

            let desc: &PebDescriptor = cast(
                &image,
                pebtbl_off + mem::size_of::<PebTableFragmentHeader>() + peb * 8,
            );
            assert_eq!(desc.state, MAPTBL_USING_PEB_STATE);
            assert_eq!(desc.peb_type, *expected);
        }

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn write_peb_lands_extents_at_their_offsets() {
        use std::io::Read;
        use std::io::Seek;
        use std::io::SeekFrom;
        use std::io::Write;

        let path = std::env::temp_dir().join(format!("emberfs-commit-{}", std::process::id()));
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.seek(SeekFrom::Start(crate::SIZE_8MB * 2 - 1)).unwrap();
        file.write_all(&[0]).unwrap();

        let mut layout = committer_layout();
        layout.env.fs_size = crate::SIZE_8MB * 2;
        layout.env.file = Some(file.try_clone().unwrap());

        let mut peb = PebContent::new();
        peb.peb_id = 1;
        peb.extents[SEG_HEADER].offset = 0;
        peb.extents[SEG_HEADER].bytes_count = 2048;
        peb.extents[SEG_HEADER].buf = Some(vec![0x11; 2048]);
        peb.extents[LOG_FOOTER].offset = 8192;
        peb.extents[LOG_FOOTER].bytes_count = 2048;
        peb.extents[LOG_FOOTER].buf = Some(vec![0x22; 2048]);
        push_seg(&mut layout, peb);

        let mut staging = AlignedBuf::new(4096, 4096).unwrap();
        write_peb(&mut layout, &mut staging, 0, 0).unwrap();

        let mut back = vec![0u8; 2048];
        file.seek(SeekFrom::Start(crate::SIZE_8MB)).unwrap();
        file.read_exact(&mut back).unwrap();
        assert!(back.iter().all(|b| *b == 0x11));

        file.seek(SeekFrom::Start(crate::SIZE_8MB + 8192)).unwrap();
        file.read_exact(&mut back).unwrap();
        assert!(back.iter().all(|b| *b == 0x22));

        // The gap page between the two extents is padded with erased bytes.
        let mut pad = vec![0u8; 4096];
        file.seek(SeekFrom::Start(crate::SIZE_8MB + 4096)).unwrap();
        file.read_exact(&mut pad).unwrap();
        assert!(pad.iter().all(|b| *b == 0xFF));

        std::fs::remove_file(path).unwrap();
    }
}
