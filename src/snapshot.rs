//! Initial snapshot subsystem.
//!
//! One dedicated segment pinned at segment ID 0 whose single PEB carries the
//! smallest possible log: a segment header displaced by the reserved boot
//! record gap and a log footer. The first kilobyte of the volume stays
//! untouched for a boot record.

use crate::error::{Error, Result};
use crate::layout::*;
use crate::log;
use crate::mkfs_dbg;
use crate::mkfs_err;
use crate::ondisk;

pub struct SnapshotOps;

pub static SNAPSHOT_OPS: SnapshotOps = SnapshotOps;

fn request(layout: &VolumeLayout) -> Result<MetadataSegRequest> {
    let request = layout.meta_array[MetaIndex::InitialSnapshot as usize];

    if request.segs_count != 1 {
        mkfs_err!("invalid segs_count {}", request.segs_count);
        return Err(Error::internal("initial snapshot owns exactly one segment"));
    }

    match request.start_seg_index {
        Some(index) if index < layout.segs.len() => Ok(request),
        _ => Err(Error::internal("initial snapshot segment is not reserved")),
    }
}

impl MetadataOps for SnapshotOps {
    fn allocation_policy(&self, layout: &mut VolumeLayout) -> Result<Option<(SegmentPolicy, usize)>> {
        layout.meta_array[MetaIndex::InitialSnapshot as usize].segs_count = 1;
        layout.meta_array[MetaIndex::InitialSnapshot as usize].seg_state =
            Some(SegmentPolicy::Dedicated);

        mkfs_dbg!(layout.env.show_debug, "initial snapshot segs 1");

        Ok(Some((SegmentPolicy::Dedicated, 1)))
    }

    fn prepare(&self, layout: &mut VolumeLayout) -> Result<()> {
        reserve_segments(layout, MetaIndex::InitialSnapshot)
    }

    fn define_layout(&self, layout: &mut VolumeLayout) -> Result<()> {
        let request = request(layout)?;
        let seg_index = request.start_seg_index.unwrap_or(0);
        let peb_index = 0usize;
        let page_size = layout.page_size;

        layout.segs[seg_index].pebs_count = 1;

        {
            let peb = &mut layout.segs[seg_index].pebs[peb_index];
            log::set_extent_start_offset(page_size, peb, SEG_HEADER)?;
            // Keep the volume's first kilobyte free for a boot record.
            peb.extents[SEG_HEADER].offset += ondisk::RESERVED_BOOT_RECORD_SIZE;
        }

        log::define_segment_header_layout(layout, seg_index, peb_index)?;

        {
            let peb = &mut layout.segs[seg_index].pebs[peb_index];
            log::set_extent_start_offset(page_size, peb, LOG_FOOTER)?;
        }

        log::define_log_footer_layout(layout, seg_index, peb_index)?;

        Ok(())
    }

    fn commit(&self, layout: &mut VolumeLayout) -> Result<()> {
        let request = request(layout)?;
        let seg_index = request.start_seg_index.unwrap_or(0);
        let peb_index = 0usize;

        crate::verify_internal!(
            layout.segs[seg_index].seg_id == ondisk::INITIAL_SNAPSHOT_SEG,
            "initial snapshot landed in segment {}",
            layout.segs[seg_index].seg_id
        );

        log::pre_commit_segment_header(
            layout,
            seg_index,
            peb_index,
            ondisk::INITIAL_SNAPSHOT_SEG_TYPE,
        )?;
        log::pre_commit_log_footer(layout, seg_index, peb_index)?;

        let blks = {
            let peb = &layout.segs[seg_index].pebs[peb_index];
            log::calculate_log_pages(layout.page_size, layout.env.erase_size, peb)?
        };

        log::commit_log_footer(layout, seg_index, peb_index, blks)?;
        log::commit_segment_header(layout, seg_index, peb_index, blks)?;

        layout.segs_count += request.segs_count;
        Ok(())
    }
}
