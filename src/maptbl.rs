//! PEB mapping table subsystem.
//!
//! Sizes the LEB/PEB tables into PEB-sized fragments, initializes every
//! portion (one LEB table plus a group of PEB table stripes), maps the LEBs
//! of all allocated metadata segments to PEBs, marks the unmapped PEBs as
//! erase candidates and publishes the table's location through the
//! superblock's mapping table header.

use crate::device::DeviceType;
use crate::device::PebCondition;
use crate::error::{Error, Result};
use crate::layout::*;
use crate::log;
use crate::maptbl_cache;
use crate::mkfs_dbg;
use crate::mkfs_err;
use crate::mkfs_warn;
use crate::ondisk::*;
use crate::verify_internal;
use crate::MEM_PAGE_SIZE;
use std::mem;

const LEBTBL_HDR_SIZE: usize = mem::size_of::<LebTableFragmentHeader>();
const PEBTBL_HDR_SIZE: usize = mem::size_of::<PebTableFragmentHeader>();
const LEB_DESC_SIZE: usize = mem::size_of::<LebDescriptor>();
const PEB_DESC_SIZE: usize = mem::size_of::<PebDescriptor>();

pub struct MaptblOps;

pub static MAPTBL_OPS: MaptblOps = MaptblOps;

/// LEB descriptors fitting into one LEB table mempage.
pub fn leb_desc_per_mempage() -> u32 {
    (MEM_PAGE_SIZE as usize - LEBTBL_HDR_SIZE) as u32 / LEB_DESC_SIZE as u32
}

/// PEB descriptors fitting into one PEB table stripe.
pub fn peb_desc_per_stripe() -> u32 {
    (MEM_PAGE_SIZE as usize - PEBTBL_HDR_SIZE) as u32 / PEB_DESC_SIZE as u32
}

fn maptbl_request(layout: &VolumeLayout) -> Result<MetadataSegRequest> {
    let request = layout.meta_array[MetaIndex::MappingTable as usize];

    if request.segs_count == 0 {
        mkfs_err!("invalid segs_count {}", request.segs_count);
        return Err(Error::internal("mapping table chain is not reserved"));
    }

    match request.start_seg_index {
        Some(index) if index < layout.segs.len() => Ok(request),
        _ => Err(Error::internal("mapping table segments are not reserved")),
    }
}

/// Aligns the configured stripes count with the NAND dies count.
fn correct_stripes_per_portion(layout: &mut VolumeLayout) {
    let mut stripes = layout.maptbl.stripes_per_portion as u32;
    let nand_dies = layout.nand_dies_count;
    let mut corrected = false;

    if stripes > nand_dies {
        if stripes % nand_dies != 0 {
            stripes -= stripes % nand_dies;
            corrected = true;
        }
    } else if stripes < nand_dies && nand_dies % stripes != 0 {
        stripes -= nand_dies % stripes;
        corrected = true;
    }

    if corrected && stripes > 0 {
        layout.maptbl.stripes_per_portion = stripes as u16;
        crate::mkfs_info!(
            layout.env.show_info,
            "maptbl layout is corrected: stripes_per_portion {}",
            stripes
        );
    }
}

/// Locates the LEB table mempage keeping `leb_id` and the descriptor index
/// inside it.
fn locate_leb(layout: &VolumeLayout, leb_id: u64) -> Result<(usize, u32, u32, u16)> {
    let lebs_per_portion = layout.maptbl.lebs_per_portion as u64;
    let portions_per_fragment = layout.maptbl.portions_per_fragment as u64;
    let lebs_per_peb = lebs_per_portion * portions_per_fragment;

    let fragment_index = (leb_id / lebs_per_peb) as usize;
    verify_internal!(
        fragment_index < layout.maptbl.fragments_array.len(),
        "LEB {} is beyond the mapping table",
        leb_id
    );

    let diff = leb_id - fragment_index as u64 * lebs_per_peb;
    let portion_index = (diff / lebs_per_portion) as u32;
    let diff = diff - portion_index as u64 * lebs_per_portion;

    let mempage_index = (diff / leb_desc_per_mempage() as u64) as u32;
    verify_internal!(
        mempage_index < layout.maptbl.lebtbl_portion_mempages as u32,
        "LEB {} points outside its portion's LEB table",
        leb_id
    );

    let leb_desc_index = (diff % leb_desc_per_mempage() as u64) as u16;

    Ok((fragment_index, portion_index, mempage_index, leb_desc_index))
}

fn lebtbl_offset(layout: &VolumeLayout, portion_index: u32, mempage_index: u32) -> usize {
    portion_index as usize * layout.maptbl.portion_size as usize
        + mempage_index as usize * layout.page_size as usize
}

fn pebtbl_offset(layout: &VolumeLayout, portion_index: u32, stripe_index: u32) -> usize {
    portion_index as usize * layout.maptbl.portion_size as usize
        + layout.maptbl.lebtbl_portion_bytes as usize
        + stripe_index as usize * layout.page_size as usize
}

/// Selects the stripe a LEB belongs to inside its portion.
fn stripe_index_for_leb(layout: &VolumeLayout, start_leb: u64, leb_id: u64) -> u32 {
    let stripes_per_portion = layout.maptbl.stripes_per_portion as u32;
    let pebs_per_seg = layout.pebs_per_seg();
    let leb_index = (leb_id % pebs_per_seg as u64) as u32;

    if stripes_per_portion == 1 {
        ((leb_id - start_leb) / peb_desc_per_stripe() as u64) as u32
    } else if pebs_per_seg > stripes_per_portion {
        let leb_index_per_stripe =
            crate::ceil_division(pebs_per_seg as u64, stripes_per_portion as u64) as u32;
        leb_index / leb_index_per_stripe
    } else {
        leb_index / pebs_per_seg
    }
}

/// Scans the used bitmap of a stripe for the first free descriptor slot.
fn find_unused_peb(pebtbl: &[u8]) -> Option<u16> {
    let hdr: &PebTableFragmentHeader = cast(pebtbl, 0);
    let pebs_count = u16::from(hdr.pebs_count);
    let bmap = &hdr.bmaps[PEBTBL_USED_BMAP];

    for index in 0..pebs_count {
        let byte = bmap[(index / 8) as usize];
        if byte & (1 << (index % 8)) == 0 {
            return Some(index);
        }
    }

    None
}

fn set_bmap_bit(pebtbl: &mut [u8], bmap_index: usize, bit: u16) {
    let hdr: &mut PebTableFragmentHeader = cast_mut(pebtbl, 0);
    hdr.bmaps[bmap_index][(bit / 8) as usize] |= 1 << (bit % 8);
}

fn peb_descriptor_at(pebtbl: &mut [u8], index: u16) -> &mut PebDescriptor {
    cast_mut(pebtbl, PEBTBL_HDR_SIZE + index as usize * PEB_DESC_SIZE)
}

/// Maps one LEB onto a free PEB of the matching stripe; returns the PEB ID.
fn map_leb2peb(layout: &mut VolumeLayout, leb_id: u64, peb_type: u8) -> Result<u64> {
    let (fragment_index, portion_index, mempage_index, leb_desc_index) = locate_leb(layout, leb_id)?;

    let lebtbl_off = lebtbl_offset(layout, portion_index, mempage_index);
    let page_size = layout.page_size as usize;

    let (start_leb, lebs_count) = {
        let buffer = match layout.maptbl.fragments_array[fragment_index].as_ref() {
            Some(buffer) => buffer,
            None => return Err(Error::internal("mapping table buffer is gone")),
        };
        let hdr: &LebTableFragmentHeader = cast(&buffer[lebtbl_off..lebtbl_off + page_size], 0);
        verify_internal!(
            u16::from(hdr.magic) == LEB_TABLE_MAGIC,
            "broken LEB table at portion {}",
            portion_index
        );
        (u64::from(hdr.start_leb), u16::from(hdr.lebs_count))
    };

    verify_internal!(
        leb_id >= start_leb && leb_id < start_leb + lebs_count as u64,
        "LEB {} is outside its table fragment",
        leb_id
    );

    let stripe_index = stripe_index_for_leb(layout, start_leb, leb_id);
    let pebtbl_off = pebtbl_offset(layout, portion_index, stripe_index);
    let global_portion =
        fragment_index as u64 * layout.maptbl.portions_per_fragment as u64 + portion_index as u64;
    let portion_start_peb = global_portion * layout.maptbl.pebs_per_portion as u64;

    let (peb_id, physical_index) = {
        let buffer = match layout.maptbl.fragments_array[fragment_index].as_mut() {
            Some(buffer) => buffer,
            None => return Err(Error::internal("mapping table buffer is gone")),
        };
        let pebtbl = &mut buffer[pebtbl_off..pebtbl_off + page_size];

        {
            let hdr: &PebTableFragmentHeader = cast(pebtbl, 0);
            verify_internal!(
                u16::from(hdr.magic) == PEB_TABLE_MAGIC,
                "broken PEB table at portion {}, stripe {}",
                portion_index,
                stripe_index
            );
        }

        let peb_index = match find_unused_peb(pebtbl) {
            Some(index) => index,
            None => {
                mkfs_err!(
                    "fail to find unused PEB: leb_id {leb_id}, portion {portion_index}, stripe {stripe_index}"
                );
                return Err(Error::no_space("PEB table stripe is exhausted"));
            }
        };

        {
            let desc = peb_descriptor_at(pebtbl, peb_index);
            verify_internal!(
                desc.state == MAPTBL_UNKNOWN_PEB_STATE && desc.peb_type == MAPTBL_UNKNOWN_PEB_TYPE,
                "PEB slot {} is already claimed",
                peb_index
            );
            desc.peb_type = peb_type;
            desc.state = MAPTBL_USING_PEB_STATE;
        }

        set_bmap_bit(pebtbl, PEBTBL_USED_BMAP, peb_index);

        let start_peb = {
            let hdr: &mut PebTableFragmentHeader = cast_mut(pebtbl, 0);
            hdr.last_selected_peb = peb_index.into();
            u64::from(hdr.start_peb)
        };

        let physical_index = (start_peb - portion_start_peb) as u16 + peb_index;
        (start_peb + peb_index as u64, physical_index)
    };

    // Mark the LEB as mapped.
    {
        let buffer = match layout.maptbl.fragments_array[fragment_index].as_mut() {
            Some(buffer) => buffer,
            None => return Err(Error::internal("mapping table buffer is gone")),
        };
        let lebtbl = &mut buffer[lebtbl_off..lebtbl_off + page_size];

        {
            let desc: &mut LebDescriptor =
                cast_mut(lebtbl, LEBTBL_HDR_SIZE + leb_desc_index as usize * LEB_DESC_SIZE);
            desc.physical_index = physical_index.into();
            desc.relation_index = u16::MAX.into();
        }

        let hdr: &mut LebTableFragmentHeader = cast_mut(lebtbl, 0);
        let mapped = u16::from(hdr.mapped_lebs) + 1;
        hdr.mapped_lebs = mapped.into();
    }

    mkfs_dbg!(
        layout.env.show_debug,
        "leb_id {leb_id}, peb_id {peb_id}, physical_index {physical_index}"
    );

    Ok(peb_id)
}

fn map_allocated_lebs2pebs(layout: &mut VolumeLayout) -> Result<()> {
    for seg_index in 0..layout.segs.len() {
        let seg_type = match layout.segs[seg_index].seg_type {
            Some(seg_type) => seg_type,
            None => continue,
        };
        let peb_type = seg2peb_type(meta2seg_type(seg_type));

        for peb_index in 0..layout.segs[seg_index].pebs.len() {
            let leb_id = layout.segs[seg_index].pebs[peb_index].leb_id;
            if leb_id == u64::MAX {
                continue;
            }

            let peb_id = map_leb2peb(layout, leb_id, peb_type)?;
            maptbl_cache::cache_leb2peb_pair(layout, leb_id, peb_id)?;

            layout.segs[seg_index].pebs[peb_index].peb_id = peb_id;
        }
    }

    Ok(())
}

/// Marks every PEB that got no mapping as an erase candidate. Skipped when
/// the whole device is about to be erased anyway.
fn mark_unallocated_pebs_as_pre_erased(layout: &mut VolumeLayout) -> Result<()> {
    if layout.need_erase_device {
        mkfs_dbg!(layout.env.show_debug, "do nothing: volume will be erased by mkfs");
        return Ok(());
    }

    let portions_per_fragment = layout.maptbl.portions_per_fragment as u32;
    let stripes_per_portion = layout.maptbl.stripes_per_portion as u32;
    let page_size = layout.page_size as usize;
    let mut pre_erased = 0u64;

    for fragment_index in 0..layout.maptbl.fragments_array.len() {
        for portion_index in 0..portions_per_fragment {
            for stripe_index in 0..stripes_per_portion {
                let offset = pebtbl_offset(layout, portion_index, stripe_index);

                let buffer = match layout.maptbl.fragments_array[fragment_index].as_mut() {
                    Some(buffer) => buffer,
                    None => return Err(Error::internal("mapping table buffer is gone")),
                };
                let pebtbl = &mut buffer[offset..offset + page_size];

                let pebs_count = {
                    let hdr: &PebTableFragmentHeader = cast(pebtbl, 0);
                    if u16::from(hdr.magic) != PEB_TABLE_MAGIC {
                        continue;
                    }
                    u16::from(hdr.pebs_count)
                };

                for index in 0..pebs_count {
                    let used = {
                        let hdr: &PebTableFragmentHeader = cast(pebtbl, 0);
                        hdr.bmaps[PEBTBL_USED_BMAP][(index / 8) as usize] & (1 << (index % 8)) != 0
                    };
                    if used {
                        continue;
                    }

                    {
                        let desc = peb_descriptor_at(pebtbl, index);
                        desc.peb_type = MAPTBL_UNKNOWN_PEB_TYPE;
                        desc.state = MAPTBL_PRE_ERASE_STATE;
                    }
                    set_bmap_bit(pebtbl, PEBTBL_DIRTY_BMAP, index);
                    pre_erased += 1;
                }
            }
        }
    }

    layout.maptbl.pre_erased_pebs = pre_erased;

    Ok(())
}

/// Probes every PEB covered by the table when the device supports it, and
/// stamps bad or recovering PEBs into the stripes.
fn check_pebs_validity(layout: &mut VolumeLayout) -> Result<()> {
    if layout.env.device_type != DeviceType::Mtd {
        return Ok(());
    }

    {
        let mut info = crate::device::NandGeometry {
            erasesize: layout.env.erase_size,
            writesize: layout.page_size,
        };
        let file = layout.env.device()?;
        layout
            .env
            .ops
            .check_nand_geometry(file, &mut info, layout.env.show_debug)?;
    }

    let portions_per_fragment = layout.maptbl.portions_per_fragment as u32;
    let stripes_per_portion = layout.maptbl.stripes_per_portion as u32;
    let page_size = layout.page_size as usize;
    let erase_size = layout.env.erase_size;
    let show_debug = layout.env.show_debug;

    for fragment_index in 0..layout.maptbl.fragments_array.len() {
        for portion_index in 0..portions_per_fragment {
            for stripe_index in 0..stripes_per_portion {
                let offset = pebtbl_offset(layout, portion_index, stripe_index);

                let (start_peb, pebs_count) = {
                    let buffer = match layout.maptbl.fragments_array[fragment_index].as_ref() {
                        Some(buffer) => buffer,
                        None => return Err(Error::internal("mapping table buffer is gone")),
                    };
                    let hdr: &PebTableFragmentHeader =
                        cast(&buffer[offset..offset + page_size], 0);
                    if u16::from(hdr.magic) != PEB_TABLE_MAGIC {
                        continue;
                    }
                    (u64::from(hdr.start_peb), u16::from(hdr.pebs_count))
                };

                for index in 0..pebs_count {
                    let peb_id = start_peb + index as u64;
                    let condition = {
                        let file = layout.env.device()?;
                        layout.env.ops.check_peb(
                            file,
                            peb_id * erase_size as u64,
                            erase_size,
                            false,
                            show_debug,
                        )?
                    };

                    let buffer = match layout.maptbl.fragments_array[fragment_index].as_mut() {
                        Some(buffer) => buffer,
                        None => return Err(Error::internal("mapping table buffer is gone")),
                    };
                    let pebtbl = &mut buffer[offset..offset + page_size];

                    match condition {
                        PebCondition::Ok => {
                            let desc = peb_descriptor_at(pebtbl, index);
                            desc.erase_cycles = 1u32.into();
                        }
                        PebCondition::Bad => {
                            {
                                let desc = peb_descriptor_at(pebtbl, index);
                                desc.erase_cycles = u32::MAX.into();
                                desc.state = MAPTBL_BAD_PEB_STATE;
                            }
                            {
                                let hdr: &mut PebTableFragmentHeader = cast_mut(pebtbl, 0);
                                hdr.flags |= PEBTBL_BADBLK_EXIST;
                            }
                            set_bmap_bit(pebtbl, PEBTBL_USED_BMAP, index);
                            set_bmap_bit(pebtbl, PEBTBL_BADBLK_BMAP, index);
                        }
                        PebCondition::Recovering => {
                            {
                                let desc = peb_descriptor_at(pebtbl, index);
                                desc.erase_cycles = 1u32.into();
                                desc.state = MAPTBL_RECOVERING_STATE;
                            }
                            {
                                let hdr: &mut PebTableFragmentHeader = cast_mut(pebtbl, 0);
                                hdr.flags |= PEBTBL_UNDER_RECOVERING;
                            }
                            set_bmap_bit(pebtbl, PEBTBL_USED_BMAP, index);
                            set_bmap_bit(pebtbl, PEBTBL_RECOVER_BMAP, index);
                        }
                    }
                }
            }
        }
    }

    // Probing an MTD PEB erases it on success.
    layout.is_volume_erased = true;

    Ok(())
}

/// Coalesces the mapping table's segment IDs into extent runs inside the
/// superblock's mapping table header.
fn define_maptbl_extents(layout: &mut VolumeLayout, seg_chain_type: usize) -> Result<()> {
    let request = maptbl_request(layout)?;
    let pebs_per_seg = layout.pebs_per_seg() as u64;
    let portions_per_seg = pebs_per_seg * layout.maptbl.portions_per_fragment as u64;
    let segs_per_copy =
        crate::ceil_division(layout.maptbl.portions_count as u64, portions_per_seg) as usize;

    let mut start_index = request.start_seg_index.unwrap_or(0);
    if seg_chain_type == COPY_MAPTBL_SEG {
        start_index += segs_per_copy;
    }

    let mut runs: Vec<(u64, u32)> = Vec::new();
    for i in 0..segs_per_copy {
        let seg_id = layout.segs[start_index + i].seg_id;

        match runs.last_mut() {
            Some((start, len)) if *start + *len as u64 == seg_id => *len += 1,
            _ => runs.push((seg_id, 1)),
        }
    }

    if runs.len() > MAPTBL_RESERVED_EXTENTS {
        mkfs_err!(
            "maptbl chain splits into {} extents, only {} are reserved",
            runs.len(),
            MAPTBL_RESERVED_EXTENTS
        );
        return Err(Error::internal("mapping table chain is too fragmented"));
    }

    let hdr = &mut layout.sb.vh.maptbl;

    for slot in 0..MAPTBL_RESERVED_EXTENTS {
        let extent = &mut hdr.extents[slot][seg_chain_type];
        match runs.get(slot) {
            Some(&(start_id, len)) => {
                extent.start_id = start_id.into();
                extent.len = len.into();
                extent.kind = SEG_EXTENT_TYPE.into();
                extent.flags = 0u16.into();
            }
            None => {
                extent.start_id = u64::MAX.into();
                extent.len = 0u32.into();
                extent.kind = EMPTY_EXTENT_TYPE.into();
                extent.flags = 0u16.into();
            }
        }
    }

    Ok(())
}

fn init_maptbl_sb_header(layout: &mut VolumeLayout) -> Result<()> {
    let request = maptbl_request(layout)?;
    let pebs_count = layout.pebs_per_volume();
    let pebs_per_seg = layout.pebs_per_seg() as u64;
    let portions_per_seg = pebs_per_seg * layout.maptbl.portions_per_fragment as u64;
    let segs_per_copy =
        crate::ceil_division(layout.maptbl.portions_count as u64, portions_per_seg) as usize;

    let mut flags = 0u16;
    if layout.maptbl.has_backup_copy {
        flags |= MAPTBL_HAS_COPY;
    }
    match layout.maptbl.compression {
        crate::compression::CompressionType::None => {}
        crate::compression::CompressionType::Zlib => flags |= MAPTBL_MAKE_ZLIB_COMPR,
        crate::compression::CompressionType::Lzo => flags |= MAPTBL_MAKE_LZO_COMPR,
        crate::compression::CompressionType::Unknown => {
            mkfs_err!("invalid compression type");
            return Err(Error::invalid("mapping table compression is not selected"));
        }
    }

    if layout.maptbl.has_backup_copy {
        if segs_per_copy * 2 != request.segs_count {
            mkfs_err!(
                "invalid maptbl segment allocation: segs_per_copy {}, segs_count {}",
                segs_per_copy,
                request.segs_count
            );
            return Err(Error::internal("mapping table allocation mismatch"));
        }
    } else if segs_per_copy != request.segs_count {
        mkfs_err!(
            "invalid maptbl segment allocation: segs_per_copy {}, segs_count {}",
            segs_per_copy,
            request.segs_count
        );
        return Err(Error::internal("mapping table allocation mismatch"));
    }

    let lebs_per_portion = (layout.maptbl.lebs_per_portion as u64).min(pebs_count) as u16;
    let pebs_per_portion = (layout.maptbl.pebs_per_portion as u64).min(pebs_count) as u16;
    let pebs_per_stripe = crate::ceil_division(
        pebs_per_portion as u64,
        layout.maptbl.stripes_per_portion as u64,
    ) as u16;

    {
        let hdr = &mut layout.sb.vh.maptbl;
        hdr.fragments_count = layout.maptbl.portions_count.into();
        hdr.fragment_bytes = layout.maptbl.portion_size.into();
        hdr.last_peb_recover_cno = u64::MAX.into();

        hdr.lebs_count = pebs_count.into();
        hdr.pebs_count = pebs_count.into();

        verify_internal!(portions_per_seg < u16::MAX as u64, "too many portions per segment");
        hdr.fragments_per_seg = (portions_per_seg as u16).into();
        hdr.fragments_per_peb = layout.maptbl.portions_per_fragment.into();
        hdr.flags = flags.into();

        if layout.maptbl.pre_erased_pebs >= u16::MAX as u64 {
            hdr.pre_erase_pebs = u16::MAX.into();
        } else {
            hdr.pre_erase_pebs = (layout.maptbl.pre_erased_pebs as u16).into();
        }

        hdr.lebs_per_fragment = lebs_per_portion.into();
        hdr.pebs_per_fragment = pebs_per_portion.into();
        hdr.pebs_per_stripe = pebs_per_stripe.into();
        hdr.stripes_per_fragment = layout.maptbl.stripes_per_portion.into();
    }

    define_maptbl_extents(layout, MAIN_MAPTBL_SEG)?;
    if layout.maptbl.has_backup_copy {
        define_maptbl_extents(layout, COPY_MAPTBL_SEG)?;
    }

    Ok(())
}

/// Fills the superblock chain placement of the volume header.
fn init_sb_segs(layout: &mut VolumeLayout) -> Result<()> {
    let request = layout.meta_array[MetaIndex::Superblock as usize];
    let mut seg_index = match request.start_seg_index {
        Some(index) => index,
        None => return Err(Error::internal("superblock segments are not reserved")),
    };

    for chain_slot in 0..SB_CHAIN_MAX {
        for replica in 0..SB_SEG_COPY_MAX {
            if chain_slot == PREV_SB_SEG {
                // No previous generation exists in a fresh image.
                layout.sb.vh.sb_pebs[chain_slot][replica].leb_id = u64::MAX.into();
                layout.sb.vh.sb_pebs[chain_slot][replica].peb_id = u64::MAX.into();
                continue;
            }

            let seg = &layout.segs[seg_index];
            if seg.seg_type != Some(MetaIndex::Superblock) {
                mkfs_err!("invalid seg_type {:?}", seg.seg_type);
                return Err(Error::internal("foreign segment in the superblock chain"));
            }

            let leb_id = seg.pebs[0].leb_id;
            let peb_id = seg.pebs[0].peb_id;

            layout.sb.vh.sb_pebs[chain_slot][replica].leb_id = leb_id.into();
            layout.sb.vh.sb_pebs[chain_slot][replica].peb_id = peb_id.into();
            seg_index += 1;
        }
    }

    Ok(())
}

fn set_maptbl_presence_flag(layout: &mut VolumeLayout) {
    let feature_compat = u64::from(layout.sb.vs.feature_compat) | HAS_MAPTBL_COMPAT_FLAG;
    layout.sb.vs.feature_compat = feature_compat.into();
}

fn maptbl_set_log_pages(layout: &mut VolumeLayout, blks: u32) -> Result<()> {
    mkfs_dbg!(
        layout.env.show_debug,
        "log_pages {}, blks_count {}",
        layout.maptbl.log_pages,
        blks
    );

    verify_internal!(blks != 0 && blks < u16::MAX as u32, "invalid maptbl log size {blks}");

    let pages_per_peb = layout.pages_per_peb();
    let log_pages = log::align_full_log_pages(pages_per_peb, blks, layout.maptbl.log_pages);

    verify_internal!(log_pages < u16::MAX as u32, "aligned maptbl log size is too large");

    layout.maptbl.log_pages = log_pages as u16;
    layout.sb.vh.maptbl_log_pages = (log_pages as u16).into();

    Ok(())
}

fn prepare_leb_table(layout: &mut VolumeLayout, portion_index: u32, mempage_index: u32) -> Result<()> {
    let lebs_per_portion = layout.maptbl.lebs_per_portion as u64;
    let per_mempage = leb_desc_per_mempage() as u64;
    let pebs_per_volume = layout.pebs_per_volume();
    let portions_per_fragment = layout.maptbl.portions_per_fragment as u32;

    let global_portion = portion_index;
    let start_portion_leb = lebs_per_portion * global_portion as u64;
    let start_fragment_leb = start_portion_leb + per_mempage * mempage_index as u64;

    let lebs_count = if pebs_per_volume <= start_fragment_leb {
        0
    } else {
        let rest_in_volume = pebs_per_volume - start_fragment_leb;
        let rest_in_portion = lebs_per_portion - per_mempage * mempage_index as u64;
        rest_in_volume.min(rest_in_portion).min(per_mempage)
    };

    let fragment_index = (global_portion / portions_per_fragment) as usize;
    let local_portion = global_portion % portions_per_fragment;
    let offset = lebtbl_offset(layout, local_portion, mempage_index);
    let page_size = layout.page_size as usize;

    let buffer = match layout.maptbl.fragments_array[fragment_index].as_mut() {
        Some(buffer) => buffer,
        None => return Err(Error::internal("mapping table buffer is gone")),
    };
    let lebtbl = &mut buffer[offset..offset + page_size];

    let bytes_count = (LEBTBL_HDR_SIZE + lebs_count as usize * LEB_DESC_SIZE) as u32;

    {
        let hdr: &mut LebTableFragmentHeader = cast_mut(lebtbl, 0);
        hdr.magic = LEB_TABLE_MAGIC.into();
        hdr.flags = 0u16.into();
        hdr.start_leb = start_fragment_leb.into();
        verify_internal!(lebs_count < u16::MAX as u64, "too many LEBs in one mempage");
        hdr.lebs_count = (lebs_count as u16).into();
        hdr.mapped_lebs = 0u16.into();
        hdr.migrating_lebs = 0u16.into();
        hdr.portion_id = (global_portion as u16).into();
        hdr.fragment_id = (mempage_index as u16).into();
        hdr.bytes_count = bytes_count.into();
    }

    // Unmapped descriptors keep the no-PEB sentinel.
    let content_end = MEM_PAGE_SIZE as usize;
    lebtbl[LEBTBL_HDR_SIZE..content_end].fill(0xFF);

    Ok(())
}

fn prepare_peb_table(layout: &mut VolumeLayout, portion_index: u32, stripe_index: u32) -> Result<()> {
    let pebs_per_portion = layout.maptbl.pebs_per_portion as u64;
    let stripes_per_portion = layout.maptbl.stripes_per_portion as u64;
    let reserved_pct = layout.maptbl.reserved_pebs_per_fragment as u64;
    let pebs_per_volume = layout.pebs_per_volume();
    let portions_per_fragment = layout.maptbl.portions_per_fragment as u32;

    let portion_start_peb = pebs_per_portion * portion_index as u64;
    let rest_pebs = pebs_per_volume
        .saturating_sub(portion_start_peb)
        .min(pebs_per_portion);
    let stripe_capacity = crate::ceil_division(rest_pebs.max(1), stripes_per_portion);

    let start_peb = portion_start_peb + stripe_capacity * stripe_index as u64;
    let pebs_count = if pebs_per_volume <= start_peb {
        0
    } else {
        stripe_capacity.min(pebs_per_volume - start_peb)
    };

    let fragment_index = (portion_index / portions_per_fragment) as usize;
    let local_portion = portion_index % portions_per_fragment;
    let offset = pebtbl_offset(layout, local_portion, stripe_index);
    let page_size = layout.page_size as usize;

    let buffer = match layout.maptbl.fragments_array[fragment_index].as_mut() {
        Some(buffer) => buffer,
        None => return Err(Error::internal("mapping table buffer is gone")),
    };
    let pebtbl = &mut buffer[offset..offset + page_size];

    verify_internal!(pebs_count < u16::MAX as u64, "too many PEBs in one stripe");

    let reserved_pebs = (pebs_count * reserved_pct) / 100;
    let bytes_count = (PEBTBL_HDR_SIZE + pebs_count as usize * PEB_DESC_SIZE) as u32;

    let hdr: &mut PebTableFragmentHeader = cast_mut(pebtbl, 0);
    hdr.magic = PEB_TABLE_MAGIC.into();
    hdr.flags = 0;
    hdr.recover = PEB_RECOVER_MONTHS_DEFAULT & 0x0F;
    hdr.start_peb = start_peb.into();
    hdr.pebs_count = (pebs_count as u16).into();
    hdr.last_selected_peb = 0u16.into();
    hdr.reserved_pebs = (reserved_pebs as u16).into();
    hdr.stripe_id = (stripe_index as u16).into();
    hdr.portion_id = (portion_index as u16).into();
    hdr.fragment_id = (stripe_index as u16).into();
    hdr.bytes_count = bytes_count.into();

    Ok(())
}

impl MetadataOps for MaptblOps {
    fn allocation_policy(&self, layout: &mut VolumeLayout) -> Result<Option<(SegmentPolicy, usize)>> {
        let seg_nums = layout.fs_segs_count();
        let pebs_per_seg = layout.pebs_per_seg();
        let pebs_per_volume = layout.pebs_per_volume();
        let erase_size = layout.env.erase_size;
        let page_size = layout.page_size;

        let leb_per_mempage = leb_desc_per_mempage();
        let mut peb_per_stripe = peb_desc_per_stripe();

        verify_internal!(
            leb_per_mempage / peb_per_stripe == 2,
            "LEB/PEB descriptor density lost the 2:1 ratio"
        );

        // Shrinking a too-large portion caps the stripes for the retry.
        let mut stripes_limit = u32::MAX;

        let (stripes, lebtbl_mempages, portion_size) = loop {
            correct_stripes_per_portion(layout);
            let mut stripes = layout.maptbl.stripes_per_portion as u32;

            let mut peb_per_portion = peb_per_stripe * stripes;
            if leb_per_mempage > peb_per_portion {
                stripes = leb_per_mempage / peb_per_stripe;
            } else if leb_per_mempage < peb_per_portion {
                stripes = peb_per_portion / leb_per_mempage;
            }

            if layout.env.device_type == DeviceType::Zoned {
                // One portion describes the whole zone space.
                let zns_stripes = crate::ceil_division(pebs_per_volume, peb_per_stripe as u64);
                verify_internal!(zns_stripes < u16::MAX as u64, "too many stripes per portion");
                stripes = zns_stripes as u32;
            }

            stripes = stripes.min(stripes_limit).max(1);

            if pebs_per_seg > stripes {
                let leb_index_per_stripe = crate::ceil_division(pebs_per_seg as u64, stripes as u64) as u32;
                peb_per_stripe = (peb_per_stripe / leb_index_per_stripe) * leb_index_per_stripe;
            }

            peb_per_portion = peb_per_stripe * stripes;

            // Every table mempage occupies one physical page.
            let pebtbl_portion_bytes = stripes * page_size;
            let lebtbl_mempages =
                crate::ceil_division(peb_per_portion as u64, leb_per_mempage as u64) as u32;
            let lebtbl_portion_bytes = lebtbl_mempages * page_size;

            let portion_size = lebtbl_portion_bytes + pebtbl_portion_bytes;

            if portion_size > erase_size {
                crate::mkfs_info!(
                    layout.env.show_info,
                    "incorrect maptbl fragment size: portion_size {}, erase_size {}",
                    portion_size,
                    erase_size
                );

                let excess_stripes =
                    crate::ceil_division((portion_size - erase_size) as u64, page_size as u64) as u32;
                verify_internal!(
                    excess_stripes < stripes,
                    "portion of {} bytes cannot shrink into the erase block",
                    portion_size
                );

                stripes_limit = stripes - excess_stripes;
                layout.maptbl.stripes_per_portion = stripes_limit as u16;
                continue;
            }

            layout.maptbl.stripes_per_portion = stripes as u16;
            break (stripes, lebtbl_mempages, portion_size);
        };

        let peb_per_portion = peb_per_stripe * stripes;
        let portions_needed = crate::ceil_division(pebs_per_volume, peb_per_portion as u64);

        let capacity = erase_size / portion_size;
        // The payload may take at most 70% of a PEB; the log metadata needs
        // the rest.
        let headroom_capacity = ((erase_size / 100) * 70 / portion_size).max(1);
        let mut portions_per_fragment = layout.maptbl.portions_per_fragment as u32;

        if layout.maptbl.portions_per_fragment_explicit {
            if portions_per_fragment > capacity {
                mkfs_err!(
                    "maptbl: portions_per_fragment {} of {} bytes each exceed the erase size {}",
                    portions_per_fragment,
                    portion_size,
                    erase_size
                );
                return Err(Error::invalid("maptbl portions do not fit one erase block"));
            }
        } else if portions_per_fragment > headroom_capacity {
            portions_per_fragment = headroom_capacity;
            layout.maptbl.portions_per_fragment = portions_per_fragment as u16;
            crate::mkfs_info!(
                layout.env.show_info,
                "corrected maptbl portions_per_fragment {}",
                portions_per_fragment
            );
        }

        let mut maptbl_pebs =
            crate::ceil_division(portions_needed, portions_per_fragment as u64) as u32;
        let maptbl_segs = crate::ceil_division(maptbl_pebs as u64, pebs_per_seg as u64) as u32;
        maptbl_pebs = maptbl_segs * pebs_per_seg;
        let portions_count = maptbl_pebs * portions_per_fragment;

        let segs = if layout.maptbl.has_backup_copy {
            maptbl_segs as usize * 2
        } else {
            maptbl_segs as usize
        };

        if segs as u64 > (seg_nums * 10) / 100 {
            mkfs_err!("maptbl is huge: maptbl_segs {}, seg_nums {}", segs, seg_nums);
            return Err(Error::no_space("mapping table would exceed a tenth of the volume"));
        }

        if layout.maptbl.reserved_pebs_per_fragment == u16::MAX {
            layout.maptbl.reserved_pebs_per_fragment = MAPTBL_RESERVED_PEBS_DEFAULT;
        }

        verify_internal!(
            peb_per_portion < u16::MAX as u32,
            "too many PEB descriptors per portion"
        );

        layout.maptbl.maptbl_pebs = maptbl_pebs;
        layout.maptbl.lebtbl_portion_bytes = lebtbl_mempages * page_size;
        layout.maptbl.lebtbl_portion_mempages = lebtbl_mempages as u16;
        layout.maptbl.pebtbl_portion_bytes = stripes * page_size;
        layout.maptbl.pebtbl_portion_mempages = stripes as u16;
        layout.maptbl.lebs_per_portion = peb_per_portion as u16;
        layout.maptbl.pebs_per_portion = peb_per_portion as u16;
        layout.maptbl.portions_count = portions_count;
        layout.maptbl.portion_size = portion_size;

        layout.meta_array[MetaIndex::MappingTable as usize].segs_count = segs;
        layout.meta_array[MetaIndex::MappingTable as usize].seg_state =
            Some(SegmentPolicy::Dedicated);

        mkfs_dbg!(
            layout.env.show_debug,
            "maptbl: segs {}, stripes_per_portion {}, portions_per_fragment {}, maptbl_pebs {}, portions_count {}, portion_size {}",
            segs,
            stripes,
            portions_per_fragment,
            maptbl_pebs,
            portions_count,
            portion_size
        );

        Ok(Some((SegmentPolicy::Dedicated, segs)))
    }

    fn prepare(&self, layout: &mut VolumeLayout) -> Result<()> {
        reserve_segments(layout, MetaIndex::MappingTable)?;

        let maptbl_pebs = layout.maptbl.maptbl_pebs;
        let peb_buffer_size =
            layout.maptbl.portion_size as usize * layout.maptbl.portions_per_fragment as usize;

        verify_internal!(
            layout.maptbl.fragments_array.is_empty(),
            "mapping table buffers are prepared twice"
        );

        for _ in 0..maptbl_pebs {
            layout.maptbl.fragments_array.push(Some(vec![0u8; peb_buffer_size]));
        }

        let portions = layout.maptbl.portions_count;
        let lebtbl_mempages = layout.maptbl.lebtbl_portion_mempages as u32;
        let stripes = layout.maptbl.stripes_per_portion as u32;

        for portion in 0..portions {
            for mempage in 0..lebtbl_mempages {
                prepare_leb_table(layout, portion, mempage)?;
            }
            for stripe in 0..stripes {
                prepare_peb_table(layout, portion, stripe)?;
            }
        }

        Ok(())
    }

    fn validate(&self, layout: &mut VolumeLayout) -> Result<()> {
        check_pebs_validity(layout)?;
        maptbl_cache::maptbl_cache_prepare(layout)?;
        map_allocated_lebs2pebs(layout)?;
        mark_unallocated_pebs_as_pre_erased(layout)?;
        init_maptbl_sb_header(layout)?;
        init_sb_segs(layout)?;

        let pebs_per_seg = layout.pebs_per_seg();
        if layout.maptbl.migration_threshold == u16::MAX {
            layout.maptbl.migration_threshold = layout.migration_threshold;
        } else if layout.maptbl.migration_threshold as u32 > pebs_per_seg {
            mkfs_warn!(
                "maptbl migration threshold {} was corrected to {}",
                layout.maptbl.migration_threshold,
                pebs_per_seg
            );
            layout.maptbl.migration_threshold = pebs_per_seg as u16;
        }

        set_maptbl_presence_flag(layout);
        Ok(())
    }

    fn define_layout(&self, layout: &mut VolumeLayout) -> Result<()> {
        let request = maptbl_request(layout)?;
        let pebs_per_seg = layout.pebs_per_seg() as usize;
        let maptbl_pebs = layout.maptbl.maptbl_pebs;
        let peb_buffer_size =
            layout.maptbl.portion_size * layout.maptbl.portions_per_fragment as u32;
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
                if buffer_index as u32 >= maptbl_pebs {
                    break;
                }

                let logical_byte_offset = buffer_index as u64 * peb_buffer_size as u64;

                layout.calculated_open_zones += 1;
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
                    MAPTBL_INO,
                    payload_offset_in_bytes,
                    page_size,
                )?;

                {
                    let peb = &mut layout.segs[seg_index].pebs[peb_index];
                    log::set_extent_start_offset(page_size, peb, LOG_PAYLOAD)?;
                }

                {
                    let buffer = layout.maptbl.fragments_array[buffer_index].take();
                    let peb = &mut layout.segs[seg_index].pebs[peb_index];
                    let extent = &mut peb.extents[LOG_PAYLOAD];

                    verify_internal!(extent.buf.is_none(), "payload extent is prepared twice");
                    match buffer {
                        Some(buffer) => extent.buf = Some(buffer),
                        None => {
                            mkfs_err!("invalid fragment pointer: buffer_index {buffer_index}");
                            return Err(Error::internal("mapping table buffer is gone"));
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

        maptbl_set_log_pages(layout, log_pages)?;

        if layout.env.device_type == DeviceType::Zoned {
            layout.sb.vs.open_zones = layout.calculated_open_zones.into();
        }

        Ok(())
    }

    fn commit(&self, layout: &mut VolumeLayout) -> Result<()> {
        let request = maptbl_request(layout)?;
        let pebs_per_seg = layout.pebs_per_seg() as usize;
        let portions_per_fragment = layout.maptbl.portions_per_fragment as u32;
        let lebtbl_mempages = layout.maptbl.lebtbl_portion_mempages as u32;
        let stripes = layout.maptbl.stripes_per_portion as u32;
        let portion_size = layout.maptbl.portion_size as usize;
        let lebtbl_portion_bytes = layout.maptbl.lebtbl_portion_bytes as usize;
        let page_size = layout.page_size;
        let erase_size = layout.env.erase_size;
        let blkbmap_backup = layout.blkbmap.has_backup_copy;
        let blk2off_backup = layout.blk2off_tbl.has_backup_copy;
        let migration_threshold = layout.maptbl.migration_threshold;

        let mut seg_index = request.start_seg_index.unwrap_or(0);

        for _ in 0..request.segs_count {
            for peb_index in 0..pebs_per_seg {
                let has_payload = {
                    let peb = &layout.segs[seg_index].pebs[peb_index];
                    match peb.extents[LOG_PAYLOAD].buf.as_ref() {
                        Some(buf) => {
                            let hdr: &LebTableFragmentHeader = cast(buf, 0);
                            u16::from(hdr.magic) == LEB_TABLE_MAGIC
                        }
                        None => false,
                    }
                };
                if !has_payload {
                    break;
                }

                log::pre_commit_segment_header(layout, seg_index, peb_index, MAPTBL_SEG_TYPE)?;

                // Seal every LEB/PEB table fragment of the payload.
                {
                    let peb = &mut layout.segs[seg_index].pebs[peb_index];
                    let buf = match peb.extents[LOG_PAYLOAD].buf.as_mut() {
                        Some(buf) => buf,
                        None => return Err(Error::internal("payload extent is gone")),
                    };

                    for portion in 0..portions_per_fragment as usize {
                        let portion_off = portion * portion_size;

                        for mempage in 0..lebtbl_mempages as usize {
                            let off = portion_off + mempage * page_size as usize;
                            let bytes = {
                                let hdr: &LebTableFragmentHeader = cast(&buf[..], off);
                                verify_internal!(
                                    u16::from(hdr.magic) == LEB_TABLE_MAGIC,
                                    "broken LEB table in portion {}",
                                    portion
                                );
                                u32::from(hdr.bytes_count) as usize
                            };

                            {
                                let hdr: &mut LebTableFragmentHeader = cast_mut(buf, off);
                                hdr.checksum = 0u32.into();
                            }
                            let csum = crc32_le(&buf[off..off + bytes]);
                            let hdr: &mut LebTableFragmentHeader = cast_mut(buf, off);
                            hdr.checksum = csum.into();
                        }

                        for stripe in 0..stripes as usize {
                            let off = portion_off + lebtbl_portion_bytes + stripe * page_size as usize;
                            let bytes = {
                                let hdr: &PebTableFragmentHeader = cast(&buf[..], off);
                                verify_internal!(
                                    u16::from(hdr.magic) == PEB_TABLE_MAGIC,
                                    "broken PEB table in portion {}",
                                    portion
                                );
                                u32::from(hdr.bytes_count) as usize
                            };

                            {
                                let hdr: &mut PebTableFragmentHeader = cast_mut(buf, off);
                                hdr.checksum = 0u32.into();
                            }
                            let csum = crc32_le(&buf[off..off + bytes]);
                            let hdr: &mut PebTableFragmentHeader = cast_mut(buf, off);
                            hdr.checksum = csum.into();
                        }
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
                crate::segbmap::define_migration_threshold(
                    layout,
                    seg_index,
                    peb_index,
                    migration_threshold,
                )?;
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
    fn descriptor_densities_keep_the_ratio() {
        assert_eq!(leb_desc_per_mempage(), 1016);
        assert_eq!(peb_desc_per_stripe(), 476);
        assert_eq!(leb_desc_per_mempage() / peb_desc_per_stripe(), 2);
    }
}
