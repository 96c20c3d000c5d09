//! PEB mapping table cache.
//!
//! The cache is the in-superblock copy of the mapping table content for the
//! metadata PEBs: page-sized fragments, each holding a sorted array of
//! LEB/PEB pairs, a sentinel magic and one state record per pair. The runtime
//! uses it to resolve LEBs before the mapping table itself is initialized.

use crate::error::{Error, Result};
use crate::layout::VolumeLayout;
use crate::mkfs_dbg;
use crate::ondisk::*;
use crate::verify_internal;
use crate::MEM_PAGE_SIZE;
use std::mem;

const HDR_SIZE: usize = mem::size_of::<MaptblCacheHeader>();
const PAIR_SIZE: usize = mem::size_of::<Leb2PebPair>();
const STATE_SIZE: usize = mem::size_of::<MaptblCachePebState>();
const MAGIC_SIZE: usize = STATE_SIZE;

/// LEB/PEB pairs fitting into one cache fragment.
pub fn pairs_per_fragment() -> u16 {
    ((MEM_PAGE_SIZE as usize - HDR_SIZE - MAGIC_SIZE) / (PAIR_SIZE + STATE_SIZE)) as u16
}

fn prepare_fragment(fragment: &mut [u8], sequence_id: u16) {
    let threshold_size = (HDR_SIZE + MAGIC_SIZE) as u16;

    {
        let hdr: &mut MaptblCacheHeader = cast_mut(fragment, 0);
        set_signature(&mut hdr.magic, MAPTBL_CACHE_MAGIC);

        hdr.sequence_id = sequence_id.into();
        hdr.flags = 0u16.into();
        hdr.items_count = 0u16.into();
        hdr.bytes_count = threshold_size.into();
        hdr.start_leb = u64::MAX.into();
        hdr.end_leb = u64::MAX.into();
    }

    fragment[HDR_SIZE..HDR_SIZE + MAGIC_SIZE]
        .copy_from_slice(&MAPTBL_CACHE_PEB_STATE_MAGIC.to_le_bytes());
}

/// Sizes the cache from the count of LEBs in use and prepares the empty
/// fragments.
pub fn maptbl_cache_prepare(layout: &mut VolumeLayout) -> Result<()> {
    mkfs_dbg!(layout.env.show_debug, "preparing maptbl cache");

    verify_internal!(
        layout.maptbl_cache.fragments_array.is_empty(),
        "maptbl cache is prepared twice"
    );

    let mut lebs_count = 0u32;
    for seg in &layout.segs {
        for peb in &seg.pebs {
            if peb.leb_id != u64::MAX {
                lebs_count += 1;
            }
        }
    }

    let fragments_count =
        crate::ceil_division(lebs_count as u64, pairs_per_fragment() as u64) as u32;

    layout.maptbl_cache.fragment_size = MEM_PAGE_SIZE;
    layout.maptbl_cache.fragments_count = fragments_count;

    for index in 0..fragments_count {
        let mut fragment = vec![0u8; MEM_PAGE_SIZE as usize];
        prepare_fragment(&mut fragment, index as u16);
        layout.maptbl_cache.fragments_array.push(Some(fragment));
    }

    Ok(())
}

/// Finds the fragment a LEB belongs into: the one covering its range, or the
/// first with spare room past its range, or the first untouched one.
fn find_fragment_index(layout: &VolumeLayout, leb_id: u64) -> usize {
    let items_per_fragment = pairs_per_fragment();
    let count = layout.maptbl_cache.fragments_array.len();

    for index in 0..count {
        let fragment = match layout.maptbl_cache.fragments_array[index].as_ref() {
            Some(fragment) => fragment,
            None => continue,
        };
        let hdr: &MaptblCacheHeader = cast(fragment, 0);

        let start_leb = u64::from(hdr.start_leb);
        let end_leb = u64::from(hdr.end_leb);
        let items_count = u16::from(hdr.items_count);

        if start_leb == u64::MAX {
            return index;
        } else if leb_id >= start_leb && leb_id <= end_leb {
            return index;
        } else if leb_id > end_leb && items_count < items_per_fragment {
            return index;
        }
    }

    count.saturating_sub(1)
}

fn pair_at(fragment: &[u8], index: usize) -> Leb2PebPair {
    *cast(fragment, HDR_SIZE + index * PAIR_SIZE)
}

fn state_area_offset(items_count: usize) -> usize {
    HDR_SIZE + items_count * PAIR_SIZE + MAGIC_SIZE
}

/// Inserts a pair into one fragment, keeping the pair array sorted by LEB.
/// Returns the evicted tail pair when the fragment was full.
fn add_leb2peb_pair(
    fragment: &mut [u8],
    new_pair: Leb2PebPair,
    new_state: MaptblCachePebState,
) -> Result<Option<(Leb2PebPair, MaptblCachePebState)>> {
    let items_per_fragment = pairs_per_fragment() as usize;
    let items_count = {
        let hdr: &MaptblCacheHeader = cast(fragment, 0);
        u16::from(hdr.items_count) as usize
    };
    verify_internal!(
        items_count <= items_per_fragment,
        "cache fragment overflow: {} items",
        items_count
    );

    let is_full = items_count == items_per_fragment;
    let mut evicted = None;

    if is_full {
        let tail_pair = pair_at(fragment, items_count - 1);
        let tail_state: MaptblCachePebState =
            *cast(fragment, state_area_offset(items_count) + (items_count - 1) * STATE_SIZE);
        evicted = Some((tail_pair, tail_state));
    } else {
        // Open one pair slot: shift the sentinel magic and the state records
        // right by the size of a pair.
        let magic_off = HDR_SIZE + items_count * PAIR_SIZE;
        let area_len = MAGIC_SIZE + items_count * STATE_SIZE;
        fragment.copy_within(magic_off..magic_off + area_len, magic_off + PAIR_SIZE);
    }

    let kept_items = if is_full { items_count - 1 } else { items_count };
    let new_items = kept_items + 1;

    // Position keeping the pairs sorted ascending by LEB.
    let mut position = 0usize;
    for index in (0..kept_items).rev() {
        let pair = pair_at(fragment, index);
        if u64::from(pair.leb_id) <= u64::from(new_pair.leb_id) {
            position = index + 1;
            break;
        }
    }

    let states_off = state_area_offset(new_items);

    if position < kept_items {
        let moving = kept_items - position;

        let pairs_start = HDR_SIZE + position * PAIR_SIZE;
        fragment.copy_within(pairs_start..pairs_start + moving * PAIR_SIZE, pairs_start + PAIR_SIZE);

        let state_start = states_off + position * STATE_SIZE;
        fragment.copy_within(state_start..state_start + moving * STATE_SIZE, state_start + STATE_SIZE);
    }

    {
        let slot: &mut Leb2PebPair = cast_mut(fragment, HDR_SIZE + position * PAIR_SIZE);
        *slot = new_pair;
    }
    {
        let slot: &mut MaptblCachePebState = cast_mut(fragment, states_off + position * STATE_SIZE);
        *slot = new_state;
    }

    let start_leb = pair_at(fragment, 0).leb_id;
    let end_leb = pair_at(fragment, new_items - 1).leb_id;
    let bytes_count = (HDR_SIZE + MAGIC_SIZE + new_items * (PAIR_SIZE + STATE_SIZE)) as u16;

    let hdr: &mut MaptblCacheHeader = cast_mut(fragment, 0);
    hdr.items_count = (new_items as u16).into();
    hdr.bytes_count = bytes_count.into();
    hdr.start_leb = start_leb;
    hdr.end_leb = end_leb;

    Ok(evicted)
}

/// Records a LEB to PEB association in the cache.
pub fn cache_leb2peb_pair(layout: &mut VolumeLayout, leb_id: u64, peb_id: u64) -> Result<()> {
    mkfs_dbg!(layout.env.show_debug, "caching leb_id {leb_id}, peb_id {peb_id}");

    verify_internal!(leb_id != u64::MAX && peb_id != u64::MAX, "caching an unmapped pair");

    let mut pair: Leb2PebPair = unsafe { mem::zeroed() };
    pair.leb_id = leb_id.into();
    pair.peb_id = peb_id.into();

    let mut state: MaptblCachePebState = unsafe { mem::zeroed() };
    state.consistency = PEB_STATE_CONSISTENT;
    state.state = MAPTBL_USING_PEB_STATE;
    state.flags = 0;
    state.shared_peb_index = u8::MAX;

    let mut index = find_fragment_index(layout, leb_id);

    loop {
        if index >= layout.maptbl_cache.fragments_array.len() {
            return Err(Error::no_space("maptbl cache fragments exhausted"));
        }

        let fragment = match layout.maptbl_cache.fragments_array[index].as_mut() {
            Some(fragment) => fragment,
            None => return Err(Error::internal("maptbl cache fragment is gone")),
        };

        match add_leb2peb_pair(fragment, pair, state)? {
            None => return Ok(()),
            Some((moved_pair, moved_state)) => {
                // The tail pair moves into the next fragment.
                pair = moved_pair;
                state = moved_state;
                index += 1;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layout::VolumeLayout;

    fn cache_layout(fragments: u32) -> VolumeLayout {
        let mut layout = VolumeLayout::new();
        layout.maptbl_cache.fragments_count = fragments;
        for index in 0..fragments {
            let mut fragment = vec![0u8; MEM_PAGE_SIZE as usize];
            prepare_fragment(&mut fragment, index as u16);
            layout.maptbl_cache.fragments_array.push(Some(fragment));
        }
        layout
    }

    fn pairs_of(layout: &VolumeLayout, index: usize) -> Vec<(u64, u64)> {
        let fragment = layout.maptbl_cache.fragments_array[index].as_ref().unwrap();
        let hdr: &MaptblCacheHeader = cast(fragment, 0);
        let items = u16::from(hdr.items_count) as usize;

        (0..items)
            .map(|i| {
                let pair = pair_at(fragment, i);
                (u64::from(pair.leb_id), u64::from(pair.peb_id))
            })
            .collect()
    }

    #[test]
    fn fragment_capacity() {
        assert_eq!(pairs_per_fragment(), 203);
    }

    #[test]
    fn pairs_stay_sorted_on_out_of_order_insertion() {
        let mut layout = cache_layout(1);

        cache_leb2peb_pair(&mut layout, 8, 108).unwrap();
        cache_leb2peb_pair(&mut layout, 1, 101).unwrap();
        cache_leb2peb_pair(&mut layout, 5, 105).unwrap();

        assert_eq!(pairs_of(&layout, 0), vec![(1, 101), (5, 105), (8, 108)]);

        let fragment = layout.maptbl_cache.fragments_array[0].as_ref().unwrap();
        let hdr: &MaptblCacheHeader = cast(fragment, 0);
        assert_eq!(u64::from(hdr.start_leb), 1);
        assert_eq!(u64::from(hdr.end_leb), 8);
        assert_eq!(
            u16::from(hdr.bytes_count) as usize,
            HDR_SIZE + MAGIC_SIZE + 3 * (PAIR_SIZE + STATE_SIZE)
        );

        // The sentinel magic sits right behind the pairs.
        let magic_off = HDR_SIZE + 3 * PAIR_SIZE;
        let magic = u32::from_le_bytes(fragment[magic_off..magic_off + 4].try_into().unwrap());
        assert_eq!(magic, MAPTBL_CACHE_PEB_STATE_MAGIC);

        // Every state record mirrors the mapped state.
        let states_off = state_area_offset(3);
        for i in 0..3 {
            let state: &MaptblCachePebState = cast(fragment, states_off + i * STATE_SIZE);
            assert_eq!(state.consistency, PEB_STATE_CONSISTENT);
            assert_eq!(state.state, MAPTBL_USING_PEB_STATE);
            assert_eq!(state.shared_peb_index, u8::MAX);
        }
    }

    #[test]
    fn full_fragment_evicts_into_the_next() {
        let mut layout = cache_layout(2);
        let capacity = pairs_per_fragment() as u64;

        // Fill the first fragment completely with even LEBs, then insert an
        // odd one inside its range: the tail pair has to move over.
        for index in 0..capacity {
            cache_leb2peb_pair(&mut layout, index * 2, index * 2 + 1000).unwrap();
        }
        let tail_leb = (capacity - 1) * 2;
        cache_leb2peb_pair(&mut layout, 3, 1003).unwrap();

        let first = pairs_of(&layout, 0);
        assert_eq!(first.len(), capacity as usize);
        assert_eq!(first[0], (0, 1000));
        assert_eq!(first[1], (2, 1002));
        assert_eq!(first[2], (3, 1003));
        assert_eq!(first[3], (4, 1004));
        assert_eq!(first.last().copied().unwrap(), (tail_leb - 2, tail_leb - 2 + 1000));

        let second = pairs_of(&layout, 1);
        assert_eq!(second, vec![(tail_leb, tail_leb + 1000)]);
    }

    #[test]
    fn sizing_follows_the_lebs_in_use() {
        let mut layout = VolumeLayout::new();
        layout.env.fs_size = crate::SIZE_1GB;
        layout.env.erase_size = crate::SIZE_8MB as u32;
        layout.seg_size = crate::SIZE_8MB;

        for seg_index in 0..3 {
            let mut pebs = Vec::new();
            let mut peb = crate::layout::PebContent::new();
            peb.leb_id = seg_index as u64;
            pebs.push(peb);
            layout.segs.push(crate::layout::SegmentDesc {
                seg_type: None,
                seg_state: None,
                seg_id: seg_index as u64,
                pebs,
                pebs_count: 0,
            });
        }

        maptbl_cache_prepare(&mut layout).unwrap();
        assert_eq!(layout.maptbl_cache.fragments_count, 1);
        assert_eq!(layout.maptbl_cache.bytes_count(), (HDR_SIZE + MAGIC_SIZE) as u32);
    }
}
