//! Command-line surface of `mkfs.emberfs`.

use crate::compression::CompressionType;
use crate::layout::VolumeLayout;
use crate::ondisk;
use std::env::ArgsOs;
use std::path::PathBuf;
use std::process::exit;

/// Prints the tool version.
pub fn print_version() {
    println!("mkfs.emberfs, part of emberfs-utils {}", env!("CARGO_PKG_VERSION"));
}

/// Prints the command line help.
pub fn print_usage() {
    println!("create volume of emberfs file system\n");
    println!("Usage: mkfs.emberfs <options> [<device> | <image-file>]");
    println!("Options:");
    println!("\t [-B|--blkbmap has_copy,compression=(none|zlib|lzo)]\t  block bitmap options.");
    println!("\t [-C|--compression (none|zlib|lzo)]\t  compression type support.");
    println!("\t [-D|--nand-dies count]\t  NAND dies count.");
    println!("\t [-d|--debug]\t\t  show debug output.");
    println!("\t [-e|--erasesize size]\t  erase size of target device (128KB|256KB|512KB|2MB|8MB).");
    println!("\t [-f|--force]\t\t  force overwrite of existing filesystem.");
    println!("\t [-h|--help]\t\t  display help message and exit.");
    println!("\t [-i|--inode_size size]\t  inode size in bytes (256B|512B|1KB|2KB|4KB).");
    println!("\t [-K|--not-erase-device]  do not erase device by mkfs.");
    println!("\t [-L|--label]\t\t  set a volume label.");
    println!(
        "\t [-M|--maptbl has_copy,stripes_per_fragment=value,fragments_per_peb=value,\
         log_pages=value,migration_threshold=value,reserved_pebs_per_fragment=percentage,\
         compression=(none|zlib|lzo)]\t  PEB mapping table options."
    );
    println!("\t [-m|--migration-threshold]  max amount of migration PEBs for segment.");
    println!("\t [-O|--offsets_table has_copy,compression=(none|zlib|lzo)]\t  offsets table options.");
    println!("\t [-p|--pagesize size]\t  page size of target device (4KB|8KB|16KB|32KB).");
    println!("\t [-q|--quiet]\t\t  quiet execution (useful for scripts).");
    println!(
        "\t [-S|--segbmap has_copy,segs_per_chain=value,fragments_per_peb=value,\
         log_pages=value,migration_threshold=value,compression=(none|zlib|lzo)]\t  \
         segment bitmap options."
    );
    println!(
        "\t [-s|--segsize size]\t  segment size of target device \
         (128KB|256KB|512KB|2MB|8MB|16MB|32MB|64MB|...)."
    );
    println!(
        "\t [-T|--btree node_size=value,min_index_area_size=value,leaf_node_log_pages=value,\
         hybrid_node_log_pages=value,index_node_log_pages=value]\t  btrees' options."
    );
    println!(
        "\t [-U|--user_data_segment log_pages=value,migration_threshold=value,\
         compression=(none|zlib|lzo)]\t  user data segment options."
    );
    println!("\t [-V|--version]\t\t  print version and exit.");
}

fn usage_error(msg: &str) -> ! {
    eprintln!("mkfs.emberfs: {msg}");
    print_usage();
    exit(1);
}

/// Parses a size token: a plain byte count or a suffixed unit from the fixed
/// granularity set.
pub fn parse_granularity(value: &str) -> Option<u64> {
    let table: &[(&str, u64)] = &[
        ("256B", crate::SIZE_256B),
        ("512B", crate::SIZE_512B),
        ("1KB", crate::SIZE_1KB),
        ("2KB", crate::SIZE_2KB),
        ("4KB", crate::SIZE_4KB),
        ("8KB", crate::SIZE_8KB),
        ("16KB", crate::SIZE_16KB),
        ("32KB", crate::SIZE_32KB),
        ("64KB", crate::SIZE_64KB),
        ("128KB", crate::SIZE_128KB),
        ("256KB", crate::SIZE_256KB),
        ("512KB", crate::SIZE_512KB),
        ("2MB", crate::SIZE_2MB),
        ("8MB", crate::SIZE_8MB),
        ("16MB", crate::SIZE_16MB),
        ("32MB", crate::SIZE_32MB),
        ("64MB", crate::SIZE_64MB),
        ("128MB", crate::SIZE_128MB),
        ("256MB", crate::SIZE_256MB),
        ("512MB", crate::SIZE_512MB),
        ("1GB", crate::SIZE_1GB),
        ("2GB", crate::SIZE_2GB),
        ("8GB", crate::SIZE_8GB),
        ("16GB", crate::SIZE_16GB),
        ("32GB", crate::SIZE_32GB),
        ("64GB", crate::SIZE_64GB),
    ];

    for (token, size) in table {
        if value.eq_ignore_ascii_case(token) {
            return Some(*size);
        }
    }

    value.parse::<u64>().ok()
}

fn check_pagesize(pagesize: u64) {
    match pagesize {
        crate::SIZE_4KB | crate::SIZE_8KB | crate::SIZE_16KB | crate::SIZE_32KB => {}
        _ => usage_error("unsupported page size"),
    }
}

fn check_erasesize(erasesize: u64) {
    match erasesize {
        crate::SIZE_128KB | crate::SIZE_256KB | crate::SIZE_512KB | crate::SIZE_2MB
        | crate::SIZE_8MB => {}
        _ => usage_error("unsupported erase size"),
    }
}

fn check_segsize(segsize: u64) {
    match segsize {
        crate::SIZE_128KB | crate::SIZE_256KB | crate::SIZE_512KB | crate::SIZE_2MB
        | crate::SIZE_8MB | crate::SIZE_16MB | crate::SIZE_32MB | crate::SIZE_64MB
        | crate::SIZE_128MB | crate::SIZE_256MB | crate::SIZE_512MB | crate::SIZE_1GB
        | crate::SIZE_2GB | crate::SIZE_8GB | crate::SIZE_16GB | crate::SIZE_32GB
        | crate::SIZE_64GB => {}
        _ => usage_error("unsupported segment size"),
    }
}

fn check_inode_size(inode_size: u64) {
    match inode_size {
        crate::SIZE_256B | crate::SIZE_512B | crate::SIZE_1KB | crate::SIZE_2KB
        | crate::SIZE_4KB => {}
        _ => usage_error("unsupported inode size"),
    }
}

fn check_btree_node_size(node_size: u64) {
    match node_size {
        crate::SIZE_4KB | crate::SIZE_8KB | crate::SIZE_16KB | crate::SIZE_32KB
        | crate::SIZE_64KB => {}
        _ => usage_error("unsupported btree node size"),
    }
}

fn parse_u16_field(option: &str, value: &str) -> u16 {
    let parsed = value
        .parse::<u32>()
        .unwrap_or_else(|_| usage_error(&format!("invalid {option} value '{value}'")));

    if parsed == 0 || parsed >= u16::MAX as u32 {
        usage_error(&format!("invalid {option} option: value {parsed} is out of range"));
    }

    parsed as u16
}

fn parse_compression_field(value: &str) -> CompressionType {
    CompressionType::parse(value)
        .unwrap_or_else(|_| usage_error(&format!("unknown compression type '{value}'")))
}

fn next_value(args: &mut std::vec::IntoIter<String>, option: &str) -> String {
    args.next()
        .unwrap_or_else(|| usage_error(&format!("option {option} requires an argument")))
}

fn split_suboptions(list: &str) -> Vec<(String, Option<String>)> {
    list.split(',')
        .filter(|token| !token.is_empty())
        .map(|token| match token.split_once('=') {
            Some((key, value)) => (key.to_string(), Some(value.to_string())),
            None => (token.to_string(), None),
        })
        .collect()
}

fn suboption_value(key: &str, value: Option<String>) -> String {
    value.unwrap_or_else(|| usage_error(&format!("suboption {key} requires a value")))
}

fn parse_blkbmap_options(layout: &mut VolumeLayout, list: &str) {
    for (key, value) in split_suboptions(list) {
        match key.as_str() {
            "has_copy" => layout.blkbmap.has_backup_copy = true,
            "compression" => {
                layout.blkbmap.compression = parse_compression_field(&suboption_value(&key, value));
            }
            _ => usage_error(&format!("unknown blkbmap suboption '{key}'")),
        }
    }
}

fn parse_blk2off_options(layout: &mut VolumeLayout, list: &str) {
    for (key, value) in split_suboptions(list) {
        match key.as_str() {
            "has_copy" => layout.blk2off_tbl.has_backup_copy = true,
            "compression" => {
                layout.blk2off_tbl.compression =
                    parse_compression_field(&suboption_value(&key, value));
            }
            _ => usage_error(&format!("unknown offsets_table suboption '{key}'")),
        }
    }
}

fn parse_segbmap_options(layout: &mut VolumeLayout, list: &str) {
    for (key, value) in split_suboptions(list) {
        match key.as_str() {
            "has_copy" => layout.segbmap.has_backup_copy = true,
            "segs_per_chain" => {
                let mut segs = parse_u16_field(&key, &suboption_value(&key, value));
                if segs as usize > ondisk::SEGBMAP_SEGS {
                    segs = ondisk::SEGBMAP_SEGS as u16;
                    crate::mkfs_warn!("invalid segbmap option: segs_per_chain will equal to {segs}");
                }
                layout.segbmap.segs_per_chain = segs;
            }
            "fragments_per_peb" => {
                layout.segbmap.fragments_per_peb = parse_u16_field(&key, &suboption_value(&key, value));
            }
            "log_pages" => {
                layout.segbmap.log_pages = parse_u16_field(&key, &suboption_value(&key, value));
            }
            "migration_threshold" => {
                layout.segbmap.migration_threshold =
                    parse_u16_field(&key, &suboption_value(&key, value));
            }
            "compression" => {
                layout.segbmap.compression = parse_compression_field(&suboption_value(&key, value));
            }
            _ => usage_error(&format!("unknown segbmap suboption '{key}'")),
        }
    }
}

fn parse_maptbl_options(layout: &mut VolumeLayout, list: &str) {
    for (key, value) in split_suboptions(list) {
        match key.as_str() {
            "has_copy" => layout.maptbl.has_backup_copy = true,
            "stripes_per_fragment" => {
                layout.maptbl.stripes_per_portion =
                    parse_u16_field(&key, &suboption_value(&key, value));
            }
            "fragments_per_peb" => {
                layout.maptbl.portions_per_fragment =
                    parse_u16_field(&key, &suboption_value(&key, value));
                layout.maptbl.portions_per_fragment_explicit = true;
            }
            "log_pages" => {
                layout.maptbl.log_pages = parse_u16_field(&key, &suboption_value(&key, value));
            }
            "migration_threshold" => {
                layout.maptbl.migration_threshold =
                    parse_u16_field(&key, &suboption_value(&key, value));
            }
            "reserved_pebs_per_fragment" => {
                let pct = parse_u16_field(&key, &suboption_value(&key, value));
                if pct > 80 {
                    usage_error("invalid reserved PEBs per fragment: use 1%-80% in the range");
                }
                layout.maptbl.reserved_pebs_per_fragment = pct;
            }
            "compression" => {
                layout.maptbl.compression = parse_compression_field(&suboption_value(&key, value));
            }
            _ => usage_error(&format!("unknown maptbl suboption '{key}'")),
        }
    }
}

fn parse_user_data_options(layout: &mut VolumeLayout, list: &str) {
    for (key, value) in split_suboptions(list) {
        match key.as_str() {
            "log_pages" => {
                layout.user_data_seg.log_pages = parse_u16_field(&key, &suboption_value(&key, value));
            }
            "migration_threshold" => {
                layout.user_data_seg.migration_threshold =
                    parse_u16_field(&key, &suboption_value(&key, value));
            }
            "compression" => {
                layout.user_data_seg.compression =
                    parse_compression_field(&suboption_value(&key, value));
            }
            _ => usage_error(&format!("unknown user_data_segment suboption '{key}'")),
        }
    }
}

fn parse_btree_options(layout: &mut VolumeLayout, list: &str) {
    for (key, value) in split_suboptions(list) {
        match key.as_str() {
            "node_size" => {
                let size = parse_granularity(&suboption_value(&key, value))
                    .unwrap_or_else(|| usage_error("invalid btree node_size"));
                check_btree_node_size(size);
                layout.btree.node_size = size as u32;
            }
            "min_index_area_size" => {
                let size = parse_u16_field(&key, &suboption_value(&key, value));
                if size as usize % std::mem::size_of::<ondisk::BtreeIndexKey>() != 0 {
                    usage_error("min_index_area_size is not aligned on the index size");
                }
                layout.btree.min_index_area_size = size;
            }
            "leaf_node_log_pages" => {
                layout.btree.lnode_log_pages = parse_u16_field(&key, &suboption_value(&key, value));
            }
            "hybrid_node_log_pages" => {
                layout.btree.hnode_log_pages = parse_u16_field(&key, &suboption_value(&key, value));
            }
            "index_node_log_pages" => {
                layout.btree.inode_log_pages = parse_u16_field(&key, &suboption_value(&key, value));
            }
            _ => usage_error(&format!("unknown btree suboption '{key}'")),
        }
    }
}

/// Parses the command line into the volume layout. Returns the device path.
pub fn parse_options(args: ArgsOs, layout: &mut VolumeLayout) -> PathBuf {
    let args: Vec<String> = args
        .map(|arg| {
            arg.into_string()
                .unwrap_or_else(|_| usage_error("arguments must be valid UTF-8"))
        })
        .collect();
    let mut args = args.into_iter();
    let mut device_path: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-B" | "--blkbmap" => {
                let list = next_value(&mut args, &arg);
                parse_blkbmap_options(layout, &list);
            }
            "-C" | "--compression" => {
                let value = next_value(&mut args, &arg);
                layout.compression = parse_compression_field(&value);
            }
            "-D" | "--nand-dies" => {
                let value = next_value(&mut args, &arg);
                let dies = value
                    .parse::<u32>()
                    .unwrap_or_else(|_| usage_error("invalid NAND dies count"));
                if dies == 0 || dies % 2 != 0 {
                    usage_error(&format!("invalid nand-dies option: nand-dies {dies} is odd"));
                }
                layout.nand_dies_count = dies;
            }
            "-d" | "--debug" => {
                layout.env.show_debug = true;
            }
            "-e" | "--erasesize" => {
                let value = next_value(&mut args, &arg);
                let size = parse_granularity(&value)
                    .unwrap_or_else(|| usage_error("invalid erase size"));
                check_erasesize(size);
                layout.env.erase_size = size as u32;
            }
            "-f" | "--force" => {
                layout.force_overwrite = true;
            }
            "-h" | "--help" => {
                print_usage();
                exit(0);
            }
            "-i" | "--inode_size" => {
                let value = next_value(&mut args, &arg);
                let size = parse_granularity(&value)
                    .unwrap_or_else(|| usage_error("invalid inode size"));
                check_inode_size(size);
                layout.inode_size = size as u16;
            }
            "-K" | "--not-erase-device" => {
                layout.need_erase_device = false;
            }
            "-L" | "--label" => {
                let value = next_value(&mut args, &arg);
                let bytes = value.as_bytes();
                let len = bytes.len().min(ondisk::VOLUME_LABEL_MAX);
                layout.volume_label = [0; ondisk::VOLUME_LABEL_MAX];
                layout.volume_label[..len].copy_from_slice(&bytes[..len]);
            }
            "-M" | "--maptbl" => {
                let list = next_value(&mut args, &arg);
                parse_maptbl_options(layout, &list);
            }
            "-m" | "--migration-threshold" => {
                let value = next_value(&mut args, &arg);
                layout.migration_threshold = parse_u16_field("migration_threshold", &value);
            }
            "-O" | "--offsets_table" => {
                let list = next_value(&mut args, &arg);
                parse_blk2off_options(layout, &list);
            }
            "-p" | "--pagesize" => {
                let value = next_value(&mut args, &arg);
                let size = parse_granularity(&value)
                    .unwrap_or_else(|| usage_error("invalid page size"));
                check_pagesize(size);
                layout.page_size = size as u32;
            }
            "-q" | "--quiet" => {
                layout.env.show_info = false;
            }
            "-S" | "--segbmap" => {
                let list = next_value(&mut args, &arg);
                parse_segbmap_options(layout, &list);
            }
            "-s" | "--segsize" => {
                let value = next_value(&mut args, &arg);
                let size = parse_granularity(&value)
                    .unwrap_or_else(|| usage_error("invalid segment size"));
                check_segsize(size);
                layout.seg_size = size;
            }
            "-T" | "--btree" => {
                let list = next_value(&mut args, &arg);
                parse_btree_options(layout, &list);
            }
            "-U" | "--user_data_segment" => {
                let list = next_value(&mut args, &arg);
                parse_user_data_options(layout, &list);
            }
            "-V" | "--version" => {
                print_version();
                exit(0);
            }
            _ if arg.starts_with('-') => {
                usage_error(&format!("unknown option '{arg}'"));
            }
            _ => {
                if device_path.is_some() {
                    usage_error("more than one device is given");
                }
                device_path = Some(PathBuf::from(arg));
            }
        }
    }

    device_path.unwrap_or_else(|| usage_error("specify path to a device"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn granularity_tokens_and_raw_numbers() {
        assert_eq!(parse_granularity("4KB"), Some(crate::SIZE_4KB));
        assert_eq!(parse_granularity("8mb"), Some(crate::SIZE_8MB));
        assert_eq!(parse_granularity("64GB"), Some(crate::SIZE_64GB));
        assert_eq!(parse_granularity("131072"), Some(crate::SIZE_128KB));
        assert_eq!(parse_granularity("potato"), None);
    }

    #[test]
    fn suboption_lists_split_into_keys_and_values() {
        let parsed = split_suboptions("has_copy,log_pages=32,compression=zlib");

        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0], ("has_copy".to_string(), None));
        assert_eq!(parsed[1], ("log_pages".to_string(), Some("32".to_string())));
        assert_eq!(parsed[2], ("compression".to_string(), Some("zlib".to_string())));
    }

    #[test]
    fn maptbl_suboptions_reach_the_layout() {
        let mut layout = VolumeLayout::new();
        parse_maptbl_options(
            &mut layout,
            "has_copy,stripes_per_fragment=4,fragments_per_peb=2,log_pages=32,migration_threshold=5,compression=zlib",
        );

        assert!(layout.maptbl.has_backup_copy);
        assert_eq!(layout.maptbl.stripes_per_portion, 4);
        assert_eq!(layout.maptbl.portions_per_fragment, 2);
        assert!(layout.maptbl.portions_per_fragment_explicit);
        assert_eq!(layout.maptbl.log_pages, 32);
        assert_eq!(layout.maptbl.migration_threshold, 5);
        assert_eq!(layout.maptbl.compression, CompressionType::Zlib);
    }

    #[test]
    fn segbmap_suboptions_reach_the_layout() {
        let mut layout = VolumeLayout::new();
        parse_segbmap_options(&mut layout, "has_copy,segs_per_chain=2,log_pages=16");

        assert!(layout.segbmap.has_backup_copy);
        assert_eq!(layout.segbmap.segs_per_chain, 2);
        assert_eq!(layout.segbmap.log_pages, 16);
    }
}
