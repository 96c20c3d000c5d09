//! `mkfs.emberfs` creates an emberfs volume on a device or image file.

use emberfs::commit;
use emberfs::device;
use emberfs::error::Error;
use emberfs::error::Result;
use emberfs::fatal;
use emberfs::layout;
use emberfs::layout::VolumeLayout;
use emberfs::mkfs_info;
use emberfs::ondisk;
use emberfs::options;
use std::env;
use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::Read;
use std::io::Seek;
use std::io::Write;
use std::process::exit;

/// Shows a prompt and returns the entered line.
fn prompt(text: &str) -> Option<String> {
    print!("{text}");
    let _ = io::stdout().flush();

    io::stdin().lock().lines().next().and_then(|line| line.ok())
}

/// Tells whether the target device is currently mounted.
fn is_device_mounted(dev_name: &str) -> bool {
    let mounts = match File::open("/proc/mounts") {
        Ok(file) => file,
        Err(_) => return false,
    };

    for line in io::BufReader::new(mounts).lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };

        if let Some(device) = line.split_whitespace().next() {
            if device == dev_name {
                return true;
            }
        }
    }

    false
}

/// Tells whether the device already carries an emberfs volume: the initial
/// snapshot log signature sits right behind the reserved boot record.
fn contains_existing_volume(layout: &VolumeLayout) -> Result<bool> {
    let mut magic = [0u8; 4];

    if layout.env.fs_size < ondisk::RESERVED_BOOT_RECORD_SIZE as u64 + magic.len() as u64 {
        return Ok(false);
    }

    let file = layout.env.device()?;
    let mut handle = file.try_clone().map_err(Error::Io)?;
    handle
        .seek(io::SeekFrom::Start(ondisk::RESERVED_BOOT_RECORD_SIZE as u64))
        .map_err(Error::Io)?;
    handle.read_exact(&mut magic).map_err(Error::Io)?;

    Ok(u32::from_le_bytes(magic) == ondisk::SUPER_MAGIC)
}

fn main() {
    let mut layout = VolumeLayout::new();

    let mut args = env::args_os();
    let _bin = args.next();
    let device_path = options::parse_options(args, &mut layout);
    layout.env.dev_name = device_path.display().to_string();

    let show_info = layout.env.show_info;

    mkfs_info!(show_info, "[001]\tOPEN DEVICE...");

    if let Err(err) = device::open_device(&mut layout.env) {
        fatal(err);
    }

    mkfs_info!(show_info, "[001]\t[SUCCESS]");
    mkfs_info!(show_info, "[002]\tCHECK ENVIRONMENT...");

    if let Err(err) = layout::validate_key_creation_options(&mut layout) {
        fatal(err);
    }

    if is_device_mounted(&layout.env.dev_name) {
        fatal(format!(
            "{} is currently mounted. You can't make a filesystem here.",
            layout.env.dev_name
        ));
    }

    match contains_existing_volume(&layout) {
        Ok(true) if !layout.force_overwrite => {
            println!(
                "{} appears to contain an existing emberfs volume",
                layout.env.dev_name
            );
            println!("All data will be lost after format!");

            let confirm = prompt("Continue? [y/N] ")
                .map(|line| line.trim().eq_ignore_ascii_case("y"))
                .unwrap_or(false);
            if !confirm {
                eprintln!("Abort.");
                exit(1);
            }
        }
        Ok(_) => {}
        Err(err) => fatal(err),
    }

    mkfs_info!(show_info, "[002]\t[SUCCESS]");
    mkfs_info!(show_info, "[003]\tPREPARE SEGMENTS ARRAY...");

    if let Err(err) = layout::alloc_segs_array(&mut layout) {
        fatal(err);
    }

    mkfs_info!(show_info, "[003]\t[SUCCESS]");
    mkfs_info!(show_info, "[004]\tCREATE VOLUME STRUCTURES...");

    if let Err(err) = layout::mkfs_create(&mut layout) {
        fatal(err);
    }

    mkfs_info!(show_info, "[004]\t[SUCCESS]");
    mkfs_info!(show_info, "[005]\tWRITE METADATA...");

    if let Err(err) = commit::write_device(&mut layout) {
        fatal(err);
    }

    mkfs_info!(show_info, "[005]\t[SUCCESS]");
}
