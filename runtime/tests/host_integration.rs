//! Integration tests against the real host: loop devices, mkfs, mount, GRUB.
//!
//! ## Prerequisites
//!
//! - root (loop devices, mount, mknod)
//! - `losetup`, `mkfs.ext4`, `chroot` and `grub-install` on the host
//! - Internet access for the full conversion test
//!
//! ## Running
//!
//! ```bash
//! sudo -E cargo test -p dockboot-runtime --test host_integration -- --ignored --nocapture
//! ```
//!
//! Tests are `#[ignore]` by default because they need privileges and
//! network access.

use std::fs::File;
use std::process::Command;
use std::sync::Arc;

use dockboot_core::{ConvertConfig, ProgressReporter};
use dockboot_runtime::disk::{AttachmentLock, BlockAttachment, PartitionTable};
use dockboot_runtime::{
    check_disk_support, ConversionRequest, Converter, DiskLayout, HostBackend, ResourceKind,
    ResourceTracker,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const MIB: u64 = 1024 * 1024;

/// Loop devices currently backed by `image`, per `losetup -j`.
fn loop_devices_for(image: &std::path::Path) -> String {
    let output = Command::new("losetup")
        .arg("-j")
        .arg(image)
        .output()
        .expect("losetup should run");
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn mounts_under(dir: &std::path::Path) -> Vec<String> {
    let mounts = std::fs::read_to_string("/proc/self/mounts").unwrap_or_default();
    let prefix = dir.to_string_lossy().to_string();
    mounts
        .lines()
        .filter_map(|l| l.split_whitespace().nth(1))
        .filter(|m| m.starts_with(&prefix))
        .map(str::to_string)
        .collect()
}

#[test]
fn test_unprivileged_host_fails_fast() {
    if nix::unistd::geteuid().is_root() {
        return;
    }
    let err = check_disk_support(false).unwrap_err();
    assert!(err.to_string().contains("root"), "{}", err);
}

#[test]
#[ignore]
fn test_attach_detach_real_loop_device() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("disk.img");

    let layout = DiskLayout::plan(&ConvertConfig::default(), 512 * MIB).unwrap();
    let file = File::create(&image).unwrap();
    file.set_len(layout.total_bytes).unwrap();
    let mut file = std::fs::OpenOptions::new().write(true).open(&image).unwrap();
    PartitionTable::from_layout(&layout)
        .unwrap()
        .write_to(&mut file)
        .unwrap();
    drop(file);

    let tracker = ResourceTracker::new();
    let backend = Arc::new(HostBackend::new());
    let attachment =
        BlockAttachment::acquire(&tracker, backend.clone(), &image, layout.partitions.len()).unwrap();
    assert!(attachment.device().partition(1).unwrap().exists());
    assert!(!loop_devices_for(&image).is_empty());

    // A second claim on the same backing file is refused while attached.
    assert!(BlockAttachment::acquire(&tracker, backend, &image, 1).is_err());

    attachment.release(&tracker).unwrap();
    assert!(tracker.active(ResourceKind::BlockAttachment).is_empty());
    assert!(loop_devices_for(&image).is_empty());
    assert!(AttachmentLock::acquire(&image).is_ok());
}

#[tokio::test]
#[ignore]
async fn test_convert_alpine_end_to_end() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("alpine.img");
    let config = ConvertConfig {
        workspace_dir: Some(dir.path().join("work")),
        ..Default::default()
    };

    let converted = Converter::new(config)
        .unwrap()
        .convert(
            ConversionRequest::new("alpine:3.19", 512 * MIB, &output),
            ProgressReporter::new(|u| eprintln!("{:>5.1}% {} {}", u.fraction * 100.0, u.phase, u.message)),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(converted.image_path, output);
    assert_eq!(std::fs::metadata(&output).unwrap().len(), 512 * MIB);
    let table = PartitionTable::read_from(&mut File::open(&output).unwrap()).unwrap();
    assert_eq!(table.bootable().count(), 1);

    assert!(loop_devices_for(&output).is_empty());
    assert!(mounts_under(dir.path()).is_empty());
    assert!(AttachmentLock::acquire(&output).is_ok());
}

#[tokio::test]
#[ignore]
async fn test_cancelled_conversion_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("cancelled.img");
    let config = ConvertConfig {
        workspace_dir: Some(dir.path().join("work")),
        ..Default::default()
    };

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let reporter = ProgressReporter::new(move |u| {
        if u.phase == dockboot_core::Phase::Populate {
            trigger.cancel();
        }
    });

    let failure = Converter::new(config)
        .unwrap()
        .convert(ConversionRequest::new("alpine:3.19", 512 * MIB, &output), reporter, cancel)
        .await
        .unwrap_err();

    assert_eq!(failure.phase, dockboot_core::Phase::Populate);
    assert!(!output.exists());
    assert!(mounts_under(dir.path()).is_empty());
    assert_eq!(std::fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
}
