//! The closed set of filesystems the converter understands, with the
//! per-kind tool invocations for formatting and growing.

use std::fmt;

use super::runner::ToolCommand;

/// Filesystem kinds. `Ntfs` is only ever a source; the remaining six are
/// valid conversion targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsKind {
    Ntfs,
    Ext4,
    Btrfs,
    Xfs,
    F2fs,
    Reiserfs,
    Jfs,
}

/// How a filesystem is grown to fill its partition.
pub enum GrowStrategy {
    /// The resize tool takes the partition device; no mount involved.
    Device,
    /// The resize tool operates on a mount point; the volume must be
    /// mounted (callers may supply a mount or let the block layer create a
    /// scoped one).
    Mounted,
    /// The filesystem only grows through a remount with a resize option.
    /// An invocation detail of the tool, not a caller-visible requirement.
    RemountResize,
}

impl FsKind {
    pub const TARGETS: [FsKind; 6] = [
        FsKind::Ext4,
        FsKind::Btrfs,
        FsKind::Xfs,
        FsKind::F2fs,
        FsKind::Reiserfs,
        FsKind::Jfs,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FsKind::Ntfs => "ntfs",
            FsKind::Ext4 => "ext4",
            FsKind::Btrfs => "btrfs",
            FsKind::Xfs => "xfs",
            FsKind::F2fs => "f2fs",
            FsKind::Reiserfs => "reiserfs",
            FsKind::Jfs => "jfs",
        }
    }

    pub fn from_name(name: &str) -> Option<FsKind> {
        match name.to_lowercase().as_str() {
            "ntfs" | "ntfs3" => Some(FsKind::Ntfs),
            "ext4" => Some(FsKind::Ext4),
            "btrfs" => Some(FsKind::Btrfs),
            "xfs" => Some(FsKind::Xfs),
            "f2fs" => Some(FsKind::F2fs),
            "reiserfs" => Some(FsKind::Reiserfs),
            "jfs" => Some(FsKind::Jfs),
            _ => None,
        }
    }

    /// Whether growing this filesystem requires the volume to be mounted.
    /// Pure function of the kind.
    pub fn resize_requires_mount(&self) -> bool {
        matches!(self, FsKind::Btrfs | FsKind::Xfs)
    }

    /// The mkfs-family program for this kind.
    pub fn mkfs_tool(&self) -> &'static str {
        match self {
            FsKind::Ntfs => "mkfs.ntfs",
            FsKind::Ext4 => "mkfs.ext4",
            FsKind::Btrfs => "mkfs.btrfs",
            FsKind::Xfs => "mkfs.xfs",
            FsKind::F2fs => "mkfs.f2fs",
            FsKind::Reiserfs => "mkreiserfs",
            FsKind::Jfs => "mkfs.jfs",
        }
    }

    /// The resize-family program for this kind, probed during preflight.
    pub fn grow_tool(&self) -> &'static str {
        match self {
            FsKind::Ntfs => "ntfsresize",
            FsKind::Ext4 => "resize2fs",
            FsKind::Btrfs => "btrfs",
            FsKind::Xfs => "xfs_growfs",
            FsKind::F2fs => "resize.f2fs",
            FsKind::Reiserfs => "resize_reiserfs",
            FsKind::Jfs => "mount",
        }
    }

    pub fn grow_strategy(&self) -> GrowStrategy {
        match self {
            FsKind::Btrfs | FsKind::Xfs => GrowStrategy::Mounted,
            FsKind::Jfs => GrowStrategy::RemountResize,
            _ => GrowStrategy::Device,
        }
    }

    /// Full format invocation for a partition.
    pub fn mkfs_command(&self, partition: &str) -> ToolCommand {
        match self {
            FsKind::Ntfs => ToolCommand::new("mkfs.ntfs", ["-f", partition]),
            FsKind::Ext4 => ToolCommand::new("mkfs.ext4", ["-F", "-q", partition]),
            FsKind::Btrfs => ToolCommand::new("mkfs.btrfs", ["-f", "-q", partition]),
            FsKind::Xfs => ToolCommand::new("mkfs.xfs", ["-f", "-q", partition]),
            FsKind::F2fs => ToolCommand::new("mkfs.f2fs", ["-f", "-q", partition]),
            // mkreiserfs asks for confirmation twice
            FsKind::Reiserfs => ToolCommand::new("mkreiserfs", ["-f", "-f", "-q", partition]),
            FsKind::Jfs => ToolCommand::new("mkfs.jfs", ["-q", partition]),
        }
    }

    /// Grow-to-fill invocation. `mount_point` must be supplied for the
    /// mounted and remount strategies.
    pub fn grow_command(&self, partition: &str, mount_point: Option<&str>) -> ToolCommand {
        match self {
            FsKind::Ext4 => ToolCommand::new("resize2fs", [partition]),
            FsKind::F2fs => ToolCommand::new("resize.f2fs", [partition]),
            FsKind::Reiserfs => ToolCommand::new("resize_reiserfs", ["-f", partition]),
            FsKind::Btrfs => ToolCommand::new(
                "btrfs",
                ["filesystem", "resize", "max", mount_point.unwrap_or(partition)],
            ),
            FsKind::Xfs => ToolCommand::new("xfs_growfs", [mount_point.unwrap_or(partition)]),
            FsKind::Jfs => ToolCommand::new(
                "mount",
                ["-o", "remount,resize=0", mount_point.unwrap_or(partition)],
            ),
            FsKind::Ntfs => ToolCommand::new("ntfsresize", ["--force", partition]),
        }
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_requires_mount_table() {
        assert!(FsKind::Btrfs.resize_requires_mount());
        assert!(FsKind::Xfs.resize_requires_mount());
        assert!(!FsKind::Ext4.resize_requires_mount());
        assert!(!FsKind::F2fs.resize_requires_mount());
        assert!(!FsKind::Reiserfs.resize_requires_mount());
        assert!(!FsKind::Jfs.resize_requires_mount());
    }

    #[test]
    fn test_name_round_trip() {
        for kind in FsKind::TARGETS {
            assert_eq!(FsKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(FsKind::from_name("ntfs3"), Some(FsKind::Ntfs));
        assert_eq!(FsKind::from_name("vfat"), None);
    }

    #[test]
    fn test_mkfs_commands_target_the_partition() {
        for kind in FsKind::TARGETS {
            let cmd = kind.mkfs_command("/dev/sda2");
            assert!(cmd.args.iter().any(|a| a == "/dev/sda2"), "{kind}");
        }
    }
}
