use thiserror::Error;

/// Per-drive failure taxonomy. None of these abort a run: the drive that
/// hit one is excluded and the remaining drives carry on.
#[derive(Error, Debug)]
pub enum FixError {
    #[error("not managed")]
    NotManaged,

    #[error("root sector failure: {0}")]
    RootSectorRead(#[source] std::io::Error),

    #[error("not a valid MBR")]
    InvalidSignature,

    #[error("extended chain deeper than {max} links")]
    ChainTooDeep { max: usize },

    #[error("not in partition table")]
    PartitionNotFound,

    #[error("no DOS image in partition")]
    NoDosImage,

    #[error("not a FAT16 boot sector: {0}")]
    NotFat16(String),

    #[error(
        "filesystem larger than partition: {fs_bytes} bytes declared, {partition_bytes} bytes available"
    )]
    FilesystemInconsistent { fs_bytes: u64, partition_bytes: u64 },

    #[error("can't shrink system sectors: {new_total} sectors left, {floor} required")]
    UnsafeShrink { new_total: u64, floor: u64 },

    #[error("write to sector {sector} failed: {source}")]
    WriteFailure {
        sector: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("sector {sector} changed since it was scanned")]
    StaleSector { sector: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FixError {
    /// True for the failures that mean the on-disk table itself can't be
    /// trusted, as opposed to the partition simply not being there.
    pub fn is_invalid_table(&self) -> bool {
        matches!(self, FixError::InvalidSignature | FixError::ChainTooDeep { .. })
    }
}
