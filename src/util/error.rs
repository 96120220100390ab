use core::fmt::Display;

pub trait ErrorExt {
    type Ok;

    fn context(self, msg: &'static str) -> KernelResult<Self::Ok>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    StrError(&'static str),
    /// The path does not name a file.
    NotFound,
    PermissionDenied,
    BadDescriptor,
    /// A read came back short or the backend reported a failure.
    Io,
    /// Header magic did not match `\x7fELF`.
    NotElf,
    SegmentSizeMismatch { filesz: u64, memsz: u64 },
    AddressOverflow { vaddr: u64, memsz: u64 },
    UnknownSegmentFlags(u32),
    MappedRegionsExhausted,
    AlreadyMapped(u64),
    /// A virtual address has no valid leaf mapping.
    BadAddress(u64),
    OutOfMemory,
    InvalidFree(u64),
    /// A heap link or size read from user memory points outside the arena.
    HeapCorrupted(u64),
    ArgumentTooLong,
}

impl KernelError {
    pub fn msg(msg: &'static str) -> Self {
        Self::StrError(msg)
    }

    /// Whether this error means kernel state is corrupt and the hart must halt.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::NotFound
            | Self::PermissionDenied
            | Self::BadDescriptor
            | Self::Io
            | Self::NotElf
            | Self::OutOfMemory
            | Self::ArgumentTooLong => false,
            Self::StrError(_)
            | Self::SegmentSizeMismatch { .. }
            | Self::AddressOverflow { .. }
            | Self::UnknownSegmentFlags(_)
            | Self::MappedRegionsExhausted
            | Self::AlreadyMapped(_)
            | Self::BadAddress(_)
            | Self::InvalidFree(_)
            | Self::HeapCorrupted(_) => true,
        }
    }
}

impl From<&'static str> for KernelError {
    fn from(err: &'static str) -> Self {
        Self::StrError(err)
    }
}

impl Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::StrError(s) => write!(f, "{}", s),
            Self::NotFound => write!(f, "no such file"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::BadDescriptor => write!(f, "invalid file descriptor"),
            Self::Io => write!(f, "i/o error"),
            Self::NotElf => write!(f, "not an elf file"),
            Self::SegmentSizeMismatch { filesz, memsz } => {
                write!(f, "memsz 0x{:x} < filesz 0x{:x}", memsz, filesz)
            }
            Self::AddressOverflow { vaddr, memsz } => {
                write!(f, "vaddr 0x{:x} + memsz 0x{:x} overflows", vaddr, memsz)
            }
            Self::UnknownSegmentFlags(flags) => {
                write!(f, "unknown program segment encountered, segment flag:{}", flags)
            }
            Self::MappedRegionsExhausted => write!(f, "mapped region table is full"),
            Self::AlreadyMapped(va) => write!(f, "0x{:x} is already mapped", va),
            Self::BadAddress(va) => write!(f, "0x{:x} is not mapped", va),
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::InvalidFree(va) => write!(f, "invalid free of 0x{:x}", va),
            Self::HeapCorrupted(va) => write!(f, "heap corrupted at 0x{:x}", va),
            Self::ArgumentTooLong => write!(f, "argument too long"),
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

impl<T> ErrorExt for Option<T> {
    type Ok = T;

    fn context(self, msg: &'static str) -> KernelResult<Self::Ok> {
        match self {
            Some(s) => Ok(s),
            None => Err(KernelError::StrError(msg)),
        }
    }
}
