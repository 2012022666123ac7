//! TNFS protocol data types and constants.
//!
//! # Protocol
//! TNFS 1.2

use std::fmt;
use std::io::SeekFrom;
use std::mem::size_of;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use enum_primitive::*;
use nix::{fcntl::OFlag, sys::stat::SFlag};

use crate::error::{Error, Status};
use crate::utils::Result;

/// Default TNFS port, for both UDP and TCP
pub const TNFS_PORT: u16 = 16384;

/// Largest payload a single `Read`/`Write` exchange may carry
pub const MAX_IO_SIZE: usize = 512;

/// Room for the request header
///
/// session[2] sequence[1] opcode[1]
pub const HEADER_SIZE: usize = 4;

/// Room for the reply header
///
/// session[2] sequence[1] opcode[1] status[1]
pub const REPLY_HEADER_SIZE: usize = HEADER_SIZE + 1;

/// Receive buffer size for a single reply datagram
pub const MAX_MESSAGE_SIZE: usize = 2048;

/// Special session id carried by `Mount`, before the server has assigned one
pub const NO_SESSION: u16 = 0;

/// Protocol version, ordered by (major, minor)
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Version {
        Version { major, minor }
    }

    /// Version requested by this client when mounting
    pub const CLIENT: Version = Version::new(1, 2);

    /// First version with `OpenDirX`/`ReadDirX`
    pub const EXTENDED_DIR: Version = Version::new(1, 2);
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $what:expr) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u8);

        impl TryFrom<u32> for $name {
            type Error = Error;

            fn try_from(raw: u32) -> Result<Self> {
                u8::try_from(raw).map($name).map_err(|_| Error::OutOfRange {
                    field: $what,
                    max: u8::MAX as u64,
                })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

handle_type! {
    /// Server-scoped file descriptor returned by `Open`
    ///
    /// Only valid within the session that opened it, and only until `Close` succeeds.
    FileHandle, "file handle"
}

handle_type! {
    /// Server-scoped directory handle returned by `OpenDir`/`OpenDirX`
    DirHandle, "directory handle"
}

bitflags! {
    /// Flags of `Command::Open`
    ///
    /// The bit positions are TNFS specific and do not match any host's `O_*` values.
    /// The access mode occupies the low two bits; convert from and to the host with
    /// `From<OFlag>` and `From<OpenFlags>`.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct OpenFlags: u16 {
        const RDONLY    = 0x0001;
        const WRONLY    = 0x0002;
        const RDWR      = 0x0003;
        const APPEND    = 0x0008;
        const CREAT     = 0x0100;
        const TRUNC     = 0x0200;
        const EXCL      = 0x0400;
    }
}

/// Host flags with a direct TNFS counterpart, besides the access mode
const HOST_FLAG_MAP: [(OFlag, OpenFlags); 4] = [
    (OFlag::O_APPEND, OpenFlags::APPEND),
    (OFlag::O_CREAT, OpenFlags::CREAT),
    (OFlag::O_TRUNC, OpenFlags::TRUNC),
    (OFlag::O_EXCL, OpenFlags::EXCL),
];

impl OpenFlags {
    /// Mask of the access mode bits
    pub const ACCESS_MODE: u16 = 0x0003;

    /// The access mode part of the flags (`RDONLY`, `WRONLY` or `RDWR`)
    pub fn access_mode(self) -> OpenFlags {
        OpenFlags::from_bits_retain(self.bits() & Self::ACCESS_MODE)
    }

    pub fn is_writable(self) -> bool {
        self.access_mode().contains(OpenFlags::WRONLY)
    }
}

impl From<OFlag> for OpenFlags {
    fn from(host: OFlag) -> Self {
        let access = host & OFlag::O_ACCMODE;
        let mut flags = if access == OFlag::O_WRONLY {
            OpenFlags::WRONLY
        } else if access == OFlag::O_RDWR {
            OpenFlags::RDWR
        } else {
            OpenFlags::RDONLY
        };

        for (host_flag, flag) in HOST_FLAG_MAP {
            if host.contains(host_flag) {
                flags.insert(flag);
            }
        }
        flags
    }
}

impl From<OpenFlags> for OFlag {
    fn from(flags: OpenFlags) -> Self {
        let mut host = match flags.access_mode() {
            m if m == OpenFlags::RDWR => OFlag::O_RDWR,
            m if m == OpenFlags::WRONLY => OFlag::O_WRONLY,
            _ => OFlag::O_RDONLY,
        };

        for (host_flag, flag) in HOST_FLAG_MAP {
            if flags.contains(flag) {
                host.insert(host_flag);
            }
        }
        host
    }
}

bitflags! {
    /// Directory options of `Command::OpenDirX`
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct DirOptions: u8 {
        #[doc = "Do not sort directories before files"]
        const NO_FOLDERSFIRST   = 0x01;
        #[doc = "Include hidden entries"]
        const NO_SKIPHIDDEN     = 0x02;
        #[doc = "Include special entries such as `.` and `..`"]
        const NO_SKIPSPECIAL    = 0x04;
        #[doc = "Apply the pattern to directories as well"]
        const DIR_PATTERN       = 0x08;
    }
}

bitflags! {
    /// Sort options of `Command::OpenDirX`
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct SortOptions: u8 {
        const NONE          = 0x01;
        const CASE          = 0x02;
        const DESCENDING    = 0x04;
        const MODIFIED      = 0x08;
        const SIZE          = 0x10;
    }
}

bitflags! {
    /// Bits in `DirEntry.flags`
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct DirEntryFlags: u8 {
        const DIR       = 0x01;
        const HIDDEN    = 0x02;
        const SPECIAL   = 0x04;
    }
}

bitflags! {
    /// Batch status of `Response::ReadDirX`
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct DirStatus: u8 {
        #[doc = "No entries remain after this batch"]
        const EOF       = 0x01;
    }
}

enum_from_primitive! {
    #[doc = "Reference point of `Command::LSeek`"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum Whence {
        Set = 0,
        Cur = 1,
        End = 2,
    }
}

impl Whence {
    /// Translate a std seek position into a TNFS whence and 32-bit offset.
    pub fn from_seek(pos: SeekFrom) -> Result<(Whence, i32)> {
        let out_of_range = || Error::OutOfRange {
            field: "seek offset",
            max: i32::MAX as u64,
        };
        match pos {
            SeekFrom::Start(n) => Ok((Whence::Set, i32::try_from(n).map_err(|_| out_of_range())?)),
            SeekFrom::Current(n) => Ok((Whence::Cur, i32::try_from(n).map_err(|_| out_of_range())?)),
            SeekFrom::End(n) => Ok((Whence::End, i32::try_from(n).map_err(|_| out_of_range())?)),
        }
    }
}

/// Owner names reported by `Stat`
///
/// Servers that predate them stop the reply after `ctime`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Owner {
    pub user: String,
    pub group: String,
}

/// File attributes returned by `Command::Stat`
///
/// Times are seconds since the Unix epoch, as the server reports them.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stat {
    /// File type and permissions, in the host `st_mode` layout
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    /// Total size, in bytes
    pub size: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub owner: Option<Owner>,
}

impl Stat {
    /// File type bits of `mode`
    pub fn file_type(&self) -> SFlag {
        SFlag::from_bits_truncate(nix::libc::mode_t::from(self.mode)) & SFlag::S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == SFlag::S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.file_type() == SFlag::S_IFREG
    }

    /// Permission bits of `mode`
    pub fn permissions(&self) -> u16 {
        self.mode & 0o7777
    }

    pub fn modified(&self) -> SystemTime {
        epoch_seconds(self.mtime)
    }
}

/// Directory entry returned in batches by `ReadDirX`
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DirEntry {
    pub flags: DirEntryFlags,
    /// Size in bytes
    pub size: u32,
    /// Modification time, seconds since the Unix epoch
    pub mtime: u32,
    /// Creation time, seconds since the Unix epoch
    pub ctime: u32,
    /// Entry name, without the directory part
    pub name: String,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.flags.contains(DirEntryFlags::DIR)
    }

    pub fn modified(&self) -> SystemTime {
        epoch_seconds(self.mtime)
    }

    pub fn created(&self) -> SystemTime {
        epoch_seconds(self.ctime)
    }

    /// Encoded size of the entry
    pub fn encoded_len(&self) -> usize {
        size_of::<u8>() + size_of::<u32>() * 3 + self.name.len() + 1
    }
}

fn epoch_seconds(secs: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.into())
}

/// Data type used in `Response::Read` and `Command::Write`
///
/// At most [`MAX_IO_SIZE`] bytes; the encoder rejects anything larger.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    #[doc = "Command opcodes, TNFS operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum Opcode {
        // Session
        Mount       = 0x00,
        Umount      = 0x01,

        // Directories
        OpenDir     = 0x10,
        ReadDir     = 0x11,
        CloseDir    = 0x12,
        MkDir       = 0x13,
        RmDir       = 0x14,
        //TellDir     = 0x15,
        //SeekDir     = 0x16,
        OpenDirX    = 0x17,
        ReadDirX    = 0x18,

        // Files
        //OpenOld     = 0x20,
        Read        = 0x21,
        Write       = 0x22,
        Close       = 0x23,
        Stat        = 0x24,
        LSeek       = 0x25,
        Unlink      = 0x26,
        ChMod       = 0x27,
        Rename      = 0x28,
        Open        = 0x29,

        // Filesystem
        Size        = 0x30,
        Free        = 0x31,
    }
}

impl Opcode {
    /// Every opcode this client speaks
    pub const ALL: [Opcode; 20] = [
        Opcode::Mount,
        Opcode::Umount,
        Opcode::OpenDir,
        Opcode::ReadDir,
        Opcode::CloseDir,
        Opcode::MkDir,
        Opcode::RmDir,
        Opcode::OpenDirX,
        Opcode::ReadDirX,
        Opcode::Read,
        Opcode::Write,
        Opcode::Close,
        Opcode::Stat,
        Opcode::LSeek,
        Opcode::Unlink,
        Opcode::ChMod,
        Opcode::Rename,
        Opcode::Open,
        Opcode::Size,
        Opcode::Free,
    ];

    /// Oldest protocol version that understands the opcode
    pub fn min_version(&self) -> Version {
        match *self {
            Opcode::OpenDirX | Opcode::ReadDirX => Version::EXTENDED_DIR,
            _ => Version::new(1, 0),
        }
    }
}

impl<'a> From<&'a Command> for Opcode {
    fn from(command: &'a Command) -> Opcode {
        match *command {
            Command::Mount { .. } => Opcode::Mount,
            Command::Umount => Opcode::Umount,
            Command::OpenDir { .. } => Opcode::OpenDir,
            Command::ReadDir { .. } => Opcode::ReadDir,
            Command::CloseDir { .. } => Opcode::CloseDir,
            Command::MkDir { .. } => Opcode::MkDir,
            Command::RmDir { .. } => Opcode::RmDir,
            Command::OpenDirX { .. } => Opcode::OpenDirX,
            Command::ReadDirX { .. } => Opcode::ReadDirX,
            Command::Open { .. } => Opcode::Open,
            Command::Read { .. } => Opcode::Read,
            Command::Write { .. } => Opcode::Write,
            Command::Close { .. } => Opcode::Close,
            Command::Stat { .. } => Opcode::Stat,
            Command::LSeek { .. } => Opcode::LSeek,
            Command::Unlink { .. } => Opcode::Unlink,
            Command::ChMod { .. } => Opcode::ChMod,
            Command::Rename { .. } => Opcode::Rename,
            Command::Size => Opcode::Size,
            Command::Free => Opcode::Free,
        }
    }
}

impl<'a> From<&'a Response> for Opcode {
    fn from(response: &'a Response) -> Opcode {
        match *response {
            Response::Mount { .. } => Opcode::Mount,
            Response::Umount => Opcode::Umount,
            Response::OpenDir { .. } => Opcode::OpenDir,
            Response::ReadDir { .. } => Opcode::ReadDir,
            Response::CloseDir => Opcode::CloseDir,
            Response::MkDir => Opcode::MkDir,
            Response::RmDir => Opcode::RmDir,
            Response::OpenDirX { .. } => Opcode::OpenDirX,
            Response::ReadDirX { .. } => Opcode::ReadDirX,
            Response::Open { .. } => Opcode::Open,
            Response::Read { .. } => Opcode::Read,
            Response::Write { .. } => Opcode::Write,
            Response::Close => Opcode::Close,
            Response::Stat { .. } => Opcode::Stat,
            Response::LSeek => Opcode::LSeek,
            Response::Unlink => Opcode::Unlink,
            Response::ChMod => Opcode::ChMod,
            Response::Rename => Opcode::Rename,
            Response::Size { .. } => Opcode::Size,
            Response::Free { .. } => Opcode::Free,
        }
    }
}

/// Client to server messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Command {
    // Session
    Mount {
        version: Version,
        location: String,
        user: String,
        password: String,
    },
    Umount,

    // Directories
    OpenDir {
        path: String,
    },
    ReadDir {
        handle: DirHandle,
    },
    CloseDir {
        handle: DirHandle,
    },
    MkDir {
        path: String,
    },
    RmDir {
        path: String,
    },
    OpenDirX {
        path: String,
        pattern: String,
        dir_options: DirOptions,
        sort_options: SortOptions,
        max_results: u16,
    },
    /// `max_entries` of 0 lets the server fill the reply
    ReadDirX {
        handle: DirHandle,
        max_entries: u8,
    },

    // Files
    Open {
        path: String,
        flags: OpenFlags,
        mode: u16,
    },
    /// `size` must not exceed [`MAX_IO_SIZE`]
    Read {
        fd: FileHandle,
        size: u16,
    },
    Write {
        fd: FileHandle,
        data: Data,
    },
    Close {
        fd: FileHandle,
    },
    Stat {
        path: String,
    },
    LSeek {
        fd: FileHandle,
        whence: Whence,
        offset: i32,
    },
    Unlink {
        path: String,
    },
    ChMod {
        path: String,
        mode: u16,
    },
    Rename {
        source: String,
        destination: String,
    },

    // Filesystem
    Size,
    Free,
}

/// Payload of a successful reply
///
/// A reply with a nonzero status carries no payload; see [`Reply::outcome`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Response {
    // Session
    Mount {
        version: Version,
        /// Minimum milliseconds the server wants between retransmissions
        retry_delay: u16,
    },
    Umount,

    // Directories
    OpenDir {
        handle: DirHandle,
    },
    ReadDir {
        name: String,
    },
    CloseDir,
    MkDir,
    RmDir,
    OpenDirX {
        handle: DirHandle,
        /// Number of entries matching the query
        count: u16,
    },
    ReadDirX {
        status: DirStatus,
        /// Directory cursor after this batch
        position: u16,
        entries: Vec<DirEntry>,
    },

    // Files
    Open {
        fd: FileHandle,
    },
    Read {
        data: Data,
    },
    Write {
        /// Bytes the server accepted
        size: u16,
    },
    Close,
    Stat {
        stat: Stat,
    },
    LSeek,
    Unlink,
    ChMod,
    Rename,

    // Filesystem
    /// Filesystem capacity in kilobytes
    Size {
        size: u32,
    },
    /// Free space in kilobytes
    Free {
        free: u32,
    },
}

/// Result of one protocol operation: the typed payload, or the nonzero status.
pub type Outcome<T> = std::result::Result<T, Status>;

/// Envelope for client requests
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Request {
    /// Connection id assigned by `Mount`, [`NO_SESSION`] before that
    pub session: u16,
    /// Echoed by the server, which uses it to spot retransmissions
    pub sequence: u8,
    pub body: Command,
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        Opcode::from(&self.body)
    }
}

/// Envelope for server replies
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reply {
    pub session: u16,
    pub sequence: u8,
    pub opcode: Opcode,
    /// The payload on success, otherwise the status byte
    pub outcome: Outcome<Response>,
}

impl Reply {
    pub fn ok(session: u16, sequence: u8, body: Response) -> Reply {
        Reply {
            session,
            sequence,
            opcode: Opcode::from(&body),
            outcome: Ok(body),
        }
    }

    pub fn failed(session: u16, sequence: u8, opcode: Opcode, status: Status) -> Reply {
        Reply {
            session,
            sequence,
            opcode,
            outcome: Err(status),
        }
    }

    pub fn status(&self) -> Status {
        match self.outcome {
            Ok(_) => Status::SUCCESS,
            Err(status) => status,
        }
    }
}
