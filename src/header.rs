//! Header frames: magic tags, frame codec, and the archive-management
//! headers (volume header, volume footer, archive root).
//!
//! Every header on the wire is a frame:
//!
//! | Type    | Name       | Description |
//! | ------: | ---------- | ----------- |
//! | [u8; 4] | magic      | Header kind, see [`Magic`] |
//! | u32     | archive_id | Archive this frame belongs to |
//! | u16     | fsid       | Owning filesystem, [`FSID_GLOBAL`] for archive-wide headers |
//! | dico    | payload    | See [`crate::dico`] |

use std::fmt;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::Utc;
use log::warn;
use thiserror::Error;
use uuid::Uuid;

use crate::dico::{Dico, DicoError};

/// Archive format version written into every volume header.
pub const FORMAT_VERSION: u32 = 1;

/// Sentinel fsid for headers that do not belong to one filesystem.
pub const FSID_GLOBAL: u16 = 0xFFFF;

/// Fixed bytes preceding the dico in every frame.
pub const FRAME_PREFIX_LEN: usize = 4 + 4 + 2;

// ── Magic ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Magic(pub [u8; 4]);

impl Magic {
    pub const VOLUME_HEADER: Magic = Magic(*b"FsVh");
    pub const VOLUME_FOOTER: Magic = Magic(*b"FsVf");
    pub const ARCHIVE_ROOT: Magic = Magic(*b"FsAr");
    pub const BLOCK: Magic = Magic(*b"FsBk");
    pub const FILESYSTEM_INFO: Magic = Magic(*b"FsIn");
    pub const OBJECT: Magic = Magic(*b"FsOb");
    pub const DIRECTORY_INFO: Magic = Magic(*b"FsDi");
    pub const FILE_END: Magic = Magic(*b"FsFe");
    pub const COMMENT: Magic = Magic(*b"FsCo");

    const KNOWN: [Magic; 9] = [
        Magic::VOLUME_HEADER,
        Magic::VOLUME_FOOTER,
        Magic::ARCHIVE_ROOT,
        Magic::BLOCK,
        Magic::FILESYSTEM_INFO,
        Magic::OBJECT,
        Magic::DIRECTORY_INFO,
        Magic::FILE_END,
        Magic::COMMENT,
    ];

    pub fn is_known(&self) -> bool {
        Self::KNOWN.contains(self)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for Magic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Magic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Magic({self})")
    }
}

// ── Dico keys ────────────────────────────────────────────────────────────────

/// Keys of the volume header and volume footer.
pub mod volume_keys {
    pub const VOLUME_NUMBER: u16 = 0x0001;
    pub const FORMAT_VERSION: u16 = 0x0002;
    pub const CREATED: u16 = 0x0003;
    pub const LAST_VOLUME: u16 = 0x0004;
}

/// Keys of the archive-root header.
pub mod root_keys {
    pub const ARCHIVE_ID: u16 = 0x0010;
    pub const LABEL: u16 = 0x0011;
    pub const SALT: u16 = 0x0012;
    pub const CREATED: u16 = 0x0013;
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown header magic {0}")]
    UnknownMagic(Magic),
    #[error("header belongs to archive {found:#010x}, expected {expected:#010x}")]
    ForeignArchive { expected: u32, found: u32 },
    #[error("corrupt header dictionary: {0}")]
    Dico(DicoError),
}

impl HeaderError {
    /// Minor errors leave the stream position trustworthy: the caller may
    /// count the failure and read the next header.
    pub fn is_minor(&self) -> bool {
        !matches!(self, HeaderError::Io(_))
    }
}

impl From<DicoError> for HeaderError {
    fn from(err: DicoError) -> Self {
        match err {
            DicoError::Io(e) => HeaderError::Io(e),
            other => HeaderError::Dico(other),
        }
    }
}

// ── HeaderRecord ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    pub magic: Magic,
    pub fsid: u16,
    pub dico: Dico,
}

impl HeaderRecord {
    pub fn new(magic: Magic, fsid: u16, dico: Dico) -> Self {
        Self { magic, fsid, dico }
    }

    pub fn global(magic: Magic, dico: Dico) -> Self {
        Self::new(magic, FSID_GLOBAL, dico)
    }

    pub fn is_global(&self) -> bool {
        self.fsid == FSID_GLOBAL
    }

    /// Archive-root header with a fresh key-derivation salt.
    pub fn archive_root(archive_id: u32, label: &str) -> Self {
        let mut dico = Dico::new();
        dico.put_u32(root_keys::ARCHIVE_ID, archive_id);
        dico.put_str(root_keys::LABEL, label);
        dico.put_bytes(root_keys::SALT, Uuid::new_v4().as_bytes());
        dico.put_u64(root_keys::CREATED, Utc::now().timestamp() as u64);
        Self::global(Magic::ARCHIVE_ROOT, dico)
    }

    pub fn volume_header(volume: u32) -> Self {
        let mut dico = Dico::new();
        dico.put_u32(volume_keys::VOLUME_NUMBER, volume);
        dico.put_u32(volume_keys::FORMAT_VERSION, FORMAT_VERSION);
        dico.put_u64(volume_keys::CREATED, Utc::now().timestamp() as u64);
        Self::global(Magic::VOLUME_HEADER, dico)
    }

    pub fn volume_footer(volume: u32, last: bool) -> Self {
        let mut dico = Dico::new();
        dico.put_u32(volume_keys::VOLUME_NUMBER, volume);
        dico.put_bool(volume_keys::LAST_VOLUME, last);
        Self::global(Magic::VOLUME_FOOTER, dico)
    }

    /// Bytes this header occupies once framed.
    pub fn frame_len(&self) -> usize {
        FRAME_PREFIX_LEN + self.dico.encoded_len()
    }
}

/// A decoded frame.
#[derive(Debug)]
pub struct Frame {
    pub archive_id: u32,
    pub header: HeaderRecord,
    /// Bytes skipped before the frame while resynchronising.
    pub skipped: u64,
}

/// Random 32-bit archive identifier.
pub fn new_archive_id() -> u32 {
    Uuid::new_v4().as_fields().0
}

// ── Frame codec ──────────────────────────────────────────────────────────────

pub fn write_frame<W: Write>(
    mut writer: W,
    archive_id: u32,
    header: &HeaderRecord,
) -> Result<u64, HeaderError> {
    writer.write_all(header.magic.as_bytes())?;
    writer.write_u32::<LittleEndian>(archive_id)?;
    writer.write_u16::<LittleEndian>(header.fsid)?;
    header.dico.write(&mut writer)?;
    Ok(header.frame_len() as u64)
}

/// Read one frame.
///
/// With `allow_seek`, bytes are skipped one at a time until a known magic
/// followed by the expected archive id shows up.  This is how the reader
/// finds its way back after a corrupt block.  Without it, an unknown magic or
/// a foreign archive id is reported as a minor error.
pub fn read_frame<R: Read>(
    mut reader: R,
    expected_archive_id: Option<u32>,
    allow_seek: bool,
) -> Result<Frame, HeaderError> {
    let mut window = [0u8; 8];
    reader.read_exact(&mut window)?;

    let matches = |w: &[u8; 8]| {
        let magic = Magic([w[0], w[1], w[2], w[3]]);
        let id = u32::from_le_bytes([w[4], w[5], w[6], w[7]]);
        magic.is_known() && expected_archive_id.map_or(true, |e| e == id)
    };

    let mut skipped = 0u64;
    if allow_seek {
        while !matches(&window) {
            window.copy_within(1.., 0);
            window[7] = reader.read_u8()?;
            skipped += 1;
        }
        if skipped > 0 {
            warn!("skipped {skipped} bytes to find the next valid header");
        }
    }

    let magic = Magic([window[0], window[1], window[2], window[3]]);
    let archive_id = u32::from_le_bytes([window[4], window[5], window[6], window[7]]);
    if !magic.is_known() {
        return Err(HeaderError::UnknownMagic(magic));
    }
    if let Some(expected) = expected_archive_id {
        if expected != archive_id {
            return Err(HeaderError::ForeignArchive { expected, found: archive_id });
        }
    }

    let fsid = reader.read_u16::<LittleEndian>()?;
    let dico = Dico::read(&mut reader)?;

    Ok(Frame {
        archive_id,
        header: HeaderRecord { magic, fsid, dico },
        skipped,
    })
}
