//! 8.3 directory entries: short-name encoding and the 32-byte on-disk form.

use rsp_error::{Result, RspError};
use rsp_types::{read_fixed, read_le_u16, read_le_u32};

pub const DIR_ENTRY_SIZE: usize = 32;

pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_LONG_NAME: u8 = 0x0F;

/// First name byte of a deleted entry.
pub const ENTRY_DELETED: u8 = 0xE5;
/// First name byte terminating a directory.
pub const ENTRY_END: u8 = 0x00;

const NAME_CHARS_EXTRA: &[u8] = b"!#$%&'()-@^_`{}~";

/// An 8.3 short name in its padded on-disk form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortName(pub [u8; 11]);

impl ShortName {
    /// Encode a `NAME.EXT` component, uppercasing letters.
    ///
    /// Long names are out of scope for this volume layer; anything that
    /// does not fit 8.3 is rejected.
    pub fn encode(component: &str) -> Result<Self> {
        if component.is_empty() || component == "." || component == ".." {
            return Err(RspError::Format(format!(
                "invalid file name component {component:?}"
            )));
        }

        let (base, ext) = match component.rsplit_once('.') {
            Some((base, ext)) if !base.is_empty() => (base, ext),
            Some(_) => {
                return Err(RspError::Format(format!(
                    "invalid file name component {component:?}"
                )));
            }
            None => (component, ""),
        };
        if base.len() > 8 || ext.len() > 3 {
            return Err(RspError::Format(format!(
                "name {component:?} does not fit 8.3"
            )));
        }

        let mut name = [b' '; 11];
        for (dst, ch) in name.iter_mut().zip(base.bytes()) {
            *dst = encode_char(ch, component)?;
        }
        for (dst, ch) in name[8..].iter_mut().zip(ext.bytes()) {
            *dst = encode_char(ch, component)?;
        }
        if name[0] == ENTRY_DELETED {
            // 0xE5 as a real first byte is stored as 0x05.
            name[0] = 0x05;
        }
        Ok(Self(name))
    }

    /// Render the padded form back to `NAME.EXT`.
    #[must_use]
    pub fn display(&self) -> String {
        let base = String::from_utf8_lossy(&self.0[..8]).trim_end().to_owned();
        let ext = String::from_utf8_lossy(&self.0[8..]).trim_end().to_owned();
        if ext.is_empty() { base } else { format!("{base}.{ext}") }
    }
}

fn encode_char(ch: u8, component: &str) -> Result<u8> {
    let up = ch.to_ascii_uppercase();
    if up.is_ascii_alphanumeric() || NAME_CHARS_EXTRA.contains(&up) || up >= 0x80 {
        Ok(up)
    } else {
        Err(RspError::Format(format!(
            "name {component:?} contains a character invalid on FAT"
        )))
    }
}

/// Decoded 32-byte directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDirEntry {
    pub name: ShortName,
    pub attr: u8,
    pub first_cluster: u32,
    pub size: u32,
}

impl RawDirEntry {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let name: [u8; 11] = read_fixed(bytes, 0)?;
        let hi = read_le_u16(bytes, 20)?;
        let lo = read_le_u16(bytes, 26)?;
        Ok(Self {
            name: ShortName(name),
            attr: bytes[11],
            first_cluster: u32::from(hi) << 16 | u32::from(lo),
            size: read_le_u32(bytes, 28)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut bytes = [0_u8; DIR_ENTRY_SIZE];
        bytes[..11].copy_from_slice(&self.name.0);
        bytes[11] = self.attr;
        bytes[20..22].copy_from_slice(&((self.first_cluster >> 16) as u16).to_le_bytes());
        bytes[26..28].copy_from_slice(&(self.first_cluster as u16).to_le_bytes());
        bytes[28..32].copy_from_slice(&self.size.to_le_bytes());
        bytes
    }

    #[must_use]
    pub fn is_end(&self) -> bool {
        self.name.0[0] == ENTRY_END
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.name.0[0] == ENTRY_DELETED
    }

    #[must_use]
    pub fn is_long_name(&self) -> bool {
        self.attr & ATTR_LONG_NAME == ATTR_LONG_NAME
    }

    #[must_use]
    pub fn is_volume_label(&self) -> bool {
        !self.is_long_name() && self.attr & ATTR_VOLUME_ID != 0
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }
}
