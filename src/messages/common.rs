//! Types shared across the server, peer, and distributed message catalogs.

use crate::codec::{MessageBuilder, MessageReader};
use crate::error::SlskResult;

/// A user's online status, as tracked by the server-derived caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Offline,
    Away,
    Online,
}

impl UserStatus {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => UserStatus::Away,
            2 => UserStatus::Online,
            _ => UserStatus::Offline,
        }
    }

    pub fn to_code(self) -> u32 {
        match self {
            UserStatus::Offline => 0,
            UserStatus::Away => 1,
            UserStatus::Online => 2,
        }
    }
}

/// Which direction a transfer negotiation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Download,
    Upload,
}

impl TransferDirection {
    pub fn from_code(code: u32) -> Self {
        if code == 1 {
            TransferDirection::Upload
        } else {
            TransferDirection::Download
        }
    }

    pub fn to_code(self) -> u32 {
        match self {
            TransferDirection::Download => 0,
            TransferDirection::Upload => 1,
        }
    }
}

/// How a connection-establishment attempt should present itself: a peer
/// message connection (`"P"`), a file transfer connection (`"F"`), or a
/// distributed connection (`"D"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionType {
    Message,
    Transfer,
    Distributed,
}

impl PeerConnectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerConnectionType::Message => "P",
            PeerConnectionType::Transfer => "F",
            PeerConnectionType::Distributed => "D",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "P" => Some(PeerConnectionType::Message),
            "F" => Some(PeerConnectionType::Transfer),
            "D" => Some(PeerConnectionType::Distributed),
            _ => None,
        }
    }
}

/// A single shared file, as carried in browse and search responses.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub extension: String,
    /// `(attribute_code, value)`: bitrate, duration, sample rate, bit depth,
    /// VBR flag, depending on `attribute_code`.
    pub attributes: Vec<(u32, u32)>,
}

impl FileEntry {
    pub fn encode(&self, builder: &mut MessageBuilder) {
        builder.write_u8(1); // code: always a file entry, not a directory marker
        builder.write_string(&self.name);
        builder.write_u64(self.size);
        builder.write_string(&self.extension);
        builder.write_u32(self.attributes.len() as u32);
        for (kind, value) in &self.attributes {
            builder.write_u32(*kind);
            builder.write_u32(*value);
        }
    }

    pub fn decode(reader: &mut MessageReader) -> SlskResult<Self> {
        let _marker = reader.read_u8()?;
        let name = reader.read_string()?;
        let size = reader.read_u64()?;
        let extension = reader.read_string()?;
        let attribute_count = reader.read_u32()? as usize;
        let mut attributes = Vec::with_capacity(attribute_count);
        for _ in 0..attribute_count {
            let kind = reader.read_u32()?;
            let value = reader.read_u32()?;
            attributes.push((kind, value));
        }
        Ok(Self {
            name,
            size,
            extension,
            attributes,
        })
    }

    pub fn bitrate(&self) -> Option<u32> {
        self.attributes.iter().find(|(k, _)| *k == 0).map(|(_, v)| *v)
    }

    pub fn duration_seconds(&self) -> Option<u32> {
        self.attributes.iter().find(|(k, _)| *k == 1).map(|(_, v)| *v)
    }

    pub fn is_vbr(&self) -> bool {
        self.attributes.iter().any(|(k, v)| *k == 2 && *v == 1)
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.attributes.iter().find(|(k, _)| *k == 4).map(|(_, v)| *v)
    }

    pub fn bit_depth(&self) -> Option<u32> {
        self.attributes.iter().find(|(k, _)| *k == 5).map(|(_, v)| *v)
    }
}

/// A shared directory, as carried in a browse response.
#[derive(Debug, Clone, PartialEq)]
pub struct Directory {
    pub name: String,
    pub files: Vec<FileEntry>,
}

impl Directory {
    pub fn encode(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.name);
        builder.write_u32(self.files.len() as u32);
        for file in &self.files {
            file.encode(builder);
        }
    }

    pub fn decode(reader: &mut MessageReader) -> SlskResult<Self> {
        let name = reader.read_string()?;
        let count = reader.read_u32()? as usize;
        let mut files = Vec::with_capacity(count);
        for _ in 0..count {
            files.push(FileEntry::decode(reader)?);
        }
        Ok(Self { name, files })
    }
}

/// One entry in the server's room list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomEntry {
    pub name: String,
    pub user_count: u32,
}
