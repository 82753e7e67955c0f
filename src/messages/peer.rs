//! Peer-channel message catalog (wide, 4-byte codes).

use std::collections::HashMap;

use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::codec::{compress, CodeWidth, MessageBuilder, MessageFrame, MessageReader};
use crate::error::SlskResult;
use crate::messages::common::{Directory, FileEntry, TransferDirection};

/// A peer-channel message: fixed `CODE`, payload encode/decode, and default
/// `to_bytes`/`from_frame` built on top of them.
pub trait PeerPayload: Sized {
    const CODE: u32;

    fn encode_payload(&self, builder: &mut MessageBuilder);
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self>;

    fn to_bytes(&self) -> Bytes {
        let mut builder = MessageBuilder::new();
        self.encode_payload(&mut builder);
        builder.finish(CodeWidth::Wide, Self::CODE)
    }

    fn from_frame(frame: &MessageFrame) -> SlskResult<Self> {
        if frame.code != Self::CODE {
            return Err(crate::error::SlskError::UnexpectedMessageCode {
                expected: Self::CODE,
                found: frame.code,
            });
        }
        let mut reader = MessageReader::new(frame.payload.clone());
        Self::decode_payload(&mut reader)
    }
}

macro_rules! peer_codes {
    ($($name:ident = $code:expr),* $(,)?) => {
        $(pub const $name: u32 = $code;)*
    };
}

peer_codes! {
    BROWSE_REQUEST = 4,
    BROWSE_RESPONSE = 5,
    INFO_REQUEST = 15,
    INFO_RESPONSE = 16,
    FOLDER_CONTENTS_REQUEST = 36,
    FOLDER_CONTENTS_RESPONSE = 37,
    TRANSFER_REQUEST = 40,
    TRANSFER_RESPONSE = 41,
    QUEUE_DOWNLOAD = 43,
    PLACE_IN_QUEUE_RESPONSE = 44,
    UPLOAD_FAILED = 46,
    QUEUE_FAILED = 50,
    PLACE_IN_QUEUE_REQUEST = 51,
    SEARCH_RESPONSE = 9,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BrowseRequest;

impl PeerPayload for BrowseRequest {
    const CODE: u32 = BROWSE_REQUEST;
    fn encode_payload(&self, _builder: &mut MessageBuilder) {}
    fn decode_payload(_reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(BrowseRequest)
    }
}

/// The full share listing. Compressed on the wire: callers must
/// `reader.decompress()` before `decode_payload`, and the inverse on write.
#[derive(Debug, Clone)]
pub struct BrowseResponse {
    pub directories: Vec<Directory>,
}

impl BrowseResponse {
    pub fn to_bytes(&self) -> Bytes {
        let mut inner = MessageBuilder::new();
        inner.write_u32(self.directories.len() as u32);
        for dir in &self.directories {
            dir.encode(&mut inner);
        }
        let compressed = compress(&inner.into_payload());
        let mut outer = MessageBuilder::new();
        outer.write_bytes(&compressed);
        outer.finish(CodeWidth::Wide, BROWSE_RESPONSE)
    }

    pub fn from_frame(frame: &MessageFrame) -> SlskResult<Self> {
        if frame.code != BROWSE_RESPONSE {
            return Err(crate::error::SlskError::UnexpectedMessageCode {
                expected: BROWSE_RESPONSE,
                found: frame.code,
            });
        }
        let mut reader = MessageReader::new(frame.payload.clone());
        reader.decompress()?;
        let count = reader.read_u32()? as usize;
        let mut directories = Vec::with_capacity(count);
        for _ in 0..count {
            directories.push(Directory::decode(&mut reader)?);
        }
        Ok(Self { directories })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InfoRequest;

impl PeerPayload for InfoRequest {
    const CODE: u32 = INFO_REQUEST;
    fn encode_payload(&self, _builder: &mut MessageBuilder) {}
    fn decode_payload(_reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(InfoRequest)
    }
}

#[derive(Debug, Clone)]
pub struct InfoResponse {
    pub description: String,
    pub picture: Option<Vec<u8>>,
    pub upload_slots: u32,
    pub queue_size: u32,
    pub has_free_upload_slot: bool,
}

impl PeerPayload for InfoResponse {
    const CODE: u32 = INFO_RESPONSE;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.description);
        match &self.picture {
            Some(bytes) => {
                builder.write_bool(true);
                builder.write_u32(bytes.len() as u32);
                builder.write_bytes(bytes);
            }
            None => {
                builder.write_bool(false);
            }
        }
        builder
            .write_u32(self.upload_slots)
            .write_u32(self.queue_size)
            .write_bool(self.has_free_upload_slot);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        let description = reader.read_string()?;
        let has_picture = reader.read_bool()?;
        let picture = if has_picture {
            let len = reader.read_u32()? as usize;
            Some(reader.read_bytes(len)?)
        } else {
            None
        };
        Ok(Self {
            description,
            picture,
            upload_slots: reader.read_u32()?,
            queue_size: reader.read_u32()?,
            has_free_upload_slot: reader.read_bool()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FolderContentsRequest {
    pub token: u32,
    pub folder: String,
}

impl PeerPayload for FolderContentsRequest {
    const CODE: u32 = FOLDER_CONTENTS_REQUEST;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.token).write_string(&self.folder);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            token: reader.read_u32()?,
            folder: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FolderContentsResponse {
    pub token: u32,
    pub folder: String,
    pub files: Vec<FileEntry>,
}

impl PeerPayload for FolderContentsResponse {
    const CODE: u32 = FOLDER_CONTENTS_RESPONSE;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.token).write_string(&self.folder);
        builder.write_u32(self.files.len() as u32);
        for file in &self.files {
            file.encode(builder);
        }
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        let token = reader.read_u32()?;
        let folder = reader.read_string()?;
        let count = reader.read_u32()? as usize;
        let mut files = Vec::with_capacity(count);
        for _ in 0..count {
            files.push(FileEntry::decode(reader)?);
        }
        Ok(Self { token, folder, files })
    }
}

/// `TransferRequest`: offered in either direction during negotiation (see
/// the download/upload state machines).
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub token: u32,
    pub filename: String,
    pub size: Option<u64>,
}

impl PeerPayload for TransferRequest {
    const CODE: u32 = TRANSFER_REQUEST;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder
            .write_u32(self.direction.to_code())
            .write_u32(self.token)
            .write_string(&self.filename);
        if let Some(size) = self.size {
            builder.write_u64(size);
        }
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        let direction = TransferDirection::from_code(reader.read_u32()?);
        let token = reader.read_u32()?;
        let filename = reader.read_string()?;
        let size = if matches!(direction, TransferDirection::Upload) && reader.remaining() >= 8 {
            Some(reader.read_u64()?)
        } else {
            None
        };
        Ok(Self {
            direction,
            token,
            filename,
            size,
        })
    }
}

/// A reply to a `TransferRequest`. When `allowed` is `true` and the request
/// was for a download, `size` carries the file's length so the downloader
/// doesn't need a separate round trip before starting the byte pump. When
/// `allowed` is `false`, `message` carries the reason (e.g. queue
/// position).
#[derive(Debug, Clone)]
pub struct TransferResponse {
    pub token: u32,
    pub allowed: bool,
    pub size: Option<u64>,
    pub message: Option<String>,
}

impl PeerPayload for TransferResponse {
    const CODE: u32 = TRANSFER_RESPONSE;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.token).write_bool(self.allowed);
        if self.allowed {
            if let Some(size) = self.size {
                builder.write_u64(size);
            }
        } else if let Some(message) = &self.message {
            builder.write_string(message);
        }
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        let token = reader.read_u32()?;
        let allowed = reader.read_bool()?;
        let size = if allowed && reader.remaining() >= 8 {
            Some(reader.read_u64()?)
        } else {
            None
        };
        let message = if !allowed && reader.remaining() > 0 {
            Some(reader.read_string()?)
        } else {
            None
        };
        Ok(Self {
            token,
            allowed,
            size,
            message,
        })
    }
}

#[derive(Debug, Clone)]
pub struct QueueDownload {
    pub filename: String,
}

impl PeerPayload for QueueDownload {
    const CODE: u32 = QUEUE_DOWNLOAD;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.filename);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            filename: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UploadFailed {
    pub filename: String,
}

impl PeerPayload for UploadFailed {
    const CODE: u32 = UPLOAD_FAILED;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.filename);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            filename: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct QueueFailed {
    pub filename: String,
    pub message: String,
}

impl PeerPayload for QueueFailed {
    const CODE: u32 = QUEUE_FAILED;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.filename).write_string(&self.message);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            filename: reader.read_string()?,
            message: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PlaceInQueueRequest {
    pub filename: String,
}

impl PeerPayload for PlaceInQueueRequest {
    const CODE: u32 = PLACE_IN_QUEUE_REQUEST;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.filename);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            filename: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PlaceInQueueResponse {
    pub filename: String,
    pub place: u32,
}

impl PeerPayload for PlaceInQueueResponse {
    const CODE: u32 = PLACE_IN_QUEUE_RESPONSE;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.filename).write_u32(self.place);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            filename: reader.read_string()?,
            place: reader.read_u32()?,
        })
    }
}

/// A search response from one peer, as produced by the search engine's
/// filtering pipeline and also by the host's `search_response_resolver`.
/// Compressed on the wire, like [`BrowseResponse`].
#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub username: String,
    pub token: u32,
    pub files: Vec<FileEntry>,
    pub free_upload_slots: u8,
    pub upload_speed: u32,
    pub queue_length: u64,
}

impl SearchResponse {
    pub fn to_bytes(&self) -> Bytes {
        let mut inner = MessageBuilder::new();
        inner
            .write_string(&self.username)
            .write_u32(self.token)
            .write_u32(self.files.len() as u32);
        for file in &self.files {
            file.encode(&mut inner);
        }
        inner
            .write_u8(self.free_upload_slots)
            .write_u32(self.upload_speed)
            .write_u64(self.queue_length);
        let compressed = compress(&inner.into_payload());
        let mut outer = MessageBuilder::new();
        outer.write_bytes(&compressed);
        outer.finish(CodeWidth::Wide, SEARCH_RESPONSE)
    }

    pub fn from_frame(frame: &MessageFrame) -> SlskResult<Self> {
        if frame.code != SEARCH_RESPONSE {
            return Err(crate::error::SlskError::UnexpectedMessageCode {
                expected: SEARCH_RESPONSE,
                found: frame.code,
            });
        }
        let mut reader = MessageReader::new(frame.payload.clone());
        reader.decompress()?;
        let username = reader.read_string()?;
        let token = reader.read_u32()?;
        let file_count = reader.read_u32()? as usize;
        let mut files = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            files.push(FileEntry::decode(&mut reader)?);
        }
        let free_upload_slots = reader.read_u8()?;
        let upload_speed = reader.read_u32()?;
        let queue_length = reader.read_u64()?;
        Ok(Self {
            username,
            token,
            files,
            free_upload_slots,
            upload_speed,
            queue_length,
        })
    }
}

/// Decoded, tagged peer-channel messages a handler needs to act on.
#[derive(Debug, Clone)]
pub enum PeerMessage {
    BrowseRequest(BrowseRequest),
    BrowseResponse(BrowseResponse),
    SearchResponse(SearchResponse),
    InfoRequest(InfoRequest),
    InfoResponse(InfoResponse),
    FolderContentsRequest(FolderContentsRequest),
    FolderContentsResponse(FolderContentsResponse),
    TransferRequest(TransferRequest),
    TransferResponse(TransferResponse),
    QueueDownload(QueueDownload),
    UploadFailed(UploadFailed),
    QueueFailed(QueueFailed),
    PlaceInQueueRequest(PlaceInQueueRequest),
    PlaceInQueueResponse(PlaceInQueueResponse),
}

type PeerDecoder = fn(&MessageFrame) -> SlskResult<PeerMessage>;

static PEER_DISPATCH: Lazy<HashMap<u32, PeerDecoder>> = Lazy::new(|| {
    let mut table: HashMap<u32, PeerDecoder> = HashMap::new();
    table.insert(BROWSE_REQUEST, |f| BrowseRequest::from_frame(f).map(PeerMessage::BrowseRequest));
    table.insert(BROWSE_RESPONSE, |f| BrowseResponse::from_frame(f).map(PeerMessage::BrowseResponse));
    table.insert(SEARCH_RESPONSE, |f| SearchResponse::from_frame(f).map(PeerMessage::SearchResponse));
    table.insert(INFO_REQUEST, |f| InfoRequest::from_frame(f).map(PeerMessage::InfoRequest));
    table.insert(INFO_RESPONSE, |f| InfoResponse::from_frame(f).map(PeerMessage::InfoResponse));
    table.insert(FOLDER_CONTENTS_REQUEST, |f| {
        FolderContentsRequest::from_frame(f).map(PeerMessage::FolderContentsRequest)
    });
    table.insert(FOLDER_CONTENTS_RESPONSE, |f| {
        FolderContentsResponse::from_frame(f).map(PeerMessage::FolderContentsResponse)
    });
    table.insert(TRANSFER_REQUEST, |f| TransferRequest::from_frame(f).map(PeerMessage::TransferRequest));
    table.insert(TRANSFER_RESPONSE, |f| TransferResponse::from_frame(f).map(PeerMessage::TransferResponse));
    table.insert(QUEUE_DOWNLOAD, |f| QueueDownload::from_frame(f).map(PeerMessage::QueueDownload));
    table.insert(UPLOAD_FAILED, |f| UploadFailed::from_frame(f).map(PeerMessage::UploadFailed));
    table.insert(QUEUE_FAILED, |f| QueueFailed::from_frame(f).map(PeerMessage::QueueFailed));
    table.insert(PLACE_IN_QUEUE_REQUEST, |f| {
        PlaceInQueueRequest::from_frame(f).map(PeerMessage::PlaceInQueueRequest)
    });
    table.insert(PLACE_IN_QUEUE_RESPONSE, |f| {
        PlaceInQueueResponse::from_frame(f).map(PeerMessage::PlaceInQueueResponse)
    });
    table
});

impl PeerMessage {
    pub fn decode(frame: &MessageFrame) -> SlskResult<Option<Self>> {
        match PEER_DISPATCH.get(&frame.code) {
            Some(decoder) => decoder(frame).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file(name: &str, bitrate: u32) -> FileEntry {
        FileEntry {
            name: name.into(),
            size: 1024,
            extension: "mp3".into(),
            attributes: vec![(0, bitrate)],
        }
    }

    #[test]
    fn search_response_round_trips_through_compression() {
        let response = SearchResponse {
            username: "u2".into(),
            token: 1001,
            files: vec![sample_file("song.mp3", 256)],
            free_upload_slots: 2,
            upload_speed: 50_000,
            queue_length: 0,
        };
        let bytes = response.to_bytes();
        let (frame, _) = crate::codec::try_decode_frame(&bytes, CodeWidth::Wide)
            .unwrap()
            .unwrap();
        let decoded = SearchResponse::from_frame(&frame).unwrap();
        assert_eq!(decoded.username, "u2");
        assert_eq!(decoded.files.len(), 1);
        assert_eq!(decoded.files[0].bitrate(), Some(256));
    }

    #[test]
    fn transfer_request_omits_size_for_downloads() {
        let request = TransferRequest {
            direction: TransferDirection::Download,
            token: 9,
            filename: "/music/song.mp3".into(),
            size: None,
        };
        let bytes = request.to_bytes();
        let (frame, _) = crate::codec::try_decode_frame(&bytes, CodeWidth::Wide)
            .unwrap()
            .unwrap();
        let decoded = TransferRequest::from_frame(&frame).unwrap();
        assert_eq!(decoded.size, None);
        assert!(matches!(decoded.direction, TransferDirection::Download));
    }

    #[test]
    fn transfer_request_carries_size_for_uploads() {
        let request = TransferRequest {
            direction: TransferDirection::Upload,
            token: 88,
            filename: "/music/song.mp3".into(),
            size: Some(4_194_304),
        };
        let bytes = request.to_bytes();
        let (frame, _) = crate::codec::try_decode_frame(&bytes, CodeWidth::Wide)
            .unwrap()
            .unwrap();
        let decoded = TransferRequest::from_frame(&frame).unwrap();
        assert_eq!(decoded.size, Some(4_194_304));
    }
}
