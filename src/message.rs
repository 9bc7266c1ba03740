//! Protocol messages and the code -> decoder registry.
//!
//! A serialized body is the two-character type code followed by the
//! message's fields. Decoding looks the code up in a [`MessageRegistry`]
//! built once at startup and handed to every connection.

use crate::buffer::{CodecError, WireBuffer};
use crate::config::BackupType;
use crate::error::{SyncError, SyncResult};
use crate::file_info::FileInfo;
use crate::protocol::code;
use crate::tracker::LogEntry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Compile-time tag of a concrete message struct.
pub trait Tagged {
    const TYPE: MessageType;
}

/// Body serialization for one concrete message.
pub trait WireMessage: Tagged + Into<Message> + Sized {
    fn encode_body(&self, buf: &mut WireBuffer);
    fn decode_body(buf: &mut WireBuffer) -> Result<Self, CodecError>;
}

macro_rules! messages {
    ($($variant:ident => $code:ident),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum MessageType {
            $($variant),*
        }

        impl MessageType {
            pub const ALL: &'static [MessageType] = &[$(MessageType::$variant),*];

            pub fn code(self) -> [u8; 2] {
                match self {
                    $(MessageType::$variant => code::$code),*
                }
            }
        }

        #[derive(Debug, Clone)]
        pub enum Message {
            $($variant($variant)),*
        }

        impl Message {
            pub fn message_type(&self) -> MessageType {
                match self {
                    $(Message::$variant(_) => MessageType::$variant),*
                }
            }

            fn encode_body(&self, buf: &mut WireBuffer) {
                match self {
                    $(Message::$variant(m) => m.encode_body(buf)),*
                }
            }
        }

        $(
            impl Tagged for $variant {
                const TYPE: MessageType = MessageType::$variant;
            }

            impl From<$variant> for Message {
                fn from(m: $variant) -> Self {
                    Message::$variant(m)
                }
            }

            impl TryFrom<Message> for $variant {
                type Error = Message;
                fn try_from(m: Message) -> Result<Self, Message> {
                    match m {
                        Message::$variant(inner) => Ok(inner),
                        other => Err(other),
                    }
                }
            }
        )*

        impl MessageRegistry {
            /// Registry holding every message this protocol version knows.
            pub fn standard() -> SyncResult<Self> {
                let mut builder = RegistryBuilder::default();
                $(builder.register::<$variant>()?;)*
                Ok(builder.build())
            }
        }
    };
}

messages! {
    Connect => CONNECT,
    ConnectResponse => CONNECT_RESPONSE,
    FileList => FILE_LIST,
    FileListResponse => FILE_LIST_RESPONSE,
    FileDescriptor => FILE_DESCRIPTOR,
    FileDescriptorAck => FILE_DESCRIPTOR_ACK,
    FileData => FILE_DATA,
    FileDataAck => FILE_DATA_ACK,
    FileEnd => FILE_END,
    FileEndAck => FILE_END_ACK,
    SyncEnd => SYNC_END,
    SyncEndAck => SYNC_END_ACK,
    ErrorMessage => ERROR,
    StartRestore => START_RESTORE,
    StartRestoreAck => START_RESTORE_ACK,
    KeepAlive => KEEP_ALIVE,
    FileSync => FILE_SYNC,
    FileSyncAck => FILE_SYNC_ACK,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.code();
        write!(f, "{:?}({}{})", self, c[0] as char, c[1] as char)
    }
}

impl Message {
    /// Type code followed by the body fields.
    pub fn to_body(&self) -> Vec<u8> {
        let mut buf = WireBuffer::with_capacity(64);
        buf.put_raw(&self.message_type().code());
        self.encode_body(&mut buf);
        buf.into_bytes()
    }
}

type DecodeFn = fn(&mut WireBuffer) -> Result<Message, CodecError>;

fn decode_as<T: WireMessage>(buf: &mut WireBuffer) -> Result<Message, CodecError> {
    T::decode_body(buf).map(Into::into)
}

#[derive(Default)]
pub struct RegistryBuilder {
    table: HashMap<[u8; 2], (MessageType, DecodeFn)>,
}

impl RegistryBuilder {
    pub fn register<T: WireMessage>(&mut self) -> SyncResult<&mut Self> {
        let code = T::TYPE.code();
        if let Some((existing, _)) = self.table.get(&code) {
            return Err(SyncError::Protocol(format!(
                "message code {}{} registered twice ({} and {})",
                code[0] as char,
                code[1] as char,
                existing,
                T::TYPE
            )));
        }
        self.table.insert(code, (T::TYPE, decode_as::<T>));
        Ok(self)
    }

    pub fn build(self) -> MessageRegistry {
        MessageRegistry { table: self.table }
    }
}

/// Immutable code -> decoder table.
pub struct MessageRegistry {
    table: HashMap<[u8; 2], (MessageType, DecodeFn)>,
}

impl MessageRegistry {
    pub fn message_type(&self, code: [u8; 2]) -> SyncResult<MessageType> {
        self.table
            .get(&code)
            .map(|(t, _)| *t)
            .ok_or(SyncError::UnknownMessageType(code))
    }

    /// Decode a full body. Trailing bytes are an error.
    pub fn decode(&self, body: Vec<u8>) -> SyncResult<Message> {
        let mut buf = WireBuffer::from_bytes(body);
        let code = buf.get_raw::<2>()?;
        let (_, decode) = self
            .table
            .get(&code)
            .ok_or(SyncError::UnknownMessageType(code))?;
        let msg = decode(&mut buf)?;
        buf.finish()?;
        Ok(msg)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

// ---- handshake ----

#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub username: String,
    pub password: String,
    pub folder: String,
    pub max_packet_size: u32,
    pub max_connections: u32,
    pub dry_run: bool,
    pub host_name: String,
    pub ignore_hidden: bool,
    pub ignore_system: bool,
    pub ignored_patterns: Vec<String>,
}

impl WireMessage for Connect {
    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.put_str(&self.username);
        buf.put_str(&self.password);
        buf.put_str(&self.folder);
        buf.put_u32(self.max_packet_size);
        buf.put_u32(self.max_connections);
        buf.put_bool(self.dry_run);
        buf.put_str(&self.host_name);
        buf.put_bool(self.ignore_hidden);
        buf.put_bool(self.ignore_system);
        buf.put_strings(&self.ignored_patterns);
    }

    fn decode_body(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            username: buf.get_str()?,
            password: buf.get_str()?,
            folder: buf.get_str()?,
            max_packet_size: buf.get_u32()?,
            max_connections: buf.get_u32()?,
            dry_run: buf.get_bool()?,
            host_name: buf.get_str()?,
            ignore_hidden: buf.get_bool()?,
            ignore_system: buf.get_bool()?,
            ignored_patterns: buf.get_strings()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectResponse {
    pub accepted: bool,
    pub reason: String,
    pub session_id: Uuid,
    pub max_packet_size: u32,
    pub max_connections: u32,
    pub backup_type: BackupType,
    pub ignore_hidden: bool,
    pub ignore_system: bool,
    pub ignored_patterns: Vec<String>,
}

impl ConnectResponse {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: reason.into(),
            session_id: Uuid::nil(),
            max_packet_size: 0,
            max_connections: 0,
            backup_type: BackupType::Preserve,
            ignore_hidden: false,
            ignore_system: false,
            ignored_patterns: Vec::new(),
        }
    }
}

impl WireMessage for ConnectResponse {
    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.put_bool(self.accepted);
        buf.put_str(&self.reason);
        buf.put_uuid(&self.session_id);
        buf.put_u32(self.max_packet_size);
        buf.put_u32(self.max_connections);
        buf.put_enum(&self.backup_type);
        buf.put_bool(self.ignore_hidden);
        buf.put_bool(self.ignore_system);
        buf.put_strings(&self.ignored_patterns);
    }

    fn decode_body(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            accepted: buf.get_bool()?,
            reason: buf.get_str()?,
            session_id: buf.get_uuid()?,
            max_packet_size: buf.get_u32()?,
            max_connections: buf.get_u32()?,
            backup_type: buf.get_enum()?,
            ignore_hidden: buf.get_bool()?,
            ignore_system: buf.get_bool()?,
            ignored_patterns: buf.get_strings()?,
        })
    }
}

// ---- file lists ----

#[derive(Debug, Clone, PartialEq)]
pub struct FileList {
    pub files: Vec<FileInfo>,
    pub is_backup: bool,
}

impl WireMessage for FileList {
    fn encode_body(&self, buf: &mut WireBuffer) {
        FileInfo::encode_list(&self.files, buf);
        buf.put_bool(self.is_backup);
    }

    fn decode_body(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            files: FileInfo::decode_list(buf)?,
            is_backup: buf.get_bool()?,
        })
    }
}

/// Diff result. For two-way sync, the first response lists what the
/// initiator pushes and deletes; the second lists what it pulls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileListResponse {
    pub files_to_transfer: Vec<FileInfo>,
    pub files_to_delete: Vec<String>,
    pub conflicts: Vec<String>,
    pub is_backup: bool,
}

impl WireMessage for FileListResponse {
    fn encode_body(&self, buf: &mut WireBuffer) {
        FileInfo::encode_list(&self.files_to_transfer, buf);
        buf.put_strings(&self.files_to_delete);
        buf.put_strings(&self.conflicts);
        buf.put_bool(self.is_backup);
    }

    fn decode_body(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            files_to_transfer: FileInfo::decode_list(buf)?,
            files_to_delete: buf.get_strings()?,
            conflicts: buf.get_strings()?,
            is_backup: buf.get_bool()?,
        })
    }
}

// ---- per-file cycle ----

#[derive(Debug, Clone, PartialEq)]
pub struct FileDescriptor {
    pub file: FileInfo,
}

impl WireMessage for FileDescriptor {
    fn encode_body(&self, buf: &mut WireBuffer) {
        self.file.encode(buf);
    }

    fn decode_body(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            file: FileInfo::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileDescriptorAck {
    pub relative_path: String,
    pub ready: bool,
    pub reason: String,
}

impl FileDescriptorAck {
    pub fn ready(relative_path: &str) -> Self {
        Self {
            relative_path: relative_path.to_string(),
            ready: true,
            reason: String::new(),
        }
    }

    pub fn not_ready(relative_path: &str, reason: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.to_string(),
            ready: false,
            reason: reason.into(),
        }
    }
}

impl WireMessage for FileDescriptorAck {
    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.put_str(&self.relative_path);
        buf.put_bool(self.ready);
        buf.put_str(&self.reason);
    }

    fn decode_body(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            relative_path: buf.get_str()?,
            ready: buf.get_bool()?,
            reason: buf.get_str()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileData {
    pub relative_path: String,
    pub block_index: u32,
    pub total_blocks: u32,
    pub data: Vec<u8>,
}

impl WireMessage for FileData {
    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.put_str(&self.relative_path);
        buf.put_u32(self.block_index);
        buf.put_u32(self.total_blocks);
        buf.put_bytes(&self.data);
    }

    fn decode_body(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            relative_path: buf.get_str()?,
            block_index: buf.get_u32()?,
            total_blocks: buf.get_u32()?,
            data: buf.get_bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileDataAck {
    pub relative_path: String,
    pub block_index: u32,
}

impl WireMessage for FileDataAck {
    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.put_str(&self.relative_path);
        buf.put_u32(self.block_index);
    }

    fn decode_body(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            relative_path: buf.get_str()?,
            block_index: buf.get_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileEnd {
    pub relative_path: String,
    pub file: FileInfo,
}

impl WireMessage for FileEnd {
    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.put_str(&self.relative_path);
        self.file.encode(buf);
    }

    fn decode_body(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            relative_path: buf.get_str()?,
            file: FileInfo::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileEndAck {
    pub relative_path: String,
    pub success: bool,
    pub reason: String,
}

impl FileEndAck {
    pub fn success(relative_path: &str) -> Self {
        Self {
            relative_path: relative_path.to_string(),
            success: true,
            reason: String::new(),
        }
    }

    pub fn failure(relative_path: &str, reason: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.to_string(),
            success: false,
            reason: reason.into(),
        }
    }
}

impl WireMessage for FileEndAck {
    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.put_str(&self.relative_path);
        buf.put_bool(self.success);
        buf.put_str(&self.reason);
    }

    fn decode_body(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            relative_path: buf.get_str()?,
            success: buf.get_bool()?,
            reason: buf.get_str()?,
        })
    }
}

// ---- session control ----

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncEnd;

impl WireMessage for SyncEnd {
    fn encode_body(&self, _buf: &mut WireBuffer) {}

    fn decode_body(_buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncEndAck {
    pub success: bool,
    pub reason: String,
}

impl WireMessage for SyncEndAck {
    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.put_bool(self.success);
        buf.put_str(&self.reason);
    }

    fn decode_body(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            success: buf.get_bool()?,
            reason: buf.get_str()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
    pub details: String,
}

impl ErrorMessage {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: String::new(),
        }
    }
}

impl WireMessage for ErrorMessage {
    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.put_str(&self.code);
        buf.put_str(&self.message);
        buf.put_str(&self.details);
    }

    fn decode_body(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            code: buf.get_str()?,
            message: buf.get_str()?,
            details: buf.get_str()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartRestore;

impl WireMessage for StartRestore {
    fn encode_body(&self, _buf: &mut WireBuffer) {}

    fn decode_body(_buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartRestoreAck;

impl WireMessage for StartRestoreAck {
    fn encode_body(&self, _buf: &mut WireBuffer) {}

    fn decode_body(_buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeepAlive;

impl WireMessage for KeepAlive {
    fn encode_body(&self, _buf: &mut WireBuffer) {}

    fn decode_body(_buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self)
    }
}

// ---- two-way sync ----

#[derive(Debug, Clone, PartialEq)]
pub struct FileSync {
    pub changes: Vec<LogEntry>,
    pub last_update: Option<DateTime<Utc>>,
}

impl WireMessage for FileSync {
    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.put_u32(self.changes.len() as u32);
        for entry in &self.changes {
            entry.encode(buf);
        }
        buf.put_bool(self.last_update.is_some());
        if let Some(t) = &self.last_update {
            buf.put_time(t);
        }
    }

    fn decode_body(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        let count = buf.get_u32()? as usize;
        if count > buf.remaining() {
            return Err(CodecError::LengthOverrun(count));
        }
        let changes = (0..count)
            .map(|_| LogEntry::decode(buf))
            .collect::<Result<Vec<_>, _>>()?;
        let last_update = if buf.get_bool()? {
            Some(buf.get_time()?)
        } else {
            None
        };
        Ok(Self {
            changes,
            last_update,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileSyncAck;

impl WireMessage for FileSyncAck {
    fn encode_body(&self, _buf: &mut WireBuffer) {}

    fn decode_body(_buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_info::attr;
    use crate::tracker::Operation;
    use chrono::TimeZone;

    fn registry() -> MessageRegistry {
        MessageRegistry::standard().unwrap()
    }

    fn file(rel: &str) -> FileInfo {
        FileInfo {
            path: None,
            relative_path: rel.to_string(),
            size: 42,
            creation_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            modification_time: Utc.timestamp_opt(1_700_000_100, 0).unwrap(),
            is_directory: false,
            extended_attributes: 0o600,
        }
    }

    fn folder(rel: &str) -> FileInfo {
        FileInfo {
            path: None,
            relative_path: rel.to_string(),
            size: 0,
            creation_time: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
            modification_time: Utc.timestamp_opt(1_650_000_000, 0).unwrap(),
            is_directory: true,
            extended_attributes: attr::DIRECTORY | attr::HIDDEN | 0o755,
        }
    }

    fn back(msg: Message) -> Message {
        registry().decode(msg.to_body()).unwrap()
    }

    /// `FileInfo` equality is by path only, so compare what travels.
    fn assert_same_files(got: &[FileInfo], want: &[FileInfo]) {
        assert_eq!(got.len(), want.len());
        for (g, w) in got.iter().zip(want) {
            assert_eq!(g.relative_path, w.relative_path);
            assert_eq!(g.size, w.size, "{}", w.relative_path);
            assert_eq!(g.creation_time, w.creation_time, "{}", w.relative_path);
            assert_eq!(g.modification_time, w.modification_time, "{}", w.relative_path);
            assert_eq!(g.is_directory, w.is_directory, "{}", w.relative_path);
            assert_eq!(g.extended_attributes, w.extended_attributes, "{}", w.relative_path);
            assert!(g.path.is_none());
        }
    }

    #[test]
    fn test_registry_knows_every_type_once() {
        let reg = registry();
        assert_eq!(reg.len(), MessageType::ALL.len());
        for t in MessageType::ALL {
            assert_eq!(reg.message_type(t.code()).unwrap(), *t);
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut b = RegistryBuilder::default();
        b.register::<KeepAlive>().unwrap();
        assert!(b.register::<KeepAlive>().is_err());
    }

    #[test]
    fn test_unknown_code_is_hard_error() {
        let err = registry().decode(b"ZZ".to_vec()).unwrap_err();
        assert!(matches!(err, SyncError::UnknownMessageType(c) if &c == b"ZZ"));
    }

    #[test]
    fn test_body_with_trailing_bytes_fails_closed() {
        let mut body = Message::from(KeepAlive).to_body();
        body.push(0);
        assert!(matches!(
            registry().decode(body),
            Err(SyncError::Codec(CodecError::Trailing(1)))
        ));
    }

    #[test]
    fn test_truncated_body_fails_closed() {
        let mut body = Message::from(FileDescriptorAck::ready("a.txt")).to_body();
        body.truncate(body.len() - 1);
        assert!(matches!(registry().decode(body), Err(SyncError::Codec(_))));
    }

    #[test]
    fn test_connect_handshake_messages() {
        let connect = Connect {
            username: "admin".into(),
            password: "secret".into(),
            folder: "photos".into(),
            max_packet_size: 65536,
            max_connections: 3,
            dry_run: true,
            host_name: "laptop".into(),
            ignore_hidden: true,
            ignore_system: false,
            ignored_patterns: vec!["*.tmp".into(), "@^cache/.*".into()],
        };
        match back(connect.clone().into()) {
            Message::Connect(c) => assert_eq!(c, connect),
            other => panic!("got {:?}", other),
        }

        let resp = ConnectResponse {
            accepted: true,
            reason: String::new(),
            session_id: Uuid::new_v4(),
            max_packet_size: 1024,
            max_connections: 2,
            backup_type: BackupType::DateSeparated,
            ignore_hidden: true,
            ignore_system: true,
            ignored_patterns: vec!["*.bak".into()],
        };
        match back(resp.clone().into()) {
            Message::ConnectResponse(r) => assert_eq!(r, resp),
            other => panic!("got {:?}", other),
        }
    }

    #[test]
    fn test_transfer_cycle_messages() {
        let data = FileData {
            relative_path: "dir/b.txt".into(),
            block_index: 2,
            total_blocks: 3,
            data: vec![1, 2, 3, 255],
        };
        match back(data.clone().into()) {
            Message::FileData(d) => assert_eq!(d, data),
            other => panic!("got {:?}", other),
        }

        let end = FileEnd {
            relative_path: "dir/b.txt".into(),
            file: file("dir/b.txt"),
        };
        match back(end.into()) {
            Message::FileEnd(e) => {
                assert_eq!(e.relative_path, "dir/b.txt");
                assert_same_files(&[e.file], &[file("dir/b.txt")]);
            }
            other => panic!("got {:?}", other),
        }

        let ack = FileEndAck::failure("dir/b.txt", "disk full");
        match back(ack.clone().into()) {
            Message::FileEndAck(a) => assert_eq!(a, ack),
            other => panic!("got {:?}", other),
        }
    }

    #[test]
    fn test_list_and_sync_messages() {
        let resp = FileListResponse {
            files_to_transfer: vec![file("a"), folder("b")],
            files_to_delete: vec!["old.txt".into()],
            conflicts: vec!["both.txt".into()],
            is_backup: false,
        };
        match back(resp.clone().into()) {
            Message::FileListResponse(r) => {
                assert_same_files(&r.files_to_transfer, &resp.files_to_transfer);
                assert_eq!(r.files_to_delete, resp.files_to_delete);
                assert_eq!(r.conflicts, resp.conflicts);
                assert!(!r.is_backup);
            }
            other => panic!("got {:?}", other),
        }

        let when = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let sync = FileSync {
            changes: vec![LogEntry {
                run_start: when,
                creation_time: when,
                modification_time: when,
                size: 5,
                operation: Operation::Delete,
                relative_path: "gone.txt".into(),
            }],
            last_update: Some(when),
        };
        match back(sync.clone().into()) {
            Message::FileSync(s) => assert_eq!(s, sync),
            other => panic!("got {:?}", other),
        }
    }

    #[test]
    fn test_file_list_keeps_every_field() {
        let list = FileList {
            files: vec![folder("dir"), file("dir/a.bin"), file("dir/b c.txt")],
            is_backup: true,
        };
        match back(list.clone().into()) {
            Message::FileList(l) => {
                assert!(l.is_backup);
                assert_same_files(&l.files, &list.files);
            }
            other => panic!("got {:?}", other),
        }
    }

    #[test]
    fn test_descriptor_messages_keep_every_field() {
        let fd = FileDescriptor { file: folder("photos/2024") };
        match back(fd.clone().into()) {
            Message::FileDescriptor(d) => assert_same_files(&[d.file], &[fd.file]),
            other => panic!("got {:?}", other),
        }

        for ack in [
            FileDescriptorAck::ready("a.txt"),
            FileDescriptorAck::not_ready("b.txt", "a directory is in the way"),
        ] {
            match back(ack.clone().into()) {
                Message::FileDescriptorAck(a) => assert_eq!(a, ack),
                other => panic!("got {:?}", other),
            }
        }

        let data_ack = FileDataAck {
            relative_path: "big.iso".into(),
            block_index: 70_000,
        };
        match back(data_ack.clone().into()) {
            Message::FileDataAck(a) => assert_eq!(a, data_ack),
            other => panic!("got {:?}", other),
        }

        let ok = FileEndAck {
            relative_path: "big.iso".into(),
            success: true,
            reason: String::new(),
        };
        match back(ok.clone().into()) {
            Message::FileEndAck(a) => assert_eq!(a, ok),
            other => panic!("got {:?}", other),
        }
    }

    #[test]
    fn test_session_messages_keep_every_field() {
        for ack in [
            SyncEndAck {
                success: true,
                reason: String::new(),
            },
            SyncEndAck {
                success: false,
                reason: "log not written".into(),
            },
        ] {
            match back(ack.clone().into()) {
                Message::SyncEndAck(a) => assert_eq!(a, ack),
                other => panic!("got {:?}", other),
            }
        }

        let err = ErrorMessage {
            code: "ERR_BACKUP_TYPE".into(),
            message: "folder is mirror".into(),
            details: "expected two-way-sync".into(),
        };
        match back(err.clone().into()) {
            Message::ErrorMessage(e) => assert_eq!(e, err),
            other => panic!("got {:?}", other),
        }

        let rejected = ConnectResponse::rejected("ERR_AUTH: bad password");
        match back(rejected.clone().into()) {
            Message::ConnectResponse(r) => assert_eq!(r, rejected),
            other => panic!("got {:?}", other),
        }
    }

    #[test]
    fn test_empty_messages_carry_only_their_code() {
        let empties: [Message; 5] = [
            SyncEnd.into(),
            StartRestore.into(),
            StartRestoreAck.into(),
            KeepAlive.into(),
            FileSyncAck.into(),
        ];
        for msg in empties {
            let body = msg.to_body();
            assert_eq!(body, msg.message_type().code().to_vec());
            assert_eq!(back(msg.clone()).message_type(), msg.message_type());
        }
    }

    #[test]
    fn test_file_sync_without_last_update() {
        let when = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let sync = FileSync {
            changes: vec![
                LogEntry {
                    run_start: when,
                    creation_time: Utc.timestamp_opt(1_500_000_000, 0).unwrap(),
                    modification_time: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
                    size: 9,
                    operation: Operation::Modify,
                    relative_path: "notes/a.md".into(),
                },
                LogEntry {
                    run_start: when,
                    creation_time: when,
                    modification_time: when,
                    size: 0,
                    operation: Operation::Create,
                    relative_path: "empty".into(),
                },
            ],
            last_update: None,
        };
        match back(sync.clone().into()) {
            Message::FileSync(s) => assert_eq!(s, sync),
            other => panic!("got {:?}", other),
        }
    }

    #[test]
    fn test_try_from_reports_the_wrong_variant() {
        let msg: Message = SyncEnd.into();
        let err = FileEndAck::try_from(msg).unwrap_err();
        assert_eq!(err.message_type(), MessageType::SyncEnd);
    }
}
