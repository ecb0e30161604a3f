//! SFTP v3 wire types.
//!
//! Message numbers, status codes, open flags, and the file-attribute block
//! from draft-ietf-secsh-filexfer-02, plus the length-prefixed string codec
//! shared by the session loop. Packets on the wire are framed as
//! `u32 length || u8 type || payload`; framing itself lives in the session
//! module, everything below the frame lives here.

use bytes::{BufMut, BytesMut};

/// Protocol version negotiated with every client.
pub const SFTP_VERSION: u32 = 3;

/// SFTP message types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Init = 1,
    Version = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Lstat = 7,
    Fstat = 8,
    Setstat = 9,
    Fsetstat = 10,
    Opendir = 11,
    Readdir = 12,
    Remove = 13,
    Mkdir = 14,
    Rmdir = 15,
    Realpath = 16,
    Stat = 17,
    Rename = 18,
    Readlink = 19,
    Symlink = 20,
    Status = 101,
    Handle = 102,
    Data = 103,
    Name = 104,
    Attrs = 105,
    Extended = 200,
    ExtendedReply = 201,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Init),
            2 => Ok(MessageType::Version),
            3 => Ok(MessageType::Open),
            4 => Ok(MessageType::Close),
            5 => Ok(MessageType::Read),
            6 => Ok(MessageType::Write),
            7 => Ok(MessageType::Lstat),
            8 => Ok(MessageType::Fstat),
            9 => Ok(MessageType::Setstat),
            10 => Ok(MessageType::Fsetstat),
            11 => Ok(MessageType::Opendir),
            12 => Ok(MessageType::Readdir),
            13 => Ok(MessageType::Remove),
            14 => Ok(MessageType::Mkdir),
            15 => Ok(MessageType::Rmdir),
            16 => Ok(MessageType::Realpath),
            17 => Ok(MessageType::Stat),
            18 => Ok(MessageType::Rename),
            19 => Ok(MessageType::Readlink),
            20 => Ok(MessageType::Symlink),
            101 => Ok(MessageType::Status),
            102 => Ok(MessageType::Handle),
            103 => Ok(MessageType::Data),
            104 => Ok(MessageType::Name),
            105 => Ok(MessageType::Attrs),
            200 => Ok(MessageType::Extended),
            201 => Ok(MessageType::ExtendedReply),
            _ => Err(crate::Error::protocol(format!(
                "unknown message type: {value}"
            ))),
        }
    }
}

/// SFTP status codes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> u32 {
        code as u32
    }
}

/// `pflags` bitfield carried by `SSH_FXP_OPEN`.
#[derive(Debug, Clone, Copy)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ: u32 = 0x00000001;
    pub const WRITE: u32 = 0x00000002;
    pub const APPEND: u32 = 0x00000004;
    pub const CREAT: u32 = 0x00000008;
    pub const TRUNC: u32 = 0x00000010;
    pub const EXCL: u32 = 0x00000020;

    /// Any of `mask`'s bits set.
    pub fn contains(&self, mask: u32) -> bool {
        self.0 & mask != 0
    }

    /// Whether the open is a mutation from the gateway's point of view.
    /// Anything that can create, truncate, or write routes through the
    /// write pipeline; a plain read-only open routes through the read one.
    pub fn is_write(&self) -> bool {
        self.contains(Self::WRITE | Self::APPEND | Self::CREAT | Self::TRUNC)
    }
}

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;

/// File attribute block (`ATTRS` encoding).
#[derive(Debug, Clone, Default)]
pub struct FileAttrs {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

impl FileAttrs {
    const FLAG_SIZE: u32 = 0x00000001;
    const FLAG_UIDGID: u32 = 0x00000002;
    const FLAG_PERMISSIONS: u32 = 0x00000004;
    const FLAG_ACMODTIME: u32 = 0x00000008;

    /// Attributes for an on-disk entry, carrying the real mode bits and
    /// ownership so clients render listings faithfully.
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        FileAttrs {
            size: Some(metadata.len()),
            uid: Some(metadata.uid()),
            gid: Some(metadata.gid()),
            permissions: Some(metadata.mode()),
            atime: Some(metadata.atime() as u32),
            mtime: Some(metadata.mtime() as u32),
        }
    }

    /// True when the client-supplied permissions carry the directory type
    /// bit. The gateway only honors the file-vs-directory distinction of a
    /// `Setstat`; all other requested bits are discarded.
    pub fn requests_directory(&self) -> bool {
        self.permissions
            .map_or(false, |mode| mode & S_IFMT == S_IFDIR)
    }

    /// The validity bitmask describing which optional fields are present.
    /// uid/gid and atime/mtime travel as pairs; a half-set pair is treated
    /// as absent.
    fn flag_bits(&self) -> u32 {
        let mut flags = 0;
        flags |= (self.size.is_some() as u32) * Self::FLAG_SIZE;
        flags |= ((self.uid.is_some() && self.gid.is_some()) as u32) * Self::FLAG_UIDGID;
        flags |= (self.permissions.is_some() as u32) * Self::FLAG_PERMISSIONS;
        flags |= ((self.atime.is_some() && self.mtime.is_some()) as u32) * Self::FLAG_ACMODTIME;
        flags
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u32(self.flag_bits());

        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }

        buf
    }

    pub fn decode(buf: &mut &[u8]) -> crate::Result<Self> {
        let flags = codec::read_u32(buf)?;
        let mut attrs = FileAttrs::default();

        if flags & Self::FLAG_SIZE != 0 {
            attrs.size = Some(codec::read_u64(buf)?);
        }
        if flags & Self::FLAG_UIDGID != 0 {
            attrs.uid = Some(codec::read_u32(buf)?);
            attrs.gid = Some(codec::read_u32(buf)?);
        }
        if flags & Self::FLAG_PERMISSIONS != 0 {
            attrs.permissions = Some(codec::read_u32(buf)?);
        }
        if flags & Self::FLAG_ACMODTIME != 0 {
            attrs.atime = Some(codec::read_u32(buf)?);
            attrs.mtime = Some(codec::read_u32(buf)?);
        }

        Ok(attrs)
    }
}

/// Readers and writers for the SFTP primitive types. Every reader consumes
/// from the front of a shrinking slice and fails on truncated input, so a
/// malformed packet can never read past its frame.
pub mod codec {
    use bytes::{BufMut, BytesMut};

    /// Take exactly `n` bytes off the front of `buf`.
    fn take<'a>(buf: &mut &'a [u8], n: usize) -> crate::Result<&'a [u8]> {
        if buf.len() < n {
            return Err(crate::Error::protocol(format!(
                "truncated packet: wanted {n} bytes, have {}",
                buf.len()
            )));
        }
        let (head, tail) = buf.split_at(n);
        *buf = tail;
        Ok(head)
    }

    pub fn read_u32(buf: &mut &[u8]) -> crate::Result<u32> {
        let raw = take(buf, 4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn read_u64(buf: &mut &[u8]) -> crate::Result<u64> {
        let raw = take(buf, 8)?;
        Ok(u64::from_be_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ]))
    }

    /// Length-prefixed byte string.
    pub fn read_bytes(buf: &mut &[u8]) -> crate::Result<Vec<u8>> {
        let len = read_u32(buf)? as usize;
        Ok(take(buf, len)?.to_vec())
    }

    /// Length-prefixed UTF-8 string.
    pub fn read_string(buf: &mut &[u8]) -> crate::Result<String> {
        String::from_utf8(read_bytes(buf)?)
            .map_err(|e| crate::Error::protocol(format!("invalid UTF-8 string: {e}")))
    }

    pub fn write_bytes(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
    }

    pub fn write_string(buf: &mut BytesMut, s: &str) {
        write_bytes(buf, s.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_round_trip() {
        for value in [1u8, 3, 4, 5, 6, 9, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 101, 104] {
            let msg = MessageType::try_from(value).unwrap();
            assert_eq!(msg as u8, value);
        }
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(42).is_err());
    }

    #[test]
    fn test_open_flags_write_routing() {
        assert!(!OpenFlags(OpenFlags::READ).is_write());
        assert!(OpenFlags(OpenFlags::WRITE).is_write());
        assert!(OpenFlags(OpenFlags::READ | OpenFlags::CREAT).is_write());
        assert!(OpenFlags(OpenFlags::READ | OpenFlags::TRUNC).is_write());
        assert!(OpenFlags(OpenFlags::APPEND).is_write());

        let flags = OpenFlags(OpenFlags::READ | OpenFlags::EXCL);
        assert!(flags.contains(OpenFlags::READ));
        assert!(flags.contains(OpenFlags::EXCL));
        assert!(!flags.contains(OpenFlags::WRITE));
    }

    #[test]
    fn test_requests_directory() {
        let dir = FileAttrs {
            permissions: Some(0o040777),
            ..Default::default()
        };
        assert!(dir.requests_directory());

        let file = FileAttrs {
            permissions: Some(0o100777),
            ..Default::default()
        };
        assert!(!file.requests_directory());

        assert!(!FileAttrs::default().requests_directory());
    }

    #[test]
    fn test_attrs_encode_decode() {
        let attrs = FileAttrs {
            size: Some(4096),
            uid: Some(1000),
            gid: Some(1000),
            permissions: Some(0o100644),
            atime: Some(1_700_000_000),
            mtime: Some(1_700_000_100),
        };

        let encoded = attrs.encode();
        let mut slice: &[u8] = &encoded;
        let decoded = FileAttrs::decode(&mut slice).unwrap();

        assert_eq!(decoded.size, attrs.size);
        assert_eq!(decoded.uid, attrs.uid);
        assert_eq!(decoded.gid, attrs.gid);
        assert_eq!(decoded.permissions, attrs.permissions);
        assert_eq!(decoded.mtime, attrs.mtime);
    }

    #[test]
    fn test_string_codec_truncated_input() {
        let mut buf = BytesMut::new();
        codec::write_string(&mut buf, "hello");

        let mut slice: &[u8] = &buf[..4];
        assert!(codec::read_string(&mut slice).is_err());

        let mut slice: &[u8] = &buf;
        assert_eq!(codec::read_string(&mut slice).unwrap(), "hello");
    }

    #[test]
    fn test_readers_consume_in_order() {
        let mut buf = BytesMut::new();
        buf.put_u32(7);
        buf.put_u64(1 << 33);
        codec::write_bytes(&mut buf, b"abc");

        let mut slice: &[u8] = &buf;
        assert_eq!(codec::read_u32(&mut slice).unwrap(), 7);
        assert_eq!(codec::read_u64(&mut slice).unwrap(), 1 << 33);
        assert_eq!(codec::read_bytes(&mut slice).unwrap(), b"abc");
        assert!(slice.is_empty());
        assert!(codec::read_u32(&mut slice).is_err());
    }
}
