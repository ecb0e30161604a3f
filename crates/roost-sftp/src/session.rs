//! SFTP session loop.
//!
//! One [`SftpSession`] serves one negotiated `sftp` subsystem channel. It
//! reassembles length-framed packets from the SSH data stream, dispatches
//! them, and hands every filesystem decision to the session's [`FsHandler`].
//! Reads and writes are offset-addressed against open handles; the handle
//! table is bounded and cleared when the session drops.

use std::collections::HashMap;
use std::io::SeekFrom;

use bytes::{Buf, BufMut, BytesMut};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::handler::{CmdMethod, CmdRequest, DirLister, FsHandler, ListMethod, NamedEntry};
use crate::protocol::{codec, FileAttrs, MessageType, OpenFlags, StatusCode, SFTP_VERSION};
use crate::sandbox;

/// Upper bound on simultaneously open handles per session.
const MAX_OPEN_HANDLES: usize = 1024;

/// Directory entries returned per `Readdir` round trip.
const READDIR_CHUNK: usize = 100;

/// Largest packet accepted from a peer. Well above the 32 KiB the protocol
/// requires implementations to support.
const MAX_PACKET_BYTES: usize = 1024 * 1024;

/// Largest single read honored; longer requests are truncated and the
/// client continues at the next offset.
const MAX_READ_BYTES: u32 = 262_144;

enum SessionHandle {
    File {
        file: fs::File,
        /// Client-visible path, kept so `Fsetstat` can route back through
        /// the handler with the sandbox and read-only checks intact.
        virtual_path: String,
    },
    Dir {
        lister: DirLister,
        offset: usize,
    },
}

/// State for one SFTP subsystem channel.
pub struct SftpSession {
    handler: FsHandler,
    inbox: BytesMut,
    handles: HashMap<Vec<u8>, SessionHandle>,
    next_handle_id: u32,
    initialized: bool,
}

impl SftpSession {
    pub fn new(handler: FsHandler) -> Self {
        Self {
            handler,
            inbox: BytesMut::new(),
            handles: HashMap::new(),
            next_handle_id: 0,
            initialized: false,
        }
    }

    /// Feed raw bytes from the SSH channel. Returns the concatenated,
    /// length-framed responses for every complete packet in the stream;
    /// partial packets stay buffered until the rest arrives.
    pub async fn handle_data(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.inbox.extend_from_slice(data);

        let mut out = BytesMut::new();
        while let Some(packet) = self.next_packet()? {
            let response = self.handle_packet(&packet).await?;
            if !response.is_empty() {
                out.put_u32(response.len() as u32);
                out.extend_from_slice(&response);
            }
        }

        Ok(out.to_vec())
    }

    fn next_packet(&mut self) -> Result<Option<Vec<u8>>> {
        if self.inbox.len() < 4 {
            return Ok(None);
        }

        let len =
            u32::from_be_bytes([self.inbox[0], self.inbox[1], self.inbox[2], self.inbox[3]])
                as usize;
        if len == 0 {
            return Err(Error::protocol("zero-length packet"));
        }
        if len > MAX_PACKET_BYTES {
            return Err(Error::protocol(format!("oversized packet: {len} bytes")));
        }
        if self.inbox.len() < 4 + len {
            return Ok(None);
        }

        self.inbox.advance(4);
        Ok(Some(self.inbox.split_to(len).to_vec()))
    }

    async fn handle_packet(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let msg_type = MessageType::try_from(packet[0])?;
        let mut buf = &packet[1..];

        debug!(message = ?msg_type, "sftp packet");

        if !self.initialized && msg_type != MessageType::Init {
            return Err(Error::protocol(format!(
                "received {msg_type:?} before initialization"
            )));
        }

        match msg_type {
            MessageType::Init => self.op_init(&mut buf),
            MessageType::Open => self.op_open(&mut buf).await,
            MessageType::Close => self.op_close(&mut buf).await,
            MessageType::Read => self.op_read(&mut buf).await,
            MessageType::Write => self.op_write(&mut buf).await,
            MessageType::Stat | MessageType::Lstat => self.op_stat(&mut buf).await,
            MessageType::Fstat => self.op_fstat(&mut buf).await,
            MessageType::Setstat => self.op_setstat(&mut buf).await,
            MessageType::Fsetstat => self.op_fsetstat(&mut buf).await,
            MessageType::Opendir => self.op_opendir(&mut buf).await,
            MessageType::Readdir => self.op_readdir(&mut buf),
            MessageType::Remove => self.op_cmd_single(&mut buf, CmdMethod::Remove).await,
            MessageType::Rmdir => self.op_cmd_single(&mut buf, CmdMethod::Rmdir).await,
            MessageType::Mkdir => self.op_mkdir(&mut buf).await,
            MessageType::Realpath => self.op_realpath(&mut buf),
            MessageType::Rename => self.op_cmd_pair(&mut buf, CmdMethod::Rename).await,
            MessageType::Symlink => self.op_cmd_pair(&mut buf, CmdMethod::Symlink).await,
            MessageType::Readlink | MessageType::Extended => {
                let request_id = codec::read_u32(&mut buf)?;
                self.status_error(request_id, &Error::not_supported(format!("{msg_type:?}")))
            }
            other => {
                warn!(message = ?other, "unexpected message type from peer");
                Err(Error::protocol(format!("unexpected message type {other:?}")))
            }
        }
    }

    fn op_init(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let client_version = codec::read_u32(buf)?;
        info!(
            event = "sftp_initialized",
            client_version,
            tenant = %self.handler.principal().tenant_id,
            user = %self.handler.principal().username,
            "sftp session initialized"
        );
        self.initialized = true;

        let mut response = BytesMut::new();
        response.put_u8(MessageType::Version as u8);
        response.put_u32(SFTP_VERSION);
        Ok(response.to_vec())
    }

    async fn op_open(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::read_u32(buf)?;
        let filename = codec::read_string(buf)?;
        let pflags = OpenFlags(codec::read_u32(buf)?);
        let _attrs = FileAttrs::decode(buf)?;

        if self.handles.len() >= MAX_OPEN_HANDLES {
            warn!(handles = self.handles.len(), "open handle limit reached");
            return self.status_error(
                request_id,
                &Error::ResourceExhausted("too many open handles".into()),
            );
        }

        let opened = if pflags.is_write() {
            self.handler.file_write(&filename).await
        } else {
            self.handler.file_read(&filename).await
        };

        match opened {
            Ok(file) => {
                let handle_id = self.allocate_handle(SessionHandle::File {
                    file,
                    virtual_path: filename,
                });
                self.send_handle(request_id, &handle_id)
            }
            Err(e) => self.status_error(request_id, &e),
        }
    }

    async fn op_close(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::read_u32(buf)?;
        let handle = codec::read_bytes(buf)?;

        match self.handles.remove(&handle) {
            Some(SessionHandle::File { mut file, .. }) => {
                // Make sure in-flight writes reach the file before the
                // success status goes out.
                if let Err(e) = file.flush().await {
                    error!(error = %e, "flush on close failed");
                    return self.status_error(request_id, &Error::Io(e));
                }
            }
            Some(SessionHandle::Dir { .. }) => {}
            None => {
                return self.status_error(
                    request_id,
                    &Error::invalid_handle("handle does not exist"),
                );
            }
        }

        self.status(request_id, StatusCode::Ok, "success")
    }

    async fn op_read(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::read_u32(buf)?;
        let handle = codec::read_bytes(buf)?;
        let offset = codec::read_u64(buf)?;
        let len = codec::read_u32(buf)?.min(MAX_READ_BYTES);

        // The handle leaves the table while in use and is reinserted
        // afterwards, so the table itself is never borrowed across the I/O.
        let Some(mut entry) = self.handles.remove(&handle) else {
            return self.status_error(request_id, &Error::invalid_handle("handle does not exist"));
        };

        let response = match &mut entry {
            SessionHandle::File { file, .. } => match file.seek(SeekFrom::Start(offset)).await {
                Err(e) => {
                    error!(offset, error = %e, "seek failed");
                    self.status_error(request_id, &Error::Io(e))
                }
                Ok(_) => {
                    let mut buffer = vec![0u8; len as usize];
                    match file.read(&mut buffer).await {
                        Ok(0) => self.status(request_id, StatusCode::Eof, "end of file"),
                        Ok(n) => {
                            buffer.truncate(n);
                            self.send_data(request_id, &buffer)
                        }
                        Err(e) => {
                            error!(offset, error = %e, "read failed");
                            self.status_error(request_id, &Error::Io(e))
                        }
                    }
                }
            },
            SessionHandle::Dir { .. } => self.status_error(
                request_id,
                &Error::invalid_handle("cannot read from a directory handle"),
            ),
        };

        self.handles.insert(handle, entry);
        response
    }

    async fn op_write(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::read_u32(buf)?;
        let handle = codec::read_bytes(buf)?;
        let offset = codec::read_u64(buf)?;
        let data = codec::read_bytes(buf)?;

        let Some(mut entry) = self.handles.remove(&handle) else {
            return self.status_error(request_id, &Error::invalid_handle("handle does not exist"));
        };

        let response = match &mut entry {
            SessionHandle::File { file, .. } => match file.seek(SeekFrom::Start(offset)).await {
                Err(e) => {
                    error!(offset, error = %e, "seek failed");
                    self.status_error(request_id, &Error::Io(e))
                }
                Ok(_) => match file.write_all(&data).await {
                    Ok(()) => self.status(request_id, StatusCode::Ok, "success"),
                    Err(e) => {
                        error!(offset, error = %e, "write failed");
                        self.status_error(request_id, &Error::Io(e))
                    }
                },
            },
            SessionHandle::Dir { .. } => self.status_error(
                request_id,
                &Error::invalid_handle("cannot write to a directory handle"),
            ),
        };

        self.handles.insert(handle, entry);
        response
    }

    async fn op_stat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::read_u32(buf)?;
        let path = codec::read_string(buf)?;

        match self.handler.file_list(ListMethod::Stat, &path).await {
            Ok(lister) => {
                let entry = lister
                    .list_at(0, 1)
                    .first()
                    .ok_or_else(|| Error::protocol("empty stat result"))?
                    .clone();
                self.send_attrs(request_id, &entry.attrs)
            }
            Err(e) => self.status_error(request_id, &e),
        }
    }

    async fn op_fstat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::read_u32(buf)?;
        let handle = codec::read_bytes(buf)?;

        let Some(entry) = self.handles.remove(&handle) else {
            return self.status_error(request_id, &Error::invalid_handle("handle does not exist"));
        };

        let response = match &entry {
            SessionHandle::File { file, .. } => match file.metadata().await {
                Ok(metadata) => self.send_attrs(request_id, &FileAttrs::from_metadata(&metadata)),
                Err(e) => self.status_error(request_id, &Error::Io(e)),
            },
            SessionHandle::Dir { .. } => self.status_error(
                request_id,
                &Error::invalid_handle("cannot fstat a directory handle"),
            ),
        };

        self.handles.insert(handle, entry);
        response
    }

    async fn op_setstat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::read_u32(buf)?;
        let path = codec::read_string(buf)?;
        let attrs = FileAttrs::decode(buf)?;

        let request = CmdRequest {
            method: CmdMethod::Setstat,
            filepath: &path,
            target: None,
            attrs: Some(&attrs),
        };

        match self.handler.file_cmd(request).await {
            Ok(()) => self.status(request_id, StatusCode::Ok, "success"),
            Err(e) => self.status_error(request_id, &e),
        }
    }

    async fn op_fsetstat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::read_u32(buf)?;
        let handle = codec::read_bytes(buf)?;
        let attrs = FileAttrs::decode(buf)?;

        let virtual_path = match self.handles.get(&handle) {
            Some(SessionHandle::File { virtual_path, .. }) => virtual_path.clone(),
            Some(SessionHandle::Dir { .. }) => {
                return self.status_error(
                    request_id,
                    &Error::invalid_handle("cannot fsetstat a directory handle"),
                );
            }
            None => {
                return self.status_error(
                    request_id,
                    &Error::invalid_handle("handle does not exist"),
                );
            }
        };

        let request = CmdRequest {
            method: CmdMethod::Setstat,
            filepath: &virtual_path,
            target: None,
            attrs: Some(&attrs),
        };

        match self.handler.file_cmd(request).await {
            Ok(()) => self.status(request_id, StatusCode::Ok, "success"),
            Err(e) => self.status_error(request_id, &e),
        }
    }

    async fn op_opendir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::read_u32(buf)?;
        let path = codec::read_string(buf)?;

        if self.handles.len() >= MAX_OPEN_HANDLES {
            warn!(handles = self.handles.len(), "open handle limit reached");
            return self.status_error(
                request_id,
                &Error::ResourceExhausted("too many open handles".into()),
            );
        }

        match self.handler.file_list(ListMethod::List, &path).await {
            Ok(lister) => {
                let handle_id = self.allocate_handle(SessionHandle::Dir { lister, offset: 0 });
                self.send_handle(request_id, &handle_id)
            }
            Err(e) => self.status_error(request_id, &e),
        }
    }

    fn op_readdir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::read_u32(buf)?;
        let handle = codec::read_bytes(buf)?;

        let Some(mut entry) = self.handles.remove(&handle) else {
            return self.status_error(request_id, &Error::invalid_handle("handle does not exist"));
        };

        let response = match &mut entry {
            SessionHandle::Dir { lister, offset } => {
                let chunk = lister.list_at(*offset, READDIR_CHUNK);
                if chunk.is_empty() {
                    self.status(request_id, StatusCode::Eof, "end of directory")
                } else {
                    let mut response = BytesMut::new();
                    response.put_u8(MessageType::Name as u8);
                    response.put_u32(request_id);
                    response.put_u32(chunk.len() as u32);
                    for named in chunk {
                        put_name_entry(&mut response, named);
                    }

                    *offset += chunk.len();

                    Ok(response.to_vec())
                }
            }
            SessionHandle::File { .. } => self.status_error(
                request_id,
                &Error::invalid_handle("cannot readdir a file handle"),
            ),
        };

        self.handles.insert(handle, entry);
        response
    }

    async fn op_mkdir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::read_u32(buf)?;
        let path = codec::read_string(buf)?;
        let _attrs = FileAttrs::decode(buf)?;

        let request = CmdRequest {
            method: CmdMethod::Mkdir,
            filepath: &path,
            target: None,
            attrs: None,
        };

        match self.handler.file_cmd(request).await {
            Ok(()) => self.status(request_id, StatusCode::Ok, "success"),
            Err(e) => self.status_error(request_id, &e),
        }
    }

    /// `Remove` and `Rmdir`: a request id and one path.
    async fn op_cmd_single(&mut self, buf: &mut &[u8], method: CmdMethod) -> Result<Vec<u8>> {
        let request_id = codec::read_u32(buf)?;
        let path = codec::read_string(buf)?;

        let request = CmdRequest {
            method,
            filepath: &path,
            target: None,
            attrs: None,
        };

        match self.handler.file_cmd(request).await {
            Ok(()) => self.status(request_id, StatusCode::Ok, "success"),
            Err(e) => self.status_error(request_id, &e),
        }
    }

    /// `Rename` and `Symlink`: a request id and two paths, the second being
    /// the destination.
    async fn op_cmd_pair(&mut self, buf: &mut &[u8], method: CmdMethod) -> Result<Vec<u8>> {
        let request_id = codec::read_u32(buf)?;
        let path = codec::read_string(buf)?;
        let target = codec::read_string(buf)?;

        let request = CmdRequest {
            method,
            filepath: &path,
            target: Some(&target),
            attrs: None,
        };

        match self.handler.file_cmd(request).await {
            Ok(()) => self.status(request_id, StatusCode::Ok, "success"),
            Err(e) => self.status_error(request_id, &e),
        }
    }

    fn op_realpath(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::read_u32(buf)?;
        let path = codec::read_string(buf)?;

        let resolved = sandbox::virtual_realpath(&path);

        let mut response = BytesMut::new();
        response.put_u8(MessageType::Name as u8);
        response.put_u32(request_id);
        response.put_u32(1);
        put_name_entry(
            &mut response,
            &NamedEntry {
                name: resolved,
                attrs: FileAttrs::default(),
            },
        );

        Ok(response.to_vec())
    }

    fn allocate_handle(&mut self, handle: SessionHandle) -> Vec<u8> {
        let id = self.next_handle_id;
        self.next_handle_id = self.next_handle_id.wrapping_add(1);

        let handle_id = id.to_be_bytes().to_vec();
        self.handles.insert(handle_id.clone(), handle);
        handle_id
    }

    fn status(&self, request_id: u32, code: StatusCode, msg: &str) -> Result<Vec<u8>> {
        let mut response = BytesMut::new();
        response.put_u8(MessageType::Status as u8);
        response.put_u32(request_id);
        response.put_u32(code.into());
        codec::write_string(&mut response, msg);
        codec::write_string(&mut response, "en");

        Ok(response.to_vec())
    }

    fn status_error(&self, request_id: u32, error: &Error) -> Result<Vec<u8>> {
        if error.is_security_event() {
            warn!(error = %error, "security-relevant request failure");
        } else {
            debug!(error = %error, "request failed");
        }

        let mut response = BytesMut::new();
        response.put_u8(MessageType::Status as u8);
        response.put_u32(request_id);
        response.put_u32(error.to_status_code());
        codec::write_string(&mut response, &error.sanitized_message());
        codec::write_string(&mut response, "en");

        Ok(response.to_vec())
    }

    fn send_handle(&self, request_id: u32, handle: &[u8]) -> Result<Vec<u8>> {
        let mut response = BytesMut::new();
        response.put_u8(MessageType::Handle as u8);
        response.put_u32(request_id);
        codec::write_bytes(&mut response, handle);

        Ok(response.to_vec())
    }

    fn send_data(&self, request_id: u32, data: &[u8]) -> Result<Vec<u8>> {
        let mut response = BytesMut::new();
        response.put_u8(MessageType::Data as u8);
        response.put_u32(request_id);
        codec::write_bytes(&mut response, data);

        Ok(response.to_vec())
    }

    fn send_attrs(&self, request_id: u32, attrs: &FileAttrs) -> Result<Vec<u8>> {
        let mut response = BytesMut::new();
        response.put_u8(MessageType::Attrs as u8);
        response.put_u32(request_id);
        response.put(attrs.encode());

        Ok(response.to_vec())
    }
}

fn put_name_entry(buf: &mut BytesMut, entry: &NamedEntry) {
    codec::write_string(buf, &entry.name);
    // The longname is only advisory; clients with real listings format
    // their own from the attribute block.
    codec::write_string(buf, &entry.name);
    buf.put(entry.attrs.encode());
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            debug!(
                handles = self.handles.len(),
                "cleaning up open handles on session end"
            );
            self.handles.clear();
        }
    }
}
