//! # Per-Connection Sessions
//!
//! One [`Session`] drives one accepted connection through the state
//! machine `Handshaking → Ready ⇄ Serving → Draining → Closed`, with
//! `Failed` as the terminal error state. The first byte of the
//! connection selects the protocol version: the `"OBJM"` magic opens a
//! V2 handshake, anything else is a V1 delivery mode.
//!
//! Input, policy, and resource errors become non-OK responses carrying a
//! message TLV and the connection continues; protocol violations and
//! transport failures fail the session.

use std::io::Read;
use std::sync::Arc;

use thiserror::Error;

use crate::backend::{BackendError, BackendManager, CreateRequest};
use crate::index::IndexError;
use crate::protocol::v2::request_flags;
use crate::protocol::{
    caps, Close, CloseAck, DeliveryMode, FrameTag, Hello, HelloAck, ProtocolError, RequestOp,
    Status, V2Request, MAGIC, MAX_INLINE_BODY, MAX_URI_LEN, PROTOCOL_VERSION,
};
use crate::session::delivery::ResponseFraming;
use crate::transport::{Transport, TransportError};

pub mod delivery;

/// Session errors (these fail the connection; recoverable conditions are
/// answered with a status response instead)
#[derive(Error, Debug)]
pub enum SessionError {
    /// Frame-level decode or encode failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Peer violated the protocol
    #[error("Protocol violation: {0}")]
    Violation(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for session operations
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, nothing read yet
    Connecting,
    /// Waiting for the version-selecting first byte
    Handshaking,
    /// Between requests
    Ready,
    /// A request is being answered
    Serving,
    /// CLOSE received, flushing in-flight work
    Draining,
    /// Orderly end
    Closed,
    /// Terminated by an error
    Failed,
}

/// Server-side session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capabilities the server offers in HELLO_ACK
    pub server_caps: u16,

    /// Largest pipeline depth the server grants
    pub max_pipeline: u16,

    /// Backend-parallelism hint advertised to clients
    pub backend_parallelism: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_caps: caps::OOO_REPLIES | caps::PIPELINING | caps::SEGMENTED_DELIVERY,
            max_pipeline: 32,
            backend_parallelism: 4,
        }
    }
}

/// One connection's state machine
pub struct Session {
    transport: Box<dyn Transport>,
    manager: Arc<BackendManager>,
    config: SessionConfig,
    state: SessionState,
    protocol_version: u8,
    negotiated_caps: u16,
    max_pipeline: u16,
    fd_passing: bool,
    peer: String,
}

impl Session {
    /// Wrap an accepted transport
    pub fn new(
        transport: Box<dyn Transport>,
        manager: Arc<BackendManager>,
        config: SessionConfig,
    ) -> Self {
        let fd_passing = transport.caps().supports_fd_passing;
        let peer = transport.peer();
        Self {
            transport,
            manager,
            config,
            state: SessionState::Connecting,
            protocol_version: 0,
            negotiated_caps: 0,
            max_pipeline: 1,
            fd_passing,
            peer,
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Negotiated capability set (zero before the handshake and for V1)
    pub fn negotiated_caps(&self) -> u16 {
        self.negotiated_caps
    }

    /// Drive the session to completion. Consumes the session and returns
    /// its terminal state.
    pub fn run(mut self) -> SessionState {
        self.state = SessionState::Handshaking;
        log::debug!("Session with {} started", self.peer);

        match self.serve_loop() {
            Ok(()) => {
                if self.state != SessionState::Closed {
                    self.state = SessionState::Closed;
                }
                log::debug!("Session with {} closed", self.peer);
            }
            Err(e) => {
                self.state = SessionState::Failed;
                log::warn!("Session with {} failed: {e}", self.peer);
            }
        }
        let _ = self.transport.shutdown();
        self.state
    }

    fn serve_loop(&mut self) -> SessionResult<()> {
        loop {
            let Some(first) = self.read_byte()? else {
                // Clean EOF between frames.
                return Ok(());
            };

            if self.state == SessionState::Handshaking {
                if first == MAGIC[0] {
                    self.handshake()?;
                    continue;
                }
                // Version-less legacy peer: the byte is already a mode.
                self.protocol_version = 1;
                self.state = SessionState::Ready;
                self.serve_v1(first)?;
                continue;
            }

            match self.protocol_version {
                1 => self.serve_v1(first)?,
                _ => match FrameTag::from_u8(first)? {
                    FrameTag::Request => self.serve_v2()?,
                    FrameTag::Close => {
                        self.drain()?;
                        return Ok(());
                    }
                    tag => {
                        return Err(SessionError::Violation(format!(
                            "unexpected frame {tag:?} from client"
                        )))
                    }
                },
            }
        }
    }

    fn handshake(&mut self) -> SessionResult<()> {
        let hello = Hello::read_after_first_byte(&mut self.transport)?;
        if hello.version < PROTOCOL_VERSION {
            return Err(SessionError::Violation(format!(
                "HELLO carries version {}, minimum is {PROTOCOL_VERSION}",
                hello.version
            )));
        }
        self.negotiated_caps = hello.capabilities & self.config.server_caps;
        self.max_pipeline = hello.max_pipeline.min(self.config.max_pipeline).max(1);
        self.protocol_version = PROTOCOL_VERSION;

        let ack = HelloAck {
            version: PROTOCOL_VERSION,
            capabilities: self.negotiated_caps,
            max_pipeline: self.max_pipeline,
            backend_parallelism: self.config.backend_parallelism,
        };
        self.transport.write_all(&ack.encode())?;
        self.transport.flush()?;
        self.state = SessionState::Ready;
        log::debug!(
            "Session with {} negotiated caps 0x{:04x}, pipeline {}",
            self.peer,
            self.negotiated_caps,
            self.max_pipeline
        );
        Ok(())
    }

    fn serve_v1(&mut self, mode_byte: u8) -> SessionResult<()> {
        // Consume the whole frame before judging the mode byte, so an
        // unknown mode gets a response instead of a dropped connection.
        let uri = crate::protocol::v1::read_uri(&mut self.transport)?;
        self.state = SessionState::Serving;
        let framing = ResponseFraming::V1;

        let Ok(requested) = DeliveryMode::from_u8(mode_byte) else {
            delivery::write_error(
                &mut *self.transport,
                framing,
                Status::InvalidMode,
                &format!("unknown delivery mode {mode_byte}"),
            )?;
            self.state = SessionState::Ready;
            return Ok(());
        };

        if uri.len() > MAX_URI_LEN {
            delivery::write_error(
                &mut *self.transport,
                framing,
                Status::UriTooLong,
                &format!("URI length {} exceeds {MAX_URI_LEN}", uri.len()),
            )?;
            self.state = SessionState::Ready;
            return Ok(());
        }

        match self.effective_mode(requested) {
            Ok(mode) => self.respond_get(framing, &uri, mode)?,
            Err((status, message)) => {
                delivery::write_error(&mut *self.transport, framing, status, &message)?
            }
        }
        self.state = SessionState::Ready;
        Ok(())
    }

    fn serve_v2(&mut self) -> SessionResult<()> {
        let request = V2Request::read_after_tag(&mut self.transport)?;
        self.state = SessionState::Serving;
        let framing = ResponseFraming::V2 {
            request_id: request.request_id,
        };

        if request.uri.len() > MAX_URI_LEN {
            delivery::write_error(
                &mut *self.transport,
                framing,
                Status::UriTooLong,
                &format!("URI length {} exceeds {MAX_URI_LEN}", request.uri.len()),
            )?;
            self.state = SessionState::Ready;
            return Ok(());
        }

        match request.op {
            RequestOp::Get => match self.effective_mode(request.mode) {
                Ok(mode) => self.respond_get(framing, &request.uri, mode)?,
                Err((status, message)) => {
                    delivery::write_error(&mut *self.transport, framing, status, &message)?
                }
            },
            RequestOp::Put => self.respond_put(framing, &request)?,
            RequestOp::Delete => {
                let result = self.manager.delete_object(&request.uri);
                self.respond_empty(framing, result)?;
            }
            RequestOp::Stat => match self.manager.lookup(&request.uri) {
                Ok(entry) => {
                    let metadata = delivery::entry_metadata(&entry)?;
                    delivery::write_ok(&mut *self.transport, framing, metadata)?;
                }
                Err(e) => self.respond_backend_error(framing, &e)?,
            },
        }
        self.state = SessionState::Ready;
        Ok(())
    }

    fn respond_get(
        &mut self,
        framing: ResponseFraming,
        uri: &str,
        mode: DeliveryMode,
    ) -> SessionResult<()> {
        match self.manager.get_object(uri) {
            Ok(fd_ref) => delivery::send_body(&mut *self.transport, framing, &fd_ref, mode),
            Err(e) => self.respond_backend_error(framing, &e),
        }
    }

    fn respond_put(&mut self, framing: ResponseFraming, request: &V2Request) -> SessionResult<()> {
        if request.content_len > MAX_INLINE_BODY {
            return delivery::write_error(
                &mut *self.transport,
                framing,
                Status::InvalidRequest,
                &format!(
                    "inline body of {} bytes exceeds maximum {MAX_INLINE_BODY}",
                    request.content_len
                ),
            );
        }
        let ephemeral = request.flags & request_flags::EPHEMERAL != 0;
        let result = self
            .manager
            .create_object(CreateRequest {
                uri: request.uri.clone(),
                backend_id: None,
                ephemeral,
            })
            .and_then(|fd_ref| {
                if !request.body.is_empty() {
                    let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd_ref.raw_fd()) };
                    let mut written = 0usize;
                    while written < request.body.len() {
                        let n = nix::sys::uio::pwrite(
                            fd,
                            &request.body[written..],
                            written as nix::libc::off_t,
                        )
                        .map_err(|e| BackendError::Storage(format!("write body: {e}")))?;
                        written += n;
                    }
                }
                drop(fd_ref);
                self.manager
                    .update_size(&request.uri, request.body.len() as u64)
            });

        match result {
            Ok(()) => {
                let metadata = match self.manager.lookup(&request.uri) {
                    Ok(entry) => delivery::entry_metadata(&entry)?,
                    Err(_) => Vec::new(),
                };
                delivery::write_ok(&mut *self.transport, framing, metadata)
            }
            Err(e) => self.respond_backend_error(framing, &e),
        }
    }

    fn respond_empty(
        &mut self,
        framing: ResponseFraming,
        result: Result<(), BackendError>,
    ) -> SessionResult<()> {
        match result {
            Ok(()) => delivery::write_ok(&mut *self.transport, framing, Vec::new()),
            Err(e) => self.respond_backend_error(framing, &e),
        }
    }

    fn respond_backend_error(
        &mut self,
        framing: ResponseFraming,
        error: &BackendError,
    ) -> SessionResult<()> {
        let status = map_backend_error(error);
        delivery::write_error(&mut *self.transport, framing, status, &error.to_string())
    }

    /// Resolve the effective delivery mode: FD_PASS downgrades to COPY on
    /// descriptor-less transports; SEGMENTED needs the negotiated
    /// capability and the V2 protocol.
    fn effective_mode(&self, requested: DeliveryMode) -> Result<DeliveryMode, (Status, String)> {
        match requested {
            DeliveryMode::FdPass if !self.fd_passing => Ok(DeliveryMode::Copy),
            DeliveryMode::Segmented => {
                if self.protocol_version < PROTOCOL_VERSION {
                    Err((
                        Status::InvalidMode,
                        "segmented delivery requires the V2 protocol".into(),
                    ))
                } else if self.negotiated_caps & caps::SEGMENTED_DELIVERY == 0 {
                    Err((
                        Status::CapabilityError,
                        "SEGMENTED_DELIVERY capability was not negotiated".into(),
                    ))
                } else {
                    Ok(DeliveryMode::Segmented)
                }
            }
            other => Ok(other),
        }
    }

    /// Serve the CLOSE/CLOSE_ACK drain. Requests are answered before the
    /// next frame is read, so nothing is outstanding at this point.
    fn drain(&mut self) -> SessionResult<()> {
        let close = Close::read_after_tag(&mut self.transport)?;
        self.state = SessionState::Draining;
        log::debug!(
            "Session with {} draining (reason {:?})",
            self.peer,
            close.reason
        );
        let ack = CloseAck { outstanding: 0 };
        self.transport.write_all(&ack.encode())?;
        self.transport.flush()?;
        self.state = SessionState::Closed;
        Ok(())
    }

    /// Read one byte; `None` means a clean EOF
    fn read_byte(&mut self) -> SessionResult<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.transport.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Map a backend error onto a protocol status
fn map_backend_error(error: &BackendError) -> Status {
    match error {
        BackendError::NotFound(_) => Status::NotFound,
        BackendError::BackendNotFound(_) => Status::InvalidRequest,
        BackendError::DuplicateBackend(_) => Status::InternalError,
        BackendError::InvalidConfig(_) => Status::InvalidRequest,
        BackendError::Policy(_) => Status::InvalidRequest,
        BackendError::Migration(_) => Status::StorageError,
        BackendError::Storage(_) => Status::StorageError,
        BackendError::Index(IndexError::NotFound(_)) => Status::NotFound,
        BackendError::Index(IndexError::Storage(_)) => Status::StorageError,
        BackendError::Index(_) => Status::InternalError,
        BackendError::Io(_) => Status::InternalError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_mapping() {
        assert_eq!(
            map_backend_error(&BackendError::NotFound("/x".into())),
            Status::NotFound
        );
        assert_eq!(
            map_backend_error(&BackendError::Policy("nope".into())),
            Status::InvalidRequest
        );
        assert_eq!(
            map_backend_error(&BackendError::Storage("disk".into())),
            Status::StorageError
        );
    }
}
