//! # Listener Loop
//!
//! Stream transports get one worker thread per accepted connection,
//! bounded by `max_connections`; the datagram transport is serviced by a
//! single shared worker. The server owns the [`BackendManager`] and hands
//! each session a shared reference — there is no global state.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::backend::{
    BackendConfig, BackendError, BackendManager, BackendType, MaintenanceConfig,
};
use crate::config::{ServerConfig, TransportKind};
use crate::protocol::{DeliveryMode, Status, V1ResponseHeader};
use crate::session::{delivery, Session, SessionConfig};
use crate::transport::udp::MAX_DATAGRAM;
use crate::transport::{DatagramTransport, TransportError, TransportListener};

/// Backend id of the memory cache tier registered by the launcher
pub const CACHE_BACKEND_ID: u8 = 0;

/// Backend id of the default persistent tier registered by the launcher
pub const DEFAULT_BACKEND_ID: u8 = 1;

/// Backend id of the ephemeral tier registered by the launcher
pub const EPHEMERAL_BACKEND_ID: u8 = 2;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    /// Backend setup failed
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Listener setup or accept failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for server operations
pub type ServerResult<T> = std::result::Result<T, ServerError>;

/// The listening server
pub struct Server {
    manager: Arc<BackendManager>,
    config: ServerConfig,
    session_config: SessionConfig,
    active_sessions: Arc<AtomicUsize>,
}

impl Server {
    /// Wrap a manager and a validated configuration
    pub fn new(manager: Arc<BackendManager>, config: ServerConfig) -> Self {
        Self {
            manager,
            config,
            session_config: SessionConfig::default(),
            active_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The shared backend manager
    pub fn manager(&self) -> &Arc<BackendManager> {
        &self.manager
    }

    /// Register the configured backends, restore or scan their indexes,
    /// and start cache maintenance when a cache backend exists
    pub fn bootstrap(&self) -> ServerResult<()> {
        self.manager.register_backend(BackendConfig::persistent(
            DEFAULT_BACKEND_ID,
            BackendType::Ssd,
            self.config.backing_dir.clone(),
            u64::MAX,
        ))?;
        self.manager.set_default_backend(DEFAULT_BACKEND_ID)?;

        if let Some(cache_dir) = &self.config.cache_dir {
            self.manager.register_backend(BackendConfig::cache(
                CACHE_BACKEND_ID,
                cache_dir.clone(),
                self.config.cache_limit,
            ))?;
            self.manager.set_cache_backend(CACHE_BACKEND_ID)?;
        }
        if let Some(ephemeral_dir) = &self.config.ephemeral_dir {
            self.manager.register_backend(BackendConfig::ephemeral(
                EPHEMERAL_BACKEND_ID,
                ephemeral_dir.clone(),
                u64::MAX,
            ))?;
            self.manager.set_ephemeral_backend(EPHEMERAL_BACKEND_ID)?;
        }

        let scanned = self.manager.scan_all()?;
        log::info!(
            "Bootstrap complete: {} objects indexed ({scanned} from scan)",
            self.manager.status().total_objects
        );

        if self.config.cache_dir.is_some() {
            self.manager.start_caching(MaintenanceConfig {
                interval: self.config.maintenance_interval,
                ..MaintenanceConfig::default()
            })?;
        }
        Ok(())
    }

    /// Serve forever on the configured transport
    pub fn run(&self) -> ServerResult<()> {
        match self.config.transport {
            TransportKind::Unix => {
                let listener = TransportListener::bind_unix(&self.config.socket_path)?;
                self.accept_loop(listener)
            }
            TransportKind::Tcp => {
                let listener = TransportListener::bind_tcp(&self.config.host, self.config.port)?;
                self.accept_loop(listener)
            }
            TransportKind::Udp => {
                let socket =
                    DatagramTransport::bind((self.config.host.as_str(), self.config.port))?;
                self.datagram_loop(&socket)
            }
        }
    }

    fn accept_loop(&self, listener: TransportListener) -> ServerResult<()> {
        loop {
            let mut transport = match listener.accept() {
                Ok(transport) => transport,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    continue;
                }
            };

            let active = self.active_sessions.load(Ordering::Acquire);
            if active >= self.config.max_connections {
                log::warn!(
                    "Connection limit reached ({active}/{}), refusing {}",
                    self.config.max_connections,
                    transport.peer()
                );
                let refusal = V1ResponseHeader {
                    status: Status::Unavailable,
                    content_len: 0,
                    metadata: delivery::error_metadata("connection limit reached"),
                };
                let _ = refusal.write_to(&mut transport);
                let _ = transport.shutdown();
                continue;
            }

            let manager = Arc::clone(&self.manager);
            let session_config = self.session_config.clone();
            let counter = Arc::clone(&self.active_sessions);
            counter.fetch_add(1, Ordering::AcqRel);

            let spawned = std::thread::Builder::new()
                .name("objmapper-session".into())
                .spawn(move || {
                    let session = Session::new(transport, manager, session_config);
                    session.run();
                    counter.fetch_sub(1, Ordering::AcqRel);
                });
            if let Err(e) = spawned {
                self.active_sessions.fetch_sub(1, Ordering::AcqRel);
                log::error!("Spawning session worker failed: {e}");
            }
        }
    }

    /// Shared datagram worker: each packet is one V1 request. Descriptor
    /// passing and splice are meaningless here and are rejected.
    fn datagram_loop(&self, socket: &DatagramTransport) -> ServerResult<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = match socket.recv(&mut buf) {
                Ok(received) => received,
                Err(e) => {
                    log::warn!("Datagram receive failed: {e}");
                    continue;
                }
            };
            let reply = self.serve_datagram(&buf[..len]);
            if let Err(e) = socket.send_to(&reply, peer) {
                log::warn!("Datagram reply to {peer} failed: {e}");
            }
        }
    }

    fn serve_datagram(&self, packet: &[u8]) -> Vec<u8> {
        let Some((&mode_byte, rest)) = packet.split_first() else {
            return error_datagram(Status::ProtocolError, "empty datagram");
        };
        let uri = match crate::protocol::v1::read_uri(&mut Cursor::new(rest)) {
            Ok(uri) => uri,
            Err(e) => return error_datagram(Status::ProtocolError, &e.to_string()),
        };

        // Descriptor passing and splice have no meaning across datagrams.
        if !matches!(DeliveryMode::from_u8(mode_byte), Ok(DeliveryMode::Copy)) {
            return error_datagram(
                Status::InvalidMode,
                "datagram transport only supports copy delivery",
            );
        }
        if uri.len() > crate::protocol::MAX_URI_LEN {
            return error_datagram(Status::UriTooLong, "URI too long");
        }

        let fd_ref = match self.manager.get_object(&uri) {
            Ok(fd_ref) => fd_ref,
            Err(BackendError::NotFound(uri)) => {
                return error_datagram(Status::NotFound, &format!("no object at {uri}"));
            }
            Err(e) => return error_datagram(Status::StorageError, &e.to_string()),
        };

        let entry = fd_ref.entry();
        let metadata = match delivery::entry_metadata(entry) {
            Ok(metadata) => metadata,
            Err(e) => return error_datagram(Status::InternalError, &e.to_string()),
        };
        let size = entry.size();
        let header = V1ResponseHeader {
            status: Status::Ok,
            content_len: size,
            metadata,
        };
        let header_bytes = match header.encode() {
            Ok(bytes) => bytes,
            Err(e) => return error_datagram(Status::InternalError, &e.to_string()),
        };
        if header_bytes.len() as u64 + size > MAX_DATAGRAM as u64 {
            return error_datagram(
                Status::InvalidRequest,
                "object does not fit a single datagram",
            );
        }

        let mut reply = header_bytes;
        let mut offset = reply.len();
        reply.resize(offset + size as usize, 0);
        let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd_ref.raw_fd()) };
        let mut read_at = 0u64;
        while read_at < size {
            match nix::sys::uio::pread(fd, &mut reply[offset..], read_at as nix::libc::off_t) {
                Ok(0) => break,
                Ok(n) => {
                    offset += n;
                    read_at += n as u64;
                }
                Err(e) => {
                    return error_datagram(Status::StorageError, &format!("read failed: {e}"));
                }
            }
        }
        reply.truncate(offset);
        reply
    }
}

fn error_datagram(status: Status, message: &str) -> Vec<u8> {
    let header = V1ResponseHeader {
        status,
        content_len: 0,
        metadata: delivery::error_metadata(message),
    };
    header.encode().unwrap_or_else(|_| vec![status as u8])
}
