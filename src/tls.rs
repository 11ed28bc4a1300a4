/*
 * Copyright (C) 2026 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! TLS over non-blocking sockets.
//!
//! [`TlsChannel`] drives a rustls engine by hand: ciphertext moves between
//! the socket and growable frame buffers, and the handshake is a loop over
//! [`HandshakeStatus`]. Packet processing during the handshake (where
//! certificate validation happens) is delegated to a [`TaskRunner`] so it
//! never runs on the thread multiplexing sockets.

use crate::core::buffer::FrameBuffer;
use crate::core::net::{wait_fd, Wait};
use crate::core::pool::{PoolError, TaskRunner};
use log::debug;
use mio::net::TcpStream;
use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{
    AlertDescription, Certificate, CertificateError, ClientConfig, ClientConnection,
    PrivateKey, RootCertStore, ServerConfig, ServerConnection, ServerName,
};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

// largest record plus header and expansion
pub const PACKET_BUFFER_SIZE: usize = 16_709;

// largest plaintext fragment
pub const APPLICATION_BUFFER_SIZE: usize = 16_384;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HandshakeStatus {
    NeedUnwrap,
    NeedWrap,
    NeedTask,
    Finished,
    NotHandshaking,
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Tls(#[from] rustls::Error),

    #[error("handshake timed out")]
    Timeout,

    #[error("peer closed during handshake")]
    Closed,

    #[error("delegated task failed: {0}")]
    Task(#[from] PoolError),

    #[error("failed to read {0:?}: {1}")]
    Load(PathBuf, io::Error),

    #[error("no private key found in {0:?}")]
    NoKey(PathBuf),

    #[error("no certificates found in {0:?}")]
    NoCerts(PathBuf),

    #[error("invalid server name: {0}")]
    InvalidName(String),
}

impl TlsError {
    // the peer presented no certificate, or one we do not trust. expected
    // on mutually authenticated ports and not worth more than a debug line
    pub fn is_unknown_client_cert(&self) -> bool {
        match self {
            Self::Tls(e) => matches!(
                e,
                rustls::Error::NoCertificatesPresented
                    | rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)
                    | rustls::Error::InvalidCertificate(CertificateError::BadEncoding)
                    | rustls::Error::AlertReceived(AlertDescription::UnknownCA)
                    | rustls::Error::AlertReceived(AlertDescription::CertificateUnknown)
                    | rustls::Error::AlertReceived(AlertDescription::BadCertificate)
                    | rustls::Error::AlertReceived(AlertDescription::CertificateRequired)
            ),
            _ => false,
        }
    }
}

// source of identity and trust material
pub trait IdentityProvider: Send + Sync {
    fn server_config(&self, client_auth: bool) -> Result<Arc<ServerConfig>, TlsError>;

    fn client_config(&self) -> Result<Arc<ClientConfig>, TlsError>;
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    match File::open(path) {
        Ok(f) => Ok(BufReader::new(f)),
        Err(e) => Err(TlsError::Load(path.to_path_buf(), e)),
    }
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .map_err(|e| TlsError::Load(path.to_path_buf(), e))?;

    if certs.is_empty() {
        return Err(TlsError::NoCerts(path.to_path_buf()));
    }

    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> Result<PrivateKey, TlsError> {
    let mut reader = open(path)?;

    loop {
        let item = rustls_pemfile::read_one(&mut reader)
            .map_err(|e| TlsError::Load(path.to_path_buf(), e))?;

        match item {
            Some(rustls_pemfile::Item::PKCS8Key(key))
            | Some(rustls_pemfile::Item::RSAKey(key))
            | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(PrivateKey(key)),
            Some(_) => {}
            None => return Err(TlsError::NoKey(path.to_path_buf())),
        }
    }
}

fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let ders: Vec<Vec<u8>> = load_certs(path)?.into_iter().map(|c| c.0).collect();

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(&ders);

    debug!("loaded {} trust anchors from {:?} ({} ignored)", added, path, ignored);

    Ok(roots)
}

// identity and trust read from PEM files
pub struct PemIdentity {
    cert_file: PathBuf,
    key_file: PathBuf,
    ca_file: PathBuf,
}

impl PemIdentity {
    pub fn new(cert_file: &Path, key_file: &Path, ca_file: &Path) -> Self {
        Self {
            cert_file: cert_file.to_path_buf(),
            key_file: key_file.to_path_buf(),
            ca_file: ca_file.to_path_buf(),
        }
    }
}

impl IdentityProvider for PemIdentity {
    fn server_config(&self, client_auth: bool) -> Result<Arc<ServerConfig>, TlsError> {
        let certs = load_certs(&self.cert_file)?;
        let key = load_key(&self.key_file)?;

        let builder = ServerConfig::builder().with_safe_defaults();

        let builder = if client_auth {
            let roots = load_roots(&self.ca_file)?;
            builder.with_client_cert_verifier(AllowAnyAuthenticatedClient::new(roots).boxed())
        } else {
            builder.with_no_client_auth()
        };

        Ok(Arc::new(builder.with_single_cert(certs, key)?))
    }

    fn client_config(&self) -> Result<Arc<ClientConfig>, TlsError> {
        let certs = load_certs(&self.cert_file)?;
        let key = load_key(&self.key_file)?;
        let roots = load_roots(&self.ca_file)?;

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)?;

        Ok(Arc::new(config))
    }
}

enum Engine {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl Engine {
    fn read_tls(&mut self, rd: &mut dyn Read) -> Result<usize, io::Error> {
        match self {
            Self::Server(c) => c.read_tls(rd),
            Self::Client(c) => c.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> Result<usize, io::Error> {
        match self {
            Self::Server(c) => c.write_tls(wr),
            Self::Client(c) => c.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<(), rustls::Error> {
        match self {
            Self::Server(c) => c.process_new_packets().map(|_| ()),
            Self::Client(c) => c.process_new_packets().map(|_| ()),
        }
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        match self {
            Self::Server(c) => c.reader().read(buf),
            Self::Client(c) => c.reader().read(buf),
        }
    }

    fn write_plaintext(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        match self {
            Self::Server(c) => c.writer().write(buf),
            Self::Client(c) => c.writer().write(buf),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Self::Server(c) => c.wants_write(),
            Self::Client(c) => c.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Self::Server(c) => c.is_handshaking(),
            Self::Client(c) => c.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Self::Server(c) => c.send_close_notify(),
            Self::Client(c) => c.send_close_notify(),
        }
    }
}

// creates server-side channels for one listening port
pub struct TlsAcceptor {
    config: Arc<ServerConfig>,
    tasks: Arc<TaskRunner>,
}

impl TlsAcceptor {
    pub fn new(config: Arc<ServerConfig>, tasks: Arc<TaskRunner>) -> Self {
        Self { config, tasks }
    }

    pub fn channel(&self, stream: TcpStream) -> Result<TlsChannel, TlsError> {
        let conn = ServerConnection::new(Arc::clone(&self.config))?;

        Ok(TlsChannel::new(
            stream,
            Engine::Server(conn),
            Arc::clone(&self.tasks),
        ))
    }
}

pub struct TlsConnector {
    config: Arc<ClientConfig>,
    server_name: ServerName,
    tasks: Arc<TaskRunner>,
}

impl TlsConnector {
    pub fn new(
        config: Arc<ClientConfig>,
        server_name: &str,
        tasks: Arc<TaskRunner>,
    ) -> Result<Self, TlsError> {
        let server_name = ServerName::try_from(server_name)
            .map_err(|_| TlsError::InvalidName(server_name.to_string()))?;

        Ok(Self {
            config,
            server_name,
            tasks,
        })
    }

    pub fn channel(&self, stream: TcpStream) -> Result<TlsChannel, TlsError> {
        let conn = ClientConnection::new(Arc::clone(&self.config), self.server_name.clone())?;

        Ok(TlsChannel::new(
            stream,
            Engine::Client(conn),
            Arc::clone(&self.tasks),
        ))
    }
}

enum Fill {
    Read,
    WouldBlock,
    Closed,
}

pub struct TlsChannel {
    stream: TcpStream,

    // None only while a delegated task holds the engine
    engine: Option<Engine>,

    net_in: FrameBuffer,
    net_out: FrameBuffer,
    app_in: FrameBuffer,
    unprocessed: bool,
    handshake_done: bool,
    eof: bool,
    tasks: Arc<TaskRunner>,
}

impl TlsChannel {
    fn new(stream: TcpStream, engine: Engine, tasks: Arc<TaskRunner>) -> Self {
        Self {
            stream,
            engine: Some(engine),
            net_in: FrameBuffer::new(PACKET_BUFFER_SIZE),
            net_out: FrameBuffer::new(PACKET_BUFFER_SIZE),
            app_in: FrameBuffer::new(APPLICATION_BUFFER_SIZE),
            unprocessed: false,
            handshake_done: false,
            eof: false,
            tasks,
        }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn buffer_sizes(&self) -> (usize, usize, usize) {
        (
            self.net_in.capacity(),
            self.net_out.capacity(),
            self.app_in.capacity(),
        )
    }

    fn engine(&mut self) -> Result<&mut Engine, io::Error> {
        match &mut self.engine {
            Some(e) => Ok(e),
            None => Err(io::Error::new(io::ErrorKind::Other, "tls engine unavailable")),
        }
    }

    pub fn handshake_status(&self) -> HandshakeStatus {
        let engine = match &self.engine {
            Some(e) => e,
            None => return HandshakeStatus::NeedTask,
        };

        if !self.net_out.is_empty() || engine.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.unprocessed {
            HandshakeStatus::NeedTask
        } else if engine.is_handshaking() {
            HandshakeStatus::NeedUnwrap
        } else if !self.handshake_done {
            HandshakeStatus::Finished
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    // drive the handshake to completion, waiting on the socket as needed
    pub fn handshake(&mut self, timeout: Duration) -> Result<(), TlsError> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.handshake_status() {
                HandshakeStatus::NeedWrap => {
                    self.wrap()?;
                    self.flush(Some(deadline))?;
                }
                HandshakeStatus::NeedTask => self.run_delegated_task()?,
                HandshakeStatus::NeedUnwrap => {
                    // use pending ciphertext before reading more
                    if self.net_in.is_empty() {
                        match self.fill(Some(deadline))? {
                            Fill::Read => {}
                            Fill::Closed => return Err(TlsError::Closed),
                            Fill::WouldBlock => return Err(TlsError::Timeout),
                        }
                    }

                    self.unwrap_pending()?;
                }
                HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => {
                    self.handshake_done = true;

                    return Ok(());
                }
            }
        }
    }

    // read from the socket into the ciphertext buffer, doubling it when it
    // has no room. with a deadline, waits for readability
    fn fill(&mut self, deadline: Option<Instant>) -> Result<Fill, TlsError> {
        loop {
            if self.net_in.write_avail() == 0 {
                self.net_in.grow();
            }

            match self.stream.read(self.net_in.write_buf()) {
                Ok(0) => return Ok(Fill::Closed),
                Ok(size) => {
                    self.net_in.write_commit(size);

                    return Ok(Fill::Read);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let deadline = match deadline {
                        Some(d) => d,
                        None => return Ok(Fill::WouldBlock),
                    };

                    let left = deadline.saturating_duration_since(Instant::now());

                    if left.is_zero()
                        || !wait_fd(self.stream.as_raw_fd(), Wait::Readable, Some(left))?
                    {
                        return Err(TlsError::Timeout);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // hand pending ciphertext to the engine
    fn unwrap_pending(&mut self) -> Result<(), TlsError> {
        while !self.net_in.is_empty() {
            let Self {
                engine, net_in, ..
            } = self;

            let engine = match engine {
                Some(e) => e,
                None => break,
            };

            let size = engine.read_tls(net_in)?;

            if size == 0 {
                break;
            }

            self.unprocessed = true;

            // the engine bounds how much unprocessed data it accepts
            if !self.net_in.is_empty() {
                self.process_inline()?;
            }
        }

        Ok(())
    }

    fn process_inline(&mut self) -> Result<(), TlsError> {
        let ret = self.engine()?.process_new_packets();
        self.unprocessed = false;

        self.after_process(ret)
    }

    fn run_delegated_task(&mut self) -> Result<(), TlsError> {
        let engine = match self.engine.take() {
            Some(e) => e,
            None => return Err(TlsError::Task(PoolError::TaskFailed)),
        };

        let (engine, ret) = self
            .tasks
            .execute(engine, |engine| engine.process_new_packets())?;

        self.engine = Some(engine);
        self.unprocessed = false;

        self.after_process(ret)
    }

    fn after_process(&mut self, ret: Result<(), rustls::Error>) -> Result<(), TlsError> {
        if let Err(e) = ret {
            // the engine may have queued an alert for the peer
            if self.wrap().is_ok() {
                let _ = self.flush(Some(Instant::now() + Duration::from_millis(100)));
            }

            return Err(e.into());
        }

        self.drain_plaintext()?;

        Ok(())
    }

    // move decrypted bytes out of the engine, doubling the plaintext buffer
    // when it has no room
    fn drain_plaintext(&mut self) -> Result<(), TlsError> {
        loop {
            if self.app_in.write_avail() == 0 {
                self.app_in.grow();
            }

            let Self { engine, app_in, .. } = self;

            let engine = match engine {
                Some(e) => e,
                None => return Ok(()),
            };

            match engine.read_plaintext(app_in.write_buf()) {
                Ok(0) => {
                    // close_notify
                    self.eof = true;

                    return Ok(());
                }
                Ok(size) => app_in.write_commit(size),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.eof = true;

                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // collect whatever the engine wants to send, doubling the ciphertext
    // buffer when it has no room
    fn wrap(&mut self) -> Result<(), TlsError> {
        loop {
            let Self {
                engine, net_out, ..
            } = self;

            let engine = match engine {
                Some(e) => e,
                None => return Ok(()),
            };

            if !engine.wants_write() {
                return Ok(());
            }

            if net_out.write_avail() == 0 {
                net_out.grow();
            }

            match engine.write_tls(net_out) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WriteZero => {
                    net_out.grow();
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // write pending ciphertext to the socket. with a deadline, waits for
    // writability, otherwise stops at the first would-block
    fn flush(&mut self, deadline: Option<Instant>) -> Result<bool, TlsError> {
        while !self.net_out.is_empty() {
            match self.stream.write(self.net_out.read_buf()) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(size) => self.net_out.read_commit(size),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let deadline = match deadline {
                        Some(d) => d,
                        None => return Ok(false),
                    };

                    let left = deadline.saturating_duration_since(Instant::now());

                    if left.is_zero()
                        || !wait_fd(self.stream.as_raw_fd(), Wait::Writable, Some(left))?
                    {
                        return Err(TlsError::Timeout);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(true)
    }

    // newly decrypted application bytes. None means the peer closed.
    // never blocks
    pub fn read(&mut self) -> Result<Option<Vec<u8>>, io::Error> {
        if !self.eof {
            loop {
                match self.fill(None).map_err(into_io)? {
                    Fill::Read => {
                        self.unwrap_pending().map_err(into_io)?;

                        if self.unprocessed {
                            self.process_inline().map_err(into_io)?;
                        }
                    }
                    Fill::WouldBlock => break,
                    Fill::Closed => {
                        self.eof = true;
                        break;
                    }
                }

                if self.eof {
                    break;
                }
            }

            // e.g. key updates or a close_notify reply
            self.wrap().map_err(into_io)?;
            self.flush(None).map_err(into_io)?;
        }

        if !self.app_in.is_empty() {
            return Ok(Some(self.app_in.take_all()));
        }

        if self.eof {
            return Ok(None);
        }

        Ok(Some(Vec::new()))
    }

    // encrypt and send all of data, waiting up to timeout for the socket
    pub fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), io::Error> {
        let deadline = Some(Instant::now() + timeout);

        let mut pos = 0;

        while pos < data.len() {
            let size = self.engine()?.write_plaintext(&data[pos..])?;

            pos += size;

            self.wrap().map_err(into_io)?;
            self.flush(deadline).map_err(into_io)?;
        }

        Ok(())
    }

    // encrypt what the engine accepts of data and send what the socket
    // takes, without waiting. nothing is accepted while earlier ciphertext
    // is still queued
    pub fn write_some(&mut self, data: &[u8]) -> Result<usize, io::Error> {
        if !self.flush(None).map_err(into_io)? {
            return Ok(0);
        }

        let size = self.engine()?.write_plaintext(data)?;

        self.wrap().map_err(into_io)?;
        self.flush(None).map_err(into_io)?;

        Ok(size)
    }

    pub fn flush_pending(&mut self) -> Result<bool, io::Error> {
        self.wrap().map_err(into_io)?;

        self.flush(None).map_err(into_io)
    }

    pub fn close(&mut self) {
        if let Some(engine) = &mut self.engine {
            engine.send_close_notify();
        }

        if self.wrap().is_ok() {
            let _ = self.flush(None);
        }
    }
}

impl AsRawFd for TlsChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

fn into_io(e: TlsError) -> io::Error {
    match e {
        TlsError::Io(e) => e,
        TlsError::Timeout => io::Error::from(io::ErrorKind::TimedOut),
        TlsError::Closed => io::Error::from(io::ErrorKind::UnexpectedEof),
        e => io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
    }
}
