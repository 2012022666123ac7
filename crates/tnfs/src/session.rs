//! TNFS client session.
//!
//! A [`Session`] owns one transport and at most one server session id. Every
//! operation is a single exchange: the request is stamped with the session id and
//! the current sequence number, sent, and the matching reply is awaited for at most
//! the configured timeout. Operations take `&mut self`, so a session never has more
//! than one request in flight.
//!
//! Each operation returns `Result<Outcome<T>>`. The outer `Result` carries local
//! faults (transport, malformed reply, wrong state); the inner [`Outcome`] is the
//! server's answer, where a nonzero status such as [`Status::EOF`] is an ordinary
//! value.
//!
//! ```no_run
//! use tnfs::{Config, Session};
//!
//! # async fn example() -> tnfs::Result<()> {
//! let mut session = Session::connect(&Config::parse("udp!localhost!16384")?).await?;
//! session.mount("/", "", "").await?.expect("mount refused");
//! for name in session.list_dir("/").await?.unwrap_or_default() {
//!     println!("{}", name);
//! }
//! session.umount().await?;
//! # Ok(())
//! # }
//! ```

use std::{io::Cursor, io::SeekFrom, time::Duration};

use {
    bytes::Bytes,
    log::{debug, warn},
    tokio::time::{Instant, timeout_at},
};

use crate::{
    error::{Error, Status},
    fcall::*,
    serialize::{Decodable, Header},
    transport::{Config, Connection, DEFAULT_TIMEOUT, Transport},
    utils::Result,
};

/// Bytes requested per `read_into` call by [`Session::get_file`]
pub const GET_CHUNK: usize = 4096;

/// Permissions given to files created by [`Session::put_file`]
pub const PUT_MODE: u16 = 0o600;

/// Pull the payload of the expected response variant out of a reply
macro_rules! reply_body {
    ($reply:expr, $variant:ident $({ $($field:ident),* })? => $value:expr) => {
        match $reply.outcome {
            Ok(Response::$variant $({ $($field),* })?) => Ok(Ok($value)),
            Ok(other) => Err(Error::OpcodeMismatch {
                expected: Opcode::$variant,
                found: Opcode::from(&other) as u8,
            }),
            Err(status) => Ok(Err(status)),
        }
    };
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Fresh,
    Mounted { conn_id: u16, version: Version },
    /// Terminal: a new session is needed to mount again
    Unmounted,
}

/// Server answer to a successful `Mount`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MountInfo {
    /// Session id assigned by the server
    pub conn_id: u16,
    pub version: Version,
    /// Minimum delay the server asks for between retransmissions
    pub retry_delay: Duration,
}

/// Parameters of an extended directory listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirQuery {
    /// Shell-style name pattern; empty matches everything
    pub pattern: String,
    pub dir_options: DirOptions,
    pub sort_options: SortOptions,
    pub max_results: u16,
    /// Entries per `ReadDirX`; 0 lets the server fill each reply
    pub batch: u8,
}

impl Default for DirQuery {
    fn default() -> DirQuery {
        DirQuery {
            pattern: String::new(),
            dir_options: DirOptions::empty(),
            sort_options: SortOptions::empty(),
            max_results: u16::MAX,
            batch: 0,
        }
    }
}

impl DirQuery {
    pub fn pattern(mut self, pattern: impl Into<String>) -> DirQuery {
        self.pattern = pattern.into();
        self
    }

    pub fn dir_options(mut self, options: DirOptions) -> DirQuery {
        self.dir_options = options;
        self
    }

    pub fn sort_options(mut self, options: SortOptions) -> DirQuery {
        self.sort_options = options;
        self
    }

    pub fn max_results(mut self, max: u16) -> DirQuery {
        self.max_results = max;
        self
    }

    pub fn batch(mut self, batch: u8) -> DirQuery {
        self.batch = batch;
        self
    }
}

/// One `ReadDirX` reply
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirBatch {
    pub entries: Vec<DirEntry>,
    pub status: DirStatus,
    pub position: u16,
}

impl DirBatch {
    pub fn is_eof(&self) -> bool {
        self.status.contains(DirStatus::EOF)
    }
}

/// Wrap a transport fault that cut a transfer short
fn interrupted(transferred: usize, e: Error) -> Error {
    match transferred {
        0 => e,
        _ => Error::Incomplete {
            transferred,
            source: Box::new(e),
        },
    }
}

/// A client session over a [`Transport`]
#[derive(Debug)]
pub struct Session<T = Connection> {
    transport: T,
    state: State,
    sequence: u8,
    timeout: Duration,
}

impl Session<Connection> {
    /// Open the transport described by `config`. The session still needs [`Session::mount`].
    pub async fn connect(config: &Config) -> Result<Session> {
        let transport = config.connect().await?;
        Ok(Session::new(transport, config.timeout))
    }
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, timeout: Duration) -> Session<T> {
        Session {
            transport,
            state: State::Fresh,
            sequence: 0,
            timeout,
        }
    }

    pub fn with_default_timeout(transport: T) -> Session<T> {
        Session::new(transport, DEFAULT_TIMEOUT)
    }

    /// Sequence number the next request will carry
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Session id assigned by the server, while mounted
    pub fn conn_id(&self) -> Option<u16> {
        self.mounted().ok().map(|(conn_id, _)| conn_id)
    }

    /// Negotiated protocol version, while mounted
    pub fn version(&self) -> Option<Version> {
        self.mounted().ok().map(|(_, version)| version)
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted().is_ok()
    }

    /// Forget the server session without telling the server
    ///
    /// For use after a transport failure the caller will not recover from. The
    /// server reaps the session and its handles on its own.
    pub fn abandon(&mut self) {
        if let State::Mounted { conn_id, .. } = self.state {
            warn!("abandoning session 0x{:04x}", conn_id);
        }
        self.state = State::Unmounted;
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    fn mounted(&self) -> Result<(u16, Version)> {
        match self.state {
            State::Mounted { conn_id, version } => Ok((conn_id, version)),
            _ => Err(Error::NotMounted),
        }
    }

    fn require(&self, opcode: Opcode) -> Result<()> {
        let (_, negotiated) = self.mounted()?;
        let required = opcode.min_version();
        if negotiated < required {
            return Err(Error::Unsupported {
                required,
                negotiated,
            });
        }
        Ok(())
    }

    /// Send one command and wait for its reply
    ///
    /// `Mount` is sent with session id 0; anything else needs a mounted session and
    /// fails with [`Error::NotMounted`] before touching the transport. The sequence
    /// number advances once a reply carrying it arrives, and only then. Replies
    /// carrying another sequence number are left over from earlier exchanges and
    /// are dropped.
    pub async fn exchange(&mut self, body: Command) -> Result<Reply> {
        let session = match body {
            Command::Mount { .. } => NO_SESSION,
            _ => self.mounted()?.0,
        };
        let request = Request {
            session,
            sequence: self.sequence,
            body,
        };
        let opcode = request.opcode();
        let frame = Bytes::from(request.to_bytes()?);

        debug!("\t→ {:?}", request);
        self.transport.send(frame).await?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let bytes = match timeout_at(deadline, self.transport.recv()).await {
                Ok(received) => received?,
                Err(_) => return Err(Error::Timeout(self.timeout)),
            };

            let header = match Header::decode(&mut Cursor::new(&bytes[..])) {
                Ok(header) => header,
                Err(e) => {
                    warn!("discarding {}-byte datagram: {}", bytes.len(), e);
                    continue;
                }
            };
            if header.sequence != request.sequence {
                warn!(
                    "discarding stale reply {} (waiting for {})",
                    header.sequence, request.sequence
                );
                continue;
            }

            self.sequence = self.sequence.wrapping_add(1);
            let reply = Reply::from_bytes_as(&bytes, opcode)?;
            debug!("\t← {:?}", reply);
            return Ok(reply);
        }
    }

    /*
     * Session
     */

    /// Mount `location`, requesting protocol 1.2
    ///
    /// A refused mount leaves the session unmounted and may be retried.
    pub async fn mount(
        &mut self,
        location: &str,
        user: &str,
        password: &str,
    ) -> Result<Outcome<MountInfo>> {
        match self.state {
            State::Fresh => {}
            State::Mounted { .. } => return Err(Error::AlreadyMounted),
            State::Unmounted => return Err(Error::SessionClosed),
        }

        let reply = self
            .exchange(Command::Mount {
                version: Version::CLIENT,
                location: location.to_owned(),
                user: user.to_owned(),
                password: password.to_owned(),
            })
            .await?;

        let conn_id = reply.session;
        let info: Outcome<MountInfo> = reply_body!(reply, Mount { version, retry_delay } => MountInfo {
            conn_id,
            version,
            retry_delay: Duration::from_millis(retry_delay.into()),
        })?;

        if let Ok(ref info) = info {
            self.state = State::Mounted {
                conn_id: info.conn_id,
                version: info.version,
            };
        }
        Ok(info)
    }

    /// End the session
    ///
    /// Any reply, successful or not, ends the session locally.
    pub async fn umount(&mut self) -> Result<Outcome<()>> {
        let reply = self.exchange(Command::Umount).await?;
        self.state = State::Unmounted;
        reply_body!(reply, Umount => ())
    }

    /*
     * Directories
     */

    pub async fn open_dir(&mut self, path: &str) -> Result<Outcome<DirHandle>> {
        let reply = self
            .exchange(Command::OpenDir {
                path: path.to_owned(),
            })
            .await?;
        reply_body!(reply, OpenDir { handle } => handle)
    }

    /// Next name of a basic listing; `Status::EOF` once exhausted
    pub async fn read_dir(&mut self, handle: DirHandle) -> Result<Outcome<String>> {
        let reply = self.exchange(Command::ReadDir { handle }).await?;
        reply_body!(reply, ReadDir { name } => name)
    }

    pub async fn close_dir(&mut self, handle: DirHandle) -> Result<Outcome<()>> {
        let reply = self.exchange(Command::CloseDir { handle }).await?;
        reply_body!(reply, CloseDir => ())
    }

    pub async fn mkdir(&mut self, path: &str) -> Result<Outcome<()>> {
        let reply = self
            .exchange(Command::MkDir {
                path: path.to_owned(),
            })
            .await?;
        reply_body!(reply, MkDir => ())
    }

    pub async fn rmdir(&mut self, path: &str) -> Result<Outcome<()>> {
        let reply = self
            .exchange(Command::RmDir {
                path: path.to_owned(),
            })
            .await?;
        reply_body!(reply, RmDir => ())
    }

    /// Open an extended listing, returning the handle and the number of matching entries
    ///
    /// Fails with [`Error::Unsupported`] without sending anything when the server
    /// negotiated a version older than 1.2.
    pub async fn open_dir_x(
        &mut self,
        path: &str,
        query: &DirQuery,
    ) -> Result<Outcome<(DirHandle, u16)>> {
        self.require(Opcode::OpenDirX)?;
        let reply = self
            .exchange(Command::OpenDirX {
                path: path.to_owned(),
                pattern: query.pattern.clone(),
                dir_options: query.dir_options,
                sort_options: query.sort_options,
                max_results: query.max_results,
            })
            .await?;
        reply_body!(reply, OpenDirX { handle, count } => (handle, count))
    }

    pub async fn read_dir_x(
        &mut self,
        handle: DirHandle,
        max_entries: u8,
    ) -> Result<Outcome<DirBatch>> {
        self.require(Opcode::ReadDirX)?;
        let reply = self
            .exchange(Command::ReadDirX {
                handle,
                max_entries,
            })
            .await?;
        reply_body!(reply, ReadDirX { status, position, entries } => DirBatch {
            entries,
            status,
            position,
        })
    }

    /*
     * Files
     */

    pub async fn open(
        &mut self,
        path: &str,
        flags: OpenFlags,
        mode: u16,
    ) -> Result<Outcome<FileHandle>> {
        let reply = self
            .exchange(Command::Open {
                path: path.to_owned(),
                flags,
                mode,
            })
            .await?;
        reply_body!(reply, Open { fd } => fd)
    }

    /// A single `Read` exchange of at most [`MAX_IO_SIZE`] bytes
    pub async fn read_block(&mut self, fd: FileHandle, size: u16) -> Result<Outcome<Vec<u8>>> {
        let reply = self.exchange(Command::Read { fd, size }).await?;
        reply_body!(reply, Read { data } => data.0)
    }

    /// A single `Write` exchange of at most [`MAX_IO_SIZE`] bytes, returning the
    /// number of bytes the server accepted
    pub async fn write_block(&mut self, fd: FileHandle, data: &[u8]) -> Result<Outcome<u16>> {
        let reply = self
            .exchange(Command::Write {
                fd,
                data: Data(data.to_vec()),
            })
            .await?;
        reply_body!(reply, Write { size } => size)
    }

    /// Read up to `size` bytes into `buf`, one block at a time
    ///
    /// Stops when `size` bytes have arrived, on a nonzero status, or when the
    /// server returns an empty block. A short block is not end of file; the loop
    /// asks for the rest. Returns the status that ended the loop: `SUCCESS` when
    /// everything was read, `EOF` for an empty block. On a transport fault `buf`
    /// keeps whatever arrived before it.
    pub async fn read_into(
        &mut self,
        fd: FileHandle,
        size: usize,
        buf: &mut Vec<u8>,
    ) -> Result<Status> {
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(MAX_IO_SIZE) as u16;
            match self.read_block(fd, want).await? {
                Ok(data) if data.is_empty() => return Ok(Status::EOF),
                Ok(data) => {
                    let taken = data.len().min(remaining);
                    buf.extend_from_slice(&data[..taken]);
                    remaining -= taken;
                }
                Err(status) => return Ok(status),
            }
        }
        Ok(Status::SUCCESS)
    }

    /// Read up to `size` bytes
    ///
    /// Any bytes read are returned even if a status ended the loop early; the
    /// status is only returned when nothing was read.
    pub async fn read(&mut self, fd: FileHandle, size: usize) -> Result<Outcome<Vec<u8>>> {
        let mut data = Vec::with_capacity(size.min(GET_CHUNK));
        let status = match self.read_into(fd, size, &mut data).await {
            Ok(status) => status,
            Err(e) => return Err(interrupted(data.len(), e)),
        };

        if data.is_empty() && !status.is_success() {
            return Ok(Err(status));
        }
        Ok(Ok(data))
    }

    /// Write all of `data`, one block at a time
    ///
    /// The cursor advances by what the server acknowledges, so a short write resends
    /// the remainder. A zero acknowledgement stops the loop. Returns the number of
    /// bytes acknowledged; a status is returned only when nothing was written.
    pub async fn write(&mut self, fd: FileHandle, data: &[u8]) -> Result<Outcome<usize>> {
        let mut written = 0;
        while written < data.len() {
            let end = data.len().min(written + MAX_IO_SIZE);
            match self.write_block(fd, &data[written..end]).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => written += (n as usize).min(end - written),
                Ok(Err(status)) if written == 0 => return Ok(Err(status)),
                Ok(Err(status)) => {
                    debug!("write to {} stopped after {} bytes: {}", fd, written, status);
                    break;
                }
                Err(e) => return Err(interrupted(written, e)),
            }
        }
        Ok(Ok(written))
    }

    pub async fn close(&mut self, fd: FileHandle) -> Result<Outcome<()>> {
        let reply = self.exchange(Command::Close { fd }).await?;
        reply_body!(reply, Close => ())
    }

    pub async fn stat(&mut self, path: &str) -> Result<Outcome<Stat>> {
        let reply = self
            .exchange(Command::Stat {
                path: path.to_owned(),
            })
            .await?;
        reply_body!(reply, Stat { stat } => stat)
    }

    /// Move the file cursor; the offset must fit in 32 bits
    pub async fn lseek(&mut self, fd: FileHandle, pos: SeekFrom) -> Result<Outcome<()>> {
        let (whence, offset) = Whence::from_seek(pos)?;
        let reply = self
            .exchange(Command::LSeek { fd, whence, offset })
            .await?;
        reply_body!(reply, LSeek => ())
    }

    pub async fn unlink(&mut self, path: &str) -> Result<Outcome<()>> {
        let reply = self
            .exchange(Command::Unlink {
                path: path.to_owned(),
            })
            .await?;
        reply_body!(reply, Unlink => ())
    }

    pub async fn chmod(&mut self, path: &str, mode: u16) -> Result<Outcome<()>> {
        let reply = self
            .exchange(Command::ChMod {
                path: path.to_owned(),
                mode,
            })
            .await?;
        reply_body!(reply, ChMod => ())
    }

    pub async fn rename(&mut self, source: &str, destination: &str) -> Result<Outcome<()>> {
        let reply = self
            .exchange(Command::Rename {
                source: source.to_owned(),
                destination: destination.to_owned(),
            })
            .await?;
        reply_body!(reply, Rename => ())
    }

    /*
     * Filesystem
     */

    /// Filesystem size in kilobytes
    pub async fn size(&mut self) -> Result<Outcome<u32>> {
        let reply = self.exchange(Command::Size).await?;
        reply_body!(reply, Size { size } => size)
    }

    /// Free space in kilobytes
    pub async fn free(&mut self) -> Result<Outcome<u32>> {
        let reply = self.exchange(Command::Free).await?;
        reply_body!(reply, Free { free } => free)
    }

    /*
     * Whole directories and files
     */

    /// Outcome of a loop over `path` that `status` stopped after `collected` items
    ///
    /// What was collected is kept; the status only surfaces when nothing was.
    fn stopped(path: &str, status: Status, collected: usize) -> Outcome<()> {
        if collected == 0 {
            return Err(status);
        }
        warn!("{}: stopped after {} items: {}", path, collected, status);
        Ok(())
    }

    /// Close `fd` once `result` is known. A failed close is only logged.
    async fn release_file<V>(
        &mut self,
        fd: FileHandle,
        result: Result<Outcome<V>>,
    ) -> Result<Outcome<V>> {
        match self.close(fd).await {
            Ok(Ok(())) => {}
            Ok(Err(status)) => warn!("close {}: {}", fd, status),
            Err(e) => warn!("close {}: {}", fd, e),
        }
        result
    }

    async fn release_dir<V>(
        &mut self,
        handle: DirHandle,
        result: Result<Outcome<V>>,
    ) -> Result<Outcome<V>> {
        match self.close_dir(handle).await {
            Ok(Ok(())) => {}
            Ok(Err(status)) => warn!("closedir {}: {}", handle, status),
            Err(e) => warn!("closedir {}: {}", handle, e),
        }
        result
    }

    /// Names in `path`, using the basic listing
    ///
    /// The handle is closed on every path out of the loop. A status other than
    /// `EOF` ends the listing early; the names read before it are returned.
    pub async fn list_dir(&mut self, path: &str) -> Result<Outcome<Vec<String>>> {
        let handle = match self.open_dir(path).await? {
            Ok(handle) => handle,
            Err(status) => return Ok(Err(status)),
        };

        let mut names = Vec::new();
        let result = loop {
            match self.read_dir(handle).await {
                Ok(Ok(name)) => names.push(name),
                Ok(Err(status)) if status.is_eof() => break Ok(Ok(())),
                Ok(Err(status)) => break Ok(Self::stopped(path, status, names.len())),
                Err(e) => break Err(e),
            }
        };

        let result = self.release_dir(handle, result).await;
        result.map(|outcome| outcome.map(|()| names))
    }

    /// Entries in `path`, using the extended listing
    ///
    /// Never returns more entries than the count announced by `OpenDirX`. Stops at
    /// that count, on an empty batch, or on a batch flagged as the last one. Like
    /// [`list_dir`](Session::list_dir), a failure status keeps the entries already read.
    pub async fn list_dir_x(
        &mut self,
        path: &str,
        query: &DirQuery,
    ) -> Result<Outcome<Vec<DirEntry>>> {
        let (handle, count) = match self.open_dir_x(path, query).await? {
            Ok(opened) => opened,
            Err(status) => return Ok(Err(status)),
        };

        let mut remaining = count as usize;
        let mut entries = Vec::with_capacity(remaining);
        let result = loop {
            if remaining == 0 {
                break Ok(Ok(()));
            }
            match self.read_dir_x(handle, query.batch).await {
                Ok(Ok(mut batch)) => {
                    if batch.entries.is_empty() {
                        break Ok(Ok(()));
                    }
                    batch.entries.truncate(remaining);
                    remaining -= batch.entries.len();
                    entries.append(&mut batch.entries);
                    if batch.is_eof() {
                        break Ok(Ok(()));
                    }
                }
                Ok(Err(status)) if status.is_eof() => break Ok(Ok(())),
                Ok(Err(status)) => break Ok(Self::stopped(path, status, entries.len())),
                Err(e) => break Err(e),
            }
        };

        let result = self.release_dir(handle, result).await;
        result.map(|outcome| outcome.map(|()| entries))
    }

    /// Whole content of `path`
    ///
    /// If the open is refused, its status is returned and nothing else is sent.
    /// Otherwise the file is read until end of file and always closed. A failure
    /// status part way through returns the bytes read so far, or the status if
    /// there are none.
    pub async fn get_file(&mut self, path: &str) -> Result<Outcome<Vec<u8>>> {
        let fd = match self.open(path, OpenFlags::RDONLY, 0).await? {
            Ok(fd) => fd,
            Err(status) => return Ok(Err(status)),
        };

        let mut data = Vec::new();
        let result = loop {
            match self.read_into(fd, GET_CHUNK, &mut data).await {
                Ok(status) if status.is_success() => continue,
                Ok(status) if status.is_eof() => break Ok(Ok(())),
                Ok(status) => break Ok(Self::stopped(path, status, data.len())),
                Err(e) => break Err(interrupted(data.len(), e)),
            }
        };

        let result = self.release_file(fd, result).await;
        result.map(|outcome| outcome.map(|()| data))
    }

    /// Replace `path` with `data`, creating it with mode 0600 if needed
    pub async fn put_file(&mut self, path: &str, data: &[u8]) -> Result<Outcome<usize>> {
        let flags = OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC;
        let fd = match self.open(path, flags, PUT_MODE).await? {
            Ok(fd) => fd,
            Err(status) => return Ok(Err(status)),
        };

        let result = self.write(fd, data).await;
        self.release_file(fd, result).await
    }
}
