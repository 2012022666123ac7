//! In-process TNFS server backed by an in-memory tree, for end-to-end tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use tnfs::serialize::read_request;
use tnfs::*;

const MTIME: u32 = 1_700_000_000;
const CTIME: u32 = 1_600_000_000;
const CAPACITY_KB: u32 = 64 * 1024;
/// Entries per ReadDirX when the client leaves the batch size to the server
const SERVER_BATCH: usize = 8;

#[derive(Clone, Debug)]
enum Kind {
    Dir,
    File(Vec<u8>),
}

#[derive(Clone, Debug)]
struct Node {
    kind: Kind,
    mode: u16,
}

struct OpenFile {
    path: String,
    pos: usize,
    flags: OpenFlags,
}

enum Listing {
    Names(Vec<String>),
    Entries(Vec<DirEntry>),
}

struct OpenDir {
    listing: Listing,
    pos: usize,
}

#[derive(Default)]
struct ClientSession {
    files: HashMap<u8, OpenFile>,
    dirs: HashMap<u8, OpenDir>,
    next_handle: u8,
    /// Last reply, resent when the same sequence number arrives again
    last: Option<(u8, Reply)>,
}

impl ClientSession {
    fn handle(&mut self) -> u8 {
        self.next_handle = self.next_handle.wrapping_add(1);
        self.next_handle
    }
}

struct Server {
    tree: BTreeMap<String, Node>,
    sessions: HashMap<u16, ClientSession>,
    next_session: u16,
    log: Vec<Request>,
}

fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
    format!("/{}", parts.join("/"))
}

fn parent(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/".to_owned(),
        Some((dir, _)) => dir.to_owned(),
    }
}

fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `*` matches any run of characters; everything else matches itself
fn glob(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((head, tail)) => {
            name.starts_with(head)
                && (0..=name.len() - head.len())
                    .any(|i| glob(tail, &name[head.len() + i..]))
        }
    }
}

impl Server {
    fn new() -> Server {
        let mut tree = BTreeMap::new();
        tree.insert(
            "/".to_owned(),
            Node {
                kind: Kind::Dir,
                mode: 0o040755,
            },
        );
        Server {
            tree,
            sessions: HashMap::new(),
            next_session: 0x0100,
            log: Vec::new(),
        }
    }

    fn children(&self, dir: &str) -> Vec<(String, Node)> {
        self.tree
            .iter()
            .filter(|(path, _)| path.as_str() != "/" && parent(path) == dir)
            .map(|(path, node)| (name(path).to_owned(), node.clone()))
            .collect()
    }

    fn is_dir(&self, path: &str) -> bool {
        matches!(self.tree.get(path), Some(Node { kind: Kind::Dir, .. }))
    }

    fn reply(&mut self, req: Request) -> Reply {
        self.log.push(req.clone());
        let (session, sequence, opcode) = (req.session, req.sequence, req.opcode());

        if let Command::Mount { .. } = req.body {
            if session != 0 {
                return Reply::failed(session, sequence, opcode, Status::EINVAL);
            }
            self.next_session += 1;
            let id = self.next_session;
            self.sessions.insert(id, ClientSession::default());
            return Reply::ok(
                id,
                sequence,
                Response::Mount {
                    version: Version::new(1, 2),
                    retry_delay: 1000,
                },
            );
        }

        let Some(mut client) = self.sessions.remove(&session) else {
            return Reply::failed(session, sequence, opcode, Status::INVALID_HANDLE);
        };

        if let Some((last, ref reply)) = client.last {
            if last == sequence {
                let reply = reply.clone();
                self.sessions.insert(session, client);
                return reply;
            }
        }

        let outcome = self.execute(&mut client, req.body);
        let reply = Reply {
            session,
            sequence,
            opcode,
            outcome,
        };

        if opcode != Opcode::Umount {
            client.last = Some((sequence, reply.clone()));
            self.sessions.insert(session, client);
        }
        reply
    }

    fn execute(&mut self, client: &mut ClientSession, body: Command) -> Outcome<Response> {
        match body {
            Command::Mount { .. } => Err(Status::EINVAL),
            Command::Umount => Ok(Response::Umount),

            Command::OpenDir { path } => {
                let path = normalize(&path);
                if !self.is_dir(&path) {
                    return Err(Status::ENOENT);
                }
                let names = self.children(&path).into_iter().map(|(n, _)| n).collect();
                let handle = client.handle();
                client.dirs.insert(
                    handle,
                    OpenDir {
                        listing: Listing::Names(names),
                        pos: 0,
                    },
                );
                Ok(Response::OpenDir {
                    handle: DirHandle(handle),
                })
            }
            Command::ReadDir { handle } => {
                let dir = client.dirs.get_mut(&handle.0).ok_or(Status::EBADF)?;
                let Listing::Names(ref names) = dir.listing else {
                    return Err(Status::EBADF);
                };
                let name = names.get(dir.pos).cloned().ok_or(Status::EOF)?;
                dir.pos += 1;
                Ok(Response::ReadDir { name })
            }
            Command::CloseDir { handle } => client
                .dirs
                .remove(&handle.0)
                .map(|_| Response::CloseDir)
                .ok_or(Status::EBADF),
            Command::MkDir { path } => {
                let path = normalize(&path);
                if self.tree.contains_key(&path) {
                    return Err(Status::EEXIST);
                }
                if !self.is_dir(&parent(&path)) {
                    return Err(Status::ENOENT);
                }
                self.tree.insert(
                    path,
                    Node {
                        kind: Kind::Dir,
                        mode: 0o040755,
                    },
                );
                Ok(Response::MkDir)
            }
            Command::RmDir { path } => {
                let path = normalize(&path);
                if !self.is_dir(&path) {
                    return Err(Status::ENOTDIR);
                }
                if !self.children(&path).is_empty() {
                    return Err(Status::ENOTEMPTY);
                }
                self.tree.remove(&path);
                Ok(Response::RmDir)
            }
            Command::OpenDirX {
                path,
                pattern,
                dir_options,
                max_results,
                ..
            } => {
                let path = normalize(&path);
                if !self.is_dir(&path) {
                    return Err(Status::ENOENT);
                }
                let mut entries: Vec<DirEntry> = self
                    .children(&path)
                    .into_iter()
                    .filter(|(name, _)| {
                        dir_options.contains(DirOptions::NO_SKIPHIDDEN) || !name.starts_with('.')
                    })
                    .filter(|(name, node)| {
                        pattern.is_empty()
                            || (matches!(node.kind, Kind::Dir)
                                && !dir_options.contains(DirOptions::DIR_PATTERN))
                            || glob(&pattern, name)
                    })
                    .map(|(name, node)| {
                        let (flags, size) = match node.kind {
                            Kind::Dir => (DirEntryFlags::DIR, 0),
                            Kind::File(ref data) => (DirEntryFlags::empty(), data.len() as u32),
                        };
                        DirEntry {
                            flags,
                            size,
                            mtime: MTIME,
                            ctime: CTIME,
                            name,
                        }
                    })
                    .collect();
                if !dir_options.contains(DirOptions::NO_FOLDERSFIRST) {
                    entries.sort_by_key(|e| !e.is_dir());
                }
                entries.truncate(max_results as usize);

                let count = entries.len() as u16;
                let handle = client.handle();
                client.dirs.insert(
                    handle,
                    OpenDir {
                        listing: Listing::Entries(entries),
                        pos: 0,
                    },
                );
                Ok(Response::OpenDirX {
                    handle: DirHandle(handle),
                    count,
                })
            }
            Command::ReadDirX {
                handle,
                max_entries,
            } => {
                let dir = client.dirs.get_mut(&handle.0).ok_or(Status::EBADF)?;
                let Listing::Entries(ref entries) = dir.listing else {
                    return Err(Status::EBADF);
                };
                if dir.pos >= entries.len() {
                    return Err(Status::EOF);
                }
                let batch = match max_entries {
                    0 => SERVER_BATCH,
                    n => n as usize,
                };
                let end = entries.len().min(dir.pos + batch);
                let batch = entries[dir.pos..end].to_vec();
                dir.pos = end;
                let status = if end == entries.len() {
                    DirStatus::EOF
                } else {
                    DirStatus::empty()
                };
                Ok(Response::ReadDirX {
                    status,
                    position: end as u16,
                    entries: batch,
                })
            }

            Command::Open { path, flags, mode } => {
                let path = normalize(&path);
                match self.tree.get_mut(&path) {
                    Some(Node {
                        kind: Kind::Dir, ..
                    }) => return Err(Status::EISDIR),
                    Some(_) if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) => {
                        return Err(Status::EEXIST);
                    }
                    Some(Node {
                        kind: Kind::File(data),
                        ..
                    }) => {
                        if flags.contains(OpenFlags::TRUNC) && flags.is_writable() {
                            data.clear();
                        }
                    }
                    None if flags.contains(OpenFlags::CREAT) => {
                        if !self.is_dir(&parent(&path)) {
                            return Err(Status::ENOENT);
                        }
                        self.tree.insert(
                            path.clone(),
                            Node {
                                kind: Kind::File(Vec::new()),
                                mode: 0o100000 | (mode & 0o777),
                            },
                        );
                    }
                    None => return Err(Status::ENOENT),
                }
                let pos = match (flags.contains(OpenFlags::APPEND), self.tree.get(&path)) {
                    (
                        true,
                        Some(Node {
                            kind: Kind::File(data),
                            ..
                        }),
                    ) => data.len(),
                    _ => 0,
                };
                let handle = client.handle();
                client.files.insert(handle, OpenFile { path, pos, flags });
                Ok(Response::Open {
                    fd: FileHandle(handle),
                })
            }
            Command::Read { fd, size } => {
                let file = client.files.get_mut(&fd.0).ok_or(Status::EBADF)?;
                let Some(Node {
                    kind: Kind::File(data),
                    ..
                }) = self.tree.get(&file.path)
                else {
                    return Err(Status::ESTALE);
                };
                if file.pos >= data.len() {
                    return Err(Status::EOF);
                }
                let end = data.len().min(file.pos + size as usize);
                let chunk = data[file.pos..end].to_vec();
                file.pos = end;
                Ok(Response::Read { data: Data(chunk) })
            }
            Command::Write { fd, data } => {
                let file = client.files.get_mut(&fd.0).ok_or(Status::EBADF)?;
                if !file.flags.is_writable() {
                    return Err(Status::EBADF);
                }
                let Some(Node {
                    kind: Kind::File(content),
                    ..
                }) = self.tree.get_mut(&file.path)
                else {
                    return Err(Status::ESTALE);
                };
                let end = file.pos + data.0.len();
                if content.len() < end {
                    content.resize(end, 0);
                }
                content[file.pos..end].copy_from_slice(&data.0);
                file.pos = end;
                Ok(Response::Write {
                    size: data.0.len() as u16,
                })
            }
            Command::Close { fd } => client
                .files
                .remove(&fd.0)
                .map(|_| Response::Close)
                .ok_or(Status::EBADF),
            Command::Stat { path } => {
                let node = self.tree.get(&normalize(&path)).ok_or(Status::ENOENT)?;
                let size = match node.kind {
                    Kind::Dir => 0,
                    Kind::File(ref data) => data.len() as u32,
                };
                Ok(Response::Stat {
                    stat: Stat {
                        mode: node.mode,
                        uid: 1000,
                        gid: 1000,
                        size,
                        atime: MTIME,
                        mtime: MTIME,
                        ctime: CTIME,
                        owner: Some(Owner {
                            user: "tnfs".to_owned(),
                            group: "tnfs".to_owned(),
                        }),
                    },
                })
            }
            Command::LSeek { fd, whence, offset } => {
                let file = client.files.get_mut(&fd.0).ok_or(Status::EBADF)?;
                let len = match self.tree.get(&file.path) {
                    Some(Node {
                        kind: Kind::File(data),
                        ..
                    }) => data.len() as i64,
                    _ => return Err(Status::ESTALE),
                };
                let base = match whence {
                    Whence::Set => 0,
                    Whence::Cur => file.pos as i64,
                    Whence::End => len,
                };
                let pos = base + offset as i64;
                if pos < 0 {
                    return Err(Status::EINVAL);
                }
                file.pos = pos as usize;
                Ok(Response::LSeek)
            }
            Command::Unlink { path } => {
                let path = normalize(&path);
                match self.tree.get(&path) {
                    Some(Node {
                        kind: Kind::File(_),
                        ..
                    }) => {
                        self.tree.remove(&path);
                        Ok(Response::Unlink)
                    }
                    Some(_) => Err(Status::EISDIR),
                    None => Err(Status::ENOENT),
                }
            }
            Command::ChMod { path, mode } => {
                let node = self.tree.get_mut(&normalize(&path)).ok_or(Status::ENOENT)?;
                node.mode = (node.mode & !0o7777) | (mode & 0o7777);
                Ok(Response::ChMod)
            }
            Command::Rename {
                source,
                destination,
            } => {
                let (source, destination) = (normalize(&source), normalize(&destination));
                if !self.is_dir(&parent(&destination)) {
                    return Err(Status::ENOENT);
                }
                let node = self.tree.remove(&source).ok_or(Status::ENOENT)?;
                self.tree.insert(destination, node);
                Ok(Response::Rename)
            }

            Command::Size => Ok(Response::Size { size: CAPACITY_KB }),
            Command::Free => {
                let used: usize = self
                    .tree
                    .values()
                    .map(|node| match node.kind {
                        Kind::File(ref data) => data.len(),
                        Kind::Dir => 0,
                    })
                    .sum();
                Ok(Response::Free {
                    free: CAPACITY_KB - (used / 1024) as u32,
                })
            }
        }
    }
}

/// A running fixture server listening on UDP and TCP on 127.0.0.1
pub struct Fixture {
    udp: SocketAddr,
    tcp: SocketAddr,
    server: Arc<Mutex<Server>>,
}

impl Fixture {
    pub async fn start() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let server = Arc::new(Mutex::new(Server::new()));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp = socket.local_addr().unwrap();
        tokio::spawn(serve_udp(socket, server.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp = listener.local_addr().unwrap();
        tokio::spawn(serve_tcp(listener, server.clone()));

        Fixture { udp, tcp, server }
    }

    pub fn config(&self, protocol: Protocol) -> Config {
        let port = match protocol {
            Protocol::Udp => self.udp.port(),
            Protocol::Tcp => self.tcp.port(),
        };
        Config::new("127.0.0.1")
            .with_protocol(protocol)
            .with_port(port)
            .with_timeout(Duration::from_secs(2))
    }

    pub fn add_dir(&self, path: &str) {
        self.server.lock().unwrap().tree.insert(
            normalize(path),
            Node {
                kind: Kind::Dir,
                mode: 0o040755,
            },
        );
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.server.lock().unwrap().tree.insert(
            normalize(path),
            Node {
                kind: Kind::File(data.to_vec()),
                mode: 0o100644,
            },
        );
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.server.lock().unwrap().tree.get(&normalize(path)) {
            Some(Node {
                kind: Kind::File(data),
                ..
            }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.server
            .lock()
            .unwrap()
            .tree
            .contains_key(&normalize(path))
    }

    /// Opcodes of every request received so far, in order
    pub fn opcodes(&self) -> Vec<Opcode> {
        self.server
            .lock()
            .unwrap()
            .log
            .iter()
            .map(Request::opcode)
            .collect()
    }

    /// Number of sessions currently mounted
    pub fn sessions(&self) -> usize {
        self.server.lock().unwrap().sessions.len()
    }
}

async fn serve_udp(socket: UdpSocket, server: Arc<Mutex<Server>>) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let Ok(request) = Request::from_bytes(&buf[..len]) else {
            continue;
        };
        let reply = server.lock().unwrap().reply(request);
        let _ = socket.send_to(&reply.to_bytes().unwrap(), peer).await;
    }
}

async fn serve_tcp(listener: TcpListener, server: Arc<Mutex<Server>>) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(serve_stream(stream, server.clone()));
    }
}

async fn serve_stream(mut stream: TcpStream, server: Arc<Mutex<Server>>) {
    let mut buf = BytesMut::with_capacity(MAX_MESSAGE_SIZE);
    loop {
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        loop {
            let mut cursor = Cursor::new(&buf[..]);
            let request = match read_request(&mut cursor) {
                Ok(request) => request,
                Err(e) if e.is_incomplete() => break,
                Err(_) => return,
            };
            let consumed = cursor.position() as usize;
            let _ = buf.split_to(consumed);

            let reply = server.lock().unwrap().reply(request);
            if stream.write_all(&reply.to_bytes().unwrap()).await.is_err() {
                return;
            }
        }
    }
}
