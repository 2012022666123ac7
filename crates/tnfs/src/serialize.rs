//! Serialize/deserialize TNFS messages into/from binary.
//!
//! All integers are little-endian. Strings are UTF-8 followed by a single NUL byte.

use crate::error::{Error, Status, UNTERMINATED};
use crate::fcall::*;
use crate::utils::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{self, Cursor};
use std::mem;
use std::ops::Shl;

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_retain(decode!($buf))
    };
}

/// Map a short read onto `Error::Truncated`
fn truncated(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::Truncated,
        _ => Error::Io(e),
    }
}

fn read_exact<R: ReadBytesExt>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).map_err(truncated)?;
    Ok(buf)
}

/// Read the rest of a NUL-terminated string whose first byte is already consumed
fn read_cstr_from<R: ReadBytesExt>(r: &mut R, first: u8) -> Result<String> {
    let mut bytes = Vec::new();
    let mut byte = first;
    while byte != 0 {
        bytes.push(byte);
        byte = match r.read_u8() {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(Error::MalformedField(UNTERMINATED));
            }
            Err(e) => return Err(Error::Io(e)),
        };
    }
    String::from_utf8(bytes).map_err(|_| Error::MalformedField("invalid UTF-8 in string"))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, ?
pub struct SResult<T>(Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable + ?Sized>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }
}

impl<'a, T: Encodable + ?Sized, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable + ?Sized, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<W> SResult<Encoder<W>> {
    /// Total bytes written by the chain, or its first error
    fn written(self) -> Result<usize> {
        self.0.map(|enc| enc.bytes)
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for i32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_i32::<LittleEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for str {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.as_bytes().contains(&0) {
            return Err(Error::MalformedField("string contains a NUL byte"));
        }
        w.write_all(self.as_bytes())?;
        w.write_u8(0)?;
        Ok(self.len() + 1)
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.as_str().encode(w)
    }
}

impl Encodable for Version {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w) << &self.minor << &self.major).written()
    }
}

impl Encodable for FileHandle {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.0.encode(w)
    }
}

impl Encodable for DirHandle {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.0.encode(w)
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        if size > MAX_IO_SIZE {
            return Err(Error::OutOfRange {
                field: "data length",
                max: MAX_IO_SIZE as u64,
            });
        }
        let bytes = (size as u16).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl Encodable for Owner {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w) << &self.user << &self.group).written()
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let buf = Encoder::new(w)
            << &self.mode
            << &self.uid
            << &self.gid
            << &self.size
            << &self.atime
            << &self.mtime
            << &self.ctime;
        match self.owner {
            Some(ref owner) => (buf << owner).written(),
            None => buf.written(),
        }
    }
}

impl Encodable for DirEntry {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w)
            << &self.flags.bits()
            << &self.size
            << &self.mtime
            << &self.ctime
            << &self.name)
            .written()
    }
}

impl Encodable for Request {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let opcode = Opcode::from(&self.body);
        let buf = Encoder::new(w) << &self.session << &self.sequence << &(opcode as u8);

        let buf = match self.body {
            Command::Mount {
                ref version,
                ref location,
                ref user,
                ref password,
            } => buf << version << location << user << password,
            Command::Umount => buf,
            Command::OpenDir { ref path } => buf << path,
            Command::ReadDir { ref handle } => buf << handle,
            Command::CloseDir { ref handle } => buf << handle,
            Command::MkDir { ref path } => buf << path,
            Command::RmDir { ref path } => buf << path,
            Command::OpenDirX {
                ref path,
                ref pattern,
                ref dir_options,
                ref sort_options,
                ref max_results,
            } => {
                buf << &dir_options.bits()
                    << &sort_options.bits()
                    << max_results
                    << pattern
                    << path
            }
            Command::ReadDirX {
                ref handle,
                ref max_entries,
            } => buf << handle << max_entries,
            Command::Open {
                ref path,
                ref flags,
                ref mode,
            } => buf << &flags.bits() << mode << path,
            Command::Read { ref fd, ref size } => {
                if *size as usize > MAX_IO_SIZE {
                    return Err(Error::OutOfRange {
                        field: "read size",
                        max: MAX_IO_SIZE as u64,
                    });
                }
                buf << fd << size
            }
            Command::Write { ref fd, ref data } => buf << fd << data,
            Command::Close { ref fd } => buf << fd,
            Command::Stat { ref path } => buf << path,
            Command::LSeek {
                ref fd,
                ref whence,
                ref offset,
            } => buf << fd << &(*whence as u8) << offset,
            Command::Unlink { ref path } => buf << path,
            Command::ChMod { ref path, ref mode } => buf << mode << path,
            Command::Rename {
                ref source,
                ref destination,
            } => buf << source << destination,
            Command::Size => buf,
            Command::Free => buf,
        };

        buf.written()
    }
}

impl Encodable for Reply {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let body = match self.outcome {
            Ok(ref body) => {
                let opcode = Opcode::from(body);
                if opcode != self.opcode {
                    return Err(Error::OpcodeMismatch {
                        expected: self.opcode,
                        found: opcode as u8,
                    });
                }
                Some(body)
            }
            Err(Status::SUCCESS) => return Err(Error::MalformedField("success reply without payload")),
            Err(_) => None,
        };

        let buf = Encoder::new(w)
            << &self.session
            << &self.sequence
            << &(self.opcode as u8)
            << &self.status().code();

        // Failed replies end after the status byte
        let Some(body) = body else {
            return buf.written();
        };

        let buf = match *body {
            Response::Mount {
                ref version,
                ref retry_delay,
            } => buf << version << retry_delay,
            Response::Umount => buf,
            Response::OpenDir { ref handle } => buf << handle,
            Response::ReadDir { ref name } => buf << name,
            Response::CloseDir => buf,
            Response::MkDir => buf,
            Response::RmDir => buf,
            Response::OpenDirX {
                ref handle,
                ref count,
            } => buf << handle << count,
            Response::ReadDirX {
                ref status,
                ref position,
                ref entries,
            } => {
                let count = u8::try_from(entries.len()).map_err(|_| Error::OutOfRange {
                    field: "directory batch",
                    max: u8::MAX as u64,
                })?;
                entries.iter().fold(
                    buf << &count << &status.bits() << position,
                    |acc, e| acc << e,
                )
            }
            Response::Open { ref fd } => buf << fd,
            Response::Read { ref data } => buf << data,
            Response::Write { ref size } => buf << size,
            Response::Close => buf,
            Response::Stat { ref stat } => buf << stat,
            Response::LSeek => buf,
            Response::Unlink => buf,
            Response::ChMod => buf,
            Response::Rename => buf,
            Response::Size { ref size } => buf << size,
            Response::Free { ref free } => buf << free,
        };

        buf.written()
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8().map_err(truncated)
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>().map_err(truncated)
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>().map_err(truncated)
    }
}

impl Decodable for i32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_i32::<LittleEndian>().map_err(truncated)
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        match r.read_u8() {
            Ok(first) => read_cstr_from(r, first),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(Error::MalformedField(UNTERMINATED))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl Decodable for Version {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let minor = decode!(*r);
        let major = decode!(*r);
        Ok(Version { major, minor })
    }
}

impl Decodable for FileHandle {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(FileHandle(decode!(*r)))
    }
}

impl Decodable for DirHandle {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(DirHandle(decode!(*r)))
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl Decodable for Option<Owner> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        // Older servers end the Stat reply before the owner names
        let first = match r.read_u8() {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        Ok(Some(Owner {
            user: read_cstr_from(r, first)?,
            group: Decodable::decode(r)?,
        }))
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Stat {
            mode: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            size: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            ctime: Decodable::decode(r)?,
            owner: Decodable::decode(r)?,
        })
    }
}

impl Decodable for DirEntry {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(DirEntry {
            flags: decode!(DirEntryFlags, *r),
            size: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            ctime: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
        })
    }
}

/// Fixed part shared by requests and replies
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub session: u16,
    pub sequence: u8,
    /// Raw opcode byte, not yet validated
    pub opcode: u8,
}

impl Decodable for Header {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Header {
            session: Decodable::decode(r)?,
            sequence: Decodable::decode(r)?,
            opcode: Decodable::decode(r)?,
        })
    }
}

impl Header {
    /// The opcode, if it is one this client knows
    pub fn opcode(&self) -> Result<Opcode> {
        Opcode::from_u8(self.opcode).ok_or(Error::UnknownOpcode(self.opcode))
    }

    /// Fail with `OpcodeMismatch` unless the header carries `expected`
    pub fn expect(&self, expected: Opcode) -> Result<Opcode> {
        if self.opcode != expected as u8 {
            return Err(Error::OpcodeMismatch {
                expected,
                found: self.opcode,
            });
        }
        Ok(expected)
    }
}

fn decode_command<R: ReadBytesExt>(opcode: Opcode, r: &mut R) -> Result<Command> {
    let mut buf = r;

    Ok(match opcode {
        Opcode::Mount => Command::Mount {
            version: decode!(buf),
            location: decode!(buf),
            user: decode!(buf),
            password: decode!(buf),
        },
        Opcode::Umount => Command::Umount,
        Opcode::OpenDir => Command::OpenDir { path: decode!(buf) },
        Opcode::ReadDir => Command::ReadDir {
            handle: decode!(buf),
        },
        Opcode::CloseDir => Command::CloseDir {
            handle: decode!(buf),
        },
        Opcode::MkDir => Command::MkDir { path: decode!(buf) },
        Opcode::RmDir => Command::RmDir { path: decode!(buf) },
        Opcode::OpenDirX => {
            let dir_options = decode!(DirOptions, buf);
            let sort_options = decode!(SortOptions, buf);
            let max_results = decode!(buf);
            let pattern = decode!(buf);
            Command::OpenDirX {
                path: decode!(buf),
                pattern,
                dir_options,
                sort_options,
                max_results,
            }
        }
        Opcode::ReadDirX => Command::ReadDirX {
            handle: decode!(buf),
            max_entries: decode!(buf),
        },
        Opcode::Open => {
            let flags = decode!(OpenFlags, buf);
            let mode = decode!(buf);
            Command::Open {
                path: decode!(buf),
                flags,
                mode,
            }
        }
        Opcode::Read => Command::Read {
            fd: decode!(buf),
            size: decode!(buf),
        },
        Opcode::Write => Command::Write {
            fd: decode!(buf),
            data: decode!(buf),
        },
        Opcode::Close => Command::Close { fd: decode!(buf) },
        Opcode::Stat => Command::Stat { path: decode!(buf) },
        Opcode::LSeek => {
            let fd = decode!(buf);
            let whence: u8 = decode!(buf);
            Command::LSeek {
                fd,
                whence: Whence::from_u8(whence).ok_or(Error::MalformedField("seek whence"))?,
                offset: decode!(buf),
            }
        }
        Opcode::Unlink => Command::Unlink { path: decode!(buf) },
        Opcode::ChMod => {
            let mode = decode!(buf);
            Command::ChMod {
                path: decode!(buf),
                mode,
            }
        }
        Opcode::Rename => Command::Rename {
            source: decode!(buf),
            destination: decode!(buf),
        },
        Opcode::Size => Command::Size,
        Opcode::Free => Command::Free,
    })
}

fn decode_response<R: ReadBytesExt>(opcode: Opcode, r: &mut R) -> Result<Response> {
    let mut buf = r;

    Ok(match opcode {
        Opcode::Mount => Response::Mount {
            version: decode!(buf),
            retry_delay: decode!(buf),
        },
        Opcode::Umount => Response::Umount,
        Opcode::OpenDir => Response::OpenDir {
            handle: decode!(buf),
        },
        Opcode::ReadDir => Response::ReadDir { name: decode!(buf) },
        Opcode::CloseDir => Response::CloseDir,
        Opcode::MkDir => Response::MkDir,
        Opcode::RmDir => Response::RmDir,
        Opcode::OpenDirX => Response::OpenDirX {
            handle: decode!(buf),
            count: decode!(buf),
        },
        Opcode::ReadDirX => {
            let count: u8 = decode!(buf);
            let status = decode!(DirStatus, buf);
            let position = decode!(buf);
            let mut entries: Vec<DirEntry> = Vec::with_capacity(count as usize);
            for _ in 0..count {
                entries.push(decode!(buf));
            }
            Response::ReadDirX {
                status,
                position,
                entries,
            }
        }
        Opcode::Open => Response::Open { fd: decode!(buf) },
        Opcode::Read => Response::Read { data: decode!(buf) },
        Opcode::Write => Response::Write { size: decode!(buf) },
        Opcode::Close => Response::Close,
        Opcode::Stat => Response::Stat { stat: decode!(buf) },
        Opcode::LSeek => Response::LSeek,
        Opcode::Unlink => Response::Unlink,
        Opcode::ChMod => Response::ChMod,
        Opcode::Rename => Response::Rename,
        Opcode::Size => Response::Size { size: decode!(buf) },
        Opcode::Free => Response::Free { free: decode!(buf) },
    })
}

fn decode_reply_body<R: ReadBytesExt>(header: Header, opcode: Opcode, r: &mut R) -> Result<Reply> {
    let status = Status(decode!(*r));
    if !status.is_success() {
        // Nothing after the status byte is guaranteed on failure
        return Ok(Reply::failed(header.session, header.sequence, opcode, status));
    }

    Ok(Reply {
        session: header.session,
        sequence: header.sequence,
        opcode,
        outcome: Ok(decode_response(opcode, r)?),
    })
}

impl Decodable for Request {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let header: Header = Decodable::decode(r)?;
        let opcode = header.opcode()?;
        Ok(Request {
            session: header.session,
            sequence: header.sequence,
            body: decode_command(opcode, r)?,
        })
    }
}

impl Decodable for Reply {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let header: Header = Decodable::decode(r)?;
        let opcode = header.opcode()?;
        decode_reply_body(header, opcode, r)
    }
}

impl Request {
    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + MAX_IO_SIZE);
        write_request(&mut buf, self)?;
        Ok(buf)
    }

    /// Decode any request
    pub fn from_bytes(bytes: &[u8]) -> Result<Request> {
        read_request(&mut Cursor::new(bytes))
    }

    /// Decode a request that must carry `expected`
    pub fn from_bytes_as(bytes: &[u8], expected: Opcode) -> Result<Request> {
        let mut r = Cursor::new(bytes);
        let header: Header = Decodable::decode(&mut r)?;
        let opcode = header.expect(expected)?;
        Ok(Request {
            session: header.session,
            sequence: header.sequence,
            body: decode_command(opcode, &mut r)?,
        })
    }
}

impl Reply {
    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(REPLY_HEADER_SIZE + MAX_IO_SIZE);
        write_reply(&mut buf, self)?;
        Ok(buf)
    }

    /// Decode any reply
    pub fn from_bytes(bytes: &[u8]) -> Result<Reply> {
        read_reply(&mut Cursor::new(bytes))
    }

    /// Decode a reply that must answer `expected`
    pub fn from_bytes_as(bytes: &[u8], expected: Opcode) -> Result<Reply> {
        let mut r = Cursor::new(bytes);
        let header: Header = Decodable::decode(&mut r)?;
        let opcode = header.expect(expected)?;
        decode_reply_body(header, opcode, &mut r)
    }
}

/// Length of the first complete reply in `bytes`, or `None` if more bytes are needed
///
/// Used to frame replies on a byte stream. A stream has no message boundary to
/// mark where a `Stat` reply without owner names ends, so such a reply counts as
/// incomplete until its owner strings have arrived.
pub fn reply_len(bytes: &[u8]) -> Result<Option<usize>> {
    let mut r = Cursor::new(bytes);
    match read_reply(&mut r) {
        Ok(Reply {
            outcome: Ok(Response::Stat { ref stat }),
            ..
        }) if stat.owner.is_none() => Ok(None),
        Ok(_) => Ok(Some(r.position() as usize)),
        Err(ref e) if e.is_incomplete() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Helper function to read a TNFS request from a byte-oriented stream
pub fn read_request<R: ReadBytesExt>(r: &mut R) -> Result<Request> {
    Decodable::decode(r)
}

/// Helper function to read a TNFS reply from a byte-oriented stream
pub fn read_reply<R: ReadBytesExt>(r: &mut R) -> Result<Reply> {
    Decodable::decode(r)
}

/// Helper function to write a TNFS request into a byte-oriented stream
pub fn write_request<W: WriteBytesExt>(w: &mut W, msg: &Request) -> Result<usize> {
    msg.encode(w)
}

/// Helper function to write a TNFS reply into a byte-oriented stream
pub fn write_reply<W: WriteBytesExt>(w: &mut W, msg: &Reply) -> Result<usize> {
    msg.encode(w)
}
