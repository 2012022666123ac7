#![forbid(unsafe_code)]
//! Asynchronous TNFS client library for Rust.
//!
//! TNFS (Trivial Network File System) is a small file access protocol built for
//! 8-bit machines. Requests and replies are compact little-endian messages, one per
//! UDP datagram (TCP is supported as well). This crate provides the message codec,
//! a tokio-based session engine and whole-file/whole-directory conveniences on top.
//!
//! # Getting Started
//!
//! 1. Build a [`transport::Config`], e.g. with [`Config::parse`] from `"udp!host!16384"`
//! 2. Open a [`Session`] with [`Session::connect`] and [`Session::mount`] a path
//! 3. Call one method per protocol operation, then [`Session::umount`]
//!
//! # Example
//!
//! ```no_run
//! use tnfs::{Config, Session, OpenFlags};
//!
//! #[tokio::main]
//! async fn main() -> tnfs::Result<()> {
//!     let config = Config::parse("tnfs.example.org")?;
//!     let mut session = Session::connect(&config).await?;
//!
//!     if let Err(status) = session.mount("/", "", "").await? {
//!         eprintln!("mount refused: {}", status);
//!         return Ok(());
//!     }
//!
//!     match session.get_file("/readme.txt").await? {
//!         Ok(data) => println!("{}", String::from_utf8_lossy(&data)),
//!         Err(status) => eprintln!("get failed: {}", status),
//!     }
//!
//!     let fd = session
//!         .open("/notes.txt", OpenFlags::WRONLY | OpenFlags::CREAT, 0o644)
//!         .await?;
//!     if let Ok(fd) = fd {
//!         session.write(fd, b"hello").await?.ok();
//!         session.close(fd).await?.ok();
//!     }
//!
//!     session.umount().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Protocol Details
//!
//! ## Message Flow
//!
//! 1. **Mount**: the client sends `Mount` with session id 0; the server assigns a session id
//! 2. **Operations**: every later request carries that id and the next sequence number
//! 3. **Handles**: `Open`/`OpenDir` return small server-side handles, released by `Close`/`CloseDir`
//! 4. **Umount**: ends the session on the server
//!
//! ## Sequence numbers
//!
//! The 8-bit sequence number advances once per completed exchange and wraps at 256.
//! A request that got no reply may be resent with the same number; the server
//! uses it to recognise the retransmission.
//!
//! # Error Handling
//!
//! Operations return `Result<Outcome<T>>`:
//! - [`Error`] for local faults: transport errors and timeouts, malformed replies,
//!   and calls made in the wrong session state
//! - [`Outcome`] for the server's answer, with a nonzero [`Status`] as the `Err` side
//!
//! Common status codes:
//! - `ENOENT` - No such file or directory
//! - `EACCES` / `EPERM` - Permission denied
//! - `EOF` - End of file or of a directory listing
//! - `INVALID_HANDLE` - Unknown handle or session
//!
//! # Transport
//!
//! - **UDP**: `"udp!host!port"` or plain `"host[:port]"` (the default)
//! - **TCP**: `"tcp!host!port"`
//!
//! The default port is 16384.
pub mod error;
pub mod fcall;
pub mod serialize;
#[macro_use]
pub mod utils;
pub mod session;
pub mod transport;

pub use crate::error::{Error, Status};
pub use crate::fcall::*;
pub use crate::session::{DirBatch, DirQuery, MountInfo, Session};
pub use crate::transport::{Config, Connection, Protocol, Transport};
pub use crate::utils::Result;
