use crate::error;
use std::fmt::Write;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split an endpoint of the form `proto!host!port`
///
/// Returns `None` when the string has a different shape.
pub fn parse_proto(arg: &str) -> Option<(&str, &str, &str)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);
    if split.next().is_some() {
        return None;
    }

    Some((proto, addr, port))
}

/// Split `host[:port]`, accepting bracketed IPv6 literals such as `[::1]:16384`
pub fn split_host_port(arg: &str) -> Option<(&str, Option<&str>)> {
    if let Some(rest) = arg.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        return match tail {
            "" => Some((host, None)),
            _ => Some((host, Some(tail.strip_prefix(':')?))),
        };
    }

    match arg.rsplit_once(':') {
        // A bare IPv6 address has several colons and no port
        Some((host, _)) if host.contains(':') => Some((arg, None)),
        Some((host, port)) => Some((host, Some(port))),
        None => Some((arg, None)),
    }
}

/// Format `bytes` as a hex dump, 16 bytes per row with an ASCII column
///
/// At most `max` bytes are shown; a trailing line reports how many were left out.
pub fn dump_hex(bytes: &[u8], max: usize) -> String {
    let shown = &bytes[..bytes.len().min(max)];
    let mut out = String::with_capacity(shown.len() * 4 + 16);

    for (row, chunk) in shown.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", row * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{:02x} ", b);
                }
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }

    if bytes.len() > shown.len() {
        let _ = writeln!(out, "... {} more bytes", bytes.len() - shown.len());
    }
    out
}
