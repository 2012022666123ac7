use {
    chrono::{DateTime, Local},
    std::fmt::Write,
    tnfs::fcall::{DirEntry, Stat},
};

/// Resolve `.` and `..` in a remote path, always yielding an absolute path
///
/// `..` at the root stays at the root.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }

    format!("/{}", parts.join("/"))
}

pub fn join(dir: &str, name: &str) -> String {
    match dir.trim_end_matches('/') {
        "" => format!("/{}", name),
        dir => format!("{}/{}", dir, name),
    }
}

/// Last component of a remote path, or `None` for the root
pub fn file_name(path: &str) -> Option<&str> {
    path.rsplit('/').find(|part| !part.is_empty())
}

/// Parse an octal permission string such as `644` or `0o755`
pub fn parse_mode(arg: &str) -> Result<u16, String> {
    let digits = arg.strip_prefix("0o").unwrap_or(arg);
    match u16::from_str_radix(digits, 8) {
        Ok(mode) if mode <= 0o7777 => Ok(mode),
        _ => Err(format!("{:?} is not an octal mode", arg)),
    }
}

pub fn format_time(secs: u32) -> String {
    match DateTime::from_timestamp(i64::from(secs), 0) {
        Some(utc) => utc.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
        None => secs.to_string(),
    }
}

/// `ls -l` style mode column, e.g. `drwxr-xr-x`
pub fn mode_string(stat: &Stat) -> String {
    let kind = if stat.is_dir() {
        'd'
    } else if stat.is_file() {
        '-'
    } else {
        '?'
    };

    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6, 3, 0] {
        let bits = (stat.mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// One line of a long listing
pub fn format_entry(entry: &DirEntry) -> String {
    let kind = if entry.is_dir() { 'd' } else { '-' };
    format!(
        "{} {:>10} {} {}",
        kind,
        entry.size,
        format_time(entry.mtime),
        entry.name
    )
}

pub fn format_stat(path: &str, stat: &Stat) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "  File: {}", path);
    let _ = writeln!(out, "  Size: {}", stat.size);
    let _ = writeln!(
        out,
        "  Mode: {} ({:04o})",
        mode_string(stat),
        stat.permissions()
    );
    match &stat.owner {
        Some(owner) => {
            let _ = writeln!(
                out,
                " Owner: {}/{} ({}/{})",
                owner.user, owner.group, stat.uid, stat.gid
            );
        }
        None => {
            let _ = writeln!(out, " Owner: {}/{}", stat.uid, stat.gid);
        }
    }
    let _ = writeln!(out, "Access: {}", format_time(stat.atime));
    let _ = writeln!(out, "Modify: {}", format_time(stat.mtime));
    let _ = write!(out, "Change: {}", format_time(stat.ctime));
    out
}
