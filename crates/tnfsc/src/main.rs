use {
    clap::{Parser, Subcommand},
    std::{path::PathBuf, time::Duration},
    tnfs::{utils::dump_hex, *},
    tokio::fs,
};

mod load;
mod utils;
use crate::utils::*;

/// Bytes shown by `dump` unless `--max` says otherwise
const DUMP_DEFAULT: usize = 0xffff;

#[derive(Debug, clap::Parser)]
#[command(version, about = "Run one operation against a TNFS server")]
struct Cli {
    /// Server as host[:port] or proto!host!port
    /// where: proto = udp | tcp
    host: String,

    /// Server port, overriding the one in `host`
    #[arg(short, long)]
    port: Option<u16>,

    /// Use TCP instead of UDP
    #[arg(long, conflicts_with = "udp")]
    tcp: bool,

    /// Use UDP (the default)
    #[arg(long)]
    udp: bool,

    /// Seconds to wait for each reply
    #[arg(long, default_value_t = 15)]
    timeout: u64,

    /// Path to mount on the server
    #[arg(short, long, default_value = "/")]
    mount: String,

    #[arg(short, long, default_value = "", env = "TNFS_USER")]
    user: String,

    #[arg(long, default_value = "", env = "TNFS_PASSWORD", hide_env_values = true)]
    password: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,

        /// Long listing with sizes and times (extended listing)
        #[arg(short, long)]
        long: bool,

        /// Include hidden and special entries (extended listing)
        #[arg(short, long)]
        all: bool,

        /// Only list names matching a glob (extended listing)
        #[arg(short = 'P', long)]
        pattern: Option<String>,
    },
    /// Show file attributes
    Stat { path: String },
    /// Copy a remote file to a local one
    Get {
        remote: String,
        /// Defaults to the remote file name
        local: Option<PathBuf>,
    },
    /// Print a remote file
    Cat { path: String },
    /// Hex dump a remote file
    Dump {
        path: String,
        #[arg(long, default_value_t = DUMP_DEFAULT)]
        max: usize,
    },
    /// Copy a local file to the server
    Put {
        local: PathBuf,
        /// Defaults to the local file name in the root directory
        remote: Option<String>,
    },
    Mkdir { path: String },
    Rmdir { path: String },
    /// Remove a file
    Rm { path: String },
    /// Rename a file or directory
    Mv { source: String, destination: String },
    /// Change permission bits, e.g. `chmod 644 /a.txt`
    Chmod {
        #[arg(value_parser = parse_mode)]
        mode: u16,
        path: String,
    },
    /// Show filesystem size and free space
    Df,
    /// Drive many concurrent sessions through a random walk of the tree
    Load(load::LoadArgs),
}

impl Cli {
    fn config(&self) -> tnfs::Result<Config> {
        let mut config = Config::parse(&self.host)?.with_timeout(Duration::from_secs(self.timeout));
        if let Some(port) = self.port {
            config = config.with_port(port);
        }
        if self.tcp {
            config = config.with_protocol(Protocol::Tcp);
        } else if self.udp {
            config = config.with_protocol(Protocol::Udp);
        }
        Ok(config)
    }
}

async fn list(
    session: &mut Session,
    path: &str,
    long: bool,
    all: bool,
    pattern: Option<String>,
) -> tnfs::Result<Outcome<()>> {
    if !long && !all && pattern.is_none() {
        let mut names = match session.list_dir(path).await? {
            Ok(names) => names,
            Err(status) => return Ok(Err(status)),
        };
        names.sort();
        names
            .iter()
            .filter(|name| *name != "." && *name != "..")
            .for_each(|name| println!("{}", name));
        return Ok(Ok(()));
    }

    let mut query = DirQuery::default();
    if all {
        query = query.dir_options(DirOptions::NO_SKIPHIDDEN | DirOptions::NO_SKIPSPECIAL);
    }
    if let Some(pattern) = pattern {
        query = query.pattern(pattern);
    }

    let entries = match session.list_dir_x(path, &query).await? {
        Ok(entries) => entries,
        Err(status) => return Ok(Err(status)),
    };
    for entry in &entries {
        if long {
            println!("{}", format_entry(entry));
        } else {
            println!("{}", entry.name);
        }
    }
    Ok(Ok(()))
}

async fn run(session: &mut Session, command: Cmd) -> tnfs::Result<Outcome<()>> {
    Ok(match command {
        Cmd::Ls {
            path,
            long,
            all,
            pattern,
        } => return list(session, &normalize(&path), long, all, pattern).await,
        Cmd::Stat { path } => {
            let path = normalize(&path);
            session
                .stat(&path)
                .await?
                .map(|stat| println!("{}", format_stat(&path, &stat)))
        }
        Cmd::Get { remote, local } => {
            let remote = normalize(&remote);
            let local = match local {
                Some(local) => local,
                None => PathBuf::from(file_name(&remote).unwrap_or("tnfs.out")),
            };
            match session.get_file(&remote).await? {
                Ok(data) => {
                    fs::write(&local, &data).await?;
                    println!("{} -> {} ({} bytes)", remote, local.display(), data.len());
                    Ok(())
                }
                Err(status) => Err(status),
            }
        }
        Cmd::Cat { path } => session
            .get_file(&normalize(&path))
            .await?
            .map(|data| print!("{}", String::from_utf8_lossy(&data))),
        Cmd::Dump { path, max } => session
            .get_file(&normalize(&path))
            .await?
            .map(|data| print!("{}", dump_hex(&data, max))),
        Cmd::Put { local, remote } => {
            let data = fs::read(&local).await?;
            let remote = match remote {
                Some(remote) => normalize(&remote),
                None => {
                    let name = local
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .ok_or_else(|| io_err!(InvalidInput, "local path has no file name"))?;
                    join("/", &name)
                }
            };
            session.put_file(&remote, &data).await?.map(|written| {
                println!("{} -> {} ({} bytes)", local.display(), remote, written);
            })
        }
        Cmd::Mkdir { path } => session.mkdir(&normalize(&path)).await?,
        Cmd::Rmdir { path } => session.rmdir(&normalize(&path)).await?,
        Cmd::Rm { path } => session.unlink(&normalize(&path)).await?,
        Cmd::Mv {
            source,
            destination,
        } => {
            session
                .rename(&normalize(&source), &normalize(&destination))
                .await?
        }
        Cmd::Chmod { mode, path } => session.chmod(&normalize(&path), mode).await?,
        Cmd::Df => {
            let size = match session.size().await? {
                Ok(size) => size,
                Err(status) => return Ok(Err(status)),
            };
            session.free().await?.map(|free| {
                println!("{:>12} {:>12} {:>12}", "1K-blocks", "Used", "Available");
                println!("{:>12} {:>12} {:>12}", size, size.saturating_sub(free), free);
            })
        }
        Cmd::Load(_) => Ok(()),
    })
}

async fn tnfsc_main(cli: Cli) -> tnfs::Result<i32> {
    let config = cli.config()?;
    let Cli {
        mount,
        user,
        password,
        command,
        ..
    } = cli;

    if let Cmd::Load(args) = command {
        let mount = load::Mount {
            location: mount,
            user,
            password,
        };
        return load::run(config, mount, args).await;
    }

    let mut session = Session::connect(&config).await?;
    let info = match session.mount(&mount, &user, &password).await? {
        Ok(info) => info,
        Err(status) => {
            eprintln!("tnfsc: mount {} on {}: {}", mount, config, status);
            return Ok(1);
        }
    };
    log::info!(
        "mounted {} on {} (session 0x{:04x}, version {})",
        mount,
        config,
        info.conn_id,
        info.version
    );

    let outcome = run(&mut session, command).await;
    if let Err(status) = session.umount().await? {
        log::warn!("umount: {}", status);
    }

    match outcome? {
        Ok(()) => Ok(0),
        Err(status) => {
            eprintln!("tnfsc: {}", status);
            Ok(1)
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = tnfsc_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        -1
    });

    std::process::exit(exit_code);
}
