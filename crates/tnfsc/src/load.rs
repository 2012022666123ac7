//! Load generator: many concurrent sessions walking the server's tree.
//!
//! Each worker task owns a pool of mounted sessions. Every iteration picks one
//! session at random, lists its current directory with the extended listing and
//! then takes a weighted random step: stat the root, descend into a subdirectory,
//! climb back up, or (most often) fetch a file and compare its length with the
//! size the listing announced.

use {
    crate::utils,
    futures::future::join_all,
    log::{error, info, warn},
    rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom},
    tnfs::{Config, Connection, DirEntry, DirQuery, Outcome, Session, Transport, io_err},
};

/// Options of the `load` subcommand
#[derive(Debug, Clone, clap::Args)]
pub struct LoadArgs {
    /// Number of worker tasks
    #[arg(short, long, default_value_t = 1)]
    pub threads: usize,

    /// Iterations per worker
    #[arg(short, long, default_value_t = 1000)]
    pub iterations: usize,

    /// Sessions per worker
    #[arg(short, long, default_value_t = 32)]
    pub connections: usize,
}

/// Credentials every session mounts with
#[derive(Debug, Clone)]
pub struct Mount {
    pub location: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    StatRoot,
    ChangeDir,
    ParentDir,
    OpenFile,
}

/// Working directory of one session, as path components below the mount
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Cwd(Vec<String>);

impl Cwd {
    fn path(&self) -> String {
        utils::normalize(&self.0.join("/"))
    }

    fn child(&self, name: &str) -> String {
        utils::join(&self.path(), name)
    }

    fn enter(&mut self, name: &str) {
        self.0.push(name.to_owned());
    }

    fn leave(&mut self) {
        self.0.pop();
    }

    fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

/// Steps available from a directory, with their weights
fn actions(cwd: &Cwd, dirs: &[DirEntry], files: &[DirEntry]) -> Vec<(Action, u32)> {
    let mut actions = vec![(Action::StatRoot, 5)];
    if !dirs.is_empty() {
        actions.push((Action::ChangeDir, 5));
    }
    if !cwd.is_root() {
        actions.push((Action::ParentDir, 5));
    }
    if !files.is_empty() {
        actions.push((Action::OpenFile, 90));
    }
    actions
}

struct Walker<T = Connection> {
    session: Session<T>,
    cwd: Cwd,
}

impl<T: Transport> Walker<T> {
    fn new(session: Session<T>) -> Walker<T> {
        Walker {
            session,
            cwd: Cwd::default(),
        }
    }
}

/// Counters reported by a worker
#[derive(Debug, Default, Clone, Copy)]
pub struct Summary {
    pub iterations: usize,
    pub files: usize,
    pub bytes: usize,
    /// Operations answered with an unexpected status
    pub failures: usize,
    /// Files whose length did not match their listing
    pub mismatches: usize,
}

/// Open and mount `count` sessions, adding each one to `walkers` as it mounts
async fn mount_all(
    config: &Config,
    mount: &Mount,
    count: usize,
    walkers: &mut Vec<Walker>,
) -> tnfs::Result<Outcome<()>> {
    for _ in 0..count {
        let mut session = Session::connect(config).await?;
        if let Err(status) = session
            .mount(&mount.location, &mount.user, &mount.password)
            .await?
        {
            return Ok(Err(status));
        }
        walkers.push(Walker::new(session));
    }
    Ok(Ok(()))
}

/// Unmount every walker that is still mounted
async fn unmount_all<T: Transport>(id: usize, walkers: &mut [Walker<T>]) {
    for walker in walkers.iter_mut().filter(|w| w.session.is_mounted()) {
        match walker.session.umount().await {
            Ok(Ok(())) => {}
            Ok(Err(status)) => warn!("task {}: umount failed: {}", id, status),
            Err(e) => warn!("task {}: umount failed: {}", id, e),
        }
    }
}

async fn walk<T: Transport>(
    id: usize,
    walkers: &mut [Walker<T>],
    iterations: usize,
) -> tnfs::Result<Summary> {
    let mut rng = StdRng::from_entropy();
    let mut summary = Summary::default();
    if walkers.is_empty() {
        return Ok(summary);
    }

    for i in 0..iterations {
        summary.iterations += 1;
        let n = rng.gen_range(0..walkers.len());
        let walker = &mut walkers[n];

        let dir = walker.cwd.path();
        let entries = match walker.session.list_dir_x(&dir, &DirQuery::default()).await? {
            Ok(entries) => entries,
            Err(status) => {
                warn!("task {}: listing {} failed: {}", id, dir, status);
                summary.failures += 1;
                continue;
            }
        };
        let (dirs, files): (Vec<DirEntry>, Vec<DirEntry>) =
            entries.into_iter().partition(DirEntry::is_dir);

        let choices = actions(&walker.cwd, &dirs, &files);
        let action = choices
            .choose_weighted(&mut rng, |choice| choice.1)
            .map(|choice| choice.0)
            .map_err(|e| io_err!(InvalidInput, e))?;
        if i % 100 == 0 {
            info!("task {}\titeration {}\taction {:?}", id, i, action);
        }

        match action {
            Action::StatRoot => {
                if let Err(status) = walker.session.stat("/").await? {
                    warn!("task {}: stat / failed: {}", id, status);
                    summary.failures += 1;
                }
            }
            Action::ChangeDir => {
                if let Some(dir) = dirs.choose(&mut rng) {
                    walker.cwd.enter(&dir.name);
                }
            }
            Action::ParentDir => walker.cwd.leave(),
            Action::OpenFile => {
                let Some(file) = files.choose(&mut rng) else {
                    continue;
                };
                let path = walker.cwd.child(&file.name);
                match walker.session.get_file(&path).await? {
                    Ok(body) => {
                        summary.files += 1;
                        summary.bytes += body.len();
                        if body.len() != file.size as usize {
                            error!(
                                "task {}: invalid size for {}: listed {}, read {}",
                                id,
                                path,
                                file.size,
                                body.len()
                            );
                            summary.mismatches += 1;
                        }
                    }
                    Err(status) => {
                        warn!("task {}: get {} failed: {}", id, path, status);
                        summary.failures += 1;
                    }
                }
            }
        }
    }

    Ok(summary)
}

/// Walk, then unmount every session whether or not the walk failed
async fn walk_and_unmount<T: Transport>(
    id: usize,
    walkers: &mut [Walker<T>],
    iterations: usize,
) -> tnfs::Result<Summary> {
    let result = walk(id, walkers, iterations).await;
    unmount_all(id, walkers).await;
    result
}

async fn worker(
    id: usize,
    config: Config,
    mount: Mount,
    args: LoadArgs,
) -> tnfs::Result<Outcome<Summary>> {
    let mut walkers = Vec::with_capacity(args.connections);
    match mount_all(&config, &mount, args.connections, &mut walkers).await {
        Ok(Ok(())) => walk_and_unmount(id, &mut walkers, args.iterations)
            .await
            .map(Ok),
        stopped => {
            unmount_all(id, &mut walkers).await;
            stopped.map(|outcome| outcome.map(|()| Summary::default()))
        }
    }
}

/// Run the load test and return the process exit code
pub async fn run(config: Config, mount: Mount, args: LoadArgs) -> tnfs::Result<i32> {
    info!(
        "load: {} tasks x {} sessions, {} iterations each, against {}",
        args.threads, args.connections, args.iterations, config
    );

    let tasks = (0..args.threads).map(|id| {
        tokio::spawn(worker(id, config.clone(), mount.clone(), args.clone()))
    });

    let mut total = Summary::default();
    let mut exit_code = 0;
    for (id, joined) in join_all(tasks).await.into_iter().enumerate() {
        match joined.map_err(|e| io_err!(Other, e))? {
            Ok(Ok(summary)) => {
                total.iterations += summary.iterations;
                total.files += summary.files;
                total.bytes += summary.bytes;
                total.failures += summary.failures;
                total.mismatches += summary.mismatches;
            }
            Ok(Err(status)) => {
                error!("task {}: mount refused: {}", id, status);
                exit_code = 1;
            }
            Err(e) => {
                error!("task {}: {}", id, e);
                exit_code = 1;
            }
        }
    }

    println!(
        "{} iterations, {} files ({} bytes), {} failures, {} size mismatches",
        total.iterations, total.files, total.bytes, total.failures, total.mismatches
    );
    if total.mismatches > 0 {
        exit_code = 1;
    }
    Ok(exit_code)
}
