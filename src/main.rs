mod config;
mod data;
mod error;
mod fs;
mod handle_table;
mod scratch;
mod transfer;
mod util;

use clap::Parser;
use config::Options;
use fs::BucketFs;
use fuse3::MountOptions;
use fuse3::path::Session;
#[cfg(unix)]
use futures_util::future::poll_fn;
use std::path::PathBuf;
#[cfg(unix)]
use std::pin::Pin;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
#[cfg(unix)]
use tokio::sync::oneshot;
use transfer::LocalStore;

#[derive(Parser, Debug)]
#[command(name = "bucketfs-rs")]
#[command(about = "FUSE3 filesystem projecting an object store bucket with a paged local cache")]
struct Cli {
    /// Backing store, currently `local:<directory>`.
    #[arg(long)]
    backend: String,

    /// Mount point for the filesystem.
    mountpoint: PathBuf,

    /// In-memory cache budget in MiB.
    #[arg(long, default_value_t = config::DEFAULT_CACHE_SIZE_MB)]
    max_cache_size_mb: u64,

    /// Scratch directory for pages spilled out of memory.
    #[arg(long, default_value = config::DEFAULT_DISK_CACHE_DIR)]
    disk_cache_dir: PathBuf,

    /// Read-ahead granularity in bytes for miss downloads.
    #[arg(long, default_value_t = config::DEFAULT_PREFETCH_SIZE)]
    prefetch_size: usize,

    /// Fail writes on memory exhaustion instead of spilling to disk.
    #[arg(long, default_value_t = false)]
    no_disk_spill: bool,

    /// Persist chmod/chown/utimens into local metadata instead of
    /// treating them as no-ops.
    #[arg(long, default_value_t = false)]
    strict_meta: bool,

    /// Allow other users to access the mount (passes allow_other to FUSE).
    #[arg(long, default_value_t = false)]
    allow_other: bool,

    /// Permit mounting on a non-empty directory.
    #[arg(long, default_value_t = false)]
    nonempty: bool,
}

fn backend_from_spec(spec: &str) -> anyhow::Result<LocalStore> {
    match spec.split_once(':') {
        Some(("local", dir)) if !dir.is_empty() => Ok(LocalStore::new(dir)),
        _ => anyhow::bail!("unsupported backend spec {spec:?}, expected local:<directory>"),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let backend = backend_from_spec(&cli.backend)?;

    let options = Options {
        max_cache_size: cli.max_cache_size_mb * 1024 * 1024,
        disk_cache_dir: cli.disk_cache_dir,
        prefetch_size: cli.prefetch_size,
        allow_disk_spill: !cli.no_disk_spill,
        nullable_meta: !cli.strict_meta,
        ..Options::default()
    };

    let fs = BucketFs::new(options, backend)
        .map_err(|e| anyhow::anyhow!("failed to set up cache: {e}"))?;

    let mut mount_opts = MountOptions::default();
    mount_opts.fs_name("bucketfs-rs");
    mount_opts.allow_other(cli.allow_other);
    mount_opts.nonempty(cli.nonempty);

    let session = Session::new(mount_opts);
    let handle = session.mount(fs, cli.mountpoint).await?;

    #[cfg(unix)]
    {
        // Listen for termination signals and unmount cleanly before exiting.
        let (unmount_tx, unmount_rx) = oneshot::channel::<()>();

        let mut mount_task = tokio::spawn(async move {
            let mut handle = Some(handle);
            let mut handle_future = poll_fn(|cx| {
                let handle = handle.as_mut().expect("mount handle missing");
                Pin::new(handle).poll(cx)
            });

            let res = tokio::select! {
                res = &mut handle_future => res,
                _ = unmount_rx => {
                    let handle = handle.take().expect("mount handle missing");
                    handle.unmount().await
                }
            };

            res.map_err(anyhow::Error::from)
        });

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let signals = async {
            tokio::select! {
                _ = sigint.recv() => (),
                _ = sigterm.recv() => (),
            }
        };
        tokio::pin!(signals);

        let result = tokio::select! {
            res = &mut mount_task => res,
            _ = &mut signals => {
                let _ = unmount_tx.send(());
                mount_task.await
            }
        };

        result??;
    }

    #[cfg(not(unix))]
    {
        // Block until the filesystem is unmounted. This keeps the
        // process alive instead of exiting immediately after mount.
        handle.await?;
    }

    Ok(())
}
