use std::sync::Arc;
use tlfs::catalog::{Catalog, MetadataStore};
use tlfs::cli::Cli;
use tlfs::command::SystemCommandRunner;
use tlfs::config::Config;
use tlfs::device::SystemDeviceIo;
use tlfs::error::{Result, TlfsError};
use tlfs::filesystem::FileSystemManager;
use tlfs::scheduler::LibraryManager;
use tlfs::tape_fs::TapeFs;
use tlfs::{logger, utils};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse_args();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging system
    logger::init(&config.log_level, args.verbose)?;

    debug!("tlfs starting with {}", args.config.display());

    match run(args, config).await {
        Ok(_) => {
            info!("Unmounted cleanly");
            Ok(())
        }
        Err(e) => {
            error!("Operation failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Cli, config: Config) -> Result<()> {
    if args.init {
        Catalog::initialise(&config.catalog_path, args.force)?;
        info!("Created catalog {}", config.catalog_path.display());
        return Ok(());
    }

    config.validate()?;
    let store: Arc<dyn MetadataStore> = Arc::new(Catalog::open(&config.catalog_path)?);

    let library = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || {
            LibraryManager::start(
                store,
                Arc::new(SystemCommandRunner::new()),
                Arc::new(SystemDeviceIo::new()),
                &config,
            )
        })
        .await
        .map_err(|e| TlfsError::Generic(e.into()))??
    };
    let scheduler = library.spawn()?;

    let fs = TapeFs::new(Arc::new(FileSystemManager::new(library.clone())));
    match fs.statfs() {
        Ok(stat) => info!(
            "Serving {} at {}: {} total, {} available",
            config.catalog_path.display(),
            config.mountpoint,
            utils::format_bytes(stat.blocks * stat.bsize),
            utils::format_bytes(stat.bavail * stat.bsize)
        ),
        Err(code) => warn!("Capacity query failed with errno {}", code),
    }

    let scheduler = tokio::task::spawn_blocking(move || scheduler.join());
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted, stopping the scheduler");
            library.request_stop();
        }
        finished = scheduler => {
            library.request_stop();
            return match finished {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(TlfsError::Generic(anyhow::anyhow!("scheduler thread panicked"))),
                Err(e) => Err(TlfsError::Generic(e.into())),
            };
        }
    }

    match library.fatal_error() {
        Some(reason) => Err(TlfsError::Generic(anyhow::anyhow!(reason))),
        None => Ok(()),
    }
}
