use std::path::PathBuf;

use bitswarm::{
    client::Client,
    config::Config,
    error::Error,
    metainfo::{Info, MetaInfo},
    storage::FileStorage,
    utils::to_human_readable,
};
use clap::{error::ErrorKind, CommandFactory, Parser, Subcommand};
use time::format_description::well_known::Rfc3339;
use tracing::{info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{time::UtcTime, writer::BoxMakeWriter},
    FmtSubscriber,
};

/// CLI flags of the daemon. These values take preference over the values
/// of the config file and of the environment.
#[derive(Parser, Debug)]
#[clap(name = "bitswarmd")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// The .torrent file to download and seed.
    #[clap(short, long)]
    torrent: Option<PathBuf>,

    /// The directory in which the content is stored.
    #[clap(short, long)]
    download_dir: Option<PathBuf>,

    /// Port of the listener for inbound peer connections.
    #[clap(short, long)]
    listen_port: Option<u16>,

    /// Write the logs to this file instead of stdout.
    #[clap(long)]
    log_file: Option<PathBuf>,

    /// Log every message exchanged with peers.
    #[clap(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a .torrent file for a local file or directory.
    Create {
        path: PathBuf,

        /// Announce url of the tracker, leave it out for a trackerless
        /// torrent.
        #[clap(short, long, default_value = "")]
        announce: String,

        #[clap(short, long, default_value_t = 256 * 1024)]
        piece_length: u32,

        /// Defaults to `<name>.torrent` in the current directory.
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_logs(args: &Args) -> Result<Option<WorkerGuard>, Error> {
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };

    let (writer, guard) = match &args.log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let dir = dir.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
            let file = path.file_name().ok_or(Error::PathInvalid)?;
            let appender = tracing_appender::rolling::never(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_timer(UtcTime::new(Rfc3339))
        .with_target(false)
        .with_ansi(args.log_file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    Ok(guard)
}

fn create(
    path: PathBuf,
    announce: String,
    piece_length: u32,
    output: Option<PathBuf>,
) -> Result<(), Error> {
    let info = Info::from_path(&path, piece_length)?;
    let output =
        output.unwrap_or_else(|| PathBuf::from(format!("{}.torrent", info.name)));

    info!(
        "hashed {} in {} pieces",
        to_human_readable(info.total_size()),
        info.piece_count()
    );

    let metainfo = MetaInfo::new(announce, info)?;
    std::fs::write(&output, metainfo.to_bytes()?)?;

    info!("wrote {output:?}, info hash {}", metainfo.info_hash);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    let _guard = init_logs(&args)?;

    if let Some(Command::Create { path, announce, piece_length, output }) =
        args.command
    {
        return create(path, announce, piece_length, output);
    }

    let Some(torrent) = args.torrent else {
        Args::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "a --torrent file or a subcommand is required",
            )
            .exit();
    };

    let mut config = Config::load()?;
    if let Some(download_dir) = args.download_dir {
        config.download_dir = download_dir;
    }
    if let Some(listen_port) = args.listen_port {
        config.listen_port = listen_port;
    }

    let metainfo = MetaInfo::from_file(&torrent).await?;
    info!(
        "{} ({}), info hash {}",
        metainfo.info.name,
        to_human_readable(metainfo.info.total_size()),
        metainfo.info_hash
    );

    let storage =
        FileStorage::new(&config.download_dir, metainfo.info.file_layout());
    let (ctx, handle) = Client::new(config, metainfo, storage).start().await?;

    tokio::signal::ctrl_c().await?;

    if let Ok(stats) = ctx.stats().await {
        info!(
            "shutting down, uploaded {} downloaded {} left {}",
            to_human_readable(stats.uploaded),
            to_human_readable(stats.downloaded),
            to_human_readable(stats.left),
        );
    }
    ctx.stop();

    if let Ok(res) = handle.await {
        res?;
    }

    Ok(())
}
