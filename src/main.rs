use std::thread;

use chrono::DateTime;
use clap::Parser;
use color_eyre::{Result, eyre::Context};
use env_logger::Env;
use log::{debug, info};

mod archive;
mod config;
mod http;
mod run;
mod source;
mod telegram;
mod train;

use archive::{ARCHIVE_PATH, TrainArchive};
use config::CONFIG;
use run::{Horizon, RunOptions};
use telegram::{BotFlags, TelegramBot};
use train::ROME;

#[derive(Parser, Debug)]
#[command(about = "Telegram notification bot for Fondazione FS historic-train excursions")]
struct Cli {
    /// Don't send messages on Telegram, still update fingerprints
    #[arg(long)]
    dry_run: bool,
    /// Send silent messages
    #[arg(long)]
    silent: bool,
    /// Verbose train messages
    #[arg(long)]
    verbose: bool,
    /// Debug log level
    #[arg(long)]
    debug: bool,
    /// Force update of every train
    #[arg(long)]
    force_update: bool,
    /// Fake the execution time (RFC 3339)
    #[arg(long, value_name = "WHEN")]
    fake_now: Option<String>,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();
    if cli.debug {
        debug!("Showing debug log messages");
    }

    let fake_now = cli
        .fake_now
        .as_deref()
        .map(|raw| DateTime::parse_from_rfc3339(raw).map(|when| when.with_timezone(&ROME)))
        .transpose()
        .wrap_err("cannot parse fake execution time")?;

    let archive = TrainArchive::load_from_file(ARCHIVE_PATH)?;
    info!("Archive loaded, {} trains", archive.len());

    let bot = TelegramBot::new(
        &CONFIG,
        BotFlags {
            dry_run: cli.dry_run,
            silent: cli.silent,
            verbose: cli.verbose,
        },
    )?;
    info!("Telegram bot loaded");

    let opts = RunOptions {
        horizon: Horizon::from(&*CONFIG),
        force_update: cli.force_update,
        fake_now,
    };
    thread::spawn(move || run::run_forever(archive, bot, opts));

    actix_web::rt::System::new().block_on(http::serve(&CONFIG.http_listen_address))
}
