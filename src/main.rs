use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use spin_cycle::{
    cycle_store::DEFAULT_STATE_FILE,
    remote::DEFAULT_API_URL,
};
use std::path::{
    Path,
    PathBuf,
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};

mod client;
mod ui;

const DEFAULT_LOG_DIR: &str = "~/.spin-cycle/logs";

fn print_usage_and_exit() -> ! {
    println!(
        "Usage: spin-cycle --user <id> [--api-url <url>] [--state-file <path>]\n\
         [--log-dir <path>] [--balance <points>]\n\
         \n\
         Flags:\n\
           --user <id>          Player id sent with every request (required)\n\
           --api-url <url>      Base URL of the game API (default {})\n\
           --state-file <path>  Where the last cycle boundary is kept (default {})\n\
           --log-dir <path>     Directory for daily log files (default {})\n\
           --balance <points>   Starting balance until the dashboard reports one",
        DEFAULT_API_URL, DEFAULT_STATE_FILE, DEFAULT_LOG_DIR,
    );
    std::process::exit(0);
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

fn parse_cli_args() -> Result<client::AppConfig> {
    let mut args = std::env::args().skip(1);
    let mut api_url: Option<String> = None;
    let mut user_id: Option<String> = None;
    let mut state_file: Option<String> = None;
    let mut log_dir: Option<String> = None;
    let mut balance: Option<u64> = None;

    fn set_once(slot: &mut Option<String>, flag: &str, value: Option<String>) -> Result<()> {
        let value = value.ok_or_else(|| eyre!("{flag} requires an argument"))?;
        if slot.is_some() {
            return Err(eyre!("{flag} may only be specified once"));
        }
        *slot = Some(value);
        Ok(())
    }

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--api-url" => set_once(&mut api_url, "--api-url", args.next())?,
            "--user" => set_once(&mut user_id, "--user", args.next())?,
            "--state-file" => set_once(&mut state_file, "--state-file", args.next())?,
            "--log-dir" => set_once(&mut log_dir, "--log-dir", args.next())?,
            "--balance" => {
                let raw = args
                    .next()
                    .ok_or_else(|| eyre!("--balance requires a number of points"))?;
                let points = raw
                    .parse::<u64>()
                    .wrap_err_with(|| format!("--balance expects a whole number, got {raw}"))?;
                balance = Some(points);
            }
            "--help" | "-h" => print_usage_and_exit(),
            other => return Err(eyre!("Unknown argument: {other}")),
        }
    }

    let user_id = user_id
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| eyre!("Specify --user <id> to identify the player"))?;

    Ok(client::AppConfig {
        api_url: api_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
        user_id,
        state_file: expand_path(state_file.as_deref().unwrap_or(DEFAULT_STATE_FILE)),
        log_dir: expand_path(log_dir.as_deref().unwrap_or(DEFAULT_LOG_DIR)),
        initial_balance: balance,
    })
}

// The terminal belongs to the UI, so logs go to a daily rolling file.
fn init_tracing(log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .wrap_err_with(|| format!("failed to create log directory {}", log_dir.display()))?;
    let appender = rolling::daily(log_dir, "spin-cycle.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|err| eyre!(err))?;
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let app_config = parse_cli_args()?;
    let _log_guard = init_tracing(&app_config.log_dir)?;
    tracing::info!(user = %app_config.user_id, api = %app_config.api_url, "starting spin-cycle client");
    client::run_app(app_config).await
}
