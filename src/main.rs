use std::io::Read;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mailsync::config;
use mailsync::error::SyncError;
use mailsync::imap::{ImapBackend, MailApi};
use mailsync::models::Account;
use mailsync::smtp;
use mailsync::store;
use mailsync::sync::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Run the sync workers until the parent goes away.
    Sync,
    /// Probe IMAP and SMTP credentials, emit one JSON result line.
    Test,
    /// Run schema migrations, emit one JSON result line.
    Migrate,
}

/// Background mail synchronization worker. One process per account.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[arg(long, value_enum)]
    mode: Mode,

    /// Account JSON. When absent, a single JSON line is read from stdin.
    #[arg(long)]
    account: Option<String>,

    /// Skip the stdin liveness check (for running detached while debugging).
    #[arg(long)]
    orphan: bool,
}

fn init_logging() {
    let logs = config::logs_dir();
    let _ = std::fs::create_dir_all(&logs);
    // stdout belongs to the UI channel, so logs go to rotating files.
    let appender = tracing_appender::rolling::Builder::new()
        .filename_prefix("mailsync")
        .filename_suffix("log")
        .max_log_files(3)
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .build(&logs)
        .expect("log appender");

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "mailsync=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(appender)
        .with_ansi(false)
        .init();
}

fn load_account(cli: &Cli) -> Result<Account, String> {
    let raw = match &cli.account {
        Some(raw) => raw.clone(),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .take(1024 * 1024)
                .read_to_string(&mut buf)
                .map_err(|e| format!("could not read account from stdin: {}", e))?;
            buf.lines()
                .next()
                .unwrap_or_default()
                .to_string()
        }
    };
    let account = Account::from_json(&raw).map_err(|e| format!("bad account JSON: {}", e))?;
    if !account.valid() {
        return Err("account is missing required endpoints or credentials".into());
    }
    Ok(account)
}

/// `--mode test`: open IMAP, require an inbox (or all-mail), then probe
/// SMTP auth. Sessions are scoped so they tear down on every exit path.
async fn run_test_auth(account: Arc<Account>) -> serde_json::Value {
    let mut log = String::new();

    {
        let mut backend = ImapBackend::new(account.clone());
        let imap_result: Result<(), SyncError> = async {
            backend.connect().await?;
            log.push_str("IMAP connected.\n");
            let folders = backend.fetch_folders().await?;
            log.push_str(&format!("Listed {} folders.\n", folders.len()));
            let has_root = folders.iter().any(|f| {
                let role = mailsync::models::folder::role_for_folder(&f.path, &f.attributes);
                role == "inbox" || role == "all"
            });
            if !has_root {
                return Err(SyncError::Other(
                    "mailbox has neither an inbox nor an all-mail folder".into(),
                ));
            }
            Ok(())
        }
        .await;

        if let Err(e) = imap_result {
            return serde_json::json!({
                "error": e.to_string(),
                "error_service": "imap",
                "log": log,
                "account": null,
            });
        }
    }

    if let Err(e) = smtp::test_auth(&account).await {
        return serde_json::json!({
            "error": e.to_string(),
            "error_service": "smtp",
            "log": log,
            "account": null,
        });
    }
    log.push_str("SMTP authenticated.\n");

    serde_json::json!({
        "error": null,
        "error_service": null,
        "log": log,
        "account": *account,
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let account = match load_account(&cli) {
        Ok(account) => Arc::new(account),
        Err(e) => {
            eprintln!("{}", e);
            println!("{}", serde_json::json!({ "error": e }));
            std::process::exit(1);
        }
    };

    info!(account = %account.id, mode = ?cli.mode, "worker starting");

    match cli.mode {
        Mode::Migrate => {
            let result = store::open_pool(&config::database_path(&account.id));
            match result {
                Ok(_pool) => println!("{}", serde_json::json!({ "error": null })),
                Err(e) => {
                    println!("{}", serde_json::json!({ "error": e.to_string() }));
                    std::process::exit(1);
                }
            }
        }
        Mode::Test => {
            let result = run_test_auth(account).await;
            let failed = !result["error"].is_null();
            println!("{}", result);
            if failed {
                std::process::exit(1);
            }
        }
        Mode::Sync => {
            let engine = match Engine::new(account, cli.orphan) {
                Ok(engine) => engine,
                Err(e) => {
                    eprintln!("could not start engine: {}", e);
                    std::process::exit(1);
                }
            };
            if let Err(e) = engine.run().await {
                eprintln!("engine stopped: {}", e);
                std::process::exit(1);
            }
        }
    }
}
