//! tenantdash - drive the tenant dashboard session core from a terminal.
//!
//! Logs in against the configured identity provider, keeps the credential in
//! the OS keychain between runs, and reports on it.

use std::io::{self, Write};

use anyhow::{anyhow, bail, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tenantdash_core::api::ApiError;
use tenantdash_core::auth::InvalidationEvent;
use tenantdash_core::config::Config;
use tenantdash_core::sanitize::{self, FieldKind, Rules};
use tenantdash_core::SessionContext;

/// Directory for daily rolling log files; stderr only when unset
const ENV_LOG_DIR: &str = "TENANTDASH_LOG_DIR";

const LOG_FILE_PREFIX: &str = "tenantdash.log";

const USAGE: &str = "\
Usage: tenantdash <command> [args]

Commands:
  login [email]                 Log in and store the credential
  whoami                        Show the validated session
  refresh                       Re-validate the stored credential
  logout                        Forget the stored credential
  register <email> [name]       Create an account
  status                        Show the stored credential without contacting upstream
  health                        Check the identity provider
  check <kind> <value>          Run input validation (kind: email, password, search, text)";

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    // RUST_LOG controls the level (e.g., RUST_LOG=tenantdash_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var_os(ENV_LOG_DIR) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };
    let rest = &args[1..];

    // Validation is local; no config or session needed
    if command == "check" {
        return check(rest);
    }
    if command == "help" || command == "--help" || command == "-h" {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load()?;
    let context = SessionContext::from_config(&config)?;
    let mut invalidations = context.subscribe();
    info!(command, base_url = %config.upstream.base_url, "tenantdash starting");

    let result = match command {
        "login" => login(&context, rest.first().map(String::as_str)).await,
        "whoami" => whoami(&context).await,
        "refresh" => refresh(&context).await,
        "logout" => {
            context.gateway().logout();
            println!("Logged out.");
            Ok(())
        }
        "register" => register(&context, rest).await,
        "status" => status(&context),
        "health" => health(&context).await,
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    };

    if let Ok(event) = invalidations.try_recv() {
        report_invalidation(&event);
    }
    result
}

fn report_invalidation(event: &InvalidationEvent) {
    info!(reason = ?event.reason, at = %event.at, "Re-authentication required");
    eprintln!("Your session has ended. Run `tenantdash login` to sign in again.");
}

/// Turn an `ApiError` into something fit to show the user
fn user_error(err: ApiError) -> anyhow::Error {
    anyhow!(err.user_message())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut value = String::new();
    io::stdin().read_line(&mut value)?;
    Ok(value.trim().to_string())
}

async fn login(context: &SessionContext, email: Option<&str>) -> Result<()> {
    let email = match email {
        Some(email) => email.to_string(),
        None => prompt("Email: ")?,
    };
    let password = rpassword::prompt_password("Password: ")?;

    let credential = context
        .gateway()
        .login(&email, &password)
        .await
        .map_err(|err| match err {
            ApiError::Unauthenticated => anyhow!("Invalid email or password."),
            other => user_error(other),
        })?;

    match context.gateway().validate().await {
        Ok(session) => println!(
            "Logged in as {} ({}), session valid for {} minutes.",
            session.display_name,
            session.email,
            credential.minutes_until_expiry()
        ),
        Err(err) => println!(
            "Logged in, but the profile could not be loaded: {}",
            err.user_message()
        ),
    }
    Ok(())
}

async fn whoami(context: &SessionContext) -> Result<()> {
    let session = context.session().await.map_err(user_error)?;
    println!("{}", serde_json::to_string_pretty(session.as_ref())?);
    Ok(())
}

async fn refresh(context: &SessionContext) -> Result<()> {
    let session = context.gateway().refresh().await.map_err(user_error)?;
    println!(
        "Credential still accepted for {}; expires {}.",
        session.email, session.expires_at
    );
    Ok(())
}

async fn register(context: &SessionContext, args: &[String]) -> Result<()> {
    let Some(email) = args.first() else {
        bail!("register needs an email address");
    };
    let name = args.get(1).map(String::as_str);
    let password = rpassword::prompt_password("Password: ")?;
    let confirm = rpassword::prompt_password("Confirm password: ")?;
    if password != confirm {
        bail!("Passwords do not match");
    }

    let registered = context
        .gateway()
        .register(email, &password, name)
        .await
        .map_err(user_error)?;

    println!(
        "{}",
        registered
            .message
            .unwrap_or_else(|| "Account created.".to_string())
    );
    println!("Run `tenantdash login {}` to sign in.", registered.email.unwrap_or_default());
    Ok(())
}

fn status(context: &SessionContext) -> Result<()> {
    let Some(credential) = context.gateway().current_credential() else {
        println!("Not logged in.");
        return Ok(());
    };

    if credential.is_expired() {
        println!("Credential expired at {}.", credential.expires_at());
    } else {
        println!(
            "Logged in; credential expires at {} ({} minutes).",
            credential.expires_at(),
            credential.minutes_until_expiry()
        );
        if credential.needs_refresh() {
            println!("Expiring soon. Run `tenantdash refresh` or log in again.");
        }
    }
    Ok(())
}

async fn health(context: &SessionContext) -> Result<()> {
    let health = context.health().await.map_err(user_error)?;
    let service = health.service.as_deref().unwrap_or("identity provider");
    if health.is_healthy() {
        println!("{}: {}", service, health.status);
        Ok(())
    } else {
        bail!("{} reports {}", service, health.status)
    }
}

fn check(args: &[String]) -> Result<()> {
    let [kind, value] = args else {
        bail!("check needs a field kind and a value");
    };
    let kind = match kind.as_str() {
        "email" => FieldKind::Email,
        "password" => FieldKind::Password,
        "search" => FieldKind::SearchText,
        "text" => FieldKind::GenericText,
        other => bail!("Unknown field kind: {}", other),
    };

    let result = sanitize::validate(kind, value, &Rules::for_kind(kind));
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
