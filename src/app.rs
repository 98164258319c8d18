use crate::commands;
use crate::refresh::spawn_refresh_loop;
use crate::settings::{
  default_settings_path, SettingsStore, KEY_ANON_KEY, KEY_AUTO_REFRESH_ENABLED,
  KEY_EXPIRY_THRESHOLD_SECONDS, KEY_PROJECT_URL, KEY_REMEMBER_SESSION,
};
use crate::state::{AppState, RefreshRequest};
use crate::types::{IpcErrorCode, IpcResult};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
  name = "callboard",
  version,
  about = "Session, function-call and capability client for the call-center dashboard"
)]
struct Cli {
  #[arg(long, global = true, help = "Settings file (defaults to the user config dir)")]
  settings: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Store project coordinates and refresh preferences.
  Configure {
    #[arg(long)]
    project_url: Option<String>,
    #[arg(long)]
    anon_key: Option<String>,
    #[arg(long, value_name = "SECONDS")]
    expiry_threshold: Option<u64>,
    #[arg(long)]
    auto_refresh: Option<bool>,
  },
  /// Sign in with email and password.
  SignIn {
    #[arg(long)]
    email: String,
    #[arg(long, env = "CALLBOARD_PASSWORD", hide_env_values = true)]
    password: String,
    #[arg(long, help = "Keep the session in the OS keychain")]
    remember: bool,
  },
  SignOut,
  /// Show the current session, role and capabilities.
  Status,
  /// Force a token refresh.
  Refresh,
  /// Check a single capability for the signed-in user.
  Can { capability: String },
  /// Call an edge function with the current access token.
  Invoke {
    function: String,
    #[arg(long, help = "JSON request body")]
    body: Option<String>,
    #[arg(long = "header", short = 'H', value_name = "KEY=VALUE", action = clap::ArgAction::Append)]
    headers: Vec<String>,
  },
  #[command(subcommand)]
  Mfa(MfaCommand),
  /// Keep the session fresh until interrupted.
  Watch {
    #[arg(long, help = "Refresh once immediately on start")]
    refresh_first: bool,
  },
  /// Drop the stored session and stop remembering it.
  Forget,
}

#[derive(Subcommand)]
enum MfaCommand {
  Factors,
  Enroll {
    #[arg(long)]
    friendly_name: Option<String>,
  },
  Verify {
    #[arg(long)]
    factor_id: String,
    #[arg(long)]
    code: String,
  },
  Unenroll {
    #[arg(long)]
    factor_id: String,
  },
}

fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let _ = fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .try_init();
}

fn print<T: Serialize>(result: &IpcResult<T>) -> ExitCode {
  match serde_json::to_string_pretty(result) {
    Ok(json) => println!("{json}"),
    Err(e) => {
      tracing::error!(error = %e, "failed to render result");
      return ExitCode::FAILURE;
    }
  }
  if result.is_ok() {
    ExitCode::SUCCESS
  } else {
    ExitCode::FAILURE
  }
}

fn load_settings(path: Option<PathBuf>) -> Result<SettingsStore, String> {
  let path = match path {
    Some(path) => path,
    None => default_settings_path().map_err(|e| e.to_string())?,
  };
  SettingsStore::load(&path).map_err(|e| format!("{}: {e}", path.display()))
}

fn configure(
  settings: &SettingsStore,
  project_url: Option<String>,
  anon_key: Option<String>,
  expiry_threshold: Option<u64>,
  auto_refresh: Option<bool>,
) -> IpcResult<()> {
  if let Some(url) = project_url {
    let url = url.trim().trim_end_matches('/').to_string();
    if !url.starts_with("https://") && !url.starts_with("http://") {
      return IpcResult::err(IpcErrorCode::InvalidInput, "Project url must start with http(s)://");
    }
    settings.set(KEY_PROJECT_URL, url);
  }
  if let Some(key) = anon_key {
    settings.set(KEY_ANON_KEY, key.trim());
  }
  if let Some(secs) = expiry_threshold {
    settings.set(KEY_EXPIRY_THRESHOLD_SECONDS, secs);
  }
  if let Some(enabled) = auto_refresh {
    settings.set(KEY_AUTO_REFRESH_ENABLED, enabled);
  }
  match settings.save() {
    Ok(()) => IpcResult::ok(()),
    Err(e) => IpcResult::err(IpcErrorCode::Unknown, e.to_string()),
  }
}

async fn watch(
  state: AppState,
  rx: mpsc::UnboundedReceiver<RefreshRequest>,
  refresh_first: bool,
) -> IpcResult<()> {
  if state.sessions.get_current_session().await.is_none() {
    tracing::warn!("no stored session; sign in with --remember to keep one between runs");
  }
  let handle = spawn_refresh_loop(state.clone(), rx);
  if refresh_first {
    state.refresh.trigger();
  }
  tracing::info!("watching session; press ctrl-c to stop");

  let res = tokio::signal::ctrl_c().await;
  handle.abort();
  match res {
    Ok(()) => IpcResult::ok(()),
    Err(e) => IpcResult::err(IpcErrorCode::Unknown, e.to_string()),
  }
}

/// One-shot runs keep the session in memory only, unless it is remembered.
fn ephemeral_session_notice(remember: bool) -> Option<&'static str> {
  (!remember).then_some(
    "session is kept in memory only and ends with this process; \
     pass --remember to reuse it in later commands",
  )
}

async fn dispatch(settings: SettingsStore, command: Command) -> ExitCode {
  if let Command::Configure {
    project_url,
    anon_key,
    expiry_threshold,
    auto_refresh,
  } = command
  {
    return print(&configure(&settings, project_url, anon_key, expiry_threshold, auto_refresh));
  }

  // The store mode is fixed when state is built, so remember must land first.
  if let Command::SignIn { remember: true, .. } = &command {
    settings.set(KEY_REMEMBER_SESSION, true);
  }

  let (state, rx) = match AppState::from_settings(settings) {
    Ok(built) => built,
    Err(e) => return print(&IpcResult::<()>::err(IpcErrorCode::InvalidInput, e.to_string())),
  };

  match command {
    Command::Configure { .. } => ExitCode::SUCCESS,
    Command::SignIn {
      email,
      password,
      remember,
    } => {
      let result = commands::sign_in(&state, &email, &password, remember).await;
      if let Some(notice) = ephemeral_session_notice(remember || state.remember_session()) {
        if result.is_ok() {
          tracing::warn!("{notice}");
        }
      }
      print(&result)
    }
    Command::SignOut => print(&commands::sign_out(&state).await),
    Command::Status => print(&commands::status(&state).await),
    Command::Refresh => print(&commands::refresh(&state).await),
    Command::Can { capability } => print(&commands::can(&state, &capability).await),
    Command::Invoke {
      function,
      body,
      headers,
    } => print(&commands::invoke(&state, &function, body.as_deref(), &headers).await),
    Command::Mfa(MfaCommand::Factors) => print(&commands::mfa_factors(&state).await),
    Command::Mfa(MfaCommand::Enroll { friendly_name }) => {
      print(&commands::mfa_enroll(&state, friendly_name.as_deref()).await)
    }
    Command::Mfa(MfaCommand::Verify { factor_id, code }) => {
      print(&commands::mfa_verify(&state, &factor_id, &code).await)
    }
    Command::Mfa(MfaCommand::Unenroll { factor_id }) => {
      print(&commands::mfa_unenroll(&state, &factor_id).await)
    }
    Command::Watch { refresh_first } => print(&watch(state, rx, refresh_first).await),
    Command::Forget => print(&commands::forget(&state).await),
  }
}

pub fn run() -> ExitCode {
  let cli = Cli::parse();
  init_tracing();

  let settings = match load_settings(cli.settings) {
    Ok(settings) => settings,
    Err(message) => {
      tracing::error!(%message, "failed to load settings");
      return ExitCode::FAILURE;
    }
  };

  let runtime = match tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()
  {
    Ok(runtime) => runtime,
    Err(e) => {
      tracing::error!(error = %e, "failed to start async runtime");
      return ExitCode::FAILURE;
    }
  };

  runtime.block_on(dispatch(settings, cli.command))
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::CommandFactory;

  #[test]
  fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
  }

  #[test]
  fn parses_invoke_with_headers() {
    let cli = Cli::try_parse_from([
      "callboard",
      "invoke",
      "call-analytics",
      "--body",
      "{}",
      "-H",
      "x-a=1",
      "-H",
      "x-b=2",
    ])
    .unwrap();
    match cli.command {
      Command::Invoke {
        function, headers, ..
      } => {
        assert_eq!(function, "call-analytics");
        assert_eq!(headers, vec!["x-a=1", "x-b=2"]);
      }
      _ => panic!("expected invoke"),
    }
  }

  #[test]
  fn sign_in_without_remember_warns_about_ephemeral_session() {
    assert!(ephemeral_session_notice(false).is_some_and(|n| n.contains("--remember")));
    assert_eq!(ephemeral_session_notice(true), None);
  }

  #[test]
  fn configure_rejects_non_http_url() {
    let settings = SettingsStore::in_memory();
    let res = configure(&settings, Some("ftp://nope".to_string()), None, None, None);
    assert!(!res.is_ok());
    assert_eq!(settings.get_string(KEY_PROJECT_URL), None);
  }
}
