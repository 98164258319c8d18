mod app;
pub mod auth;
pub mod commands;
pub mod invoker;
mod redact;
pub mod refresh;
pub mod roles;
pub mod settings;
pub mod state;
#[cfg(test)]
mod test_support;
pub mod types;

pub fn run() -> std::process::ExitCode {
  app::run()
}
