use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use conveyor_types::endpoint::header_name_from_env;
use conveyor_types::{AgentConfig, AgentError, ErrorKind};
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "conveyor-agent",
    version,
    about = "Build-automation agent for the Buildkite control plane"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register with the control plane and run jobs until stopped.
    Start(StartArgs),
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Registration token.
    #[arg(long, env = "BUILDKITE_AGENT_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Agent name; defaults to the hostname.
    #[arg(long, env = "BUILDKITE_AGENT_NAME")]
    pub name: Option<String>,

    /// Comma-separated key=value tags.
    #[arg(long, env = "BUILDKITE_AGENT_TAGS", value_delimiter = ',')]
    pub tags: Vec<String>,

    #[arg(long, env = "BUILDKITE_AGENT_PRIORITY")]
    pub priority: Option<String>,

    #[arg(
        long,
        env = "BUILDKITE_AGENT_ENDPOINT",
        default_value = conveyor_api::DEFAULT_ENDPOINT
    )]
    pub endpoint: Url,

    /// Where job working directories are created.
    #[arg(long, env = "BUILDKITE_BUILD_PATH", default_value = "builds")]
    pub build_path: PathBuf,

    #[arg(long, env = "BUILDKITE_HOOKS_PATH")]
    pub hooks_path: Option<PathBuf>,

    #[arg(long, env = "BUILDKITE_PLUGINS_PATH")]
    pub plugins_path: Option<PathBuf>,

    #[arg(long, env = "BUILDKITE_SOCKETS_PATH")]
    pub sockets_path: Option<PathBuf>,

    /// Acquire exactly this job, run it, then exit.
    #[arg(long, env = "BUILDKITE_AGENT_ACQUIRE_JOB")]
    pub acquire_job: Option<String>,

    #[arg(long, env = "BUILDKITE_AGENT_DISCONNECT_AFTER_JOB")]
    pub disconnect_after_job: bool,

    /// Seconds the whole pool may sit idle before disconnecting.
    #[arg(long, env = "BUILDKITE_AGENT_DISCONNECT_AFTER_IDLE_TIMEOUT")]
    pub disconnect_after_idle_timeout: Option<u64>,

    /// Seconds a cancelled job may keep running before SIGKILL.
    #[arg(long, env = "BUILDKITE_CANCEL_GRACE_PERIOD", default_value_t = 10)]
    pub cancel_grace_period: u64,

    /// Seconds the finish report may retry before being forced.
    #[arg(long, env = "BUILDKITE_SIGNAL_GRACE_PERIOD", default_value_t = 30)]
    pub signal_grace_period: u64,

    /// Regex patterns job env var names must match to be passed through.
    #[arg(
        long,
        env = "BUILDKITE_ALLOWED_ENVIRONMENT_VARIABLES",
        value_delimiter = ','
    )]
    pub allowed_env: Vec<String>,

    /// Number of parallel workers.
    #[arg(long, env = "BUILDKITE_AGENT_SPAWN", default_value_t = 1)]
    pub spawn: usize,

    /// Disable the SSE push stream and rely on polling alone.
    #[arg(long, env = "BUILDKITE_NO_PING_STREAM")]
    pub no_ping_stream: bool,

    #[arg(long, env = "BUILDKITE_AGENT_DEBUG")]
    pub debug: bool,
}

impl StartArgs {
    pub fn into_config(self) -> Result<AgentConfig, AgentError> {
        let request_headers = request_headers_from(std::env::vars())?;
        Ok(AgentConfig {
            token: self.token,
            name: self.name.unwrap_or_else(default_name),
            tags: self.tags,
            priority: self.priority,
            endpoint: self.endpoint,
            request_headers,
            build_path: self.build_path,
            hooks_path: self.hooks_path,
            plugins_path: self.plugins_path,
            sockets_path: self.sockets_path,
            cancel_grace_period: Duration::from_secs(self.cancel_grace_period),
            signal_grace_period: Duration::from_secs(self.signal_grace_period),
            acquire_job: self.acquire_job,
            disconnect_after_job: self.disconnect_after_job,
            disconnect_after_idle_timeout: self
                .disconnect_after_idle_timeout
                .map(Duration::from_secs),
            allowed_env: self.allowed_env,
            spawn: self.spawn.max(1),
            ping_stream_enabled: !self.no_ping_stream,
            debug: self.debug,
        })
    }
}

fn default_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "conveyor-agent".to_string())
}

/// Collect `BUILDKITE_REQUEST_HEADER_*` variables into request headers.
///
/// A reserved or malformed name is a configuration error, not something
/// to silently skip.
pub fn request_headers_from(
    vars: impl Iterator<Item = (String, String)>,
) -> Result<BTreeMap<String, String>, AgentError> {
    let mut headers = BTreeMap::new();
    for (key, value) in vars {
        let Some(suffix) = key.strip_prefix("BUILDKITE_REQUEST_HEADER_") else {
            continue;
        };
        let name = header_name_from_env(suffix).map_err(|err| {
            AgentError::new(ErrorKind::Fatal, format!("bad request header variable {key}"))
                .with_detail(err.to_string())
        })?;
        headers.insert(name, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn start_parses_the_documented_flags() {
        let cli = Cli::try_parse_from([
            "conveyor-agent",
            "start",
            "--token",
            "reg-token",
            "--name",
            "ci-box",
            "--tags",
            "queue=default,os=linux",
            "--build-path",
            "/srv/builds",
            "--cancel-grace-period",
            "20",
            "--disconnect-after-job",
            "--no-ping-stream",
        ])
        .unwrap();

        let Command::Start(args) = cli.command;
        let config = args.into_config().unwrap();
        assert_eq!(config.name, "ci-box");
        assert_eq!(config.tags, ["queue=default", "os=linux"]);
        assert_eq!(config.cancel_grace_period, Duration::from_secs(20));
        assert!(config.disconnect_after_job);
        assert!(!config.ping_stream_enabled);
        assert_eq!(
            config.endpoint.as_str(),
            "https://agent.buildkite.com/v3"
        );
    }

    #[test]
    fn missing_token_is_a_parse_error() {
        assert!(Cli::try_parse_from(["conveyor-agent", "start"]).is_err());
    }

    #[test]
    fn request_header_variables_translate_and_reject_reserved_names() {
        let headers = request_headers_from(
            vec![
                ("BUILDKITE_REQUEST_HEADER_X_REGION".to_string(), "eu".to_string()),
                ("PATH".to_string(), "/usr/bin".to_string()),
            ]
            .into_iter(),
        )
        .unwrap();
        assert_eq!(headers.get("X-REGION").map(String::as_str), Some("eu"));

        let err = request_headers_from(
            vec![("BUILDKITE_REQUEST_HEADER_CONTENT_TYPE".to_string(), "x".to_string())]
                .into_iter(),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Fatal);
    }
}
