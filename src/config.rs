//! Command line and environment configuration

use chrono::NaiveTime;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::time::Duration;

use crate::approval::{EngineConfig, DEFAULT_IDLE_DAYS};

/// Ideaflow - approval routing for submitted ideas
#[derive(Parser, Debug, Clone)]
#[command(name = "ideaflow")]
#[command(about = "Dynamic workflow selection and multi-stage approval for proposals")]
pub struct Config {
    /// SQLite connection string
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:ideaflow.db")]
    pub database_url: String,

    /// Address the HTTP server listens on
    #[arg(long, env = "IDEAFLOW_BIND", default_value = "0.0.0.0:3000")]
    pub bind: SocketAddr,

    /// Days without activity before a waiting proposal is auto-rejected
    #[arg(long, env = "IDEAFLOW_IDLE_DAYS", default_value_t = DEFAULT_IDLE_DAYS,
          value_parser = clap::value_parser!(i64).range(1..))]
    pub idle_threshold_days: i64,

    /// Local time of day (HH:MM) for the daily idle sweep
    #[arg(long, env = "IDEAFLOW_IDLE_SWEEP_AT", default_value = "02:00", value_parser = parse_time_of_day)]
    pub idle_sweep_at: NaiveTime,

    /// Minutes between delegation sweeps
    #[arg(long, env = "IDEAFLOW_DELEGATION_SWEEP_MINUTES", default_value_t = 60,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub delegation_sweep_minutes: u64,

    /// Webhook receiving notifications. Notifications are only logged when unset.
    #[arg(long, env = "IDEAFLOW_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the HTTP server and both background sweeps (default)
    Serve,
    /// Run one idle sweep pass and exit
    SweepIdle,
    /// Run one delegation sweep pass and exit
    SweepDelegations,
}

impl Config {
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Serve)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            idle_threshold: chrono::Duration::days(self.idle_threshold_days),
        }
    }

    pub fn delegation_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.delegation_sweep_minutes * 60)
    }
}

fn parse_time_of_day(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|e| format!("expected HH:MM, got {:?}: {}", s, e))
}
