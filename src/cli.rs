//! Command line interface
//!
//! `usip register`, `usip call <number>` and `usip status`, each driven by
//! a [`Config`] loaded from file and environment.

use crate::config::Config;
use crate::infrastructure::media::NullMediaEngine;
use crate::infrastructure::protocols::sip::call_controller::CallController;
use crate::infrastructure::protocols::sip::message::SipError;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

/// Single-account SIP calling tool
#[derive(Parser, Debug, PartialEq)]
#[command(name = "usip", version)]
pub struct Cli {
    /// TOML configuration file (default: ./usip.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging, including raw SIP messages
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Register, wait for Enter or Ctrl-C, then unregister
    Register,
    /// Register and call a number or SIP URI
    Call {
        /// Phone number, user name or sip: URI
        number: String,
    },
    /// Show the effective configuration
    Status,
}

impl Cli {
    /// Load the configuration this invocation asks for
    pub fn load_config(&self) -> Result<Config, SipError> {
        let mut config = Config::load(self.config.as_deref())?;
        config.verbose |= self.debug;
        Ok(config)
    }
}

async fn wait_for_enter_or_ctrl_c() {
    let mut line = String::new();
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
    tokio::select! {
        _ = stdin.read_line(&mut line) => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

async fn connect(config: &Config) -> Result<CallController, SipError> {
    let account = config.account()?;
    info!("Using account {:?}", account);
    CallController::connect(
        account,
        Arc::new(NullMediaEngine::new()),
        config.session_settings(),
    )
    .await
}

/// Register with the timeout rule applied: give up if nothing answers
async fn register(controller: &CallController) -> Result<(), SipError> {
    match controller.register().await {
        Ok(()) => Ok(()),
        Err(e @ SipError::Timeout(_)) => {
            controller.fail_registration(&e.to_string()).await.ok();
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// register subcommand
pub async fn run_register(config: &Config) -> Result<(), SipError> {
    let controller = connect(config).await?;
    if let Err(e) = register(&controller).await {
        controller.hangup().await;
        return Err(e);
    }

    println!(
        "Registered as {}. Press Enter or Ctrl-C to unregister.",
        controller.account().aor()
    );
    wait_for_enter_or_ctrl_c().await;

    if let Err(e) = controller.unregister().await {
        warn!("Unregister failed: {}", e);
    }
    controller.hangup().await;
    Ok(())
}

/// call subcommand
pub async fn run_call(config: &Config, number: &str) -> Result<(), SipError> {
    let controller = connect(config).await?;
    let target = controller.resolve_target(number)?;

    if let Err(e) = register(&controller).await {
        controller.hangup().await;
        return Err(e);
    }
    println!("Registered. Calling {} ...", target);

    let outcome = tokio::select! {
        result = controller.make_call(number) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let result = match outcome {
        Some(Ok(call_id)) => {
            println!("Call connected ({}). Press Enter or Ctrl-C to hang up.", call_id);
            wait_for_enter_or_ctrl_c().await;
            Ok(())
        }
        Some(Err(e @ SipError::Timeout(_))) => {
            controller.fail_call(&e.to_string()).await.ok();
            Err(e)
        }
        Some(Err(e)) => Err(e),
        None => {
            println!("Cancelled");
            Ok(())
        }
    };

    controller.hangup().await;
    if let Some(info) = controller.call_info().await {
        match info.talk_duration() {
            Some(talk) => println!(
                "Call {} ended: {} after {}s ({}s talking)",
                info.call_id(),
                info.state(),
                info.duration().num_seconds(),
                talk.num_seconds()
            ),
            None => println!(
                "Call {} ended: {} after {}s",
                info.call_id(),
                info.state(),
                info.duration().num_seconds()
            ),
        }
    }
    result
}

/// status subcommand
pub fn run_status(config: &Config) -> Result<(), SipError> {
    print!("{}", config.to_toml()?);
    match config.account() {
        Ok(account) => println!("# account {} is valid", account.aor()),
        Err(e) => println!("# account is not usable: {}", e),
    }
    Ok(())
}
