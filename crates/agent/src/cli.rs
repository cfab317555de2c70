use std::path::PathBuf;

use anyhow::Context;
use careline_engine::{CallMode, Role, SessionParams};

pub(crate) const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8445";

pub(crate) struct Args {
    pub user: String,
    pub peer: String,
    pub conversation: String,
    pub role: Role,
    pub mode: CallMode,
    pub relay_url: String,
    pub config: PathBuf,
}

impl Args {
    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            conversation_id: self.conversation.clone(),
            local_id: self.user.clone(),
            remote_id: self.peer.clone(),
            role: self.role,
            mode: self.mode,
        }
    }
}

fn print_help() {
    println!("careline-agent - headless Careline call endpoint");
    println!();
    println!("USAGE:");
    println!("    careline-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --user <ID>                  Local user id (required)");
    println!("    --peer <ID>                  Remote user id (required)");
    println!("    --conversation <ID>          Conversation id (required)");
    println!("    --role <caller|callee>       Place or answer the call [default: caller]");
    println!("    --mode <audio|video>         Call mode [default: audio]");
    println!("    --relay-url <URL>            Signaling relay base URL [default: {DEFAULT_RELAY_URL}]");
    println!("    --config <PATH>              TOML config [default: ./config/careline.toml]");
    println!("    -V, --version                Print version and exit");
    println!("    -h, --help                   Print this help and exit");
}

fn parse_role(value: &str) -> anyhow::Result<Role> {
    match value {
        "caller" => Ok(Role::Caller),
        "callee" => Ok(Role::Callee),
        other => anyhow::bail!("Invalid --role value: {other} (expected caller or callee)"),
    }
}

fn parse_mode(value: &str) -> anyhow::Result<CallMode> {
    match value {
        "audio" => Ok(CallMode::Audio),
        "video" => Ok(CallMode::Video),
        other => anyhow::bail!("Invalid --mode value: {other} (expected audio or video)"),
    }
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    parse_from(&args[1..])
}

fn parse_from(args: &[String]) -> anyhow::Result<Args> {
    let mut user = None;
    let mut peer = None;
    let mut conversation = None;
    let mut role = Role::Caller;
    let mut mode = CallMode::Audio;
    let mut relay_url = DEFAULT_RELAY_URL.to_string();
    let mut config = PathBuf::from("./config/careline.toml");

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("careline-agent {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "--user" => {
                i += 1;
                user = Some(args.get(i).context("Missing --user value")?.clone());
            }
            "--peer" => {
                i += 1;
                peer = Some(args.get(i).context("Missing --peer value")?.clone());
            }
            "--conversation" => {
                i += 1;
                conversation = Some(args.get(i).context("Missing --conversation value")?.clone());
            }
            "--role" => {
                i += 1;
                role = parse_role(args.get(i).context("Missing --role value")?)?;
            }
            "--mode" => {
                i += 1;
                mode = parse_mode(args.get(i).context("Missing --mode value")?)?;
            }
            "--relay-url" => {
                i += 1;
                relay_url = args.get(i).context("Missing --relay-url value")?.clone();
            }
            "--config" | "-c" => {
                i += 1;
                config = PathBuf::from(args.get(i).context("Missing --config value")?);
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    let user = user.context("--user is required")?;
    let peer = peer.context("--peer is required")?;
    if user == peer {
        anyhow::bail!("--user and --peer must differ");
    }

    Ok(Args {
        user,
        peer,
        conversation: conversation.context("--conversation is required")?,
        role,
        mode,
        relay_url: relay_url.trim_end_matches('/').to_string(),
        config,
    })
}
