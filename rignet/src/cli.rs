//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

/// rignet - echo-confirmed lifecycle messaging between experiment rigs
#[derive(Parser, Debug)]
#[command(
    name = "rignet",
    about = "Echo-confirmed lifecycle messaging between experiment rigs",
    version,
    after_help = "Logs are written to: ~/.local/share/rignet/logs/rignet.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a server and log inbound lifecycle events
    Serve {
        /// URI to bind (default: this machine's IP on the listen port)
        uri: Option<String>,

        /// Name used in logs and errors
        #[arg(short, long)]
        name: Option<String>,

        /// Report each lifecycle event back to its sender
        #[arg(short, long)]
        respond: bool,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<f64>,
    },

    /// Send one lifecycle event to a rig and wait for its echo
    Send {
        /// Rig URI
        uri: String,

        /// Event code or name (e.g. EXPINIT, 20, cleanup)
        event: String,

        /// Payload as JSON; anything else is sent as a string
        payload: Option<String>,

        /// Also wait this many seconds for the rig to report the event back
        #[arg(short, long)]
        wait: Option<f64>,
    },

    /// Run a lifecycle command on every configured rig
    Fanout {
        /// One of EXPINIT, EXPSTART, EXPEND, EXPINTERRUPT, EXPCLEANUP
        event: String,

        /// Experiment reference for EXPSTART (yyyy-mm-dd_n_subject)
        #[arg(short, long)]
        exp_ref: Option<String>,

        /// Payload as JSON; anything else is sent as a string
        #[arg(short, long)]
        data: Option<String>,

        /// Signal rigs one at a time, in configured order
        #[arg(short, long)]
        sequential: bool,

        /// Interrupt instead of ending
        #[arg(short, long)]
        immediately: bool,
    },

    /// Print the canonical form of a URI
    Resolve {
        uri: String,

        /// Keep hostnames instead of resolving them
        #[arg(long)]
        no_resolve: bool,

        /// Port used when the URI has none
        #[arg(long)]
        default_port: Option<u16>,

        /// Scheme used when the URI has none (udp, tcp, ws, wss)
        #[arg(long)]
        default_scheme: Option<String>,
    },

    /// Print the code and name of an event
    Event {
        /// Event code or name
        key: String,
    },

    /// Print this machine's public IP address
    ExternalIp,
}

/// Parse a command line payload: JSON when it parses, a plain string otherwise
pub fn parse_payload(raw: Option<&str>) -> Value {
    match raw {
        None => Value::Null,
        Some(text) => serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())),
    }
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rignet")
        .join("logs")
        .join("rignet.log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_payload() {
        assert_eq!(parse_payload(None), Value::Null);
        assert_eq!(parse_payload(Some("42")), json!(42));
        assert_eq!(parse_payload(Some(r#"{"a": [1]}"#)), json!({"a": [1]}));
        assert_eq!(parse_payload(Some("2024-01-01_1_subject")), json!("2024-01-01_1_subject"));
    }

    #[test]
    fn test_parse_fanout() {
        let cli = Cli::try_parse_from(["rignet", "fanout", "EXPSTART", "--exp-ref", "ref", "--sequential"]).unwrap();
        match cli.command {
            Command::Fanout {
                event,
                exp_ref,
                sequential,
                immediately,
                ..
            } => {
                assert_eq!(event, "EXPSTART");
                assert_eq!(exp_ref.as_deref(), Some("ref"));
                assert!(sequential);
                assert!(!immediately);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_log_path() {
        assert!(get_log_path().ends_with("rignet/logs/rignet.log"));
    }
}
