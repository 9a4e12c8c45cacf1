use std::fs;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use serde_json::{Value, json};
use tracing::{info, warn};

use rignet::cli::{Cli, Command, get_log_path, parse_payload};
use rignet::config::{Config, NetworkConfig};
use rignet::net::uri::{self, Scheme};
use rignet::{Communicator, EchoCommunicator, LifecycleEvent, Services, Subscriber};

fn setup_logging(verbose: bool) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Write to the log file, not stdout/stderr
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Serve {
            uri,
            name,
            respond,
            duration,
        } => cmd_serve(&config.network, uri, name, respond, duration).await,
        Command::Send {
            uri,
            event,
            payload,
            wait,
        } => cmd_send(&config.network, &uri, &event, payload.as_deref(), wait).await,
        Command::Fanout {
            event,
            exp_ref,
            data,
            sequential,
            immediately,
        } => cmd_fanout(&config, &event, exp_ref, data.as_deref(), !sequential, immediately).await,
        Command::Resolve {
            uri,
            no_resolve,
            default_port,
            default_scheme,
        } => cmd_resolve(&config.network, &uri, no_resolve, default_port, default_scheme.as_deref()),
        Command::Event { key } => cmd_event(&key),
        Command::ExternalIp => cmd_external_ip().await,
    }
}

/// Event a rig reports back once it has acted on `event`
fn reply_event(event: LifecycleEvent) -> LifecycleEvent {
    match event {
        LifecycleEvent::Interrupt => LifecycleEvent::End,
        other => other,
    }
}

fn parse_event(key: &str) -> Result<LifecycleEvent> {
    LifecycleEvent::from_str(key).map_err(|e| eyre!(e))
}

fn seconds(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|_| eyre!("Invalid duration: {secs}"))
}

/// Run a server until Ctrl-C, the duration elapses or the connection is lost
async fn cmd_serve(
    network: &NetworkConfig,
    uri: Option<String>,
    name: Option<String>,
    respond: bool,
    duration: Option<f64>,
) -> Result<()> {
    let duration = duration.map(seconds).transpose()?;
    let uri = match uri {
        Some(uri) => uri,
        None => uri::hostname2ip(None)?.to_string(),
    };
    let server = EchoCommunicator::server_with(uri.as_str(), name.as_deref(), network)
        .await
        .context(format!("Failed to start server on {uri}"))?;
    println!("{} Serving on {}", "✓".green(), server.endpoint().to_string().cyan());

    for event in LifecycleEvent::ALL {
        let responder = server.clone();
        let callback = Subscriber::callback(move |payload, addr| {
            println!("{} {} from {}: {}", "→".cyan(), event.to_string().yellow(), addr, payload);
            if !respond || event == LifecycleEvent::Credential {
                return;
            }
            let responder = responder.clone();
            tokio::spawn(async move {
                let status = json!({"status": "ok", "received": payload});
                if let Err(e) = responder.signal(reply_event(event), status, Some(addr)).await {
                    warn!(%addr, error = %e, "Failed to respond");
                }
            });
        });
        server.assign_callback(event, callback).await?;
    }

    let wait_duration = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => println!("Interrupted"),
        _ = wait_duration => {}
        reason = server.on_connection_lost() => println!("{} Connection lost: {}", "✗".red(), reason),
    }

    server.close().await;
    Ok(())
}

/// Confirmed-send one lifecycle event
async fn cmd_send(
    network: &NetworkConfig,
    uri: &str,
    event: &str,
    payload: Option<&str>,
    wait: Option<f64>,
) -> Result<()> {
    let event = parse_event(event)?;
    let payload = parse_payload(payload);
    let client = EchoCommunicator::client_with(uri, None, network)
        .await
        .context(format!("Failed to connect to {uri}"))?;

    let reply = match wait {
        Some(_) => Some(client.on_event(reply_event(event)).await?),
        None => None,
    };

    let sent = client.signal(event, payload, None).await;
    if let Err(e) = sent {
        client.close().await;
        return Err(eyre!(e).wrap_err(format!("Failed to send {event}")));
    }
    println!("{} {} confirmed by {}", "✓".green(), event, client.endpoint());

    if let (Some(reply), Some(secs)) = (reply, wait) {
        let result = reply.timeout(seconds(secs)?).await;
        match result {
            Ok((payload, addr)) => println!("{} {} from {}: {}", "←".cyan(), reply_event(event), addr, payload),
            Err(e) => {
                client.close().await;
                return Err(eyre!(e));
            }
        }
    }

    client.close().await;
    Ok(())
}

/// Run a lifecycle command across every configured rig
async fn cmd_fanout(
    config: &Config,
    event: &str,
    exp_ref: Option<String>,
    data: Option<&str>,
    concurrent: bool,
    immediately: bool,
) -> Result<()> {
    let event = parse_event(event)?;
    if event == LifecycleEvent::Start && exp_ref.is_none() {
        return Err(eyre!("--exp-ref is required for {event}"));
    }
    if config.services.rigs.is_empty() {
        return Err(eyre!("No rigs configured; add them under services.rigs"));
    }

    let mut members = Vec::with_capacity(config.services.rigs.len());
    for rig in &config.services.rigs {
        let client = EchoCommunicator::client_with(rig.uri.as_str(), Some(&rig.name), &config.network)
            .await
            .context(format!("Failed to connect to rig {}", rig.name))?;
        members.push(client);
    }
    let services = Services::new(members, config.services.credential.clone(), config.services.timeout()).await?;

    let data = parse_payload(data);
    let result = match event {
        LifecycleEvent::Init => services.init(data, concurrent).await,
        LifecycleEvent::Start => {
            let exp_ref = exp_ref.unwrap_or_default();
            services.start(&exp_ref, data, concurrent).await
        }
        LifecycleEvent::End | LifecycleEvent::Interrupt => {
            let immediately = immediately || event == LifecycleEvent::Interrupt;
            services.stop(data, immediately, concurrent).await
        }
        LifecycleEvent::Cleanup => services.cleanup(data, concurrent).await,
        other => {
            services.close().await;
            return Err(eyre!("{other} cannot be fanned out"));
        }
    };
    services.close().await;

    let responses = result.map_err(|e| eyre!(e))?;
    for name in services.names() {
        let payload = responses.get(name).cloned().unwrap_or(Value::Null);
        println!("{}: {}", name.cyan(), payload);
    }
    Ok(())
}

fn cmd_resolve(
    network: &NetworkConfig,
    raw: &str,
    no_resolve: bool,
    default_port: Option<u16>,
    default_scheme: Option<&str>,
) -> Result<()> {
    let mut opts = network.uri_options();
    if no_resolve {
        opts = opts.without_resolve();
    }
    if let Some(port) = default_port {
        opts = opts.with_default_port(port);
    }
    if let Some(scheme) = default_scheme {
        opts = opts.with_default_scheme(Scheme::from_str(scheme).map_err(|e| eyre!(e))?);
    }

    let canonical = uri::validate_uri(raw, &opts).map_err(|e| eyre!(e))?;
    println!("{canonical}");
    Ok(())
}

fn cmd_event(key: &str) -> Result<()> {
    let event = parse_event(key)?;
    println!("{} {}", event.code(), event.name());
    Ok(())
}

async fn cmd_external_ip() -> Result<()> {
    let ip = uri::external_ip().await.context("Failed to determine external IP")?;
    println!("{ip}");
    Ok(())
}
