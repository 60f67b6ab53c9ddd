use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use railbus::config::{BridgeConfig, TransportConfig};
use railbus::netbus::{Envelope, PubEndpoint, SubEndpoint};
use railbus::protocol::{CcuKind, CcuReply, Message, Telegram};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("railbus")
        .version("0.1.0")
        .author("Test Systems Engineering Team")
        .about("Operator tool for the OBIS hardware-in-the-loop harness")
        .subcommand(
            SubCommand::with_name("check-config")
                .about("Validate a bridge configuration file")
                .arg(
                    Arg::with_name("file")
                        .help("Configuration file to check")
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("Watch a bridge's telemetry channel")
                .arg(
                    Arg::with_name("telemetry")
                        .short("t")
                        .long("telemetry")
                        .value_name("ADDR")
                        .help("Telemetry channel address")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("Stop after this many seconds (default: run until interrupted)")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("send")
                .about("Inject a canned command on a bridge's command channel")
                .arg(
                    Arg::with_name("command")
                        .short("c")
                        .long("command")
                        .value_name("ADDR")
                        .help("Command channel address")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("name")
                        .short("n")
                        .long("name")
                        .value_name("NAME")
                        .help("Bridge subsystem name (topic prefix)")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("message")
                        .help("Canned message to send")
                        .required(true)
                        .possible_values(&["grant-dva", "deny-dva", "ack-esd-text", "status-reply"]),
                )
                .arg(
                    Arg::with_name("train")
                        .long("train")
                        .value_name("NO")
                        .help("Train number for control-family replies")
                        .takes_value(true)
                        .default_value("0"),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        ("check-config", Some(sub_matches)) => handle_check_config(sub_matches),
        ("monitor", Some(sub_matches)) => handle_monitor(sub_matches).await,
        ("send", Some(sub_matches)) => handle_send(sub_matches).await,
        _ => {
            println!("{}", "No command specified. Use --help for usage.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Validate a bridge config", "railbus check-config bridge.toml".bright_cyan());
            println!("  {} Watch telemetry", "railbus monitor -t 127.0.0.1:9101".bright_cyan());
            Ok(())
        }
    }
}

fn handle_check_config(matches: &ArgMatches<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let path = matches.value_of("file").unwrap();
    match BridgeConfig::load(Path::new(path)) {
        Ok(config) => {
            println!("{} {}", "✓".green(), format!("{} is valid", path).bright_green());
            println!("  {} {}", "bridge:".bright_white(), config.bridge.name);
            println!("  {} {}", "family:".bright_white(), config.bridge.family);
            let transport = match &config.bridge.transport {
                TransportConfig::Tcp { bind } => format!("tcp {bind}"),
                TransportConfig::Udp { bind } => format!("udp {bind}"),
                TransportConfig::Serial { device, baud } => {
                    format!("serial {} @ {} Bd", device.display(), baud)
                }
            };
            println!("  {} {}", "transport:".bright_white(), transport);
            println!("  {} {}", "command:".bright_white(), config.bridge.channels.command);
            println!("  {} {}", "telemetry:".bright_white(), config.bridge.channels.telemetry);
            Ok(())
        }
        Err(error) => {
            println!("{} {}", "✗".red(), format!("{path}: {error}").bright_red());
            Err(error.into())
        }
    }
}

async fn handle_monitor(matches: &ArgMatches<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = matches.value_of("telemetry").unwrap().parse()?;
    let duration = matches
        .value_of("duration")
        .map(str::parse::<u64>)
        .transpose()?
        .map(Duration::from_secs);

    let mut feed = SubEndpoint::connect(addr).await?;
    println!("{} {}", "monitoring".bright_blue(), addr);

    let deadline = duration.map(|d| tokio::time::Instant::now() + d);
    loop {
        let next = async {
            feed.ready().await;
            feed.try_next()
        };
        let envelope = tokio::select! {
            envelope = next => envelope,
            _ = tokio::signal::ctrl_c() => break,
            _ = sleep_until_opt(deadline) => break,
        };
        if let Some(envelope) = envelope {
            print_envelope(&envelope);
        }
    }
    println!("{}", "monitor stopped".dimmed());
    Ok(())
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn print_envelope(envelope: &Envelope) {
    let summary = match &envelope.message {
        Message::CcuRequest(request) => format!("{:?} request", request.kind),
        Message::CcuReply(reply) => format!("{:?} reply (train {})", reply.kind, reply.train_no),
        Message::Telegram(telegram) => {
            format!("{:?} {} -> {}", telegram.id, telegram.source, telegram.destination)
        }
        Message::Unsupported(unsupported) => {
            format!("unsupported tag {:#06x} ({} bytes)", unsupported.tag, unsupported.raw.len())
        }
    };
    println!(
        "{} {} {}",
        envelope.topic.bright_white(),
        "·".dimmed(),
        summary.bright_cyan()
    );
}

async fn handle_send(matches: &ArgMatches<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = matches.value_of("command").unwrap().parse()?;
    let name = matches.value_of("name").unwrap();
    let train: u16 = matches.value_of("train").unwrap().parse()?;

    let message = match matches.value_of("message").unwrap() {
        "grant-dva" => Message::Telegram(Telegram::response_dva(true)),
        "deny-dva" => Message::Telegram(Telegram::response_dva(false)),
        "ack-esd-text" => Message::Telegram(Telegram::response_esd_text()),
        "status-reply" => {
            Message::CcuReply(CcuReply::new(train, CcuKind::Status, vec![0; 16]))
        }
        other => {
            println!("{} unknown message {}", "✗".red(), other);
            return Ok(());
        }
    };

    let sender = PubEndpoint::connect(addr).await?;
    sender.publish(&Envelope::new(format!("{name}/cmd"), message))?;
    // Let the endpoint task flush the line before the process exits.
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("{} {}", "✓".green(), "command sent".bright_green());
    Ok(())
}
