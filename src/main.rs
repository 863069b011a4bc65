use clap::Parser;
use sip_agent::events::{self, PhoneEvent};
use sip_agent::{create_phone, utils, Config, Credentials, Phone, SessionRef};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// SIP Agent CLI Application
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// SIP server address (e.g., pbx.example.com or pbx.example.com:8089)
    #[arg(short, long, env = "SIP_SERVER")]
    server: Option<String>,

    /// Runtime config file with SIP_SERVER / SIP_PORT
    #[arg(short, long)]
    config: Option<String>,

    /// SIP server port
    #[arg(long, env = "SIP_PORT")]
    port: Option<u16>,

    /// Transport (udp/tcp/ws/wss)
    #[arg(long, default_value = "wss")]
    transport: String,

    /// Outbound proxy server (e.g., proxy.example.com:5060)
    #[arg(short, long)]
    outbound_proxy: Option<String>,

    /// Agent extension
    #[arg(short, long, env = "SIP_USER")]
    user: Option<String>,

    /// SIP password
    #[arg(short, long, env = "SIP_PASSWORD")]
    password: Option<String>,

    /// Display name
    #[arg(short, long, env = "SIP_DISPLAY_NAME")]
    display_name: Option<String>,

    /// Extension to call right after login
    #[arg(short, long, env = "SIP_TARGET")]
    target: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    utils::initialize_logging(args.log_level.as_str());

    let config = build_config(&args)?;
    let user = args.user.clone().ok_or("SIP user is required")?;
    let password = args.password.clone().unwrap_or_default();

    info!("Creating phone for {} via {}", user, config.endpoint_url());

    let (listener, mut phone_events) = events::channel();
    let phone = create_phone(config, listener)?;

    let credentials = Credentials::new(user, password, phone.config().display_name.clone());
    phone.login(credentials).await?;

    if let Some(target) = &args.target {
        if let Err(e) = phone.call(target).await {
            error!("Call failed: {} ({})", e, e.error_code());
        }
    }

    print_help();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut ringing: Option<SessionRef> = None;

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                if !run_command(&phone, line.trim(), &mut ringing).await {
                    break;
                }
            }
            Some(event) = phone_events.recv() => {
                print_event(&event, &mut ringing);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C");
                break;
            }
        }
    }

    info!("Shutting down...");
    phone.shutdown().await;
    Ok(())
}

fn build_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match (&args.config, &args.server) {
        (_, Some(server)) => Config::new(server)?,
        (Some(path), None) => Config::from_runtime_file(path)?,
        (None, None) => return Err("SIP server address is required".into()),
    };

    config = config.with_transport(&args.transport)?;
    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    if let Some(proxy) = &args.outbound_proxy {
        config = config.with_outbound_proxy(proxy.clone());
    }
    if let Some(display_name) = &args.display_name {
        config = config.with_display_name(display_name.clone());
    }
    Ok(config)
}

fn print_help() {
    println!("Commands: call <ext> | answer | reject | hangup | mute | unmute | online | status | quit");
}

/// 执行一条命令，返回 false 表示退出
async fn run_command(phone: &Phone, line: &str, ringing: &mut Option<SessionRef>) -> bool {
    let (command, arg) = match line.split_once(char::is_whitespace) {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "call" if !arg.is_empty() => match phone.call(arg).await {
            Ok(session) => info!("Calling {} (session {})", arg, session.id()),
            Err(e) => error!("Call failed: {} ({})", e, e.error_code()),
        },
        "answer" => match ringing.take() {
            Some(session) => {
                if let Err(e) = phone.accept_call(&session).await {
                    error!("Answer failed: {} ({})", e, e.error_code());
                }
            }
            None => warn!("No incoming call"),
        },
        "reject" => match ringing.take() {
            Some(session) => phone.reject_call(&session).await,
            None => warn!("No incoming call"),
        },
        "hangup" => phone.hangup(phone.active_session()).await,
        "mute" => phone.toggle_mute(true),
        "unmute" => phone.toggle_mute(false),
        "online" => {
            if phone.network_online().is_none() {
                info!("Connection alive or reconnection not needed");
            }
        }
        "status" => {
            println!(
                "connected: {}, registration: {}, active call: {}",
                phone.is_connected(),
                phone
                    .registration_state()
                    .map(|s| s.as_str())
                    .unwrap_or("logged out"),
                phone
                    .active_session()
                    .map(|s| format!("{} {} ({})", s.remote_identity(), s.state(), s.id()))
                    .unwrap_or_else(|| "none".to_string())
            );
        }
        "quit" | "exit" => return false,
        _ => print_help(),
    }
    true
}

fn print_event(event: &PhoneEvent, ringing: &mut Option<SessionRef>) {
    match event {
        PhoneEvent::Registered => println!("✔ Registered"),
        PhoneEvent::Unregistered => println!("Unregistered"),
        PhoneEvent::RegistrationFailed(e) => println!("✘ Registration failed: {}", e),
        PhoneEvent::IncomingCall { session, caller } => {
            println!("📞 Incoming call from {} (answer / reject)", caller);
            *ringing = Some(session.clone());
        }
        PhoneEvent::CallEstablished(session) => {
            println!("✅ Call established with {}", session.remote_identity())
        }
        PhoneEvent::CallEnded => {
            println!("Call ended");
            if ringing.as_ref().map(|s| s.state().is_terminal()).unwrap_or(false) {
                *ringing = None;
            }
        }
        PhoneEvent::Debug(message) => info!("{}", message),
    }
}
