//! Host agent CLI: run the agent or talk to a running one.

mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use hostagent_kernel::config::load_config;
use hostagent_kernel::keystore::AgentKeys;
use hostagent_kernel::HostKernel;
use hostagent_types::config::PlatformConfig;
use hostagent_wire::{ClientConfig, PeerConnection, TcpTransport};
use serde_json::{Map, Value};
use std::process;
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &PlatformConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => fail(format!("cannot start async runtime: {e}")),
    }
}

fn fail(message: String) -> ! {
    eprintln!("error: {message}");
    process::exit(1);
}

fn main() {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());
    init_tracing(&config);

    match cli.command {
        Commands::Run => cmd_run(config),
        Commands::Call {
            method,
            args,
            kwargs,
            address,
            peer,
        } => {
            let kwargs = parse_kwargs(kwargs.as_deref());
            let args = args.iter().map(|a| parse_arg(a)).collect();
            cmd_call(&config, address, peer, &method, args, kwargs);
        }
        Commands::Manage { address, identity } => {
            let mut kwargs = Map::new();
            kwargs.insert("address".into(), Value::String(address));
            kwargs.insert("identity".into(), Value::String(identity));
            cmd_call(&config, None, None, "manage", Vec::new(), kwargs);
        }
        Commands::Pubkey => cmd_pubkey(&config),
    }
}

fn cmd_run(config: PlatformConfig) {
    runtime().block_on(async move {
        let kernel = match HostKernel::boot(config).await {
            Ok(k) => k,
            Err(e) => fail(format!("boot failed: {e}")),
        };
        println!("Host agent listening on {}", kernel.vip_address());
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for ctrl-c: {e}");
        }
        kernel.shutdown().await;
    });
}

fn cmd_call(
    config: &PlatformConfig,
    address: Option<String>,
    peer: Option<String>,
    method: &str,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
) {
    let address = address.unwrap_or_else(|| config.vip_address.clone());
    let peer = peer.unwrap_or_else(|| config.identity.clone());
    let public_key = match AgentKeys::load_or_create(&config.home()) {
        Ok(keys) => keys.public,
        Err(e) => fail(format!("cannot load keys: {e}")),
    };

    let transport = TcpTransport::new(ClientConfig {
        identity: "hostagent.cli".to_string(),
        unique_suffix: true,
        public_key,
        shared_secret: config.network.shared_secret.clone(),
    });
    let timeout = config.timeouts.rpc();
    let connect_timeout = config.timeouts.connect();

    let result = runtime().block_on(async move {
        let conn = transport.connect(&address).map_err(|e| e.to_string())?;
        let conn: std::sync::Arc<dyn PeerConnection> = conn;
        tokio::spawn(std::sync::Arc::clone(&conn).run());
        match tokio::time::timeout(connect_timeout, conn.ready()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(format!("cannot connect to {address}: {e}")),
            Err(_) => return Err(format!("timed out connecting to {address}")),
        }
        match tokio::time::timeout(timeout, conn.call(&peer, method, args, kwargs)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("{peer}.{method} timed out")),
        }
    });

    match result {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(text) => println!("{text}"),
            Err(e) => fail(e.to_string()),
        },
        Err(e) => fail(e),
    }
}

fn cmd_pubkey(config: &PlatformConfig) {
    match AgentKeys::load_or_create(&config.home()) {
        Ok(keys) => println!("{}", keys.public),
        Err(e) => fail(format!("cannot load keys: {e}")),
    }
}

/// Parse a positional argument as JSON, keeping bare words as strings.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_kwargs(raw: Option<&str>) -> Map<String, Value> {
    match raw.map(serde_json::from_str::<Value>) {
        None => Map::new(),
        Some(Ok(Value::Object(map))) => map,
        Some(Ok(_)) => fail("--kwargs must be a JSON object".to_string()),
        Some(Err(e)) => fail(format!("--kwargs is not valid JSON: {e}")),
    }
}
