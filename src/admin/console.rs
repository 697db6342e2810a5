//! Line-oriented administrative console served over TCP.

use crate::admin::command::{Command, TargetRef, HELP};
use crate::backend::algorithms::AlgorithmChain;
use crate::backend::{AdminError, DispatcherHandle, TargetRegistry};
use crate::util::ShutdownListener;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

const PROMPT: &str = "tcplb> ";

/// Longest command line accepted, newline excluded.
const MAX_LINE_LEN: usize = 1024;

const LINE_TOO_LONG: &str = "Line too long\n";

/// Everything the console can inspect or change.
#[derive(Clone)]
pub struct ConsoleContext {
    pub registry: Arc<TargetRegistry>,
    pub chain: AlgorithmChain,
    pub dispatcher: DispatcherHandle,
}

/// Administrative console listener.
pub struct AdminConsole {
    listener: TcpListener,
    ctx: ConsoleContext,
}

impl AdminConsole {
    pub async fn bind(address: SocketAddr, ctx: ConsoleContext) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept console sessions until shutdown.
    pub async fn run(self, mut shutdown: ShutdownListener) {
        info!(address = ?self.listener.local_addr().ok(), "admin console started");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "console session opened");
                            let ctx = self.ctx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = session(stream, ctx).await {
                                    warn!(peer = %peer, error = %e, "console session failed");
                                }
                                debug!(peer = %peer, "console session closed");
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept console connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("admin console shutting down");
                    break;
                }
            }
        }
    }
}

/// What to do after a command has been handled.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Quit,
}

async fn session(stream: TcpStream, ctx: ConsoleContext) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut interactive = false;

    loop {
        if interactive {
            writer.write_all(PROMPT.as_bytes()).await?;
        }

        line.clear();
        let read = (&mut reader)
            .take(MAX_LINE_LEN as u64 + 1)
            .read_line(&mut line)
            .await?;
        if read == 0 {
            return Ok(());
        }
        if line.len() > MAX_LINE_LEN && !line.ends_with('\n') {
            warn!(limit = MAX_LINE_LEN, "console line too long, closing session");
            writer.write_all(LINE_TOO_LONG.as_bytes()).await?;
            return writer.shutdown().await;
        }

        let reply = match Command::parse(line.trim_end_matches(['\r', '\n'])) {
            // A blank line turns on the prompt for the rest of the session.
            Ok(None) => {
                interactive = true;
                continue;
            }
            Ok(Some(command)) => {
                debug!(?command, "console command");
                execute(&ctx, command).await
            }
            Err(e) => Reply::Text(e.to_string()),
        };

        match reply {
            Reply::Text(mut text) => {
                if !text.ends_with('\n') {
                    text.push('\n');
                }
                writer.write_all(text.as_bytes()).await?;
            }
            Reply::Quit => return writer.shutdown().await,
        }
    }
}

/// Run one command against the balancer.
pub async fn execute(ctx: &ConsoleContext, command: Command) -> Reply {
    let text = match command {
        Command::Stats => stats(ctx),
        Command::MemStats => memstats(ctx).await,
        Command::Conns => conns(ctx),
        Command::Help => HELP.to_string(),
        Command::Quit => return Reply::Quit,
        Command::AddGroup(index) => match ctx.registry.add_group(index) {
            Ok(()) => format!("New target group added at position {}", index),
            Err(e) => admin_failure(e),
        },
        Command::RemoveGroup(index) => match ctx.registry.remove_group(index) {
            Ok(()) => format!("Target group at position {} removed", index),
            Err(e) => admin_failure(e),
        },
        Command::Add(target) => match resolve(&target).await {
            Ok(address) => match ctx.registry.add_target(target.group, address) {
                Ok(_) => "New target added".to_string(),
                Err(e) => admin_failure(e),
            },
            Err(text) => text,
        },
        Command::Remove(target) => match resolve(&target).await {
            Ok(address) => match ctx.registry.remove_target(target.group, address) {
                Ok(()) => "Target removed".to_string(),
                Err(e) => admin_failure(e),
            },
            Err(text) => text,
        },
        Command::Enable(target) => match resolve(&target).await {
            Ok(address) => match ctx.registry.enable_target(target.group, address) {
                Ok(()) => "Target enabled".to_string(),
                Err(e) => admin_failure(e),
            },
            Err(text) => text,
        },
        Command::Disable(target) => match resolve(&target).await {
            Ok(address) => match ctx.registry.disable_target(target.group, address) {
                Ok(()) => "Target disabled".to_string(),
                Err(e) => admin_failure(e),
            },
            Err(text) => text,
        },
    };
    Reply::Text(text)
}

fn admin_failure(error: AdminError) -> String {
    match error {
        AdminError::NoSuchGroup(_) | AdminError::InvalidGroupIndex { .. } => {
            format!("Invalid target group: {}", error)
        }
        AdminError::NoSuchTarget { .. } => format!("No matching target found: {}", error),
        AdminError::DuplicateTarget(_) => error.to_string(),
    }
}

async fn resolve(target: &TargetRef) -> Result<SocketAddr, String> {
    match lookup_host((target.host.as_str(), target.port)).await {
        Ok(mut addresses) => addresses
            .next()
            .ok_or_else(|| format!("Host not found: {}", target.host)),
        Err(e) => Err(format!("Host not found: {}: {}", target.host, e)),
    }
}

fn stats(ctx: &ConsoleContext) -> String {
    let mut out = String::new();
    for group in ctx.registry.snapshot() {
        let _ = writeln!(out, "Target group {}:", group.index);
        for target in group.targets {
            let _ = writeln!(
                out,
                "  {} ({})",
                target.address,
                if target.enabled { "enabled" } else { "disabled" }
            );
            let _ = writeln!(out, "    active connections: {}", target.active_connections);
            let _ = writeln!(out, "    total connections: {}", target.total_connections);
            let _ = writeln!(out, "    bytes client->server: {}", target.bytes_client_to_server);
            let _ = writeln!(out, "    bytes server->client: {}", target.bytes_server_to_client);
            let _ = writeln!(out, "    failure count: {}", target.failure_count);
        }
    }
    out
}

async fn memstats(ctx: &ConsoleContext) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Dispatcher:");
    let _ = writeln!(out, "  {} clients in flight", ctx.dispatcher.in_flight());

    for algorithm in ctx.chain.load().iter() {
        let _ = writeln!(out, "Algorithm {}:", algorithm.name());
        for (table, entries) in algorithm.table_sizes() {
            let _ = writeln!(out, "  {} entries in {}", entries, table);
        }
    }

    for (index, group) in ctx.registry.groups().iter().enumerate() {
        let _ = writeln!(out, "Target group {}:", index);
        for target in group.targets() {
            let _ = writeln!(out, "  {}", target.address());
            let _ = writeln!(out, "    {} tracked connections", target.active_connections());
            match target.relay_snapshot().await {
                Some(relay) => {
                    let _ = writeln!(out, "    {} pairs in relay", relay.pairs);
                    let _ = writeln!(out, "    {} watched sockets", relay.watched);
                    let _ = writeln!(out, "    {} suspended sources", relay.suspended);
                }
                None => {
                    let _ = writeln!(out, "    relay stopped");
                }
            }
        }
    }
    out
}

fn conns(ctx: &ConsoleContext) -> String {
    let mut out = String::new();
    for (index, group) in ctx.registry.groups().iter().enumerate() {
        let _ = writeln!(out, "Target group {}:", index);
        for target in group.targets() {
            let _ = writeln!(out, "  {}", target.address());
            for connection in target.connections() {
                let _ = writeln!(out, "    {}", connection);
            }
        }
    }
    out
}
