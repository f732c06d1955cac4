//! lockdemo: a console around the interruptible-rpc lock service.
//!
//! Start a server in one terminal and two clients in others. Have the
//! first client `acquire`, have the second `acquire` too (it blocks), then
//! `cancel` the second: its connection is torn down and the server-side
//! handler stops waiting for the lock on its behalf.
//!
//! ```bash
//! lockdemo serve
//! lockdemo client
//! lockdemo demo          # both sides in one process, scripted
//! ```

use clap::{Args, Parser, Subcommand};
use interruptible_rpc::lock::DEFAULT_LOCK_ADDR;
use interruptible_rpc::{
    CallRegistry, CancelReason, Cx, LockClient, LockService, RpcClient, RpcConfig, RpcServer,
    Ticket, TransportFactory, UnitFactory, UnitHandle,
};
use parking_lot::Mutex;
use std::io::{self, BufRead, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "lockdemo",
    version,
    about = "Interactive console for the interruptible lock service",
    long_about = "Runs the lock service or a client for it.\n\n\
        A client waiting for the lock can be cancelled; the server notices\n\
        the dropped connection and never hands the lock to it."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML file with transport settings (environment overrides it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the lock service; reads `unlock` and `exit` from stdin
    Serve(AddrArgs),

    /// Connect a console client; reads `acquire`, `cancel`, `release`, `status`, `quit`
    Client(AddrArgs),

    /// Run a scripted server and clients in one process
    Demo,
}

#[derive(Args, Debug)]
struct AddrArgs {
    /// Service address
    #[arg(long, default_value = DEFAULT_LOCK_ADDR)]
    addr: String,
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_thread_names(true)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<RpcConfig, String> {
    let config = match path {
        Some(path) => RpcConfig::from_toml_file(path),
        None => RpcConfig::from_env(),
    };
    config.map_err(|e| format!("configuration: {e}"))
}

fn resolve(addr: &str) -> Result<SocketAddr, String> {
    addr.to_socket_addrs()
        .map_err(|e| format!("cannot resolve {addr}: {e}"))?
        .next()
        .ok_or_else(|| format!("{addr} resolved to no address"))
}

fn prompt(label: &str) {
    print!("{label}> ");
    let _ = io::stdout().flush();
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

fn cmd_serve(args: &AddrArgs, config: &RpcConfig) -> Result<(), String> {
    let lock = LockService::new();
    let server = RpcServer::bind(
        args.addr.as_str(),
        CallRegistry::shared(),
        Arc::new(lock.clone()),
        config,
    )
    .map_err(|e| format!("cannot listen on {}: {e}", args.addr))?;
    server
        .start()
        .map_err(|e| format!("cannot start server: {e}"))?;
    println!(
        "lock service on {} (commands: unlock, exit)",
        server.local_addr()
    );

    prompt("serve");
    for line in io::stdin().lock().lines() {
        let line = line.map_err(|e| format!("stdin: {e}"))?;
        match line.trim() {
            "" => {}
            "unlock" => match lock.force_release() {
                Some(ticket) => println!("released {ticket}"),
                None => println!("lock was free"),
            },
            "exit" => break,
            other => println!("unknown command {other:?}"),
        }
        prompt("serve");
    }

    lock.shutdown();
    server.shutdown();
    println!("bye");
    Ok(())
}

// ---------------------------------------------------------------------------
// client
// ---------------------------------------------------------------------------

type Pending = UnitHandle<interruptible_rpc::Result<Ticket>>;

struct Console {
    client: LockClient,
    units: UnitFactory,
    cx: Cx,
    held: Arc<Mutex<Option<Ticket>>>,
    pending: Option<Pending>,
}

impl Console {
    fn new(endpoint: SocketAddr, config: &RpcConfig) -> Self {
        let registry = CallRegistry::shared();
        let transport = TransportFactory::with_config(Arc::clone(&registry), config);
        Self {
            client: LockClient::new(RpcClient::with_config(transport, endpoint, config)),
            units: UnitFactory::from_config(Arc::clone(&registry), config),
            cx: Cx::new(registry),
            held: Arc::new(Mutex::new(None)),
            pending: None,
        }
    }

    /// Collects a finished background acquire so its failure gets reported.
    fn reap(&mut self) {
        if self.pending.as_ref().is_some_and(UnitHandle::is_finished) {
            if let Some(handle) = self.pending.take() {
                report_acquire(handle);
            }
        }
    }

    fn acquire(&mut self) {
        if self.pending.is_some() {
            println!("an acquire is already pending; `cancel` it first");
            return;
        }
        if let Some(ticket) = *self.held.lock() {
            println!("already holding {ticket}");
            return;
        }
        let client = self.client.clone();
        let held = Arc::clone(&self.held);
        let spawned = self.units.spawn(move |cx| {
            let result = client.acquire(cx);
            if let Ok(ticket) = &result {
                *held.lock() = Some(*ticket);
                println!("\nacquired {ticket}");
            }
            result
        });
        match spawned {
            Ok(handle) => {
                println!("acquiring in unit {}", handle.id());
                self.pending = Some(handle);
            }
            Err(e) => println!("cannot start acquire: {e}"),
        }
    }

    fn cancel(&mut self) {
        let Some(handle) = self.pending.take() else {
            println!("nothing to cancel");
            return;
        };
        if handle.cancel_with(CancelReason::user("console cancel")) {
            info!(unit = %handle.id(), "acquire cancelled from console");
        }
        report_acquire(handle);
    }

    fn release(&self) {
        let Some(ticket) = self.held.lock().take() else {
            println!("not holding the lock");
            return;
        };
        match self.client.release(&self.cx, ticket) {
            Ok(()) => println!("released {ticket}"),
            Err(e) => println!("release failed: {e}"),
        }
    }

    fn status(&self) {
        match self.client.status(&self.cx) {
            Ok(status) => println!(
                "held={} waiters={} shutting_down={}",
                status.held, status.waiters, status.shutting_down
            ),
            Err(e) => println!("status failed: {e}"),
        }
    }

    fn quit(&mut self) {
        if self.pending.is_some() {
            self.cancel();
        }
        if self.held.lock().is_some() {
            self.release();
        }
    }
}

fn report_acquire(handle: Pending) {
    match handle.join() {
        Ok(Ok(_)) => {}
        Ok(Err(e)) if e.is_cancelled() => println!("acquire cancelled ({e})"),
        Ok(Err(e)) => println!("acquire failed: {e}"),
        Err(_) => warn!("acquire unit panicked"),
    }
}

fn cmd_client(args: &AddrArgs, config: &RpcConfig) -> Result<(), String> {
    let endpoint = resolve(&args.addr)?;
    let mut console = Console::new(endpoint, config);
    println!("lock client for {endpoint} (commands: acquire, cancel, release, status, quit)");

    prompt("client");
    for line in io::stdin().lock().lines() {
        let line = line.map_err(|e| format!("stdin: {e}"))?;
        console.reap();
        match line.trim() {
            "" => {}
            "acquire" => console.acquire(),
            "cancel" => console.cancel(),
            "release" => console.release(),
            "status" => console.status(),
            "quit" => break,
            other => println!("unknown command {other:?}"),
        }
        prompt("client");
    }

    console.quit();
    Ok(())
}

// ---------------------------------------------------------------------------
// demo
// ---------------------------------------------------------------------------

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) -> Result<(), String> {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        if Instant::now() >= deadline {
            return Err(format!("timed out waiting for {what}"));
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

fn cmd_demo(config: &RpcConfig) -> Result<(), String> {
    let lock = LockService::new();
    let server = RpcServer::bind(
        "127.0.0.1:0",
        CallRegistry::shared(),
        Arc::new(lock.clone()),
        config,
    )
    .map_err(|e| format!("cannot listen: {e}"))?;
    server
        .start()
        .map_err(|e| format!("cannot start server: {e}"))?;
    println!("[1/5] lock service on {}", server.local_addr());

    let registry = CallRegistry::shared();
    let client = LockClient::new(RpcClient::with_config(
        TransportFactory::with_config(Arc::clone(&registry), config),
        server.local_addr(),
        config,
    ));
    let units = UnitFactory::from_config(Arc::clone(&registry), config);
    let cx = Cx::new(registry);

    let first = client
        .acquire(&cx)
        .map_err(|e| format!("first acquire: {e}"))?;
    println!("[2/5] first client holds {first}");

    let waiter_client = client.clone();
    let waiter = units
        .spawn(move |cx| waiter_client.acquire(cx))
        .map_err(|e| format!("cannot start waiter: {e}"))?;
    wait_for("second client to block", || lock.waiters() == 1)?;
    println!("[3/5] second client is blocked in unit {}", waiter.id());

    waiter.cancel_with(CancelReason::user("demo"));
    match waiter.join() {
        Ok(Err(e)) if e.is_cancelled() => println!("[4/5] second client cancelled: {e}"),
        Ok(Err(e)) => return Err(format!("second client failed unexpectedly: {e}")),
        Ok(Ok(ticket)) => return Err(format!("second client was granted {ticket}")),
        Err(_) => return Err("second client panicked".into()),
    }
    wait_for("server to abandon the wait", || lock.waiters() == 0)?;

    client
        .release(&cx, first)
        .map_err(|e| format!("release: {e}"))?;
    let third = client
        .acquire(&cx)
        .map_err(|e| format!("third acquire: {e}"))?;
    println!("[5/5] lock went straight to a third client: {third}");
    client
        .release(&cx, third)
        .map_err(|e| format!("release: {e}"))?;

    lock.shutdown();
    server.shutdown();
    Ok(())
}

fn run(command: &Command, config: &RpcConfig) -> Result<(), String> {
    match command {
        Command::Serve(args) => cmd_serve(args, config),
        Command::Client(args) => cmd_client(args, config),
        Command::Demo => cmd_demo(config),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let result = load_config(cli.config.as_deref()).and_then(|config| run(&cli.command, &config));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("Error: {msg}");
            ExitCode::FAILURE
        }
    }
}
