//! chainwatch CLI — inspect and manage watcher state.
//!
//! Usage:
//! ```bash
//! chainwatch info
//! chainwatch demo
//! chainwatch version
//! ```

use std::env;
use std::process;

use tracing_subscriber::EnvFilter;

mod demo;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "info" => cmd_info(),
        "demo" => {
            if let Err(e) = demo::run().await {
                eprintln!("demo failed: {e}");
                process::exit(1);
            }
        }
        "version" | "--version" | "-V" => {
            println!("chainwatch {}", env!("CARGO_PKG_VERSION"));
        }
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    println!("chainwatch {}", env!("CARGO_PKG_VERSION"));
    println!("Resumable, idempotent contract-event watcher\n");
    println!("USAGE:");
    println!("    chainwatch <COMMAND>\n");
    println!("COMMANDS:");
    println!("    info     Show ChainWatch configuration info");
    println!("    demo     Run an end-to-end in-memory ingestion demo");
    println!("    version  Print version");
    println!("    help     Print this help");
}

fn cmd_info() {
    println!("ChainWatch v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default sync response timeout: 30s");
    println!("  Default broker reconnect backoff: 500ms → 60s");
    println!("  Storage backends: memory, SQLite (feature: sqlite), Postgres (feature: postgres)");
    println!("  Broker backends: memory, AMQP (feature: amqp)");
}
