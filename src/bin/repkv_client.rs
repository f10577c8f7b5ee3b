//! repkv-client: a command-line client for the replicated store.
//!
//! Usage:
//!
//! ```text
//! repkv-client <host:port>                  interactive mode
//! repkv-client <host:port> -e "put k v"     one-shot mode
//! ```
//!
//! Commands: `put <key> <value>`, `update <key> <value>`, `delete <key>`,
//! `get <key>`, `ls`, `dumpcache <directory>`, `clearcache`, `help`,
//! `exit` (interactive mode only).

use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use replicated_kv::client::{ClientOptions, KvClient};
use replicated_kv::types::MutationResult;

const PROMPT: &str = "repkv> ";

fn print_help() {
    println!("Commands:");
    println!("  put <key> <value>");
    println!("  update <key> <value>");
    println!("  delete <key>");
    println!("  get <key>");
    println!("  ls");
    println!("  dumpcache <directory>");
    println!("  clearcache");
    println!("  help");
    println!("  exit (interactive mode only)");
}

fn report_mutation(result: MutationResult) -> bool {
    if result.is_success() {
        println!("succeeded");
        true
    } else if !result.was_accepted() {
        println!(
            "append log failed, rc={}: {}",
            result.raft_rc, result.raft_msg
        );
        false
    } else {
        println!("mutation failed, rc={}", result.engine_rc);
        false
    }
}

async fn handle_command(client: &KvClient, tokens: &[String]) -> bool {
    if tokens.is_empty() {
        return false;
    }
    let cmd = tokens[0].to_lowercase();

    match cmd.as_str() {
        "put" | "update" if tokens.len() >= 3 => {
            let result = if cmd == "put" {
                client.put(tokens[1].as_bytes(), tokens[2].as_bytes()).await
            } else {
                client
                    .update(tokens[1].as_bytes(), tokens[2].as_bytes())
                    .await
            };
            match result {
                Ok(r) => report_mutation(r),
                Err(e) => {
                    eprintln!("ERROR: {e}");
                    false
                }
            }
        }
        "delete" if tokens.len() >= 2 => match client.delete(tokens[1].as_bytes()).await {
            Ok(r) => report_mutation(r),
            Err(e) => {
                eprintln!("ERROR: {e}");
                false
            }
        },
        "get" if tokens.len() >= 2 => match client.get(tokens[1].as_bytes()).await {
            Ok(result) => match result.value {
                Some(value) => {
                    println!("value: {}", String::from_utf8_lossy(&value));
                    true
                }
                None => {
                    println!("get failed, rc={}", result.rc);
                    false
                }
            },
            Err(e) => {
                eprintln!("ERROR: {e}");
                false
            }
        },
        "ls" => {
            let servers = match client.all_servers().await {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("ERROR: {e}");
                    return false;
                }
            };
            let leader = client
                .leader_id_with_backoff()
                .await
                .unwrap_or(replicated_kv::types::NO_LIVE_LEADER);

            println!("server id : client-facing endpoint");
            for server in servers {
                let extra = if server.id == leader { " (LEADER)" } else { "" };
                println!("{} : {}{}", server.id, server.client_endpoint, extra);
            }
            true
        }
        "dumpcache" if tokens.len() >= 2 => {
            client.trigger_cache_dumps(&tokens[1]).await;
            true
        }
        "clearcache" => {
            client.trigger_cache_clear().await;
            true
        }
        "help" => {
            print_help();
            true
        }
        _ => {
            eprintln!("ERROR: unrecognized command");
            false
        }
    }
}

fn tokenize(line: &str) -> Vec<String> {
    line.split_whitespace().map(String::from).collect()
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: {} <host:port> [-e \"<command> <args...>\"]", args[0]);
        return ExitCode::FAILURE;
    }

    let Some((host, port)) = args[1]
        .rsplit_once(':')
        .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h.to_string(), p)))
    else {
        eprintln!("ERROR: endpoint has invalid format, expected <host>:<port>");
        return ExitCode::FAILURE;
    };

    let client = match KvClient::connect(&host, port, ClientOptions::default()).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return ExitCode::FAILURE;
        }
    };

    // One-shot mode.
    if args.len() >= 4 && args[2] == "-e" {
        let tokens = tokenize(&args[3]);
        return if handle_command(&client, &tokens).await {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    // Interactive mode.
    let stdin = io::stdin();
    let mut retcode = ExitCode::SUCCESS;
    loop {
        print!("{PROMPT}");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let tokens = tokenize(&line);
        if tokens.first().map(String::as_str) == Some("exit") {
            break;
        }
        retcode = if handle_command(&client, &tokens).await {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    retcode
}
