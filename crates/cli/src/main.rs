//! # CLI - TideDB Interactive Shell
//!
//! A REPL over the TideDB engine for manual inspection. Reads commands from
//! stdin, runs them against a standalone engine and prints the results.
//! Works interactively and with piped input.
//!
//! ## Commands
//!
//! ```text
//! CREATE db [indices]          Create a database (default: 1 index)
//! DROP db                      Delete a database
//! COPY src dest                Copy a database
//! DBS                          List databases
//! PUT db index key value       Insert or update a key
//! GET db index key             Look up a key (prints value or "(nil)")
//! DEL db index key             Delete a key
//! SCAN db index [prefix]       Prefix lookup (all keys without a prefix)
//! RANGE db index from to       Range lookup (inclusive from, exclusive to)
//! SNAP db name index...        Create a persistent snapshot of some indices
//! SNAPGET db name index key    Look up a key in a snapshot
//! UNSNAP db name               Delete a snapshot
//! SNAPS db                     List the snapshots of a database
//! CHECKPOINT                   Flush overlays and prune the log
//! LSN                          Print the latest log sequence number
//! STATS                        Print engine debug info
//! EXIT / QUIT                  Shut down gracefully
//! ```
//!
//! ## Configuration
//!
//! Read from `TIDEDB_*` environment variables, see the `config` crate.
//! Replication needs a transport and is not available here. Set `RUST_LOG`
//! for engine logs on stderr.

use anyhow::Result;
use config::EngineConfig;
use engine::{Engine, SnapshotConfig};
use log::info;
use std::io::{self, BufRead, Write};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Create { db: String, indices: usize },
    Drop { db: String },
    Copy { source: String, dest: String },
    Dbs,
    Put { db: String, index: usize, key: String, value: String },
    Get { db: String, index: usize, key: String },
    Del { db: String, index: usize, key: String },
    Scan { db: String, index: usize, prefix: String },
    Range { db: String, index: usize, from: String, to: String },
    Snap { db: String, name: String, indices: Vec<usize> },
    SnapGet { db: String, name: String, index: usize, key: String },
    Unsnap { db: String, name: String },
    Snaps { db: String },
    Checkpoint,
    Lsn,
    Stats,
    Exit,
}

fn parse_index(raw: Option<&str>, usage: &str) -> Result<usize, String> {
    raw.ok_or_else(|| format!("usage: {}", usage))?
        .parse()
        .map_err(|_| format!("index must be a number; usage: {}", usage))
}

fn arg(raw: Option<&str>, usage: &str) -> Result<String, String> {
    raw.map(str::to_string)
        .ok_or_else(|| format!("usage: {}", usage))
}

impl Command {
    /// Parses one input line. `Ok(None)` for a blank line.
    fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Ok(None);
        };
        let cmd = match cmd.to_uppercase().as_str() {
            "CREATE" => {
                const USAGE: &str = "CREATE db [indices]";
                let db = arg(parts.next(), USAGE)?;
                let indices = match parts.next() {
                    Some(n) => parse_index(Some(n), USAGE)?,
                    None => 1,
                };
                Command::Create { db, indices }
            }
            "DROP" => Command::Drop {
                db: arg(parts.next(), "DROP db")?,
            },
            "COPY" => Command::Copy {
                source: arg(parts.next(), "COPY src dest")?,
                dest: arg(parts.next(), "COPY src dest")?,
            },
            "DBS" => Command::Dbs,
            "PUT" => {
                const USAGE: &str = "PUT db index key value";
                let db = arg(parts.next(), USAGE)?;
                let index = parse_index(parts.next(), USAGE)?;
                let key = arg(parts.next(), USAGE)?;
                let value = parts.collect::<Vec<&str>>().join(" ");
                if value.is_empty() {
                    return Err(format!("usage: {}", USAGE));
                }
                Command::Put { db, index, key, value }
            }
            "GET" => {
                const USAGE: &str = "GET db index key";
                Command::Get {
                    db: arg(parts.next(), USAGE)?,
                    index: parse_index(parts.next(), USAGE)?,
                    key: arg(parts.next(), USAGE)?,
                }
            }
            "DEL" => {
                const USAGE: &str = "DEL db index key";
                Command::Del {
                    db: arg(parts.next(), USAGE)?,
                    index: parse_index(parts.next(), USAGE)?,
                    key: arg(parts.next(), USAGE)?,
                }
            }
            "SCAN" => {
                const USAGE: &str = "SCAN db index [prefix]";
                Command::Scan {
                    db: arg(parts.next(), USAGE)?,
                    index: parse_index(parts.next(), USAGE)?,
                    prefix: parts.next().unwrap_or("").to_string(),
                }
            }
            "RANGE" => {
                const USAGE: &str = "RANGE db index from to";
                Command::Range {
                    db: arg(parts.next(), USAGE)?,
                    index: parse_index(parts.next(), USAGE)?,
                    from: arg(parts.next(), USAGE)?,
                    to: arg(parts.next(), USAGE)?,
                }
            }
            "SNAP" => {
                const USAGE: &str = "SNAP db name index...";
                let db = arg(parts.next(), USAGE)?;
                let name = arg(parts.next(), USAGE)?;
                let indices = parts
                    .map(|i| parse_index(Some(i), USAGE))
                    .collect::<Result<Vec<_>, _>>()?;
                if indices.is_empty() {
                    return Err(format!("usage: {}", USAGE));
                }
                Command::Snap { db, name, indices }
            }
            "SNAPGET" => {
                const USAGE: &str = "SNAPGET db name index key";
                Command::SnapGet {
                    db: arg(parts.next(), USAGE)?,
                    name: arg(parts.next(), USAGE)?,
                    index: parse_index(parts.next(), USAGE)?,
                    key: arg(parts.next(), USAGE)?,
                }
            }
            "UNSNAP" => Command::Unsnap {
                db: arg(parts.next(), "UNSNAP db name")?,
                name: arg(parts.next(), "UNSNAP db name")?,
            },
            "SNAPS" => Command::Snaps {
                db: arg(parts.next(), "SNAPS db")?,
            },
            "CHECKPOINT" => Command::Checkpoint,
            "LSN" => Command::Lsn,
            "STATS" => Command::Stats,
            "EXIT" | "QUIT" => Command::Exit,
            other => return Err(format!("unknown command: {}", other)),
        };
        Ok(Some(cmd))
    }
}

fn print_value(value: Option<Vec<u8>>) {
    match value {
        Some(v) => println!("{}", String::from_utf8_lossy(&v)),
        None => println!("(nil)"),
    }
}

fn print_pairs<I>(pairs: I) -> engine::Result<()>
where
    I: Iterator<Item = engine::Result<(Vec<u8>, Vec<u8>)>>,
{
    let mut n = 0;
    for pair in pairs {
        let (k, v) = pair?;
        println!("{} -> {}", String::from_utf8_lossy(&k), String::from_utf8_lossy(&v));
        n += 1;
    }
    if n == 0 {
        println!("(empty)");
    } else {
        println!("({} entries)", n);
    }
    Ok(())
}

/// Runs one command. Errors are printed by the caller.
fn run(engine: &Engine, cmd: Command) -> engine::Result<()> {
    match cmd {
        Command::Create { db, indices } => {
            let db = engine.create_database(&db, indices)?;
            println!("OK (id={})", db.id());
        }
        Command::Drop { db } => {
            engine.delete_database(&db)?;
            println!("OK");
        }
        Command::Copy { source, dest } => {
            engine.copy_database(&source, &dest)?;
            println!("OK");
        }
        Command::Dbs => {
            let names = engine.database_names();
            if names.is_empty() {
                println!("(empty)");
            }
            for name in names {
                println!("{}", name);
            }
        }
        Command::Put { db, index, key, value } => {
            engine.database(&db)?.put(index, key.as_bytes(), value.as_bytes())?;
            println!("OK");
        }
        Command::Get { db, index, key } => {
            print_value(engine.database(&db)?.lookup(index, key.as_bytes())?);
        }
        Command::Del { db, index, key } => {
            engine.database(&db)?.delete(index, key.as_bytes())?;
            println!("OK");
        }
        Command::Scan { db, index, prefix } => {
            print_pairs(engine.database(&db)?.prefix_lookup(index, prefix.as_bytes())?)?;
        }
        Command::Range { db, index, from, to } => {
            print_pairs(engine.database(&db)?.range_lookup(index, from.as_bytes(), to.as_bytes())?)?;
        }
        Command::Snap { db, name, indices } => {
            engine.create_snapshot(&db, SnapshotConfig::new(name, indices))?;
            println!("OK");
        }
        Command::SnapGet { db, name, index, key } => {
            print_value(engine.snapshot(&db, &name)?.lookup(index, key.as_bytes())?);
        }
        Command::Unsnap { db, name } => {
            engine.delete_snapshot(&db, &name)?;
            println!("OK");
        }
        Command::Snaps { db } => {
            let names = engine.snapshot_names(&db)?;
            if names.is_empty() {
                println!("(empty)");
            }
            for name in names {
                println!("{}", name);
            }
        }
        Command::Checkpoint => {
            let lsn = engine.checkpoint()?;
            println!("OK (lsn={})", lsn);
        }
        Command::Lsn => println!("{}", engine.latest_lsn()),
        Command::Stats => println!("{:?}", engine),
        Command::Exit => {}
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let config = EngineConfig::from_env()?;
    if config.replication.is_some() {
        anyhow::bail!("the shell runs standalone engines only; unset TIDEDB_ROLE");
    }
    let base_dir = config.base_dir.clone();
    let engine = Engine::open(config)?;
    info!("shell attached to {}", base_dir.display());

    println!(
        "TideDB started (lsn={}, base_dir={}, databases={})",
        engine.latest_lsn(),
        base_dir.display(),
        engine.database_names().len()
    );
    println!("Commands: CREATE | DROP | COPY | DBS | PUT | GET | DEL | SCAN | RANGE");
    println!("          SNAP | SNAPGET | UNSNAP | SNAPS | CHECKPOINT | LSN | STATS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match Command::parse(&line) {
            Ok(Some(Command::Exit)) => {
                println!("bye");
                break;
            }
            Ok(Some(cmd)) => {
                if let Err(e) = run(&engine, cmd) {
                    println!("ERR {:?}: {}", e.code(), e);
                }
            }
            Ok(None) => {}
            Err(msg) => println!("ERR {}", msg),
        }
        print!("> ");
        io::stdout().flush().ok();
    }

    engine.shutdown()?;
    Ok(())
}
