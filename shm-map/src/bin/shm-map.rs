use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use shm_map::{Level, Store, DEFAULT_MAX_BYTES, DEFAULT_MAX_ENTRIES};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let MapCommand {
        path,
        max_entries,
        max_bytes,
        quiet,
        command,
    } = MapCommand::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut options = Store::options()
        .max_entries(max_entries)
        .max_bytes(max_bytes);

    if !quiet {
        options = options.log_sink(|level: Level, msg: &str| {
            if level >= Level::Info {
                eprintln!("-{level}- {msg}");
            }
        });
    }

    let mut store = match options.open(&path) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("Failed to open {}: {err}", path.to_string_lossy());
            return ExitCode::from(2);
        }
    };

    match run(&mut store, command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::from(2)
        }
    }
}

/// Inspect and modify a shared memory map from the command line.
///
/// Keys and values are taken and printed as text. The segment is created on first use.
#[derive(Parser)]
#[command(name = "shm-map", version)]
struct MapCommand {
    /// The backing file of the segment.
    #[arg(long, env = "SHM_MAP_PATH", default_value = "shm_map.dat")]
    path: OsString,

    /// Number of slots; must match the value the segment was created with.
    #[arg(long, default_value_t = DEFAULT_MAX_ENTRIES)]
    max_entries: u64,

    /// Arena bytes for keys and values; must match the value the segment was created with.
    #[arg(long, default_value_t = DEFAULT_MAX_BYTES)]
    max_bytes: u64,

    /// Do not print engine diagnostics. Use `RUST_LOG` for the full trace.
    #[arg(long, short)]
    quiet: bool,

    #[command(subcommand)]
    command: Op,
}

#[derive(Subcommand)]
enum Op {
    /// Insert or replace a value, printing the replaced one.
    Put { key: String, value: String },
    /// Print the value of a key; exits with 1 if it is missing.
    Get { key: String },
    /// Print `true` or `false`; exits with 1 if the key is missing.
    Contains { key: String },
    /// Delete a key, printing its value; exits with 1 if it is missing.
    Remove { key: String },
    /// Print every entry as `key=value`, in slot order.
    Iter,
    /// Print the entry and byte counters.
    Info,
    /// Print arena usage and the occupied free lists.
    FreeList,
}

fn run(store: &mut Store, op: Op) -> Result<ExitCode, shm_map::Error> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let found = match op {
        Op::Put { key, value } => {
            if let Some(previous) = store.put(key.as_bytes(), value.as_bytes())? {
                let _ = writeln!(out, "{}", String::from_utf8_lossy(&previous));
            }
            true
        }
        Op::Get { key } => print_value(&mut out, store.get(key.as_bytes())?),
        Op::Contains { key } => {
            let found = store.contains(key.as_bytes())?;
            let _ = writeln!(out, "{found}");
            found
        }
        Op::Remove { key } => print_value(&mut out, store.remove(key.as_bytes())?),
        Op::Iter => {
            store.iter(|k, v| {
                let _ = writeln!(
                    out,
                    "{}={}",
                    String::from_utf8_lossy(k),
                    String::from_utf8_lossy(v)
                );
            })?;
            true
        }
        Op::Info => {
            let info = store.info()?;
            let _ = writeln!(out, "entry_count: {}", info.entry_count);
            let _ = writeln!(out, "bytes_used: {}", info.bytes_used);
            let _ = writeln!(out, "max_entries: {}", info.max_entries);
            let _ = writeln!(out, "max_bytes: {}", info.max_bytes);
            true
        }
        Op::FreeList => {
            let memory = store.memory_info()?;
            let _ = writeln!(out, "pool_size: {}", memory.pool_size);
            let _ = writeln!(out, "free_area_size: {}", memory.free_area_size);
            let _ = writeln!(out, "allocated_area_size: {}", memory.allocated_area_size);
            let _ = writeln!(out, "allocated_area_free_size: {}", memory.allocated_area_free_size);
            let _ = writeln!(out, "real_used_size: {}", memory.real_used_size);

            for class in store.free_list_info()? {
                let _ = writeln!(out, "[{}, {}]", class.capacity, class.blocks);
            }
            true
        }
    };

    Ok(if found {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_value(out: &mut impl Write, value: Option<Vec<u8>>) -> bool {
    match value {
        Some(value) => {
            let _ = writeln!(out, "{}", String::from_utf8_lossy(&value));
            true
        }
        None => false,
    }
}
