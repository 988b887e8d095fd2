//! BigMap load tool
//!
//! Opens a map in a directory, writes a batch of entries, reads them back
//! and prints what the allocator and the page files look like afterwards.

use anyhow::{bail, Context};
use bigmap::{BigMap, BigMapConfig};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Tool configuration
struct Config {
    /// Parent directory of the map
    dir: PathBuf,
    /// Instance name, the map's subdirectory
    name: String,
    /// Number of entries to write
    entries: usize,
    /// Size of each value in bytes
    value_size: usize,
    /// Idle timeout per entry, 0 for none
    ttl_ms: u64,
    /// Page file size in bytes
    page_size: usize,
    /// Delete all page files before exiting
    remove_all: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("bigmap"),
            name: "load".to_string(),
            entries: 100_000,
            value_size: 100,
            ttl_ms: 0,
            page_size: bigmap::config::DEFAULT_PAGE_SIZE,
            remove_all: false,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--dir" | "-d" => {
                    config.dir = PathBuf::from(value_of(&args, i));
                    i += 2;
                }
                "--name" | "-n" => {
                    config.name = value_of(&args, i).to_string();
                    i += 2;
                }
                "--entries" | "-e" => {
                    config.entries = number_of(&args, i);
                    i += 2;
                }
                "--value-size" | "-s" => {
                    config.value_size = number_of(&args, i);
                    i += 2;
                }
                "--ttl-ms" | "-t" => {
                    config.ttl_ms = number_of(&args, i);
                    i += 2;
                }
                "--page-size" | "-p" => {
                    config.page_size = number_of(&args, i);
                    i += 2;
                }
                "--remove-all" => {
                    config.remove_all = true;
                    i += 1;
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("bigmap version {}", bigmap::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }
}

/// Returns the value following the flag at `i`, exiting if there is none.
fn value_of(args: &[String], i: usize) -> &str {
    match args.get(i + 1) {
        Some(value) => value,
        None => {
            eprintln!("Error: {} requires a value", args[i]);
            std::process::exit(1);
        }
    }
}

fn number_of<T: std::str::FromStr>(args: &[String], i: usize) -> T {
    value_of(args, i).parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid number for {}", args[i]);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
bigmap - load tool for the off-heap memory-mapped hash map

USAGE:
    bigmap [OPTIONS]

OPTIONS:
    -d, --dir <DIR>           Parent directory of the map (default: $TMP/bigmap)
    -n, --name <NAME>         Instance name (default: load)
    -e, --entries <N>         Number of entries to write (default: 100000)
    -s, --value-size <BYTES>  Size of each value (default: 100)
    -t, --ttl-ms <MS>         Idle timeout per entry, 0 for none (default: 0)
    -p, --page-size <BYTES>   Page file size (default: 33554432)
        --remove-all          Delete all page files before exiting
    -v, --version             Print version information
    -h, --help                Print this help message

LOGGING:
    Set RUST_LOG to change verbosity, e.g. RUST_LOG=bigmap=debug
"#
    );
}

fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    if config.entries == 0 {
        bail!("--entries must be at least 1");
    }

    let map_config = BigMapConfig::new(&config.dir, config.name.as_str())
        .with_page_size(config.page_size)
        .with_default_ttl(Duration::from_millis(config.ttl_ms))
        .with_initial_capacity(config.entries);
    let map = BigMap::open(map_config)
        .with_context(|| format!("failed to open map in {}", config.dir.display()))?;

    let value = vec![0xABu8; config.value_size];
    let started = Instant::now();
    for i in 0..config.entries {
        let key = format!("key-{:010}", i);
        map.put(key.as_bytes(), &value)
            .with_context(|| format!("failed to put {}", key))?;
    }
    let write_elapsed = started.elapsed();
    info!(
        entries = config.entries,
        elapsed_ms = write_elapsed.as_millis() as u64,
        "Write phase done"
    );

    let started = Instant::now();
    let mut missing = 0usize;
    for i in 0..config.entries {
        let key = format!("key-{:010}", i);
        match map.get(key.as_bytes())? {
            Some(found) if found.len() == value.len() => {}
            _ => missing += 1,
        }
    }
    let read_elapsed = started.elapsed();
    info!(
        entries = config.entries,
        elapsed_ms = read_elapsed.as_millis() as u64,
        "Read phase done"
    );
    if missing > 0 {
        warn!(missing, "Some entries could not be read back");
    }

    let stats = map.allocator_stats();
    println!("entries:             {}", map.len());
    println!("missing on read:     {}", missing);
    println!("write throughput:    {:.0} ops/s", rate(config.entries, write_elapsed));
    println!("read throughput:     {:.0} ops/s", rate(config.entries, read_elapsed));
    println!("back file size:      {} bytes", map.back_file_size()?);
    println!("total slots:         {}", stats.total_entries);
    println!("free slots:          {}", stats.free_entries);
    println!("used slot bytes:     {}", stats.used_slot_size);
    println!("real used bytes:     {}", stats.real_used_slot_size);
    println!("wasted slot bytes:   {}", stats.wasted_slot_size);
    println!("free slot bytes:     {}", stats.free_slot_size);
    println!("acquires/releases:   {}/{}", stats.acquires, stats.releases);
    println!(
        "reuse exact/approx:  {}/{}",
        stats.exact_match_reuses, stats.approximate_match_reuses
    );

    if config.remove_all {
        if !map.remove_all()? {
            warn!("Some page files could not be deleted");
        }
        info!(dir = %config.dir.display(), "All page files removed");
    }

    map.close().context("failed to close map")?;
    Ok(())
}

fn rate(ops: usize, elapsed: Duration) -> f64 {
    ops as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
}
