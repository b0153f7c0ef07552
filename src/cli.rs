// Command-line front end for fotadelta.
//
// `update` reconstructs a new image from an old image and a patch file,
// `inspect` lists the records of a patch file, `config` prints build
// details. Errors are reported as `fotadelta: <message>` with exit code 1.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};

use crate::engine::{
    DEFAULT_BLOCK_SIZE, DEFAULT_PACKET_SIZE, ImageClass, MAX_BLOCK_SIZE, RemovePolicy, UpdateConfig,
    UpdateStats,
};
use crate::format::header::{PATCH_HEADER_LEN, PatchHeader};
use crate::io::{self, PacketReader, PacketSource};
use crate::patch::Reassembler;

const BUF_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Byte size parsing (supports K, M, G suffixes)
// ---------------------------------------------------------------------------

fn parse_byte_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".into());
    }
    let (num_part, multiplier) = match s.as_bytes().last() {
        Some(b'k' | b'K') => (&s[..s.len() - 1], 1024u64),
        Some(b'm' | b'M') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'g' | b'G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1u64),
    };
    let num: u64 = num_part
        .trim()
        .parse()
        .map_err(|e| format!("invalid size '{s}': {e}"))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size overflow: '{s}'"))
}

fn parse_usize_size(s: &str) -> Result<usize, String> {
    let n = parse_byte_size(s)?;
    usize::try_from(n).map_err(|_| format!("size too large: '{s}'"))
}

// ---------------------------------------------------------------------------
// Clap CLI definition
// ---------------------------------------------------------------------------

/// Block-based firmware delta updater.
#[derive(Parser, Debug)]
#[command(
    name = "fotadelta",
    version,
    about = "Apply block-based firmware delta patches",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Force overwrite existing output files.
    #[arg(short = 'f', long, global = true)]
    force: bool,

    /// Quiet mode (suppress non-error output).
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose mode (use multiple times for more detail).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Output stats as JSON to stderr.
    #[arg(long = "json", global = true)]
    json_output: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Apply a patch to an image (in place when NEW is omitted).
    Update(UpdateArgs),
    /// List the block records of a patch file.
    Inspect(InspectArgs),
    /// Print build/configuration details.
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ClassArg {
    /// Detect from the old image's device path.
    Auto,
    Raw,
    Preamble,
}

#[derive(Args, Debug)]
struct LayoutArgs {
    /// Image block size (supports K/M/G suffix).
    #[arg(long = "block-size", value_parser = parse_usize_size, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Image class.
    #[arg(long, value_enum, default_value_t = ClassArg::Auto)]
    class: ClassArg,

    /// Binary header length of preamble-bearing images.
    #[arg(long = "binary-header-len", value_parser = parse_usize_size)]
    binary_header_len: Option<usize>,
}

#[derive(Args, Debug)]
struct UpdateArgs {
    /// Old image (file or block device).
    #[arg(value_hint = ValueHint::FilePath)]
    old: PathBuf,

    /// Patch file.
    #[arg(value_hint = ValueHint::FilePath)]
    patch: PathBuf,

    /// New image to create (default: update OLD in place).
    #[arg(value_hint = ValueHint::FilePath)]
    new: Option<PathBuf>,

    #[command(flatten)]
    layout: LayoutArgs,

    /// Download packet size (supports K/M/G suffix).
    #[arg(long = "packet-size", value_parser = parse_usize_size, default_value_t = DEFAULT_PACKET_SIZE)]
    packet_size: usize,

    /// Upper bound on one record's compressed sections (supports K/M/G suffix).
    #[arg(long = "max-record-size", value_parser = parse_byte_size)]
    max_record_size: Option<u64>,

    /// Keep old bytes past the end of the new image instead of truncating.
    #[arg(long = "keep-removed")]
    keep_removed: bool,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// Patch file.
    #[arg(value_hint = ValueHint::FilePath)]
    patch: PathBuf,

    #[command(flatten)]
    layout: LayoutArgs,
}

// ---------------------------------------------------------------------------
// Resolved options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Update,
    Inspect,
    Config,
}

struct Options {
    command: Command,
    force: bool,
    quiet: bool,
    verbose: u8,
    json_output: bool,
    old_file: Option<PathBuf>,
    patch_file: Option<PathBuf>,
    new_file: Option<PathBuf>,
    block_size: usize,
    packet_size: usize,
    class: ClassArg,
    binary_header_len: Option<usize>,
    max_record_size: Option<u64>,
    keep_removed: bool,
}

fn resolve_options(cli: Cli) -> Options {
    let mut opts = Options {
        command: Command::Config,
        force: cli.force,
        quiet: cli.quiet,
        verbose: cli.verbose.min(3),
        json_output: cli.json_output,
        old_file: None,
        patch_file: None,
        new_file: None,
        block_size: DEFAULT_BLOCK_SIZE,
        packet_size: DEFAULT_PACKET_SIZE,
        class: ClassArg::Auto,
        binary_header_len: None,
        max_record_size: None,
        keep_removed: false,
    };

    match cli.command {
        Cmd::Update(args) => {
            opts.command = Command::Update;
            opts.old_file = Some(args.old);
            opts.patch_file = Some(args.patch);
            opts.new_file = args.new;
            opts.block_size = args.layout.block_size;
            opts.class = args.layout.class;
            opts.binary_header_len = args.layout.binary_header_len;
            opts.packet_size = args.packet_size;
            opts.max_record_size = args.max_record_size;
            opts.keep_removed = args.keep_removed;
        }
        Cmd::Inspect(args) => {
            opts.command = Command::Inspect;
            opts.patch_file = Some(args.patch);
            opts.block_size = args.layout.block_size;
            opts.class = args.layout.class;
            opts.binary_header_len = args.layout.binary_header_len;
        }
        Cmd::Config => {}
    }
    opts
}

#[cfg(any(test, feature = "fuzzing"))]
pub fn fuzz_try_parse_args(args: &[String]) {
    let argv: Vec<String> = std::iter::once("fotadelta".to_string())
        .chain(args.iter().cloned())
        .collect();
    if let Ok(cli) = Cli::try_parse_from(argv) {
        let opts = resolve_options(cli);
        let _ = build_config(&opts);
    }
}

/// Resolve the image class. `auto` consults the old image path.
fn resolve_image_class(opts: &Options, old: Option<&Path>) -> Result<ImageClass, String> {
    let header_len = || {
        opts.binary_header_len
            .ok_or_else(|| "preamble images need --binary-header-len".to_string())
    };
    match opts.class {
        ClassArg::Raw => Ok(ImageClass::Raw),
        ClassArg::Preamble => Ok(ImageClass::Preamble {
            binary_header_len: header_len()?,
        }),
        ClassArg::Auto => {
            let Some(old) = old else {
                return Ok(ImageClass::Raw);
            };
            match ImageClass::detect(old, opts.binary_header_len.unwrap_or(0)) {
                Some(ImageClass::Raw) => Ok(ImageClass::Raw),
                Some(ImageClass::Preamble { .. }) => Ok(ImageClass::Preamble {
                    binary_header_len: header_len()?,
                }),
                None => Err(format!(
                    "cannot detect image class of {}; use --class raw|preamble",
                    old.display()
                )),
            }
        }
    }
}

fn build_config(opts: &Options) -> Result<UpdateConfig, String> {
    let config = UpdateConfig {
        block_size: opts.block_size,
        packet_size: opts.packet_size,
        image_class: resolve_image_class(opts, opts.old_file.as_deref())?,
        remove_policy: if opts.keep_removed {
            RemovePolicy::Ignore
        } else {
            RemovePolicy::Truncate
        },
        max_record_size: opts.max_record_size,
    };
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Config command
// ---------------------------------------------------------------------------

fn cmd_config() -> i32 {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!("fotadelta version {version}");

    let file_io = cfg!(feature = "file-io") as u8;
    eprintln!("FILE_IO={file_io}");
    eprintln!("DEFAULT_BLOCK_SIZE={DEFAULT_BLOCK_SIZE}");
    eprintln!("DEFAULT_PACKET_SIZE={DEFAULT_PACKET_SIZE}");
    eprintln!("MAX_BLOCK_SIZE={MAX_BLOCK_SIZE}");
    eprintln!("PATCH_HEADER_LEN={PATCH_HEADER_LEN}");

    0
}

// ---------------------------------------------------------------------------
// Update command
// ---------------------------------------------------------------------------

fn cmd_update(opts: &Options) -> i32 {
    let (Some(old), Some(patch)) = (opts.old_file.as_deref(), opts.patch_file.as_deref()) else {
        eprintln!("fotadelta: update requires an old image and a patch file");
        return 1;
    };

    let config = match build_config(opts) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fotadelta: {e}");
            return 1;
        }
    };

    if let Some(new) = opts.new_file.as_deref()
        && new.exists()
        && !opts.force
    {
        eprintln!(
            "fotadelta: output file exists, use -f to overwrite: {}",
            new.display()
        );
        return 1;
    }

    match io::update_file(old, patch, opts.new_file.as_deref(), config) {
        Ok(stats) => {
            if opts.verbose > 0 && !opts.quiet {
                print_summary(&stats);
            }
            if opts.json_output {
                eprintln!("{}", stats_json(&stats));
            }
            0
        }
        Err(e) => {
            eprintln!("fotadelta: update failed: {e}");
            1
        }
    }
}

fn print_summary(stats: &UpdateStats) {
    eprintln!(
        "fotadelta: {} packets, {} patch bytes",
        stats.packets, stats.patch_bytes
    );
    eprintln!(
        "fotadelta: {} blocks: {} skipped, {} modified, {} added, {} removed",
        stats.blocks, stats.skipped, stats.modified, stats.added, stats.removed
    );
    eprintln!("fotadelta: {} bytes written", stats.bytes_written);
    if let Some(digest) = &stats.output_sha256 {
        eprintln!("fotadelta: output sha256 {}", hex(digest));
    }
}

fn stats_json(stats: &UpdateStats) -> String {
    let json = serde_json::json!({
        "command": "update",
        "packets": stats.packets,
        "patch_bytes": stats.patch_bytes,
        "blocks": stats.blocks,
        "skipped": stats.skipped,
        "modified": stats.modified,
        "added": stats.added,
        "removed": stats.removed,
        "bytes_written": stats.bytes_written,
        "output_sha256": stats.output_sha256.as_ref().map(|d| hex(d)),
    });
    serde_json::to_string_pretty(&json).unwrap_or_else(|_| json.to_string())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Inspect command
// ---------------------------------------------------------------------------

fn cmd_inspect(opts: &Options) -> i32 {
    let Some(path) = opts.patch_file.as_deref() else {
        eprintln!("fotadelta: inspect requires a patch file");
        return 1;
    };
    let config = match build_config(opts) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fotadelta: {e}");
            return 1;
        }
    };
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("fotadelta: {}: {e}", path.display());
            return 1;
        }
    };

    match inspect(BufReader::with_capacity(BUF_SIZE, file), &config, opts.json_output) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("fotadelta: {}: {e}", path.display());
            1
        }
    }
}

/// Walk the patch stream record by record without applying anything.
fn inspect<R: std::io::Read>(reader: R, config: &UpdateConfig, json: bool) -> Result<(), String> {
    let prefix_len = PATCH_HEADER_LEN + config.image_class.preamble_len();
    let mut packets = PacketReader::new(reader, BUF_SIZE);
    let mut reassembler = Reassembler::new(config.record_limit());
    let mut prefix = Vec::with_capacity(prefix_len);
    let mut header = None;
    let mut records = Vec::new();

    loop {
        let packet = packets.next_packet().map_err(|e| e.to_string())?;
        let is_final = packet.is_final;
        let mut data = packet.data;

        if prefix.len() < prefix_len {
            let take = (prefix_len - prefix.len()).min(data.len());
            prefix.extend_from_slice(&data[..take]);
            data = &data[take..];
            if prefix.len() == prefix_len {
                let parsed = PatchHeader::parse(&prefix).map_err(|e| e.to_string())?;
                if !parsed.has_valid_signature() {
                    return Err(format!("bad patch signature {:02X?}", parsed.signature));
                }
                if !json {
                    println!("Signature:           {}", String::from_utf8_lossy(&parsed.signature));
                    println!("Old blocks:          {}", parsed.old_block_count);
                    println!("New blocks:          {}", parsed.new_block_count);
                    println!("Image class:         {}", config.image_class);
                    println!();
                    println!("  BLOCK  TOKEN      CTRL      DIFF     EXTRA   NEW SIZE  NEW CRC");
                }
                header = Some(parsed);
            }
        }

        for record in reassembler.feed(data).map_err(|e| e.to_string())? {
            let h = record.header;
            if json {
                records.push(serde_json::json!({
                    "block": h.block_number,
                    "token": h.token.to_string(),
                    "ctrl_size": h.ctrl_size,
                    "diff_size": h.diff_size,
                    "extra_size": h.extra_size,
                    "new_block_size": h.new_block_size,
                    "new_block_crc": h.new_block_crc,
                }));
            } else {
                println!(
                    "  {:5}  {:<6} {:9} {:9} {:9} {:10}  {:08X}",
                    h.block_number,
                    h.token,
                    h.ctrl_size,
                    h.diff_size,
                    h.extra_size,
                    h.new_block_size,
                    h.new_block_crc
                );
            }
        }

        if is_final {
            break;
        }
    }

    let Some(header) = header else {
        return Err("patch header incomplete".into());
    };
    if !reassembler.is_idle() {
        return Err(format!(
            "stream ends inside a record ({} bytes pending)",
            reassembler.pending_bytes()
        ));
    }

    if json {
        let out = serde_json::json!({
            "command": "inspect",
            "old_blocks": header.old_block_count,
            "new_blocks": header.new_block_count,
            "records": records,
        });
        println!("{}", serde_json::to_string_pretty(&out).map_err(|e| e.to_string())?);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run() -> ! {
    let cli = Cli::parse();
    let opts = resolve_options(cli);

    let default_filter = match (opts.quiet, opts.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let exit_code = match opts.command {
        Command::Update => cmd_update(&opts),
        Command::Inspect => cmd_inspect(&opts),
        Command::Config => cmd_config(),
    };

    process::exit(exit_code);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
