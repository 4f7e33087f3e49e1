//! pktdef - Inspect packet definitions and decode binary telemetry captures
//!
//! This tool loads packet definition files, lists the packets they define,
//! decodes raw captures into item values and prints layout fingerprints.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pktdef_core::{DefinitionParser, Packet, PacketKind, ParserConfig, Registry, StructureItem};
use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Inspect packet definitions and decode binary telemetry captures
#[derive(Parser, Debug)]
#[command(name = "pktdef")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Definition file, or a directory searched for definition files
    #[arg(short, long, global = true, default_value = ".")]
    definitions: PathBuf,

    /// Restrict to these targets (repeatable)
    #[arg(short, long, global = true)]
    target: Vec<String>,

    /// Do not add the built-in RECEIVED* items to telemetry packets
    #[arg(long, global = true)]
    no_received_items: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List defined packets
    List {
        /// List commands instead of telemetry
        #[arg(long)]
        commands: bool,

        /// Also list each packet's items
        #[arg(long)]
        items: bool,
    },
    /// Decode a binary capture into item values
    Decode {
        /// Capture file holding one or more packets back to back
        #[arg(short, long)]
        input: PathBuf,

        /// Split the capture into packets of this many bytes
        #[arg(long)]
        packet_length: Option<usize>,

        /// Evaluate limits before printing
        #[arg(long)]
        check_limits: bool,

        /// Output format
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
    },
    /// Print the layout fingerprint of each packet
    Fingerprint {
        /// Fingerprint commands instead of telemetry
        #[arg(long)]
        commands: bool,
    },
}

/// Output format for decoded packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// One JSON object per packet
    Json,
    /// Indented key and value lines
    Text,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .init();

    let config = ParserConfig::new().received_items(!cli.no_received_items);
    let registry = load_definitions(&cli.definitions, config)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match &cli.command {
        Commands::List { commands, items } => {
            let kind = kind_of(*commands);
            for line in list_lines(&registry, kind, &cli.target, *items)? {
                writeln!(out, "{}", line)?;
            }
        }
        Commands::Decode {
            input,
            packet_length,
            check_limits,
            format,
        } => {
            let data = fs::read(input)
                .with_context(|| format!("Failed to read capture: {}", input.display()))?;
            let options = DecodeOptions {
                targets: &cli.target,
                packet_length: *packet_length,
                check_limits: *check_limits,
            };
            for record in decode_capture(&registry, &data, &options)? {
                match format {
                    OutputFormat::Json => writeln!(out, "{}", serde_json::to_string(&record)?)?,
                    OutputFormat::Text => write_text(&mut out, &record)?,
                }
            }
        }
        Commands::Fingerprint { commands } => {
            let kind = kind_of(*commands);
            for line in fingerprint_lines(&registry, kind, &cli.target)? {
                writeln!(out, "{}", line)?;
            }
        }
    }
    Ok(())
}

fn kind_of(commands: bool) -> PacketKind {
    if commands {
        PacketKind::Command
    } else {
        PacketKind::Telemetry
    }
}

/// Parses every definition file under `path` into one registry
fn load_definitions(path: &Path, config: ParserConfig) -> Result<Registry> {
    if !path.exists() {
        bail!("Definitions path does not exist: {}", path.display());
    }

    let files = definition_files(path);
    if files.is_empty() {
        bail!("No definition files found in {}", path.display());
    }

    let mut parser = DefinitionParser::new(config);
    for file in &files {
        debug!("Parsing definitions: {}", file.display());
        parser
            .parse_file(file)
            .with_context(|| format!("Failed to load definitions from {}", file.display()))?;
    }
    let registry = parser.finish().context("Failed to finish definitions")?;

    for warning in registry.warnings() {
        warn!("{}", warning);
    }
    info!(
        "Loaded {} definition files: {} telemetry targets, {} command targets",
        files.len(),
        registry.target_names(PacketKind::Telemetry).count(),
        registry.target_names(PacketKind::Command).count()
    );
    Ok(registry)
}

/// Definition files under `path` in name order, skipping hidden entries
fn definition_files(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    WalkDir::new(path)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.path()))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// Target names of `kind`, limited to `filter` when it is not empty
fn selected_targets<'r>(
    registry: &'r Registry,
    kind: PacketKind,
    filter: &[String],
) -> Result<Vec<&'r str>> {
    let names: Vec<&str> = registry.target_names(kind).collect();
    for wanted in filter {
        if !names.iter().any(|n| n.eq_ignore_ascii_case(wanted)) {
            bail!("Unknown {} target: {}", kind, wanted);
        }
    }
    Ok(names
        .into_iter()
        .filter(|n| filter.is_empty() || filter.iter().any(|f| f.eq_ignore_ascii_case(n)))
        .collect())
}

fn list_lines(
    registry: &Registry,
    kind: PacketKind,
    targets: &[String],
    with_items: bool,
) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for target in selected_targets(registry, kind, targets)? {
        for packet in registry.packets(kind, target)? {
            lines.push(packet_line(kind, packet));
            if with_items {
                lines.extend(packet.sorted_items().map(|item| {
                    let field: &StructureItem = item.as_ref();
                    let mut line = format!(
                        "  {} {} {} {}",
                        field.name(),
                        field.bit_offset(),
                        field.bit_size(),
                        field.data_type()
                    );
                    if let Some(units) = item.units() {
                        line.push_str(&format!(" [{}]", units));
                    }
                    line
                }));
            }
        }
    }
    Ok(lines)
}

fn packet_line(kind: PacketKind, packet: &Packet) -> String {
    let mut line = format!(
        "{} {} {} ({} bytes)",
        kind,
        packet.target_name(),
        packet.packet_name(),
        packet.defined_length()
    );
    let mut flags = Vec::new();
    if packet.hidden() {
        flags.push("hidden");
    }
    if packet.disabled() {
        flags.push("disabled");
    }
    if packet.is_virtual() {
        flags.push("virtual");
    }
    if packet.is_hazardous() {
        flags.push("hazardous");
    }
    if !flags.is_empty() {
        line.push_str(&format!(" [{}]", flags.join(", ")));
    }
    if let Some(description) = packet.description() {
        line.push_str(&format!(" \"{}\"", description));
    }
    line
}

fn fingerprint_lines(
    registry: &Registry,
    kind: PacketKind,
    targets: &[String],
) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for target in selected_targets(registry, kind, targets)? {
        for packet in registry.packets(kind, target)? {
            lines.push(format!(
                "{} {} {}",
                packet.target_name(),
                packet.packet_name(),
                packet.config_name()
            ));
        }
    }
    Ok(lines)
}

struct DecodeOptions<'a> {
    targets: &'a [String],
    packet_length: Option<usize>,
    check_limits: bool,
}

/// Splits a capture into packets and decodes each one.
///
/// Without a fixed packet length each chunk takes the defined length of the
/// packet identified at its start, or the rest of the capture when that
/// packet is variably sized or nothing is identified.
fn decode_capture(
    registry: &Registry,
    data: &[u8],
    options: &DecodeOptions<'_>,
) -> Result<Vec<serde_json::Value>> {
    if options.packet_length == Some(0) {
        bail!("Packet length must be greater than zero");
    }
    let names: Vec<&str> = options.targets.iter().map(String::as_str).collect();
    let targets = if names.is_empty() {
        None
    } else {
        Some(names.as_slice())
    };

    let mut records = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let rest = &data[offset..];
        let length = match options.packet_length {
            Some(length) => length.min(rest.len()),
            None => match registry.identify(rest, targets) {
                Some(packet) if packet.structure().is_fixed_size() && packet.defined_length() > 0 => {
                    packet.defined_length().min(rest.len())
                }
                _ => rest.len(),
            },
        };
        let chunk = &rest[..length];

        let packet = match registry
            .identify_and_define(chunk, targets)
            .with_context(|| format!("Failed to decode packet at offset {}", offset))?
        {
            Some(packet) => packet,
            None => {
                warn!("Unidentified {} bytes at offset {}", chunk.len(), offset);
                let packet = registry.unknown().instance();
                packet
                    .set_buffer(chunk)
                    .with_context(|| format!("Failed to store unidentified data at offset {}", offset))?;
                packet
            }
        };
        debug!(
            "Decoded {} {} at offset {}",
            packet.target_name(),
            packet.packet_name(),
            offset
        );
        if options.check_limits {
            packet.check_limits(registry.limits_set(), true);
        }
        let items = packet.decom().with_context(|| {
            format!(
                "Failed to decode {} {} at offset {}",
                packet.target_name(),
                packet.packet_name(),
                offset
            )
        })?;
        records.push(json!({
            "offset": offset,
            "target": packet.target_name(),
            "packet": packet.packet_name(),
            "length": chunk.len(),
            "items": items,
        }));
        offset += length;
    }
    Ok(records)
}

fn write_text(out: &mut impl Write, record: &serde_json::Value) -> Result<()> {
    writeln!(
        out,
        "{} {} @ {}",
        record["target"].as_str().unwrap_or_default(),
        record["packet"].as_str().unwrap_or_default(),
        record["offset"]
    )?;
    if let Some(items) = record["items"].as_object() {
        for (key, value) in items {
            match value {
                serde_json::Value::String(text) => writeln!(out, "  {} = {}", key, text)?,
                other => writeln!(out, "  {} = {}", key, other)?,
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const INST: &str = r#"
TELEMETRY INST HEALTH BIG_ENDIAN "Health and status"
  APPEND_ID_ITEM OPCODE 8 UINT 1
  APPEND_ITEM TEMP 16 UINT
    POLY_READ_CONVERSION -40.0 0.01
    UNITS Celsius C
    FORMAT_STRING "%0.1f"
    LIMITS DEFAULT 1 ENABLED -20.0 -10.0 50.0 60.0
TELEMETRY INST EVENT BIG_ENDIAN "Event message"
  APPEND_ID_ITEM OPCODE 8 UINT 2
  APPEND_ITEM LENGTH 8 UINT
  APPEND_ITEM TEXT 0 STRING
    VARIABLE_BIT_SIZE LENGTH
"#;

    const CMD: &str = r#"
COMMAND INST RESET BIG_ENDIAN "Reset the instrument"
  HAZARDOUS "Interrupts science collection"
  APPEND_ID_PARAMETER OPCODE 8 UINT 0 255 9
"#;

    fn definitions() -> (TempDir, Registry) {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("inst_tlm.txt"), INST).unwrap();
        fs::write(temp_dir.path().join("inst_cmd.txt"), CMD).unwrap();
        fs::write(temp_dir.path().join(".hidden.txt"), "NOT A DEFINITION").unwrap();
        let registry = load_definitions(temp_dir.path(), ParserConfig::new()).unwrap();
        (temp_dir, registry)
    }

    fn options(packet_length: Option<usize>) -> DecodeOptions<'static> {
        DecodeOptions {
            targets: &[],
            packet_length,
            check_limits: false,
        }
    }

    #[test]
    fn test_definition_files_skip_hidden() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("b.txt"), "").unwrap();
        fs::write(temp_dir.path().join("a.txt"), "").unwrap();
        fs::write(temp_dir.path().join(".skip.txt"), "").unwrap();
        fs::create_dir(temp_dir.path().join(".git")).unwrap();
        fs::write(temp_dir.path().join(".git").join("c.txt"), "").unwrap();

        let files = definition_files(temp_dir.path());
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_load_definitions_errors() {
        let temp_dir = TempDir::new().unwrap();
        assert!(load_definitions(&temp_dir.path().join("missing"), ParserConfig::new()).is_err());
        assert!(load_definitions(temp_dir.path(), ParserConfig::new()).is_err());

        fs::write(temp_dir.path().join("bad.txt"), "APPEND_ITEM A 8 UINT\n").unwrap();
        let err = load_definitions(temp_dir.path(), ParserConfig::new()).unwrap_err();
        assert!(format!("{:#}", err).contains("bad.txt"));
    }

    #[test]
    fn test_list_lines() {
        let (_dir, registry) = definitions();
        let lines = list_lines(&registry, PacketKind::Telemetry, &[], false).unwrap();
        assert_eq!(
            lines,
            vec![
                "TELEMETRY INST HEALTH (3 bytes) \"Health and status\"".to_string(),
                "TELEMETRY INST EVENT (2 bytes) \"Event message\"".to_string(),
            ]
        );

        let commands = list_lines(&registry, PacketKind::Command, &[], true).unwrap();
        assert_eq!(
            commands[0],
            "COMMAND INST RESET (1 bytes) [hazardous] \"Reset the instrument\""
        );
        assert_eq!(commands[1], "  OPCODE 0 8 UINT");

        assert!(list_lines(&registry, PacketKind::Telemetry, &["NOPE".into()], false).is_err());
    }

    #[test]
    fn test_decode_capture_splits_packets() {
        let (_dir, registry) = definitions();
        let mut data = vec![1, 0x17, 0x70];
        data.extend_from_slice(&[2, 2, b'h', b'i']);

        let records = decode_capture(&registry, &data, &options(None)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["packet"], "HEALTH");
        assert_eq!(records[0]["offset"], 0);
        assert_eq!(records[0]["items"]["TEMP"], 6000);
        assert_eq!(records[0]["items"]["TEMP__U"], "20.0 C");
        assert_eq!(records[1]["packet"], "EVENT");
        assert_eq!(records[1]["offset"], 3);
        assert_eq!(records[1]["items"]["TEXT"], "hi");
    }

    #[test]
    fn test_decode_capture_counts_each_packet() {
        let (_dir, registry) = definitions();
        let data = [1, 0x17, 0x70, 1, 0x17, 0x71];
        let records = decode_capture(&registry, &data, &options(None)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["items"]["RECEIVED_COUNT"], 1);
        assert_eq!(records[1]["items"]["RECEIVED_COUNT"], 2);
        assert_eq!(records[1]["items"]["TEMP"], 6001);
    }

    #[test]
    fn test_decode_capture_fixed_length_and_unknown() {
        let (_dir, registry) = definitions();
        let data = [1, 0x17, 0x70, 7, 7, 7];
        let records = decode_capture(&registry, &data, &options(Some(3))).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["packet"], "HEALTH");
        assert_eq!(records[1]["target"], "UNKNOWN");
        assert_eq!(records[1]["packet"], "UNKNOWN");
        assert_eq!(records[1]["length"], 3);

        assert!(decode_capture(&registry, &data, &options(Some(0))).is_err());
    }

    #[test]
    fn test_decode_capture_checks_limits() {
        let (_dir, registry) = definitions();
        // 0x2710 = 10000 raw, 60.0 converted: red high
        let data = [1, 0x27, 0x10];
        let options = DecodeOptions {
            targets: &[],
            packet_length: None,
            check_limits: true,
        };
        let records = decode_capture(&registry, &data, &options).unwrap();
        assert_eq!(records[0]["items"]["TEMP__L"], "RED_HIGH");
    }

    #[test]
    fn test_write_text() {
        let record = json!({
            "offset": 0,
            "target": "INST",
            "packet": "HEALTH",
            "items": { "TEMP": 6000, "TEMP__U": "20.0 C" },
        });
        let mut out = Vec::new();
        write_text(&mut out, &record).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "INST HEALTH @ 0\n  TEMP = 6000\n  TEMP__U = 20.0 C\n");
    }

    #[test]
    fn test_fingerprint_lines() {
        let (_dir, registry) = definitions();
        let lines = fingerprint_lines(&registry, PacketKind::Telemetry, &["inst".into()]).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("INST HEALTH "));
        let health = registry.telemetry("INST", "HEALTH").unwrap();
        assert!(lines[0].ends_with(&health.config_name()));
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
