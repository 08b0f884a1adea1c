//! Command-line configuration.
//!
//! Validates raw option/value pairs into an immutable [`RunConfig`]. All
//! validation happens here, before any external effect: a run that gets
//! past this module has a well-formed flake reference, a known mode, and
//! syntactically valid system-config overrides.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{InstallerError, Result};

/// Which disko output the run requests, and with it what the partition
/// script does to the target disks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Format the disks, destroying their contents, then mount them.
    #[default]
    Format,
    /// Mount previously formatted disks without touching their contents.
    Mount,
}

impl Mode {
    /// The `config.system.build` attribute this mode requests from the
    /// build evaluator.
    pub fn script_attr(self) -> &'static str {
        match self {
            Mode::Format => "diskoScript",
            Mode::Mount => "mountScript",
        }
    }

    fn parse(token: &str) -> Result<Self> {
        match token {
            "format" => Ok(Mode::Format),
            "mount" => Ok(Mode::Mount),
            other => Err(InstallerError::Config(format!(
                "invalid mode '{other}'; expected 'format' or 'mount'"
            ))),
        }
    }
}

/// One validated installation run.
///
/// Built once from the command line and never mutated afterwards; the
/// orchestrator passes it by reference through the whole run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Flake reference with the attribute fragment stripped. Local paths
    /// are absolute with symlinks resolved; remote references pass
    /// through unchanged.
    pub flake: String,
    /// Name of the NixOS configuration to install.
    pub flake_attr: String,
    pub mode: Mode,
    /// Disk name -> device path overrides for the disko configuration.
    pub disks: BTreeMap<String, String>,
    /// Source -> destination files copied into the mounted root after
    /// the partition script has run.
    pub extra_files: BTreeMap<PathBuf, PathBuf>,
    /// JSON object merged into the target system configuration.
    pub extra_system_config: Map<String, Value>,
    /// Whether the bootloader installation may write EFI NVRAM entries.
    pub write_efi_boot_entries: bool,
    /// Extra arguments forwarded verbatim to the build evaluator, in the
    /// order they were given.
    pub extra_build_args: Vec<String>,
    pub dry_run: bool,
}

/// Result of argument parsing: a run to perform, or a help request that
/// the binary answers with the usage text and exit code 0.
#[derive(Debug)]
pub enum Invocation {
    Run(RunConfig),
    Help,
}

pub fn usage() -> &'static str {
    "Usage: disko-install [options]

Options:
* -f, --flake <flake-uri>#<attr>
  the flake to install the system from, e.g. '/etc/nixos#mymachine'
* --mode <format|mount>
  format: format the disks before installing (default)
  mount: mount already formatted disks before installing
* --disk <name> <device>
  map the disk <name> from the disko configuration to <device>
* --extra-files <source> <destination>
  copy <source> to <destination> in the mounted root after formatting
* --option <name> <value>
  pass --option <name> <value> to the build evaluator
* --write-efi-boot-entries
  allow the bootloader installation to write EFI NVRAM boot entries
* --system-config <json>
  merge the JSON object into the target system configuration
* --show-trace
  show a stack trace when the evaluation of the flake fails
* --dry-run
  print what would be done instead of doing it
* -h, --help
  show this help and exit"
}

/// Parse raw arguments (program name excluded) into an [`Invocation`].
///
/// An empty argument list is rejected rather than defaulted: installing
/// a system is destructive enough that every run must name a flake.
pub fn parse_args(args: &[String]) -> Result<Invocation> {
    if args.is_empty() {
        return Err(InstallerError::Config(format!(
            "no arguments given\n\n{}",
            usage()
        )));
    }

    let mut flake: Option<String> = None;
    let mut mode = Mode::default();
    let mut disks = BTreeMap::new();
    let mut extra_files = BTreeMap::new();
    let mut extra_system_config = Map::new();
    let mut write_efi_boot_entries = false;
    let mut extra_build_args = Vec::new();
    let mut dry_run = false;

    let mut rest = args.iter();
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Invocation::Help),
            "--mode" => mode = Mode::parse(take(&mut rest, "--mode")?)?,
            "-f" | "--flake" => flake = Some(take(&mut rest, "--flake")?.to_string()),
            "--disk" => {
                let name = take(&mut rest, "--disk")?.to_string();
                let device = take(&mut rest, "--disk")?.to_string();
                disks.insert(name, device);
            }
            "--extra-files" => {
                let source = PathBuf::from(take(&mut rest, "--extra-files")?);
                let destination = PathBuf::from(take(&mut rest, "--extra-files")?);
                extra_files.insert(source, destination);
            }
            "--option" => {
                let name = take(&mut rest, "--option")?.to_string();
                let value = take(&mut rest, "--option")?.to_string();
                extra_build_args.extend(["--option".to_string(), name, value]);
            }
            "--system-config" => {
                merge_system_config(&mut extra_system_config, take(&mut rest, "--system-config")?)?;
            }
            "--write-efi-boot-entries" => write_efi_boot_entries = true,
            "--show-trace" => extra_build_args.push("--show-trace".to_string()),
            "--dry-run" => dry_run = true,
            other => {
                return Err(InstallerError::Config(format!(
                    "unknown option '{}'\n\n{}",
                    other,
                    usage()
                )))
            }
        }
    }

    let raw_flake = flake.ok_or_else(|| {
        InstallerError::Config("missing required option -f/--flake".to_string())
    })?;
    let (flake, flake_attr) = split_flake_reference(&raw_flake)?;

    Ok(Invocation::Run(RunConfig {
        flake,
        flake_attr,
        mode,
        disks,
        extra_files,
        extra_system_config,
        write_efi_boot_entries,
        extra_build_args,
        dry_run,
    }))
}

fn take<'a>(rest: &mut std::slice::Iter<'a, String>, option: &str) -> Result<&'a str> {
    rest.next().map(String::as_str).ok_or_else(|| {
        InstallerError::Config(format!("option '{option}' requires more arguments"))
    })
}

/// Split `reference#attr` on the last `#` and normalize local paths.
///
/// The fragment must not contain further `#` or quote characters. A
/// reference without a usable fragment is rejected: the run would not
/// know which configuration to install.
fn split_flake_reference(raw: &str) -> Result<(String, String)> {
    let (reference, attr) = match raw.rsplit_once('#') {
        Some((reference, attr)) if !attr.is_empty() && !attr.contains('"') => {
            (reference.to_string(), attr.to_string())
        }
        _ => {
            return Err(InstallerError::Config(format!(
                "flake reference '{raw}' does not name a configuration; \
                 append '#<name>' to select the NixOS configuration to install"
            )))
        }
    };

    let reference = normalize_local_reference(&reference)?;
    Ok((reference, attr))
}

/// Local paths become absolute with symlinks resolved so the evaluator
/// sees the same flake no matter the working directory; anything that is
/// not an existing path is treated as a remote reference.
fn normalize_local_reference(reference: &str) -> Result<String> {
    let path = Path::new(reference);
    if !path.exists() {
        return Ok(reference.to_string());
    }
    let resolved = fs::canonicalize(path)
        .map_err(InstallerError::io(format!("resolving flake path '{reference}'")))?;
    Ok(resolved.to_string_lossy().into_owned())
}

/// Fold one `--system-config` value into the accumulated overrides.
/// Later occurrences win on key collisions.
fn merge_system_config(accumulated: &mut Map<String, Value>, text: &str) -> Result<()> {
    let value: Value = serde_json::from_str(text).map_err(|err| {
        InstallerError::Config(format!("--system-config is not valid JSON: {err}"))
    })?;
    match value {
        Value::Object(object) => {
            accumulated.extend(object);
            Ok(())
        }
        other => Err(InstallerError::Config(format!(
            "--system-config must be a JSON object, got: {other}"
        ))),
    }
}
