//! Nix interaction layer.
//!
//! Everything that touches the build evaluator lives here: serializing
//! the disk mapping as a Nix attrset literal, escaping values for Nix
//! string syntax, picking the evaluator front-end, rendering the build
//! expression, and reconciling the evaluator's output into the two
//! artifacts the rest of the run consumes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::RunConfig;
use crate::error::{InstallerError, Result};

/// Log-rendering evaluator front-end, argument-compatible with
/// [`STANDARD_EVALUATOR`]. Preferred when present; purely cosmetic.
pub const FAST_EVALUATOR: &str = "nom-build";
/// The evaluator every Nix installation has.
pub const STANDARD_EVALUATOR: &str = "nix-build";

/// The two build outputs of one evaluator run, in the order they are
/// requested and printed: system closure first, partition script second.
///
/// Produced once per run and consumed immediately; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    /// Store path of the system closure to install.
    pub system: PathBuf,
    /// Store path of the script that formats or mounts the target disks.
    pub partition_script: PathBuf,
}

/// Escape a string for a double-quoted Nix string literal: backslashes,
/// quotes, and `${` interpolation.
pub fn escape_nix_string(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '$' if chars.peek() == Some(&'{') => escaped.push_str("\\$"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Escape a string for a Nix indented string (`''...''`). `''` closes
/// the literal and `${` starts interpolation; both have dedicated escape
/// forms.
pub fn escape_indented_string(raw: &str) -> String {
    raw.replace("''", "'''").replace("${", "''${")
}

/// Serialize a name -> value mapping as a Nix attribute set literal,
/// e.g. `{ "main" = "/dev/vda"; }`. An empty mapping serializes to
/// `{ }`. Iteration order follows the map and carries no meaning; quote
/// characters in keys and values are escaped so the literal stays valid.
pub fn attrset_literal(mapping: &BTreeMap<String, String>) -> String {
    let mut literal = String::from("{ ");
    for (key, value) in mapping {
        literal.push('"');
        literal.push_str(&escape_nix_string(key));
        literal.push_str("\" = \"");
        literal.push_str(&escape_nix_string(value));
        literal.push_str("\"; ");
    }
    literal.push('}');
    literal
}

/// Pick the evaluator front-end: `nom-build` when it is on PATH,
/// `nix-build` otherwise. A capability probe at startup, not dispatch.
pub fn select_evaluator() -> &'static str {
    evaluator_name(which::which(FAST_EVALUATOR).is_ok())
}

fn evaluator_name(fast_available: bool) -> &'static str {
    if fast_available {
        FAST_EVALUATOR
    } else {
        STANDARD_EVALUATOR
    }
}

/// Render the Nix expression evaluated for one run.
///
/// The expression extends the selected NixOS configuration with a module
/// forcing the disko mount point, the disk device overrides, and the EFI
/// flag, plus a module from the JSON system-config overrides, and
/// exposes the two requested outputs as named attributes.
fn render_build_expr(config: &RunConfig, mount_point: &Path) -> String {
    let overrides = serde_json::Value::Object(config.extra_system_config.clone()).to_string();
    format!(
        "let
  flake = builtins.getFlake \"{flake}\";
  machine = flake.nixosConfigurations.\"{attr}\".extendModules {{
    modules = [
      ({{ lib, ... }}: {{
        disko.rootMountPoint = \"{mount_point}\";
        disko.devices.disk = lib.mapAttrs (name: device: {{ device = lib.mkForce device; }}) ({disks});
        boot.loader.efi.canTouchEfiVariables = lib.mkForce {efi};
      }})
      (builtins.fromJSON ''{overrides}'')
    ];
  }};
in {{
  installToplevel = machine.config.system.build.toplevel;
  inherit (machine.config.system.build) {script_attr};
}}",
        flake = escape_nix_string(&config.flake),
        attr = escape_nix_string(&config.flake_attr),
        mount_point = escape_nix_string(&mount_point.to_string_lossy()),
        disks = attrset_literal(&config.disks),
        efi = if config.write_efi_boot_entries { "true" } else { "false" },
        overrides = escape_indented_string(&overrides),
        script_attr = config.mode.script_attr(),
    )
}

/// Arguments for one evaluator invocation, program name excluded.
///
/// The two outputs are requested in fixed order, system closure first;
/// the caller-supplied extra arguments go last so they can override
/// evaluator defaults.
pub fn evaluator_args(config: &RunConfig, mount_point: &Path) -> Vec<String> {
    let mut args = vec![
        "--no-out-link".to_string(),
        "--impure".to_string(),
        "--expr".to_string(),
        render_build_expr(config, mount_point),
        "-A".to_string(),
        "installToplevel".to_string(),
        "-A".to_string(),
        config.mode.script_attr().to_string(),
    ];
    args.extend(config.extra_build_args.iter().cloned());
    args
}

/// Build the system closure and the partition script in one evaluator
/// run.
///
/// Stdout carries one store path per requested output; stderr streams
/// the build log to the operator unchanged. A non-zero exit or a
/// malformed output aborts the run before anything destructive happens.
pub fn build_artifacts(config: &RunConfig, mount_point: &Path) -> Result<ArtifactSet> {
    let evaluator = select_evaluator();
    println!("Building the system closure and partition script with {evaluator}...");

    let output = Command::new(evaluator)
        .args(evaluator_args(config, mount_point))
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .output()
        .map_err(InstallerError::io(format!("running {evaluator}")))?;

    if !output.status.success() {
        return Err(InstallerError::Build(format!(
            "{evaluator} failed with {}",
            output.status
        )));
    }

    parse_artifacts(&String::from_utf8_lossy(&output.stdout))
}

/// Split evaluator stdout into the fixed-order artifact pair. Exactly
/// two non-empty lines are acceptable; anything else means the
/// evaluator and this tool disagree about the contract.
fn parse_artifacts(stdout: &str) -> Result<ArtifactSet> {
    let paths: Vec<&str> = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    match paths.as_slice() {
        [system, partition_script] => Ok(ArtifactSet {
            system: PathBuf::from(system),
            partition_script: PathBuf::from(partition_script),
        }),
        other => Err(InstallerError::Build(format!(
            "expected exactly two build artifacts (system closure and partition script), got {}",
            other.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;

    fn test_config(mode: Mode) -> RunConfig {
        RunConfig {
            flake: "/etc/nixos".to_string(),
            flake_attr: "hostA".to_string(),
            mode,
            disks: BTreeMap::from([("main".to_string(), "/dev/vda".to_string())]),
            extra_files: BTreeMap::new(),
            extra_system_config: serde_json::Map::new(),
            write_efi_boot_entries: false,
            extra_build_args: vec![],
            dry_run: false,
        }
    }

    /// Undo [`attrset_literal`]: read the quoted key/value pairs back
    /// into a map, unescaping as we go. Only assertions about the
    /// resulting mapping are meaningful; textual order is unspecified.
    fn parse_attrset(literal: &str) -> BTreeMap<String, String> {
        let inner = literal
            .trim()
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .expect("attrset literal is braced");
        let mut mapping = BTreeMap::new();
        let mut chars = inner.chars().peekable();
        while let Some(key) = read_quoted(&mut chars) {
            let value = read_quoted(&mut chars).expect("key has a value");
            mapping.insert(key, value);
        }
        mapping
    }

    fn read_quoted(chars: &mut std::iter::Peekable<std::str::Chars>) -> Option<String> {
        loop {
            match chars.next() {
                Some('"') => break,
                Some(_) => continue,
                None => return None,
            }
        }
        let mut out = String::new();
        loop {
            match chars.next() {
                Some('\\') => out.push(chars.next().expect("dangling escape")),
                Some('"') => return Some(out),
                Some(c) => out.push(c),
                None => panic!("unterminated quoted string"),
            }
        }
    }

    #[test]
    fn empty_mapping_serializes_to_empty_attrset() {
        assert_eq!(attrset_literal(&BTreeMap::new()), "{ }");
    }

    #[test]
    fn attrset_round_trips_up_to_map_equality() {
        let mapping = BTreeMap::from([
            ("main".to_string(), "/dev/disk/by-id/ata-X".to_string()),
            ("we\"ird".to_string(), "/dev/\"quoted\"".to_string()),
            ("back\\slash".to_string(), "a\\b".to_string()),
        ]);
        let parsed = parse_attrset(&attrset_literal(&mapping));
        assert_eq!(parsed, mapping);

        // Serializing the parsed mapping again is a fixed point.
        assert_eq!(attrset_literal(&parsed), attrset_literal(&mapping));
    }

    #[test]
    fn nix_string_escaping_handles_quotes_and_interpolation() {
        assert_eq!(escape_nix_string(r#"a"b"#), r#"a\"b"#);
        assert_eq!(escape_nix_string(r"a\b"), r"a\\b");
        assert_eq!(escape_nix_string("${x}"), "\\${x}");
        assert_eq!(escape_nix_string("$x"), "$x");
    }

    #[test]
    fn indented_string_escaping_handles_closers_and_interpolation() {
        assert_eq!(escape_indented_string("it's"), "it's");
        assert_eq!(escape_indented_string("''"), "'''");
        assert_eq!(escape_indented_string("${x}"), "''${x}");
    }

    fn requests_output(args: &[String], attr: &str) -> bool {
        args.windows(2).any(|w| w[0] == "-A" && w[1] == attr)
    }

    #[test]
    fn format_mode_requests_the_format_script() {
        let args = evaluator_args(&test_config(Mode::Format), Path::new("/tmp/mnt"));
        assert!(requests_output(&args, "diskoScript"));
        assert!(!args.iter().any(|a| a == "mountScript"));
    }

    #[test]
    fn mount_mode_requests_the_mount_script() {
        let args = evaluator_args(&test_config(Mode::Mount), Path::new("/tmp/mnt"));
        assert!(requests_output(&args, "mountScript"));
    }

    #[test]
    fn system_closure_is_requested_first() {
        let args = evaluator_args(&test_config(Mode::Format), Path::new("/tmp/mnt"));
        let toplevel = args.iter().position(|a| a == "installToplevel").unwrap();
        let script = args.iter().position(|a| a == "diskoScript").unwrap();
        assert!(toplevel < script);
    }

    #[test]
    fn extra_build_args_are_forwarded_verbatim_and_last() {
        let mut config = test_config(Mode::Format);
        config.extra_build_args = vec![
            "--option".to_string(),
            "cores".to_string(),
            "4".to_string(),
            "--show-trace".to_string(),
        ];
        let args = evaluator_args(&config, Path::new("/tmp/mnt"));
        assert_eq!(&args[args.len() - 4..], &config.extra_build_args[..]);
    }

    #[test]
    fn build_expr_carries_the_run_parameters() {
        let mut config = test_config(Mode::Format);
        config.write_efi_boot_entries = true;
        config
            .extra_system_config
            .insert("networking".to_string(), serde_json::json!({"hostName": "hostA"}));
        let expr = render_build_expr(&config, Path::new("/tmp/disko-install.xyz"));

        assert!(expr.contains("builtins.getFlake \"/etc/nixos\""));
        assert!(expr.contains("nixosConfigurations.\"hostA\""));
        assert!(expr.contains("disko.rootMountPoint = \"/tmp/disko-install.xyz\""));
        assert!(expr.contains("\"main\" = \"/dev/vda\";"));
        assert!(expr.contains("canTouchEfiVariables = lib.mkForce true"));
        assert!(expr.contains(r#"builtins.fromJSON ''{"networking":{"hostName":"hostA"}}''"#));
        assert!(expr.contains("inherit (machine.config.system.build) diskoScript;"));
    }

    #[test]
    fn artifact_output_must_be_exactly_two_paths() {
        let set = parse_artifacts("/nix/store/aaa-toplevel\n/nix/store/bbb-disko-script\n").unwrap();
        assert_eq!(set.system, PathBuf::from("/nix/store/aaa-toplevel"));
        assert_eq!(set.partition_script, PathBuf::from("/nix/store/bbb-disko-script"));

        assert!(parse_artifacts("").is_err());
        assert!(parse_artifacts("/nix/store/aaa-toplevel\n").is_err());
        assert!(parse_artifacts("/a\n/b\n/c\n").is_err());
    }

    #[test]
    fn blank_lines_in_evaluator_output_are_ignored() {
        let set = parse_artifacts("\n/nix/store/aaa\n\n/nix/store/bbb\n\n").unwrap();
        assert_eq!(set.system, PathBuf::from("/nix/store/aaa"));
    }

    #[test]
    fn front_end_selection_prefers_the_fast_evaluator() {
        assert_eq!(evaluator_name(true), FAST_EVALUATOR);
        assert_eq!(evaluator_name(false), STANDARD_EVALUATOR);
    }
}
