//! Intercepted runtime command parsing
//!
//! Decodes a raw runc argv into `{global options, subcommand, subcommand
//! options, container id, namespace}` without knowing the full runc option
//! grammar: a fixed table of known boolean flags disambiguates `--flag id`
//! from `--opt value`, and everything else is carried through untouched so
//! pass-through invocations stay byte-faithful.
//!
//! Supported shape: `runc [global options] subcommand [options] container-id`.

use crate::errors::{CryoError, Result};
use indexmap::IndexMap;

/// Subcommands the lifecycle engine intercepts; everything else is passed
/// straight to the real runtime.
pub const INTERCEPTED_SUBCOMMANDS: &[&str] = &["create", "start", "checkpoint", "resume", "delete"];

/// runc options that never take a value
///
/// When one of these is followed by a bare token, that token is the next
/// positional argument (usually the container id), not the option's value.
pub const BOOLEAN_FLAGS: &[&str] = &[
    "--leave-running",
    "--tcp-established",
    "--ext-unix-sk",
    "--shell-job",
    "--lazy-pages",
    "--file-locks",
    "--pre-dump",
    "--auto-dedup",
    "--no-pivot",
    "--no-new-keyring",
    "--force",
    "--debug",
    "--systemd-cgroup",
    "--help",
    "-h",
    "--version",
    "-v",
    "--detach",
    "--rootless",
    "--manage-cgroups-mode",
    "--empty-ns",
    "--status-fd",
    "--page-server",
];

/// The namespace used when `--root` does not carry one
pub const DEFAULT_NAMESPACE: &str = "default";

/// A parsed runtime invocation
///
/// Options map to their value, with the empty string denoting a boolean
/// flag. `IndexMap` keeps the original ordering so rebuilt commands look
/// like what the caller sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuncCommand {
    /// Subcommand, empty for global-only invocations such as `--version`
    pub subcommand: String,
    /// Options before the subcommand
    pub global_options: IndexMap<String, String>,
    /// Options between the subcommand and the container id
    pub subcommand_options: IndexMap<String, String>,
    /// Last non-option token, empty when absent
    pub container_id: String,
    /// Derived from the final segment of `--root`, `"default"` otherwise
    pub namespace: String,
}

impl RuncCommand {
    /// Parse a full argv (including argv[0]) into a command
    ///
    /// Every non-empty argv parses successfully; downstream logic decides
    /// whether the result is worth intercepting.
    pub fn parse(args: &[String]) -> Result<RuncCommand> {
        if args.is_empty() {
            return Err(CryoError::EmptyCommand);
        }
        let tokens = &args[1..];

        let mut global_options = IndexMap::new();
        let mut i = 0;
        while i < tokens.len() && is_option(&tokens[i]) {
            i = scan_option(tokens, i, &mut global_options);
        }

        // Global-only command such as `runc --version`
        if i >= tokens.len() {
            return Ok(RuncCommand {
                subcommand: String::new(),
                namespace: namespace_from(&global_options),
                global_options,
                subcommand_options: IndexMap::new(),
                container_id: String::new(),
            });
        }

        let subcommand = tokens[i].clone();
        i += 1;

        let mut subcommand_options = IndexMap::new();
        while i < tokens.len() {
            if is_option(&tokens[i]) {
                i = scan_option(tokens, i, &mut subcommand_options);
            } else {
                i += 1;
            }
        }

        let container_id = match tokens.last() {
            Some(last) if !is_option(last) => last.clone(),
            _ => String::new(),
        };

        Ok(RuncCommand {
            subcommand,
            namespace: namespace_from(&global_options),
            global_options,
            subcommand_options,
            container_id,
        })
    }

    /// Whether the subcommand is one the lifecycle engine cares about
    pub fn is_intercepted(&self) -> bool {
        INTERCEPTED_SUBCOMMANDS.contains(&self.subcommand.as_str())
    }

    /// Rebuild an argv (without argv[0]) equivalent to the parsed input
    ///
    /// Boolean flags come back as single tokens, valued options as pairs;
    /// the real runtime accepts the result in place of the original.
    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = Vec::new();
        push_options(&mut argv, &self.global_options);
        if self.subcommand.is_empty() {
            return argv;
        }
        argv.push(self.subcommand.clone());
        push_options(&mut argv, &self.subcommand_options);
        if !self.container_id.is_empty() {
            argv.push(self.container_id.clone());
        }
        argv
    }
}

/// Append an option map to an argv under construction
pub fn push_options(argv: &mut Vec<String>, options: &IndexMap<String, String>) {
    for (name, value) in options {
        argv.push(name.clone());
        if !value.is_empty() {
            argv.push(value.clone());
        }
    }
}

fn is_option(token: &str) -> bool {
    token.starts_with('-')
}

/// Consume one option starting at `i`, returning the index after it
fn scan_option(tokens: &[String], i: usize, options: &mut IndexMap<String, String>) -> usize {
    let token = &tokens[i];

    // runc emits both `--opt value` and `--opt=value`
    if let Some((name, value)) = token.split_once('=') {
        options.insert(name.to_string(), value.to_string());
        return i + 1;
    }

    if BOOLEAN_FLAGS.contains(&token.as_str()) {
        options.insert(token.clone(), String::new());
        i + 1
    } else if i + 1 < tokens.len() && !is_option(&tokens[i + 1]) {
        options.insert(token.clone(), tokens[i + 1].clone());
        i + 2
    } else {
        // Trailing or value-less option, treat as boolean
        options.insert(token.clone(), String::new());
        i + 1
    }
}

fn namespace_from(global_options: &IndexMap<String, String>) -> String {
    if let Some(root) = global_options.get("--root") {
        if !root.is_empty() && !root.ends_with('/') {
            if let Some(segment) = root.rsplit('/').next() {
                if !segment.is_empty() {
                    return segment.to_string();
                }
            }
        }
    }
    DEFAULT_NAMESPACE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_create_command() {
        let cmd = RuncCommand::parse(&argv(&[
            "runc",
            "--root",
            "/run/containerd/runc/k8s.io",
            "create",
            "--bundle",
            "/run/containerd/io.containerd.runtime.v2.task/k8s.io/tc",
            "tc",
        ]))
        .unwrap();

        assert_eq!(cmd.subcommand, "create");
        assert_eq!(cmd.container_id, "tc");
        assert_eq!(cmd.namespace, "k8s.io");
        assert_eq!(
            cmd.global_options.get("--root").unwrap(),
            "/run/containerd/runc/k8s.io"
        );
        assert_eq!(
            cmd.subcommand_options.get("--bundle").unwrap(),
            "/run/containerd/io.containerd.runtime.v2.task/k8s.io/tc"
        );
        assert!(cmd.is_intercepted());
    }

    #[test]
    fn test_empty_argv_fails() {
        assert!(matches!(
            RuncCommand::parse(&[]),
            Err(CryoError::EmptyCommand)
        ));
    }

    #[test]
    fn test_global_only_command() {
        let cmd = RuncCommand::parse(&argv(&["runc", "--version"])).unwrap();
        assert_eq!(cmd.subcommand, "");
        assert_eq!(cmd.container_id, "");
        assert_eq!(cmd.namespace, "default");
        assert_eq!(cmd.global_options.get("--version").unwrap(), "");
        assert!(!cmd.is_intercepted());
    }

    #[test]
    fn test_trailing_slash_root_keeps_default_namespace() {
        let cmd =
            RuncCommand::parse(&argv(&["runc", "--root", "/run/x/runc/", "create", "tc"])).unwrap();
        assert_eq!(cmd.namespace, "default");
    }

    #[test]
    fn test_root_equals_form() {
        let cmd =
            RuncCommand::parse(&argv(&["runc", "--root=/run/x/runc/moby", "create", "tc"])).unwrap();
        assert_eq!(cmd.namespace, "moby");
        assert_eq!(cmd.subcommand, "create");
        assert_eq!(cmd.container_id, "tc");
    }

    #[test]
    fn test_boolean_flag_does_not_swallow_container_id() {
        let cmd = RuncCommand::parse(&argv(&[
            "runc",
            "checkpoint",
            "--leave-running",
            "tc",
        ]))
        .unwrap();
        assert_eq!(cmd.container_id, "tc");
        assert_eq!(cmd.subcommand_options.get("--leave-running").unwrap(), "");
    }

    #[test]
    fn test_unknown_option_takes_following_value() {
        let cmd = RuncCommand::parse(&argv(&[
            "runc",
            "checkpoint",
            "--image-path",
            "/ckpt",
            "--work-path",
            "/work",
            "tc",
        ]))
        .unwrap();
        assert_eq!(cmd.subcommand_options.get("--image-path").unwrap(), "/ckpt");
        assert_eq!(cmd.subcommand_options.get("--work-path").unwrap(), "/work");
        assert_eq!(cmd.container_id, "tc");
    }

    #[test]
    fn test_trailing_option_becomes_boolean_and_no_container_id() {
        let cmd = RuncCommand::parse(&argv(&["runc", "delete", "--force"])).unwrap();
        assert_eq!(cmd.subcommand_options.get("--force").unwrap(), "");
        assert_eq!(cmd.container_id, "");
    }

    #[test]
    fn test_subcommand_without_options() {
        let cmd = RuncCommand::parse(&argv(&["runc", "start", "tc"])).unwrap();
        assert_eq!(cmd.subcommand, "start");
        assert_eq!(cmd.container_id, "tc");
        assert!(cmd.subcommand_options.is_empty());
    }

    #[test]
    fn test_non_intercepted_subcommand_still_parses() {
        let cmd = RuncCommand::parse(&argv(&["runc", "state", "tc"])).unwrap();
        assert_eq!(cmd.subcommand, "state");
        assert!(!cmd.is_intercepted());
    }

    #[test]
    fn test_reconstructed_argv_round_trips() {
        let original = argv(&[
            "runc",
            "--root",
            "/run/containerd/runc/default",
            "--log",
            "/tmp/runc.log",
            "create",
            "--bundle",
            "/b",
            "--no-pivot",
            "tc",
        ]);
        let cmd = RuncCommand::parse(&original).unwrap();
        assert_eq!(cmd.to_argv(), original[1..].to_vec());
    }

    #[test]
    fn test_reconstruction_normalizes_equals_form() {
        let cmd = RuncCommand::parse(&argv(&["runc", "--root=/run/r/ns", "start", "tc"])).unwrap();
        assert_eq!(
            cmd.to_argv(),
            argv(&["--root", "/run/r/ns", "start", "tc"])
        );
    }
}
