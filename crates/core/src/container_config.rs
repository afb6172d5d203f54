//! Container OCI configuration handling
//!
//! The shim learns everything it knows about a container from the
//! `config.json` the supervisor materialized on disk: whether the container
//! opted in, where checkpoints live, and where scratch storage mounts. The
//! document is navigated and edited as raw JSON so every field the shim
//! does not understand survives a rewrite untouched.
//!
//! The config is only ever written on the `create` path, before the
//! container runs, so there is no concurrent writer to guard against.

use crate::errors::Result;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// In-container env var opting a container into shim behavior (`"1"`)
pub const ENV_ENABLE: &str = "CRYO_ENABLE";

/// In-container env var naming the shared filesystem root
pub const ENV_SHAREDFS_HOST_PATH: &str = "CRYO_SHAREDFS_HOST_PATH";

/// In-container env var naming an alternative checkpoint root
pub const ENV_CHECKPOINT_HOST_PATH: &str = "CRYO_CHECKPOINT_HOST_PATH";

/// In-container env var choosing the scratch mount destination
pub const ENV_WORKDIR_CONTAINER_PATH: &str = "CRYO_WORKDIR_CONTAINER_PATH";

/// Fallback checkpoint root when no env var points elsewhere
pub const DEFAULT_CHECKPOINT_ROOT: &str = "/var/lib/cryo/checkpoint";

/// Default in-container destination for the scratch bind mount
pub const DEFAULT_WORKDIR: &str = "/tmp";

/// Where supervisors put `config.json`, most specific first
const CONFIG_SEARCH_TEMPLATES: &[&str] = &[
    "/run/containerd/io.containerd.runtime.v2.task/{namespace}/{container_id}/config.json",
    "/run/containerd/runc/{namespace}/{container_id}/config.json",
    "/run/runc/{namespace}/{container_id}/config.json",
];

/// Read-mostly view over a container's OCI configuration
#[derive(Debug, Clone)]
pub struct ContainerConfigHandler {
    search_templates: Vec<String>,
    checkpoint_root: PathBuf,
}

impl Default for ContainerConfigHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerConfigHandler {
    /// Handler probing the standard supervisor runtime directories
    pub fn new() -> Self {
        Self {
            search_templates: CONFIG_SEARCH_TEMPLATES
                .iter()
                .map(|t| t.to_string())
                .collect(),
            checkpoint_root: PathBuf::from(DEFAULT_CHECKPOINT_ROOT),
        }
    }

    /// Handler probing explicit path templates (tests)
    ///
    /// Templates use `{namespace}` and `{container_id}` placeholders.
    pub fn with_search_templates<P: Into<PathBuf>>(
        search_templates: Vec<String>,
        checkpoint_root: P,
    ) -> Self {
        Self {
            search_templates,
            checkpoint_root: checkpoint_root.into(),
        }
    }

    fn find_config_path(&self, namespace: &str, container_id: &str) -> Option<PathBuf> {
        for template in &self.search_templates {
            let path = PathBuf::from(
                template
                    .replace("{namespace}", namespace)
                    .replace("{container_id}", container_id),
            );
            if path.exists() {
                debug!(path = %path.display(), "found container config");
                return Some(path);
            }
        }
        debug!(
            namespace = %namespace,
            container_id = %container_id,
            "no container config found"
        );
        None
    }

    fn read_config(&self, path: &Path) -> Result<Value> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn write_config(&self, path: &Path, config: &Value) -> Result<()> {
        let contents = serde_json::to_string_pretty(config)?;
        // Atomic replace: temp file in the same directory, then rename
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("config.json");
        let temp_path = path
            .parent()
            .unwrap_or(Path::new("."))
            .join(format!(".{}.tmp", file_name));
        fs::write(&temp_path, contents)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Value of `name` in the container's `process.env`, if set
    ///
    /// The value is everything after the first `=` of the first matching
    /// entry.
    pub fn env_value(&self, namespace: &str, container_id: &str, name: &str) -> Option<String> {
        if namespace.is_empty() || container_id.is_empty() {
            return None;
        }
        let path = self.find_config_path(namespace, container_id)?;
        let config = self.read_config(&path).ok()?;
        let env = config.get("process")?.get("env")?.as_array()?;
        let prefix = format!("{}=", name);
        env.iter()
            .filter_map(|entry| entry.as_str())
            .find(|entry| entry.starts_with(&prefix))
            .map(|entry| entry[prefix.len()..].to_string())
    }

    /// Whether the container opted into shim behavior
    pub fn is_cryo_enabled(&self, namespace: &str, container_id: &str) -> bool {
        self.env_value(namespace, container_id, ENV_ENABLE)
            .map(|value| value == "1")
            .unwrap_or(false)
    }

    /// Resolve the container's checkpoint directory
    ///
    /// Priority: shared filesystem, then checkpoint host path, then the
    /// default root. `None` only when the container config itself cannot be
    /// located.
    pub fn checkpoint_path(&self, namespace: &str, container_id: &str) -> Option<PathBuf> {
        self.find_config_path(namespace, container_id)?;

        if let Some(sharedfs) = self.env_value(namespace, container_id, ENV_SHAREDFS_HOST_PATH) {
            return Some(
                PathBuf::from(sharedfs)
                    .join("checkpoint")
                    .join(namespace)
                    .join(container_id),
            );
        }
        if let Some(host) = self.env_value(namespace, container_id, ENV_CHECKPOINT_HOST_PATH) {
            return Some(PathBuf::from(host).join(namespace).join(container_id));
        }
        Some(self.checkpoint_root.join(namespace).join(container_id))
    }

    /// The container's scratch directory on the shared filesystem, if any
    pub fn work_directory(&self, namespace: &str, container_id: &str) -> Option<PathBuf> {
        let sharedfs = self.env_value(namespace, container_id, ENV_SHAREDFS_HOST_PATH)?;
        Some(
            PathBuf::from(sharedfs)
                .join("work")
                .join(namespace)
                .join(container_id),
        )
    }

    /// Bind the scratch directory into the container and chdir there
    ///
    /// Only acts when the shared filesystem is configured; without it the
    /// call is a successful no-op. Preconditions are checked in order and
    /// any failure returns `Ok(false)` with the config untouched:
    /// the scratch source must be creatable, the runtime dir must carry a
    /// `rootfs`, the destination must already exist inside that rootfs, and
    /// neither the destination nor the source may already be mounted.
    ///
    /// On success the mount is appended, `process.cwd` is overwritten with
    /// the destination, and the config is rewritten atomically.
    pub fn add_bind_mount(&self, namespace: &str, container_id: &str) -> Result<bool> {
        let Some(source) = self.work_directory(namespace, container_id) else {
            return Ok(true);
        };
        let destination = self
            .env_value(namespace, container_id, ENV_WORKDIR_CONTAINER_PATH)
            .unwrap_or_else(|| DEFAULT_WORKDIR.to_string());

        if let Err(err) = fs::create_dir_all(&source) {
            warn!(path = %source.display(), error = %err, "failed to create work directory");
            return Ok(false);
        }

        let Some(config_path) = self.find_config_path(namespace, container_id) else {
            return Ok(false);
        };
        let runtime_dir = config_path.parent().unwrap_or(Path::new("."));

        let rootfs = runtime_dir.join("rootfs");
        if !rootfs.exists() {
            warn!(path = %rootfs.display(), "rootfs not found, skipping bind mount");
            return Ok(false);
        }
        let dest_in_rootfs = rootfs.join(destination.trim_start_matches('/'));
        if !dest_in_rootfs.exists() {
            warn!(
                destination = %destination,
                path = %dest_in_rootfs.display(),
                "mount destination missing inside container rootfs"
            );
            return Ok(false);
        }

        let mut config = self.read_config(&config_path)?;
        let source_str = source.display().to_string();
        let Some(root) = config.as_object_mut() else {
            warn!(path = %config_path.display(), "config.json is not a JSON object");
            return Ok(false);
        };

        let mounts = root
            .entry("mounts")
            .or_insert_with(|| Value::Array(Vec::new()));
        let Some(mounts) = mounts.as_array_mut() else {
            return Ok(false);
        };
        for mount in mounts.iter() {
            if mount.get("destination").and_then(Value::as_str) == Some(destination.as_str()) {
                warn!(destination = %destination, "destination already mounted");
                return Ok(false);
            }
            if mount.get("source").and_then(Value::as_str) == Some(source_str.as_str()) {
                warn!(source = %source_str, "source already mounted");
                return Ok(false);
            }
        }

        mounts.push(json!({
            "type": "bind",
            "source": source_str.clone(),
            "destination": destination.clone(),
            "options": ["rbind", "rw"],
        }));

        let process = root
            .entry("process")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(process) = process.as_object_mut() {
            if let Some(prior) = process.get("cwd").and_then(Value::as_str) {
                debug!(prior = %prior, new = %destination, "overriding working directory");
            }
            process.insert("cwd".to_string(), Value::String(destination.clone()));
        }

        self.write_config(&config_path, &config)?;
        debug!(
            container_id = %container_id,
            source = %source_str,
            destination = %destination,
            "added scratch bind mount"
        );
        Ok(true)
    }

    /// Remove the container's scratch directory
    ///
    /// True when the directory is gone afterwards (including when there was
    /// nothing to remove), false on error.
    pub fn delete_work_directory(&self, namespace: &str, container_id: &str) -> bool {
        let Some(work_dir) = self.work_directory(namespace, container_id) else {
            return true;
        };
        if !work_dir.exists() {
            return true;
        }
        match fs::remove_dir_all(&work_dir) {
            Ok(()) => {
                debug!(path = %work_dir.display(), "deleted work directory");
                true
            }
            Err(err) => {
                warn!(path = %work_dir.display(), error = %err, "failed to delete work directory");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// A fake supervisor runtime directory rooted in a tempdir
    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        handler: ContainerConfigHandler,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let root = tmp.path().to_path_buf();
            let template = format!(
                "{}/run/{{namespace}}/{{container_id}}/config.json",
                root.display()
            );
            let handler = ContainerConfigHandler::with_search_templates(
                vec![template],
                root.join("checkpoint"),
            );
            Self {
                _tmp: tmp,
                root,
                handler,
            }
        }

        fn runtime_dir(&self, namespace: &str, container_id: &str) -> PathBuf {
            self.root.join("run").join(namespace).join(container_id)
        }

        fn write_config(&self, namespace: &str, container_id: &str, env: &[&str]) -> PathBuf {
            let dir = self.runtime_dir(namespace, container_id);
            fs::create_dir_all(&dir).unwrap();
            let config = json!({
                "ociVersion": "1.0.2",
                "process": {
                    "cwd": "/",
                    "env": env,
                    "args": ["/bin/sh"],
                },
                "root": {"path": "rootfs"},
                "mounts": [
                    {"type": "proc", "source": "proc", "destination": "/proc"}
                ],
            });
            let path = dir.join("config.json");
            fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
            path
        }

        fn sharedfs_env(&self) -> String {
            format!("CRYO_SHAREDFS_HOST_PATH={}", self.root.join("nfs").display())
        }
    }

    #[test]
    fn test_opt_in_requires_exact_value() {
        let fx = Fixture::new();
        fx.write_config("default", "on", &["CRYO_ENABLE=1"]);
        fx.write_config("default", "off", &["CRYO_ENABLE=0"]);
        fx.write_config("default", "unset", &["PATH=/bin"]);

        assert!(fx.handler.is_cryo_enabled("default", "on"));
        assert!(!fx.handler.is_cryo_enabled("default", "off"));
        assert!(!fx.handler.is_cryo_enabled("default", "unset"));
        assert!(!fx.handler.is_cryo_enabled("default", "missing-container"));
    }

    #[test]
    fn test_env_value_splits_on_first_equals() {
        let fx = Fixture::new();
        fx.write_config("default", "tc", &["OPTS=a=b=c"]);
        assert_eq!(
            fx.handler.env_value("default", "tc", "OPTS").unwrap(),
            "a=b=c"
        );
    }

    #[test]
    fn test_checkpoint_path_prefers_sharedfs() {
        let fx = Fixture::new();
        let sharedfs = fx.sharedfs_env();
        fx.write_config(
            "default",
            "tc",
            &[
                sharedfs.as_str(),
                "CRYO_CHECKPOINT_HOST_PATH=/mnt/ckpt",
            ],
        );
        assert_eq!(
            fx.handler.checkpoint_path("default", "tc").unwrap(),
            fx.root.join("nfs/checkpoint/default/tc")
        );
    }

    #[test]
    fn test_checkpoint_path_host_then_default() {
        let fx = Fixture::new();
        fx.write_config("default", "host", &["CRYO_CHECKPOINT_HOST_PATH=/mnt/ckpt"]);
        assert_eq!(
            fx.handler.checkpoint_path("default", "host").unwrap(),
            PathBuf::from("/mnt/ckpt/default/host")
        );

        fx.write_config("default", "plain", &[]);
        assert_eq!(
            fx.handler.checkpoint_path("default", "plain").unwrap(),
            fx.root.join("checkpoint/default/plain")
        );
    }

    #[test]
    fn test_checkpoint_path_none_without_config() {
        let fx = Fixture::new();
        assert!(fx.handler.checkpoint_path("default", "ghost").is_none());
    }

    #[test]
    fn test_add_bind_mount_without_sharedfs_is_a_noop() {
        let fx = Fixture::new();
        let config_path = fx.write_config("default", "tc", &["CRYO_ENABLE=1"]);
        let before = fs::read_to_string(&config_path).unwrap();
        assert!(fx.handler.add_bind_mount("default", "tc").unwrap());
        assert_eq!(fs::read_to_string(&config_path).unwrap(), before);
    }

    #[test]
    fn test_add_bind_mount_appends_mount_and_sets_cwd() {
        let fx = Fixture::new();
        let sharedfs = fx.sharedfs_env();
        let config_path = fx.write_config("default", "tc", &[sharedfs.as_str()]);
        fs::create_dir_all(fx.runtime_dir("default", "tc").join("rootfs/tmp")).unwrap();

        assert!(fx.handler.add_bind_mount("default", "tc").unwrap());

        let config: Value =
            serde_json::from_str(&fs::read_to_string(&config_path).unwrap()).unwrap();
        let mounts = config["mounts"].as_array().unwrap();
        let bind = mounts.last().unwrap();
        assert_eq!(bind["type"], "bind");
        assert_eq!(
            bind["source"].as_str().unwrap(),
            fx.root.join("nfs/work/default/tc").display().to_string()
        );
        assert_eq!(bind["destination"], "/tmp");
        assert_eq!(bind["options"], json!(["rbind", "rw"]));
        assert_eq!(config["process"]["cwd"], "/tmp");
        // Fields the shim does not understand survive the rewrite
        assert_eq!(config["ociVersion"], "1.0.2");
        assert_eq!(config["process"]["args"], json!(["/bin/sh"]));
        // Source directory was created on the host
        assert!(fx.root.join("nfs/work/default/tc").is_dir());
    }

    #[test]
    fn test_add_bind_mount_honors_workdir_env() {
        let fx = Fixture::new();
        let sharedfs = fx.sharedfs_env();
        let config_path = fx.write_config(
            "default",
            "tc",
            &[sharedfs.as_str(), "CRYO_WORKDIR_CONTAINER_PATH=/scratch"],
        );
        fs::create_dir_all(fx.runtime_dir("default", "tc").join("rootfs/scratch")).unwrap();

        assert!(fx.handler.add_bind_mount("default", "tc").unwrap());
        let config: Value =
            serde_json::from_str(&fs::read_to_string(&config_path).unwrap()).unwrap();
        assert_eq!(config["process"]["cwd"], "/scratch");
    }

    #[test]
    fn test_add_bind_mount_requires_rootfs() {
        let fx = Fixture::new();
        let sharedfs = fx.sharedfs_env();
        fx.write_config("default", "tc", &[sharedfs.as_str()]);
        // No rootfs directory in the runtime dir
        assert!(!fx.handler.add_bind_mount("default", "tc").unwrap());
    }

    #[test]
    fn test_add_bind_mount_requires_destination_in_rootfs() {
        let fx = Fixture::new();
        let sharedfs = fx.sharedfs_env();
        fx.write_config("default", "tc", &[sharedfs.as_str()]);
        // rootfs exists but /tmp does not
        fs::create_dir_all(fx.runtime_dir("default", "tc").join("rootfs")).unwrap();
        assert!(!fx.handler.add_bind_mount("default", "tc").unwrap());
    }

    #[test]
    fn test_add_bind_mount_rejects_duplicate_destination() {
        let fx = Fixture::new();
        let sharedfs = fx.sharedfs_env();
        let dir = fx.runtime_dir("default", "tc");
        fs::create_dir_all(dir.join("rootfs/tmp")).unwrap();
        fs::create_dir_all(&dir).unwrap();
        let config = json!({
            "process": {"cwd": "/", "env": [sharedfs]},
            "mounts": [
                {"type": "tmpfs", "source": "tmpfs", "destination": "/tmp"}
            ],
        });
        fs::write(
            dir.join("config.json"),
            serde_json::to_string(&config).unwrap(),
        )
        .unwrap();

        assert!(!fx.handler.add_bind_mount("default", "tc").unwrap());
        // Config untouched on refusal
        let after: Value =
            serde_json::from_str(&fs::read_to_string(dir.join("config.json")).unwrap()).unwrap();
        assert_eq!(after["mounts"].as_array().unwrap().len(), 1);
        assert_eq!(after["process"]["cwd"], "/");
    }

    #[test]
    fn test_add_bind_mount_rejects_duplicate_source() {
        let fx = Fixture::new();
        let sharedfs = fx.sharedfs_env();
        let source = fx.root.join("nfs/work/default/tc");
        let dir = fx.runtime_dir("default", "tc");
        fs::create_dir_all(dir.join("rootfs/tmp")).unwrap();
        let config = json!({
            "process": {"cwd": "/", "env": [sharedfs]},
            "mounts": [
                {"type": "bind", "source": source.display().to_string(), "destination": "/other"}
            ],
        });
        fs::write(
            dir.join("config.json"),
            serde_json::to_string(&config).unwrap(),
        )
        .unwrap();

        assert!(!fx.handler.add_bind_mount("default", "tc").unwrap());
    }

    #[test]
    fn test_delete_work_directory_is_idempotent() {
        let fx = Fixture::new();
        let sharedfs = fx.sharedfs_env();
        fx.write_config("default", "tc", &[sharedfs.as_str()]);
        let work_dir = fx.root.join("nfs/work/default/tc");
        fs::create_dir_all(&work_dir).unwrap();
        fs::write(work_dir.join("scratch.dat"), "x").unwrap();

        assert!(fx.handler.delete_work_directory("default", "tc"));
        assert!(!work_dir.exists());
        assert!(fx.handler.delete_work_directory("default", "tc"));
    }

    #[test]
    fn test_delete_work_directory_without_sharedfs() {
        let fx = Fixture::new();
        fx.write_config("default", "tc", &[]);
        assert!(fx.handler.delete_work_directory("default", "tc"));
    }
}
