//! Supervisor event stream handling
//!
//! The event listener follows the supervisor's event channel (`ctr events`)
//! and records container exit codes in the flag store. Event lines look
//! like
//!
//! ```text
//! 2024-05-01 12:00:00.000000000 +0000 UTC default /tasks/exit {"container_id":"tc","exit_status":137,...}
//! ```
//!
//! with the namespace and topic as the last two tokens before the JSON
//! body. Only `/tasks/exit` matters; a missing `exit_status` means 0. The
//! listener is the sole writer of `exit_code`.

use crate::errors::Result;
use crate::flags::FlagStore;
use serde_json::Value;
use std::io::BufRead;
use tracing::{debug, info, warn};

/// Topic carrying task exit notifications
pub const EXIT_TOPIC: &str = "/tasks/exit";

/// A container exit observed on the event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitEvent {
    pub namespace: String,
    pub container_id: String,
    pub exit_status: i64,
}

/// Parse one event line into an exit event
///
/// Returns `None` for anything that is not a well-formed `/tasks/exit`
/// line; the stream carries plenty of other topics and junk.
pub fn parse_exit_event(line: &str) -> Option<ExitEvent> {
    let json_start = line.find('{')?;
    let head: Vec<&str> = line[..json_start].split_whitespace().collect();
    if head.len() < 3 {
        return None;
    }
    let topic = head[head.len() - 1];
    let namespace = head[head.len() - 2];
    if topic != EXIT_TOPIC {
        return None;
    }

    let body: Value = serde_json::from_str(&line[json_start..]).ok()?;
    let container_id = body.get("container_id")?.as_str()?.to_string();
    let exit_status = body
        .get("exit_status")
        .and_then(Value::as_i64)
        .unwrap_or(0);

    Some(ExitEvent {
        namespace: namespace.to_string(),
        container_id,
        exit_status,
    })
}

/// Record an exit event in the flag store
///
/// Containers without a flag record are not ours; the event is dropped.
pub fn apply_exit_event(store: &FlagStore, event: &ExitEvent) -> Result<()> {
    if !store.exists(&event.namespace, &event.container_id) {
        debug!(
            namespace = %event.namespace,
            container_id = %event.container_id,
            "exit event for unknown container, ignoring"
        );
        return Ok(());
    }
    info!(
        namespace = %event.namespace,
        container_id = %event.container_id,
        exit_status = event.exit_status,
        "recording container exit"
    );
    store.set_exit_code(&event.namespace, &event.container_id, event.exit_status)
}

/// Drain an event stream into the flag store
///
/// Runs until the stream ends. Individual bad lines are skipped; a store
/// failure is logged and the loop keeps going, because one container's
/// record must not starve the others.
pub fn follow<R: BufRead>(store: &FlagStore, reader: R) -> Result<()> {
    for line in reader.lines() {
        let line = line?;
        let Some(event) = parse_exit_event(&line) else {
            continue;
        };
        if let Err(err) = apply_exit_event(store, &event) {
            warn!(
                container_id = %event.container_id,
                error = %err,
                "failed to record exit event"
            );
        }
    }
    info!("event stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const EXIT_LINE: &str = "2024-05-01 12:00:00.000000000 +0000 UTC default /tasks/exit {\"container_id\":\"tc\",\"id\":\"tc\",\"pid\":42,\"exit_status\":137}";

    #[test]
    fn test_parse_exit_event() {
        let event = parse_exit_event(EXIT_LINE).unwrap();
        assert_eq!(event.namespace, "default");
        assert_eq!(event.container_id, "tc");
        assert_eq!(event.exit_status, 137);
    }

    #[test]
    fn test_missing_exit_status_defaults_to_zero() {
        let line = "2024-05-01 12:00:00 +0000 UTC k8s.io /tasks/exit {\"container_id\":\"web\"}";
        let event = parse_exit_event(line).unwrap();
        assert_eq!(event.exit_status, 0);
        assert_eq!(event.namespace, "k8s.io");
    }

    #[test]
    fn test_other_topics_are_ignored() {
        let line = "2024-05-01 12:00:00 +0000 UTC default /tasks/create {\"container_id\":\"tc\"}";
        assert!(parse_exit_event(line).is_none());
    }

    #[test]
    fn test_non_json_lines_are_ignored() {
        assert!(parse_exit_event("ctr: connected").is_none());
        assert!(parse_exit_event("").is_none());
        assert!(parse_exit_event("default /tasks/exit not-json").is_none());
    }

    #[test]
    fn test_malformed_json_body_is_ignored() {
        let line = "2024-05-01 12:00:00 +0000 UTC default /tasks/exit {broken";
        assert!(parse_exit_event(line).is_none());
    }

    #[test]
    fn test_apply_records_exit_code_for_known_container() {
        let tmp = TempDir::new().unwrap();
        let store = FlagStore::with_state_dir(tmp.path()).unwrap();
        store.create("default", "tc").unwrap();

        let event = parse_exit_event(EXIT_LINE).unwrap();
        apply_exit_event(&store, &event).unwrap();
        assert_eq!(store.exit_code("default", "tc"), Some(137));
    }

    #[test]
    fn test_apply_skips_unknown_container() {
        let tmp = TempDir::new().unwrap();
        let store = FlagStore::with_state_dir(tmp.path()).unwrap();
        let event = parse_exit_event(EXIT_LINE).unwrap();
        apply_exit_event(&store, &event).unwrap();
        assert!(!store.exists("default", "tc"));
    }

    #[test]
    fn test_follow_processes_a_stream() {
        let tmp = TempDir::new().unwrap();
        let store = FlagStore::with_state_dir(tmp.path()).unwrap();
        store.create("default", "tc").unwrap();

        let stream = format!(
            "ctr: connected\n{}\n2024-05-01 12:00:01 +0000 UTC default /tasks/delete {{\"container_id\":\"tc\"}}\n",
            EXIT_LINE
        );
        follow(&store, stream.as_bytes()).unwrap();
        assert_eq!(store.exit_code("default", "tc"), Some(137));
    }
}
