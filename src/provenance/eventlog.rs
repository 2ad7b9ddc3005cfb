//! Append-only JSONL provenance log, one file per service.

use crate::core::types::{ProvenanceEvent, TimestampedEvent};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_utc(secs)
}

/// Format seconds since the Unix epoch as an ISO 8601 UTC timestamp.
pub fn format_utc(epoch_secs: u64) -> String {
    let (y, m, d) = civil_from_days((epoch_secs / 86_400) as i64);
    let rem = epoch_secs % 86_400;
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y,
        m,
        d,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// Generate a build id for runs that were not given one.
pub fn generate_build_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("b-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Derive the event log path for a service.
pub fn event_log_path(state_dir: &Path, service: &str) -> PathBuf {
    state_dir.join(service).join("events.jsonl")
}

/// Append an event to the service's event log.
pub fn append_event(state_dir: &Path, service: &str, event: ProvenanceEvent) -> Result<(), String> {
    let path = event_log_path(state_dir, service);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("cannot create state dir: {}", e))?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te).map_err(|e| format!("JSON serialize error: {}", e))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("cannot open event log {}: {}", path.display(), e))?;

    writeln!(file, "{}", json).map_err(|e| format!("write error: {}", e))?;

    Ok(())
}

/// Read every event back, oldest first. A missing log reads as empty.
pub fn read_events(state_dir: &Path, service: &str) -> Result<Vec<TimestampedEvent>, String> {
    let path = event_log_path(state_dir, service);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| format!("invalid event line: {}", e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_iso8601() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), 20);
    }

    #[test]
    fn test_generate_build_id() {
        let id = generate_build_id();
        assert!(id.starts_with("b-"));
        assert_eq!(id.len(), 14);
    }

    #[test]
    fn test_event_log_path() {
        let p = event_log_path(Path::new("/state"), "hello");
        assert_eq!(p, PathBuf::from("/state/hello/events.jsonl"));
    }

    #[test]
    fn test_append_and_read_events() {
        let dir = tempfile::tempdir().unwrap();
        append_event(
            dir.path(),
            "hello",
            ProvenanceEvent::ProvisionStarted {
                service: "hello".to_string(),
                build_id: "b-abc".to_string(),
                dry_run: false,
                stratus_version: "0.3.0".to_string(),
            },
        )
        .unwrap();
        append_event(
            dir.path(),
            "hello",
            ProvenanceEvent::StepFailed {
                service: "hello".to_string(),
                step: "upload".to_string(),
                error: "denied".to_string(),
            },
        )
        .unwrap();

        let content = std::fs::read_to_string(dir.path().join("hello/events.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("provision_started"));

        let events = read_events(dir.path(), "hello").unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1].event, ProvenanceEvent::StepFailed { .. }));
    }

    #[test]
    fn test_read_events_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_events(dir.path(), "ghost").unwrap().is_empty());
    }

    #[test]
    fn test_format_utc() {
        assert_eq!(format_utc(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_utc(951_782_400), "2000-02-29T00:00:00Z");
        assert_eq!(format_utc(1_709_251_199), "2024-02-29T23:59:59Z");
        assert_eq!(format_utc(4_107_542_400), "2100-03-01T00:00:00Z");
    }
}
