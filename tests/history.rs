use chrono::{Duration as ChronoDuration, Utc};

use bosun::history::{HistoryEntry, HistoryLog};

fn entry(id: &str, command: &str) -> HistoryEntry {
    HistoryEntry {
        execution_id: id.to_string(),
        command: command.to_string(),
        working_directory: "/work".to_string(),
        timestamp: Utc::now(),
        executed: true,
        classification: None,
        decision: Some("allow".to_string()),
        output_summary: None,
    }
}

#[test]
fn search_returns_newest_first() {
    let log = HistoryLog::new(100, None);
    log.append(entry("e1", "echo one"));
    log.append(entry("e2", "echo two"));
    log.append(entry("e3", "ls -la"));

    let all = log.search(10, None, None);
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].execution_id, "e3");
    assert_eq!(all[2].execution_id, "e1");

    let limited = log.search(2, None, None);
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].execution_id, "e3");
}

#[test]
fn keyword_search_matches_command_and_summary() {
    let log = HistoryLog::new(100, None);
    log.append(entry("e1", "cargo build"));
    let mut with_summary = entry("e2", "ls");
    with_summary.output_summary = Some("Cargo.toml  src  target".to_string());
    log.append(with_summary);

    let hits = log.search(10, Some(&["cargo".to_string()]), None);
    assert_eq!(hits.len(), 2);

    let build_hits = log.search(10, Some(&["build".to_string()]), None);
    assert_eq!(build_hits.len(), 1);
    assert_eq!(build_hits[0].execution_id, "e1");
}

#[test]
fn since_filter_excludes_older_entries() {
    let log = HistoryLog::new(100, None);
    let mut old = entry("e1", "echo old");
    old.timestamp = Utc::now() - ChronoDuration::hours(2);
    log.append(old);
    log.append(entry("e2", "echo new"));

    let recent = log.search(10, None, Some(Utc::now() - ChronoDuration::hours(1)));
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].execution_id, "e2");
}

#[test]
fn capacity_evicts_oldest() {
    let log = HistoryLog::new(3, None);
    for i in 0..5 {
        log.append(entry(&format!("e{i}"), &format!("cmd {i}")));
    }
    assert_eq!(log.len(), 3);
    let all = log.search(10, None, None);
    assert_eq!(all[0].execution_id, "e4");
    assert_eq!(all[2].execution_id, "e2");
}

#[test]
fn find_similar_ranks_by_token_overlap() {
    let log = HistoryLog::new(100, None);
    log.append(entry("e1", "git commit -m fix"));
    log.append(entry("e2", "git push origin main"));
    log.append(entry("e3", "cargo test"));

    let similar = log.find_similar("git push origin feature", 10);
    assert_eq!(similar.len(), 2);
    assert_eq!(similar[0].execution_id, "e2"); // 3 shared tokens
    assert_eq!(similar[1].execution_id, "e1"); // 1 shared token

    assert!(log.find_similar("docker ps", 10).is_empty());
    assert!(log.find_similar("", 10).is_empty());
}
