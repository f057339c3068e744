use bosun::output_store::{OutputListFilter, OutputStore, OutputType};

fn store(max_files: usize) -> (OutputStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = OutputStore::new(dir.path().to_path_buf(), max_files).expect("store init");
    (store, dir)
}

#[tokio::test]
async fn create_then_read_round_trips() {
    let (store, _dir) = store(10);
    let id = store
        .create(b"hello capture\n", OutputType::Combined, Some("exec_1"), None)
        .await
        .unwrap();

    let read = store.read(&id, 0, 8192, "utf-8").await.unwrap();
    assert_eq!(read.content, "hello capture\n");
    assert_eq!(read.total_size, 14);
    assert!(!read.is_truncated);
    assert_eq!(read.encoding, "utf-8");

    let info = store.get(&id).unwrap();
    assert_eq!(info.execution_id.as_deref(), Some("exec_1"));
    assert_eq!(info.size_bytes, 14);
    assert!(info.path.exists());
}

#[tokio::test]
async fn windowed_reads_report_truncation() {
    let (store, _dir) = store(10);
    let id = store
        .create(b"0123456789", OutputType::Stdout, None, None)
        .await
        .unwrap();

    let head = store.read(&id, 0, 4, "utf-8").await.unwrap();
    assert_eq!(head.content, "0123");
    assert!(head.is_truncated);

    let tail = store.read(&id, 6, 100, "utf-8").await.unwrap();
    assert_eq!(tail.content, "6789");
    assert!(!tail.is_truncated);

    let past_end = store.read(&id, 50, 10, "utf-8").await.unwrap();
    assert_eq!(past_end.content, "");
}

#[tokio::test]
async fn hex_encoding_and_unknown_encoding() {
    let (store, _dir) = store(10);
    let id = store
        .create(&[0xde, 0xad], OutputType::Stdout, None, None)
        .await
        .unwrap();
    let read = store.read(&id, 0, 10, "hex").await.unwrap();
    assert_eq!(read.content, "dead");

    let err = store.read(&id, 0, 10, "latin-1").await.unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");
}

#[tokio::test]
async fn list_is_newest_first_and_filterable() {
    let (store, _dir) = store(10);
    let a = store
        .create(b"a", OutputType::Combined, Some("exec_a"), None)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let b = store
        .create(b"b", OutputType::Log, Some("exec_b"), Some("session log"))
        .await
        .unwrap();

    let (files, total) = store.list(&OutputListFilter::default());
    assert_eq!(total, 2);
    assert_eq!(files[0].output_id, b);
    assert_eq!(files[1].output_id, a);

    let (logs, _) = store.list(&OutputListFilter {
        output_type: Some(OutputType::Log),
        ..Default::default()
    });
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].output_id, b);

    let (for_exec, _) = store.list(&OutputListFilter {
        execution_id: Some("exec_a".to_string()),
        ..Default::default()
    });
    assert_eq!(for_exec.len(), 1);
    assert_eq!(for_exec[0].output_id, a);

    let (named, _) = store.list(&OutputListFilter {
        name_pattern: Some("session".to_string()),
        ..Default::default()
    });
    assert_eq!(named.len(), 1);
}

#[tokio::test]
async fn delete_requires_confirm() {
    let (store, _dir) = store(10);
    let id = store
        .create(b"x", OutputType::Stdout, None, None)
        .await
        .unwrap();

    let err = store
        .delete(std::slice::from_ref(&id), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");
    // Nothing was removed.
    assert!(store.get(&id).is_ok());

    let outcome = store.delete(&[id.clone()], true).await.unwrap();
    assert_eq!(outcome.deleted, vec![id.clone()]);
    assert!(outcome.failed.is_empty());
    assert!(store.get(&id).is_err());
}

#[tokio::test]
async fn delete_reports_missing_ids() {
    let (store, _dir) = store(10);
    let outcome = store
        .delete(&["out_missing".to_string()], true)
        .await
        .unwrap();
    assert!(outcome.deleted.is_empty());
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].reason, "not found");
}

#[tokio::test]
async fn eviction_drops_oldest_first() {
    let (store, _dir) = store(3);
    let mut ids = Vec::new();
    for i in 0..5 {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let id = store
            .create(format!("capture {i}").as_bytes(), OutputType::Stdout, None, None)
            .await
            .unwrap();
        ids.push(id);
    }

    assert_eq!(store.len(), 3);
    // The two oldest are gone; the three newest survive.
    assert!(store.get(&ids[0]).is_err());
    assert!(store.get(&ids[1]).is_err());
    for id in &ids[2..] {
        assert!(store.get(id).is_ok());
    }
}

#[tokio::test]
async fn register_adopts_an_existing_file() {
    let (store, dir) = store(10);
    let path = dir.path().join("log").join("session.log");
    tokio::fs::write(&path, b"saved history\n").await.unwrap();

    let id = store
        .register(path.clone(), OutputType::Log, None, Some("session history"))
        .await
        .unwrap();

    let info = store.get(&id).unwrap();
    assert_eq!(info.size_bytes, 14);
    assert_eq!(info.path, path);

    let read = store.read(&id, 0, 100, "utf-8").await.unwrap();
    assert_eq!(read.content, "saved history\n");

    // Registering a missing path fails up front.
    assert!(
        store
            .register(dir.path().join("log/absent.log"), OutputType::Log, None, None)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn missing_id_reads_fail_with_not_found() {
    let (store, _dir) = store(10);
    let err = store.read("out_nope", 0, 10, "utf-8").await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}
