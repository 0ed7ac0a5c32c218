// tests/download_engine_test.rs

mod common;

use mockito::{Matcher, Mock, ServerGuard};
use multisocks_dl::{
    downloader::DownloadManager,
    error::AppError,
    models::{FailureCause, IngestRequest, SegmentStatus, SubmitRequest, Task, TaskStatus},
    store::PersistenceStore,
};
use std::time::{Duration, Instant};
use tempfile::tempdir;

/// HEAD 返回 405，迫使探测改用 `Range: bytes=0-0` 的 GET。
async fn mock_probe(server: &mut ServerGuard, path: &str, total: usize, first: &[u8]) -> Vec<Mock> {
    let head = server
        .mock("HEAD", path)
        .with_status(405)
        .create_async()
        .await;
    let first_byte = server
        .mock("GET", path)
        .match_header("range", "bytes=0-0")
        .with_status(206)
        .with_header("content-range", &format!("bytes 0-0/{}", total))
        .with_body(&first[..1])
        .create_async()
        .await;
    vec![head, first_byte]
}

/// 只接受一次的区间请求，`end` 为闭区间上界。
async fn mock_range(server: &mut ServerGuard, path: &str, data: &[u8], start: usize, end: usize, hits: usize) -> Mock {
    server
        .mock("GET", path)
        .match_header("range", format!("bytes={}-{}", start, end).as_str())
        .with_status(206)
        .with_header("content-range", &format!("bytes {}-{}/{}", start, end, data.len()))
        .with_body(&data[start..=end])
        .expect(hits)
        .create_async()
        .await
}

fn direct_request(url: String, threads: usize) -> SubmitRequest {
    SubmitRequest {
        thread_count: Some(threads),
        use_proxies: false,
        ..SubmitRequest::new(url)
    }
}

async fn wait_for_progress(manager: &DownloadManager, id: &str) -> Task {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let task = manager.task(id).unwrap();
        if task.bytes_written() > 0 && task.status == TaskStatus::Downloading {
            return task;
        }
        assert!(Instant::now() < deadline, "任务迟迟没有进度: {:?}", task.status);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_splits_into_four_ranges() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let data = common::payload(1_000_000);
    let mut server = mockito::Server::new_async().await;
    let _probe = mock_probe(&mut server, "/file.bin", data.len(), &data).await;
    let mut ranges = Vec::new();
    for (start, end) in [(0, 249_999), (250_000, 499_999), (500_000, 749_999), (750_000, 999_999)] {
        ranges.push(mock_range(&mut server, "/file.bin", &data, start, end, 1).await);
    }
    let manager = DownloadManager::new(common::test_config(tmp.path())).unwrap();

    // --- 2. Act ---
    let id = manager
        .submit(direct_request(format!("{}/file.bin", server.url()), 4))
        .unwrap();
    let task = manager.wait(&id).await.unwrap();

    // --- 3. Assert ---
    assert_eq!(task.status, TaskStatus::Completed, "失败原因: {:?}", task.failure);
    assert_eq!(task.total_size, Some(1_000_000));
    assert_eq!(task.segments.len(), 4);
    assert!(task.segments.iter().all(|s| s.len() == Some(250_000)));
    for mock in &ranges {
        mock.assert_async().await;
    }
    assert_eq!(std::fs::read(task.filepath()).unwrap(), data);
    assert!(!task.partial_path().exists());

    // 完成的任务不保留记录
    let store = PersistenceStore::new(tmp.path().join("tasks")).unwrap();
    assert!(store.load(&id).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resume_after_restart_requests_only_missing_ranges() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let config = common::test_config(tmp.path());
    let data = common::payload(1_000_000);
    let mut server = mockito::Server::new_async().await;
    let url = format!("{}/file.bin", server.url());
    let _probe = mock_probe(&mut server, "/file.bin", data.len(), &data).await;
    let untouched = mock_range(&mut server, "/file.bin", &data, 0, 249_999, 0).await;
    let seg2 = mock_range(&mut server, "/file.bin", &data, 600_000, 749_999, 1).await;
    let seg3 = mock_range(&mut server, "/file.bin", &data, 750_000, 999_999, 1).await;

    // 模拟上次运行：前两个分片已完成，第三个写了 100000 字节后进程退出
    let mut task = Task::new(&url, config.save_dir.clone(), None, 4, false).unwrap();
    task.apply_plan(Some(1_000_000), true);
    for seg in &mut task.segments[..2] {
        seg.record_written(250_000);
        seg.status = SegmentStatus::Done;
    }
    task.segments[2].record_written(100_000);
    task.segments[2].status = SegmentStatus::Active;
    task.set_status(TaskStatus::Downloading);

    std::fs::create_dir_all(&config.save_dir).unwrap();
    let mut partial = vec![0u8; 1_000_000];
    partial[..600_000].copy_from_slice(&data[..600_000]);
    std::fs::write(task.partial_path(), &partial).unwrap();
    PersistenceStore::new(&config.state_dir).unwrap().save(&task).unwrap();

    // --- 2. Act ---
    let manager = DownloadManager::new(config).unwrap();
    assert_eq!(manager.init().unwrap(), 1);
    let restored = manager.task(&task.id).unwrap();

    // --- 3. Assert ---
    assert_eq!(restored.status, TaskStatus::Paused);
    assert_eq!(restored.bytes_written(), 600_000);
    assert_eq!(restored.segments[2].range_header(), "bytes=600000-749999");
    assert_eq!(restored.segments[3].range_header(), "bytes=750000-999999");

    manager.resume(&task.id).unwrap();
    let finished = manager.wait(&task.id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Completed, "失败原因: {:?}", finished.failure);
    seg2.assert_async().await;
    seg3.assert_async().await;
    untouched.assert_async().await;
    assert_eq!(std::fs::read(finished.filepath()).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_without_range_support_uses_single_stream() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let data = common::payload(100_000);
    let mut server = mockito::Server::new_async().await;
    let _head = server.mock("HEAD", "/plain.bin").with_status(405).create_async().await;
    let _full = server
        .mock("GET", "/plain.bin")
        .with_status(200)
        .with_body(&data)
        .create_async()
        .await;
    let manager = DownloadManager::new(common::test_config(tmp.path())).unwrap();

    // --- 2. Act ---
    let id = manager
        .submit(direct_request(format!("{}/plain.bin", server.url()), 8))
        .unwrap();
    let task = manager.wait(&id).await.unwrap();

    // --- 3. Assert ---
    assert_eq!(task.status, TaskStatus::Completed, "失败原因: {:?}", task.failure);
    assert!(!task.ranges_supported);
    assert_eq!(task.segments.len(), 1);
    assert_eq!(std::fs::read(task.filepath()).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_range_ignored_during_download_collapses_to_one_segment() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let data = common::payload(100_000);
    let mut server = mockito::Server::new_async().await;
    let _probe = mock_probe(&mut server, "/liar.bin", data.len(), &data).await;
    // 探测时声称支持 Range，实际下载时总是返回完整内容
    let _ignored = server
        .mock("GET", "/liar.bin")
        .match_header("range", Matcher::Regex(r"^bytes=\d+-\d{2,}$".to_string()))
        .with_status(200)
        .with_body(&data)
        .create_async()
        .await;
    let manager = DownloadManager::new(common::test_config(tmp.path())).unwrap();

    // --- 2. Act ---
    let id = manager
        .submit(direct_request(format!("{}/liar.bin", server.url()), 4))
        .unwrap();
    let task = manager.wait(&id).await.unwrap();

    // --- 3. Assert ---
    assert_eq!(task.status, TaskStatus::Completed, "失败原因: {:?}", task.failure);
    assert!(!task.ranges_supported);
    assert_eq!(task.segments.len(), 1);
    assert_eq!(std::fs::read(task.filepath()).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pause_persists_synced_progress_and_resume_completes() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let data = common::payload(400_000);
    let server = common::spawn_range_server(data.clone(), 4096, Duration::from_millis(20)).await;
    let manager = DownloadManager::new(common::test_config(tmp.path())).unwrap();
    let id = manager.submit(direct_request(server.url("/slow.bin"), 4)).unwrap();
    wait_for_progress(&manager, &id).await;

    // --- 2. Act ---
    let paused = manager.pause(&id).await.unwrap();

    // --- 3. Assert ---
    assert_eq!(paused.status, TaskStatus::Paused);
    let written = paused.bytes_written();
    assert!(written > 0 && written < 400_000, "已写入 {} 字节", written);
    assert!(paused.segments.iter().all(|s| s.is_done() || s.status == SegmentStatus::Paused));

    let store = PersistenceStore::new(tmp.path().join("tasks")).unwrap();
    let record = store.load(&id).unwrap().expect("暂停的任务应有记录");
    assert_eq!(record.status, TaskStatus::Paused);
    assert_eq!(record.bytes_written(), written);

    // 记录中的进度不超过已落盘的数据
    let partial = std::fs::read(paused.partial_path()).unwrap();
    assert_eq!(partial.len(), 400_000);
    for seg in &record.segments {
        let range = seg.start as usize..seg.offset() as usize;
        assert_eq!(&partial[range.clone()], &data[range]);
    }

    manager.resume(&id).unwrap();
    let finished = manager.wait(&id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Completed, "失败原因: {:?}", finished.failure);
    assert_eq!(std::fs::read(finished.filepath()).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_running_task_removes_partial_file() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let data = common::payload(400_000);
    let server = common::spawn_range_server(data, 4096, Duration::from_millis(20)).await;
    let manager = DownloadManager::new(common::test_config(tmp.path())).unwrap();
    let id = manager.submit(direct_request(server.url("/slow.bin"), 2)).unwrap();
    let running = wait_for_progress(&manager, &id).await;

    // --- 2. Act ---
    let cancelled = manager.cancel(&id).await.unwrap();

    // --- 3. Assert ---
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(!running.partial_path().exists());
    assert!(!running.filepath().exists());
    let store = PersistenceStore::new(tmp.path().join("tasks")).unwrap();
    assert!(store.load(&id).unwrap().is_none());

    // 已取消的任务不能继续
    assert!(matches!(manager.resume(&id), Err(AppError::InvalidState { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_paused_task() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let server = common::spawn_range_server(common::payload(400_000), 4096, Duration::from_millis(20)).await;
    let manager = DownloadManager::new(common::test_config(tmp.path())).unwrap();
    let id = manager.submit(direct_request(server.url("/slow.bin"), 4)).unwrap();
    wait_for_progress(&manager, &id).await;
    let paused = manager.pause(&id).await.unwrap();
    assert!(paused.partial_path().exists());

    // --- 2. Act ---
    let cancelled = manager.cancel(&id).await.unwrap();

    // --- 3. Assert ---
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(!paused.partial_path().exists());
    let store = PersistenceStore::new(tmp.path().join("tasks")).unwrap();
    assert!(store.load(&id).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remote_size_change_fails_resume() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let config = common::test_config(tmp.path());
    let data = common::payload(900_000);
    let mut server = mockito::Server::new_async().await;
    let url = format!("{}/file.bin", server.url());
    let _probe = mock_probe(&mut server, "/file.bin", data.len(), &data).await;

    let mut task = Task::new(&url, config.save_dir.clone(), None, 4, false).unwrap();
    task.apply_plan(Some(1_000_000), true);
    task.segments[0].record_written(1_000);
    task.set_status(TaskStatus::Paused);
    std::fs::create_dir_all(&config.save_dir).unwrap();
    std::fs::write(task.partial_path(), vec![0u8; 1_000_000]).unwrap();
    PersistenceStore::new(&config.state_dir).unwrap().save(&task).unwrap();

    let manager = DownloadManager::new(config.clone()).unwrap();
    manager.init().unwrap();

    // --- 2. Act ---
    manager.resume(&task.id).unwrap();
    let failed = manager.wait(&task.id).await.unwrap();

    // --- 3. Assert ---
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.failure.map(|f| f.cause), Some(FailureCause::SizeMismatch));
    let record = PersistenceStore::new(&config.state_dir)
        .unwrap()
        .load(&task.id)
        .unwrap()
        .expect("失败的任务应保留记录");
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.bytes_written(), 1_000);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remove_completed_task_and_reject_unknown_ids() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let data = common::payload(50_000);
    let server = common::spawn_range_server(data.clone(), 64 * 1024, Duration::ZERO).await;
    let manager = DownloadManager::new(common::test_config(tmp.path())).unwrap();
    let id = manager.submit(direct_request(server.url("/small.bin"), 2)).unwrap();
    let done = manager.wait(&id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed, "失败原因: {:?}", done.failure);

    // --- 2. Act & 3. Assert ---
    assert!(matches!(manager.resume(&id), Err(AppError::InvalidState { .. })));
    let removed = manager.remove(&id).await.unwrap();
    assert_eq!(removed.id, id);
    assert!(manager.list_tasks().is_empty());
    // 已完成的文件不会被删除
    assert_eq!(std::fs::read(done.filepath()).unwrap(), data);

    assert!(matches!(manager.task("missing"), Err(AppError::TaskNotFound(_))));
    assert!(matches!(manager.pause("missing").await, Err(AppError::TaskNotFound(_))));
    assert!(matches!(manager.cancel("missing").await, Err(AppError::TaskNotFound(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ingest_uses_suggested_filename() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let data = common::payload(30_000);
    let server = common::spawn_range_server(data.clone(), 64 * 1024, Duration::ZERO).await;
    let manager = DownloadManager::new(common::test_config(tmp.path())).unwrap();

    // --- 2. Act ---
    let rejected = manager.ingest(IngestRequest {
        url: "ftp://example.com/file".to_string(),
        suggested_filename: None,
    });
    let ack = manager.ingest(IngestRequest {
        url: server.url("/download?id=7"),
        suggested_filename: Some("report.pdf".to_string()),
    });

    // --- 3. Assert ---
    assert_eq!(rejected.status, "error");
    assert!(rejected.task_id.is_none());

    assert_eq!(ack.status, "success");
    assert_eq!(ack.filename.as_deref(), Some("report.pdf"));
    let task = manager.wait(ack.task_id.as_deref().unwrap()).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed, "失败原因: {:?}", task.failure);
    assert!(task.filepath().ends_with("report.pdf"));
    assert_eq!(std::fs::read(task.filepath()).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_progress_events_are_monotonic() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let data = common::payload(200_000);
    let server = common::spawn_range_server(data, 8192, Duration::from_millis(5)).await;
    let manager = DownloadManager::new(common::test_config(tmp.path())).unwrap();
    let mut events = manager.subscribe();

    // --- 2. Act ---
    let id = manager.submit(direct_request(server.url("/events.bin"), 4)).unwrap();
    let task = manager.wait(&id).await.unwrap();

    // --- 3. Assert ---
    assert_eq!(task.status, TaskStatus::Completed, "失败原因: {:?}", task.failure);
    let mut last = 0;
    let mut seen_completed = false;
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.task_id, id);
        assert!(event.bytes_written >= last, "进度回退: {} -> {}", last, event.bytes_written);
        assert!(event.throughput >= 0.0);
        last = event.bytes_written;
        seen_completed |= event.status == TaskStatus::Completed;
    }
    assert!(seen_completed);
    assert_eq!(last, 200_000);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resume_after_partial_file_deleted_refetches_lost_bytes() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let data = common::payload(400_000);
    let server = common::spawn_range_server(data.clone(), 4096, Duration::from_millis(20)).await;
    let manager = DownloadManager::new(common::test_config(tmp.path())).unwrap();
    let id = manager.submit(direct_request(server.url("/lost.bin"), 4)).unwrap();
    wait_for_progress(&manager, &id).await;
    let paused = manager.pause(&id).await.unwrap();
    assert!(paused.bytes_written() > 0);

    // --- 2. Act ---
    std::fs::remove_file(paused.partial_path()).unwrap();
    manager.resume(&id).unwrap();
    let finished = manager.wait(&id).await.unwrap();

    // --- 3. Assert ---
    assert_eq!(finished.status, TaskStatus::Completed, "失败原因: {:?}", finished.failure);
    assert_eq!(std::fs::read(finished.filepath()).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resume_after_partial_file_truncated_clamps_progress() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let data = common::payload(400_000);
    let server = common::spawn_range_server(data.clone(), 4096, Duration::from_millis(20)).await;
    let manager = DownloadManager::new(common::test_config(tmp.path())).unwrap();
    let id = manager.submit(direct_request(server.url("/torn.bin"), 4)).unwrap();
    wait_for_progress(&manager, &id).await;
    let paused = manager.pause(&id).await.unwrap();

    // --- 2. Act ---
    // 只保留第一个分片的前 2048 字节，其余分片的已写内容全部丢失
    std::fs::OpenOptions::new()
        .write(true)
        .open(paused.partial_path())
        .unwrap()
        .set_len(2_048)
        .unwrap();
    manager.resume(&id).unwrap();
    let finished = manager.wait(&id).await.unwrap();

    // --- 3. Assert ---
    assert_eq!(finished.status, TaskStatus::Completed, "失败原因: {:?}", finished.failure);
    assert_eq!(std::fs::read(finished.filepath()).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unwritable_state_dir_fails_task_instead_of_hanging() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let config = common::test_config(tmp.path());
    let state_dir = config.state_dir.clone();
    let server = common::spawn_range_server(common::payload(400_000), 4096, Duration::from_millis(20)).await;
    let manager = DownloadManager::new(config).unwrap();
    let id = manager.submit(direct_request(server.url("/stuck.bin"), 4)).unwrap();
    wait_for_progress(&manager, &id).await;

    // --- 2. Act ---
    // 状态目录被替换为普通文件，之后的每次保存都会失败
    while state_dir.exists() {
        let _ = std::fs::remove_dir_all(&state_dir);
    }
    std::fs::write(&state_dir, b"not a directory").unwrap();
    let finished = tokio::time::timeout(Duration::from_secs(15), manager.wait(&id))
        .await
        .expect("保存失败后等待不应一直阻塞")
        .unwrap();

    // --- 3. Assert ---
    assert_eq!(finished.status, TaskStatus::Failed);
    assert_eq!(
        finished.failure.map(|f| f.cause),
        Some(FailureCause::DestinationUnwritable)
    );
    assert_eq!(manager.task(&id).unwrap().status, TaskStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_segment_failures_exhaust_reassignments_and_fail_task() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let config = common::test_config(tmp.path());
    let data = common::payload(1_000);
    let mut server = mockito::Server::new_async().await;
    let _probe = mock_probe(&mut server, "/broken.bin", data.len(), &data).await;
    let broken = server
        .mock("GET", "/broken.bin")
        .match_header("range", Matcher::Regex(r"^bytes=\d+-\d{2,}$".to_string()))
        .with_status(500)
        .expect_at_least(2)
        .create_async()
        .await;
    let manager = DownloadManager::new(config.clone()).unwrap();

    // --- 2. Act ---
    let id = manager
        .submit(direct_request(format!("{}/broken.bin", server.url()), 2))
        .unwrap();
    let task = manager.wait(&id).await.unwrap();

    // --- 3. Assert ---
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failure.map(|f| f.cause), Some(FailureCause::ServerError));
    broken.assert_async().await;
    let record = PersistenceStore::new(&config.state_dir)
        .unwrap()
        .load(&id)
        .unwrap()
        .expect("失败的任务应保留记录");
    assert_eq!(record.status, TaskStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retry_failed_task_fetches_only_remaining_segments() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let data = common::payload(1_000);
    let mut server = mockito::Server::new_async().await;
    let url = format!("{}/retry.bin", server.url());
    let _probe = mock_probe(&mut server, "/retry.bin", data.len(), &data).await;
    let first_half = mock_range(&mut server, "/retry.bin", &data, 0, 499, 1).await;
    let outage = server
        .mock("GET", "/retry.bin")
        .match_header("range", "bytes=500-999")
        .with_status(503)
        .create_async()
        .await;
    let manager = DownloadManager::new(common::test_config(tmp.path())).unwrap();
    let id = manager.submit(direct_request(url, 2)).unwrap();
    let failed = manager.wait(&id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.segments[0].is_done());

    // --- 2. Act ---
    outage.remove_async().await;
    let second_half = mock_range(&mut server, "/retry.bin", &data, 500, 999, 1).await;
    manager.resume(&id).unwrap();
    let finished = manager.wait(&id).await.unwrap();

    // --- 3. Assert ---
    assert_eq!(finished.status, TaskStatus::Completed, "失败原因: {:?}", finished.failure);
    assert!(finished.failure.is_none());
    // 已完成的前半段不会被重新请求
    first_half.assert_async().await;
    second_half.assert_async().await;
    assert_eq!(std::fs::read(finished.filepath()).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_global_worker_limit_applies_across_tasks() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let data = common::payload(60_000);
    let server = common::spawn_range_server(data.clone(), 4096, Duration::from_millis(2)).await;
    let mut config = common::test_config(tmp.path());
    config.max_active_workers = 1;
    let manager = DownloadManager::new(config).unwrap();

    // --- 2. Act ---
    let first = manager.submit(direct_request(server.url("/a.bin"), 3)).unwrap();
    let second = manager.submit(direct_request(server.url("/b.bin"), 3)).unwrap();
    let a = manager.wait(&first).await.unwrap();
    let b = manager.wait(&second).await.unwrap();

    // --- 3. Assert ---
    for task in [&a, &b] {
        assert_eq!(task.status, TaskStatus::Completed, "失败原因: {:?}", task.failure);
        assert_eq!(task.segments.len(), 3);
        assert_eq!(std::fs::read(task.filepath()).unwrap(), data);
    }
    assert_eq!(server.peak_in_flight(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_existing_file_is_kept_only_when_size_matches() {
    // --- 1. Arrange ---
    let tmp = tempdir().unwrap();
    let config = common::test_config(tmp.path());
    let data = common::payload(30_000);
    let server = common::spawn_range_server(data.clone(), 64 * 1024, Duration::ZERO).await;
    std::fs::create_dir_all(&config.save_dir).unwrap();
    let kept = vec![7u8; 30_000];
    std::fs::write(config.save_dir.join("same.bin"), &kept).unwrap();
    std::fs::write(config.save_dir.join("stale.bin"), b"old").unwrap();
    let manager = DownloadManager::new(config).unwrap();

    // --- 2. Act ---
    let submit = |name: &str| SubmitRequest {
        filename: Some(name.to_string()),
        ..direct_request(server.url("/data.bin"), 2)
    };
    let same = manager.submit(submit("same.bin")).unwrap();
    let stale = manager.submit(submit("stale.bin")).unwrap();
    let same = manager.wait(&same).await.unwrap();
    let stale = manager.wait(&stale).await.unwrap();

    // --- 3. Assert ---
    assert_eq!(same.status, TaskStatus::Completed);
    assert_eq!(std::fs::read(same.filepath()).unwrap(), kept);
    assert_eq!(stale.status, TaskStatus::Completed, "失败原因: {:?}", stale.failure);
    assert_eq!(std::fs::read(stale.filepath()).unwrap(), data);
}
