//! Expiry sweep tests
//!
//! All tests run on a paused clock so expiry deadlines can be crossed
//! without waiting.

mod common;

use common::{collect, manager, next_progress, payload, test_config, BackendLog, Call};
use chunk_uploadr::upload::{UploadError, UploadStatus};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[tokio::test(start_paused = true)]
async fn test_concurrent_sweeps_clean_up_once() {
    let log = BackendLog::new();
    let manager = manager(test_config(100), &log);
    let (mut writer, reader) = tokio::io::duplex(1024);
    writer.write_all(&payload(100)).await.unwrap();

    let notifier = manager.start("old.bin", Some(300), reader).await;
    let (_, terminal) = collect(&notifier).await;
    assert!(matches!(
        terminal,
        UploadStatus::Error {
            cause: UploadError::Timeout(_)
        }
    ));

    // Not yet expired
    assert_eq!(manager.sweep_expired().await, 0);
    assert!(manager.upload_exists("old.bin"));

    tokio::time::advance(Duration::from_secs(601)).await;
    let (a, b) = tokio::join!(manager.sweep_expired(), manager.sweep_expired());

    assert_eq!(a + b, 1);
    assert_eq!(log.count(&Call::Cleanup), 1);
    assert!(!manager.upload_exists("old.bin"));
    assert_eq!(manager.incomplete_count(), 0);

    assert_eq!(manager.sweep_expired().await, 0);
    assert_eq!(log.count(&Call::Cleanup), 1);

    let result = manager.resume("old.bin", std::io::Cursor::new(payload(200))).await;
    assert!(matches!(result, Err(UploadError::NotFound)));
    drop(writer);
}

#[tokio::test(start_paused = true)]
async fn test_resume_refreshes_expiry() {
    let log = BackendLog::new();
    let manager = manager(test_config(100), &log);
    let data = payload(300);
    let (mut writer, reader) = tokio::io::duplex(1024);
    writer.write_all(&data[..100]).await.unwrap();

    let notifier = manager.start("kept.bin", Some(300), reader).await;
    collect(&notifier).await;
    drop(writer);

    tokio::time::advance(Duration::from_secs(500)).await;
    let (mut writer, reader) = tokio::io::duplex(1024);
    writer.write_all(&data[100..200]).await.unwrap();
    let resumed = manager.resume_from("kept.bin", 100, reader).await.unwrap();
    collect(&resumed).await;

    // 500s + idle timeout since the first round; the second round pushed
    // the deadline out again.
    tokio::time::advance(Duration::from_secs(200)).await;
    assert_eq!(manager.sweep_expired().await, 0);
    assert!(manager.upload_exists("kept.bin"));
    assert_eq!(log.count(&Call::Cleanup), 0);
    drop(writer);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_cancels_processing_upload() {
    let log = BackendLog::new();
    let mut config = test_config(100);
    config.idle_timeout_secs = 10_000;
    config.incomplete_upload_expiry_secs = 100;
    let manager = manager(config, &log);
    let (mut writer, reader) = tokio::io::duplex(1024);
    writer.write_all(&payload(100)).await.unwrap();

    let notifier = manager.start("slow.bin", Some(300), reader).await;
    assert_eq!(next_progress(&notifier).await, 100);

    tokio::time::advance(Duration::from_secs(200)).await;
    assert_eq!(manager.sweep_expired().await, 1);

    let (_, terminal) = collect(&notifier).await;
    assert!(matches!(
        terminal,
        UploadStatus::Error {
            cause: UploadError::Cancelled
        }
    ));
    assert_eq!(log.count(&Call::Cleanup), 1);
    assert!(!manager.upload_exists("slow.bin"));
    drop(writer);
}

#[tokio::test(start_paused = true)]
async fn test_dispatcher_sweeps_on_interval() {
    let log = BackendLog::new();
    let mut config = test_config(100);
    config.incomplete_upload_expiry_secs = 120;
    config.sweep_interval_secs = 60;
    let manager = manager(config, &log);
    let (mut writer, reader) = tokio::io::duplex(1024);
    writer.write_all(&payload(100)).await.unwrap();

    let notifier = manager.start("abandoned.bin", None, reader).await;
    collect(&notifier).await;
    assert!(manager.upload_exists("abandoned.bin"));

    tokio::time::sleep(Duration::from_secs(300)).await;

    assert!(!manager.upload_exists("abandoned.bin"));
    assert_eq!(log.count(&Call::Cleanup), 1);
    drop(writer);
}
