//! Backend contract tests with a mocked `ChunkBackend`
//!
//! Pins the exact sequence of backend calls the coordinator makes.

use async_trait::async_trait;
use bytes::Bytes;
use chunk_uploadr::backend::{BackendError, ChunkBackend, UploadDescriptor};
use chunk_uploadr::config::UploadConfig;
use chunk_uploadr::upload::{UploadError, UploadManager, UploadStatus};
use mockall::{mock, predicate::eq, Sequence};
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

mock! {
    pub Backend {}

    #[async_trait]
    impl ChunkBackend for Backend {
        fn is_initialized(&self) -> bool;
        async fn initialize(&mut self, upload: &UploadDescriptor) -> Result<(), BackendError>;
        async fn upload_part(&mut self, part_number: u32, part: Bytes) -> Result<(), BackendError>;
        async fn complete(&mut self) -> Result<(), BackendError>;
        async fn cleanup(&mut self);
    }
}

fn manager_with(backend: MockBackend, chunk_size: usize) -> Arc<UploadManager> {
    let slot = Mutex::new(Some(backend));
    let config = UploadConfig {
        chunk_size_limit: chunk_size,
        idle_timeout_secs: 5,
        ..Default::default()
    };
    let manager = Arc::new(UploadManager::new(
        config,
        Arc::new(move || {
            let backend = slot.lock().take().expect("one upload per test");
            Box::new(backend) as Box<dyn ChunkBackend>
        }),
    ));
    tokio::spawn(manager.clone().run_dispatcher());
    manager
}

async fn terminal(notifier: &chunk_uploadr::UploadNotifier) -> UploadStatus {
    notifier
        .wait_terminal()
        .await
        .expect("terminal event before the channel closes")
}

#[tokio::test]
async fn test_call_sequence_for_complete_upload() {
    let mut backend = MockBackend::new();
    let mut seq = Sequence::new();

    backend
        .expect_is_initialized()
        .times(1)
        .in_sequence(&mut seq)
        .return_const(false);
    backend
        .expect_initialize()
        .withf(|upload| {
            upload.identifier == "video.mp4"
                && upload.total_size == Some(250)
                && upload.expected_parts == Some(3)
                && upload.chunk_size == 100
        })
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(()));
    for (number, len) in [(1u32, 100usize), (2, 100), (3, 50)] {
        backend
            .expect_upload_part()
            .withf(move |n, part| *n == number && part.len() == len)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
    }
    backend
        .expect_complete()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|| Ok(()));
    backend.expect_cleanup().never();

    let manager = manager_with(backend, 100);
    let notifier = manager
        .start("video.mp4", Some(250), Cursor::new(vec![7u8; 250]))
        .await;

    assert!(matches!(terminal(&notifier).await, UploadStatus::Ok { .. }));
}

#[tokio::test]
async fn test_resume_does_not_reinitialize() {
    let mut backend = MockBackend::new();
    let mut seq = Sequence::new();
    let initialized = Arc::new(AtomicBool::new(false));

    let flag = initialized.clone();
    backend
        .expect_is_initialized()
        .returning(move || flag.load(Ordering::SeqCst));
    backend
        .expect_initialize()
        .times(1)
        .in_sequence(&mut seq)
        .returning(move |_| {
            initialized.store(true, Ordering::SeqCst);
            Ok(())
        });
    backend
        .expect_upload_part()
        .with(eq(1u32), mockall::predicate::always())
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(()));
    backend
        .expect_upload_part()
        .with(eq(2u32), mockall::predicate::always())
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Err(BackendError::Rejected("throttled".into())));
    backend
        .expect_upload_part()
        .with(eq(2u32), mockall::predicate::always())
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(()));
    backend
        .expect_complete()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|| Ok(()));
    backend.expect_cleanup().never();

    let manager = manager_with(backend, 10);
    let data = vec![1u8; 20];

    let notifier = manager
        .start("retry.bin", Some(20), Cursor::new(data.clone()))
        .await;
    match terminal(&notifier).await {
        UploadStatus::Error {
            cause: UploadError::Part { part_number, .. },
        } => assert_eq!(part_number, 2),
        other => panic!("expected part error, got {:?}", other),
    }

    let resumed = manager
        .resume_from("retry.bin", 10, Cursor::new(data[10..].to_vec()))
        .await
        .unwrap();
    assert!(matches!(terminal(&resumed).await, UploadStatus::Ok { .. }));
}

#[tokio::test]
async fn test_init_failure_skips_parts_and_cleanup() {
    let mut backend = MockBackend::new();
    backend.expect_is_initialized().return_const(false);
    backend
        .expect_initialize()
        .times(1)
        .returning(|_| Err(BackendError::Rejected("access denied".into())));
    backend.expect_upload_part().never();
    backend.expect_complete().never();
    backend.expect_cleanup().never();

    let manager = manager_with(backend, 10);
    let notifier = manager
        .start("denied.bin", Some(20), Cursor::new(vec![0u8; 20]))
        .await;

    match terminal(&notifier).await {
        UploadStatus::Error { cause } => assert!(matches!(cause, UploadError::Init(_))),
        other => panic!("expected init error, got {:?}", other),
    }
    assert!(!manager.upload_exists("denied.bin"));
}
