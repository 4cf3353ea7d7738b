//! Behaviour every backend must show, exercised against live instances.

use futures::{StreamExt, TryStreamExt};

use super::Backend;
use crate::error::BackendError;
use crate::part::Part;

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

async fn upload(backend: &dyn Backend, part: &Part, data: &[u8]) -> Result<(), BackendError> {
    let mut reader = data;
    backend.upload_part(part, &mut reader).await
}

async fn download(backend: &dyn Backend, part: &Part) -> Result<Vec<u8>, BackendError> {
    let mut out = Vec::new();
    backend.download_part(part, &mut out).await?;
    Ok(out)
}

async fn listed(backend: &dyn Backend, prefix: &str) -> Vec<Part> {
    backend.list_parts(prefix).try_collect().await.unwrap()
}

pub async fn run_all(backend: &dyn Backend) {
    upload_is_idempotent(backend).await;
    size_mismatch_is_rejected(backend).await;
    delete_is_idempotent(backend).await;
    round_trips(backend).await;
    missing_part_is_not_found(backend).await;
    control_files(backend).await;
    listing_reports_uploads(backend).await;
    stored_length_must_match(backend).await;
}

async fn upload_is_idempotent(backend: &dyn Backend) {
    let data = content(4096);
    let part = Part::from_data("idem/part", &data);
    upload(backend, &part, &data).await.unwrap();
    upload(backend, &part, &data).await.unwrap();
    let parts = listed(backend, "idem/").await;
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].path, "idem/part");
    assert_eq!(parts[0].size, 4096);
}

async fn size_mismatch_is_rejected(backend: &dyn Backend) {
    let data = content(100);
    let part = Part::from_data("mismatch/part", &data);
    upload(backend, &part, &data).await.unwrap();

    let other = content(101);
    let conflicting = Part::from_data("mismatch/part", &other);
    let err = upload(backend, &conflicting, &other).await.unwrap_err();
    assert!(
        matches!(err, BackendError::ContentMismatch { expected: 101, actual: 100, .. }),
        "{err}"
    );
    assert!(!err.is_retryable());
    assert_eq!(download(backend, &part).await.unwrap(), data);
}

async fn stored_length_must_match(backend: &dyn Backend) {
    let data = content(10);
    upload(backend, &Part::from_data("length/part", &data), &data)
        .await
        .unwrap();

    let longer = Part::new("length/part", 20, "");
    let err = download(backend, &longer).await.unwrap_err();
    assert!(matches!(err, BackendError::TransferFailed { .. }), "{err}");
    assert!(err.is_retryable());
    assert!(!err.is_not_found());

    let shorter = Part::new("length/part", 4, "");
    let err = download(backend, &shorter).await.unwrap_err();
    assert!(
        matches!(err, BackendError::ContentMismatch { expected: 4, actual: 10, .. }),
        "{err}"
    );
    assert!(!err.is_retryable());
}

async fn delete_is_idempotent(backend: &dyn Backend) {
    let data = content(10);
    let part = Part::from_data("delete/part", &data);
    upload(backend, &part, &data).await.unwrap();
    backend.delete_part(&part).await.unwrap();
    backend.delete_part(&part).await.unwrap();
    assert!(!backend.has_file("delete/part").await.unwrap());
    assert!(listed(backend, "delete/").await.is_empty());
}

async fn round_trips(backend: &dyn Backend) {
    for len in [0, 1, 4095, 65_537, 3 * 1024 * 1024 + 17] {
        let data = content(len);
        let part = Part::from_data(format!("round/{len}"), &data);
        upload(backend, &part, &data).await.unwrap();
        assert_eq!(download(backend, &part).await.unwrap(), data, "len {len}");
    }
}

async fn missing_part_is_not_found(backend: &dyn Backend) {
    let part = Part::new("missing/part", 10, "none");
    let err = download(backend, &part).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert_eq!(backend.stat("missing/part").await.unwrap(), None);
}

async fn control_files(backend: &dyn Backend) {
    assert!(!backend.has_file("control/lock").await.unwrap());
    backend.create_file("control/lock", b"first").await.unwrap();
    assert!(backend.has_file("control/lock").await.unwrap());
    backend
        .create_file("control/lock", b"second, longer")
        .await
        .unwrap();
    let part = Part::new("control/lock", 14, "");
    assert_eq!(download(backend, &part).await.unwrap(), b"second, longer");
    backend.delete_file("control/lock").await.unwrap();
    backend.delete_file("control/lock").await.unwrap();
    assert!(!backend.has_file("control/lock").await.unwrap());
    backend.remove_empty_dirs().await.unwrap();
}

async fn listing_reports_uploads(backend: &dyn Backend) {
    for name in ["list/c", "list/a", "list/b"] {
        let data = name.as_bytes();
        upload(backend, &Part::from_data(name, data), data)
            .await
            .unwrap();
    }
    let paths: Vec<String> = listed(backend, "list/")
        .await
        .into_iter()
        .map(|p| p.path)
        .collect();
    assert_eq!(paths, ["list/a", "list/b", "list/c"]);
}

/// Uploads one part to `src`, copies it to `dst` twice and reads it back.
pub async fn copy_round_trip(src: &dyn Backend, dst: &dyn Backend) {
    let data = content(5 * 1024 * 1024 + 3);
    let part = Part::from_data("copy/nested/part.bin", &data);
    upload(src, &part, &data).await.unwrap();

    src.copy_part(dst, &part).await.unwrap();
    src.copy_part(dst, &part).await.unwrap();

    assert_eq!(download(dst, &part).await.unwrap(), data);
    let parts = listed(dst, "copy/").await;
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].size, part.size);
}

/// Stops `backend` and checks that nothing works afterwards.
pub async fn misuse_after_stop(backend: &dyn Backend) {
    let part = Part::from_data("stopped/part", b"data");
    upload(backend, &part, b"data").await.unwrap();
    backend.stop();

    fn is_misuse<T: std::fmt::Debug>(res: Result<T, BackendError>) -> bool {
        matches!(res, Err(BackendError::Misuse(_)))
    }

    assert!(is_misuse(upload(backend, &part, b"data").await));
    assert!(is_misuse(download(backend, &part).await));
    assert!(is_misuse(backend.delete_part(&part).await));
    assert!(is_misuse(backend.copy_part(backend, &part).await));
    assert!(is_misuse(backend.has_file("stopped/part").await));
    assert!(is_misuse(backend.create_file("stopped/x", b"x").await));
    assert!(is_misuse(backend.delete_file("stopped/part").await));
    assert!(is_misuse(backend.stat("stopped/part").await));
    assert!(is_misuse(backend.remove_empty_dirs().await));
    assert!(is_misuse(backend.init().await));

    let items: Vec<_> = backend.list_parts("").collect().await;
    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(BackendError::Misuse(_))));
}
