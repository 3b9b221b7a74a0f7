//! End-to-end download scenarios over the scripted engine

mod common;

use common::*;
use dlbridge_core::scripted::{DownloadScript, NativeRecord, ScriptStep};
use dlbridge_core::{DownloadError, EngineCapabilities};
use dlbridge_types::{DownloadEvent, DownloadRequest, DownloadState, Generation, ResumeData};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::TryRecvError;

#[tokio::test]
async fn legacy_download_reports_destination_progress_and_finish() {
    let mut h = harness(EngineCapabilities::legacy_only());
    h.engine.push(
        DownloadScript::new(Generation::Legacy)
            .with_expected_length(1024)
            .with_mime_type("application/zip")
            .step(ScriptStep::DecideDestination {
                suggested_filename: "file.zip".to_string(),
            })
            .step(ScriptStep::Data { bytes: 512 })
            .step(ScriptStep::Data { bytes: 512 })
            .step(ScriptStep::Finish),
    );

    let handle = h
        .coordinator
        .start(DownloadRequest::get("https://example.com/file.zip"), None)
        .await
        .unwrap();
    assert_eq!(handle.generation(), Generation::Legacy);

    let event = wait_terminal(&mut h.events, handle.id()).await;
    let DownloadEvent::Finished { download } = event else {
        panic!("expected finish, got {:?}", event);
    };

    let calls = h.delegate.calls();
    assert_eq!(
        calls.first(),
        Some(&Call::Destination {
            suggested: "file.zip".to_string()
        })
    );
    assert_eq!(calls.last(), Some(&Call::Finished));
    assert_eq!(
        calls
            .iter()
            .filter(|c| matches!(c, Call::Bytes(_)))
            .count(),
        2
    );

    assert!(handle.redirect_history().is_empty());
    assert_eq!(handle.state(), DownloadState::Finished);
    assert_eq!(download.total_received, 1024);
    assert_eq!(download.destination, Some(PathBuf::from("/downloads/file.zip")));
    assert_eq!(download.mime_type.as_deref(), Some("application/zip"));
    assert_eq!(h.coordinator.active_count().await, 0);
    assert!(h
        .engine
        .journal()
        .contains(&NativeRecord::Destination(Some(PathBuf::from("/downloads/file.zip")))));
}

#[tokio::test]
async fn modern_redirect_is_allowed_once_and_recorded() {
    let mut h = harness(EngineCapabilities::modern_only());
    h.engine.push(
        DownloadScript::new(Generation::Modern)
            .with_expected_length(2048)
            .step(ScriptStep::Redirect {
                url: "https://example.com/file2.zip".to_string(),
            })
            .step(ScriptStep::DecideDestination {
                suggested_filename: "file2.zip".to_string(),
            })
            .step(ScriptStep::Data { bytes: 2048 })
            .step(ScriptStep::Finish),
    );

    let handle = h
        .coordinator
        .start(DownloadRequest::get("https://example.com/a"), None)
        .await
        .unwrap();
    let event = wait_terminal(&mut h.events, handle.id()).await;
    assert!(matches!(event, DownloadEvent::Finished { .. }));

    assert_eq!(handle.redirect_history(), vec!["https://example.com/file2.zip"]);
    assert_eq!(handle.snapshot().final_url(), "https://example.com/file2.zip");

    let policies: Vec<_> = h
        .engine
        .journal()
        .into_iter()
        .filter(|r| matches!(r, NativeRecord::RedirectPolicy(_)))
        .collect();
    assert_eq!(policies, vec![NativeRecord::RedirectPolicy(1)]);

    let calls = h.delegate.calls();
    assert_eq!(
        calls[0],
        Call::Redirect {
            url: "https://example.com/file2.zip".to_string(),
            decision_required: true
        }
    );
    assert_eq!(
        calls[1],
        Call::Destination {
            suggested: "file2.zip".to_string()
        }
    );
    assert_eq!(calls.last(), Some(&Call::Finished));
}

#[tokio::test]
async fn cancel_hands_back_resume_data_that_resumes() {
    let mut h = harness(EngineCapabilities::modern_only());
    let bytes = vec![0xde, 0xad, 0xbe, 0xef];
    h.engine.push(
        DownloadScript::new(Generation::Modern)
            .with_resume_data_on_cancel(bytes.clone())
            .step(ScriptStep::DecideDestination {
                suggested_filename: "big.iso".to_string(),
            })
            .step(ScriptStep::Data { bytes: 100 })
            .step(ScriptStep::Hold),
    );

    let handle = h
        .coordinator
        .start(DownloadRequest::get("https://example.com/big.iso"), None)
        .await
        .unwrap();
    wait_for(&mut h.events, handle.id(), |e| {
        matches!(e, DownloadEvent::Progress { .. })
    })
    .await;
    assert_eq!(handle.state(), DownloadState::InProgress);

    let returned = h.coordinator.cancel(&handle).await;
    assert_eq!(returned.as_ref().map(ResumeData::as_bytes), Some(bytes.as_slice()));

    let event = wait_terminal(&mut h.events, handle.id()).await;
    let DownloadEvent::Failed { download, error } = event else {
        panic!("expected failure, got {:?}", event);
    };
    assert!(error.is_cancellation());
    assert_eq!(download.state, DownloadState::Cancelled);
    assert_eq!(handle.resume_data().unwrap().as_bytes(), bytes.as_slice());
    assert!(h.delegate.calls().contains(&Call::Failed {
        error,
        resume_data: Some(bytes.clone()),
    }));

    h.engine.push_resume(
        bytes.clone(),
        DownloadScript::new(Generation::Modern)
            .step(ScriptStep::Sleep { ms: 50 })
            .step(ScriptStep::Data { bytes: 900 })
            .step(ScriptStep::Finish),
    );
    let destination = handle.destination().unwrap();
    let resumed = h
        .coordinator
        .resume(&ResumeData::new(bytes).unwrap(), &destination, None)
        .await
        .unwrap();
    assert_ne!(resumed.id(), handle.id());
    assert_eq!(resumed.state(), DownloadState::Created);
    assert_eq!(resumed.destination(), Some(destination));

    let event = wait_terminal(&mut h.events, resumed.id()).await;
    assert!(matches!(event, DownloadEvent::Finished { .. }));
}

#[tokio::test]
async fn resumed_download_keeps_its_destination_for_the_next_retry() {
    let mut h = harness(EngineCapabilities::modern_only());
    let interrupted = |resume_data: Vec<u8>| ScriptStep::Fail {
        error: dlbridge_types::TransportError::new(
            dlbridge_types::TransportErrorKind::Network,
            "connection lost",
        ),
        resume_data: Some(resume_data),
    };
    h.engine.push(
        DownloadScript::new(Generation::Modern)
            .step(ScriptStep::DecideDestination {
                suggested_filename: "big.iso".to_string(),
            })
            .step(ScriptStep::Data { bytes: 100 })
            .step(interrupted(vec![1, 2, 3])),
    );
    let handle = h
        .coordinator
        .start(DownloadRequest::get("https://example.com/big.iso"), None)
        .await
        .unwrap();
    wait_terminal(&mut h.events, handle.id()).await;
    let destination = PathBuf::from("/downloads/big.iso");
    assert_eq!(handle.destination(), Some(destination.clone()));

    // The engine reports the plain HTTP request for the resumed transfer
    h.engine.push_resume(
        vec![1, 2, 3],
        DownloadScript::new(Generation::Modern)
            .with_request(DownloadRequest::get("https://example.com/big.iso"))
            .step(ScriptStep::DecideDestination {
                suggested_filename: "big.iso".to_string(),
            })
            .step(ScriptStep::Data { bytes: 200 })
            .step(interrupted(vec![4, 5, 6])),
    );
    let resumed = h
        .coordinator
        .resume(&ResumeData::new(vec![1, 2, 3]).unwrap(), &destination, None)
        .await
        .unwrap();
    assert!(resumed.original_request().destination.is_none());
    assert_eq!(resumed.destination(), Some(destination.clone()));

    let DownloadEvent::Failed { download, .. } = wait_terminal(&mut h.events, resumed.id()).await else {
        panic!("expected failure");
    };
    assert_eq!(download.destination, Some(destination.clone()));
    assert_eq!(download.resume_data.as_ref().map(ResumeData::as_bytes), Some(&[4u8, 5, 6][..]));

    // No fresh script is queued, so only the resume path can succeed
    h.engine.push_resume(
        vec![4, 5, 6],
        DownloadScript::new(Generation::Modern)
            .step(ScriptStep::Data { bytes: 700 })
            .step(ScriptStep::Finish),
    );
    let retried = h.coordinator.retry(&download, None).await.unwrap();
    assert_eq!(retried.destination(), Some(destination.clone()));
    let event = wait_terminal(&mut h.events, retried.id()).await;
    assert!(matches!(event, DownloadEvent::Finished { .. }));

    let asked = h
        .delegate
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Destination { .. }))
        .count();
    assert_eq!(asked, 1);
    assert!(h
        .engine
        .journal()
        .contains(&NativeRecord::Destination(Some(destination))));
}

#[tokio::test]
async fn no_download_api_means_no_handle_and_no_events() {
    let mut h = harness(EngineCapabilities::none());
    assert!(!h.coordinator.downloads_supported());

    let started = h
        .coordinator
        .start(DownloadRequest::get("https://example.com/file.zip"), None)
        .await;
    assert!(matches!(started, Err(DownloadError::UnsupportedCapability)));

    let resumed = h
        .coordinator
        .resume(
            &ResumeData::new(vec![1]).unwrap(),
            Path::new("/downloads/file.zip"),
            None,
        )
        .await;
    assert!(matches!(resumed, Err(DownloadError::UnsupportedCapability)));

    assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));
    assert!(h.delegate.calls().is_empty());
    assert!(h.engine.journal().is_empty());
}

#[tokio::test]
async fn rejected_resume_data_is_an_error() {
    let h = harness(EngineCapabilities::all());
    let result = h
        .coordinator
        .resume(
            &ResumeData::new(vec![4, 2]).unwrap(),
            Path::new("/downloads/x"),
            None,
        )
        .await;
    assert!(matches!(result, Err(DownloadError::InvalidResumeData)));
    assert_eq!(h.coordinator.active_count().await, 0);
}

#[tokio::test]
async fn invalid_url_is_refused_before_the_engine() {
    let h = harness(EngineCapabilities::all());
    let result = h
        .coordinator
        .start(DownloadRequest::get("not a url"), None)
        .await;
    assert!(matches!(result, Err(DownloadError::InvalidUrl(_))));
}

#[tokio::test]
async fn retry_falls_back_to_a_fresh_start() {
    let mut h = harness(EngineCapabilities::legacy_only());
    h.engine.push(
        DownloadScript::new(Generation::Legacy)
            .step(ScriptStep::DecideDestination {
                suggested_filename: "file.zip".to_string(),
            })
            .step(ScriptStep::Fail {
                error: dlbridge_types::TransportError::new(
                    dlbridge_types::TransportErrorKind::Network,
                    "connection lost",
                ),
                resume_data: Some(vec![5, 5, 5]),
            }),
    );
    let handle = h
        .coordinator
        .start(DownloadRequest::get("https://example.com/file.zip"), None)
        .await
        .unwrap();
    let DownloadEvent::Failed { download, .. } = wait_terminal(&mut h.events, handle.id()).await else {
        panic!("expected failure");
    };
    assert_eq!(download.state, DownloadState::Failed);

    // The engine no longer accepts the bytes, so the request starts over
    h.engine.push(
        DownloadScript::new(Generation::Legacy)
            .step(ScriptStep::DecideDestination {
                suggested_filename: "file.zip".to_string(),
            })
            .step(ScriptStep::Finish),
    );
    let retried = h.coordinator.retry(&download, None).await.unwrap();
    assert_eq!(retried.original_request().url, "https://example.com/file.zip");
    assert_eq!(
        retried.original_request().destination,
        Some(PathBuf::from("/downloads/file.zip"))
    );

    let event = wait_terminal(&mut h.events, retried.id()).await;
    assert!(matches!(event, DownloadEvent::Finished { .. }));
    // Preset destination: the delegate was asked only for the first attempt
    let asked = h
        .delegate
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Destination { .. }))
        .count();
    assert_eq!(asked, 1);
}
