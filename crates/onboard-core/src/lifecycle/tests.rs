use std::sync::Arc;

use super::*;
use crate::directory::{MockDirectory, Provisioner};
use crate::mail::{MailJob, RecordingMailQueue};
use crate::request::{AuthorizedPersonSpec, NewAttachment};
use crate::storage::LocalFileStore;

struct Harness {
    engine: LifecycleEngine,
    directory: MockDirectory,
    mail: Arc<RecordingMailQueue>,
    media: tempfile::TempDir,
}

fn harness() -> Harness {
    let store = RequestStore::in_memory().unwrap();
    let directory = MockDirectory::new();
    let mail = Arc::new(RecordingMailQueue::new());
    let provisioner = Arc::new(Provisioner::new(
        Arc::new(directory.clone()),
        mail.clone(),
        "onboard",
    ));
    let media = tempfile::tempdir().unwrap();
    let files = Arc::new(LocalFileStore::new(media.path()));
    Harness {
        engine: LifecycleEngine::new(store, provisioner, files),
        directory,
        mail,
        media,
    }
}

fn staff() -> ActorContext {
    ActorContext {
        username: Some("staff".to_string()),
        source_ip: Some("10.0.0.1".to_string()),
    }
}

fn sample_request() -> NewRequest {
    NewRequest {
        company_name: "Acme Logistics".to_string(),
        email: "info@acme.test".to_string(),
        contact_name: "Ada Smith".to_string(),
        contact_email: "ada@acme.test".to_string(),
        authorized_persons: vec![AuthorizedPersonSpec {
            name: "Juan Perez".to_string(),
            informational: true,
            ..AuthorizedPersonSpec::default()
        }],
        ..NewRequest::default()
    }
}

#[test]
fn create_persists_persons_and_history() {
    let h = harness();
    let detail = h.engine.create(&sample_request(), &staff()).unwrap();

    assert_eq!(detail.request.status, RequestStatus::Pending);
    assert!(detail.request.active);
    assert_eq!(detail.request.created_by.as_deref(), Some("staff"));
    assert_eq!(detail.request.created_from_ip.as_deref(), Some("10.0.0.1"));
    assert_eq!(detail.authorized_persons.len(), 1);
    assert_eq!(detail.authorized_persons[0].name, "Juan Perez");
    assert_eq!(detail.history.len(), 1);
    assert_eq!(detail.history[0].action, "Request created.");
    assert_eq!(detail.history[0].actor.as_deref(), Some("staff"));
}

#[test]
fn create_history_names_uploaded_files() {
    let h = harness();
    let new = NewRequest {
        uploaded_files: vec!["license.pdf".to_string(), "deed.pdf".to_string()],
        ..sample_request()
    };
    let detail = h.engine.create(&new, &staff()).unwrap();
    assert_eq!(
        detail.history[0].action,
        "Request created. Files: license.pdf, deed.pdf."
    );
}

#[test]
fn update_records_one_fragment_per_changed_field() {
    let h = harness();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;

    let patch = RequestPatch {
        company_name: Some("Acme Holdings".to_string()),
        city: Some("Mariel".to_string()),
        // Same value as stored: no fragment.
        email: Some("info@acme.test".to_string()),
        notes: Some("priority customer".to_string()),
        ..RequestPatch::default()
    };
    let detail = h.engine.update(id, &patch, &staff()).unwrap();

    assert_eq!(detail.request.company_name, "Acme Holdings");
    assert_eq!(detail.request.notes.as_deref(), Some("priority customer"));
    // Create entry plus exactly one update entry.
    assert_eq!(detail.history.len(), 2);
    let action = &detail.history[0].action;
    assert!(action.contains("company_name changed from 'Acme Logistics' to 'Acme Holdings'."));
    assert!(action.contains("city changed from '' to 'Mariel'."));
    assert!(action.contains("notes changed from '' to 'priority customer'."));
    assert!(!action.contains("email changed"));
}

#[test]
fn noop_update_appends_no_history() {
    let h = harness();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;

    let patch = RequestPatch {
        company_name: Some("Acme Logistics".to_string()),
        ..RequestPatch::default()
    };
    let detail = h.engine.update(id, &patch, &staff()).unwrap();
    assert_eq!(detail.history.len(), 1);

    let detail = h.engine.update(id, &RequestPatch::default(), &staff()).unwrap();
    assert_eq!(detail.history.len(), 1);
}

#[test]
fn assigning_customer_code_completes_and_provisions() {
    let h = harness();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;

    let patch = RequestPatch {
        customer_code: Some("C-100".to_string()),
        ..RequestPatch::default()
    };
    let detail = h.engine.update(id, &patch, &staff()).unwrap();

    assert_eq!(detail.request.status, RequestStatus::Completed);
    assert_eq!(detail.request.customer_code.as_deref(), Some("C-100"));
    let action = &detail.history[0].action;
    assert!(action.contains("customer_code changed from '' to 'C-100'."));
    assert!(action.contains("Status changed to 'Completed'."));

    h.directory.snapshot(|state| {
        assert_eq!(state.accounts.len(), 1);
        assert_eq!(state.accounts[0].customer_code, "C-100");
    });
    let jobs = h.mail.jobs();
    assert_eq!(jobs.len(), 1);
    assert!(matches!(&jobs[0], MailJob::CredentialsIssued { recipient, .. }
        if recipient == "ada@acme.test"));
}

#[test]
fn whitespace_customer_code_does_not_complete() {
    let h = harness();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;

    let patch = RequestPatch {
        customer_code: Some("   ".to_string()),
        ..RequestPatch::default()
    };
    let detail = h.engine.update(id, &patch, &staff()).unwrap();
    assert_eq!(detail.request.status, RequestStatus::Pending);
    assert_eq!(detail.request.customer_code, None);
    h.directory.snapshot(|state| assert!(state.accounts.is_empty()));
}

#[test]
fn completed_requests_cannot_be_updated() {
    let h = harness();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;
    h.engine.approve(id, &ApprovalGrant::default(), &staff()).unwrap();

    let patch = RequestPatch {
        notes: Some("too late".to_string()),
        ..RequestPatch::default()
    };
    let err = h.engine.update(id, &patch, &staff()).unwrap_err();
    assert!(matches!(err, LifecycleError::TerminalStateViolation { id: e } if e == id));
}

#[test]
fn duplicate_code_on_update_persists_nothing() {
    let h = harness();
    let first = NewRequest {
        customer_code: Some("C-100".to_string()),
        ..sample_request()
    };
    h.engine.create(&first, &staff()).unwrap();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;

    let patch = RequestPatch {
        notes: Some("claiming a taken code".to_string()),
        customer_code: Some("C-100".to_string()),
        ..RequestPatch::default()
    };
    let err = h.engine.update(id, &patch, &staff()).unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::DuplicateCustomerCode { code } if code == "C-100"
    ));

    // The whole transaction rolled back, including the notes change.
    let detail = h.engine.get(id).unwrap();
    assert_eq!(detail.request.notes, None);
    assert_eq!(detail.request.status, RequestStatus::Pending);
    assert_eq!(detail.history.len(), 1);
}

#[test]
fn approve_grants_code_and_roles_then_provisions() {
    let h = harness();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;

    let grant = ApprovalGrant {
        customer_code: Some("C-200".to_string()),
        roles: Some(vec!["ICT".to_string()]),
    };
    let detail = h.engine.approve(id, &grant, &staff()).unwrap();

    assert_eq!(detail.request.status, RequestStatus::Completed);
    assert_eq!(detail.request.customer_code.as_deref(), Some("C-200"));
    assert_eq!(detail.request.roles, vec!["ICT".to_string()]);
    assert_eq!(
        detail.history[0].action,
        "Request approved and marked as completed."
    );
    h.directory.snapshot(|state| {
        assert_eq!(state.accounts.len(), 1);
        assert_eq!(state.bindings.len(), 1);
        assert_eq!(state.bindings[0].role, "ICT");
    });
}

#[test]
fn approve_twice_is_rejected() {
    let h = harness();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;
    h.engine.approve(id, &ApprovalGrant::default(), &staff()).unwrap();
    let err = h
        .engine
        .approve(id, &ApprovalGrant::default(), &staff())
        .unwrap_err();
    assert!(matches!(err, LifecycleError::AlreadyCompleted { id: e } if e == id));
}

#[test]
fn reject_sets_status_and_notes() {
    let h = harness();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;

    let detail = h
        .engine
        .reject(id, Some("missing tax documents"), &staff())
        .unwrap();
    assert_eq!(detail.request.status, RequestStatus::Rejected);
    assert_eq!(
        detail.request.rejection_notes.as_deref(),
        Some("missing tax documents")
    );
    assert_eq!(detail.history[0].action, "Request rejected.");

    // Rejecting again is invalid.
    let err = h.engine.reject(id, None, &staff()).unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::InvalidTransition { from: RequestStatus::Rejected, .. }
    ));
}

#[test]
fn rejected_requests_can_still_be_edited() {
    let h = harness();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;
    h.engine.reject(id, None, &staff()).unwrap();

    let patch = RequestPatch {
        status: Some(RequestStatus::Pending),
        ..RequestPatch::default()
    };
    let detail = h.engine.update(id, &patch, &staff()).unwrap();
    assert_eq!(detail.request.status, RequestStatus::Pending);
    assert!(detail.history[0]
        .action
        .contains("status changed from 'Rejected' to 'Pending'."));
}

#[test]
fn completed_requests_cannot_be_rejected() {
    let h = harness();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;
    h.engine.approve(id, &ApprovalGrant::default(), &staff()).unwrap();
    let err = h.engine.reject(id, None, &staff()).unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::InvalidTransition { from: RequestStatus::Completed, .. }
    ));
}

#[test]
fn soft_delete_hides_from_lists_but_keeps_the_row() {
    let h = harness();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;

    h.engine.soft_delete(id, &staff()).unwrap();

    assert!(h.engine.list(&ListFilter::default()).unwrap().is_empty());
    let detail = h.engine.get(id).unwrap();
    assert!(!detail.request.active);
    assert_eq!(detail.history[0].action, "Request deleted (marked inactive).");
}

#[test]
fn completed_requests_cannot_be_soft_deleted() {
    let h = harness();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;
    h.engine.approve(id, &ApprovalGrant::default(), &staff()).unwrap();
    let err = h.engine.soft_delete(id, &staff()).unwrap_err();
    assert!(matches!(err, LifecycleError::TerminalStateViolation { id: e } if e == id));
}

#[test]
fn attachments_are_added_and_removed_through_patches() {
    let h = harness();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;

    let patch = RequestPatch {
        add_attachments: vec![NewAttachment {
            filename: "license.pdf".to_string(),
            bytes: b"pdf bytes".to_vec(),
        }],
        ..RequestPatch::default()
    };
    let detail = h.engine.update(id, &patch, &staff()).unwrap();
    assert_eq!(detail.attachments.len(), 1);
    assert_eq!(detail.attachments[0].original_filename, "license.pdf");
    assert!(detail.history[0].action.contains("Attachment 'license.pdf' added."));
    let stored = h.media.path().join(&detail.attachments[0].file_ref);
    assert_eq!(std::fs::read(&stored).unwrap(), b"pdf bytes");

    let patch = RequestPatch {
        remove_attachments: vec![detail.attachments[0].id],
        ..RequestPatch::default()
    };
    let detail = h.engine.update(id, &patch, &staff()).unwrap();
    assert!(detail.attachments.is_empty());
    assert!(detail.history[0]
        .action
        .contains("Attachment 'license.pdf' removed."));
    assert!(!stored.exists());
}

#[test]
fn failed_update_restores_attachment_rows_and_bytes() {
    let h = harness();
    let taken = NewRequest {
        customer_code: Some("C-100".to_string()),
        ..sample_request()
    };
    h.engine.create(&taken, &staff()).unwrap();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;

    let patch = RequestPatch {
        add_attachments: vec![NewAttachment {
            filename: "license.pdf".to_string(),
            bytes: b"pdf bytes".to_vec(),
        }],
        ..RequestPatch::default()
    };
    let detail = h.engine.update(id, &patch, &staff()).unwrap();
    let stored = h.media.path().join(&detail.attachments[0].file_ref);

    // Removing the attachment and claiming a taken code in one patch rolls
    // the whole transaction back.
    let patch = RequestPatch {
        customer_code: Some("C-100".to_string()),
        remove_attachments: vec![detail.attachments[0].id],
        ..RequestPatch::default()
    };
    let err = h.engine.update(id, &patch, &staff()).unwrap_err();
    assert!(matches!(err, LifecycleError::DuplicateCustomerCode { .. }));

    // The row survived the rollback and its bytes are still on disk.
    let detail = h.engine.get(id).unwrap();
    assert_eq!(detail.attachments.len(), 1);
    assert!(stored.exists());
}

#[test]
fn failed_update_leaves_no_orphan_bytes() {
    let h = harness();
    let taken = NewRequest {
        customer_code: Some("C-100".to_string()),
        ..sample_request()
    };
    h.engine.create(&taken, &staff()).unwrap();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;

    let patch = RequestPatch {
        customer_code: Some("C-100".to_string()),
        add_attachments: vec![NewAttachment {
            filename: "license.pdf".to_string(),
            bytes: b"pdf bytes".to_vec(),
        }],
        ..RequestPatch::default()
    };
    let err = h.engine.update(id, &patch, &staff()).unwrap_err();
    assert!(matches!(err, LifecycleError::DuplicateCustomerCode { .. }));

    let detail = h.engine.get(id).unwrap();
    assert!(detail.attachments.is_empty());
    // The bytes saved before the rollback were unlinked again.
    let leftovers = std::fs::read_dir(h.media.path()).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[test]
fn duplicate_code_create_leaves_no_person_rows() {
    let h = harness();
    let taken = NewRequest {
        customer_code: Some("C-100".to_string()),
        ..sample_request()
    };
    h.engine.create(&taken, &staff()).unwrap();

    let second = NewRequest {
        company_name: "Rival Corp".to_string(),
        customer_code: Some("C-100".to_string()),
        authorized_persons: vec![
            AuthorizedPersonSpec {
                name: "Maria Lopez".to_string(),
                ..AuthorizedPersonSpec::default()
            },
            AuthorizedPersonSpec {
                name: "Pedro Diaz".to_string(),
                ..AuthorizedPersonSpec::default()
            },
        ],
        ..sample_request()
    };
    let err = h.engine.create(&second, &staff()).unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::DuplicateCustomerCode { code } if code == "C-100"
    ));

    // Only the first request's person row exists; nothing leaked from the
    // failed create.
    let conn = h.engine.store().lock();
    let persons: i64 = conn
        .query_row("SELECT COUNT(*) FROM authorized_persons", [], |row| row.get(0))
        .unwrap();
    assert_eq!(persons, 1);
    let requests: i64 = conn
        .query_row("SELECT COUNT(*) FROM requests", [], |row| row.get(0))
        .unwrap();
    assert_eq!(requests, 1);
}

#[test]
fn removing_an_unknown_attachment_is_skipped() {
    let h = harness();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;
    let patch = RequestPatch {
        remove_attachments: vec![999],
        ..RequestPatch::default()
    };
    let detail = h.engine.update(id, &patch, &staff()).unwrap();
    // Nothing matched, nothing recorded.
    assert_eq!(detail.history.len(), 1);
}

#[test]
fn replacing_persons_records_one_entry() {
    let h = harness();
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;

    let patch = RequestPatch {
        authorized_persons: Some(vec![
            AuthorizedPersonSpec {
                name: "Maria Lopez".to_string(),
                operational: true,
                ..AuthorizedPersonSpec::default()
            },
            AuthorizedPersonSpec {
                name: "Pedro Diaz".to_string(),
                ..AuthorizedPersonSpec::default()
            },
        ]),
        ..RequestPatch::default()
    };
    let detail = h.engine.update(id, &patch, &staff()).unwrap();
    assert_eq!(detail.authorized_persons.len(), 2);
    assert_eq!(detail.authorized_persons[0].name, "Maria Lopez");
    assert!(detail.history[0].action.contains("Authorized persons updated."));
}

#[test]
fn update_of_missing_request_is_not_found() {
    let h = harness();
    let err = h
        .engine
        .update(42, &RequestPatch::default(), &staff())
        .unwrap_err();
    assert!(matches!(err, LifecycleError::NotFound { id: 42 }));
}

#[test]
fn provisioning_failure_does_not_undo_completion() {
    let h = harness();
    h.directory.state_mut(|s| s.fail_connect = true);
    let id = h.engine.create(&sample_request(), &staff()).unwrap().request.id;

    let detail = h
        .engine
        .approve(id, &ApprovalGrant::default(), &staff())
        .unwrap();
    assert_eq!(detail.request.status, RequestStatus::Completed);
    assert!(h.mail.jobs().is_empty());

    // The local transition stands even though the directory was unreachable.
    let detail = h.engine.get(id).unwrap();
    assert_eq!(detail.request.status, RequestStatus::Completed);
}
