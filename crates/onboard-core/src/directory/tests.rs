use std::sync::Arc;

use chrono::Utc;

use super::*;
use crate::mail::RecordingMailQueue;
use crate::request::RequestStatus;

fn completed_request(roles: &[&str]) -> RequestRecord {
    RequestRecord {
        id: 1,
        company_name: "Acme Logistics".to_string(),
        address: "1 Pier Road".to_string(),
        city: "Mariel".to_string(),
        state: "Artemisa".to_string(),
        phone: "555-0100".to_string(),
        email: "info@acme.test".to_string(),
        tax_id: "TX-1".to_string(),
        contact_name: "Ada Smith".to_string(),
        contact_position: "Director".to_string(),
        contact_phone: "555-0101".to_string(),
        contact_email: "ada@acme.test".to_string(),
        customer_code: Some("C-100".to_string()),
        roles: roles.iter().map(|r| (*r).to_string()).collect(),
        notes: None,
        rejection_notes: None,
        status: RequestStatus::Completed,
        active: true,
        created_by: None,
        created_at: Utc::now(),
        created_from_ip: None,
        uploaded_files: Vec::new(),
    }
}

fn person(id: i64, name: &str) -> AuthorizedPerson {
    AuthorizedPerson {
        id,
        request_id: 1,
        name: name.to_string(),
        position: "Operator".to_string(),
        phone: "555-0200".to_string(),
        email: Some("p@acme.test".to_string()),
        informational: true,
        operational: false,
        associated_with: "Terminal".to_string(),
    }
}

#[test]
fn derive_account_id_uses_first_name_and_initials() {
    assert_eq!(derive_account_id("Juan Perez Garcia"), "JUANPG");
    assert_eq!(derive_account_id("Ada"), "ADA");
    assert_eq!(derive_account_id("  maria   del  toro "), "MARIADT");
    assert_eq!(derive_account_id(""), "");
}

#[test]
fn generated_credential_is_mixed_and_long_enough() {
    for _ in 0..20 {
        let credential = generate_credential(CREDENTIAL_LENGTH);
        assert_eq!(credential.len(), CREDENTIAL_LENGTH);
        assert!(credential.chars().any(|c| c.is_ascii_alphabetic()));
        assert!(credential.chars().any(|c| c.is_ascii_digit()));
    }
}

#[test]
fn legacy_hash_matches_wire_format() {
    let hash = legacy_credential_hash("abc");
    // MD5, lowercase hex, 32 chars.
    assert_eq!(hash, "900150983cd24fb0d6963f7d28e17f72");
    assert_eq!(hash.len(), 32);
}

#[test]
fn two_persons_two_roles_yields_two_inserts_and_four_bindings() {
    let directory = MockDirectory::new();
    let mail = Arc::new(RecordingMailQueue::new());
    let provisioner = Provisioner::new(Arc::new(directory.clone()), mail, "onboard");

    let request = completed_request(&["ICT", "DC"]);
    let persons = vec![person(1, "Juan Perez Garcia"), person(2, "Maria Lopez")];

    let report = provisioner.provision(&request, &persons);
    assert_eq!(report.accounts_attempted, 2);
    assert_eq!(report.accounts_created, 2);
    assert_eq!(report.bindings_attempted, 4);
    assert_eq!(report.bindings_created, 4);
    assert!(report.is_complete());

    directory.snapshot(|state| {
        assert_eq!(state.accounts.len(), 2);
        assert_eq!(state.bindings.len(), 4);
        assert_eq!(state.accounts[0].account_id, "JUANPG");
        assert_eq!(state.accounts[0].customer_code, "C-100");
        assert_eq!(state.accounts[0].password_hash.len(), 32);
        // Binding ids are fresh and unique.
        let mut ids: Vec<_> = state.bindings.iter().map(|b| b.binding_id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    });
}

#[test]
fn unreachable_directory_is_a_logged_noop() {
    let directory = MockDirectory::unreachable();
    let mail = Arc::new(RecordingMailQueue::new());
    let provisioner = Provisioner::new(Arc::new(directory), mail.clone(), "onboard");

    let request = completed_request(&["ICT"]);
    let report = provisioner.provision(&request, &[person(1, "Juan Perez")]);
    assert_eq!(report.accounts_attempted, 0);
    assert_eq!(report.bindings_attempted, 0);
    assert!(mail.jobs().is_empty());
}

#[test]
fn insert_failure_does_not_stop_roles_or_later_persons() {
    let directory = MockDirectory::new();
    directory.state_mut(|s| s.fail_inserts = true);
    let mail = Arc::new(RecordingMailQueue::new());
    let provisioner = Provisioner::new(Arc::new(directory.clone()), mail.clone(), "onboard");

    let request = completed_request(&["ICT"]);
    let persons = vec![person(1, "Juan Perez"), person(2, "Maria Lopez")];
    let report = provisioner.provision(&request, &persons);

    assert_eq!(report.accounts_attempted, 2);
    assert_eq!(report.accounts_created, 0);
    // Role bindings are still attempted independently of the inserts.
    assert_eq!(report.bindings_attempted, 2);
    assert_eq!(report.bindings_created, 2);
    // No credentials were actually provisioned, so nothing to mail.
    assert!(mail.jobs().is_empty());
}

#[test]
fn successful_provisioning_mails_credentials_to_contact() {
    let directory = MockDirectory::new();
    let mail = Arc::new(RecordingMailQueue::new());
    let provisioner = Provisioner::new(Arc::new(directory), mail.clone(), "onboard");

    let request = completed_request(&[]);
    provisioner.provision(&request, &[person(1, "Juan Perez")]);

    let jobs = mail.jobs();
    assert_eq!(jobs.len(), 1);
    match &jobs[0] {
        crate::mail::MailJob::CredentialsIssued {
            company_name,
            customer_code,
            recipient,
            credentials,
        } => {
            assert_eq!(company_name, "Acme Logistics");
            assert_eq!(customer_code, "C-100");
            assert_eq!(recipient, "ada@acme.test");
            assert_eq!(credentials.len(), 1);
            assert_eq!(credentials[0].account_id, "JUANP");
        }
        other => panic!("unexpected job: {other:?}"),
    }
}

#[test]
fn no_persons_means_no_connection() {
    // An unreachable directory would fail connect; with no persons we never
    // get that far.
    let provisioner = Provisioner::new(
        Arc::new(MockDirectory::unreachable()),
        Arc::new(RecordingMailQueue::new()),
        "onboard",
    );
    let report = provisioner.provision(&completed_request(&["ICT"]), &[]);
    assert_eq!(report.accounts_attempted, 0);
}
