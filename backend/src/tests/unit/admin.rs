use crm_shared::{BranchRule, StepKind};
use uuid::Uuid;

use crate::sequences::{NewSequence, SequenceError};
use crate::tests::fixtures::*;

fn new_sequence(steps: Vec<StepKind>) -> NewSequence {
    NewSequence {
        name: "  Q3 outbound ".to_string(),
        from_name: None,
        from_email: None,
        steps,
    }
}

#[tokio::test]
async fn test_create_sequence_numbers_steps_in_order() {
    let h = Harness::new();
    let template = h.store.add_template("Hi", "<p>Hi</p>");

    let sequence = h
        .admin()
        .create_sequence(new_sequence(vec![
            StepKind::Email {
                template_id: Some(template.id),
            },
            StepKind::Delay { delay_minutes: 4320 },
            StepKind::Webhook {
                url: "https://hooks.example.com/crm".to_string(),
            },
        ]))
        .await
        .unwrap();

    assert_eq!(sequence.name, "Q3 outbound");
    let orders: Vec<i32> = sequence.steps.iter().map(|s| s.order).collect();
    assert_eq!(orders, vec![0, 1, 2]);
    assert_eq!(sequence.steps[1].kind.type_name(), "delay");
}

#[tokio::test]
async fn test_create_sequence_reports_every_bad_step() {
    let h = Harness::new();

    let err = h
        .admin()
        .create_sequence(new_sequence(vec![
            StepKind::Email {
                template_id: Some(Uuid::new_v4()),
            },
            StepKind::Delay { delay_minutes: -5 },
            StepKind::Webhook {
                url: "mailto:ops@example.com".to_string(),
            },
            StepKind::Condition {
                branch: Some(BranchRule {
                    tag_id: Uuid::new_v4(),
                    present: true,
                    then_step_index: -1,
                    else_step_index: 0,
                }),
            },
        ]))
        .await
        .unwrap_err();

    let SequenceError::Validation(message) = err else {
        panic!("expected a validation error, got {:?}", err);
    };
    for fragment in ["step 0", "step 1", "step 2", "step 3"] {
        assert!(message.contains(fragment), "{} missing from {}", fragment, message);
    }
}

#[tokio::test]
async fn test_blank_name_is_rejected() {
    let h = Harness::new();
    let err = h
        .admin()
        .create_sequence(NewSequence {
            name: "   ".to_string(),
            ..new_sequence(vec![])
        })
        .await
        .unwrap_err();

    assert!(matches!(err, SequenceError::Validation(_)));
}

#[tokio::test]
async fn test_replace_steps_keeps_enrollment_cursor() {
    let h = Harness::new();
    let admin = h.admin();
    let sequence = h.store.add_sequence(vec![
        StepKind::Delay { delay_minutes: 10 },
        StepKind::Delay { delay_minutes: 20 },
    ]);
    let lead = h.store.add_lead(lead_fixture());
    let contact = h.store.add_contact(contact_fixture());
    let enrollment = h.store.insert_enrollment(sequence.id, lead.id, contact.id, 1, None);

    let replaced = admin
        .replace_steps(sequence.id, vec![StepKind::Condition { branch: None }])
        .await
        .unwrap();

    assert_eq!(replaced.step_count(), 1);
    assert!(replaced.updated_at.is_some());
    assert_eq!(h.store.enrollment(enrollment.id).current_step_index, 1);

    let listed = admin.list_enrollments(sequence.id).await.unwrap();
    assert_eq!(listed.len(), 1);

    let missing = admin.replace_steps(Uuid::new_v4(), vec![]).await.unwrap_err();
    assert!(matches!(missing, SequenceError::NotFound(_)));
}
