use std::collections::BTreeSet;
use std::sync::Arc;

use privgate_core::anonymize::AnonRecord;
use privgate_core::audit::{AuditLog, DEFAULT_RETENTION_SECS};
use privgate_core::budget::BudgetLedger;
use privgate_core::gateway::{ComputeOp, MaskedAdditiveScheme, SecureGateway};
use privgate_core::mediation::{EventSink, MediationEngine};
use privgate_core::policy::{
    PolicyRegistry, PrivacyLevel, PrivacyPolicy, RegisteredMechanisms, Technique,
};
use tempfile::TempDir;

use crate::http::{
    anonymize_impl, budget_status_impl, compute_impl, encrypt_dataset_impl, mediate_query_impl,
    AnonymizeRequest, AppState, ComputeRequest, EncryptDatasetRequest, MediateQueryRequest,
};
use crate::store::{AuditFileSink, BudgetStore, DatasetStore};
use crate::telemetry::Telemetry;

fn policy(id: &str, category: &str, techniques: &[Technique]) -> PrivacyPolicy {
    PrivacyPolicy {
        id: id.to_string(),
        data_category: category.to_string(),
        privacy_level: PrivacyLevel::High,
        required_techniques: techniques.iter().copied().collect(),
        retention_secs: 86_400,
        access_tags: BTreeSet::new(),
        anonymization_required: techniques.contains(&Technique::Anonymization),
    }
}

fn state(tmp: &TempDir, allowance: f64) -> AppState {
    let registry = Arc::new(
        PolicyRegistry::load(
            vec![
                policy("p-loc", "location", &[Technique::Noise]),
                policy("p-pay", "payments", &[Technique::Encryption]),
                policy("p-bio", "biometric", &[Technique::Anonymization]),
            ],
            &RegisteredMechanisms::all(),
        )
        .expect("registry"),
    );
    let ledger = Arc::new(BudgetLedger::new(allowance, 86_400).expect("ledger"));
    let gateway = Arc::new(SecureGateway::new(Arc::new(MaskedAdditiveScheme::new())));
    let audit = Arc::new(
        AuditLog::new(DEFAULT_RETENTION_SECS)
            .with_sink(Arc::new(AuditFileSink::open(tmp.path()))),
    );
    let telemetry = Telemetry::new();
    let engine = MediationEngine::new(registry, ledger, gateway, audit)
        .with_events(Arc::new(telemetry.clone()) as Arc<dyn EventSink>);
    AppState {
        engine: Arc::new(engine),
        telemetry,
        budget_store: Arc::new(BudgetStore::open(tmp.path())),
        dataset_store: Arc::new(DatasetStore::open(tmp.path())),
        max_body_bytes: 262_144,
        audit_trail_default_limit: 100,
    }
}

#[test]
fn query_endpoint_noises_and_persists_budget() {
    let tmp = TempDir::new().expect("tmp");
    let st = state(&tmp, 10.0);
    let response = mediate_query_impl(
        &st,
        &MediateQueryRequest {
            data_source_id: "src1".to_string(),
            data_category: "location".to_string(),
            epsilon: 1.0,
            sensitivity: 1.0,
            values: vec![10.0, 20.0],
        },
    )
    .expect("query");
    assert_eq!(response.noised_values.len(), 2);
    assert!((response.epsilon_spent - 1.0).abs() < 1e-12);

    let persisted = st.budget_store.load().expect("snapshot");
    assert!((persisted.get("src1").expect("account").consumed() - 1.0).abs() < 1e-12);
}

#[test]
fn query_endpoint_maps_budget_exhaustion() {
    let tmp = TempDir::new().expect("tmp");
    let st = state(&tmp, 1.0);
    let request = MediateQueryRequest {
        data_source_id: "src1".to_string(),
        data_category: "location".to_string(),
        epsilon: 0.8,
        sensitivity: 1.0,
        values: vec![1.0],
    };
    mediate_query_impl(&st, &request).expect("first");
    let err = mediate_query_impl(&st, &request).expect_err("exhausted");
    assert_eq!(err.code, "INSUFFICIENT_BUDGET");
    assert_eq!(err.status, axum::http::StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(st.telemetry.rejects_for("INSUFFICIENT_BUDGET"), 1);
}

#[test]
fn query_endpoint_rejects_invalid_epsilon() {
    let tmp = TempDir::new().expect("tmp");
    let st = state(&tmp, 1.0);
    let err = mediate_query_impl(
        &st,
        &MediateQueryRequest {
            data_source_id: "src1".to_string(),
            data_category: "location".to_string(),
            epsilon: -1.0,
            sensitivity: 1.0,
            values: vec![1.0],
        },
    )
    .expect_err("invalid epsilon");
    assert_eq!(err.code, "INVALID_INPUT");
    assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
}

#[test]
fn dataset_endpoints_encrypt_compute_and_persist() {
    let tmp = TempDir::new().expect("tmp");
    let st = state(&tmp, 10.0);
    let encrypted = encrypt_dataset_impl(
        &st,
        &EncryptDatasetRequest {
            data_category: "payments".to_string(),
            values: vec![5.0, 7.5],
        },
    )
    .expect("encrypt");

    let computed = compute_impl(
        &st,
        &encrypted.dataset_id,
        &ComputeRequest {
            operation: ComputeOp::Sum,
        },
    )
    .expect("compute");
    assert!(!computed.ciphertext_hex.is_empty());

    let persisted = st.dataset_store.load().expect("index");
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].access_count, 1);

    let err = compute_impl(
        &st,
        "missing",
        &ComputeRequest {
            operation: ComputeOp::Sum,
        },
    )
    .expect_err("unknown dataset");
    assert_eq!(err.code, "DATASET_NOT_FOUND");
}

#[test]
fn encrypt_endpoint_rejects_non_encryption_categories() {
    let tmp = TempDir::new().expect("tmp");
    let st = state(&tmp, 10.0);
    let err = encrypt_dataset_impl(
        &st,
        &EncryptDatasetRequest {
            data_category: "location".to_string(),
            values: vec![1.0],
        },
    )
    .expect_err("policy mismatch");
    assert_eq!(err.code, "POLICY_MISMATCH");
    assert_eq!(err.status, axum::http::StatusCode::FORBIDDEN);
}

#[test]
fn anonymize_endpoint_reports_threshold_violations() {
    let tmp = TempDir::new().expect("tmp");
    let st = state(&tmp, 10.0);
    let mut records = Vec::new();
    for sensitive in ["s1", "s2", "s3"] {
        records.push(AnonRecord::new(&["q1"], sensitive));
    }
    for _ in 0..3 {
        records.push(AnonRecord::new(&["q2"], "s1"));
    }

    let ok = anonymize_impl(
        &st,
        &AnonymizeRequest {
            data_category: Some("biometric".to_string()),
            records: records.clone(),
            k: 3,
            l: 2,
            suppression_threshold: 1.0,
        },
    )
    .expect("anonymize");
    assert_eq!(ok.records.len(), 3);

    let err = anonymize_impl(
        &st,
        &AnonymizeRequest {
            data_category: None,
            records,
            k: 3,
            l: 2,
            suppression_threshold: 0.1,
        },
    )
    .expect_err("threshold");
    assert_eq!(err.code, "SUPPRESSION_THRESHOLD_EXCEEDED");
    assert_eq!(err.status, axum::http::StatusCode::UNPROCESSABLE_ENTITY);
}

#[test]
fn budget_and_audit_views_reflect_activity() {
    let tmp = TempDir::new().expect("tmp");
    let st = state(&tmp, 10.0);
    mediate_query_impl(
        &st,
        &MediateQueryRequest {
            data_source_id: "src9".to_string(),
            data_category: "location".to_string(),
            epsilon: 2.0,
            sensitivity: 1.0,
            values: vec![0.0],
        },
    )
    .expect("query");

    let status = budget_status_impl(&st, "src9");
    assert!((status.remaining - 8.0).abs() < 1e-9);

    let trail = crate::http::audit_trail_impl(&st, Some(10));
    assert_eq!(trail.len(), 1);

    // the audit sink wrote through to disk
    let sink = AuditFileSink::open(tmp.path());
    assert_eq!(sink.load().expect("audit file").len(), 1);
}
