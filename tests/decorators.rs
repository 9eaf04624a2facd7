mod common;

use std::time::Duration;

use common::{recording_sleeper, sign_request, ScriptedService, TENANT};
use softhsm::config::RetryConfig;
use softhsm::error::{BackoffStrategy, ThrottleSignal};
use softhsm::retry::RetryTimeoutDecorator;
use softhsm::service::{CryptoService, KeyReference, SignRequest};
use softhsm::schemes::SignatureSpec;
use softhsm::throttling::ThrottlingDecorator;
use softhsm::SoftHsmError;

fn throttled(strategy: BackoffStrategy) -> Result<Vec<u8>, SoftHsmError> {
    Err(SoftHsmError::Throttled(ThrottleSignal::with_strategy(
        "slow down",
        strategy,
    )))
}

fn exponential() -> BackoffStrategy {
    BackoffStrategy::Exponential {
        base: Duration::from_millis(10),
        growth_factor: 2,
        max_attempts: 6,
    }
}

fn retry_config(max_attempts: u32, attempt_timeout_ms: u64) -> RetryConfig {
    RetryConfig {
        max_attempts,
        attempt_timeout_ms,
        wait_between_ms: 50,
    }
}

#[test]
fn throttled_n_times_then_succeeds_after_n_plus_one_calls() {
    let (sleeper, delays) = recording_sleeper();
    let script = (0..3).map(|_| throttled(exponential())).collect();
    let decorator = ThrottlingDecorator::with_sleeper(ScriptedService::new(script), sleeper);

    assert_eq!(decorator.sign(&sign_request()).unwrap(), b"signature".to_vec());
    assert_eq!(decorator.inner().calls(), 4);

    let delays = delays.lock().unwrap().clone();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(40)
        ]
    );
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn exhausted_throttling_surfaces_as_crypto_service_error() {
    let (sleeper, delays) = recording_sleeper();
    let strategy = BackoffStrategy::Linear {
        max_attempts: 2,
        delays: vec![Duration::from_millis(5)],
    };
    let script = (0..10).map(|_| throttled(strategy.clone())).collect();
    let service = RetryTimeoutDecorator::new(
        ThrottlingDecorator::with_sleeper(ScriptedService::new(script), sleeper),
        &retry_config(1, 5_000),
    );

    let err = service.sign(&sign_request()).unwrap_err();
    match err {
        SoftHsmError::CryptoService {
            operation, reason, ..
        } => {
            assert_eq!(operation, "sign");
            assert!(reason.contains("service unavailable"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(service.inner().inner().calls(), 3);
    assert_eq!(delays.lock().unwrap().len(), 2);
}

#[test]
fn total_delay_cap_ends_backoff_early() {
    let (sleeper, delays) = recording_sleeper();
    let script = (0..10).map(|_| throttled(exponential())).collect();
    let decorator = ThrottlingDecorator::with_sleeper(ScriptedService::new(script), sleeper)
        .with_max_total_delay(Duration::from_millis(35));

    // 10 + 20 fits, the following 40 would not.
    assert!(matches!(
        decorator.sign(&sign_request()),
        Err(SoftHsmError::ServiceUnavailable(_))
    ));
    assert_eq!(decorator.inner().calls(), 3);
    assert_eq!(
        *delays.lock().unwrap(),
        vec![Duration::from_millis(10), Duration::from_millis(20)]
    );
}

#[test]
fn default_stack_caps_throttling_at_the_attempt_timeout() {
    let config = softhsm::SoftHsmConfig::with_root("root", "p", "s");
    let service =
        softhsm::build_default_service(&config, softhsm::Repositories::in_memory()).unwrap();
    assert_eq!(
        service.inner().max_total_delay(),
        Some(config.retry.attempt_timeout())
    );
}

#[test]
fn no_backoff_gives_up_after_one_call() {
    let (sleeper, delays) = recording_sleeper();
    let decorator = ThrottlingDecorator::with_sleeper(
        ScriptedService::new(vec![throttled(BackoffStrategy::NoBackoff)]),
        sleeper,
    );
    assert!(matches!(
        decorator.sign(&sign_request()),
        Err(SoftHsmError::ServiceUnavailable(_))
    ));
    assert_eq!(decorator.inner().calls(), 1);
    assert!(delays.lock().unwrap().is_empty());
}

#[test]
fn transient_failures_are_retried() {
    let (sleeper, waits) = recording_sleeper();
    let script = vec![
        Err(SoftHsmError::Transient("connection reset".into())),
        Err(SoftHsmError::Transient("connection reset".into())),
    ];
    let service = RetryTimeoutDecorator::new(ScriptedService::new(script), &retry_config(3, 5_000))
        .with_sleeper(sleeper);

    assert!(service.sign(&sign_request()).is_ok());
    assert_eq!(service.inner().calls(), 3);
    assert_eq!(
        *waits.lock().unwrap(),
        vec![Duration::from_millis(50), Duration::from_millis(50)]
    );
}

#[test]
fn retries_stop_at_max_attempts() {
    let (sleeper, _) = recording_sleeper();
    let script = (0..5)
        .map(|_| Err(SoftHsmError::Transient("still down".into())))
        .collect();
    let service = RetryTimeoutDecorator::new(ScriptedService::new(script), &retry_config(3, 5_000))
        .with_sleeper(sleeper);

    let err = service.sign(&sign_request()).unwrap_err();
    assert!(matches!(err, SoftHsmError::CryptoService { .. }));
    assert!(err.to_string().contains("still down"));
    assert_eq!(service.inner().calls(), 3);
}

#[test]
fn slow_attempts_time_out() {
    let (sleeper, _) = recording_sleeper();
    let service = RetryTimeoutDecorator::new(
        ScriptedService::slow(Duration::from_millis(500)),
        &retry_config(2, 20),
    )
    .with_sleeper(sleeper);

    let err = service.sign(&sign_request()).unwrap_err();
    match err {
        SoftHsmError::CryptoService { reason, .. } => assert!(reason.contains("timed out")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn caller_visible_errors_pass_through_unchanged() {
    let cases = vec![
        SoftHsmError::NotFound("signing key 'abc'".into()),
        SoftHsmError::IllegalState("Unable to find parent key 'root'".into()),
        SoftHsmError::BadRequest("alias must not be blank".into()),
        SoftHsmError::Authentication,
    ];
    for expected in cases {
        let (sleeper, waits) = recording_sleeper();
        let service = RetryTimeoutDecorator::new(
            ThrottlingDecorator::new(ScriptedService::new(vec![Err(expected.clone())])),
            &retry_config(3, 5_000),
        )
        .with_sleeper(sleeper);

        let err = service.sign(&sign_request()).unwrap_err();
        assert_eq!(err.to_string(), expected.to_string());
        assert_eq!(service.inner().inner().calls(), 1);
        assert!(waits.lock().unwrap().is_empty());
    }
}

#[test]
fn translated_errors_carry_no_key_bytes_or_payload() {
    let public_key = vec![0xAB; 65];
    let payload = b"secret transaction body";
    let request = SignRequest::new(
        TENANT,
        KeyReference::PublicKey(public_key.clone()),
        payload,
        SignatureSpec::EcdsaSha256,
    );
    let service = RetryTimeoutDecorator::new(
        ScriptedService::new(vec![Err(SoftHsmError::SigningFailure("ring rejected key".into()))]),
        &retry_config(1, 5_000),
    );

    let err = service.sign(&request).unwrap_err();
    let SoftHsmError::CryptoService { arguments, .. } = &err else {
        panic!("unexpected error: {err:?}");
    };
    assert_eq!(arguments["tenant_id"], TENANT);
    assert_eq!(arguments["data_len"], payload.len());

    let rendered = err.to_string();
    assert!(!rendered.contains(&hex::encode(&public_key)));
    assert!(!rendered.contains("secret transaction body"));
}
