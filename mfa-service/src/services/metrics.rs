use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub static VERIFICATION_ATTEMPTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Refused before the engine ran. Success and failure use
/// `VerificationOutcome::as_label`.
pub const OUTCOME_DENIED: &str = "denied";

pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let attempts_total = IntCounterVec::new(
        Opts::new(
            "mfa_verification_attempts_total",
            "Second-factor verification attempts by provider and outcome",
        ),
        &["provider", "outcome"],
    )?;

    registry.register(Box::new(attempts_total.clone()))?;

    // Initialize globals
    let _ = REGISTRY.set(registry);
    let _ = VERIFICATION_ATTEMPTS_TOTAL.set(attempts_total);
    Ok(())
}

/// No-op until `init_metrics` ran, so tests need no registry.
pub fn record_attempt(provider: &str, outcome: &str) {
    if let Some(counter) = VERIFICATION_ATTEMPTS_TOTAL.get() {
        counter.with_label_values(&[provider, outcome]).inc();
    }
}

pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    let metric_families = registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to convert metrics to UTF-8: {}", e);
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}
