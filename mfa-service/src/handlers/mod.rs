pub mod metrics;
pub mod mfa;
