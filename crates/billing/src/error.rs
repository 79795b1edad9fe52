use thiserror::Error;

use waypost_core::DomainError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BillingError {
    #[error("metric '{0}' has no price on the tenant plan")]
    MetricNotPriced(String),

    #[error("malformed provider event: {0}")]
    MalformedEvent(String),

    #[error("no subscription with provider id '{0}'")]
    SubscriptionNotFound(String),

    #[error("no booking payment with provider reference '{0}'")]
    PaymentNotFound(String),

    #[error("no billing plan for tenant")]
    PlanNotFound,

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl BillingError {
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::MetricNotPriced(_) => "METRIC_NOT_PRICED",
            BillingError::MalformedEvent(_) => "MALFORMED_PROVIDER_EVENT",
            BillingError::SubscriptionNotFound(_) => "SUBSCRIPTION_NOT_FOUND",
            BillingError::PaymentNotFound(_) => "PAYMENT_NOT_FOUND",
            BillingError::PlanNotFound => "PLAN_NOT_FOUND",
            BillingError::Domain(_) => "VALIDATION_FAILED",
        }
    }
}
