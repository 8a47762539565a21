//! Payment webhook classification.
//!
//! Provider payloads are already authenticated upstream; this only decides
//! which intake a payment belongs to and whether its status credits anything.

use serde::{Deserialize, Serialize};

use crate::ledger::TopupSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Donation,
    Subscription,
    Org,
}

impl PaymentKind {
    fn from_hint(hint: &str) -> Option<Self> {
        match hint.trim().to_ascii_lowercase().as_str() {
            "donation" => Some(PaymentKind::Donation),
            "subscription" => Some(PaymentKind::Subscription),
            "org" | "organization" => Some(PaymentKind::Org),
            _ => None,
        }
    }

    /// Top-up origin, or None for a plain donation
    pub fn topup_source(&self) -> Option<TopupSource> {
        match self {
            PaymentKind::Donation => None,
            PaymentKind::Subscription => Some(TopupSource::Subscription),
            PaymentKind::Org => Some(TopupSource::Organization),
        }
    }
}

/// Priority: explicit hint, reference prefix, event type keyword, donation
pub fn classify_payment(
    hint: Option<&str>,
    reference_id: Option<&str>,
    event_type: Option<&str>,
) -> PaymentKind {
    if let Some(kind) = hint.and_then(PaymentKind::from_hint) {
        return kind;
    }

    if let Some(reference) = reference_id.map(|r| r.trim().to_ascii_lowercase()) {
        if reference.starts_with("sub_") {
            return PaymentKind::Subscription;
        }
        if reference.starts_with("org_") {
            return PaymentKind::Org;
        }
        if reference.starts_with("don_") {
            return PaymentKind::Donation;
        }
    }

    if let Some(event) = event_type.map(str::to_ascii_lowercase) {
        if event.contains("subscription") || event.contains("invoice") {
            return PaymentKind::Subscription;
        }
        if event.contains("org") {
            return PaymentKind::Org;
        }
    }

    PaymentKind::Donation
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatusClass {
    Completed,
    Pending,
    Failed,
    Other,
}

impl PaymentStatusClass {
    pub fn from_status(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "completed" | "succeeded" | "paid" | "captured" | "success" => {
                PaymentStatusClass::Completed
            }
            "pending" | "processing" | "requires_action" => PaymentStatusClass::Pending,
            "failed" | "canceled" | "cancelled" | "refunded" => PaymentStatusClass::Failed,
            _ => PaymentStatusClass::Other,
        }
    }

    /// Only completed payments issue credits
    pub fn credits(&self) -> bool {
        matches!(self, PaymentStatusClass::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_beats_everything() {
        assert_eq!(
            classify_payment(Some("Donation"), Some("sub_1"), Some("invoice.paid")),
            PaymentKind::Donation
        );
        assert_eq!(classify_payment(Some("ORG"), None, None), PaymentKind::Org);
    }

    #[test]
    fn test_unknown_hint_falls_through_to_prefix() {
        assert_eq!(
            classify_payment(Some("gift"), Some("sub_9"), None),
            PaymentKind::Subscription
        );
        assert_eq!(classify_payment(None, Some("org_9"), None), PaymentKind::Org);
        assert_eq!(
            classify_payment(None, Some("don_9"), Some("invoice.paid")),
            PaymentKind::Donation
        );
    }

    #[test]
    fn test_event_type_keywords_then_default() {
        assert_eq!(
            classify_payment(None, Some("pi_1"), Some("invoice.payment_succeeded")),
            PaymentKind::Subscription
        );
        assert_eq!(
            classify_payment(None, None, Some("org.funding.completed")),
            PaymentKind::Org
        );
        assert_eq!(
            classify_payment(None, Some("pi_1"), Some("checkout.completed")),
            PaymentKind::Donation
        );
        assert_eq!(classify_payment(None, None, None), PaymentKind::Donation);
    }

    #[test]
    fn test_status_classes() {
        assert!(PaymentStatusClass::from_status("Succeeded").credits());
        assert_eq!(PaymentStatusClass::from_status("requires_action"), PaymentStatusClass::Pending);
        assert_eq!(PaymentStatusClass::from_status("cancelled"), PaymentStatusClass::Failed);
        assert_eq!(PaymentStatusClass::from_status("disputed"), PaymentStatusClass::Other);
        assert!(!PaymentStatusClass::from_status("pending").credits());
    }
}
