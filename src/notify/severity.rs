use crate::alert::{AlertRequest, Severity};
use crate::api::models::Notification;

/// Static category table. Unknown or missing categories are informational.
pub fn severity_for(category: Option<&str>) -> Severity {
    let Some(category) = category else {
        return Severity::Info;
    };
    match category.trim().to_ascii_lowercase().as_str() {
        "payment" | "payment_completed" => Severity::Success,
        "emergency" | "emergency_request" => Severity::Error,
        "document_verification" | "booking_cancelled" | "complaint" => Severity::Warning,
        _ => Severity::Info,
    }
}

pub fn alert_for(notification: &Notification) -> AlertRequest {
    AlertRequest::new(
        severity_for(notification.notification_type.as_deref()),
        notification.alert_text(),
    )
    .with_source(notification.id.clone())
}
