use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::models::{ChatHistory, CreatedMessage, NotificationPage};
use super::{ApiFuture, MarketplaceApi, Notification, SendChatRequest, WireChatMessage};
use crate::core::{RealtimeError, RealtimeResult, Session};

const MAX_ERROR_BODY: usize = 256;

/// reqwest-backed [`MarketplaceApi`].
#[derive(Clone, Debug)]
pub struct HttpMarketplaceApi {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpMarketplaceApi {
    pub fn new(base_url: &str, timeout: Duration) -> RealtimeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RealtimeError::InvalidConfig(format!("http client: {e}")))?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> RealtimeResult<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| RealtimeError::InvalidConfig(format!("api base url {base_url}: {e}")))?;
        // `Url::join` replaces the last segment unless the base ends with a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, session: &Session, tail: &str) -> RealtimeResult<Url> {
        let relative = format!("{}/{tail}", session.role.path_segment());
        self.base_url
            .join(&relative)
            .map_err(|e| RealtimeError::InvalidConfig(format!("endpoint {relative}: {e}")))
    }

    fn chat_endpoint(&self, session: &Session, booking_id: &str) -> RealtimeResult<Url> {
        let mut url = self.endpoint(session, "bookings")?;
        url.path_segments_mut()
            .map_err(|_| RealtimeError::InvalidConfig("api base url cannot be a base".into()))?
            .push(booking_id)
            .push("chat");
        Ok(url)
    }
}

async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
    fail: impl Fn(String) -> RealtimeError,
) -> RealtimeResult<T> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| fail(format!("read body: {e}")))?;
    if !status.is_success() {
        let text = String::from_utf8_lossy(&body);
        let snippet: String = text.chars().take(MAX_ERROR_BODY).collect();
        return Err(fail(format!("status {}: {snippet}", status.as_u16())));
    }
    sonic_rs::from_slice(&body).map_err(|e| fail(format!("decode: {e}")))
}

impl MarketplaceApi for HttpMarketplaceApi {
    fn fetch_notifications(
        &self,
        session: &Session,
        page: u32,
        limit: u32,
    ) -> ApiFuture<Vec<Notification>> {
        let client = self.client.clone();
        let token = session.token.clone();
        let url = self.endpoint(session, "notifications");
        Box::pin(async move {
            let mut url = url?;
            url.query_pairs_mut()
                .append_pair("page", &page.to_string())
                .append_pair("limit", &limit.to_string());
            let endpoint = url.path().to_string();
            let fail = |error: String| RealtimeError::PollFailure {
                endpoint: endpoint.clone(),
                error,
            };
            debug!(endpoint = %url.path(), page, limit, "fetching notifications");
            let response = client
                .get(url.clone())
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| fail(e.to_string()))?;
            let page: NotificationPage = read_json(response, fail).await?;
            Ok(page.notifications)
        })
    }

    fn fetch_chat(&self, session: &Session, booking_id: &str) -> ApiFuture<Vec<WireChatMessage>> {
        let client = self.client.clone();
        let token = session.token.clone();
        let url = self.chat_endpoint(session, booking_id);
        Box::pin(async move {
            let url = url?;
            let endpoint = url.path().to_string();
            let fail = |error: String| RealtimeError::PollFailure {
                endpoint: endpoint.clone(),
                error,
            };
            let response = client
                .get(url.clone())
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| fail(e.to_string()))?;
            let history: ChatHistory = read_json(response, fail).await?;
            Ok(history.messages)
        })
    }

    fn send_chat(
        &self,
        session: &Session,
        booking_id: &str,
        request: SendChatRequest,
    ) -> ApiFuture<WireChatMessage> {
        let client = self.client.clone();
        let token = session.token.clone();
        let url = self.chat_endpoint(session, booking_id);
        Box::pin(async move {
            let url = url?;
            let fail = |message: String| RealtimeError::SendFailure { message };
            let body = sonic_rs::to_string(&request).map_err(|e| fail(format!("encode: {e}")))?;
            let response = client
                .post(url)
                .bearer_auth(&token)
                .header(CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .map_err(|e| fail(e.to_string()))?;
            let created: CreatedMessage = read_json(response, fail).await?;
            Ok(created.into_inner())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Role;

    #[test]
    fn endpoints_use_role_segment_and_tolerate_missing_slash() {
        let api = HttpMarketplaceApi::new("https://api.example.com/v1", Duration::from_secs(5))
            .unwrap();
        let customer = Session::new("t", "u", Role::Customer);
        let servicer = Session::new("t", "u", Role::Servicer);

        assert_eq!(
            api.endpoint(&customer, "notifications").unwrap().as_str(),
            "https://api.example.com/v1/customer/notifications"
        );
        assert_eq!(
            api.chat_endpoint(&servicer, "b 1").unwrap().as_str(),
            "https://api.example.com/v1/servicer/bookings/b%201/chat"
        );
    }

    #[test]
    fn invalid_base_url_is_config_error() {
        assert!(matches!(
            HttpMarketplaceApi::new("not a url", Duration::from_secs(1)),
            Err(RealtimeError::InvalidConfig(_))
        ));
    }
}
