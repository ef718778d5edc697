use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Client, RequestBuilder, Response,
};
use serde::de::DeserializeOwned;
use shared::{
    domain::{GroupId, UserId},
    error::ApiError,
    protocol::{ConversationSummaryPayload, MessagePayload, SendMessageRequest},
};

use crate::types::{OutgoingMessage, SessionCredentials};

/// REST collaborator that owns conversation and history snapshots.
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    async fn conversations(
        &self,
        session: &SessionCredentials,
    ) -> Result<Vec<ConversationSummaryPayload>>;
    async fn chat_history(
        &self,
        session: &SessionCredentials,
        peer_id: UserId,
    ) -> Result<Vec<MessagePayload>>;
    async fn group_chat_history(
        &self,
        session: &SessionCredentials,
        group_id: GroupId,
    ) -> Result<Vec<MessagePayload>>;
    async fn send_message(
        &self,
        session: &SessionCredentials,
        message: OutgoingMessage,
    ) -> Result<MessagePayload>;
}

pub struct HttpConversationBackend {
    http: Client,
    base_url: String,
}

impl HttpConversationBackend {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, builder: RequestBuilder, session: &SessionCredentials) -> RequestBuilder {
        builder.bearer_auth(&session.auth_token)
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .with_context(|| format!("failed to decode {status} response body"));
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(anyhow!("backend returned {status}: {api_error}")),
        Err(_) if body.trim().is_empty() => Err(anyhow!("backend returned {status}")),
        Err(_) => Err(anyhow!("backend returned {status}: {}", body.trim())),
    }
}

#[async_trait]
impl ConversationBackend for HttpConversationBackend {
    async fn conversations(
        &self,
        session: &SessionCredentials,
    ) -> Result<Vec<ConversationSummaryPayload>> {
        let request = self
            .http
            .get(self.url("/conversations"))
            .query(&[("user_id", session.user_id.0)]);
        let response = self.authorized(request, session).send().await?;
        read_json(response).await
    }

    async fn chat_history(
        &self,
        session: &SessionCredentials,
        peer_id: UserId,
    ) -> Result<Vec<MessagePayload>> {
        let request = self.http.get(self.url(&format!(
            "/messages/{}/{}",
            session.user_id.0, peer_id.0
        )));
        let response = self.authorized(request, session).send().await?;
        read_json(response).await
    }

    async fn group_chat_history(
        &self,
        session: &SessionCredentials,
        group_id: GroupId,
    ) -> Result<Vec<MessagePayload>> {
        let request = self
            .http
            .get(self.url(&format!("/groups/{}/messages", group_id.0)));
        let response = self.authorized(request, session).send().await?;
        read_json(response).await
    }

    async fn send_message(
        &self,
        session: &SessionCredentials,
        message: OutgoingMessage,
    ) -> Result<MessagePayload> {
        let mut body = SendMessageRequest::new(session.user_id, message.channel, message.content);
        if let Some(target) = message.referral_target_user_id {
            body.is_referral = true;
            body.referral_target_user_id = Some(target);
        }

        let request = self.http.post(self.url("/messages"));
        let request = if message.attachments.is_empty() {
            request.json(&body)
        } else {
            request.multipart(multipart_form(&body, message.attachments)?)
        };
        let response = self.authorized(request, session).send().await?;
        read_json(response).await
    }
}

fn multipart_form(
    body: &SendMessageRequest,
    attachments: Vec<crate::types::AttachmentUpload>,
) -> Result<Form> {
    let mut form = Form::new()
        .text("sender_id", body.sender_id.0.to_string())
        .text("content", body.content.clone())
        .text("is_referral", body.is_referral.to_string());
    if let Some(receiver_id) = body.receiver_id {
        form = form.text("receiver_id", receiver_id.0.to_string());
    }
    if let Some(group_id) = body.group_id {
        form = form.text("group_id", group_id.0.to_string());
    }
    if let Some(target) = body.referral_target_user_id {
        form = form.text("referral_target_user_id", target.0.to_string());
    }
    for attachment in attachments {
        let mut part = Part::bytes(attachment.bytes).file_name(attachment.file_name.clone());
        if let Some(mime_type) = attachment.mime_type.as_deref() {
            part = part
                .mime_str(mime_type)
                .with_context(|| format!("invalid mime type for '{}'", attachment.file_name))?;
        }
        form = form.part("attachments", part);
    }
    Ok(form)
}

#[cfg(test)]
#[path = "tests/protocol_client_tests.rs"]
mod tests;
