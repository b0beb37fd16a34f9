//! Incident-management API client.
//!
//! A bearer-authenticated JSON:API-style client. Outbound calls retry on
//! 5xx responses and transport failures with bounded exponential backoff;
//! client errors (4xx) are returned to the caller unretried. Posting a
//! timeline note never fails the caller — note failures are logged and
//! swallowed, since a reporting problem must not abort the flow that
//! produced the report.
//!
//! The mirror/ready signal is a token written into a designated custom
//! field, consumed by external waiters: update the existing field
//! selection, create one if absent, and fall back to a whole-incident
//! custom-field patch by slug.

use reqwest::Method;
use serde_json::{Value, json};
use ulid::Ulid;

use crate::config::IncidentConfig;
use crate::error::Result;
use crate::metrics::EngineMetrics;

/// Client for the incident-management API.
#[derive(Clone)]
pub struct IncidentClient {
    http: reqwest::Client,
    config: IncidentConfig,
    metrics: EngineMetrics,
}

impl IncidentClient {
    /// Creates a client over a shared HTTP connection pool.
    #[must_use]
    pub fn new(http: reqwest::Client, config: IncidentConfig) -> Self {
        if config.api_token.is_empty() {
            tracing::warn!("incident API token missing; requests may fail");
        }
        Self {
            http,
            config,
            metrics: EngineMetrics::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// Issues one API call with retry on 5xx and transport errors.
    ///
    /// Returns the final response whatever its status; callers decide how
    /// to treat non-2xx outcomes.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let url = self.url(path);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let mut builder = self
                .http
                .request(method.clone(), &url)
                .timeout(self.config.timeout)
                .bearer_auth(&self.config.api_token)
                .header(reqwest::header::CONTENT_TYPE, "application/vnd.api+json")
                .header(reqwest::header::ACCEPT, "application/vnd.api+json");
            if !query.is_empty() {
                builder = builder.query(query);
            }
            if let Some(body) = body {
                builder = builder.json(body);
            }

            match builder.send().await {
                Ok(response) if response.status().is_server_error() => {
                    tracing::warn!(
                        path = %path,
                        status = %response.status(),
                        attempt,
                        "incident API 5xx",
                    );
                    if attempt >= self.config.max_attempts {
                        return Ok(response);
                    }
                }
                Ok(response) => {
                    tracing::debug!(path = %path, status = %response.status(), attempt, "incident API response");
                    return Ok(response);
                }
                Err(err) => {
                    tracing::warn!(path = %path, error = %err, attempt, "incident API transport error");
                    if attempt >= self.config.max_attempts {
                        return Err(err.into());
                    }
                }
            }

            let backoff = self
                .config
                .retry_backoff
                .saturating_mul(2_u32.saturating_pow(attempt - 1));
            tokio::time::sleep(backoff).await;
        }
    }

    /// Posts an internal timeline note onto the incident.
    ///
    /// Never fails: non-2xx outcomes and transport errors are logged and
    /// swallowed.
    pub async fn post_timeline_note(&self, incident_id: &str, message: &str) {
        let payload = json!({
            "data": {
                "type": "incident_events",
                "attributes": {"event": message, "visibility": "internal"},
            },
        });
        let path = format!("/v1/incidents/{incident_id}/events");
        match self.request(Method::POST, &path, &[], Some(&payload)).await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(incident_id = %incident_id, size = message.len(), "timeline note posted");
                self.metrics.record_note();
            }
            Ok(response) => {
                tracing::warn!(incident_id = %incident_id, status = %response.status(), "timeline note rejected");
            }
            Err(err) => {
                tracing::warn!(incident_id = %incident_id, error = %err, "timeline note failed");
            }
        }
    }

    /// Discovers a custom field's id by its display name.
    pub async fn discover_field_id(&self, field_name: &str) -> Option<String> {
        let result = self
            .request(
                Method::GET,
                "/v1/form_fields",
                &[("filter[name]", field_name), ("filter[targetable_type]", "Incident")],
                None,
            )
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                let parsed: Value = response.json().await.ok()?;
                let id = parsed
                    .get("data")
                    .and_then(Value::as_array)
                    .and_then(|data| data.first())
                    .and_then(|field| field.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                tracing::debug!(field_name = %field_name, found = id.is_some(), "field id discovery");
                id
            }
            Ok(response) => {
                tracing::warn!(field_name = %field_name, status = %response.status(), "field discovery non-2xx");
                None
            }
            Err(err) => {
                tracing::warn!(field_name = %field_name, error = %err, "field discovery error");
                None
            }
        }
    }

    /// Fetches a custom field's slug, honoring a configured override.
    pub async fn field_slug(&self, field_id: &str) -> Option<String> {
        if let Some(slug) = &self.config.mirror.field_slug {
            return Some(slug.clone());
        }
        let path = format!("/v1/form_fields/{field_id}");
        let result = self
            .request(Method::GET, &path, &[("fields[form_fields]", "slug,name")], None)
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                let parsed: Value = response.json().await.ok()?;
                parsed
                    .get("data")
                    .and_then(|data| data.get("attributes"))
                    .and_then(|attrs| attrs.get("slug"))
                    .and_then(Value::as_str)
                    .filter(|slug| !slug.is_empty())
                    .map(str::to_string)
            }
            Ok(response) => {
                tracing::warn!(field_id = %field_id, status = %response.status(), "slug lookup non-2xx");
                None
            }
            Err(err) => {
                tracing::warn!(field_id = %field_id, error = %err, "slug lookup error");
                None
            }
        }
    }

    /// Finds the incident's existing selection for a field, if any.
    pub async fn find_selection(&self, incident_id: &str, field_id: &str) -> Option<String> {
        let path = format!("/v1/incidents/{incident_id}/form_field_selections");
        let result = self
            .request(
                Method::GET,
                &path,
                &[
                    ("filter[form_field_id]", field_id),
                    ("page[size]", "50"),
                    ("fields[incident_form_field_selections]", "id,attributes"),
                ],
                None,
            )
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                let parsed: Value = response.json().await.ok()?;
                parsed
                    .get("data")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .find(|item| {
                        item.get("attributes")
                            .and_then(|attrs| attrs.get("form_field_id"))
                            .and_then(Value::as_str)
                            == Some(field_id)
                    })
                    .and_then(|item| item.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }
            Ok(response) => {
                tracing::warn!(incident_id = %incident_id, status = %response.status(), "list selections non-2xx");
                None
            }
            Err(err) => {
                tracing::warn!(incident_id = %incident_id, error = %err, "list selections error");
                None
            }
        }
    }

    /// Updates an existing field selection's value.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails at the transport level after
    /// retries.
    pub async fn update_selection(&self, selection_id: &str, value: &str) -> Result<u16> {
        let payload = json!({
            "data": {
                "type": "incident_form_field_selections",
                "id": selection_id,
                "attributes": {"value": value},
            },
        });
        let path = format!("/v1/incident_form_field_selections/{selection_id}");
        let response = self.request(Method::PATCH, &path, &[], Some(&payload)).await?;
        Ok(response.status().as_u16())
    }

    /// Creates a field selection on the incident.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails at the transport level after
    /// retries.
    pub async fn create_selection(
        &self,
        incident_id: &str,
        field_id: &str,
        value: &str,
    ) -> Result<u16> {
        let payload = json!({
            "data": {
                "type": "incident_form_field_selections",
                "attributes": {"value": value, "form_field_id": field_id},
            },
        });
        let path = format!("/v1/incidents/{incident_id}/form_field_selections");
        let response = self.request(Method::POST, &path, &[], Some(&payload)).await?;
        Ok(response.status().as_u16())
    }

    /// Fallback: patches the incident's custom fields by slug.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails at the transport level after
    /// retries.
    pub async fn patch_custom_field(
        &self,
        incident_id: &str,
        slug: &str,
        value: &str,
    ) -> Result<u16> {
        if slug.is_empty() {
            tracing::warn!(incident_id = %incident_id, "custom-field patch called with empty slug");
            return Ok(0);
        }
        let payload = json!({
            "data": {
                "type": "incidents",
                "id": incident_id,
                "attributes": {"custom_fields": {slug: value}},
            },
        });
        let path = format!("/v1/incidents/{incident_id}");
        let response = self.request(Method::PATCH, &path, &[], Some(&payload)).await?;
        Ok(response.status().as_u16())
    }

    /// Generates a fresh mirror token, optionally suffixed with a tag.
    fn mirror_token(&self, tag: &str) -> String {
        let core = Ulid::new().to_string().to_lowercase();
        let prefix = &self.config.mirror.token_prefix;
        if tag.is_empty() {
            format!("{prefix}_{core}")
        } else {
            format!("{prefix}_{core}_{tag}")
        }
    }

    /// Writes the mirror/ready token onto the incident.
    ///
    /// Resolution order: update the existing field selection, create one if
    /// absent, then fall back to a whole-incident custom-field patch by
    /// slug. Returns true if any of those landed. Failures post a warning
    /// note (best effort) and return false; they never propagate.
    pub async fn set_mirror_ready(&self, incident_id: &str, tag: &str) -> bool {
        let written = match self.write_mirror_token(incident_id, tag).await {
            Ok(written) => written,
            Err(err) => {
                tracing::warn!(incident_id = %incident_id, error = %err, "mirror token write error");
                self.post_timeline_note(
                    incident_id,
                    &format!(":warning: Mirror token write error: {err}"),
                )
                .await;
                false
            }
        };
        self.metrics
            .record_mirror(if written { "written" } else { "failed" });
        written
    }

    async fn write_mirror_token(&self, incident_id: &str, tag: &str) -> Result<bool> {
        let field_id = match &self.config.mirror.field_id {
            Some(id) => Some(id.clone()),
            None => self.discover_field_id(&self.config.mirror.field_name).await,
        };
        let Some(field_id) = field_id else {
            tracing::warn!(incident_id = %incident_id, "mirror field id missing; aborting");
            self.post_timeline_note(
                incident_id,
                ":warning: Mirror token aborted: custom field id could not be determined.",
            )
            .await;
            return Ok(false);
        };

        let token = self.mirror_token(tag);
        let status = match self.find_selection(incident_id, &field_id).await {
            Some(selection_id) => self.update_selection(&selection_id, &token).await?,
            None => self.create_selection(incident_id, &field_id, &token).await?,
        };
        if (200..300).contains(&status) {
            tracing::debug!(incident_id = %incident_id, "mirror token written via selection");
            return Ok(true);
        }

        let Some(slug) = self.field_slug(&field_id).await else {
            tracing::warn!(incident_id = %incident_id, "mirror fallback skipped; slug not available");
            return Ok(false);
        };
        let status = self.patch_custom_field(incident_id, &slug, &token).await?;
        Ok((200..300).contains(&status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IncidentConfig;

    #[test]
    fn mirror_tokens_are_prefixed_and_tagged() {
        let client = IncidentClient::new(reqwest::Client::new(), IncidentConfig::default());
        let bare = client.mirror_token("");
        let tagged = client.mirror_token("exec-7");
        assert!(bare.starts_with("mrr_"));
        assert!(tagged.starts_with("mrr_"));
        assert!(tagged.ends_with("_exec-7"));
        assert_ne!(client.mirror_token(""), bare);
    }

    #[test]
    fn url_joins_without_double_slash() {
        let mut config = IncidentConfig::default();
        config.base_url = "https://api.example.com/".into();
        let client = IncidentClient::new(reqwest::Client::new(), config);
        assert_eq!(client.url("/v1/incidents/i/events"), "https://api.example.com/v1/incidents/i/events");
    }
}
