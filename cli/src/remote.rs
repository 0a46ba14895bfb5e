use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{RequestBuilder, Response, StatusCode};

use crate::config::RemoteConfig;
use recipetuner_core::error::RemoteError;
use recipetuner_core::remote::{RemotePreferences, RemoteRecipe, RemoteStore};

const PREFERENCES_TABLE: &str = "user_preferences";
const RECIPES_TABLE: &str = "recipes";

/// Row store behind a PostgREST-style HTTP API.
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.api_key).context("Invalid remote API key")?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .context("Invalid remote API key")?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .user_agent(format!("recipetuner-cli/{}", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.url.clone(),
        })
    }

    fn table(&self, name: &str) -> String {
        format!("{}/{name}", self.base_url)
    }

    /// Merges into an existing row with the same `client_id` (unique on the
    /// server), so replaying an insert whose reply was lost is harmless.
    fn upsert_recipe_request(&self, recipe: &RemoteRecipe) -> RequestBuilder {
        self.client
            .post(self.table(RECIPES_TABLE))
            .query(&[("on_conflict", "client_id")])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&[recipe])
    }

    fn delete_recipe_request(
        &self,
        user_id: &str,
        client_id: &str,
        remote_id: Option<&str>,
    ) -> RequestBuilder {
        let target = match remote_id {
            Some(remote_id) => ("id", format!("eq.{remote_id}")),
            None => ("client_id", format!("eq.{client_id}")),
        };
        self.client
            .delete(self.table(RECIPES_TABLE))
            .query(&[("user_id", format!("eq.{user_id}")), target])
            .header("Prefer", "return=minimal")
    }
}

fn transport_error(err: &reqwest::Error) -> RemoteError {
    if err.is_decode() {
        RemoteError::Rejected(format!("unexpected response body: {err}"))
    } else {
        RemoteError::Unavailable(err.to_string())
    }
}

/// Client errors are the server refusing the request; everything else may
/// succeed later.
fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let message = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.trim())
    };
    let retryable = matches!(
        status,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
    );
    if status.is_client_error() && !retryable {
        RemoteError::Rejected(message)
    } else {
        RemoteError::Unavailable(message)
    }
}

async fn check(resp: Response) -> Result<Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

impl RemoteStore for HttpRemote {
    async fn get_preferences(
        &self,
        user_id: &str,
    ) -> Result<Option<RemotePreferences>, RemoteError> {
        let resp = self
            .client
            .get(self.table(PREFERENCES_TABLE))
            .query(&[("user_id", format!("eq.{user_id}")), ("select", "*".into())])
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        let rows: Vec<RemotePreferences> = check(resp)
            .await?
            .json()
            .await
            .map_err(|e| transport_error(&e))?;
        Ok(rows.into_iter().next())
    }

    async fn upsert_preferences(
        &self,
        user_id: &str,
        prefs: &RemotePreferences,
    ) -> Result<(), RemoteError> {
        if prefs.user_id != user_id {
            return Err(RemoteError::Rejected(
                "preferences belong to a different user".to_string(),
            ));
        }
        let resp = self
            .client
            .post(self.table(PREFERENCES_TABLE))
            .query(&[("on_conflict", "user_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[prefs])
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        check(resp).await?;
        Ok(())
    }

    async fn list_recipes(&self, user_id: &str) -> Result<Vec<RemoteRecipe>, RemoteError> {
        let resp = self
            .client
            .get(self.table(RECIPES_TABLE))
            .query(&[
                ("user_id", format!("eq.{user_id}")),
                ("select", "*".into()),
                ("order", "created_at.asc".into()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        check(resp)
            .await?
            .json()
            .await
            .map_err(|e| transport_error(&e))
    }

    async fn upsert_recipe(
        &self,
        _user_id: &str,
        recipe: &RemoteRecipe,
    ) -> Result<String, RemoteError> {
        let resp = self
            .upsert_recipe_request(recipe)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        let rows: Vec<RemoteRecipe> = check(resp)
            .await?
            .json()
            .await
            .map_err(|e| transport_error(&e))?;
        rows.into_iter()
            .next()
            .and_then(|row| row.id)
            .ok_or_else(|| RemoteError::Rejected("upsert returned no row id".to_string()))
    }

    async fn update_recipe(
        &self,
        remote_id: &str,
        recipe: &RemoteRecipe,
    ) -> Result<(), RemoteError> {
        let resp = self
            .client
            .patch(self.table(RECIPES_TABLE))
            .query(&[("id", format!("eq.{remote_id}"))])
            .header("Prefer", "return=minimal")
            .json(recipe)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        check(resp).await?;
        Ok(())
    }

    async fn delete_recipe(
        &self,
        user_id: &str,
        client_id: &str,
        remote_id: Option<&str>,
    ) -> Result<(), RemoteError> {
        let resp = self
            .delete_recipe_request(user_id, client_id, remote_id)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        check(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(url: &str) -> HttpRemote {
        HttpRemote::new(&RemoteConfig {
            url: url.to_string(),
            api_key: "anon-key".to_string(),
            timeout: Duration::from_secs(10),
        })
        .unwrap()
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "JWT expired"),
            RemoteError::Rejected(m) if m.contains("JWT expired")
        ));
        assert!(matches!(
            status_error(StatusCode::CONFLICT, ""),
            RemoteError::Rejected(_)
        ));
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, ""),
            RemoteError::Unavailable(_)
        ));
        assert!(matches!(
            status_error(StatusCode::SERVICE_UNAVAILABLE, "maintenance"),
            RemoteError::Unavailable(_)
        ));
    }

    #[test]
    fn test_table_urls() {
        let r = remote("https://db.example.com/rest/v1");
        assert_eq!(
            r.table(RECIPES_TABLE),
            "https://db.example.com/rest/v1/recipes"
        );
    }

    fn sample_recipe() -> RemoteRecipe {
        serde_json::from_value(serde_json::json!({
            "client_id": "c-1",
            "user_id": "u1",
            "title": "Ramen",
            "created_at": "2025-03-01T10:00:00Z",
            "updated_at": "2025-03-01T10:00:00Z"
        }))
        .unwrap()
    }

    #[test]
    fn test_recipe_upsert_merges_on_client_id() {
        let r = remote("https://db.example.com/rest/v1");
        let req = r.upsert_recipe_request(&sample_recipe()).build().unwrap();

        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(req.url().query(), Some("on_conflict=client_id"));
        assert_eq!(
            req.headers()["Prefer"],
            "resolution=merge-duplicates,return=representation"
        );
        let body: serde_json::Value =
            serde_json::from_slice(req.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body[0]["client_id"], "c-1");
        assert!(body[0].get("id").is_none());
    }

    #[test]
    fn test_recipe_delete_targets_one_row() {
        let r = remote("https://db.example.com/rest/v1");
        let by_remote = r.delete_recipe_request("u1", "c-1", Some("17")).build().unwrap();
        assert_eq!(by_remote.method(), reqwest::Method::DELETE);
        assert_eq!(by_remote.url().query(), Some("user_id=eq.u1&id=eq.17"));

        let by_client = r.delete_recipe_request("u1", "c-1", None).build().unwrap();
        assert_eq!(by_client.url().query(), Some("user_id=eq.u1&client_id=eq.c-1"));
    }

    #[test]
    fn test_invalid_key_rejected() {
        let config = RemoteConfig {
            url: "https://db.example.com".to_string(),
            api_key: "bad\nkey".to_string(),
            timeout: Duration::from_secs(10),
        };
        assert!(HttpRemote::new(&config).is_err());
    }
}
