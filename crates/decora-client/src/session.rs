//! Authenticated myLeviton session

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::error::{DecoraError, DecoraResult};
use crate::models::{IotSwitch, LoginResponse, Residence, ResidentialPermission};

pub const DEFAULT_BASE_URL: &str = "https://my.leviton.com/api";

const CLIENT_ID: &str = "levdb-echo-proto";
const REGISTERED_VIA: &str = "myLeviton";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations the integration needs from myLeviton
#[async_trait]
pub trait DecoraApi: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> DecoraResult<LoginResponse>;

    /// End the session; the token is forgotten even if the request fails
    async fn logout(&self) -> DecoraResult<()>;

    async fn is_authenticated(&self) -> bool;

    /// Forget the token without talking to the cloud
    async fn clear_session(&self);

    async fn residential_permissions(&self) -> DecoraResult<Vec<ResidentialPermission>>;

    async fn account_residences(&self, account_id: &str) -> DecoraResult<Vec<Residence>>;

    async fn residence_switches(&self, residence_id: &str) -> DecoraResult<Vec<IotSwitch>>;

    async fn refresh_switch(&self, switch_id: &str) -> DecoraResult<IotSwitch>;

    async fn update_switch(
        &self,
        switch_id: &str,
        attributes: Map<String, Value>,
    ) -> DecoraResult<IotSwitch>;

    /// Every switch reachable through the user's residential permissions
    ///
    /// Account permissions expand to all residences of the account; residence
    /// permissions to that single residence.
    async fn discover_switches(&self) -> DecoraResult<Vec<IotSwitch>> {
        let mut switches = Vec::new();
        for permission in self.residential_permissions().await? {
            if let Some(ref account_id) = permission.residential_account_id {
                for residence in self.account_residences(account_id).await? {
                    switches.extend(self.residence_switches(&residence.id).await?);
                }
            } else if let Some(ref residence_id) = permission.residence_id {
                switches.extend(self.residence_switches(residence_id).await?);
            }
        }
        Ok(switches)
    }
}

#[derive(Debug, Clone)]
struct Auth {
    token: String,
    user_id: String,
}

/// reqwest-backed [`DecoraApi`]
pub struct DecoraSession {
    client: Client,
    base_url: String,
    auth: RwLock<Option<Auth>>,
}

impl DecoraSession {
    pub fn new() -> DecoraResult<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> DecoraResult<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn auth(&self) -> DecoraResult<Auth> {
        self.auth.read().await.clone().ok_or(DecoraError::NotAuthenticated)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> DecoraResult<String> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "myLeviton request");

        let mut request = self.client.request(method, &url);
        if let Some(token) = token {
            request = request.header("authorization", token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            debug!(status = status.as_u16(), body = %text, "myLeviton error response");
            return Err(DecoraError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }

    async fn authed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> DecoraResult<T> {
        let auth = self.auth().await?;
        let text = self.send(method, path, body, Some(&auth.token)).await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl DecoraApi for DecoraSession {
    #[instrument(skip(self, password))]
    async fn login(&self, email: &str, password: &str) -> DecoraResult<LoginResponse> {
        let payload = json!({
            "email": email,
            "password": password,
            "clientId": CLIENT_ID,
            "registeredVia": REGISTERED_VIA,
        });

        let text = match self
            .send(Method::POST, "/Person/login?include=user", Some(&payload), None)
            .await
        {
            Ok(text) => text,
            Err(DecoraError::Status { status, .. })
                if status == StatusCode::UNAUTHORIZED.as_u16()
                    || status == StatusCode::FORBIDDEN.as_u16() =>
            {
                return Err(DecoraError::InvalidAuth);
            }
            Err(err) => return Err(err),
        };

        let login: LoginResponse = serde_json::from_str(&text)?;
        *self.auth.write().await = Some(Auth {
            token: login.id.clone(),
            user_id: login.user_id.clone(),
        });
        info!(user_id = %login.user_id, "Logged in to myLeviton");
        Ok(login)
    }

    async fn logout(&self) -> DecoraResult<()> {
        let auth = self.auth.write().await.take();
        let Some(auth) = auth else {
            return Ok(());
        };
        match self
            .send(Method::POST, "/Person/logout", None, Some(&auth.token))
            .await
        {
            Ok(_) => {
                debug!("Logged out of myLeviton");
                Ok(())
            }
            Err(err) => {
                warn!(%err, "myLeviton logout failed");
                Err(err)
            }
        }
    }

    async fn is_authenticated(&self) -> bool {
        self.auth.read().await.is_some()
    }

    async fn clear_session(&self) {
        *self.auth.write().await = None;
    }

    async fn residential_permissions(&self) -> DecoraResult<Vec<ResidentialPermission>> {
        let auth = self.auth().await?;
        self.authed(
            Method::GET,
            &format!("/Person/{}/residentialPermissions", auth.user_id),
            None,
        )
        .await
    }

    async fn account_residences(&self, account_id: &str) -> DecoraResult<Vec<Residence>> {
        self.authed(
            Method::GET,
            &format!("/ResidentialAccounts/{}/residences", account_id),
            None,
        )
        .await
    }

    async fn residence_switches(&self, residence_id: &str) -> DecoraResult<Vec<IotSwitch>> {
        self.authed(
            Method::GET,
            &format!("/Residences/{}/iotSwitches", residence_id),
            None,
        )
        .await
    }

    async fn refresh_switch(&self, switch_id: &str) -> DecoraResult<IotSwitch> {
        self.authed(Method::GET, &format!("/IotSwitches/{}", switch_id), None)
            .await
    }

    #[instrument(skip(self))]
    async fn update_switch(
        &self,
        switch_id: &str,
        attributes: Map<String, Value>,
    ) -> DecoraResult<IotSwitch> {
        let body = Value::Object(attributes);
        self.authed(Method::PUT, &format!("/IotSwitches/{}", switch_id), Some(&body))
            .await
    }
}
