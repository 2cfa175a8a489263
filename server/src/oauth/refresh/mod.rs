//! Token refresh and sign-out
//!
//! Refreshes of one DID are serialized behind a per-DID mutex. A caller that
//! waited on the mutex reloads the session first and reuses whatever the
//! previous holder stored, so a refresh token is only ever spent once.
//!
//! Any failed refresh discards the session and answers `SessionExpired`, so the
//! caller always learns it has to send the user through sign-in again.

use reqwest::Method;
use tracing::{info, warn};

use super::{
    dpop::{DpopRequest, NonceTarget, RequestBody},
    error::OAuthError,
    session::OAuthSession,
    token::request_token,
    utils::now_unix,
    OAuthClient,
};

impl OAuthClient {
    /// The stored session for `did`, refreshed first when it is about to expire
    pub async fn get_valid_session(&self, did: &str) -> Result<OAuthSession, OAuthError> {
        let session = self
            .sessions
            .get(did)
            .await?
            .ok_or(OAuthError::SessionExpired)?;
        self.refresh_if_needed(session).await
    }

    pub async fn refresh_if_needed(&self, session: OAuthSession) -> Result<OAuthSession, OAuthError> {
        if !session.needs_refresh(now_unix(), self.config.token_refresh_margin) {
            return Ok(session);
        }
        self.refresh_session(&session.did, &session.access_token).await
    }

    /// Replace `stale_access_token` for `did`.
    ///
    /// If the stored session already carries a different access token another
    /// caller refreshed it meanwhile and that session is returned as is.
    #[tracing::instrument(skip(self, stale_access_token), err)]
    pub async fn refresh_session(
        &self,
        did: &str,
        stale_access_token: &str,
    ) -> Result<OAuthSession, OAuthError> {
        let lock = self.sessions.refresh_lock(did);
        let result = {
            let _guard = lock.lock().await;
            self.refresh_locked(did, stale_access_token).await
        };
        drop(lock);
        self.sessions.release_refresh_lock(did);

        result
    }

    async fn refresh_locked(
        &self,
        did: &str,
        stale_access_token: &str,
    ) -> Result<OAuthSession, OAuthError> {
        let (session, raw) = self
            .sessions
            .load(did)
            .await?
            .ok_or(OAuthError::SessionExpired)?;

        if session.access_token != stale_access_token {
            tracing::debug!(%did, "Session was refreshed by another caller");
            return Ok(session);
        }

        let Some(refresh_token) = session.refresh_token.clone() else {
            info!(%did, "Session has no refresh token");
            self.destroy_session(&session).await?;
            return Err(OAuthError::SessionExpired);
        };

        let signing_key = self.config.signing_key.as_ref();
        session.client.ensure_usable(signing_key)?;

        let grant = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token),
        ];
        let form = || -> color_eyre::Result<Vec<(String, String)>> {
            let mut form =
                session
                    .client
                    .form_params(signing_key, &session.auth_server_url, now_unix())?;
            form.extend(grant.iter().cloned());
            Ok(form)
        };

        let token = match request_token(
            &self.dpop,
            &session.dpop_key.handle,
            &session.token_endpoint,
            &form,
            self.token_timeout(),
        )
        .await
        {
            Ok(token) => token,
            Err(err) => {
                warn!(%did, code = err.code(), error = %err, "Refresh failed, discarding session");
                self.destroy_session(&session).await?;
                return Err(OAuthError::SessionExpired);
            }
        };
        if let Err(err) = token.verify(did) {
            warn!(%did, error = %err, "Refreshed token failed verification, discarding session");
            self.destroy_session(&session).await?;
            return Err(OAuthError::SessionExpired);
        }

        let now = now_unix();
        let refreshed = OAuthSession {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone().or(session.refresh_token.clone()),
            expires_at: token.expires_at(now),
            scope: token.scope.clone().unwrap_or_else(|| session.scope.clone()),
            updated_at: now,
            ..session.clone()
        };

        if self.sessions.swap(&raw, &refreshed).await? {
            info!(%did, "Refreshed OAuth session");
            return Ok(refreshed);
        }

        // Replaced outside the refresh path, by a new sign-in or a sign-out.
        self.sessions
            .get(did)
            .await?
            .ok_or(OAuthError::SessionExpired)
    }

    /// Delete the session and the key its tokens are bound to
    pub(crate) async fn destroy_session(&self, session: &OAuthSession) -> Result<(), OAuthError> {
        self.sessions.delete(&session.did).await?;
        self.discard_key(&session.dpop_key.handle).await;
        Ok(())
    }

    /// Revoke the refresh token (best effort) and forget the session.
    ///
    /// Returns whether there was a session to sign out of.
    #[tracing::instrument(skip(self), err)]
    pub async fn sign_out(&self, did: &str) -> Result<bool, OAuthError> {
        let lock = self.sessions.refresh_lock(did);
        let result = {
            let _guard = lock.lock().await;
            self.sign_out_locked(did).await
        };
        drop(lock);
        self.sessions.release_refresh_lock(did);

        result
    }

    async fn sign_out_locked(&self, did: &str) -> Result<bool, OAuthError> {
        let Some(session) = self.sessions.get(did).await? else {
            return Ok(false);
        };
        self.revoke(&session).await;
        self.destroy_session(&session).await?;
        info!(%did, "Signed out");
        Ok(true)
    }

    async fn revoke(&self, session: &OAuthSession) {
        let (Some(endpoint), Some(token)) = (
            session.revocation_endpoint.as_deref(),
            session.refresh_token.as_deref(),
        ) else {
            return;
        };
        let signing_key = self.config.signing_key.as_ref();
        if session.client.ensure_usable(signing_key).is_err() {
            warn!(did = %session.did, "Cannot authenticate revocation without a signing key");
            return;
        }

        let form = || -> color_eyre::Result<Vec<(String, String)>> {
            let mut form =
                session
                    .client
                    .form_params(signing_key, &session.auth_server_url, now_unix())?;
            form.push(("token".to_string(), token.to_string()));
            form.push(("token_type_hint".to_string(), "refresh_token".to_string()));
            Ok(form)
        };

        let response = self
            .dpop
            .send(
                &session.dpop_key.handle,
                NonceTarget::AuthServer,
                DpopRequest {
                    method: Method::POST,
                    url: endpoint,
                    access_token: None,
                    body: RequestBody::Form(&form),
                },
                self.token_timeout(),
            )
            .await;

        match response {
            Ok(response) if response.status.is_success() => {}
            Ok(response) => {
                warn!(did = %session.did, status = %response.status, "Token revocation was refused");
            }
            Err(err) => warn!(did = %session.did, error = %err, "Token revocation failed"),
        }
    }
}
