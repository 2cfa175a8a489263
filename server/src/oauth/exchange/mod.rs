use tracing::{info, warn};

use super::{
    error::OAuthError,
    resolver::issuer_equivalent,
    session::{OAuthSession, PendingAuthorizationRequest},
    token::request_token,
    utils::now_unix,
    OAuthClient,
};

/// What a completed code exchange hands back to the callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOutcome {
    pub did: String,
    pub handle: Option<String>,
    pub return_url: String,
}

impl OAuthClient {
    /// Consume the pending request for `state` and trade `code` for a DPoP-bound
    /// session.
    ///
    /// The pending request is gone after this call whatever the outcome, so a
    /// replayed callback never reaches the token endpoint twice.
    #[tracing::instrument(skip_all, err)]
    pub async fn exchange_code(
        &self,
        state: &str,
        code: &str,
        iss: Option<&str>,
    ) -> Result<ExchangeOutcome, OAuthError> {
        let pending = self
            .pending
            .take(state)
            .await?
            .ok_or(OAuthError::InvalidOrExpiredState)?;

        if pending.is_expired_at(now_unix(), self.pending.ttl()) {
            info!(did = %pending.did, "Pending authorization request expired");
            self.discard_key(&pending.dpop_key.handle).await;
            return Err(OAuthError::InvalidOrExpiredState);
        }

        match self.redeem(&pending, code, iss).await {
            Ok(session) => {
                self.store_session(session).await?;
                Ok(ExchangeOutcome {
                    did: pending.did,
                    handle: pending.handle,
                    return_url: pending.return_url,
                })
            }
            Err(err) => {
                self.discard_key(&pending.dpop_key.handle).await;
                Err(err)
            }
        }
    }

    async fn redeem(
        &self,
        pending: &PendingAuthorizationRequest,
        code: &str,
        iss: Option<&str>,
    ) -> Result<OAuthSession, OAuthError> {
        if let Some(iss) = iss {
            if !issuer_equivalent(iss, &pending.auth_server.issuer) {
                return Err(OAuthError::TokenExchange(
                    "callback issuer does not match the authorization server".to_string(),
                ));
            }
        }

        let signing_key = self.config.signing_key.as_ref();
        pending.client.ensure_usable(signing_key)?;

        let grant = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
            ("redirect_uri".to_string(), pending.redirect_uri.clone()),
            ("code_verifier".to_string(), pending.code_verifier.clone()),
        ];
        let form = || -> color_eyre::Result<Vec<(String, String)>> {
            let mut form = pending
                .client
                .form_params(signing_key, &pending.auth_server.issuer, now_unix())?;
            form.extend(grant.iter().cloned());
            Ok(form)
        };

        let token = request_token(
            &self.dpop,
            &pending.dpop_key.handle,
            &pending.auth_server.token_endpoint,
            &form,
            self.token_timeout(),
        )
        .await?;
        token.verify(&pending.did)?;

        self.keys()
            .retain(&pending.dpop_key.handle)
            .await
            .map_err(|err| {
                warn!(error = %err, "DPoP key vanished during code exchange");
                OAuthError::TokenExchange("the DPoP key for this sign-in was lost".to_string())
            })?;

        let now = now_unix();
        Ok(OAuthSession {
            did: pending.did.clone(),
            handle: pending.handle.clone(),
            pds_url: pending.pds_url.clone(),
            auth_server_url: pending.auth_server.issuer.clone(),
            token_endpoint: pending.auth_server.token_endpoint.clone(),
            revocation_endpoint: pending.auth_server.revocation_endpoint.clone(),
            client: pending.client.clone(),
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at: token.expires_at(now),
            scope: token.scope.clone().unwrap_or_default(),
            dpop_key: pending.dpop_key.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Persist a new session, retiring the key of any session it replaces
    async fn store_session(&self, session: OAuthSession) -> Result<(), OAuthError> {
        let previous = self.sessions.get(&session.did).await?;
        self.sessions.put(&session).await?;

        if let Some(previous) = previous {
            if previous.dpop_key.handle != session.dpop_key.handle {
                self.discard_key(&previous.dpop_key.handle).await;
            }
        }
        info!(did = %session.did, "Stored OAuth session");
        Ok(())
    }

    /// The provider answered the callback with an error; drop whatever the
    /// attempt left behind.
    pub async fn abandon_authorization(&self, state: &str) -> Result<(), OAuthError> {
        if let Some(pending) = self.pending.take(state).await? {
            self.discard_key(&pending.dpop_key.handle).await;
        }
        Ok(())
    }
}
