//! Let's Encrypt client over `instant-acme` with HTTP-01 challenges

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, KeyPair};
use tokio::sync::Mutex;
use tracing::{debug, info, Instrument, Span};

use super::{Acme, CertificateBundle, ChallengeManager};
use crate::errors::{Error, Result};
use crate::storage::{is_not_found, FileStorage};

/// Polls of the order state before giving up
const MAX_ORDER_POLLS: u32 = 10;
const INITIAL_POLL_DELAY: Duration = Duration::from_millis(250);
const MAX_POLL_DELAY: Duration = Duration::from_secs(10);

pub struct LetsEncryptClient {
    email: String,
    directory_url: String,
    storage: Arc<dyn FileStorage>,
    challenges: ChallengeManager,
    account: Mutex<Option<Account>>,
    span: Span,
}

impl LetsEncryptClient {
    pub fn new(
        email: impl Into<String>,
        directory_url: impl Into<String>,
        storage: Arc<dyn FileStorage>,
        challenges: ChallengeManager,
        span: Span,
    ) -> Self {
        Self {
            email: email.into(),
            directory_url: directory_url.into(),
            storage,
            challenges,
            account: Mutex::new(None),
            span,
        }
    }

    /// Storage name of the persisted account credentials
    pub fn account_file_name(email: &str) -> String {
        format!("{}-acme-account.json", email)
    }

    async fn account(&self) -> Result<Account> {
        let mut cached = self.account.lock().await;
        if let Some(account) = cached.as_ref() {
            return Ok(account.clone());
        }

        let file_name = Self::account_file_name(&self.email);
        let account = match self.storage.read(&file_name).await {
            Ok(bytes) => {
                let credentials: AccountCredentials = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::serialization("ACME account credentials", e))?;
                debug!(email = %self.email, "Loaded ACME account");
                Account::from_credentials(credentials).await.map_err(acme_error)?
            }
            Err(e) if is_not_found(&e) => {
                let contact = format!("mailto:{}", self.email);
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &[&contact],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    &self.directory_url,
                    None,
                )
                .await
                .map_err(acme_error)?;

                let encoded = serde_json::to_vec(&credentials)
                    .map_err(|e| Error::serialization("ACME account credentials", e))?;
                self.storage.write(&file_name, &encoded).await?;
                info!(email = %self.email, directory = %self.directory_url, "Registered ACME account");
                account
            }
            Err(e) => return Err(e),
        };

        *cached = Some(account.clone());
        Ok(account)
    }

    async fn order_certificate(
        &self,
        domains: &[String],
        tokens: &mut Vec<String>,
    ) -> Result<CertificateBundle> {
        let account = self.account().await?;
        let identifiers: Vec<Identifier> =
            domains.iter().map(|d| Identifier::Dns(d.clone())).collect();
        let mut order =
            account.new_order(&NewOrder { identifiers: &identifiers }).await.map_err(acme_error)?;

        let authorizations = order.authorizations().await.map_err(acme_error)?;
        for authorization in &authorizations {
            if authorization.status != AuthorizationStatus::Pending {
                continue;
            }

            let challenge = authorization
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| Error::acme("no HTTP-01 challenge offered"))?;

            let key_authorization = order.key_authorization(challenge);
            self.challenges.add_challenge(&challenge.token, key_authorization.as_str());
            tokens.push(challenge.token.clone());
            order.set_challenge_ready(&challenge.url).await.map_err(acme_error)?;
        }

        wait_until_ready(&mut order).await?;

        let key = KeyPair::generate()
            .map_err(|e| Error::acme(format!("key generation failed: {}", e)))?;
        let params = CertificateParams::new(domains.to_vec())
            .map_err(|e| Error::acme(format!("invalid certificate request: {}", e)))?;
        let csr = params
            .serialize_request(&key)
            .map_err(|e| Error::acme(format!("failed to sign certificate request: {}", e)))?;

        order.finalize(csr.der()).await.map_err(acme_error)?;

        let mut delay = INITIAL_POLL_DELAY;
        for _ in 0..MAX_ORDER_POLLS {
            if let Some(chain) = order.certificate().await.map_err(acme_error)? {
                return Ok(CertificateBundle {
                    chain: chain.into_bytes(),
                    key: key.serialize_pem().into_bytes(),
                });
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }

        Err(Error::acme("certificate was not issued in time"))
    }
}

async fn wait_until_ready(order: &mut Order) -> Result<()> {
    let mut delay = INITIAL_POLL_DELAY;
    for _ in 0..MAX_ORDER_POLLS {
        tokio::time::sleep(delay).await;
        let state = order.refresh().await.map_err(acme_error)?;
        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
            OrderStatus::Invalid => return Err(Error::acme("order became invalid")),
            _ => delay = (delay * 2).min(MAX_POLL_DELAY),
        }
    }
    Err(Error::acme("order did not become ready in time"))
}

fn acme_error(error: instant_acme::Error) -> Error {
    Error::acme(error.to_string())
}

#[async_trait]
impl Acme for LetsEncryptClient {
    async fn obtain(&self, domains: &[String]) -> Result<CertificateBundle> {
        if domains.is_empty() {
            return Err(Error::validation("cannot order a certificate without domains"));
        }

        async {
            info!(domains = ?domains, "Ordering certificate");

            let mut tokens = Vec::new();
            let result = self.order_certificate(domains, &mut tokens).await;
            for token in &tokens {
                self.challenges.remove_challenge(token);
            }
            result
        }
        .instrument(self.span.clone())
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn account_file_is_named_after_email() {
        assert_eq!(
            LetsEncryptClient::account_file_name("ops@example.com"),
            "ops@example.com-acme-account.json"
        );
    }

    #[tokio::test]
    async fn empty_domain_set_is_rejected_without_network() {
        let client = LetsEncryptClient::new(
            "ops@example.com",
            "https://acme.invalid/directory",
            Arc::new(MemoryStorage::new()),
            ChallengeManager::new(),
            Span::none(),
        );
        let err = client.obtain(&[]).await.unwrap_err();
        assert!(err.to_string().contains("without domains"));
    }
}
