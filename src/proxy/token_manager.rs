// Token Manager - access token resolution for upstream calls
//
// Token refresh and persistence live outside the gateway; the forward engine
// only asks for a usable bearer token per account.

use async_trait::async_trait;

use crate::models::account::{Account, CREDENTIAL_ACCESS_TOKEN};

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_access_token(&self, account: &Account) -> Result<String, String>;
}

/// Reads `access_token` straight from the account credentials
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticTokenProvider;

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_access_token(&self, account: &Account) -> Result<String, String> {
        account
            .get_credential(CREDENTIAL_ACCESS_TOKEN)
            .map(str::to_string)
            .ok_or_else(|| format!("account {} has no access_token", account.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_reads_credential() {
        let account = Account::new("acc1", "a").with_credential(CREDENTIAL_ACCESS_TOKEN, "ya29.x");
        assert_eq!(
            StaticTokenProvider.get_access_token(&account).await,
            Ok("ya29.x".to_string())
        );
    }

    #[tokio::test]
    async fn test_static_provider_rejects_blank_token() {
        let account = Account::new("acc1", "a").with_credential(CREDENTIAL_ACCESS_TOKEN, "  ");
        let err = StaticTokenProvider.get_access_token(&account).await.unwrap_err();
        assert!(err.contains("acc1"));
    }
}
