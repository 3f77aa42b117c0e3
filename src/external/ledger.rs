use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{api::Ledger, error::{not_found_error, upstream_error, Error}};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Wallet {
    balance: f64,
}

/// Wallet balances read from the payments service.
#[derive(Clone, Debug)]
pub struct HttpLedger {
    api_base: String,
    client: reqwest::Client,
}

impl HttpLedger {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            client: reqwest::Client::new(),
        }
    }

    fn wallet_url(&self, user_id: Uuid) -> String {
        format!("{}/wallets/{}", self.api_base.trim_end_matches('/'), user_id)
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    #[tracing::instrument(skip(self))]
    async fn balance(&self, user_id: Uuid) -> Result<f64, Error> {
        let res = self.client.get(self.wallet_url(user_id)).send().await?;

        let status_code = res.status().as_u16();

        if status_code == 404 {
            return Err(not_found_error());
        } else if status_code != 200 {
            return Err(upstream_error());
        }

        let wallet: Wallet = res.json().await?;

        Ok(wallet.balance)
    }
}

#[test]
fn wallet_url_joins_base_and_user() {
    let ledger = HttpLedger::new("http://payments.local/v1/");
    let user_id = Uuid::nil();

    assert_eq!(
        ledger.wallet_url(user_id),
        "http://payments.local/v1/wallets/00000000-0000-0000-0000-000000000000"
    );
}
