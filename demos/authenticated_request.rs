use std::error::Error;
use std::sync::Arc;

use authlink_sdk::credentials::{CredentialPair, MemoryCredentialStore};
use authlink_sdk::gateway::{GatewayError, RequestGateway};
use authlink_sdk::session::LogOnlyRedirect;
use authlink_sdk::TransportConfig;

fn main() -> Result<(), Box<dyn Error>> {
    let config = TransportConfig::from_json_str(
        r#"{
            "base_url": "http://localhost:8080",
            "refresh_path": "/auth/refresh",
            "login_path": "/login"
        }"#,
    )?;
    let access_token = "REPLACE_WITH_ACCESS_TOKEN".to_string();
    let refresh_token = "REPLACE_WITH_REFRESH_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let store = Arc::new(MemoryCredentialStore::new());
        let gateway = RequestGateway::new(
            config.gateway_options(),
            store,
            Arc::new(LogOnlyRedirect),
        )?;
        gateway.login(CredentialPair::new(access_token, refresh_token));

        match gateway.get("/api/me").await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await?;
                println!("status={status} body={body}");
            }
            Err(error @ (GatewayError::AuthExpired(_) | GatewayError::AuthDenied { .. })) => {
                println!("session ended, log in again: {error}");
            }
            Err(error) => return Err(error.into()),
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
