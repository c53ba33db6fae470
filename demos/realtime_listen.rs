use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use authlink_sdk::credentials::{CredentialPair, MemoryCredentialStore};
use authlink_sdk::realtime::{InboundFrame, OutboundFrame, RealtimeChannel};
use authlink_sdk::RealtimeOptions;
use serde_json::json;

fn main() -> Result<(), Box<dyn Error>> {
    let access_token = "REPLACE_WITH_ACCESS_TOKEN".to_string();
    let refresh_token = "REPLACE_WITH_REFRESH_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let store = Arc::new(MemoryCredentialStore::with_pair(CredentialPair::new(
            access_token,
            refresh_token,
        )));
        let channel = RealtimeChannel::new(RealtimeOptions::new("http://localhost:8080"), store);

        let _ = channel.on_connect(|| println!("connected"));
        let _ = channel.on_disconnect(|| println!("disconnected"));
        let _ = channel.on_message("notification", |frame: &InboundFrame| {
            println!("notification payload={:?}", frame.payload());
        });
        let _ = channel.on_message("message", |frame: &InboundFrame| {
            println!("untagged frame body={}", frame.body);
        });

        channel.connect().await?;
        let outcome = channel
            .send(&OutboundFrame::new("subscribe", json!({"topic": "updates"})))
            .await?;
        println!("subscribe outcome={outcome:?}");

        tokio::time::sleep(Duration::from_secs(30)).await;
        channel.disconnect();
        Ok::<(), Box<dyn Error>>(())
    })
}
