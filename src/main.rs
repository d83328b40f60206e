#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::todo)]
#![warn(clippy::panic)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(unreachable_pub)]
#![warn(missing_debug_implementations)]
#![warn(unused_qualifications)]
#![deny(unused_must_use)]

use apns_dispatch::adapters::push::Http2Transport;
use apns_dispatch::config::Config;
use apns_dispatch::{Provider, Response, telemetry};
use std::sync::Arc;
use tracing::Instrument;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();
    let telemetry_guard = telemetry::init_telemetry(&config.telemetry)?;

    let result = async {
        let credential = config.credential.load()?;
        let notification = config.notification.to_notification()?;

        let provider = Provider::with_options(
            config.gateway.environment,
            credential,
            Arc::new(Http2Transport::default()),
            config.gateway.provider_options(),
        );
        tracing::info!(endpoint = %provider.endpoint(), "Sending notification");

        let outcome = provider.send(&notification).await;
        provider.close().await;

        match outcome? {
            Response::Accepted { id } => {
                tracing::info!(apns_id = ?id, "Notification accepted");
                Ok(())
            }
            Response::Rejected(rejection) => {
                tracing::error!(
                    status = %rejection.status,
                    reason = %rejection.reason,
                    timestamp = ?rejection.timestamp,
                    retryable = rejection.is_retryable(),
                    "Notification rejected"
                );
                Err(anyhow::anyhow!("gateway rejected the notification: {}", rejection.reason))
            }
        }
    }
    .instrument(tracing::info_span!("send_notification"))
    .await;

    telemetry_guard.shutdown();
    result
}
