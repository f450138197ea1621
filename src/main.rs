// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

use anyhow::Result;
use std::sync::Arc;

mod ari;
mod http;
mod mailer;
mod media;
mod openai;
mod orchestrator;
mod registry;
mod settings;
mod transcript;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = settings::Settings::load("config.toml")?;

    // LOG_LEVEL seeds the filter, RUST_LOG overrides it
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.log_level.clone()),
    )
    .init();

    if settings.openai_api_key.is_empty() {
        log::warn!("OPENAI_API_KEY is empty, realtime sessions will fail to authenticate");
    }

    let core = Arc::new(registry::Core::new(Arc::new(settings)));

    let health = http::spawn(core.clone());

    let result = orchestrator::run(core).await;

    if let Some(health) = health {
        health.abort();
    }

    result?;

    log::info!("bridge exiting, bye!");

    Ok(())
}
