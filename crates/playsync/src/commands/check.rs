//! `playsync check`: ping every configured source and report.

use serde::Serialize;
use tabled::Tabled;

use playsync_api::MediaServerClient;
use playsync_config::{Config, config_path};
use playsync_core::{CoreError, HistorySource, history_source_from_config};

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

#[derive(Debug, Clone, Serialize)]
struct CheckResult {
    source: String,
    server_id: String,
    url: String,
    ok: bool,
    detail: String,
}

#[derive(Tabled)]
struct CheckRow {
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Server")]
    server_id: String,
    #[tabled(rename = "URL")]
    url: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

pub async fn handle(config: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let mut results = Vec::new();

    if let Some(history) = config.history_source()? {
        let source = history_source_from_config(&history)?;
        let outcome = source.ping().await.map(|()| "reachable".to_owned());
        results.push(CheckResult::new("tautulli", "default", history.url.as_str(), outcome));
    }

    for server in config.media_servers()? {
        let outcome = async {
            let client = MediaServerClient::new(
                server.kind,
                server.url.as_str(),
                server.api_key.clone(),
                server.user_id.clone(),
                &server.transport,
            )?;
            client.ping().await?;
            let info = client.server_info().await?;
            Ok::<_, CoreError>(format!("{} {}", info.server_name, info.version))
        }
        .await;
        results.push(CheckResult::new(
            server.kind.as_str(),
            &server.server_id,
            server.url.as_str(),
            outcome,
        ));
    }

    if results.is_empty() {
        return Err(CliError::NoSources {
            path: global
                .config
                .clone()
                .unwrap_or_else(config_path)
                .display()
                .to_string(),
        });
    }

    let color = output::should_color(global.color);
    let rendered = output::render_list(global.output, &results, |r| CheckRow {
        source: r.source.clone(),
        server_id: r.server_id.clone(),
        url: r.url.clone(),
        status: output::status_badge(r.ok, color),
        detail: r.detail.clone(),
    })?;
    output::print_output(&rendered, global.quiet);

    let failed = results.iter().filter(|r| !r.ok).count();
    if failed > 0 {
        return Err(CliError::CheckFailed {
            failed,
            total: results.len(),
        });
    }
    Ok(())
}

impl CheckResult {
    fn new(source: &str, server_id: &str, url: &str, outcome: Result<String, CoreError>) -> Self {
        let (ok, detail) = match outcome {
            Ok(detail) => (true, detail),
            Err(e) => (false, e.to_string()),
        };
        Self {
            source: source.to_owned(),
            server_id: server_id.to_owned(),
            url: url.to_owned(),
            ok,
            detail,
        }
    }
}
