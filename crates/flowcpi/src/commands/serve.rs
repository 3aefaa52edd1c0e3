use flowcpi_cloud::CpiError;
use flowcpi_config::{CpiConfig, find_config_file};
use flowcpi_core::{Dispatcher, Response, install_panic_hook};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Stdout};

pub async fn handle(config: Option<&Path>, persistent: bool) -> anyhow::Result<()> {
    install_panic_hook();
    let dispatcher = dispatcher(config);
    let mut stdout = tokio::io::stdout();

    if persistent {
        let mut stdin = BufReader::new(tokio::io::stdin());
        let mut line = Vec::new();
        loop {
            line.clear();
            if stdin.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            if line.trim_ascii().is_empty() {
                continue;
            }
            let response = dispatcher.handle_bytes(&line).await;
            write_response(&mut stdout, &response).await?;
        }
    } else {
        let mut input = Vec::new();
        tokio::io::stdin().read_to_end(&mut input).await?;
        let response = dispatcher.handle_bytes(&input).await;
        write_response(&mut stdout, &response).await?;
    }

    Ok(())
}

/// A dispatcher for the loaded configuration, or one that reports why it could not load
fn dispatcher(explicit: Option<&Path>) -> Dispatcher {
    let loaded = find_config_file(explicit).and_then(|path| {
        tracing::debug!("Using configuration {}", path.display());
        CpiConfig::load(&path)
    });

    match loaded {
        Ok(config) => Dispatcher::from_config(&config),
        Err(e) => {
            tracing::warn!("Configuration unusable: {}", e);
            Dispatcher::unconfigured(CpiError::InvalidCall(e.to_string()))
        }
    }
}

async fn write_response(stdout: &mut Stdout, response: &Response) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}
