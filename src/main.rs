// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! btserial: a serial terminal over Bluetooth RFCOMM.
//!
//! Bytes read from stdin go to the remote side, bytes received are written
//! to stdout.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use btserial::bluetooth::{
    prepare_adapter, BluezAdvertiser, BluezTransport, Connection, JobHandle, ListenOptions,
    ReadEvent, Server, ServerEvent,
};
use btserial::config::{Config, Mode};

/// Overrides the default config file location.
const CONFIG_ENV: &str = "BTSERIAL_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("btserial=info".parse()?),
        )
        .init();

    info!("Starting btserial v{}...", env!("CARGO_PKG_VERSION"));

    let config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => Config::from_path(&PathBuf::from(path))?,
        None => Config::load()?,
    };
    info!("Configuration loaded");

    match config.bluetooth.mode {
        Mode::Client => run_client(&config).await?,
        Mode::Server => run_server(&config).await?,
    }

    info!("btserial stopped");
    Ok(())
}

async fn run_client(config: &Config) -> Result<()> {
    let conn = Connection::new(BluezTransport, &config.link);
    conn.connect(&config.client.address, config.bluetooth.channel)
        .await
        .with_context(|| format!("connecting to {}", config.client.address))?;

    let mut input = spawn_stdin_reader(config.link.read_buffer_size);
    let mut stdout = tokio::io::stdout();
    let mut read = Some(conn.read());

    loop {
        tokio::select! {
            result = next_read(&mut read) => {
                read = None;
                match result? {
                    ReadEvent::Data(data) => {
                        stdout.write_all(&data).await?;
                        stdout.flush().await?;
                        read = Some(conn.read());
                    }
                    ReadEvent::Closed => {
                        info!("Connection closed");
                        break;
                    }
                }
            }
            chunk = input.recv() => match chunk {
                Some(chunk) => {
                    conn.write(chunk).await?;
                }
                None => {
                    info!("End of input");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    conn.close();
    Ok(())
}

async fn run_server(config: &Config) -> Result<()> {
    let session = bluer::Session::new().await?;
    info!("BlueZ session created");
    prepare_adapter(&session, config.bluetooth.adapter_alias.as_deref()).await?;

    let server = Server::new(
        BluezTransport,
        BluezAdvertiser::new(session),
        &config.link,
    );
    let mut events = server
        .listen(ListenOptions {
            uuid: config.server.uuid.clone(),
            channel: config.bluetooth.channel,
            name: config.server.service_name.clone(),
        })
        .await?;

    let mut input = spawn_stdin_reader(config.link.read_buffer_size);
    let mut input_open = true;
    let mut stdout = tokio::io::stdout();
    let mut read = None;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ServerEvent::Connected { address }) => {
                    info!("Client connected: {}", address);
                    read = Some(server.read());
                }
                Some(ServerEvent::Disconnected { address }) => {
                    info!("Client disconnected: {}", address);
                }
                Some(ServerEvent::Error(e)) => error!("Server error: {}", e),
                None => break,
            },
            result = next_read(&mut read) => {
                read = None;
                match result {
                    Ok(ReadEvent::Data(data)) => {
                        stdout.write_all(&data).await?;
                        stdout.flush().await?;
                        read = Some(server.read());
                    }
                    Ok(ReadEvent::Closed) => debug!("Client stream ended"),
                    Err(e) => {
                        warn!("Read failed: {}", e);
                        server.disconnect_client();
                    }
                }
            }
            chunk = input.recv(), if input_open => match chunk {
                Some(chunk) if server.is_open() => {
                    if let Err(e) = server.write(chunk).await {
                        warn!("Write failed: {}", e);
                    }
                }
                Some(chunk) => debug!("No client, dropping {} bytes of input", chunk.len()),
                None => input_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    server.close();
    Ok(())
}

/// Resolve the pending read, or never when there is none.
async fn next_read(read: &mut Option<JobHandle<ReadEvent>>) -> btserial::Result<ReadEvent> {
    match read {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Forward stdin in chunks of at most `chunk_size` bytes.
fn spawn_stdin_reader(chunk_size: usize) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; chunk_size.max(1)];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });
    rx
}
