// This file is part of chainweb-indexer.
// Copyright (C) 2025 Chainweb Indexer Contributors
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::Context;
use chainweb_indexer::{
    application,
    config::Config,
    infra::{node::ChainwebNode, storage::PostgresStorage},
};
use clap::Parser;
use indexer_common::{config::ConfigExt, infra::pool::PostgresPool, telemetry};
use log::{error, info};
use std::{panic, path::PathBuf, process};
use tokio::signal::unix::{SignalKind, signal};

/// Index Pact events from a Kadena Chainweb network.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// YAML configuration file.
    config_file: PathBuf,

    /// Verbose logging.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    telemetry::init_logging(cli.debug);
    panic::set_hook(Box::new(|panic| error!(panic:%; "process panicked")));

    if let Err(error) = run(cli).await {
        let backtrace = error.backtrace();
        let error = format!("{error:#}");
        error!(error, backtrace:%; "process exited with ERROR");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config_file).context("load configuration")?;
    info!(config:?; "starting");
    let Config {
        node,
        storage_config,
        application_config,
    } = config;

    let pool = PostgresPool::new(storage_config)
        .await
        .context("create Postgres connection pool")?;
    let storage = PostgresStorage::new(pool);

    let node = ChainwebNode::connect(&node)
        .await
        .context("connect to chainweb node")?;

    let sigterm = signal(SignalKind::terminate()).context("register SIGTERM handler")?;
    let sigint = signal(SignalKind::interrupt()).context("register SIGINT handler")?;

    application::run(application_config, node, storage, sigterm, sigint).await
}
