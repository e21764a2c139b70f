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

use logforth::{append, filter::env_filter::EnvFilterBuilder};

/// Initialize logging to stderr. The default level is `info`, or `debug` when
/// `debug` is set; `RUST_LOG` overrides both.
pub fn init_logging(debug: bool) {
    let directives = if debug { "debug" } else { "info" };

    logforth::starter_log::builder()
        .dispatch(|dispatch| {
            dispatch
                .filter(EnvFilterBuilder::from_default_env_or(directives).build())
                .append(append::Stderr::default())
        })
        .apply();
}
