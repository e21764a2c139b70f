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

use crate::domain::{Block, BlockHash, ChainId};
use futures::Stream;
use std::error::Error as StdError;

/// Chainweb node abstraction.
#[trait_variant::make(Send)]
pub trait Node
where
    Self: Clone + Send + Sync + 'static,
{
    type Error: StdError + Send + Sync + 'static;

    /// A finite stream of historical [Block]s on the ancestry of `parent`,
    /// with heights within `[min_height, max_height]`, in descending height
    /// order. Transient errors surface as stream items; retrying is up to the
    /// caller.
    fn blocks(
        &self,
        chain: &ChainId,
        parent: &BlockHash,
        min_height: u64,
        max_height: u64,
    ) -> impl Stream<Item = Result<Block, Self::Error>> + Send;

    /// An endless stream of newly produced [Block]s across all chains,
    /// reconnecting internally on stream errors. Parents are emitted before
    /// their children where the recent-block cache allows it.
    fn block_updates(&self) -> impl Stream<Item = Result<Block, Self::Error>> + Send;
}
