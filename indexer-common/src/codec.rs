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

//! Chainweb wire codecs: URL-safe base64 without padding and Blake2b-256.

use base64::{DecodeError, Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use blake2::{Blake2b, Digest, digest::consts::U32};

type Blake2b256 = Blake2b<U32>;

/// Encode bytes as URL-safe base64 with trailing padding stripped, the form
/// Chainweb uses for hashes and payloads.
pub fn base64_encode(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode URL-safe base64, accepting both padded and unpadded input. An input
/// length of 1 mod 4 (after stripping padding) is invalid.
pub fn base64_decode(data: impl AsRef<str>) -> Result<Vec<u8>, DecodeError> {
    URL_SAFE_NO_PAD.decode(data.as_ref().trim_end_matches('='))
}

/// Blake2b digest with 32-byte output, the hash used throughout Chainweb.
pub fn blake2b(data: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data.as_ref());
    hasher.finalize().into()
}

/// Blake2b-256 digest in its URL-safe base64 form, e.g. a request key.
pub fn blake2b_base64(data: impl AsRef<[u8]>) -> String {
    base64_encode(blake2b(data))
}

#[cfg(test)]
mod tests {
    use crate::codec::{base64_decode, base64_encode, blake2b, blake2b_base64};
    use assert_matches::assert_matches;
    use base64::DecodeError;
    use proptest::{collection::vec, prelude::*};

    #[test]
    fn test_base64_encode() {
        assert_eq!(base64_encode(b""), "");
        assert_eq!(base64_encode(b"f"), "Zg");
        assert_eq!(base64_encode(b"fo"), "Zm8");
        assert_eq!(base64_encode(b"foo"), "Zm9v");
        // URL-safe alphabet, no `+` or `/`.
        assert_eq!(base64_encode([0xfb, 0xff]), "-_8");
    }

    #[test]
    fn test_base64_decode() {
        assert_eq!(base64_decode("Zm9vYmE").unwrap(), b"fooba");
        // Padded input is accepted as well.
        assert_eq!(base64_decode("Zm8=").unwrap(), b"fo");
        assert_eq!(base64_decode("Zg==").unwrap(), b"f");
        // Length 1 mod 4 cannot be completed by padding.
        assert_matches!(base64_decode("Zm9vX"), Err(DecodeError::InvalidLength(_)));
    }

    #[test]
    fn test_blake2b() {
        assert_eq!(
            const_hex::encode(blake2b(b"")),
            "0e5751c026e543b2e8ab2eb06099daa1d1e5df47778f7787faab45cdf12fe3a8"
        );
        assert_eq!(
            const_hex::encode(blake2b(b"abc")),
            "bddd813c634239723171ef3fee98579b94964e3bb1cb3e427262c8c068d52319"
        );
        assert_eq!(blake2b_base64(b""), base64_encode(blake2b(b"")));
    }

    proptest! {
        #[test]
        fn test_base64_roundtrip(data in vec(any::<u8>(), 0..256)) {
            prop_assert_eq!(base64_decode(base64_encode(&data)).unwrap(), data);
        }
    }
}
