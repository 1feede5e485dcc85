/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::sync::atomic::{AtomicU64, Ordering};

use rand_core::{OsRng, RngCore};

use crate::crypto::Secret;

/// A shared symmetric key and the outgoing message ID counter bound to it.
///
/// For peers that have never completed an ephemeral exchange this wraps the
/// static key agreed from the two identities. Message IDs double as packet IDs
/// and cryptographic nonces, so they must never repeat for the same key.
pub struct SymmetricKey {
    pub key: Secret<64>,
    message_id_counter: AtomicU64,
}

impl SymmetricKey {
    pub fn new(key: Secret<64>) -> Self {
        Self {
            key,
            message_id_counter: AtomicU64::new(OsRng.next_u64()),
        }
    }

    /// Get the next message ID, strictly increasing for the life of this key.
    #[inline(always)]
    pub fn next_message(&self) -> u64 {
        self.message_id_counter.fetch_add(1, Ordering::Relaxed)
    }
}
