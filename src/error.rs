/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::error::Error;
use std::fmt;

/// An invalid parameter was supplied to a constructor or setup function.
///
/// Runtime packet handling never returns errors; bad packets are dropped and
/// reported through trace events instead.
#[derive(Debug, PartialEq, Eq)]
pub struct InvalidParameterError(pub &'static str);

impl fmt::Display for InvalidParameterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl Error for InvalidParameterError {}
