/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

pub mod crypto;

pub mod address;
pub mod application;
pub mod buf;
mod defrag;
pub mod dictionary;
pub mod endpoint;
pub mod error;
mod expect;
mod gate;
pub mod identity;
pub mod node;
pub mod path;
pub mod peer;
pub mod proto;
pub mod symmetrickey;
pub mod topology;
pub mod trace;
mod whois;

pub use crate::address::Address;
pub use crate::application::{CallContext, HostSystem, InnerProtocol, RootSpec, StateObjectType};
pub use crate::error::InvalidParameterError;
pub use crate::identity::Identity;
pub use crate::node::Node;
pub use crate::path::Path;
pub use crate::peer::Peer;
pub use crate::proto::{Cipher, Verb};
pub use crate::symmetrickey::SymmetricKey;
pub use crate::topology::Topology;
pub use crate::trace::{PacketDropReason, TraceEvent, TRACE_VL1, TRACE_VL2};
