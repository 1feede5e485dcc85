/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::address::Address;
use crate::application::{CallContext, HostSystem, StateObjectType};
use crate::identity::Identity;
use crate::path::{Path, PathKey};
use crate::peer::Peer;
use crate::proto::{PATH_KEEPALIVE_PERIOD, PEER_ALIVE_TIMEOUT, PEER_GLOBAL_TIMEOUT};

struct RootEntry {
    peer: Arc<Peer>,
    endpoints: Vec<SocketAddr>,
}

/// Process-wide registry of peers, paths, and roots.
pub struct Topology {
    identity: Identity,
    peers: RwLock<HashMap<Address, Arc<Peer>>>,
    paths: RwLock<HashMap<PathKey, Arc<Path>>>,
    roots: Mutex<Vec<RootEntry>>,
    best_root: RwLock<Option<Arc<Peer>>>,
}

impl Topology {
    pub(crate) fn new(identity: Identity) -> Self {
        Self {
            identity,
            peers: RwLock::new(HashMap::new()),
            paths: RwLock::new(HashMap::new()),
            roots: Mutex::new(Vec::new()),
            best_root: RwLock::new(None),
        }
    }

    /// Get the canonical Path object for a local socket and remote address,
    /// creating it if necessary. Every caller holding "the same" physical
    /// path holds the same object.
    pub fn path(&self, local_socket: i64, remote_address: &SocketAddr) -> Arc<Path> {
        let key = (local_socket, *remote_address);
        if let Some(path) = self.paths.read().get(&key) {
            return path.clone();
        }
        self.paths
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(Path::new(local_socket, *remote_address)))
            .clone()
    }

    /// Look up a peer by address.
    ///
    /// If `create_if_missing` is set and the peer is not in memory, an
    /// attempt is made to recall it from the host's persistent cache.
    pub fn peer<H: HostSystem>(&self, host: &H, cc: &CallContext, address: Address, create_if_missing: bool) -> Option<Arc<Peer>> {
        if let Some(peer) = self.peers.read().get(&address) {
            return Some(peer.clone());
        }
        if create_if_missing {
            self.load_cached(host, cc, address).map(|p| self.add(Arc::new(p)))
        } else {
            None
        }
    }

    /// Insert a peer, or return the existing peer for that address. There is
    /// never more than one live Peer object per address.
    pub fn add(&self, peer: Arc<Peer>) -> Arc<Peer> {
        self.peers.write().entry(peer.address()).or_insert(peer).clone()
    }

    /// The current best root, used for WHOIS and relaying.
    #[inline(always)]
    pub fn root(&self) -> Option<Arc<Peer>> {
        self.best_root.read().clone()
    }

    pub fn is_root(&self, peer: &Arc<Peer>) -> bool {
        self.roots.lock().iter().any(|r| Arc::ptr_eq(&r.peer, peer))
    }

    pub fn all_peers(&self) -> (Vec<Arc<Peer>>, Vec<Arc<Peer>>) {
        let all = self.peers.read().values().cloned().collect();
        let roots = self.roots.lock().iter().map(|r| r.peer.clone()).collect();
        (all, roots)
    }

    pub(crate) fn root_entries(&self) -> Vec<(Arc<Peer>, Vec<SocketAddr>)> {
        self.roots.lock().iter().map(|r| (r.peer.clone(), r.endpoints.clone())).collect()
    }

    /// Rebuild the root list from the trust store.
    ///
    /// Every reported root gets a Peer in the peer map. A root whose address
    /// collides with a known peer carrying a different identity is ignored:
    /// that should be impossible and indicates something nasty.
    pub fn trust_store_changed<H: HostSystem>(&self, host: &H, cc: &CallContext) {
        let specs = host.trusted_roots();
        let mut new_roots = Vec::with_capacity(specs.len());
        for spec in specs {
            let peer = match self.peer(host, cc, spec.identity.address, false) {
                Some(existing) => {
                    if existing.identity() != &spec.identity {
                        continue;
                    }
                    existing
                }
                None => match Peer::new(&self.identity, spec.identity.clone()) {
                    Some(p) => self.add(Arc::new(p)),
                    None => continue,
                },
            };
            peer.set_locator(spec.locator);
            new_roots.push(RootEntry { peer, endpoints: spec.endpoints });
        }
        let mut roots = self.roots.lock();
        *roots = new_roots;
        self.rank_roots(&mut roots);
    }

    /// Re-rank roots and refresh the best-root cache.
    pub(crate) fn rank_roots_now(&self) {
        let mut roots = self.roots.lock();
        self.rank_roots(&mut roots);
    }

    fn rank_roots(&self, roots: &mut Vec<RootEntry>) {
        // Quantize last-receive so all recently alive roots tie, then prefer
        // the lowest known latency. Unknown latency ranks behind any known.
        roots.sort_by_key(|r| {
            let lr = -(r.peer.last_receive_time_ticks() / (PATH_KEEPALIVE_PERIOD / 2));
            let lat = r.peer.latency();
            (lr, if lat < 0 { i64::MAX } else { lat })
        });
        *self.best_root.write() = roots.first().map(|r| r.peer.clone());
    }

    /// Periodic two-phase garbage collection of dead peers and orphan paths.
    ///
    /// The read-locked scan collects candidates and the write lock is taken
    /// only to erase them, so packet processing is never stalled behind a
    /// long write-locked sweep on large peer tables. Roots are never
    /// collected. Each evicted peer is persisted to the host cache first.
    pub fn periodic<H: HostSystem>(&self, host: &H, cc: &CallContext) {
        let root_ptrs: Vec<*const Peer> = self.roots.lock().iter().map(|r| Arc::as_ptr(&r.peer)).collect();

        let candidates: Vec<Address> = {
            let peers = self.peers.read();
            peers
                .iter()
                .filter(|(_, p)| {
                    (cc.ticks - p.last_receive_time_ticks()) > PEER_ALIVE_TIMEOUT && !root_ptrs.contains(&Arc::as_ptr(p))
                })
                .map(|(a, _)| *a)
                .collect()
        };
        for address in candidates {
            let removed = {
                let mut peers = self.peers.write();
                // Re-check under the write lock; the peer may have spoken since the scan.
                if peers.get(&address).map_or(false, |p| (cc.ticks - p.last_receive_time_ticks()) > PEER_ALIVE_TIMEOUT) {
                    peers.remove(&address)
                } else {
                    None
                }
            };
            if let Some(peer) = removed {
                peer.save(host, cc);
            }
        }

        // Reap paths referenced by nothing but this map.
        self.paths.write().retain(|_, path| Arc::strong_count(path) > 1);
    }

    /// Expire stale partial packets on every known path.
    pub(crate) fn service_paths(&self, cc: &CallContext) {
        for path in self.paths.read().values() {
            path.service(cc);
        }
    }

    /// Persist every in-memory peer.
    pub fn save_all<H: HostSystem>(&self, host: &H, cc: &CallContext) {
        let peers: Vec<Arc<Peer>> = self.peers.read().values().cloned().collect();
        for peer in peers {
            peer.save(host, cc);
        }
    }

    fn load_cached<H: HostSystem>(&self, host: &H, cc: &CallContext, address: Address) -> Option<Peer> {
        let record = host.state_get(StateObjectType::Peer, &address.to_bytes())?;
        if record.len() <= 8 {
            return None;
        }
        let ts = u64::from_be_bytes(record[..8].try_into().unwrap()) as i64;
        if (cc.clock - ts) >= PEER_GLOBAL_TIMEOUT {
            return None;
        }
        let mut cursor = 8;
        let id = Identity::unmarshal(&record, &mut cursor).ok()?;
        if id.address != address {
            return None;
        }
        Peer::new(&self.identity, id)
    }
}
