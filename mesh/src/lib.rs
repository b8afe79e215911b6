//! The dispatcher: owns the local identity, the link table, and the
//! extensibility hooks, and demultiplexes every inbound packet into one of
//! a handshake, a channel payload, or a routed forward.
//!
//! Hooks are stored as named slots of boxed closures rather than a trait
//! object per event, following the registration-id pattern in §6: each
//! setter only touches its own slot, so two callers can share an id and
//! each only wire up the callback kind they care about.

use std::collections::BTreeMap;

use cipherset::{CipherError, LocalIdentity};
use hashname::Hashname;
use link::Link;
use lob::{Kind, Packet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("key material invalid: {0}")]
    Key(#[from] CipherError),
    #[error("empty keyset cannot derive a hashname")]
    EmptyKeyset,
}

type FreeHook = Box<dyn FnMut(&mut Mesh)>;
type LinkHook = Box<dyn FnMut(&mut Mesh, &Hashname)>;
type PathHook = Box<dyn FnMut(&mut Mesh, &Hashname, &serde_json::Value) -> bool>;
type OpenHook = Box<dyn FnMut(&mut Mesh, &Hashname, Packet) -> Option<Packet>>;
type DiscoverHook = Box<dyn FnMut(&mut Mesh, &Packet)>;

/// A named bundle of optional callbacks. Registering under an id already in
/// use only replaces the slot the setter targets, leaving the others intact.
struct Hook {
    id: String,
    free: Option<FreeHook>,
    link: Option<LinkHook>,
    path: Option<PathHook>,
    open: Option<OpenHook>,
    discover: Option<DiscoverHook>,
}

impl Hook {
    fn new(id: &str) -> Self {
        Hook { id: id.to_string(), free: None, link: None, path: None, open: None, discover: None }
    }
}

pub struct Mesh {
    identity: Option<LocalIdentity>,
    hashname: Option<Hashname>,
    keys: BTreeMap<u8, Vec<u8>>,
    links: Vec<Link>,
    hooks: Vec<Hook>,
}

impl Mesh {
    pub fn new() -> Self {
        Mesh { identity: None, hashname: None, keys: BTreeMap::new(), links: Vec::new(), hooks: Vec::new() }
    }

    pub fn is_loaded(&self) -> bool {
        self.identity.is_some()
    }

    pub fn hashname(&self) -> Option<Hashname> {
        self.hashname
    }

    pub fn public_key_bytes(&self) -> Option<[u8; 33]> {
        self.identity.as_ref().map(|i| i.public_key_bytes())
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Load an existing secret and public keyset, deriving the local
    /// hashname. No link may exist before this succeeds.
    pub fn load(&mut self, secret_bytes: &[u8; 32], keys: BTreeMap<u8, Vec<u8>>) -> Result<(), MeshError> {
        let identity = LocalIdentity::from_secret_bytes(secret_bytes)?;
        let hashname = Hashname::from_keys(&keys).ok_or(MeshError::EmptyKeyset)?;
        self.identity = Some(identity);
        self.hashname = Some(hashname);
        self.keys = keys;
        Ok(())
    }

    /// Generate a fresh keypair for the one cipher set this crate
    /// implements, load it, and return the raw secret for persistence.
    pub fn generate(&mut self) -> Result<[u8; 32], MeshError> {
        let identity = LocalIdentity::generate();
        let secret = identity.secret_bytes();
        let mut keys = BTreeMap::new();
        keys.insert(cipherset::CSID, identity.public_key_bytes().to_vec());
        self.load(&secret, keys)?;
        Ok(secret)
    }

    pub fn to_json(&self) -> Option<serde_json::Value> {
        let hn = self.hashname?;
        let mut keys_obj = serde_json::Map::new();
        for (csid, key) in &self.keys {
            keys_obj.insert(format!("{:02x}", csid), serde_json::Value::String(b32_encode(key)));
        }
        Some(serde_json::json!({
            "hashname": hn.to_base32(),
            "keys": keys_obj,
            "paths": [],
        }))
    }

    /// Supplements `mesh_json` with a flat export of the link table, useful
    /// for debugging and for the discovery hook's own bookkeeping.
    pub fn links_json(&self) -> serde_json::Value {
        serde_json::Value::Array(self.links.iter().map(|l| l.to_json()).collect())
    }

    pub fn linkid(&self, hn: &Hashname) -> Option<&Link> {
        self.links.iter().find(|l| l.peer() == hn)
    }

    pub fn linkid_mut(&mut self, hn: &Hashname) -> Option<&mut Link> {
        self.links.iter_mut().find(|l| l.peer() == hn)
    }

    pub fn linked(&self, prefix: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.peer().starts_with_str(prefix))
    }

    /// Creates the link table entry for `hn` if one doesn't already exist,
    /// fanning out to `link` hooks the first time. Refuses before the mesh
    /// has a hashname, per "before mesh_load has succeeded, no link may be
    /// created" — checked on `hashname` rather than `identity` since
    /// `add_discovered_link` transiently takes `identity` out around this
    /// call while still being loaded.
    pub fn get_or_create_link(&mut self, hn: Hashname) -> Option<&mut Link> {
        if self.hashname.is_none() {
            log::warn!("refusing to create a link before the mesh is loaded");
            return None;
        }
        if self.links.iter().any(|l| *l.peer() == hn) {
            return self.links.iter_mut().find(|l| *l.peer() == hn);
        }
        self.links.push(Link::new(hn));
        self.fan_link(&hn);
        self.links.iter_mut().find(|l| *l.peer() == hn)
    }

    pub fn unlink(&mut self, hn: &Hashname) {
        if let Some(link) = self.linkid_mut(hn) {
            link.unlink();
        }
    }

    /// Timeout housekeeping and lazy-removal sweep, per `mesh_process`.
    pub fn process(&mut self, now: u32) {
        for link in self.links.iter_mut() {
            link.process(now);
        }
        self.links.retain(|l| !l.is_marked_for_removal());
    }

    // -- hook registration -------------------------------------------------

    fn hook_slot(&mut self, id: &str) -> &mut Hook {
        if let Some(pos) = self.hooks.iter().position(|h| h.id == id) {
            return &mut self.hooks[pos];
        }
        self.hooks.push(Hook::new(id));
        self.hooks.last_mut().expect("just pushed")
    }

    pub fn on_free(&mut self, id: &str, cb: FreeHook) {
        self.hook_slot(id).free = Some(cb);
    }

    pub fn on_link(&mut self, id: &str, cb: LinkHook) {
        self.hook_slot(id).link = Some(cb);
    }

    pub fn on_path(&mut self, id: &str, cb: PathHook) {
        self.hook_slot(id).path = Some(cb);
    }

    pub fn on_open(&mut self, id: &str, cb: OpenHook) {
        self.hook_slot(id).open = Some(cb);
    }

    pub fn on_discover(&mut self, id: &str, cb: DiscoverHook) {
        self.hook_slot(id).discover = Some(cb);
    }

    // -- hook fan-outs -------------------------------------------------
    //
    // Each fan-out walks `self.hooks` by index and, for the one callback
    // kind it cares about, takes only that slot's `Option` out for the
    // duration of the call rather than emptying the whole vec the way a
    // single `std::mem::take(&mut self.hooks)` would. A hook callback
    // takes `&mut Mesh` and is free to trigger another fan-out itself
    // (`add_discovered_link`'s `discover` hook calling `get_or_create_link`,
    // which fans out `link`, is the case that matters) — with only one
    // slot borrowed out at a time, the nested fan-out still sees every
    // other hook's slots populated and restores its own afterward.

    fn fan_link(&mut self, peer: &Hashname) {
        let mut i = 0;
        while i < self.hooks.len() {
            if let Some(mut cb) = self.hooks[i].link.take() {
                cb(self, peer);
                if i < self.hooks.len() {
                    self.hooks[i].link = Some(cb);
                }
            }
            i += 1;
        }
    }

    /// Calls registered `path` hooks in order; stops at the first one that
    /// claims responsibility for attaching a pipe (returns `true`).
    pub fn fan_path(&mut self, peer: &Hashname, path: &serde_json::Value) -> bool {
        let mut i = 0;
        while i < self.hooks.len() {
            if let Some(mut cb) = self.hooks[i].path.take() {
                let attached = cb(self, peer, path);
                if i < self.hooks.len() {
                    self.hooks[i].path = Some(cb);
                }
                if attached {
                    return true;
                }
            }
            i += 1;
        }
        false
    }

    /// Threads an open-request packet through every registered `open` hook.
    /// Any hook may replace the packet or suppress it entirely (`None`).
    pub fn fan_open(&mut self, peer: &Hashname, packet: Packet) -> Option<Packet> {
        let mut current = Some(packet);
        let mut i = 0;
        while i < self.hooks.len() {
            if let Some(mut cb) = self.hooks[i].open.take() {
                current = match current {
                    Some(p) => cb(self, peer, p),
                    None => None,
                };
                if i < self.hooks.len() {
                    self.hooks[i].open = Some(cb);
                }
            }
            i += 1;
        }
        current
    }

    fn fan_discover(&mut self, packet: &Packet) {
        let mut i = 0;
        while i < self.hooks.len() {
            if let Some(mut cb) = self.hooks[i].discover.take() {
                cb(self, packet);
                if i < self.hooks.len() {
                    self.hooks[i].discover = Some(cb);
                }
            }
            i += 1;
        }
    }

    /// Fans out to every registered `free` hook exactly once, in
    /// registration order. Driven automatically by `Drop` rather than a
    /// separate consuming method, so teardown can't be forgotten by a
    /// caller the way the C `mesh_free()` call could be.
    fn fan_free(&mut self) {
        let mut i = 0;
        while i < self.hooks.len() {
            if let Some(mut cb) = self.hooks[i].free.take() {
                cb(self);
                if i < self.hooks.len() {
                    self.hooks[i].free = Some(cb);
                }
            }
            i += 1;
        }
    }

    // -- outbound handshake convenience -------------------------------------------------

    /// Build a handshake packet addressed to a newly learned peer key, to
    /// hand to a transport. Not itself part of the dispatcher's receive
    /// path, but the natural counterpart to it.
    pub fn handshake_for(&self, remote_public_key: &[u8; 33]) -> Option<Packet> {
        let identity = self.identity.as_ref()?;
        let remote = cipherset::parse_public_key(remote_public_key).ok()?;
        Some(identity.encrypt_handshake(&remote))
    }

    /// Convenience `discover` hook body: derives a link directly from a
    /// normalised handshake packet's `csid`/`keys` fields, the way
    /// `mesh_add` lets a caller opt into "link anyone who knocks".
    pub fn add_discovered_link(&mut self, packet: &Packet) -> Option<Hashname> {
        let csid_hex = packet.get_str("csid")?;
        let csid = u8::from_str_radix(&csid_hex, 16).ok()?;
        let keys = packet.get("keys")?;
        let key_b32 = keys.get(&csid_hex)?.as_str()?.to_string();
        let raw_key = b32_decode(&key_b32)?;
        let hn = Hashname::from_key(csid, &raw_key);

        if self.get_or_create_link(hn).is_none() {
            return None;
        }

        let identity = self.identity.take()?;
        let result = match self.linkid_mut(&hn) {
            Some(link) => link.load(&identity, csid, &raw_key),
            None => {
                self.identity = Some(identity);
                return None;
            }
        };
        self.identity = Some(identity);

        if let Err(e) = result {
            log::warn!("discovered link for {} failed to load: {}", hn, e);
            return None;
        }
        Some(hn)
    }

    // -- packet ingress -------------------------------------------------

    /// Demultiplex one inbound packet. Always consumes it; every error path
    /// logs and drops rather than propagating.
    pub fn receive(&mut self, now: u32, outer: Packet) -> Option<Hashname> {
        match outer.head_len() {
            5 => {
                self.receive_routed(outer);
                None
            }
            1 => self.receive_handshake_outer(now, outer),
            0 => {
                self.receive_channel(now, outer);
                None
            }
            _ => self.receive_link_descriptor(outer),
        }
    }

    fn receive_routed(&mut self, outer: Packet) {
        let short = outer.head().to_vec();
        let nested = match Packet::parse(outer.body()) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("routed packet body did not parse: {}", e);
                return;
            }
        };
        match self.links.iter_mut().find(|l| l.peer().matches_short(&short)) {
            Some(link) => link.send(nested),
            None => log::warn!("no link for routed short hashname"),
        }
    }

    fn receive_channel(&mut self, now: u32, outer: Packet) {
        if outer.body_len() < 16 {
            log::warn!("channel packet too short ({} bytes)", outer.body_len());
            return;
        }
        let token = &outer.body()[..8];
        let idx = self.links.iter().position(|l| l.token().map(|t| &t[..] == token).unwrap_or(false));
        let link = match idx {
            Some(i) => &mut self.links[i],
            None => {
                log::warn!("no link matches channel token");
                return;
            }
        };
        let exchange = match link.exchange_mut() {
            Some(e) => e,
            None => {
                log::warn!("matched link has no live exchange");
                return;
            }
        };
        match exchange.receive_channel_packet(&outer, now) {
            Ok(inner) => link.receive(inner),
            Err(e) => log::warn!("channel decrypt failed: {}", e),
        }
    }

    fn receive_handshake_outer(&mut self, now: u32, outer: Packet) -> Option<Hashname> {
        let inner = {
            let identity = match &self.identity {
                Some(i) => i,
                None => {
                    log::warn!("mesh not loaded, dropping handshake");
                    return None;
                }
            };
            match identity.decrypt_handshake(&outer) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("handshake decrypt failed: {}", e);
                    return None;
                }
            }
        };

        let prefix_len = outer.body().len().min(10);
        let id = b32_encode(&outer.body()[..prefix_len]);
        let mut inner = inner;
        inner.set("id", id);

        self.receive_handshake(now, inner)
    }

    /// Normalises a decrypted handshake and delivers it to an existing
    /// link, or fans it out through `discover` hooks for a new peer.
    fn receive_handshake(&mut self, now: u32, mut h: Packet) -> Option<Hashname> {
        if h.get_str("id").is_none() {
            log::warn!("handshake missing id, dropping");
            return None;
        }
        h.id = now as i64;
        if h.get_str("type").is_none() {
            h.set("type", "link");
        }
        if h.get_u64("at").is_none() {
            h.set("at", now as u64);
        }

        if h.get_str("type").as_deref() != Some("link") {
            log::warn!("unrecognised handshake type, dropping");
            return None;
        }

        let csid = match resolve_handshake_csid(&h) {
            Some(c) => c,
            None => {
                log::warn!("handshake missing cipher-set id, dropping");
                return None;
            }
        };

        let raw_key = h.body().to_vec();
        let from = Hashname::from_key(csid, &raw_key);

        h.set("csid", format!("{:02x}", csid));
        h.set("hashname", from.to_base32());
        let mut keys = serde_json::Map::new();
        keys.insert(format!("{:02x}", csid), serde_json::Value::String(b32_encode(&raw_key)));
        h.set("keys", serde_json::Value::Object(keys));
        h.set_body(raw_key);

        if let Some(link) = self.links.iter_mut().find(|l| *l.peer() == from) {
            if let Some(identity) = self.identity.as_ref() {
                if let Err(e) = link.receive_handshake(identity, csid, &h) {
                    log::warn!("handshake load failed for existing link {}: {}", from, e);
                }
            }
            return Some(from);
        }

        self.fan_discover(&h);
        self.links.iter().find(|l| *l.peer() == from).map(|_| from)
    }

    fn receive_link_descriptor(&mut self, outer: Packet) -> Option<Hashname> {
        if outer.kind() != Kind::Json {
            log::warn!("non-JSON short head (len {}), dropping", outer.head_len());
            return None;
        }
        let keys = outer.get("keys")?;
        let hn = hashname_from_keys_value(&keys)?;

        let mut synth = Packet::new();
        synth.set("type", "link");
        synth.set("at", 0u64);
        synth.set("hashname", hn.to_base32());
        self.fan_discover(&synth);

        self.links.iter().find(|l| *l.peer() == hn).map(|_| hn)
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Mesh::new()
    }
}

/// Terminal teardown: frees every registered hook (invoking its `free`
/// callback exactly once, in registration order) before the link table,
/// keys, identity, and hashname drop along with `self`.
impl Drop for Mesh {
    fn drop(&mut self) {
        self.fan_free();
    }
}

fn resolve_handshake_csid(h: &Packet) -> Option<u8> {
    if let Some(outer) = h.linked() {
        if let Kind::Handshake(csid) = outer.kind() {
            return Some(csid);
        }
    }
    h.get_str("csid").and_then(|s| u8::from_str_radix(&s, 16).ok())
}

fn hashname_from_keys_value(keys: &serde_json::Value) -> Option<Hashname> {
    let obj = keys.as_object()?;
    let mut map = BTreeMap::new();
    for (csid_hex, val) in obj {
        let csid = u8::from_str_radix(csid_hex, 16).ok()?;
        let raw = b32_decode(val.as_str()?)?;
        map.insert(csid, raw);
    }
    Hashname::from_keys(&map)
}

fn b32_encode(data: &[u8]) -> String {
    base32::encode(base32::Alphabet::RFC4648 { padding: false }, data)
}

fn b32_decode(s: &str) -> Option<Vec<u8>> {
    base32::decode(base32::Alphabet::RFC4648 { padding: false }, s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn mesh_add_hook() -> DiscoverHook {
        Box::new(|mesh: &mut Mesh, packet: &Packet| {
            mesh.add_discovered_link(packet);
        })
    }

    #[test]
    fn new_mesh_is_empty_until_loaded() {
        let mesh = Mesh::new();
        assert!(!mesh.is_loaded());
        assert!(mesh.hashname().is_none());
        assert!(mesh.to_json().is_none());
    }

    #[test]
    fn generate_loads_a_derivable_hashname() {
        let mut mesh = Mesh::new();
        mesh.generate().unwrap();
        assert!(mesh.is_loaded());
        let json = mesh.to_json().unwrap();
        assert_eq!(json["hashname"].as_str().unwrap().len(), 52);
    }

    #[test]
    fn echo_loopback_handshake_creates_mutual_links() {
        let mut a = Mesh::new();
        let mut b = Mesh::new();
        a.generate().unwrap();
        b.generate().unwrap();
        a.on_discover("mesh_add", mesh_add_hook());
        b.on_discover("mesh_add", mesh_add_hook());

        let a_pub = a.public_key_bytes().unwrap();
        let b_pub = b.public_key_bytes().unwrap();

        let handshake_to_b = a.handshake_for(&b_pub).unwrap();
        let handshake_to_a = b.handshake_for(&a_pub).unwrap();

        b.receive(1, handshake_to_b);
        a.receive(1, handshake_to_a);

        let a_hn = a.hashname().unwrap();
        let b_hn = b.hashname().unwrap();

        let a_link = a.linkid(&b_hn).expect("a should have linked to b");
        assert_eq!(a_link.csid(), cipherset::CSID);

        let b_link = b.linkid(&a_hn).expect("b should have linked to a");
        assert_eq!(b_link.csid(), cipherset::CSID);
    }

    #[test]
    fn routed_packet_is_forwarded_to_the_addressed_link() {
        let mut a = Mesh::new();
        a.generate().unwrap();
        let b_hn = Hashname::from_bytes([9u8; 32]);
        a.get_or_create_link(b_hn);

        let inner = Packet::channel(vec![7u8; 40]);
        let outer = Packet::routed(b_hn.short(), inner.to_bytes());
        a.receive(1, outer);

        let link = a.linkid_mut(&b_hn).unwrap();
        let forwarded = link.take_to_send().expect("routed packet should be queued for forwarding");
        assert_eq!(forwarded.body(), &[7u8; 40]);
    }

    #[test]
    fn channel_packet_is_decrypted_and_delivered_to_the_link() {
        let mut a = Mesh::new();
        let mut b = Mesh::new();
        a.generate().unwrap();
        b.generate().unwrap();
        a.on_discover("mesh_add", mesh_add_hook());
        b.on_discover("mesh_add", mesh_add_hook());

        let a_pub = a.public_key_bytes().unwrap();
        let b_pub = b.public_key_bytes().unwrap();
        b.receive(1, a.handshake_for(&b_pub).unwrap());
        a.receive(1, b.handshake_for(&a_pub).unwrap());

        let a_hn = a.hashname().unwrap();
        let b_hn = b.hashname().unwrap();

        let outer = {
            let link = b.linkid_mut(&a_hn).unwrap();
            let exchange = link.exchange_mut().unwrap();
            exchange.encrypt_channel_packet(&Packet::channel(b"ping".to_vec()))
        };

        a.receive(2, outer);

        let link = a.linkid_mut(&b_hn).unwrap();
        let delivered = link.take_received().expect("channel packet should have been delivered");
        assert_eq!(delivered.body(), b"ping");
    }

    #[test]
    fn unlink_is_lazy_until_the_next_process_tick() {
        let mut mesh = Mesh::new();
        mesh.generate().unwrap();
        let hn = Hashname::from_bytes([3u8; 32]);
        mesh.get_or_create_link(hn);
        assert!(mesh.linkid(&hn).is_some());

        mesh.unlink(&hn);
        assert!(mesh.linkid(&hn).is_some(), "link stays lookupable until process()");

        mesh.process(1);
        assert!(mesh.linkid(&hn).is_none(), "process() sweeps removed links");
    }

    #[test]
    fn get_or_create_link_refuses_before_the_mesh_is_loaded() {
        let mut mesh = Mesh::new();
        let hn = Hashname::from_bytes([4u8; 32]);
        assert!(mesh.get_or_create_link(hn).is_none());
        assert!(mesh.linkid(&hn).is_none());
    }

    #[test]
    fn free_fans_out_to_registered_free_hooks_exactly_once() {
        let fired = Rc::new(RefCell::new(0));
        {
            let mut mesh = Mesh::new();
            mesh.generate().unwrap();
            let fired = fired.clone();
            mesh.on_free(
                "counter",
                Box::new(move |_mesh: &mut Mesh| {
                    *fired.borrow_mut() += 1;
                }),
            );
        }
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn link_hook_fires_even_when_triggered_from_inside_a_discover_hook() {
        let mut a = Mesh::new();
        let mut b = Mesh::new();
        a.generate().unwrap();
        b.generate().unwrap();

        let linked_peers = Rc::new(RefCell::new(Vec::new()));
        let linked_peers_cb = linked_peers.clone();
        a.on_link(
            "observer",
            Box::new(move |_mesh: &mut Mesh, peer: &Hashname| {
                linked_peers_cb.borrow_mut().push(*peer);
            }),
        );
        // `mesh_add` is the `discover` hook whose callback creates the link
        // that should trigger the `link` hook above from inside the
        // discover fan-out, not after it.
        a.on_discover("mesh_add", mesh_add_hook());
        b.on_discover("mesh_add", mesh_add_hook());

        let a_pub = a.public_key_bytes().unwrap();
        let b_pub = b.public_key_bytes().unwrap();
        b.receive(1, a.handshake_for(&b_pub).unwrap());
        a.receive(1, b.handshake_for(&a_pub).unwrap());

        let b_hn = b.hashname().unwrap();
        assert!(a.linkid(&b_hn).is_some());
        assert_eq!(linked_peers.borrow().as_slice(), &[b_hn]);
    }
}
