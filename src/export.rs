//! The export registry (component C) and the `Export` data type (§3).
//!
//! Grounded on the teacher's `Export { name, file }` struct, generalized to
//! hold a `dyn Backend`, a byte offset/size pair, and the client list
//! needed for reference counting and cooperative shutdown (§4.F).
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::Backend;
use crate::client::ClientState;
use crate::proto::{TransmitFlags, SECTOR_SIZE};

/// A named, addressable block volume offered to clients.
///
/// `Arc<Export>`'s strong count *is* the reference count described in §3 —
/// the registry's name binding holds one clone, and each attached client
/// holds another (see `ClientState::export`).
pub struct Export {
    name: Mutex<Option<String>>,
    backend: Box<dyn Backend>,
    dev_offset: u64,
    size: u64,
    extra_flags: TransmitFlags,
    clients: Mutex<Vec<Arc<ClientState>>>,
    /// Bumped whenever the backend's owning I/O context changes; see
    /// `migrate_context` and SPEC_FULL.md §3/§4.F for why this is a no-op
    /// counter rather than a live multi-runtime handoff in this
    /// implementation.
    context_generation: AtomicU64,
}

impl Export {
    /// Construct a new export. `size_bytes` is rounded down to a multiple
    /// of `SECTOR_SIZE` per the §3 invariant.
    pub fn new(name: impl Into<String>, backend: Box<dyn Backend>, dev_offset: u64, size_bytes: u64) -> Arc<Self> {
        let size = (size_bytes / SECTOR_SIZE) * SECTOR_SIZE;
        let extra_flags = if backend.read_only() {
            TransmitFlags::READ_ONLY
        } else {
            TransmitFlags::empty()
        };
        Arc::new(Self {
            name: Mutex::new(Some(name.into())),
            backend,
            dev_offset,
            size,
            extra_flags,
            clients: Mutex::new(Vec::new()),
            context_generation: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: Option<String>) {
        *self.name.lock().unwrap() = name;
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn dev_offset(&self) -> u64 {
        self.dev_offset
    }

    /// Effective size in bytes (already a multiple of `SECTOR_SIZE`).
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn read_only(&self) -> bool {
        self.extra_flags.contains(TransmitFlags::READ_ONLY)
    }

    /// Full set of transmission flags advertised during negotiation:
    /// `HAS_FLAGS | SEND_FLUSH | SEND_FUA | SEND_TRIM` plus whatever the
    /// export itself contributes (currently just `READ_ONLY`), per §4.D.
    pub fn transmit_flags(&self) -> TransmitFlags {
        TransmitFlags::HAS_FLAGS
            | TransmitFlags::SEND_FLUSH
            | TransmitFlags::SEND_FUA
            | TransmitFlags::SEND_TRIM
            | self.extra_flags
    }

    pub(crate) fn attach_client(self: &Arc<Self>, client: Arc<ClientState>) {
        self.clients.lock().unwrap().push(client);
    }

    pub(crate) fn detach_client(&self, client: &Arc<ClientState>) {
        let mut clients = self.clients.lock().unwrap();
        if let Some(idx) = clients.iter().position(|c| Arc::ptr_eq(c, client)) {
            clients.swap_remove(idx);
        }
    }

    /// Number of clients currently attached to this export.
    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Tear down every attached client (used by a management "close this
    /// export" action, §4.C). Clients release their own export reference
    /// as part of `close_client`'s teardown.
    pub fn close_all_clients(&self) {
        let clients = self.clients.lock().unwrap().clone();
        for client in clients {
            client.close();
        }
    }

    /// Record a backend-context switch. In this single-runtime
    /// implementation there is nothing to re-register (§4.F), so this is
    /// only a counter bump kept for interface completeness and testing.
    pub fn migrate_context(&self) -> u64 {
        self.context_generation.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Process-wide, insertion-ordered collection of exports, keyed by name.
///
/// A plain `std::sync::Mutex`-guarded `Vec` is used rather than a
/// concurrent map: registry mutation only happens on management paths and
/// during `EXPORT_NAME`/`LIST` handling (§5 "Shared resources"), and the
/// critical sections here never hold the lock across an `.await`.
#[derive(Default)]
pub struct Registry {
    exports: Mutex<Vec<Arc<Export>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { exports: Mutex::new(Vec::new()) })
    }

    /// Bind `export` under its current name. Panics if the name is already
    /// taken or the export has no name bound — both are programmer errors
    /// at startup, not client-triggerable conditions.
    pub fn bind(&self, export: Arc<Export>) {
        let name = export.name().expect("export must have a name to be registered");
        let mut exports = self.exports.lock().unwrap();
        assert!(
            !exports.iter().any(|e| e.name().as_deref() == Some(name.as_str())),
            "duplicate export name {name:?}"
        );
        exports.push(export);
    }

    /// Look up an export by name.
    pub fn find(&self, name: &str) -> Option<Arc<Export>> {
        self.exports
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.name().as_deref() == Some(name))
            .cloned()
    }

    /// Enumerate bound export names in insertion order, for `LIST`.
    pub fn list_names(&self) -> Vec<String> {
        self.exports
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.name())
            .collect()
    }

    /// Unbind and drop `export` from the registry (§4.C `close`).
    pub fn close(&self, export: &Arc<Export>) {
        export.close_all_clients();
        export.set_name(None);
        let mut exports = self.exports.lock().unwrap();
        if let Some(idx) = exports.iter().position(|e| Arc::ptr_eq(e, export)) {
            exports.swap_remove(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;

    fn export(name: &str, size: u64) -> Arc<Export> {
        Export::new(name, Box::new(MemBackend::new(size)), 0, size)
    }

    #[test]
    fn list_enumerates_in_insertion_order() {
        let reg = Registry::new();
        reg.bind(export("a", 4096));
        reg.bind(export("b", 4096));
        assert_eq!(reg.list_names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn newly_bound_export_is_visible_on_list() {
        let reg = Registry::new();
        reg.bind(export("a", 4096));
        assert_eq!(reg.list_names(), vec!["a".to_string()]);
        reg.bind(export("b", 4096));
        assert_eq!(reg.list_names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn find_locates_bound_export() {
        let reg = Registry::new();
        reg.bind(export("disk0", 8192));
        let found = reg.find("disk0").expect("export should be found");
        assert_eq!(found.size(), 8192);
        assert!(reg.find("missing").is_none());
    }

    #[test]
    fn size_rounds_down_to_sector_size() {
        let exp = export("odd", 513);
        assert_eq!(exp.size(), 512);
    }

    #[test]
    fn close_unbinds_name_and_removes_from_registry() {
        let reg = Registry::new();
        let exp = export("disk0", 4096);
        reg.bind(Arc::clone(&exp));
        reg.close(&exp);
        assert!(reg.find("disk0").is_none());
        assert_eq!(exp.name(), None);
    }
}
