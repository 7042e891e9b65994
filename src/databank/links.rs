use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::Databank;

/// Process-wide registry mapping databank names and aliases to loaded
/// handles, so link queries can hop between databanks.
#[derive(Default)]
pub struct LinkTable {
    inner: Mutex<HashMap<String, Vec<Weak<Databank>>>>,
}

impl LinkTable {
    pub fn new() -> Arc<LinkTable> {
        Arc::new(LinkTable::default())
    }

    /// Register a databank under its name and any aliases.
    pub fn register(self: &Arc<Self>, db: &Arc<Databank>, aliases: &[&str]) {
        let mut inner = self.inner.lock();
        let mut names: Vec<String> = vec![db.name().to_string()];
        names.extend(aliases.iter().map(|a| a.to_string()));
        for name in names {
            inner.entry(name).or_default().push(Arc::downgrade(db));
        }
        db.attach_link_table(self.clone());
    }

    /// Live handles registered under `name`.
    pub fn resolve(&self, name: &str) -> Vec<Arc<Databank>> {
        let mut inner = self.inner.lock();
        match inner.get_mut(name) {
            Some(entries) => {
                entries.retain(|w| w.strong_count() > 0);
                entries.iter().filter_map(|w| w.upgrade()).collect()
            }
            None => Vec::new(),
        }
    }
}
