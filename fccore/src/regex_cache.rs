//! Per-VM cache of compiled regex handles, keyed by CRC32-C of the pattern.
//!
//! The main VM owns its entries. A request VM starts with the entries the
//! main VM had at snapshot time, marked as loans; loans are re-seeded from
//! the parent on reset, and a reset drops everything the request VM compiled
//! itself. Handles given to the guest are slot indices.

use std::sync::Arc;

use fcvm::VmError;
use regex::Regex;

struct Slot {
    re: Option<Arc<Regex>>,
    hash: u32,
    loaned: bool,
}

pub struct RegexCache {
    slots: Vec<Slot>,
    cap: usize,
}

impl RegexCache {
    pub fn new(cap: usize) -> Self {
        RegexCache { slots: Vec::new(), cap }
    }

    pub fn find(&self, hash: u32) -> Option<usize> {
        self.slots.iter().position(|s| s.hash == hash && s.re.is_some())
    }

    pub fn get(&self, idx: u64) -> Result<&Arc<Regex>, VmError> {
        self.slots
            .get(idx as usize)
            .and_then(|s| s.re.as_ref())
            .ok_or_else(|| VmError::exception_data("invalid regex handle", idx))
    }

    /// Insert a compiled pattern, reusing a freed slot if the cache is full.
    pub fn manage(&mut self, re: Arc<Regex>, hash: u32) -> Result<usize, VmError> {
        if self.slots.len() < self.cap {
            self.slots.push(Slot { re: Some(re), hash, loaned: false });
            return Ok(self.slots.len() - 1);
        }
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.re.is_none() {
                *slot = Slot { re: Some(re), hash, loaned: false };
                return Ok(i);
            }
        }
        Err(VmError::exception("too many compiled regexes"))
    }

    pub fn free(&mut self, idx: u64) -> Result<(), VmError> {
        let slot = self
            .slots
            .get_mut(idx as usize)
            .ok_or_else(|| VmError::exception_data("invalid regex handle", idx))?;
        slot.re = None;
        slot.hash = 0;
        Ok(())
    }

    /// Replace the whole cache with loans of the parent's live entries.
    pub fn reset_and_loan(&mut self, parent: &RegexCache) {
        self.slots.clear();
        self.cap = parent.cap;
        for s in &parent.slots {
            self.slots.push(Slot { re: s.re.clone(), hash: s.hash, loaned: true });
        }
    }

    /// Drop entries this VM compiled itself, keeping loans.
    pub fn drop_owned(&mut self) {
        for s in &mut self.slots {
            if !s.loaned {
                s.re = None;
                s.hash = 0;
            }
        }
    }

    pub fn live_entries(&self) -> usize {
        self.slots.iter().filter(|s| s.re.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiled(p: &str) -> Arc<Regex> {
        Arc::new(Regex::new(p).unwrap())
    }

    #[test]
    fn manage_find_free() {
        let mut c = RegexCache::new(2);
        let h = 0xabcd;
        let idx = c.manage(compiled("^a+$"), h).unwrap();
        assert_eq!(c.find(h), Some(idx));
        assert!(c.get(idx as u64).unwrap().is_match("aaa"));
        c.free(idx as u64).unwrap();
        assert_eq!(c.find(h), None);
        // freed slot is reused once the cache is at capacity
        c.manage(compiled("b"), 1).unwrap();
        c.manage(compiled("c"), 2).unwrap();
        let err = c.manage(compiled("d"), 3);
        assert!(err.is_err());
    }

    #[test]
    fn loans_survive_drop_owned() {
        let mut parent = RegexCache::new(4);
        parent.manage(compiled("x"), 11).unwrap();
        let mut child = RegexCache::new(4);
        child.reset_and_loan(&parent);
        let own = child.manage(compiled("y"), 22).unwrap();
        assert_eq!(child.live_entries(), 2);
        child.drop_owned();
        assert_eq!(child.live_entries(), 1);
        assert_eq!(child.find(11), Some(0));
        assert!(child.get(own as u64).is_err());
    }
}
