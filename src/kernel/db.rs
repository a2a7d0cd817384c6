//! Handle database: process-scoped integer handles for kernel objects.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{N2dError, N2dResult};
use crate::kernel::memory::VidmemNode;
use crate::kernel::os::Signal;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// An object a process refers to by handle.
#[derive(Debug, Clone)]
pub enum DbObject {
    Vidmem(Arc<VidmemNode>),
    Signal(Arc<Signal>),
}

/// Hands out the lowest free handle. Handle 0 is never issued.
#[derive(Debug)]
struct HandleBitmap {
    words: Vec<u64>,
}

impl HandleBitmap {
    fn new() -> Self {
        Self { words: vec![1] }
    }

    fn allocate(&mut self) -> N2dResult<u32> {
        let index = match self.words.iter().position(|w| *w != u64::MAX) {
            Some(i) => i,
            None => {
                if self.words.len() * 64 >= u32::MAX as usize {
                    return Err(N2dError::OutOfResources);
                }
                self.words.push(0);
                self.words.len() - 1
            }
        };
        let bit = self.words[index].trailing_ones() as usize;
        self.words[index] |= 1 << bit;
        Ok((index * 64 + bit) as u32)
    }

    fn free(&mut self, handle: u32) {
        let (index, bit) = (handle as usize / 64, handle as usize % 64);
        if handle != 0 {
            if let Some(w) = self.words.get_mut(index) {
                *w &= !(1 << bit);
            }
        }
    }
}

#[derive(Debug, Default)]
struct ProcessRecord {
    opens: u32,
    objects: HashMap<u32, DbObject>,
}

#[derive(Debug)]
struct DbInner {
    handles: HandleBitmap,
    processes: HashMap<u32, ProcessRecord>,
}

#[derive(Debug)]
pub struct Database {
    inner: Mutex<DbInner>,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DbInner {
                handles: HandleBitmap::new(),
                processes: HashMap::new(),
            }),
        }
    }

    /// Registers one more open of `process`.
    pub fn open_process(&self, process: u32) {
        self.inner
            .lock()
            .processes
            .entry(process)
            .or_default()
            .opens += 1;
    }

    #[must_use]
    pub fn is_open(&self, process: u32) -> bool {
        self.inner.lock().processes.contains_key(&process)
    }

    /// Drops one open. The last one removes the process and returns the
    /// objects it never freed.
    ///
    /// # Errors
    /// `NoContext` for a process that is not open.
    pub fn close_process(&self, process: u32) -> N2dResult<Vec<(u32, DbObject)>> {
        let mut inner = self.inner.lock();
        let record = inner.processes.get_mut(&process).ok_or(N2dError::NoContext)?;
        record.opens -= 1;
        if record.opens > 0 {
            return Ok(Vec::new());
        }

        let record = inner.processes.remove(&process).unwrap_or_default();
        let mut leaked: Vec<(u32, DbObject)> = record.objects.into_iter().collect();
        leaked.sort_by_key(|(h, _)| *h);
        for (handle, _) in &leaked {
            inner.handles.free(*handle);
        }
        Ok(leaked)
    }

    /// # Errors
    /// `NoContext` for a process that is not open, `OutOfResources` when
    /// handles are exhausted.
    pub fn insert(&self, process: u32, object: DbObject) -> N2dResult<u32> {
        let mut inner = self.inner.lock();
        if !inner.processes.contains_key(&process) {
            return Err(N2dError::NoContext);
        }
        let handle = inner.handles.allocate()?;
        if let Some(record) = inner.processes.get_mut(&process) {
            record.objects.insert(handle, object);
        }
        Ok(handle)
    }

    /// # Errors
    /// `NoContext` for a process that is not open, `NotFound` for a handle
    /// the process does not own.
    pub fn get(&self, process: u32, handle: u32) -> N2dResult<DbObject> {
        let inner = self.inner.lock();
        let record = inner.processes.get(&process).ok_or(N2dError::NoContext)?;
        record.objects.get(&handle).cloned().ok_or(N2dError::NotFound)
    }

    /// # Errors
    /// As [`Database::get`], plus `InvalidArgument` for a non-vidmem handle.
    pub fn get_vidmem(&self, process: u32, handle: u32) -> N2dResult<Arc<VidmemNode>> {
        match self.get(process, handle)? {
            DbObject::Vidmem(node) => Ok(node),
            DbObject::Signal(_) => Err(N2dError::InvalidArgument),
        }
    }

    /// # Errors
    /// As [`Database::get`], plus `InvalidArgument` for a non-signal handle.
    pub fn get_signal(&self, process: u32, handle: u32) -> N2dResult<Arc<Signal>> {
        match self.get(process, handle)? {
            DbObject::Signal(signal) => Ok(signal),
            DbObject::Vidmem(_) => Err(N2dError::InvalidArgument),
        }
    }

    /// # Errors
    /// As [`Database::get`].
    pub fn remove(&self, process: u32, handle: u32) -> N2dResult<DbObject> {
        let mut inner = self.inner.lock();
        let record = inner.processes.get_mut(&process).ok_or(N2dError::NoContext)?;
        let object = record.objects.remove(&handle).ok_or(N2dError::NotFound)?;
        inner.handles.free(handle);
        Ok(object)
    }

    #[must_use]
    pub fn object_count(&self, process: u32) -> usize {
        self.inner
            .lock()
            .processes
            .get(&process)
            .map_or(0, |r| r.objects.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal() -> DbObject {
        DbObject::Signal(Arc::new(Signal::new(false)))
    }

    #[test]
    fn lowest_free_handle_is_reused() {
        let db = Database::new();
        db.open_process(1);
        let a = db.insert(1, signal()).unwrap();
        let b = db.insert(1, signal()).unwrap();
        let c = db.insert(1, signal()).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));

        db.remove(1, b).unwrap();
        assert_eq!(db.insert(1, signal()).unwrap(), 2);
    }

    #[test]
    fn bitmap_grows_past_one_word() {
        let db = Database::new();
        db.open_process(1);
        let handles: Vec<u32> = (0..130).map(|_| db.insert(1, signal()).unwrap()).collect();
        assert_eq!(handles.last(), Some(&130));
    }

    #[test]
    fn handles_are_process_scoped() {
        let db = Database::new();
        db.open_process(1);
        db.open_process(2);
        let h = db.insert(1, signal()).unwrap();
        assert!(matches!(db.get(2, h), Err(N2dError::NotFound)));
        assert!(matches!(db.get(3, h), Err(N2dError::NoContext)));
        assert!(matches!(db.get_vidmem(1, h), Err(N2dError::InvalidArgument)));
        assert!(db.get_signal(1, h).is_ok());
    }

    #[test]
    fn last_close_returns_leaks() {
        let db = Database::new();
        db.open_process(4);
        db.open_process(4);
        let h = db.insert(4, signal()).unwrap();

        assert!(db.close_process(4).unwrap().is_empty());
        let leaked = db.close_process(4).unwrap();
        assert_eq!(leaked.len(), 1);
        assert_eq!(leaked[0].0, h);
        assert!(!db.is_open(4));
        assert!(matches!(db.insert(4, signal()), Err(N2dError::NoContext)));
        assert!(matches!(db.close_process(4), Err(N2dError::NoContext)));
    }
}
