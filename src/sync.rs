//! Instrumented lock types driving every validation hook the way an
//! embedding runtime would. The wrappers decide what a violation means
//! (per [`Config::panic_on_violation`](crate::Config)); the core only
//! reports and returns.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::class::{ClassId, Subclass};
use crate::error::Violation;
use crate::record::RecordId;
use crate::thread::ThreadId;
use crate::validator::Validator;

/// A mutex vetted for acquisition order and deadlocks.
pub struct TrackedMutex<T> {
    validator: Arc<Validator>,
    record: RecordId,
    inner: parking_lot::Mutex<T>,
}

impl<T> TrackedMutex<T> {
    /// The lock's class is the constructor's call site, one class per
    /// distinct source position.
    #[track_caller]
    pub fn new(validator: &Arc<Validator>, value: T) -> Self {
        let class = validator.class_here();
        TrackedMutex::with_class(validator, class, Subclass::None, value)
    }

    pub fn with_class(
        validator: &Arc<Validator>,
        class: ClassId,
        subclass: Subclass,
        value: T,
    ) -> Self {
        TrackedMutex {
            validator: Arc::clone(validator),
            record: validator.init_exclusive(class, subclass),
            inner: parking_lot::Mutex::new(value),
        }
    }

    #[track_caller]
    pub fn lock(&self) -> Result<TrackedMutexGuard<'_, T>, Violation> {
        let thread = self.validator.current_thread();
        vet(&self.validator, self.validator.check_order(thread, self.record, None))?;
        let inner = match self.inner.try_lock() {
            Some(inner) => inner,
            None => {
                vet(
                    &self.validator,
                    self.validator.check_blocking(thread, self.record, None),
                )?;
                self.inner.lock()
            }
        };
        vet(&self.validator, self.validator.set_owner(thread, self.record))?;
        Ok(TrackedMutexGuard { lock: self, thread, inner })
    }
}

impl<T> Drop for TrackedMutex<T> {
    fn drop(&mut self) {
        self.validator.delete_record(self.record);
    }
}

pub struct TrackedMutexGuard<'a, T> {
    lock: &'a TrackedMutex<T>,
    thread: ThreadId,
    inner: parking_lot::MutexGuard<'a, T>,
}

impl<T> Drop for TrackedMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Bookkeeping first: the record must be clear before the real
        // unlock lets a waiter claim ownership. Violations were already
        // reported through the sink; a drop cannot surface them.
        let v = &self.lock.validator;
        let _ = v.check_release_order(self.thread, self.lock.record);
        let _ = v.release_owner(self.thread, self.lock.record);
    }
}

impl<T> Deref for TrackedMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for TrackedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

/// A reader-writer lock with paired exclusive and shared facets, so the
/// detector can follow ownership through whichever side holds it.
pub struct TrackedRwLock<T> {
    validator: Arc<Validator>,
    excl: RecordId,
    shared: RecordId,
    inner: parking_lot::RwLock<T>,
}

impl<T> TrackedRwLock<T> {
    #[track_caller]
    pub fn new(validator: &Arc<Validator>, value: T) -> Self {
        let class = validator.class_here();
        TrackedRwLock::with_class(validator, class, Subclass::None, value)
    }

    pub fn with_class(
        validator: &Arc<Validator>,
        class: ClassId,
        subclass: Subclass,
        value: T,
    ) -> Self {
        let excl = validator.init_exclusive(class, subclass);
        let shared = validator.init_shared(class, subclass, false);
        validator.pair_records(excl, shared);
        TrackedRwLock {
            validator: Arc::clone(validator),
            excl,
            shared,
            inner: parking_lot::RwLock::new(value),
        }
    }

    #[track_caller]
    pub fn read(&self) -> Result<TrackedReadGuard<'_, T>, Violation> {
        let thread = self.validator.current_thread();
        vet(&self.validator, self.validator.check_order(thread, self.shared, None))?;
        let inner = match self.inner.try_read() {
            Some(inner) => inner,
            None => {
                vet(
                    &self.validator,
                    self.validator.check_blocking(thread, self.shared, None),
                )?;
                self.inner.read()
            }
        };
        vet(&self.validator, self.validator.set_owner(thread, self.shared))?;
        Ok(TrackedReadGuard { lock: self, thread, inner })
    }

    #[track_caller]
    pub fn write(&self) -> Result<TrackedWriteGuard<'_, T>, Violation> {
        let thread = self.validator.current_thread();
        vet(&self.validator, self.validator.check_order(thread, self.excl, None))?;
        let inner = match self.inner.try_write() {
            Some(inner) => inner,
            None => {
                vet(
                    &self.validator,
                    self.validator.check_blocking(thread, self.excl, None),
                )?;
                self.inner.write()
            }
        };
        vet(&self.validator, self.validator.set_owner(thread, self.excl))?;
        Ok(TrackedWriteGuard { lock: self, thread, inner })
    }
}

impl<T> Drop for TrackedRwLock<T> {
    fn drop(&mut self) {
        self.validator.delete_record(self.excl);
        self.validator.delete_record(self.shared);
    }
}

pub struct TrackedReadGuard<'a, T> {
    lock: &'a TrackedRwLock<T>,
    thread: ThreadId,
    inner: parking_lot::RwLockReadGuard<'a, T>,
}

impl<T> Drop for TrackedReadGuard<'_, T> {
    fn drop(&mut self) {
        let v = &self.lock.validator;
        let _ = v.check_release_order(self.thread, self.lock.shared);
        let _ = v.release_owner(self.thread, self.lock.shared);
    }
}

impl<T> Deref for TrackedReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

pub struct TrackedWriteGuard<'a, T> {
    lock: &'a TrackedRwLock<T>,
    thread: ThreadId,
    inner: parking_lot::RwLockWriteGuard<'a, T>,
}

impl<T> Drop for TrackedWriteGuard<'_, T> {
    fn drop(&mut self) {
        let v = &self.lock.validator;
        let _ = v.check_release_order(self.thread, self.lock.excl);
        let _ = v.release_owner(self.thread, self.lock.excl);
    }
}

impl<T> Deref for TrackedWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for TrackedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

fn vet(validator: &Validator, result: Result<(), Violation>) -> Result<(), Violation> {
    if let Err(violation) = &result {
        if validator.config().panic_on_violation {
            panic!("lock validation failed: {violation}");
        }
    }
    result
}
