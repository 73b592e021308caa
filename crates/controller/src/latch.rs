//! Single-count gate

use parking_lot::{Condvar, Mutex};

/// Parks threads until released once; stays released afterwards
pub(crate) struct Latch {
    released: Mutex<bool>,
    condvar: Condvar,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self {
            released: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn release(&self) {
        let mut released = self.released.lock();
        if !*released {
            *released = true;
            self.condvar.notify_all();
        }
    }

    pub(crate) fn wait(&self) {
        let mut released = self.released.lock();
        while !*released {
            self.condvar.wait(&mut released);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_released(&self) -> bool {
        *self.released.lock()
    }
}
