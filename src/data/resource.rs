use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Fixed pool of reusable transfer staging buffers.
///
/// Transfers borrow a buffer for the duration of one part upload or range
/// download and return it on drop; `acquire` blocks until one is free.
/// These buffers stage bytes between the network and the cache, they are
/// never the memory behind pages.
pub struct ResourceManager {
    buffer_size: usize,
    pool: Mutex<Vec<Box<[u8]>>>,
    available: Condvar,
}

impl ResourceManager {
    pub fn new(count: usize, buffer_size: usize) -> Arc<Self> {
        let count = count.max(1);
        let pool = (0..count)
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect();
        Arc::new(Self {
            buffer_size,
            pool: Mutex::new(pool),
            available: Condvar::new(),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a buffer, blocking until one is returned if the pool is dry.
    pub fn acquire(self: &Arc<Self>) -> BufferLease {
        let mut pool = self.pool.lock();
        while pool.is_empty() {
            self.available.wait(&mut pool);
        }
        let buf = pool.pop().expect("woken with empty pool");
        BufferLease {
            manager: self.clone(),
            buf: Some(buf),
        }
    }

    fn give_back(&self, buf: Box<[u8]>) {
        self.pool.lock().push(buf);
        self.available.notify_one();
    }
}

/// RAII hold on one pooled buffer; returns it to the pool on drop.
pub struct BufferLease {
    manager: Arc<ResourceManager>,
    buf: Option<Box<[u8]>>,
}

impl BufferLease {
    pub fn bytes(&self) -> &[u8] {
        self.buf.as_deref().expect("lease already returned")
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("lease already returned")
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.manager.give_back(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn lease_returns_buffer_on_drop() {
        let pool = ResourceManager::new(1, 64);
        {
            let mut lease = pool.acquire();
            lease.bytes_mut()[0] = 0xab;
            assert_eq!(lease.bytes().len(), 64);
        }
        // pool refilled, second acquire does not block
        let lease = pool.acquire();
        assert_eq!(lease.bytes().len(), 64);
    }

    #[test]
    fn acquire_blocks_until_a_buffer_is_released() {
        let pool = ResourceManager::new(1, 16);
        let first = pool.acquire();

        let woke = Arc::new(AtomicBool::new(false));
        let waiter = {
            let pool = pool.clone();
            let woke = woke.clone();
            std::thread::spawn(move || {
                let _lease = pool.acquire();
                woke.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!woke.load(Ordering::SeqCst), "acquire returned early");
        drop(first);
        waiter.join().unwrap();
        assert!(woke.load(Ordering::SeqCst));
    }
}
