use std::num::NonZero;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) const SLOT_BUF_SIZE: usize = 512 * 1024;

#[derive(Debug)]
struct Slot {
    id: usize,
    buf: Vec<u8>,
}

/// Fixed-capacity pool of pre-allocated copy buffers. Allocation blocks until
/// a slot is free or the cancellation token fires; the returned guard gives
/// the slot back on drop, so release happens exactly once per allocation.
/// Slot ids are stable across the pool lifetime so concurrent work can be
/// tagged by slot identity.
#[derive(Debug)]
pub(crate) struct BufSlots {
    tx: mpsc::Sender<Slot>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Slot>>,
    free: Arc<AtomicUsize>,
    capacity: usize,
}

impl BufSlots {
    #[must_use]
    pub(crate) fn new(capacity: NonZero<usize>) -> Self {
        let capacity = capacity.get();
        let (tx, rx) = mpsc::channel(capacity);
        for id in 0..capacity {
            tx.try_send(Slot {
                id,
                buf: vec![0u8; SLOT_BUF_SIZE],
            })
            .expect("channel has room for every initial slot");
        }
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            free: Arc::new(AtomicUsize::new(capacity)),
            capacity,
        }
    }

    /// Waits for a free slot. Returns `None` when `cancel` fires first;
    /// a cancelled wait does not consume a slot.
    pub(crate) async fn alloc(&self, cancel: &CancellationToken) -> Option<SlotGuard> {
        let slot = tokio::select! {
            slot = async {
                let mut rx = self.rx.lock().await;
                rx.recv().await
            } => slot?,
            () = cancel.cancelled() => return None,
        };
        self.free.fetch_sub(1, Ordering::Relaxed);
        Some(SlotGuard {
            id: slot.id,
            buf: slot.buf,
            tx: self.tx.clone(),
            free: Arc::clone(&self.free),
        })
    }

    /// Number of currently free slots.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.free.load(Ordering::Relaxed)
    }

    #[must_use]
    pub(crate) fn cap(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug)]
pub(crate) struct SlotGuard {
    id: usize,
    buf: Vec<u8>,
    tx: mpsc::Sender<Slot>,
    free: Arc<AtomicUsize>,
}

impl SlotGuard {
    #[must_use]
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub(crate) fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let slot = Slot {
            id: self.id,
            buf: std::mem::take(&mut self.buf),
        };
        /* The channel capacity equals the slot count, so the send only fails
         * when the pool itself is gone. */
        if self.tx.try_send(slot).is_ok() {
            self.free.fetch_add(1, Ordering::Relaxed);
        }
    }
}
