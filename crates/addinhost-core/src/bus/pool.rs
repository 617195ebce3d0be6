//! Object pool for RPC request envelopes

use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Correlation wrapper published for every bus request
#[derive(Debug, Clone, PartialEq)]
pub struct RpcEnvelope<T> {
    pub request_id: Option<Uuid>,
    pub data: Option<T>,
}

impl<T> Default for RpcEnvelope<T> {
    fn default() -> Self {
        Self {
            request_id: None,
            data: None,
        }
    }
}

impl<T> RpcEnvelope<T> {
    pub fn new(request_id: Uuid, data: T) -> Self {
        Self {
            request_id: Some(request_id),
            data: Some(data),
        }
    }

    pub fn reset(&mut self) {
        self.request_id = None;
        self.data = None;
    }

    pub fn is_empty(&self) -> bool {
        self.request_id.is_none() && self.data.is_none()
    }
}

/// Pool of envelopes, bucketed by payload type.
///
/// Envelopes are reset when rented and cleared when given back, so a rented
/// envelope never carries data from a previous request.
#[derive(Debug)]
pub struct RpcEnvelopePool {
    capacity: usize,
    slots: Mutex<HashMap<TypeId, Vec<Box<dyn Any + Send>>>>,
    rented: AtomicU64,
    reused: AtomicU64,
}

impl Default for RpcEnvelopePool {
    fn default() -> Self {
        Self::new(64)
    }
}

impl RpcEnvelopePool {
    /// Create a pool keeping at most `capacity` idle envelopes per payload type
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Mutex::new(HashMap::new()),
            rented: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rent a cleared envelope
    pub fn rent<T: Send + 'static>(&self) -> RpcEnvelope<T> {
        self.rented.fetch_add(1, Ordering::Relaxed);

        let pooled = self
            .slots
            .lock()
            .get_mut(&TypeId::of::<RpcEnvelope<T>>())
            .and_then(|bucket| bucket.pop());

        match pooled.and_then(|boxed| boxed.downcast::<RpcEnvelope<T>>().ok()) {
            Some(mut envelope) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                envelope.reset();
                *envelope
            }
            None => RpcEnvelope::default(),
        }
    }

    /// Rent an envelope with both fields overwritten
    pub fn rent_with<T: Send + 'static>(&self, request_id: Uuid, data: T) -> RpcEnvelope<T> {
        let mut envelope = self.rent::<T>();
        envelope.request_id = Some(request_id);
        envelope.data = Some(data);
        envelope
    }

    /// Return an envelope; returns false when the bucket is full and it was dropped
    pub fn give_back<T: Send + 'static>(&self, mut envelope: RpcEnvelope<T>) -> bool {
        envelope.reset();

        let mut slots = self.slots.lock();
        let bucket = slots.entry(TypeId::of::<RpcEnvelope<T>>()).or_default();
        if bucket.len() >= self.capacity {
            return false;
        }
        bucket.push(Box::new(envelope));
        true
    }

    /// Idle envelopes currently pooled for payload type `T`
    pub fn idle<T: Send + 'static>(&self) -> usize {
        self.slots
            .lock()
            .get(&TypeId::of::<RpcEnvelope<T>>())
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// (total rents, rents served from the pool)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.rented.load(Ordering::Relaxed),
            self.reused.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rent_after_return_is_reset() {
        let pool = RpcEnvelopePool::new(4);
        let id = Uuid::new_v4();

        let envelope = pool.rent_with(id, "payload".to_string());
        assert_eq!(envelope.request_id, Some(id));
        assert!(pool.give_back(envelope));
        assert_eq!(pool.idle::<String>(), 1);

        let reused = pool.rent::<String>();
        assert_eq!(reused.request_id, None);
        assert_eq!(reused.data, None);
        assert_eq!(pool.idle::<String>(), 0);
        assert_eq!(pool.stats(), (2, 1));
    }

    #[test]
    fn test_buckets_are_per_payload_type() {
        let pool = RpcEnvelopePool::new(4);
        pool.give_back(pool.rent_with(Uuid::new_v4(), 5u32));

        assert_eq!(pool.idle::<u32>(), 1);
        assert_eq!(pool.idle::<String>(), 0);

        let other = pool.rent::<String>();
        assert!(other.is_empty());
        assert_eq!(pool.idle::<u32>(), 1);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let pool = RpcEnvelopePool::new(1);
        assert!(pool.give_back(RpcEnvelope::new(Uuid::new_v4(), 1u8)));
        assert!(!pool.give_back(RpcEnvelope::new(Uuid::new_v4(), 2u8)));
        assert_eq!(pool.idle::<u8>(), 1);
    }
}
