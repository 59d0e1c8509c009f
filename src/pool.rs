//! # Pool de Objetos
//! src/pool.rs
//!
//! Free-list tipada para los objetos de vida corta del pipeline
//! (transacciones, requests y responses).
//!
//! Ciclo de vida: `create -> init(params) -> uso -> reset -> vuelta al pool`.
//!
//! Garantías:
//! - Todo objeto entregado por [`ObjectPool::acquire`] está reseteado.
//! - Un objeto devuelto no puede volver a entregarse mientras alguien lo
//!   tenga (el checkout es por valor, así que el compilador lo impone).

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Objeto reutilizable por un [`ObjectPool`]
pub trait Poolable: Send + 'static {
    /// Crea una instancia vacía
    fn create() -> Self;

    /// Libera todo el estado del uso anterior
    fn reset(&mut self);
}

/// Pool thread-safe con un máximo de objetos ociosos
pub struct ObjectPool<T: Poolable> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
    created: AtomicUsize,
}

impl<T: Poolable> ObjectPool<T> {
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle.min(64))),
            max_idle,
            created: AtomicUsize::new(0),
        }
    }

    /// Saca un objeto del pool (o crea uno nuevo si está vacío)
    pub fn acquire(&self) -> T {
        let reused = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
        reused.unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            T::create()
        })
    }

    /// Resetea el objeto y lo devuelve al pool
    ///
    /// Si el pool ya tiene `max_idle` objetos, el objeto se descarta.
    pub fn release(&self, mut object: T) {
        object.reset();
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.max_idle {
            idle.push(object);
        }
    }

    /// Checkout con devolución automática al salir de scope
    pub fn checkout(self: &Arc<Self>) -> Pooled<T> {
        Pooled {
            object: Some(self.acquire()),
            pool: Arc::clone(self),
        }
    }

    /// Objetos ociosos disponibles
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Total de objetos creados desde el inicio
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Descarta todos los objetos ociosos
    pub fn clear(&self) {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Objeto prestado que vuelve al pool en `Drop`, incluso durante un panic
pub struct Pooled<T: Poolable> {
    object: Option<T>,
    pool: Arc<ObjectPool<T>>,
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.object.as_ref().expect("pooled object already released")
    }
}

impl<T: Poolable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut().expect("pooled object already released")
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            self.pool.release(object);
        }
    }
}
