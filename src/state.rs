//! One-level undo storage used by parameters, trees and model caches.

/// The committed/pending state of a single undoable value.
///
/// `store` moves the slot from `Committed` to `Pending(shadow)`; `accept`
/// drops the shadow and `restore` hands it back. Only one store may be
/// outstanding at any time.
#[derive(Debug, Clone, PartialEq)]
pub enum Stored<T> {
    Committed,
    Pending(T),
}

impl<T> Default for Stored<T> {
    fn default() -> Self {
        Stored::Committed
    }
}

impl<T> Stored<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Stored::Pending(_))
    }

    /// Keep `shadow` until the next accept or restore.
    ///
    /// Panics if a store is already outstanding, nested stores are a bug in
    /// the caller and would silently lose the earlier restore point.
    pub fn store(&mut self, shadow: T) {
        assert!(
            !self.is_pending(),
            "store called while a previous store is still pending"
        );
        *self = Stored::Pending(shadow);
    }

    /// Return the shadow copy, leaving the slot committed.
    pub fn take(&mut self) -> Option<T> {
        match std::mem::replace(self, Stored::Committed) {
            Stored::Committed => None,
            Stored::Pending(shadow) => Some(shadow),
        }
    }

    pub fn accept(&mut self) {
        *self = Stored::Committed;
    }

    pub fn shadow(&self) -> Option<&T> {
        match self {
            Stored::Committed => None,
            Stored::Pending(shadow) => Some(shadow),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Stored;

    #[test]
    fn store_take_round() {
        let mut slot = Stored::default();
        assert!(!slot.is_pending());
        slot.store(vec![1., 2.]);
        assert!(slot.is_pending());
        assert_eq!(slot.shadow(), Some(&vec![1., 2.]));
        assert_eq!(slot.take(), Some(vec![1., 2.]));
        assert!(!slot.is_pending());
        assert_eq!(slot.take(), None);
    }

    #[test]
    #[should_panic]
    fn nested_store_panics() {
        let mut slot = Stored::default();
        slot.store(1);
        slot.store(2);
    }
}
