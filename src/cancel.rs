use tokio::sync::watch;

use crate::error::{QuiverError, Result};

/// Cooperative cancellation flag, checked between batches and iterations.
///
/// Cancellation is never consulted once a publish (manifest swap) has begun.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    rx: Option<watch::Receiver<bool>>,
}

impl Cancellation {
    /// A token that never fires.
    pub fn none() -> Self {
        Self { rx: None }
    }

    /// New token plus the sender that fires it (`send(true)`).
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx: Some(rx) })
    }

    pub fn from_receiver(rx: watch::Receiver<bool>) -> Self {
        Self { rx: Some(rx) }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// `Err(Cancelled)` once the flag is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(QuiverError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_fires() {
        let (tx, token) = Cancellation::channel();
        assert!(token.check().is_ok());
        tx.send(true).unwrap();
        assert!(matches!(token.check(), Err(QuiverError::Cancelled)));
        assert!(!Cancellation::none().is_cancelled());
    }
}
