//! The set of known transfers, in insertion order.

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{DownloadError, Result};
use crate::state::{Transfer, TransferStatus};

#[derive(Debug, Default)]
pub struct Registry {
    transfers: RwLock<Vec<Arc<Transfer>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer. A terminal record at the same destination is
    /// replaced; a live one is a conflict.
    pub fn add(&self, transfer: Arc<Transfer>) -> Result<()> {
        let mut transfers = self.transfers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = transfers.iter().position(|t| t.id() == transfer.id()) {
            if !transfers[pos].status().is_terminal() {
                return Err(DownloadError::DuplicateTransfer {
                    id: transfer.id().to_path_buf(),
                });
            }
            transfers.remove(pos);
        }
        transfers.push(transfer);
        Ok(())
    }

    pub fn remove(&self, id: &Path) -> Option<Arc<Transfer>> {
        let mut transfers = self.transfers.write().unwrap_or_else(PoisonError::into_inner);
        let pos = transfers.iter().position(|t| t.id() == id)?;
        Some(transfers.remove(pos))
    }

    pub fn get(&self, id: &Path) -> Option<Arc<Transfer>> {
        self.transfers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|t| t.id() == id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<Transfer>> {
        self.transfers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn list_by_status(&self, status: TransferStatus) -> Vec<Arc<Transfer>> {
        self.transfers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| t.status() == status)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transfers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
