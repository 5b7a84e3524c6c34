// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@oxidity.com>

use crate::network::rpc::RpcReceipt;

/// Confirmation bookkeeping for one job.
///
/// The chain head only moves forward here, so a lagging endpoint behind the
/// pool can never lower a confirmation count. Once confirmed, the recorded
/// receipt is frozen.
#[derive(Debug, Default)]
pub struct ConfirmationTracker {
    head: u64,
    confirmed: Option<RpcReceipt>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    /// Included; waiting for more blocks.
    Included { confirmations: u64 },
    /// Reached the required depth on this observation.
    Confirmed,
    /// Already confirmed earlier; nothing changes.
    AlreadyConfirmed,
}

impl ConfirmationTracker {
    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn observe_head(&mut self, head: u64) -> u64 {
        self.head = self.head.max(head);
        self.head
    }

    /// The inclusion block counts as the first confirmation.
    pub fn confirmations(&self, inclusion_block: u64) -> u64 {
        if self.head < inclusion_block {
            return 1;
        }
        self.head - inclusion_block + 1
    }

    pub fn record(&mut self, receipt: &RpcReceipt, required: u64) -> Progress {
        if self.confirmed.is_some() {
            return Progress::AlreadyConfirmed;
        }
        let confirmations = self.confirmations(receipt.block_number);
        if confirmations >= required {
            self.confirmed = Some(receipt.clone());
            Progress::Confirmed
        } else {
            Progress::Included { confirmations }
        }
    }

    pub fn confirmed(&self) -> Option<&RpcReceipt> {
        self.confirmed.as_ref()
    }
}
