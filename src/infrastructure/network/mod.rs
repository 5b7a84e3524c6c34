// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@oxidity.com>

pub mod gas;
pub mod nonce;
pub mod pool;
pub mod provider;
pub mod rpc;
pub mod signer;
