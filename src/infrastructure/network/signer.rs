// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use crate::domain::error::AppError;
use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, B256, Bytes, TxKind};
use alloy::rpc::types::eth::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use std::str::FromStr;

#[derive(Clone, Debug)]
pub struct SignedTransaction {
    pub raw: Bytes,
    pub hash: B256,
}

/// Turns a fully priced request into raw bytes for `eth_sendRawTransaction`.
pub trait TransactionSigner: Send + Sync {
    fn address(&self) -> Address;
    fn sign(&self, chain_id: u64, request: &TransactionRequest)
    -> Result<SignedTransaction, AppError>;
}

pub struct LocalSigner {
    signer: PrivateKeySigner,
}

impl LocalSigner {
    pub fn new(signer: PrivateKeySigner) -> Self {
        Self { signer }
    }

    pub fn from_hex(key: &str) -> Result<Self, AppError> {
        let signer = PrivateKeySigner::from_str(key.trim())
            .map_err(|e| AppError::Config(format!("Invalid wallet key: {e}")))?;
        Ok(Self::new(signer))
    }
}

fn missing(field: &str) -> AppError {
    AppError::Validation {
        field: field.to_string(),
        message: "required before signing".into(),
    }
}

impl TransactionSigner for LocalSigner {
    fn address(&self) -> Address {
        self.signer.address()
    }

    fn sign(
        &self,
        chain_id: u64,
        request: &TransactionRequest,
    ) -> Result<SignedTransaction, AppError> {
        let to = request.to.unwrap_or(TxKind::Create);
        let nonce = request.nonce.ok_or_else(|| missing("nonce"))?;
        let gas_limit = request.gas.ok_or_else(|| missing("gas"))?;
        let value = request.value.unwrap_or_default();
        let input = request.input.clone().into_input().unwrap_or_default();

        let envelope: TxEnvelope = match (request.max_fee_per_gas, request.gas_price) {
            (Some(max_fee_per_gas), _) => {
                let mut tx = TxEip1559 {
                    chain_id,
                    nonce,
                    gas_limit,
                    max_fee_per_gas,
                    max_priority_fee_per_gas: request
                        .max_priority_fee_per_gas
                        .unwrap_or(max_fee_per_gas),
                    to,
                    value,
                    access_list: Default::default(),
                    input,
                };
                let sig = TxSignerSync::sign_transaction_sync(&self.signer, &mut tx)
                    .map_err(|e| AppError::Signing(format!("Sign tx failed: {e}")))?;
                tx.into_signed(sig).into()
            }
            (None, Some(gas_price)) => {
                let mut tx = TxLegacy {
                    chain_id: Some(chain_id),
                    nonce,
                    gas_price,
                    gas_limit,
                    to,
                    value,
                    input,
                };
                let sig = TxSignerSync::sign_transaction_sync(&self.signer, &mut tx)
                    .map_err(|e| AppError::Signing(format!("Sign tx failed: {e}")))?;
                tx.into_signed(sig).into()
            }
            (None, None) => return Err(missing("gas_price")),
        };

        Ok(SignedTransaction {
            raw: envelope.encoded_2718().into(),
            hash: *envelope.tx_hash(),
        })
    }
}
